//! Code generation support for a dynamic binary translator.
//!
//! A front end translates guest basic blocks into a linear stream of
//! three-address operations over virtual registers ("temps"). Before register
//! allocation the stream is run through the optimiser in [opt], which
//! propagates constants and copies through the stream and folds whatever can
//! be computed at translation time. The shared stream model (opcodes, their
//! metadata, the temp classification table) lives in [ir].
//!
//! The optimiser rewrites the caller's buffers in place: it never reorders
//! operations and never grows the stream, so the output is always at most as
//! long as the input.

pub mod ir;
pub mod opt;
pub(crate) mod wordint;

use thiserror::Error;

/// A failure while rewriting an operation stream.
///
/// The optimiser has a narrow failure surface: everything that can go wrong is
/// a malformed input stream, which indicates a bug in the front end that
/// produced it. The error message always identifies the offending operation
/// index so the front end can be debugged from the diagnostic alone.
#[derive(Debug, Error)]
pub enum CodegenError {
    /// The input stream violated a structural requirement (e.g. an argument
    /// buffer shorter than the opcodes demand, or a width-less operation in a
    /// position that requires rewriting to a constant load).
    #[error("internal error: {0}")]
    Internal(String),
}

pub use opt::optimise;
