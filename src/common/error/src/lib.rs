//! Error types and result aliases for Rivulet.
//!
//! Every error is cheap to clone so that one failure can be forwarded
//! downstream and recorded in several completion futures at once.

mod error;

pub use error::{GenericError, RivuletError, RivuletResult};
