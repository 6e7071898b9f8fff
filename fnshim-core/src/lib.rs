//! Core types for fnshim
//!
//! This crate provides the types shared by the runtime and by handler code:
//! the payload a handler returns, the failure it raises, and the startup
//! errors that stop the shim before the invocation loop begins.

pub mod error;
pub mod failure;
pub mod payload;
pub mod trace;

pub use error::ShimError;
pub use failure::{ErrorResponse, Frame, HandlerError};
pub use payload::Payload;
