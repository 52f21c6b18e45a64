//! Request handlers for sync operations.

mod signatures;
mod sync;

pub use signatures::*;
pub use sync::*;
