//! PostgreSQL persistence.

mod pool;
mod records;
mod sync;

pub use pool::*;
pub use records::*;
pub use sync::*;
