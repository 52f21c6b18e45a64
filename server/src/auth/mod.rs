//! Bearer-token authentication.

mod middleware;
mod token;

pub use middleware::AuthUser;
pub use token::{issue_token, verify_token, Claims};
