pub mod auth;
pub mod rate_limit;

pub use auth::{internal_auth_middleware, user_auth_middleware, UserClaims};
pub use rate_limit::rate_limit_middleware;
