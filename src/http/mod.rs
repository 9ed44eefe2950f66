//! HTTP surface: router, auth and error mapping

pub mod auth;
pub mod middleware;
pub mod routes;

pub use auth::{AuthProvider, JwksAuth, SharedSecretAuth};
pub use middleware::{AuthError, AuthenticatedUser, JwtClaims};
pub use routes::{build_router, AppError};
