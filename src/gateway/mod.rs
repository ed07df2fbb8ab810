//! HTTP surface: health, admin and auth-protected routes

pub mod auth;
mod router;
mod server;

pub use auth::auth_middleware;
pub use router::{AppState, create_router};
pub use server::Server;
