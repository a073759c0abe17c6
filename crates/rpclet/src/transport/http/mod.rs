//! HTTP transport via axum.

pub mod routes;
pub mod server;

pub use routes::routes;
pub use server::{ServerConfig, bind, serve, serve_on};
