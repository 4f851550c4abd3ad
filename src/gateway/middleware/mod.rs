// Middleware module

pub mod auth;

pub use auth::{admin_auth_middleware, data_auth_middleware};

use tower_http::cors::{Any, CorsLayer};

pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}
