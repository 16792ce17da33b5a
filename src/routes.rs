use axum::{
    routing::{get, post},
    Router,
};

use crate::{billing, generation};

pub async fn root() -> &'static str {
    "Image Generation API"
}

pub fn api_routes() -> Router {
    Router::new()
        .route("/", get(root))
        .route(
            "/api/generations",
            get(generation::list_generations).post(generation::create_generation),
        )
        .route(
            "/api/generations/preview",
            post(generation::preview_generation),
        )
        .route("/api/generations/:id", get(generation::get_generation))
        .route(
            "/api/generations/:id/cancel",
            post(generation::cancel_generation),
        )
        .route("/api/quota", get(billing::get_quota))
}
