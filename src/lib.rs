pub mod config;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;

use std::sync::Arc;

use axum::{http::HeaderValue, middleware as axum_mw, routing::get, Router};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use state::AppState;

/// Assemble the full gateway router: OpenAI surface under /v1, native
/// surface under /gemini, admin under /admin, plus open health endpoints.
pub fn app(state: Arc<AppState>) -> Router {
    let client_auth = axum_mw::from_fn_with_state(state.clone(), middleware::auth::client_auth);
    let admin_auth = axum_mw::from_fn_with_state(state.clone(), middleware::auth::admin_auth);

    let openai_routes = routes::openai::router().route_layer(client_auth.clone());
    let gemini_routes = routes::gemini::router().route_layer(client_auth.clone());
    let admin_routes = routes::admin::router().route_layer(admin_auth);

    let allow_origin = if state.config.cors_origin == "*" {
        AllowOrigin::any()
    } else {
        let origins: Vec<HeaderValue> = state
            .config
            .cors_origin
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();
        AllowOrigin::list(origins)
    };

    let cors = CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::DELETE,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
            axum::http::HeaderName::from_static("x-api-key"),
        ]);

    Router::new()
        .route("/health", get(routes::admin::health))
        .route("/gemini/health", get(routes::gemini::health))
        .route(
            "/stats",
            get(routes::admin::stats).route_layer(client_auth),
        )
        .nest("/v1", openai_routes)
        .nest("/gemini/v1beta", gemini_routes)
        .nest("/admin", admin_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
