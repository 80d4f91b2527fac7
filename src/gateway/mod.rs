pub mod handlers;
pub mod openapi;
pub mod state;
pub mod types;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tokio::net::TcpListener;

use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::ledger::StakeService;
use state::AppState;

/// Start HTTP Gateway server
pub async fn run_server(host: &str, port: u16, service: Arc<StakeService>) {
    let state = Arc::new(AppState::new(service));

    let payment_routes = Router::new()
        .route("/stake", post(handlers::create_stake))
        .route("/refund", post(handlers::refund))
        .route("/settle-pool", post(handlers::settle_pool))
        .route("/stakes/{user_id}", get(handlers::list_stakes))
        .route("/transfers/{user_id}", get(handlers::list_transfers))
        .route("/pool", get(handlers::get_pool));

    let user_routes = Router::new()
        .route("/", post(handlers::create_user).get(handlers::list_users))
        .route("/{id}", get(handlers::get_user));

    let app = Router::new()
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", openapi::ApiDoc::openapi()))
        .nest("/api/payments", payment_routes)
        .nest("/api/users", user_routes)
        .route("/api/health", get(handlers::health))
        .with_state(state);

    let addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| panic!("Failed to bind {}: {}", addr, e));
    tracing::info!("Gateway listening on {}", addr);
    println!("🚀 Gateway listening on http://{}", addr);
    println!("📖 Swagger UI at http://{}/docs", addr);

    axum::serve(listener, app)
        .await
        .expect("Gateway server failed");
}
