// rest/mod.rs — HTTP surface for invitation administration and the
// identity-provider confirmation webhook.
//
// Endpoints:
//   GET  /health
//   POST /invitations                    (admin)
//   GET  /invitations                    (admin)
//   POST /invitations/{id}/revoke        (admin)
//   GET  /invitations/validate
//   POST /onboarding/confirm
//   POST /onboarding/repair              (admin)
//   GET  /onboarding/stats               (admin)

pub mod routes;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::AppContext;

pub async fn start_rest_server(ctx: Arc<AppContext>) -> Result<()> {
    let bind = format!("{}:{}", ctx.config.bind_address, ctx.config.port);
    let addr: SocketAddr = bind.parse()?;

    let router = build_router(ctx);

    info!("onboarding API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        // Health (no auth)
        .route("/health", get(routes::health::health))
        // Invitation administration
        .route(
            "/invitations",
            get(routes::invitations::list_invitations)
                .post(routes::invitations::create_invitation),
        )
        .route(
            "/invitations/validate",
            get(routes::invitations::validate_invitation),
        )
        .route(
            "/invitations/{id}/revoke",
            post(routes::invitations::revoke_invitation),
        )
        // Confirmation webhook and operator tooling
        .route("/onboarding/confirm", post(routes::onboarding::confirm))
        .route("/onboarding/repair", post(routes::onboarding::repair))
        .route("/onboarding/stats", get(routes::onboarding::stats))
        // The acceptance form is served from another origin.
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}
