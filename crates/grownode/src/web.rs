use anyhow::Context as _;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

use crate::context::Context;
use crate::error::GrowError;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(ctx: Context) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/status", get(api_status))
        .route("/api/leaves/{leaf}/params/{param}", post(change_param))
        .with_state(ctx)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn api_status(State(ctx): State<Context>) -> impl IntoResponse {
    Json(ctx.status_report().await)
}

/// Body is the raw value text, same as `P/{leaf}/command/{param}`.
async fn change_param(
    State(ctx): State<Context>,
    Path((leaf, param)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    match ctx.request_param_change(&leaf, &param, &body).await {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({ "queued": true }))).into_response(),
        Err(e) => {
            let status = match e {
                GrowError::LeafNotFound(_) | GrowError::NotFound { .. } => StatusCode::NOT_FOUND,
                GrowError::AccessViolation { .. } => StatusCode::FORBIDDEN,
                GrowError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::SERVICE_UNAVAILABLE,
            };
            (status, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(ctx: Context, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "status api listening");

    axum::serve(listener, router(ctx))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_context, ProbeLeaf};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_param(leaf: &str, param: &str, body: &'static str) -> Request<Body> {
        Request::post(format!("/api/leaves/{leaf}/params/{param}"))
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let (ctx, _outbox) = test_context().await;
        let resp = router(ctx)
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn status_lists_leaves_and_params() {
        let (ctx, _outbox) = test_context().await;
        let node = crate::node::Node::create(&ctx, "greenhouse").await.unwrap();
        let (probe, _seen) = ProbeLeaf::new();
        node.add_leaf("probe", &probe).await.unwrap();

        let resp = router(ctx)
            .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let json = body_json(resp).await;
        assert_eq!(json["node"], "greenhouse");
        assert_eq!(json["status"], "completed");
        assert_eq!(json["leaves"][0]["name"], "probe");
        assert_eq!(json["leaves"][0]["state"], "initialized");
        assert_eq!(json["leaves"][0]["params"][0]["name"], "flag");
        assert_eq!(json["leaves"][0]["params"][0]["value"], false);
    }

    #[tokio::test]
    async fn change_param_maps_errors_to_status_codes() {
        let (ctx, _outbox) = test_context().await;
        let node = crate::node::Node::create(&ctx, "n").await.unwrap();
        node.add_leaf("sensor", &crate::leaves::sensors::WaterLevelLeaf)
            .await
            .unwrap();
        let app = router(ctx);

        let resp = app.clone().oneshot(post_param("ghost", "x", "1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app.clone().oneshot(post_param("sensor", "nope", "1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app.clone().oneshot(post_param("sensor", "level", "1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = app.clone().oneshot(post_param("sensor", "active", "maybe")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app.oneshot(post_param("sensor", "active", "0")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
    }
}
