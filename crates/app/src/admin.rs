use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::problem::ProblemResponse;
use crate::router::AppState;

const STAGE: &str = "admin";

/// Manual reconciliation of a single resource, for deliveries acknowledged as failed.
pub async fn reconcile(
    State(state): State<AppState>,
    Path((resource, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ProblemResponse> {
    let Some(expected) = state.admin_token() else {
        return Err(ProblemResponse::new(
            StatusCode::NOT_FOUND,
            "not_found",
            "manual reconciliation is disabled",
        ));
    };

    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .unwrap_or_default();
    if !bool::from(provided.as_bytes().ct_eq(expected.expose().as_bytes())) {
        warn!(stage = STAGE, %resource, %id, "admin token rejected");
        return Err(ProblemResponse::unauthorized(
            "invalid_token",
            "missing or invalid bearer token",
        ));
    }

    let reconciler = state.reconciler();
    let result = match resource.as_str() {
        "payments" | "payment" => reconciler.reconcile_payment(&id).await,
        "subscriptions" | "subscription" => reconciler.reconcile_subscription(&id).await,
        other => {
            return Err(ProblemResponse::bad_request(
                "unknown_resource",
                format!("cannot reconcile resource kind {other:?}"),
            ))
        }
    };

    match result {
        Ok(outcome) => {
            info!(stage = STAGE, %resource, %id, action = outcome.action, "manual reconciliation finished");
            Ok((StatusCode::OK, Json(outcome)).into_response())
        }
        Err(err) => Err(ProblemResponse::new(
            StatusCode::BAD_GATEWAY,
            "reconcile_failed",
            err.to_string(),
        )),
    }
}
