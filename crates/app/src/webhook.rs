use std::time::Instant;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use metrics::{counter, histogram};
use serde_json::json;
use tracing::{info, warn};

use paysync_core::{verify_signature, Resource, WebhookEnvelope};
use paysync_util::WebhookVerification;

use crate::problem::ProblemResponse;
use crate::router::AppState;

const HEADER_SIGNATURE: &str = "x-mollie-signature";
const STAGE: &str = "ingress";

/// Gateway webhook endpoint.
///
/// Authentication and parse failures are rejected so the gateway retries or
/// drops the delivery. Once the body is understood the delivery is always
/// acknowledged with `200`; reconciliation failures are reported in the body
/// and recovered through the admin reconcile endpoint.
pub async fn handle(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProblemResponse> {
    let start = Instant::now();
    let result = process(&state, &headers, &body).await;
    let label = match &result {
        Ok((label, _)) => *label,
        Err(_) => "rejected",
    };
    histogram!("webhook_ack_latency_seconds", "resource" => label)
        .record(start.elapsed().as_secs_f64());
    result.map(|(_, response)| response)
}

async fn process(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(&'static str, Response), ProblemResponse> {
    authenticate(state.verification(), headers, body)?;

    let envelope = WebhookEnvelope::parse(body).map_err(|err| {
        warn!(stage = STAGE, error = %err, "rejecting malformed webhook body");
        ProblemResponse::bad_request(err.problem_type(), err.to_string())
    })?;
    let label = envelope.resource.metric_label();
    counter!("webhook_ingress_total", "resource" => label).increment(1);
    info!(stage = STAGE, resource = envelope.resource.as_str(), id = %envelope.id, "webhook received");

    let reconciler = state.reconciler();
    let failed = match &envelope.resource {
        Resource::Payment => reconciler.reconcile_payment(&envelope.id).await.is_err(),
        Resource::Subscription => reconciler.reconcile_subscription(&envelope.id).await.is_err(),
        Resource::Unknown(kind) => {
            info!(stage = STAGE, kind = %kind, id = %envelope.id, "ignoring unsupported resource");
            false
        }
    };

    let body = if failed {
        json!({
            "success": false,
            "error": "processing_failed",
            "message": "Webhook received but processing failed",
            "resource": envelope.resource.as_str(),
            "id": envelope.id,
        })
    } else {
        json!({
            "success": true,
            "message": "Webhook processed successfully",
            "resource": envelope.resource.as_str(),
            "id": envelope.id,
        })
    };
    Ok((label, (StatusCode::OK, Json(body)).into_response()))
}

fn authenticate(
    verification: &WebhookVerification,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), ProblemResponse> {
    match verification {
        WebhookVerification::Enforced { secret } => {
            let provided = headers
                .get(HEADER_SIGNATURE)
                .and_then(|value| value.to_str().ok());
            verify_signature(secret.expose().as_bytes(), body, provided).map_err(|err| {
                counter!("webhook_invalid_signature_total").increment(1);
                warn!(stage = STAGE, error = %err, "webhook signature rejected");
                ProblemResponse::unauthorized("invalid_signature", err.to_string())
            })
        }
        WebhookVerification::Bypassed => {
            warn!(stage = STAGE, "signature verification bypassed for this request");
            Ok(())
        }
    }
}
