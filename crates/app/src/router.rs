use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;

use paysync_util::{Secret, WebhookVerification};

use crate::reconciler::Reconciler;
use crate::{admin, telemetry, webhook};

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    verification: Arc<WebhookVerification>,
    reconciler: Reconciler,
    admin_token: Option<Arc<Secret>>,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        verification: WebhookVerification,
        reconciler: Reconciler,
        admin_token: Option<Secret>,
    ) -> Self {
        Self {
            metrics,
            verification: Arc::new(verification),
            reconciler,
            admin_token: admin_token.map(Arc::new),
        }
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn verification(&self) -> &WebhookVerification {
        &self.verification
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn admin_token(&self) -> Option<&Secret> {
        self.admin_token.as_deref()
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/webhooks/payment-gateway", post(webhook::handle))
        .route("/admin/reconcile/:resource/:id", post(admin::reconcile))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}
