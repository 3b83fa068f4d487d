use chrono::{DateTime, Utc};
use sqlx::{Sqlite, Transaction};
use tracing::{debug, info, warn};

use paysync_core::{
    plan_payment, NotificationRequest, PaymentEffects, PaymentPlan, PaymentSnapshot,
};
use paysync_storage::{ActivationOutcome, PaymentRecord};

use crate::reconciler::{ReconcileError, ReconcileOutcome, Reconciler, MAX_WRITE_ATTEMPTS};

const STAGE: &str = "payment";

/// Result of trying to commit one plan.
enum Commit {
    Applied(Option<NotificationRequest>),
    Lost,
}

impl Reconciler {
    /// Fetches the payment from the gateway and merges it into local storage.
    pub async fn reconcile_payment(
        &self,
        external_id: &str,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let result = self.fetch_and_apply_payment(external_id).await;
        self.observe(STAGE, external_id, &result);
        result
    }

    /// Fetches the payment snapshot, retrying transient gateway failures.
    pub async fn fetch_payment(
        &self,
        external_id: &str,
    ) -> Result<PaymentSnapshot, ReconcileError> {
        self.fetch(STAGE, external_id, || self.gateway.get_payment(external_id))
            .await
    }

    async fn fetch_and_apply_payment(
        &self,
        external_id: &str,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let snapshot = self.fetch_payment(external_id).await?;
        self.apply_payment(&snapshot).await
    }

    /// Merges an already fetched snapshot. Lost compare-and-set races re-read and re-plan.
    pub async fn apply_payment(
        &self,
        snapshot: &PaymentSnapshot,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let payments = self.database.payments();

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let current = payments
                .find_by_external_id(&snapshot.id)
                .await?
                .as_ref()
                .map(PaymentRecord::current);
            let plan = plan_payment(current.as_ref(), snapshot)?;

            match self.commit_payment_plan(snapshot, &plan).await? {
                Commit::Applied(notification) => {
                    if let Some(request) = &notification {
                        self.dispatch(request).await;
                    }
                    return Ok(ReconcileOutcome {
                        resource: STAGE,
                        external_id: snapshot.id.clone(),
                        action: plan.label(),
                        status: snapshot.status.to_string(),
                        notification: notification.map(|request| request.kind),
                    });
                }
                Commit::Lost => {
                    debug!(
                        stage = STAGE,
                        external_id = %snapshot.id,
                        attempt,
                        "concurrent write won; re-planning"
                    );
                }
            }
        }

        Err(ReconcileError::Conflict {
            external_id: snapshot.id.clone(),
            attempts: MAX_WRITE_ATTEMPTS,
        })
    }

    async fn commit_payment_plan(
        &self,
        snapshot: &PaymentSnapshot,
        plan: &PaymentPlan,
    ) -> Result<Commit, ReconcileError> {
        let payments = self.database.payments();
        let now = self.now();

        match plan {
            PaymentPlan::Unchanged { status, .. } => {
                debug!(stage = STAGE, external_id = %snapshot.id, %status, "payment unchanged");
                Ok(Commit::Applied(None))
            }
            PaymentPlan::Create { record, effects } => {
                let mut tx = self.database.begin().await?;
                if payments.insert(&mut tx, record, now).await?.is_duplicate() {
                    return Ok(Commit::Lost);
                }
                let notification = self.apply_payment_effects(&mut tx, effects, now).await?;
                tx.commit().await?;
                info!(
                    stage = STAGE,
                    external_id = %record.external_id,
                    status = %record.status,
                    amount = %record.amount,
                    "payment recorded"
                );
                Ok(Commit::Applied(notification))
            }
            PaymentPlan::Update {
                from,
                to,
                timeline,
                effects,
                ..
            } => {
                if !from.can_transition_to(*to) {
                    warn!(
                        stage = STAGE,
                        external_id = %snapshot.id,
                        %from,
                        %to,
                        "gateway reported a transition outside the payment lifecycle"
                    );
                }
                let mut tx = self.database.begin().await?;
                let moved = payments
                    .compare_and_set_status(&mut tx, &snapshot.id, *from, *to, timeline, now)
                    .await?;
                if !moved {
                    return Ok(Commit::Lost);
                }
                let notification = self.apply_payment_effects(&mut tx, effects, now).await?;
                tx.commit().await?;
                info!(stage = STAGE, external_id = %snapshot.id, %from, %to, "payment status updated");
                Ok(Commit::Applied(notification))
            }
        }
    }

    /// Applies in-transaction effects and returns the notification to send after commit.
    async fn apply_payment_effects(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        effects: &PaymentEffects,
        now: DateTime<Utc>,
    ) -> Result<Option<NotificationRequest>, ReconcileError> {
        let Some(activation) = &effects.activation else {
            return Ok(effects.notification.clone());
        };

        let outcome = self
            .database
            .subscriptions()
            .activate(tx, &activation.subscription_id, now)
            .await?;
        match outcome {
            ActivationOutcome::Activated => {
                info!(
                    stage = STAGE,
                    subscription_id = %activation.subscription_id,
                    "subscription activated by payment"
                );
                Ok(Some(activation.notification.clone()))
            }
            ActivationOutcome::AlreadyActive => Ok(None),
            ActivationOutcome::Terminal(status) => {
                warn!(
                    stage = STAGE,
                    subscription_id = %activation.subscription_id,
                    status = status.as_str(),
                    "paid payment references a subscription that has already ended"
                );
                Ok(None)
            }
            ActivationOutcome::Missing => {
                warn!(
                    stage = STAGE,
                    subscription_id = %activation.subscription_id,
                    "paid payment references a subscription that is not stored locally"
                );
                Ok(None)
            }
        }
    }
}
