use tracing::{debug, info, warn};

use paysync_core::{
    plan_subscription, NotificationRequest, SubscriptionPlan, SubscriptionSnapshot,
};
use paysync_storage::SubscriptionRecord;

use crate::reconciler::{ReconcileError, ReconcileOutcome, Reconciler, MAX_WRITE_ATTEMPTS};

const STAGE: &str = "subscription";

enum Commit {
    Applied(Option<NotificationRequest>),
    Lost,
}

impl Reconciler {
    /// Fetches the subscription from the gateway and merges it into local storage.
    pub async fn reconcile_subscription(
        &self,
        external_id: &str,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let result = self.fetch_and_apply_subscription(external_id).await;
        self.observe(STAGE, external_id, &result);
        result
    }

    async fn fetch_and_apply_subscription(
        &self,
        external_id: &str,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let customer_id = self.resolve_customer(external_id).await?;
        let snapshot = self
            .fetch(STAGE, external_id, || {
                self.gateway.get_subscription(&customer_id, external_id)
            })
            .await?;
        self.apply_subscription(&snapshot).await
    }

    /// Subscriptions are addressed through their customer at the gateway. The
    /// customer comes from the stored subscription, then from any stored
    /// payment that belongs to it.
    async fn resolve_customer(&self, external_id: &str) -> Result<String, ReconcileError> {
        if let Some(record) = self
            .database
            .subscriptions()
            .find_by_external_id(external_id)
            .await?
        {
            return Ok(record.external_customer_id);
        }

        self.database
            .payments()
            .find_customer_for_subscription(external_id)
            .await?
            .ok_or_else(|| {
                ReconcileError::Resolution(format!(
                    "no customer known for subscription {external_id}"
                ))
            })
    }

    /// Merges an already fetched snapshot, re-planning after a lost write.
    pub async fn apply_subscription(
        &self,
        snapshot: &SubscriptionSnapshot,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let subscriptions = self.database.subscriptions();

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let current = subscriptions
                .find_by_external_id(&snapshot.id)
                .await?
                .as_ref()
                .map(SubscriptionRecord::current);
            let customer_owner = match current {
                Some(_) => None,
                None => self
                    .database
                    .customers()
                    .find_by_external_id(&snapshot.customer_id)
                    .await?
                    .map(|customer| customer.account_id),
            };
            let today = self.now().date_naive();
            let plan = plan_subscription(
                current.as_ref(),
                snapshot,
                customer_owner.as_deref(),
                today,
            )?;

            match self.commit_subscription_plan(snapshot, &plan).await? {
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

    async fn commit_subscription_plan(
        &self,
        snapshot: &SubscriptionSnapshot,
        plan: &SubscriptionPlan,
    ) -> Result<Commit, ReconcileError> {
        let subscriptions = self.database.subscriptions();
        let now = self.now();

        match plan {
            SubscriptionPlan::Unchanged { status, .. } => {
                debug!(stage = STAGE, external_id = %snapshot.id, %status, "subscription unchanged");
                Ok(Commit::Applied(None))
            }
            SubscriptionPlan::Create {
                record,
                notification,
            } => {
                let mut tx = self.database.begin().await?;
                if subscriptions.insert(&mut tx, record, now).await?.is_duplicate() {
                    return Ok(Commit::Lost);
                }
                tx.commit().await?;
                info!(
                    stage = STAGE,
                    external_id = %record.external_id,
                    status = %record.status,
                    "subscription recorded"
                );
                Ok(Commit::Applied(notification.clone()))
            }
            SubscriptionPlan::Update {
                from,
                to,
                previous_next_billing_date,
                next_billing_date,
                notification,
                ..
            } => {
                if !from.can_transition_to(*to) {
                    warn!(
                        stage = STAGE,
                        external_id = %snapshot.id,
                        %from,
                        %to,
                        "gateway reported a transition outside the subscription lifecycle"
                    );
                }
                let mut tx = self.database.begin().await?;
                let moved = subscriptions
                    .compare_and_set(
                        &mut tx,
                        &snapshot.id,
                        *from,
                        *previous_next_billing_date,
                        *to,
                        *next_billing_date,
                        now,
                    )
                    .await?;
                if !moved {
                    return Ok(Commit::Lost);
                }
                tx.commit().await?;
                info!(
                    stage = STAGE,
                    external_id = %snapshot.id,
                    %from,
                    %to,
                    next_billing_date = ?next_billing_date,
                    "subscription updated"
                );
                Ok(Commit::Applied(notification.clone()))
            }
        }
    }
}
