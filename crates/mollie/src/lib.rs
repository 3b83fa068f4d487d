pub mod client;
pub mod resources;

use async_trait::async_trait;

use paysync_core::{PaymentSnapshot, SubscriptionSnapshot};

pub use client::{http_client, MollieClient, MollieError, DEFAULT_BASE_URL};
pub use resources::{
    CustomerRequest, MollieAmount, MollieCustomer, MolliePayment, MollieSubscription,
    SubscriptionRequest,
};

/// Operations the reconcilers and account flows need from the payment gateway.
///
/// [`MollieClient`] is the production implementation; tests substitute an
/// in-memory double.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn get_payment(&self, payment_id: &str) -> Result<PaymentSnapshot, MollieError>;

    /// Subscriptions are addressed through the customer that owns them.
    async fn get_subscription(
        &self,
        customer_id: &str,
        subscription_id: &str,
    ) -> Result<SubscriptionSnapshot, MollieError>;

    /// Creates a customer and returns its gateway identifier.
    async fn create_customer(&self, request: &CustomerRequest) -> Result<String, MollieError>;

    async fn create_subscription(
        &self,
        customer_id: &str,
        request: &SubscriptionRequest,
    ) -> Result<SubscriptionSnapshot, MollieError>;

    async fn cancel_subscription(
        &self,
        customer_id: &str,
        subscription_id: &str,
    ) -> Result<SubscriptionSnapshot, MollieError>;
}
