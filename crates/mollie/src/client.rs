use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use url::Url;

use paysync_core::{PaymentSnapshot, SubscriptionSnapshot, UnknownStatus};

use crate::{
    resources::{
        CustomerBody, Metadata, MollieCustomer, MolliePayment, MollieSubscription,
        SubscriptionBody,
    },
    CustomerRequest, PaymentGateway, SubscriptionRequest,
};

/// Production endpoint of the v2 REST API.
pub const DEFAULT_BASE_URL: &str = "https://api.mollie.com/v2/";

/// Builds the shared HTTP client with bounded connect and request times.
///
/// A stalled peer surfaces as a transient [`MollieError::Http`] instead of
/// holding the webhook delivery open.
pub fn http_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(concat!("paysync/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(timeout)
        .timeout(timeout)
        .build()
}

/// Client for the Mollie v2 REST API, authenticated with an API key.
#[derive(Clone)]
pub struct MollieClient {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl MollieClient {
    /// Creates a new client. `base_url` must end with `/`.
    pub fn new(api_key: impl Into<String>, base_url: Url, http: Client) -> Self {
        Self {
            http,
            base_url,
            api_key: api_key.into(),
        }
    }

    /// Fetches a single payment.
    pub async fn fetch_payment(&self, payment_id: &str) -> Result<MolliePayment, MollieError> {
        let url = self.endpoint(&["payments", payment_id])?;
        let response = self.authorized_request(Method::GET, url).send().await?;
        parse_json(response).await
    }

    /// Fetches a subscription nested under its customer.
    pub async fn fetch_subscription(
        &self,
        customer_id: &str,
        subscription_id: &str,
    ) -> Result<MollieSubscription, MollieError> {
        let url = self.endpoint(&["customers", customer_id, "subscriptions", subscription_id])?;
        let response = self.authorized_request(Method::GET, url).send().await?;
        parse_json(response).await
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, MollieError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| MollieError::Url(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized_request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&self.api_key)
    }
}

#[async_trait]
impl PaymentGateway for MollieClient {
    async fn get_payment(&self, payment_id: &str) -> Result<PaymentSnapshot, MollieError> {
        let payment = self.fetch_payment(payment_id).await?;
        Ok(payment.into_snapshot()?)
    }

    async fn get_subscription(
        &self,
        customer_id: &str,
        subscription_id: &str,
    ) -> Result<SubscriptionSnapshot, MollieError> {
        let subscription = self.fetch_subscription(customer_id, subscription_id).await?;
        Ok(subscription.into_snapshot()?)
    }

    async fn create_customer(&self, request: &CustomerRequest) -> Result<String, MollieError> {
        let url = self.endpoint(&["customers"])?;
        let body = CustomerBody {
            name: request.name.as_deref(),
            email: &request.email,
            metadata: Metadata::for_account(&request.account_id),
        };
        let response = self
            .authorized_request(Method::POST, url)
            .json(&body)
            .send()
            .await?;
        let customer: MollieCustomer = parse_json(response).await?;
        Ok(customer.id)
    }

    async fn create_subscription(
        &self,
        customer_id: &str,
        request: &SubscriptionRequest,
    ) -> Result<SubscriptionSnapshot, MollieError> {
        let url = self.endpoint(&["customers", customer_id, "subscriptions"])?;
        let body = SubscriptionBody {
            amount: (&request.amount).into(),
            interval: &request.interval,
            description: &request.description,
            webhook_url: request.webhook_url.as_deref(),
            metadata: Metadata::for_account(&request.account_id),
        };
        let response = self
            .authorized_request(Method::POST, url)
            .json(&body)
            .send()
            .await?;
        let subscription: MollieSubscription = parse_json(response).await?;
        Ok(subscription.into_snapshot()?)
    }

    async fn cancel_subscription(
        &self,
        customer_id: &str,
        subscription_id: &str,
    ) -> Result<SubscriptionSnapshot, MollieError> {
        let url = self.endpoint(&["customers", customer_id, "subscriptions", subscription_id])?;
        let response = self.authorized_request(Method::DELETE, url).send().await?;
        let subscription: MollieSubscription = parse_json(response).await?;
        Ok(subscription.into_snapshot()?)
    }
}

/// Errors produced by the gateway client.
#[derive(Debug, Error)]
pub enum MollieError {
    #[error("base url {0} cannot be extended with a path")]
    Url(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("resource not found")]
    NotFound,
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error(transparent)]
    UnknownStatus(#[from] UnknownStatus),
}

impl MollieError {
    /// Network failures, rate limiting and server errors are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(err) => !(err.is_decode() || err.is_builder()),
            Self::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Url(_) | Self::NotFound | Self::UnknownStatus(_) => false,
        }
    }

    /// Stable label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Url(_) => "url",
            Self::Http(_) => "http",
            Self::NotFound => "not_found",
            Self::Status { .. } => "status",
            Self::UnknownStatus(_) => "unknown_status",
        }
    }
}

async fn parse_json<T>(response: Response) -> Result<T, MollieError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Err(MollieError::NotFound);
    }
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(MollieError::Status { status, body });
    }

    Ok(response.json().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use httpmock::Method;
    use paysync_core::{Amount, PaymentStatus, SubscriptionStatus};
    use serde_json::json;

    fn client(base_url: &Url) -> MollieClient {
        MollieClient::new(
            "test_key",
            base_url.clone(),
            http_client(Duration::from_secs(5)).expect("client"),
        )
    }

    fn subscription_body(status: &str) -> serde_json::Value {
        json!({
            "resource": "subscription",
            "id": "sub_1",
            "customerId": "cst_1",
            "status": status,
            "amount": { "currency": "EUR", "value": "9.99" },
            "interval": "1 month",
            "description": "Monthly",
            "startDate": "2024-01-01",
            "nextPaymentDate": "2024-02-01",
            "metadata": { "user_id": "acct_7" }
        })
    }

    #[tokio::test]
    async fn get_payment_parses_response() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/v2/")).expect("url");

        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v2/payments/tr_1")
                    .header("Authorization", "Bearer test_key");
                then.status(200).json_body(json!({
                    "resource": "payment",
                    "id": "tr_1",
                    "status": "paid",
                    "amount": { "currency": "EUR", "value": "29.00" },
                    "description": "Pro plan",
                    "metadata": { "user_id": "acct_7" },
                    "createdAt": "2024-03-01T10:00:00+00:00",
                    "paidAt": "2024-03-01T10:02:00+00:00"
                }));
            })
            .await;

        let snapshot = client(&base).get_payment("tr_1").await.expect("payment");
        mock.assert_async().await;
        assert_eq!(snapshot.status, PaymentStatus::Paid);
        assert_eq!(snapshot.owner_hint.as_deref(), Some("acct_7"));
    }

    #[test]
    fn path_segments_are_escaped() {
        let base = Url::parse(DEFAULT_BASE_URL).expect("url");
        let url = client(&base)
            .endpoint(&["payments", "../customers"])
            .expect("endpoint");
        assert_eq!(url.as_str(), "https://api.mollie.com/v2/payments/..%2Fcustomers");
    }

    #[tokio::test]
    async fn not_found_is_not_transient() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/v2/")).expect("url");
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/payments/tr_missing");
                then.status(404).body("{\"status\":404}");
            })
            .await;

        let err = client(&base).get_payment("tr_missing").await.unwrap_err();
        assert!(matches!(err, MollieError::NotFound));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/v2/")).expect("url");
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/payments/tr_1");
                then.status(503).body("maintenance");
            })
            .await;

        let err = client(&base).get_payment("tr_1").await.unwrap_err();
        match &err {
            MollieError::Status { status, body } => {
                assert_eq!(*status, StatusCode::SERVICE_UNAVAILABLE);
                assert_eq!(body, "maintenance");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.is_transient());
        assert_eq!(err.kind(), "status");

        let unauthorized = MollieError::Status {
            status: StatusCode::UNAUTHORIZED,
            body: String::new(),
        };
        assert!(!unauthorized.is_transient());
        let throttled = MollieError::Status {
            status: StatusCode::TOO_MANY_REQUESTS,
            body: String::new(),
        };
        assert!(throttled.is_transient());
    }

    #[tokio::test]
    async fn stalled_responses_time_out_as_transient() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/v2/")).expect("url");
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/payments/tr_slow");
                then.status(200)
                    .delay(Duration::from_secs(2))
                    .body("{}");
            })
            .await;

        let http = http_client(Duration::from_millis(200)).expect("client");
        let client = MollieClient::new("test_key", base, http);
        let err = client.get_payment("tr_slow").await.unwrap_err();
        match &err {
            MollieError::Http(inner) => assert!(inner.is_timeout()),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.is_transient());
        assert_eq!(err.kind(), "http");
    }

    #[tokio::test]
    async fn get_subscription_uses_customer_path() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/v2/")).expect("url");
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/customers/cst_1/subscriptions/sub_1");
                then.status(200).json_body(subscription_body("active"));
            })
            .await;

        let snapshot = client(&base)
            .get_subscription("cst_1", "sub_1")
            .await
            .expect("subscription");
        mock.assert_async().await;
        assert_eq!(snapshot.status, SubscriptionStatus::Active);
        assert_eq!(snapshot.customer_id, "cst_1");
    }

    #[tokio::test]
    async fn create_customer_sends_owner_metadata() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/v2/")).expect("url");
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/v2/customers").json_body(json!({
                    "name": "Ada Lovelace",
                    "email": "ada@example.com",
                    "metadata": { "user_id": "acct_7", "created_via": "paysync" }
                }));
                then.status(201)
                    .json_body(json!({ "resource": "customer", "id": "cst_1" }));
            })
            .await;

        let customer_id = client(&base)
            .create_customer(&CustomerRequest {
                account_id: "acct_7".to_string(),
                name: Some("Ada Lovelace".to_string()),
                email: "ada@example.com".to_string(),
            })
            .await
            .expect("customer");
        mock.assert_async().await;
        assert_eq!(customer_id, "cst_1");
    }

    #[tokio::test]
    async fn create_subscription_posts_monthly_plan() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/v2/")).expect("url");
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v2/customers/cst_1/subscriptions")
                    .json_body(json!({
                        "amount": { "currency": "EUR", "value": "9.99" },
                        "interval": "1 month",
                        "description": "Monthly",
                        "metadata": { "user_id": "acct_7", "created_via": "paysync" }
                    }));
                then.status(201).json_body(subscription_body("pending"));
            })
            .await;

        let snapshot = client(&base)
            .create_subscription(
                "cst_1",
                &SubscriptionRequest {
                    account_id: "acct_7".to_string(),
                    amount: Amount::new("9.99", "EUR"),
                    interval: "1 month".to_string(),
                    description: "Monthly".to_string(),
                    webhook_url: None,
                },
            )
            .await
            .expect("subscription");
        mock.assert_async().await;
        assert_eq!(snapshot.status, SubscriptionStatus::Pending);
    }

    #[tokio::test]
    async fn cancel_subscription_sends_delete() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/v2/")).expect("url");
        let mock = server
            .mock_async(|when, then| {
                when.method(Method::DELETE)
                    .path("/v2/customers/cst_1/subscriptions/sub_1");
                then.status(200).json_body(subscription_body("canceled"));
            })
            .await;

        let snapshot = client(&base)
            .cancel_subscription("cst_1", "sub_1")
            .await
            .expect("cancel");
        mock.assert_async().await;
        assert_eq!(snapshot.status, SubscriptionStatus::Canceled);
    }
}
