use serde_json::Value;
use thiserror::Error;

/// Resource kinds a gateway notification may refer to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Payment,
    Subscription,
    Unknown(String),
}

impl Resource {
    fn from_tag(tag: &str) -> Self {
        match tag {
            "payments" | "payment" => Self::Payment,
            "subscriptions" | "subscription" => Self::Subscription,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Returns the tag echoed back in acknowledgements.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Payment => "payments",
            Self::Subscription => "subscriptions",
            Self::Unknown(kind) => kind,
        }
    }

    /// Returns a bounded label for metrics.
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::Payment => "payments",
            Self::Subscription => "subscriptions",
            Self::Unknown(_) => "unknown",
        }
    }
}

/// Decoded webhook body: which resource changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEnvelope {
    pub id: String,
    pub resource: Resource,
}

/// Errors raised for bodies that cannot be routed.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("failed to parse payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload must be a JSON object")]
    NotAnObject,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

impl EnvelopeError {
    /// Stable problem type used in error responses.
    pub fn problem_type(&self) -> &'static str {
        match self {
            Self::Json(_) => "invalid_json",
            Self::NotAnObject | Self::MissingField(_) => "invalid_webhook_data",
        }
    }
}

impl WebhookEnvelope {
    /// Parses the raw request body. Both `id` and `resource` must be non-empty strings.
    pub fn parse(body: &[u8]) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_slice(body)?;
        let object = value.as_object().ok_or(EnvelopeError::NotAnObject)?;

        let field = |name: &'static str| {
            object
                .get(name)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .ok_or(EnvelopeError::MissingField(name))
        };

        let id = field("id")?.to_string();
        let resource = Resource::from_tag(field("resource")?);
        Ok(Self { id, resource })
    }
}
