use std::{env, fmt, net::SocketAddr, time::Duration};

use url::Url;

use super::DEFAULT_BIND_ADDR;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://paysync.db?mode=rwc";
pub const DEFAULT_GATEWAY_BASE_URL: &str = "https://api.mollie.com/v2/";
pub const DEFAULT_GATEWAY_MAX_RETRIES: usize = 3;
pub const DEFAULT_GATEWAY_TIMEOUT_SECS: u64 = 5;

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    pub fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// A configuration value that must not appear in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

/// How inbound webhook signatures are treated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookVerification {
    Enforced { secret: Secret },
    /// Only reachable outside production, through `WEBHOOK_SIGNATURE_BYPASS=true`.
    Bypassed,
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub webhook: WebhookVerification,
    pub gateway_api_key: Secret,
    pub gateway_base_url: Url,
    pub gateway_max_retries: usize,
    /// Connect and request limit for outbound calls to the gateway and relay.
    pub gateway_timeout: Duration,
    pub notify_relay_url: Option<Url>,
    pub admin_token: Option<Secret>,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let environment =
            Environment::from_str(&get("APP_ENV").unwrap_or_else(|| "development".to_string()))?;
        let bind_addr = get("APP_BIND_ADDR")
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string())
            .parse()
            .map_err(ConfigError::BindAddress)?;
        let database_url = get("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

        let bypass = match get("WEBHOOK_SIGNATURE_BYPASS") {
            Some(value) => parse_bool("WEBHOOK_SIGNATURE_BYPASS", &value)?,
            None => false,
        };
        let webhook = match (bypass, environment) {
            (true, Environment::Production) => return Err(ConfigError::BypassInProduction),
            (true, _) => WebhookVerification::Bypassed,
            (false, _) => WebhookVerification::Enforced {
                secret: get("WEBHOOK_SECRET")
                    .map(Secret::new)
                    .ok_or(ConfigError::MissingVar("WEBHOOK_SECRET"))?,
            },
        };

        let key_var = if environment.is_production() {
            "MOLLIE_API_KEY_LIVE"
        } else {
            "MOLLIE_API_KEY_TEST"
        };
        let gateway_api_key = get(key_var)
            .map(Secret::new)
            .ok_or(ConfigError::MissingVar(key_var))?;

        let gateway_base_url = with_trailing_slash(parse_url(
            "MOLLIE_API_BASE",
            &get("MOLLIE_API_BASE").unwrap_or_else(|| DEFAULT_GATEWAY_BASE_URL.to_string()),
        )?);
        let gateway_max_retries = match get("GATEWAY_MAX_RETRIES") {
            Some(value) => value.parse().map_err(|_| ConfigError::InvalidNumber {
                var: "GATEWAY_MAX_RETRIES",
                value,
            })?,
            None => DEFAULT_GATEWAY_MAX_RETRIES,
        };
        let gateway_timeout_secs = match get("GATEWAY_TIMEOUT_SECS") {
            Some(value) => match value.parse::<u64>() {
                Ok(secs) if secs > 0 => secs,
                _ => {
                    return Err(ConfigError::InvalidNumber {
                        var: "GATEWAY_TIMEOUT_SECS",
                        value,
                    })
                }
            },
            None => DEFAULT_GATEWAY_TIMEOUT_SECS,
        };
        let notify_relay_url = get("NOTIFY_RELAY_URL")
            .map(|value| parse_url("NOTIFY_RELAY_URL", &value))
            .transpose()?;
        let admin_token = get("ADMIN_TOKEN").map(Secret::new);

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            webhook,
            gateway_api_key,
            gateway_base_url,
            gateway_max_retries,
            gateway_timeout: Duration::from_secs(gateway_timeout_secs),
            notify_relay_url,
            admin_token,
        })
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            var,
            value: value.to_string(),
        }),
    }
}

fn parse_url(var: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|source| ConfigError::InvalidUrl { var, source })
}

/// The gateway client appends path segments after the base path.
fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    MissingVar(&'static str),
    InvalidBool {
        var: &'static str,
        value: String,
    },
    InvalidNumber {
        var: &'static str,
        value: String,
    },
    InvalidUrl {
        var: &'static str,
        source: url::ParseError,
    },
    BypassInProduction,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::MissingVar(var) => write!(f, "{var} must be set"),
            Self::InvalidBool { var, value } => {
                write!(f, "{var} must be 'true' or 'false' (got {value})")
            }
            Self::InvalidNumber { var, value } => {
                write!(f, "{var} must be a valid integer (got {value})")
            }
            Self::InvalidUrl { var, source } => write!(f, "invalid {var} value: {source}"),
            Self::BypassInProduction => f.write_str(
                "WEBHOOK_SIGNATURE_BYPASS cannot be enabled when APP_ENV is production",
            ),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::BindAddress(err) => Some(err),
            Self::InvalidUrl { source, .. } => Some(source),
            _ => None,
        }
    }
}
