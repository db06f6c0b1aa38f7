//! Error types and Result alias for the trading agent

use thiserror::Error;

/// Endpoint classes that get independent circuit-breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    /// Historical OHLCV bars
    Historical,
    /// Fundamentals (PE/PB)
    Fundamentals,
    /// Order placement, modification, cancellation, status
    Orders,
}

impl std::fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointClass::Historical => write!(f, "historical"),
            EndpointClass::Fundamentals => write!(f, "fundamentals"),
            EndpointClass::Orders => write!(f, "orders"),
        }
    }
}

/// Main error type for the trading agent
#[derive(Error, Debug)]
pub enum Error {
    #[error("Authentication expired: {0}")]
    AuthExpired(String),

    #[error("Broker rate limit: {0}")]
    RateLimited(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Circuit open for {endpoint} endpoint")]
    CircuitOpen { endpoint: EndpointClass },

    #[error("Insufficient history for {ticker}: {got} bars, {need} required")]
    InsufficientData {
        ticker: String,
        got: usize,
        need: usize,
    },

    #[error("No data returned for {0}")]
    NoData(String),

    #[error("Insufficient funds: required {required:.2}, available {available:.2}")]
    InsufficientFunds { required: f64, available: f64 },

    #[error("Duplicate order: {0}")]
    DuplicateOrder(String),

    #[error("Broker rejected order: {0}")]
    BrokerReject(String),

    #[error("Ledger persistence failed: {0}")]
    Persistence(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Broker error descriptions that mean the session token is no longer valid
const AUTH_ERROR_MARKERS: &[&str] = &["invalid jwt token", "invalid credentials"];

/// Whether a broker error description classifies as an auth failure
pub fn is_auth_description(description: &str) -> bool {
    let lower = description.to_lowercase();
    AUTH_ERROR_MARKERS.iter().any(|m| lower.contains(m))
}

impl Error {
    /// Errors that SessionGuard resolves with a single re-login
    pub fn is_auth(&self) -> bool {
        matches!(self, Error::AuthExpired(_))
    }

    /// Errors worth another attempt under the retry policy
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RateLimited(_) | Error::Transient(_) | Error::WebSocket(_)
        )
    }

    /// Errors that advance a circuit breaker's failure count.
    /// Thin history and empty results are answers, not endpoint faults.
    pub fn counts_toward_breaker(&self) -> bool {
        !matches!(
            self,
            Error::InsufficientData { .. }
                | Error::NoData(_)
                | Error::CircuitOpen { .. }
                | Error::InsufficientFunds { .. }
                | Error::DuplicateOrder(_)
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            return Error::Transient(err.to_string());
        }
        if let Some(status) = err.status() {
            if status.as_u16() == 429 {
                return Error::RateLimited(err.to_string());
            }
            if status.is_server_error() {
                return Error::Transient(err.to_string());
            }
            if status.is_client_error() {
                return Error::BrokerReject(err.to_string());
            }
        }
        Error::Transient(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Persistence(err.to_string())
    }
}
