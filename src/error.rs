//! Error types for market data, analytics and storage operations

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MarketError {
    #[error("Invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Data not available for {symbol}: {reason}")]
    DataUnavailable { symbol: String, reason: String },

    #[error("Rate limit exceeded for {provider}")]
    RateLimited { provider: String },

    /// Upstream answered, but not with something usable. `status` is the HTTP
    /// status when the failure came from the response code.
    #[error("{provider} error: {message}")]
    Provider {
        provider: String,
        message: String,
        status: Option<u16>,
    },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, MarketError>;

impl MarketError {
    pub fn data_unavailable(symbol: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DataUnavailable {
            symbol: symbol.into(),
            reason: reason.into(),
        }
    }

    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
            status: None,
        }
    }

    /// Whether repeating the same request later could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Network(err) => err.is_timeout() || err.is_connect(),
            Self::Provider {
                status: Some(code), ..
            } => (500..600).contains(code),
            _ => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidSymbol(_) => "invalid_symbol",
            Self::InvalidRequest(_) => "invalid_request",
            Self::DataUnavailable { .. } => "data_unavailable",
            Self::RateLimited { .. } => "rate_limited",
            Self::Provider { .. } => "provider",
            Self::Network(_) => "network",
            Self::Json(_) => "json",
            Self::Database(_) => "database",
            Self::Config(_) => "config",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<tokio::task::JoinError> for MarketError {
    fn from(err: tokio::task::JoinError) -> Self {
        MarketError::Internal(format!("background task failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = MarketError::InvalidSymbol("??".to_string());
        assert_eq!(err.to_string(), "Invalid symbol: ??");

        let err = MarketError::data_unavailable("AAPL", "no candles");
        assert_eq!(err.to_string(), "Data not available for AAPL: no candles");
    }

    #[test]
    fn transient_classification() {
        assert!(MarketError::RateLimited {
            provider: "yahoo".to_string()
        }
        .is_transient());
        assert!(MarketError::Provider {
            provider: "yahoo".to_string(),
            message: "bad gateway".to_string(),
            status: Some(502),
        }
        .is_transient());
        assert!(!MarketError::Provider {
            provider: "yahoo".to_string(),
            message: "not found".to_string(),
            status: Some(404),
        }
        .is_transient());
        assert!(!MarketError::Provider {
            provider: "yahoo".to_string(),
            message: "slow down".to_string(),
            status: Some(429),
        }
        .is_transient());
        assert!(!MarketError::InvalidSymbol("X".to_string()).is_transient());
        assert!(!MarketError::data_unavailable("X", "empty").is_transient());
    }

    #[tokio::test]
    async fn refused_connections_are_transient() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = reqwest::Client::new()
            .get(format!("http://{}/", addr))
            .send()
            .await
            .unwrap_err();
        assert!(err.is_connect());
        assert!(MarketError::from(err).is_transient());
    }

    #[test]
    fn kinds_are_stable() {
        assert_eq!(
            MarketError::InvalidRequest("x".to_string()).kind(),
            "invalid_request"
        );
        assert_eq!(MarketError::Config("x".to_string()).kind(), "config");
    }
}
