use flagrelay_lib::OperationBusy;

/// Configuration problems are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors talking to the upstream authority.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("upstream returned {0}")]
    Status(reqwest::StatusCode),
}

impl UpstreamError {
    /// Transient failures are retried: network errors, 5xx, 408, 429.
    pub fn is_retryable(&self) -> bool {
        match self {
            UpstreamError::Network(_) => true,
            UpstreamError::Status(status) => {
                status.is_server_error()
                    || *status == reqwest::StatusCode::REQUEST_TIMEOUT
                    || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
        }
    }

    /// 401/403 mean a bad api key; retrying cannot help.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            UpstreamError::Status(status)
                if *status == reqwest::StatusCode::UNAUTHORIZED
                    || *status == reqwest::StatusCode::FORBIDDEN
        )
    }
}

/// Persistent-store failures. Never fatal: the in-memory mirror remains
/// authoritative.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("persistent store failure: {0}")]
    Store(#[from] sled::Error),
    #[error("snapshot serialization failure: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Outcome of a user-triggered flush.
#[derive(Debug, thiserror::Error)]
pub enum FlushError {
    #[error(transparent)]
    Busy(#[from] OperationBusy),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn transient_statuses_are_retryable() {
        for status in [
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::TOO_MANY_REQUESTS,
        ] {
            assert!(UpstreamError::Status(status).is_retryable(), "{status}");
        }
    }

    #[test]
    fn client_errors_are_not_retryable() {
        for status in [
            StatusCode::BAD_REQUEST,
            StatusCode::UNAUTHORIZED,
            StatusCode::FORBIDDEN,
            StatusCode::NOT_FOUND,
        ] {
            assert!(!UpstreamError::Status(status).is_retryable(), "{status}");
        }
    }

    #[test]
    fn auth_failures_are_flagged() {
        assert!(UpstreamError::Status(StatusCode::UNAUTHORIZED).is_auth_failure());
        assert!(UpstreamError::Status(StatusCode::FORBIDDEN).is_auth_failure());
        assert!(!UpstreamError::Status(StatusCode::BAD_GATEWAY).is_auth_failure());
    }
}
