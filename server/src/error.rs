use std::time::Duration;

/// Errors raised while loading configuration and constructing backends.
/// Any of these aborts startup.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("Backend {name}: {reason}")]
    Backend { name: String, reason: String },

    #[error("Invalid proxy URL: {0}")]
    Proxy(String),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Config(String),
}

impl SetupError {
    pub fn backend(name: &str, reason: impl Into<String>) -> Self {
        Self::Backend {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Outcome classification for a single notification dispatch.
///
/// `Temporary` drives the retry loop inside a backend; everything else
/// propagates to the HTTP layer, where it becomes a 502.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Transient upstream failure, worth retrying after a delay. The
    /// provider may dictate the delay via a `Retry-After` header.
    #[error("Temporary dispatch failure: {reason}")]
    Temporary {
        reason: String,
        retry_after: Option<Duration>,
    },

    /// Unrecoverable failure that is not a token rejection: provider 4xx,
    /// misconfiguration, or retries exhausted.
    #[error("Permanent dispatch failure: {reason}")]
    Permanent { reason: String },

    /// The backend's in-flight limit was hit; shed the request rather than
    /// queue it.
    #[error("Too many in-flight requests for backend {backend}")]
    TooManyInFlight { backend: String },
}

impl DispatchError {
    pub fn temporary(reason: impl Into<String>) -> Self {
        Self::Temporary {
            reason: reason.into(),
            retry_after: None,
        }
    }

    pub fn temporary_after(reason: impl Into<String>, retry_after: Duration) -> Self {
        Self::Temporary {
            reason: reason.into(),
            retry_after: Some(retry_after),
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent {
            reason: reason.into(),
        }
    }

    /// Whether the retry driver should attempt this dispatch again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Temporary { .. })
    }
}

/// Failure to establish a tunnel through the configured HTTP proxy.
///
/// This indicates a problem with the proxy itself rather than the push
/// provider behind it, so backends treat it as transient.
#[derive(Debug, thiserror::Error)]
pub enum ProxyConnectError {
    #[error("Could not reach proxy {proxy}: {source}")]
    Unreachable {
        proxy: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Proxy refused CONNECT: {status} ({reason})")]
    Refused { status: String, reason: String },

    #[error("Malformed CONNECT response from proxy: {0}")]
    MalformedResponse(String),
}

impl From<ProxyConnectError> for DispatchError {
    fn from(e: ProxyConnectError) -> Self {
        DispatchError::temporary(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temporary_is_retryable() {
        assert!(DispatchError::temporary("503 from provider").is_retryable());
        assert!(
            DispatchError::temporary_after("slow down", Duration::from_secs(30)).is_retryable()
        );
    }

    #[test]
    fn test_permanent_not_retryable() {
        assert!(!DispatchError::permanent("403 from provider").is_retryable());
    }

    #[test]
    fn test_inflight_limit_not_retryable() {
        assert!(!DispatchError::TooManyInFlight {
            backend: "com.example.apns".into(),
        }
        .is_retryable());
    }

    #[test]
    fn test_proxy_error_becomes_temporary() {
        let err: DispatchError = ProxyConnectError::Refused {
            status: "401".into(),
            reason: "Unauthorised".into(),
        }
        .into();
        assert!(err.is_retryable());
    }
}
