use thiserror::Error;

/// Errors that can occur while building or delivering a push notification.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// The probe's platform cannot be reached through the gateway.
    #[error("Unsupported platform: {platform}")]
    UnsupportedPlatform { platform: String },

    /// A setting needed for this target is not configured.
    #[error("Missing configuration: {0}")]
    MissingConfig(&'static str),

    #[error("Invalid gateway URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The gateway answered with anything other than 200 OK.
    #[error("Gateway returned status {status}: {body}")]
    Status { status: u16, body: String },
}

impl NotifyError {
    /// Whether sending the same request again may succeed.
    ///
    /// Transport errors, 5xx and 429 are retryable. Other 4xx answers and
    /// every build-time error are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            NotifyError::Http(_) => true,
            NotifyError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// True for the failures that mean the gateway did not accept the push.
    pub fn is_dispatch_failure(&self) -> bool {
        matches!(self, NotifyError::Http(_) | NotifyError::Status { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_by_status() {
        let server = NotifyError::Status {
            status: 502,
            body: String::new(),
        };
        let throttled = NotifyError::Status {
            status: 429,
            body: String::new(),
        };
        let rejected = NotifyError::Status {
            status: 400,
            body: "bad token".into(),
        };
        assert!(server.is_retryable());
        assert!(throttled.is_retryable());
        assert!(!rejected.is_retryable());
        assert!(rejected.is_dispatch_failure());
    }

    #[test]
    fn build_errors_are_final() {
        let err = NotifyError::UnsupportedPlatform {
            platform: "windows".into(),
        };
        assert!(!err.is_retryable());
        assert!(!err.is_dispatch_failure());
        assert!(!NotifyError::MissingConfig("notify.ios_topic").is_retryable());
    }
}
