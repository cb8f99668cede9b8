use shared::error::{ApiException, ErrorCode};
use thiserror::Error;

/// Failure taxonomy of the synchronization core.
///
/// Only `SendRejected` reaches the user (the message flips to `Failed` and
/// waits for a manual resend). `TransportUnavailable` feeds the connectivity
/// recovery path and `SubscriptionFailed` is healed silently by the periodic
/// health check and `recover_all`.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
    #[error("send rejected: {0}")]
    SendRejected(String),
    #[error("subscription failed for topic {topic}: {reason}")]
    SubscriptionFailed { topic: String, reason: String },
}

/// Classify a failed send so the pipeline can decide between the recovery
/// path and the user-facing `Failed` state.
pub fn classify_send_error(err: &anyhow::Error) -> SyncError {
    if let Some(api) = err.downcast_ref::<ApiException>() {
        return match api.code {
            ErrorCode::Unavailable => SyncError::TransportUnavailable(api.message.clone()),
            _ => SyncError::SendRejected(api.message.clone()),
        };
    }
    if let Some(req) = err.downcast_ref::<reqwest::Error>() {
        if req.is_connect() || req.is_timeout() || req.is_request() {
            return SyncError::TransportUnavailable(req.to_string());
        }
    }
    SyncError::SendRejected(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn api_rejections_classify_as_send_rejected() {
        let err = anyhow::Error::new(ApiException::new(ErrorCode::Validation, "empty body"));
        assert!(matches!(
            classify_send_error(&err),
            SyncError::SendRejected(_)
        ));
    }

    #[test]
    fn unavailable_code_classifies_as_transport() {
        let err = anyhow::Error::new(ApiException::new(ErrorCode::Unavailable, "maintenance"));
        assert!(matches!(
            classify_send_error(&err),
            SyncError::TransportUnavailable(_)
        ));
    }

    #[test]
    fn opaque_errors_default_to_send_rejected() {
        let err = anyhow!("something odd");
        assert!(matches!(
            classify_send_error(&err),
            SyncError::SendRejected(_)
        ));
    }
}
