//! Error taxonomy for the monitoring engine
//!
//! - `TunnelError`: jumphost forward could not be set up (fatal to one target)
//! - `FetchError`: one telemetry call failed (classified retryable or not)
//! - `CollectionError`: a sample was skipped after the retry budget or on a contract failure
//! - `TargetError`: why a target ended `partial` or `failed`

/// Jumphost forward setup failures
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("failed to launch tunnel to {jumphost}: {source}")]
    Spawn {
        jumphost: String,
        #[source]
        source: std::io::Error,
    },

    #[error("authentication to {jumphost} failed: {detail}")]
    Auth { jumphost: String, detail: String },

    #[error("forward through {jumphost} not established: {detail}")]
    Forward { jumphost: String, detail: String },

    #[error("no free local port for tunnel: {0}")]
    LocalPort(#[source] std::io::Error),
}

/// Successful response that does not match the Redfish power schema
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed telemetry response: {0}")]
pub struct ContractError(pub String);

/// Single telemetry call failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error(transparent)]
    Contract(#[from] ContractError),
}

impl FetchError {
    /// Connection, timeout and non-success status failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchError::Contract(_))
    }
}

/// A sample that could not be collected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollectionError {
    #[error("gave up after {attempts} attempts: {last_cause}")]
    Exhausted { attempts: u32, last_cause: FetchError },

    #[error(transparent)]
    Contract(#[from] ContractError),
}

impl CollectionError {
    pub fn attempts(&self) -> u32 {
        match self {
            CollectionError::Exhausted { attempts, .. } => *attempts,
            CollectionError::Contract(_) => 1,
        }
    }
}

/// Reason attached to a non-`ok` target
#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error(transparent)]
    Collection(#[from] CollectionError),

    #[error("monitoring interrupted")]
    Interrupted,

    #[error("monitoring task aborted: {0}")]
    Aborted(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(FetchError::Transport("connection refused".into()).is_retryable());
        assert!(FetchError::Status { status: 503, url: "https://x/redfish/v1/Chassis".into() }.is_retryable());
        assert!(!FetchError::Contract(ContractError("no chassis".into())).is_retryable());
    }

    #[test]
    fn test_messages() {
        let err = CollectionError::Exhausted {
            attempts: 3,
            last_cause: FetchError::Transport("timed out".into()),
        };
        assert_eq!(err.to_string(), "gave up after 3 attempts: transport error: timed out");

        let target: TargetError = TunnelError::Auth {
            jumphost: "bastion".into(),
            detail: "Permission denied (publickey)".into(),
        }
        .into();
        assert!(target.to_string().contains("authentication to bastion failed"));
    }
}
