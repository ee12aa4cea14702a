use common::PodPhase;
use std::fmt;
use std::io;
use thiserror::Error;

pub type KubeResult<T> = Result<T, KubeError>;

/// Errors reported by the orchestrator boundary
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KubeError {
    #[error("Kubernetes API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Pod not found: {name}")]
    NotFound { name: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Connection upgrade refused: {0}")]
    Upgrade(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Stream error: {0}")]
    Stream(String),
}

impl From<kube::Error> for KubeError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(response) => KubeError::Api {
                code: response.code,
                message: response.message,
            },
            kube::Error::BuildRequest(e) => KubeError::InvalidRequest(e.to_string()),
            kube::Error::UpgradeConnection(e) => KubeError::Upgrade(e.to_string()),
            other => KubeError::Connection(other.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to create Kubernetes client: {0}")]
    Client(String),

    #[error("Image must not be empty")]
    EmptyImage,

    #[error("Namespace must not be empty")]
    EmptyNamespace,

    #[error("Invalid environment variable name: {0:?}")]
    InvalidEnvName(String),
}

#[derive(Error, Debug)]
pub enum StartError {
    #[error("Session already started")]
    AlreadyStarted,

    #[error("Invalid session configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Pod {name} was rejected: {source}")]
    CreateRejected { name: String, source: KubeError },

    #[error("Watch on pod {name} failed: {source}")]
    Watch { name: String, source: KubeError },

    #[error("Pod {name} failed")]
    PodFailed { name: String },

    #[error("Failed to connect to pod {name}")]
    ConnectionLost { name: String },

    #[error("Watch on pod {name} closed before the pod was ready")]
    WatchClosed { name: String },

    #[error("Start of pod {name} was cancelled")]
    Cancelled { name: String },
}

/// One of the three stdio channels carried by an attach stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Stdin,
    Stdout,
    Stderr,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Channel::Stdin => "stdin",
            Channel::Stdout => "stdout",
            Channel::Stderr => "stderr",
        })
    }
}

#[derive(Error, Debug)]
pub enum AttachError {
    #[error("Session has not been started")]
    NotStarted,

    #[error("Session is already attached")]
    AlreadyAttached,

    #[error("Attach negotiation with pod {name} failed: {source}")]
    NegotiationFailed { name: String, source: KubeError },

    #[error("Attach transport to pod {name} failed: {source}")]
    TransportFailed { name: String, source: KubeError },

    #[error("I/O error on {channel}: {source}")]
    StreamIo { channel: Channel, source: io::Error },

    #[error("Attach was cancelled")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum WaitError {
    #[error("Session has not been started")]
    NotStarted,

    #[error("Pod {name} finished in phase {phase}")]
    PodFailed { name: String, phase: PodPhase },

    #[error("Watch on pod {name} failed: {source}")]
    Watch { name: String, source: KubeError },

    #[error("Watch on pod {name} closed without the pod being observed")]
    WatchClosed { name: String },

    #[error("Wait on pod {name} was cancelled")]
    Cancelled { name: String },

    #[error("Wait task ended without a result")]
    Abandoned,
}

#[derive(Error, Debug)]
pub enum StopError {
    #[error("Session has not been started")]
    NotStarted,

    #[error("Pod not found: {name}")]
    NotFound { name: String },

    #[error("Failed to delete pod {name}: {source}")]
    TransportFailed { name: String, source: KubeError },
}

/// Ways a phase watch can end without reaching a decision
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Failed to open watch: {0}")]
    Open(KubeError),

    #[error("Watch stream error: {0}")]
    Stream(KubeError),

    #[error("Watch closed")]
    Closed,

    #[error("Watch cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_kube_error_from_api_response() {
        let err: KubeError = kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "pods \"kat-1\" is forbidden".to_string(),
            reason: "Forbidden".to_string(),
            code: 403,
        })
        .into();

        assert_eq!(
            err,
            KubeError::Api {
                code: 403,
                message: "pods \"kat-1\" is forbidden".to_string(),
            }
        );
    }

    #[test]
    fn test_start_error_keeps_source() {
        let err = StartError::CreateRejected {
            name: "kat-1".to_string(),
            source: KubeError::Api {
                code: 422,
                message: "invalid image".to_string(),
            },
        };

        assert!(err.to_string().contains("kat-1"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_wait_error_carries_phase() {
        let failed = WaitError::PodFailed {
            name: "kat-1".to_string(),
            phase: PodPhase::Failed,
        };
        let unknown = WaitError::PodFailed {
            name: "kat-1".to_string(),
            phase: PodPhase::Unknown,
        };

        assert_eq!(failed.to_string(), "Pod kat-1 finished in phase Failed");
        assert_eq!(unknown.to_string(), "Pod kat-1 finished in phase Unknown");
    }

    #[test]
    fn test_stream_io_names_channel() {
        let err = AttachError::StreamIo {
            channel: Channel::Stderr,
            source: io::Error::new(io::ErrorKind::BrokenPipe, "closed"),
        };
        assert_eq!(err.to_string(), "I/O error on stderr: closed");
    }
}
