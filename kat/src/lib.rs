pub mod config;
pub mod error;
pub mod kube;
pub mod pod;
pub mod session;
mod stdio;
pub mod watch;

// Re-exports for convenience
pub use config::{Config, SessionConfig};
pub use error::{AttachError, ConfigError, KubeError, StartError, StopError, WaitError};
pub use pod::PodIdentity;
pub use session::{Completion, Session};
pub use stdio::detached_reader;
