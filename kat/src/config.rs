use crate::error::ConfigError;
use common::{parse_env_map, PullPolicy};
use std::collections::BTreeMap;
use std::env;

pub const DEFAULT_NAMESPACE: &str = "default";

/// Inputs describing the pod a session runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub namespace: String,
    pub image: String,
    pub pull_policy: PullPolicy,
    pub env: BTreeMap<String, String>,
    /// Attach with a terminal; stderr is then merged into stdout
    pub tty: bool,
}

impl SessionConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            image: image.into(),
            pull_policy: PullPolicy::default(),
            env: BTreeMap::new(),
            tty: false,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.image.is_empty() {
            return Err(ConfigError::EmptyImage);
        }
        if self.namespace.is_empty() {
            return Err(ConfigError::EmptyNamespace);
        }
        if let Some(key) = self.env.keys().find(|k| k.is_empty() || k.contains('=')) {
            return Err(ConfigError::InvalidEnvName(key.clone()));
        }
        Ok(())
    }
}

/// Process configuration for the `kat` binary
#[derive(Debug, Clone)]
pub struct Config {
    pub session: SessionConfig,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let image = env::var("KAT_IMAGE").map_err(|_| anyhow::anyhow!("KAT_IMAGE is not set"))?;

        let mut session = SessionConfig::new(image);
        session.namespace =
            env::var("KAT_NAMESPACE").unwrap_or_else(|_| DEFAULT_NAMESPACE.to_string());
        session.pull_policy = env::var("KAT_PULL_POLICY")
            .unwrap_or_else(|_| "Always".to_string())
            .parse()?;
        session.env = parse_env_map(&env::var("KAT_ENV").unwrap_or_else(|_| "{}".to_string()))?;
        session.tty = env::var("KAT_TTY")
            .unwrap_or_else(|_| "false".to_string())
            .parse()?;
        session.validate()?;

        Ok(Self {
            session,
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        })
    }
}
