use crate::error::CommonError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Coarse lifecycle state of a pod, as reported by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    /// Interpret the `status.phase` field of a pod object.
    ///
    /// A freshly created pod has no status yet and counts as pending.
    /// Phases this client does not know about are reported as unknown.
    pub fn from_status(phase: Option<&str>) -> Self {
        match phase {
            None => PodPhase::Pending,
            Some(value) => value.parse().unwrap_or(PodPhase::Unknown),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PodPhase::Pending => "Pending",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
            PodPhase::Unknown => "Unknown",
        }
    }

    /// True once the pod will not make any further progress
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PodPhase::Succeeded | PodPhase::Failed | PodPhase::Unknown
        )
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PodPhase {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(PodPhase::Pending),
            "Running" => Ok(PodPhase::Running),
            "Succeeded" => Ok(PodPhase::Succeeded),
            "Failed" => Ok(PodPhase::Failed),
            "Unknown" => Ok(PodPhase::Unknown),
            other => Err(CommonError::InvalidData(format!(
                "unknown pod phase: {}",
                other
            ))),
        }
    }
}

/// Image pull policy applied to the session container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PullPolicy {
    #[default]
    Always,
    IfNotPresent,
    Never,
}

impl PullPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PullPolicy::Always => "Always",
            PullPolicy::IfNotPresent => "IfNotPresent",
            PullPolicy::Never => "Never",
        }
    }
}

impl fmt::Display for PullPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PullPolicy {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Always" => Ok(PullPolicy::Always),
            "IfNotPresent" => Ok(PullPolicy::IfNotPresent),
            "Never" => Ok(PullPolicy::Never),
            other => Err(CommonError::InvalidData(format!(
                "unknown pull policy: {}",
                other
            ))),
        }
    }
}

/// Parse a JSON object of environment variables, e.g. `{"GREETING":"hi"}`
pub fn parse_env_map(json: &str) -> Result<BTreeMap<String, String>, CommonError> {
    let env: BTreeMap<String, String> = serde_json::from_str(json)?;
    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_phase_from_status() {
        assert_eq!(PodPhase::from_status(None), PodPhase::Pending);
        assert_eq!(PodPhase::from_status(Some("Running")), PodPhase::Running);
        assert_eq!(
            PodPhase::from_status(Some("Succeeded")),
            PodPhase::Succeeded
        );
        assert_eq!(
            PodPhase::from_status(Some("Evicted")),
            PodPhase::Unknown
        );
    }

    #[test]
    fn test_pod_phase_terminal() {
        assert!(!PodPhase::Pending.is_terminal());
        assert!(!PodPhase::Running.is_terminal());
        assert!(PodPhase::Succeeded.is_terminal());
        assert!(PodPhase::Failed.is_terminal());
        assert!(PodPhase::Unknown.is_terminal());
    }

    #[test]
    fn test_pod_phase_serialization() {
        let json = serde_json::to_string(&PodPhase::Succeeded).unwrap();
        assert_eq!(json, "\"Succeeded\"");

        let phase: PodPhase = serde_json::from_str("\"Failed\"").unwrap();
        assert_eq!(phase, PodPhase::Failed);
    }

    #[test]
    fn test_pull_policy_default_and_parse() {
        assert_eq!(PullPolicy::default(), PullPolicy::Always);
        assert_eq!(
            "IfNotPresent".parse::<PullPolicy>().unwrap(),
            PullPolicy::IfNotPresent
        );
        assert_eq!(PullPolicy::Never.to_string(), "Never");

        let err = "Sometimes".parse::<PullPolicy>().unwrap_err();
        assert!(err.to_string().contains("Sometimes"));
    }

    #[test]
    fn test_parse_env_map() {
        let env = parse_env_map(r#"{"GREETING":"hi","EMPTY":""}"#).unwrap();
        assert_eq!(env.len(), 2);
        assert_eq!(env.get("GREETING"), Some(&"hi".to_string()));
        assert_eq!(env.get("EMPTY"), Some(&String::new()));
    }

    #[test]
    fn test_parse_env_map_rejects_non_strings() {
        let result = parse_env_map(r#"{"COUNT":3}"#);
        assert!(matches!(result, Err(CommonError::Serialization(_))));
    }
}
