use crate::config::SessionConfig;
use k8s_openapi::api::core::v1::{Container, EnvVar, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use rand::Rng;
use std::collections::BTreeMap;

/// Name of the single container in every session pod
pub const CONTAINER_NAME: &str = "kat";

/// Name and namespace of the pod owned by a session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PodIdentity {
    pub name: String,
    pub namespace: String,
}

impl PodIdentity {
    /// Fresh identity with a random 128-bit name, valid both as a pod name
    /// and as a label key.
    pub fn generate(namespace: &str) -> Self {
        let token: u128 = rand::thread_rng().gen();
        Self {
            name: format!("kat-{:032x}", token),
            namespace: namespace.to_string(),
        }
    }

    /// Label selector matching only this pod
    pub fn selector(&self) -> &str {
        &self.name
    }
}

/// Pod manifest for a session: one container with stdin open, no restarts
pub fn build_pod(identity: &PodIdentity, config: &SessionConfig) -> Pod {
    let env = config
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect();

    Pod {
        metadata: ObjectMeta {
            name: Some(identity.name.clone()),
            namespace: Some(identity.namespace.clone()),
            labels: Some(BTreeMap::from([(
                identity.name.clone(),
                identity.name.clone(),
            )])),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: CONTAINER_NAME.to_string(),
                image: Some(config.image.clone()),
                image_pull_policy: Some(config.pull_policy.to_string()),
                env: Some(env),
                stdin: Some(true),
                stdin_once: Some(true),
                tty: Some(config.tty),
                ..Default::default()
            }],
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}
