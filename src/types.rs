//! Domain types shared across the agent.
//!
//! The Dokploy-facing types are serialised with [`serde`](https://serde.rs/)
//! and match the wire shape of the TRPC API (camelCase fields, swarm network
//! entries with PascalCase keys). Docker-facing state uses the bollard
//! models directly and never passes through here.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Marks a service as created and owned by this agent.
pub const MANAGED_LABEL: &str = "autoswarm.managed";
/// Opts a container out of conversion entirely. Wins over everything else.
pub const IGNORED_LABEL: &str = "autoswarm.ignore";
/// Records the name of the container a service was converted from.
pub const SOURCE_LABEL: &str = "autoswarm.source";
/// Required on every reconciled service so Traefik picks it up.
pub const TRAEFIK_ENABLE_LABEL: &str = "traefik.enable";

/// Label keys that mark a container as already owned by an orchestrator.
const ORCHESTRATED_KEYS: [&str; 4] = [
    "com.docker.swarm.service.name",
    "com.docker.swarm.task",
    "com.docker.compose.project",
    MANAGED_LABEL,
];

/// Docker identifier grammar allows 63 characters for a service name.
const MAX_SERVICE_NAME_LEN: usize = 63;

/// An application record owned by the metadata store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Application {
    pub application_id: String,
    pub app_name: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub labels_swarm: HashMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub network_swarm: Vec<SwarmNetwork>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<DomainEntry>,
}

/// One desired network attachment. Uniqueness is by `target`; order and
/// aliases never participate in comparisons.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwarmNetwork {
    #[serde(rename = "Target")]
    pub target: String,
    #[serde(rename = "Aliases", skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
}

impl SwarmNetwork {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            aliases: None,
        }
    }
}

/// A domain entry attached to an application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DomainEntry {
    pub domain_id: String,
    pub host: String,
    pub domain_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique_config_key: Option<i64>,
}

impl DomainEntry {
    /// Sort key used when picking the primary domain among several.
    /// Timestamps win over config keys; config keys compare numerically,
    /// not as strings.
    pub fn ordering_key(&self) -> (Option<&str>, Option<i64>) {
        (self.created_at.as_deref(), self.unique_config_key)
    }
}

/// Result of comparing a service's live configuration against its desired
/// configuration. A field is `Some` only when it differs, carrying the
/// replacement value. An all-empty report means no write is issued.
#[derive(Debug, Clone, Default)]
pub struct DriftReport {
    pub labels: Option<HashMap<String, String>>,
    pub networks: Option<Vec<SwarmNetwork>>,
    pub rules: Option<HashMap<String, String>>,
}

impl DriftReport {
    pub fn is_clean(&self) -> bool {
        self.labels.is_none() && self.networks.is_none() && self.rules.is_none()
    }
}

/// Whether a container is already owned by swarm, compose, or this agent.
pub fn is_orchestrated(labels: Option<&HashMap<String, String>>) -> bool {
    match labels {
        Some(labels) => ORCHESTRATED_KEYS.iter().any(|key| labels.contains_key(*key)),
        None => false,
    }
}

/// Whether a container carries the ignore sentinel. Ignore wins over
/// managed: an ignored container is never touched even if mislabelled.
pub fn is_ignored(labels: Option<&HashMap<String, String>>) -> bool {
    labels
        .and_then(|l| l.get(IGNORED_LABEL))
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Derives a swarm-legal service name from a container's name.
///
/// Alphanumerics are lowercased, `-` and `_` pass through, everything else
/// becomes `-`. Leading/trailing hyphens are stripped and the result is
/// clamped to the identifier length limit. A container with no usable name
/// falls back to an id-derived name so the result is never empty.
pub fn derive_service_name(raw_name: &str, container_id: &str) -> String {
    let raw = raw_name.trim_start_matches('/');
    let source = if raw.is_empty() {
        &container_id[..container_id.len().min(12)]
    } else {
        raw
    };

    let mut name: String = source
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else if c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    name = name.trim_matches('-').to_string();
    name.truncate(MAX_SERVICE_NAME_LEN);

    if name.is_empty() {
        format!("autoswarm-{}", &container_id[..container_id.len().min(8)])
    } else {
        name
    }
}

/// A reproducible suffix for service-name collisions.
///
/// Hashing the raw (pre-sanitisation) name means two distinct container
/// names that sanitise to the same string get distinct, stable service
/// names, while re-converting the same container always yields the same
/// result.
pub fn collision_suffix(raw_name: &str) -> String {
    let digest = Sha256::digest(raw_name.as_bytes());
    hex::encode(&digest[..3])
}
