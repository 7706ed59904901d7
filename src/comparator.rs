//! Decides whether a service's live configuration satisfies its desired
//! configuration, tolerating representation variance in the Swarm API.

use std::collections::{HashMap, HashSet};

use bollard::models::{NetworkAttachmentConfig, ServiceSpec};

use crate::rules;
use crate::types::{DriftReport, SwarmNetwork};

/// Desired state for one service, computed by the reconciler from the
/// metadata store.
#[derive(Debug, Clone, Default)]
pub struct DesiredState {
    pub labels: HashMap<String, String>,
    pub networks: Vec<SwarmNetwork>,
    /// Router label key to canonical rule value.
    pub rules: HashMap<String, String>,
}

/// The one place that reads a service's network attachments.
///
/// Swarm reports attachments in two locations depending on timing: a
/// freshly submitted spec carries them at the top level, while a converged
/// service moves them under the task template. Reading the task template
/// first, falling back to the top level, yields the effective set either
/// way. Callers must not reimplement this fallback.
pub fn effective_networks(spec: &ServiceSpec) -> &[NetworkAttachmentConfig] {
    let task_networks = spec
        .task_template
        .as_ref()
        .and_then(|t| t.networks.as_deref());
    match task_networks {
        Some(nets) if !nets.is_empty() => nets,
        _ => spec.networks.as_deref().unwrap_or(&[]),
    }
}

/// Desired labels must be a subset of current labels; keys outside the
/// desired set (operator- or swarm-injected) never count as drift.
fn labels_match(current: &HashMap<String, String>, desired: &HashMap<String, String>) -> bool {
    desired
        .iter()
        .all(|(key, value)| current.get(key) == Some(value))
}

fn network_targets(networks: &[NetworkAttachmentConfig]) -> HashSet<&str> {
    networks
        .iter()
        .filter_map(|n| n.target.as_deref())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Set equality by target id; aliases and ordering are irrelevant. An
/// empty desired set expresses no opinion and never counts as drift:
/// with nothing to attach there is nothing an update could converge to.
fn networks_match(current: &[NetworkAttachmentConfig], desired: &[SwarmNetwork]) -> bool {
    if desired.is_empty() {
        return true;
    }
    let desired_targets: HashSet<&str> = desired.iter().map(|n| n.target.as_str()).collect();
    network_targets(current) == desired_targets
}

/// Both sides are normalised before comparison so quoting and spacing
/// variants of the same rule never register as drift.
fn rules_match(current: &HashMap<String, String>, desired: &HashMap<String, String>) -> bool {
    desired.iter().all(|(key, value)| {
        current
            .get(key)
            .map(|cur| rules::normalize(cur) == rules::normalize(value))
            .unwrap_or(false)
    })
}

/// Compares one service's live spec against its desired state.
///
/// Each differing field carries the full replacement value so the caller
/// can issue a single combined update.
pub fn compare(spec: &ServiceSpec, desired: &DesiredState) -> DriftReport {
    let empty = HashMap::new();
    let current_labels = spec.labels.as_ref().unwrap_or(&empty);

    let mut report = DriftReport::default();
    if !labels_match(current_labels, &desired.labels) {
        report.labels = Some(desired.labels.clone());
    }
    if !networks_match(effective_networks(spec), &desired.networks) {
        report.networks = Some(desired.networks.clone());
    }
    if !rules_match(current_labels, &desired.rules) {
        report.rules = Some(desired.rules.clone());
    }
    report
}
