//! Conversion and reconciliation engine.
//!
//! Converges the swarm toward two sources of truth at once: standalone
//! containers become managed services, and managed services are aligned
//! with the desired state computed from the metadata store. Information
//! flows both ways: drifted services are corrected in the cluster, and
//! facts the cluster discovered (resolved network ids, observed hosts) are
//! backfilled into the store.

use std::collections::HashMap;
use std::sync::Arc;

use bollard::models::{NetworkAttachmentConfig, Service, ServiceSpec};
use log::{debug, error, info, warn};

use crate::comparator::{self, DesiredState};
use crate::errors::{Result, SyncError};
use crate::metadata::MetadataStore;
use crate::orchestrator::Orchestrator;
use crate::rules;
use crate::spec_builder::build_service_spec;
use crate::types::{
    collision_suffix, is_ignored, is_orchestrated, Application, DomainEntry, SwarmNetwork,
    MANAGED_LABEL, SOURCE_LABEL, TRAEFIK_ENABLE_LABEL,
};

/// Store-side facts the cluster knows better; written back best-effort.
#[derive(Debug, Default)]
struct Backfill {
    labels: Option<HashMap<String, String>>,
    networks: Option<Vec<SwarmNetwork>>,
    domain: Option<(String, String)>,
}

pub struct Reconciler {
    orchestrator: Arc<dyn Orchestrator>,
    metadata: Arc<dyn MetadataStore>,
    ingress_network: String,
    ingress_network_id: Option<String>,
    local_node_id: String,
}

impl Reconciler {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        metadata: Arc<dyn MetadataStore>,
        ingress_network: String,
        ingress_network_id: Option<String>,
        local_node_id: String,
    ) -> Self {
        Self {
            orchestrator,
            metadata,
            ingress_network,
            ingress_network_id,
            local_node_id,
        }
    }

    /// Converts one standalone container into a managed service.
    ///
    /// Returns the created service name, or `None` when there was nothing
    /// to do (vanished, ignored, already orchestrated, already converted).
    /// The source container is stopped and removed only after the service
    /// exists; a crash in between leaves a duplicate, never a gap.
    pub async fn convert(&self, container_id: &str) -> Result<Option<String>> {
        let container = match self.orchestrator.inspect_container(container_id).await {
            Ok(container) => container,
            Err(SyncError::NotFound { .. }) => return Ok(None),
            Err(err) => return Err(err),
        };

        let labels = container.config.as_ref().and_then(|c| c.labels.as_ref());
        let raw_name = container
            .name
            .as_deref()
            .unwrap_or("")
            .trim_start_matches('/')
            .to_string();
        if is_ignored(labels) {
            info!("Ignoring container '{raw_name}' due to {}", crate::types::IGNORED_LABEL);
            return Ok(None);
        }
        if is_orchestrated(labels) {
            return Ok(None);
        }

        let known_networks = self.orchestrator.list_networks().await?;
        let mut spec = build_service_spec(
            &container,
            &known_networks,
            &self.ingress_network,
            &self.local_node_id,
        )?;

        let Some(service_name) = self
            .assign_service_name(spec.name.clone().unwrap_or_default(), &raw_name)
            .await?
        else {
            return Ok(None);
        };
        spec.name = Some(service_name.clone());

        let image = spec
            .task_template
            .as_ref()
            .and_then(|t| t.container_spec.as_ref())
            .and_then(|c| c.image.clone())
            .unwrap_or_default();
        info!("Creating swarm service '{service_name}' from container '{raw_name}' (image={image}).");
        self.orchestrator.create_service(spec).await?;

        // Service exists from here on; container teardown is best-effort.
        if let Err(err) = self.orchestrator.stop_container(container_id).await {
            warn!("Failed to stop container '{raw_name}': {err}");
        }
        if let Err(err) = self.orchestrator.remove_container(container_id).await {
            warn!("Failed to remove container '{raw_name}': {err}");
        }

        if let Err(err) = self.reconcile_by_name(&service_name).await {
            warn!("Post-conversion reconciliation of '{service_name}' failed: {err}");
        }
        Ok(Some(service_name))
    }

    /// Picks a free, stable service name for a conversion. Repeated
    /// conversions of the same container land on the same name; a clash
    /// with an unrelated service gets a reproducible hash suffix.
    async fn assign_service_name(
        &self,
        candidate: String,
        raw_name: &str,
    ) -> Result<Option<String>> {
        for name in [candidate.clone(), format!("{candidate}-{}", collision_suffix(raw_name))] {
            match self.orchestrator.find_service(&name).await? {
                None => return Ok(Some(name)),
                Some(existing) => {
                    let source = existing
                        .spec
                        .as_ref()
                        .and_then(|s| s.labels.as_ref())
                        .and_then(|l| l.get(SOURCE_LABEL));
                    if source.map(String::as_str) == Some(raw_name) {
                        debug!("Container '{raw_name}' already converted to service '{name}'.");
                        return Ok(None);
                    }
                }
            }
        }
        warn!("No free service name for container '{raw_name}'; skipping conversion.");
        Ok(None)
    }

    /// On startup, walk existing containers and convert anything unmanaged.
    pub async fn initial_sweep(&self) -> Result<()> {
        info!("Performing initial sweep of standalone containers.");
        for container in self.orchestrator.list_containers().await? {
            let Some(id) = container.id else { continue };
            if is_orchestrated(container.labels.as_ref()) || is_ignored(container.labels.as_ref())
            {
                continue;
            }
            if let Err(err) = self.convert(&id).await {
                error!("Failed to convert container '{id}': {err}");
            }
        }
        Ok(())
    }

    /// Reconciles one service against its application record, if any.
    pub async fn reconcile_by_name(&self, service_name: &str) -> Result<()> {
        if !self.metadata.is_enabled() {
            return Ok(());
        }
        let Some(application) = self.metadata.find_application(service_name).await? else {
            debug!("No application mapping found for service '{service_name}'.");
            return Ok(());
        };
        let Some(service) = self.orchestrator.find_service(service_name).await? else {
            debug!("Service '{service_name}' not found during reconciliation.");
            return Ok(());
        };
        self.reconcile_one(&application, &service).await
    }

    /// Converges one service toward its application's desired state and
    /// backfills the store where the cluster knows more.
    pub async fn reconcile_one(&self, application: &Application, service: &Service) -> Result<()> {
        let Some(current_spec) = service.spec.as_ref() else {
            return Err(SyncError::Transient(format!(
                "service for '{}' has no spec",
                application.app_name
            )));
        };
        let service_name = current_spec
            .name
            .clone()
            .unwrap_or_else(|| application.app_name.clone());
        let empty = HashMap::new();
        let current_labels = current_spec.labels.as_ref().unwrap_or(&empty);

        let (desired, backfill) = self.desired_state(application, current_labels)?;
        let report = comparator::compare(current_spec, &desired);

        if report.is_clean() {
            debug!("Service '{service_name}' already aligned with metadata.");
        } else {
            let version = service
                .version
                .as_ref()
                .and_then(|v| v.index)
                .ok_or_else(|| {
                    SyncError::Transient(format!("service '{service_name}' missing version index"))
                })?;
            let updated = merged_spec(current_spec, &desired);
            self.orchestrator
                .update_service(&service_name, version, updated)
                .await?;
            info!(
                "Updated service '{service_name}' (labels: {}, networks: {}, rules: {}).",
                report.labels.is_some(),
                report.networks.is_some(),
                report.rules.is_some(),
            );
        }

        // Store backfill is independent of the service update; failures
        // here are retried on the next cycle.
        if backfill.labels.is_some() || backfill.networks.is_some() {
            if let Err(err) = self
                .metadata
                .update_application(
                    &application.application_id,
                    backfill.labels.as_ref(),
                    backfill.networks.as_deref(),
                )
                .await
            {
                warn!(
                    "Unable to backfill application '{}': {err}",
                    application.app_name
                );
            }
        }
        if let Some((domain_id, host)) = &backfill.domain {
            if let Err(err) = self.metadata.update_domain(domain_id, host).await {
                warn!("Unable to backfill domain '{domain_id}': {err}");
            }
        }
        Ok(())
    }

    /// Reconciles every application known to the store. One application's
    /// failure never aborts the sweep.
    pub async fn reconcile_all(&self) -> Result<()> {
        if !self.metadata.is_enabled() {
            debug!("Metadata integration disabled; skipping reconciliation sweep.");
            return Ok(());
        }
        let applications = self.metadata.list_applications().await?;
        let services: HashMap<String, Service> = self
            .orchestrator
            .list_services()
            .await?
            .into_iter()
            .filter_map(|service| {
                let name = service.spec.as_ref()?.name.clone()?;
                Some((name, service))
            })
            .collect();

        let mut failures = 0usize;
        for application in &applications {
            if application.app_name.is_empty() {
                continue;
            }
            let Some(service) = services.get(&application.app_name) else {
                debug!(
                    "Application '{}' has no matching swarm service.",
                    application.app_name
                );
                continue;
            };
            if let Err(err) = self.reconcile_one(application, service).await {
                failures += 1;
                error!(
                    "Reconciliation of '{}' failed: {err}",
                    application.app_name
                );
            }
        }
        if failures > 0 {
            warn!("Reconciliation sweep finished with {failures} failure(s).");
        }
        Ok(())
    }

    /// Computes the desired state for one application, plus whatever the
    /// store should learn back from the cluster.
    fn desired_state(
        &self,
        application: &Application,
        current_labels: &HashMap<String, String>,
    ) -> Result<(DesiredState, Backfill)> {
        let mut backfill = Backfill::default();

        // Labels: application labels plus the required sentinels; router
        // rule keys are handled separately below.
        let mut labels: HashMap<String, String> = application
            .labels_swarm
            .iter()
            .filter(|(key, _)| !rules::is_rule_key(key))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert(TRAEFIK_ENABLE_LABEL.to_string(), "true".to_string());

        // The host the router currently serves, from store labels first,
        // falling back to the live service labels.
        let observed_host = application
            .labels_swarm
            .iter()
            .chain(current_labels.iter())
            .filter(|(key, _)| rules::is_rule_key(key))
            .find_map(|(_, value)| rules::host_of(value));

        let rules = self.desired_rules(application, observed_host.as_deref(), &mut backfill)?;

        // Networks: the application's own plus the ingress network, which
        // is always attached when it resolves.
        let mut networks: Vec<SwarmNetwork> = application
            .network_swarm
            .iter()
            .filter(|net| !net.target.is_empty())
            .cloned()
            .collect();
        match &self.ingress_network_id {
            Some(ingress_id) => {
                if !networks.iter().any(|net| &net.target == ingress_id) {
                    networks.push(SwarmNetwork::new(ingress_id.clone()));
                    backfill.networks = Some(networks.clone());
                }
            }
            None => {
                if !self.ingress_network.is_empty() {
                    warn!(
                        "Ingress network '{}' unresolved; skipping auto-attach.",
                        self.ingress_network
                    );
                }
            }
        }

        Ok((DesiredState { labels, networks, rules }, backfill))
    }

    /// Builds the desired router rules: one host predicate per
    /// application-type domain, primary domain first, unioned into the
    /// router's rule label.
    fn desired_rules(
        &self,
        application: &Application,
        observed_host: Option<&str>,
        backfill: &mut Backfill,
    ) -> Result<HashMap<String, String>> {
        let store_rule_keys: Vec<&String> = application
            .labels_swarm
            .keys()
            .filter(|key| rules::is_rule_key(key))
            .collect();

        let primary = choose_primary_domain(&application.domains, observed_host);
        let mut hosts: Vec<String> = Vec::new();
        if let Some(primary) = &primary {
            if primary.host.is_empty() {
                // The store has a domain entry but never learned its host;
                // adopt the observed one if the cluster has it.
                match observed_host {
                    Some(host) => {
                        backfill.domain = Some((primary.domain_id.clone(), host.to_string()));
                        hosts.push(host.to_string());
                    }
                    None => {
                        return Err(SyncError::configuration(
                            &application.app_name,
                            "domain entry has no host and none is observable",
                        ))
                    }
                }
            } else {
                hosts.push(primary.host.clone());
            }
            for domain in &application.domains {
                if domain.domain_type == "application"
                    && !domain.host.is_empty()
                    && !hosts.contains(&domain.host)
                {
                    hosts.push(domain.host.clone());
                }
            }
        }

        let mut rules_map = HashMap::new();
        if hosts.is_empty() {
            if !store_rule_keys.is_empty() {
                return Err(SyncError::configuration(
                    &application.app_name,
                    "router rule configured but domain list is empty",
                ));
            }
            return Ok(rules_map);
        }

        let value = rules::normalize(
            &hosts
                .iter()
                .map(|host| rules::rule_for_host(host))
                .collect::<Vec<_>>()
                .join(" || "),
        );

        if store_rule_keys.is_empty() {
            rules_map.insert(rules::rule_key_for(&application.app_name), value);
        } else {
            let mut store_changed = false;
            for key in store_rule_keys {
                let stored = &application.labels_swarm[key];
                if rules::normalize(stored) != value {
                    store_changed = true;
                }
                rules_map.insert(key.clone(), value.clone());
            }
            if store_changed {
                let mut store_labels = application.labels_swarm.clone();
                for (key, rule) in &rules_map {
                    store_labels.insert(key.clone(), rule.clone());
                }
                backfill.labels = Some(store_labels);
            }
        }
        Ok(rules_map)
    }
}

/// Primary domain selection: a domain matching the host the router already
/// serves wins; otherwise the newest application-type domain.
fn choose_primary_domain(
    domains: &[DomainEntry],
    observed_host: Option<&str>,
) -> Option<DomainEntry> {
    if let Some(host) = observed_host {
        if let Some(found) = domains.iter().find(|d| d.host == host) {
            return Some(found.clone());
        }
    }
    domains
        .iter()
        .filter(|d| d.domain_type == "application")
        .max_by(|a, b| a.ordering_key().cmp(&b.ordering_key()))
        .cloned()
}

/// One combined update carrying every corrected field together. Labels are
/// merged over the current ones so operator-added keys survive; networks
/// are replaced with the desired set; container labels follow the service
/// labels so Traefik sees the rules wherever it reads them.
fn merged_spec(current: &ServiceSpec, desired: &DesiredState) -> ServiceSpec {
    let mut spec = current.clone();

    let mut labels = current.labels.clone().unwrap_or_default();
    for (key, value) in desired.labels.iter().chain(desired.rules.iter()) {
        labels.insert(key.clone(), value.clone());
    }
    spec.labels = Some(labels.clone());

    let attachments: Vec<NetworkAttachmentConfig> = desired
        .networks
        .iter()
        .map(|net| NetworkAttachmentConfig {
            target: Some(net.target.clone()),
            aliases: net.aliases.clone(),
            ..Default::default()
        })
        .collect();

    let mut task_template = spec.task_template.take().unwrap_or_default();
    let mut container_spec = task_template.container_spec.take().unwrap_or_default();
    let mut container_labels = container_spec.labels.take().unwrap_or_default();
    for (key, value) in desired.labels.iter().chain(desired.rules.iter()) {
        container_labels.insert(key.clone(), value.clone());
    }
    container_spec.labels = Some(container_labels);
    task_template.container_spec = Some(container_spec);
    if !attachments.is_empty() {
        task_template.networks = Some(attachments.clone());
        spec.networks = Some(attachments);
    }
    spec.task_template = Some(task_template);
    spec
}
