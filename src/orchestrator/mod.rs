//! Seam between the engine and the container orchestrator.
//!
//! The engine only ever talks to the [`Orchestrator`] trait so tests can
//! substitute an in-memory fake; [`DockerOrchestrator`] is the production
//! implementation over the local Docker daemon.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::models::{ContainerInspectResponse, ContainerSummary, EventMessage, Service, ServiceSpec};
use futures_util::stream::BoxStream;

use crate::errors::Result;

pub mod docker;
pub use docker::DockerOrchestrator;

/// What the cluster knows about one network.
#[derive(Debug, Clone)]
pub struct NetworkInfo {
    pub id: String,
    pub driver: Option<String>,
}

#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspectResponse>;

    async fn list_services(&self) -> Result<Vec<Service>>;

    /// Exact-name lookup; `Ok(None)` when the service does not exist.
    async fn find_service(&self, name: &str) -> Result<Option<Service>>;

    /// Returns the created service's id.
    async fn create_service(&self, spec: ServiceSpec) -> Result<String>;

    /// Optimistic update against the given version index; a version
    /// conflict surfaces as a transient error and is retried next cycle.
    async fn update_service(&self, name: &str, version: u64, spec: ServiceSpec) -> Result<()>;

    async fn stop_container(&self, id: &str) -> Result<()>;

    async fn remove_container(&self, id: &str) -> Result<()>;

    /// Container create/start lifecycle events. The stream is not
    /// restartable: a fresh subscription yields only future events.
    fn subscribe_events(&self) -> BoxStream<'_, Result<EventMessage>>;

    /// Snapshot of cluster networks, keyed by name.
    async fn list_networks(&self) -> Result<HashMap<String, NetworkInfo>>;

    /// Resolves a network name to its id, `Ok(None)` when absent.
    async fn resolve_network(&self, name: &str) -> Result<Option<String>>;

    /// Swarm node id of the local daemon.
    async fn node_id(&self) -> Result<String>;
}
