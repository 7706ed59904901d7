use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{ListContainersOptions, RemoveContainerOptions, StopContainerOptions};
use bollard::models::{
    ContainerInspectResponse, ContainerSummary, EventMessage, Service, ServiceSpec,
};
use bollard::network::ListNetworksOptions;
use bollard::service::{ListServicesOptions, UpdateServiceOptions};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;

use super::{NetworkInfo, Orchestrator};
use crate::errors::{Result, SyncError};

/// Production orchestrator over the local Docker daemon.
pub struct DockerOrchestrator {
    docker: Docker,
}

impl DockerOrchestrator {
    /// Connects to the local Docker daemon using default settings.
    /// This handles unix socket on Linux.
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl Orchestrator for DockerOrchestrator {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        let opts = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        Ok(self.docker.list_containers(Some(opts)).await?)
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspectResponse> {
        Ok(self.docker.inspect_container(id, None).await?)
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        let opts = ListServicesOptions::<String>::default();
        Ok(self.docker.list_services(Some(opts)).await?)
    }

    async fn find_service(&self, name: &str) -> Result<Option<Service>> {
        match self.docker.inspect_service(name, None).await {
            Ok(service) => Ok(Some(service)),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn create_service(&self, spec: ServiceSpec) -> Result<String> {
        let response = self.docker.create_service(spec, None).await?;
        response
            .id
            .ok_or_else(|| SyncError::Transient("service create returned no id".into()))
    }

    async fn update_service(&self, name: &str, version: u64, spec: ServiceSpec) -> Result<()> {
        let opts = UpdateServiceOptions {
            version,
            ..Default::default()
        };
        self.docker.update_service(name, spec, opts, None).await?;
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        self.docker
            .stop_container(id, Some(StopContainerOptions { t: 5 }))
            .await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.docker
            .remove_container(id, None::<RemoveContainerOptions>)
            .await?;
        Ok(())
    }

    fn subscribe_events(&self) -> BoxStream<'_, Result<EventMessage>> {
        let opts = EventsOptions::<String> {
            filters: [
                ("type", ["container"].as_slice()),
                ("event", ["create", "start"].as_slice()),
            ]
            .iter()
            .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
            .collect(),
            ..Default::default()
        };
        self.docker
            .events(Some(opts))
            .map(|item| item.map_err(Into::into))
            .boxed()
    }

    async fn list_networks(&self) -> Result<HashMap<String, NetworkInfo>> {
        let networks = self
            .docker
            .list_networks(None::<ListNetworksOptions<String>>)
            .await?;
        let mut map = HashMap::new();
        for network in networks {
            let (Some(name), Some(id)) = (network.name, network.id) else {
                continue;
            };
            map.insert(
                name,
                NetworkInfo {
                    id,
                    driver: network.driver,
                },
            );
        }
        Ok(map)
    }

    async fn resolve_network(&self, name: &str) -> Result<Option<String>> {
        Ok(self.list_networks().await?.remove(name).map(|info| info.id))
    }

    async fn node_id(&self) -> Result<String> {
        let info = self.docker.info().await?;
        info.swarm
            .and_then(|swarm| swarm.node_id)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| SyncError::not_found("swarm node id", "local daemon"))
    }
}
