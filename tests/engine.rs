//! Engine and scheduler behaviour against in-memory fakes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bollard::models::{
    ContainerConfig, ContainerInspectResponse, ContainerSummary, EventActor, EventMessage,
    MountPoint, MountPointTypeEnum, NetworkAttachmentConfig, ObjectVersion, Service, ServiceSpec,
    TaskSpec,
};
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::watch;

use autoswarm::errors::{Result, SyncError};
use autoswarm::metadata::MetadataStore;
use autoswarm::orchestrator::{NetworkInfo, Orchestrator};
use autoswarm::reconciler::Reconciler;
use autoswarm::scheduler::{DedupWindow, Scheduler};
use autoswarm::types::{Application, DomainEntry, SwarmNetwork};

fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[derive(Default)]
struct FakeOrchestrator {
    containers: Mutex<HashMap<String, ContainerInspectResponse>>,
    services: Mutex<HashMap<String, Service>>,
    networks: HashMap<String, NetworkInfo>,
    events: Mutex<Vec<EventMessage>>,
    calls: Mutex<Vec<String>>,
    fail_create: bool,
    fail_update_for: Option<String>,
}

impl FakeOrchestrator {
    fn with_container(self, id: &str, container: ContainerInspectResponse) -> Self {
        self.containers
            .lock()
            .unwrap()
            .insert(id.to_string(), container);
        self
    }

    fn with_service(self, service: Service) -> Self {
        let name = service
            .spec
            .as_ref()
            .and_then(|s| s.name.clone())
            .expect("fixture service needs a name");
        self.services.lock().unwrap().insert(name, service);
        self
    }

    fn with_network(mut self, name: &str, id: &str, driver: &str) -> Self {
        self.networks.insert(
            name.to_string(),
            NetworkInfo {
                id: id.to_string(),
                driver: Some(driver.to_string()),
            },
        );
        self
    }

    fn with_events(self, events: Vec<EventMessage>) -> Self {
        *self.events.lock().unwrap() = events;
        self
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn calls_matching(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Orchestrator for FakeOrchestrator {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        Ok(self
            .containers
            .lock()
            .unwrap()
            .iter()
            .map(|(id, c)| ContainerSummary {
                id: Some(id.clone()),
                names: c.name.clone().map(|n| vec![n]),
                labels: c.config.as_ref().and_then(|cfg| cfg.labels.clone()),
                ..Default::default()
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspectResponse> {
        self.containers
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| SyncError::not_found("container", id))
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        Ok(self.services.lock().unwrap().values().cloned().collect())
    }

    async fn find_service(&self, name: &str) -> Result<Option<Service>> {
        Ok(self.services.lock().unwrap().get(name).cloned())
    }

    async fn create_service(&self, spec: ServiceSpec) -> Result<String> {
        let name = spec.name.clone().unwrap_or_default();
        if self.fail_create {
            return Err(SyncError::Transient("create refused".into()));
        }
        self.record(format!("create:{name}"));
        self.services.lock().unwrap().insert(
            name.clone(),
            Service {
                id: Some(format!("svc-{name}")),
                version: Some(ObjectVersion { index: Some(1) }),
                spec: Some(spec),
                ..Default::default()
            },
        );
        Ok(format!("svc-{name}"))
    }

    async fn update_service(&self, name: &str, version: u64, spec: ServiceSpec) -> Result<()> {
        if self.fail_update_for.as_deref() == Some(name) {
            return Err(SyncError::Transient("update refused".into()));
        }
        self.record(format!("update:{name}"));
        self.services.lock().unwrap().insert(
            name.to_string(),
            Service {
                id: Some(format!("svc-{name}")),
                version: Some(ObjectVersion {
                    index: Some(version + 1),
                }),
                spec: Some(spec),
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        self.record(format!("stop:{id}"));
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.record(format!("remove:{id}"));
        self.containers.lock().unwrap().remove(id);
        Ok(())
    }

    fn subscribe_events(&self) -> BoxStream<'_, Result<EventMessage>> {
        let events: Vec<EventMessage> = std::mem::take(&mut self.events.lock().unwrap());
        stream::iter(events.into_iter().map(Ok)).boxed()
    }

    async fn list_networks(&self) -> Result<HashMap<String, NetworkInfo>> {
        Ok(self.networks.clone())
    }

    async fn resolve_network(&self, name: &str) -> Result<Option<String>> {
        Ok(self.networks.get(name).map(|info| info.id.clone()))
    }

    async fn node_id(&self) -> Result<String> {
        Ok("node-test".to_string())
    }
}

#[derive(Default)]
struct FakeStore {
    enabled: bool,
    apps: Mutex<Vec<Application>>,
    app_updates: Mutex<Vec<String>>,
    domain_updates: Mutex<Vec<(String, String)>>,
}

impl FakeStore {
    fn with_apps(apps: Vec<Application>) -> Self {
        Self {
            enabled: true,
            apps: Mutex::new(apps),
            ..Default::default()
        }
    }
}

#[async_trait]
impl MetadataStore for FakeStore {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn list_applications(&self) -> Result<Vec<Application>> {
        Ok(self.apps.lock().unwrap().clone())
    }

    async fn find_application(&self, app_name: &str) -> Result<Option<Application>> {
        Ok(self
            .apps
            .lock()
            .unwrap()
            .iter()
            .find(|app| app.app_name == app_name)
            .cloned())
    }

    async fn update_application(
        &self,
        application_id: &str,
        labels: Option<&HashMap<String, String>>,
        networks: Option<&[SwarmNetwork]>,
    ) -> Result<()> {
        self.app_updates
            .lock()
            .unwrap()
            .push(application_id.to_string());
        let mut apps = self.apps.lock().unwrap();
        if let Some(app) = apps.iter_mut().find(|a| a.application_id == application_id) {
            if let Some(labels) = labels {
                app.labels_swarm = labels.clone();
            }
            if let Some(networks) = networks {
                app.network_swarm = networks.to_vec();
            }
        }
        Ok(())
    }

    async fn update_domain(&self, domain_id: &str, host: &str) -> Result<()> {
        self.domain_updates
            .lock()
            .unwrap()
            .push((domain_id.to_string(), host.to_string()));
        Ok(())
    }
}

fn engine(
    orchestrator: Arc<FakeOrchestrator>,
    store: Arc<FakeStore>,
    ingress_id: Option<&str>,
) -> Reconciler {
    Reconciler::new(
        orchestrator,
        store,
        "traefik-public".to_string(),
        ingress_id.map(str::to_string),
        "node-test".to_string(),
    )
}

fn app_fixture() -> Application {
    Application {
        application_id: "app-1".to_string(),
        app_name: "web".to_string(),
        labels_swarm: map(&[("tier", "web")]),
        network_swarm: vec![SwarmNetwork::new("net-edge")],
        domains: vec![DomainEntry {
            domain_id: "d-1".to_string(),
            host: "a.example.com".to_string(),
            domain_type: "application".to_string(),
            created_at: Some("2024-01-01".to_string()),
            unique_config_key: None,
        }],
    }
}

fn service_fixture(labels: HashMap<String, String>, task_networks: Vec<&str>) -> Service {
    Service {
        id: Some("svc-web".to_string()),
        version: Some(ObjectVersion { index: Some(7) }),
        spec: Some(ServiceSpec {
            name: Some("web".to_string()),
            labels: Some(labels),
            task_template: Some(TaskSpec {
                networks: Some(
                    task_networks
                        .iter()
                        .map(|t| NetworkAttachmentConfig {
                            target: Some(t.to_string()),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn container_fixture(name: &str, labels: Option<HashMap<String, String>>) -> ContainerInspectResponse {
    ContainerInspectResponse {
        id: Some(format!("c-{name}")),
        name: Some(format!("/{name}")),
        config: Some(ContainerConfig {
            image: Some("nginx:1.25".to_string()),
            labels,
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn start_event(container_id: &str) -> EventMessage {
    EventMessage {
        action: Some("start".to_string()),
        actor: Some(EventActor {
            id: Some(container_id.to_string()),
            attributes: None,
        }),
        ..Default::default()
    }
}

#[tokio::test]
async fn second_reconcile_issues_zero_updates() {
    let aligned_labels = map(&[
        ("tier", "web"),
        ("autoswarm.managed", "true"),
        ("traefik.enable", "true"),
        ("traefik.http.routers.web.rule", "Host(`a.example.com`)"),
    ]);
    let orchestrator = Arc::new(
        FakeOrchestrator::default()
            .with_service(service_fixture(aligned_labels, vec!["net-edge", "net-ingress"])),
    );
    let store = Arc::new(FakeStore::with_apps(vec![app_fixture()]));
    let engine = engine(Arc::clone(&orchestrator), Arc::clone(&store), Some("net-ingress"));

    engine.reconcile_all().await.unwrap();
    engine.reconcile_all().await.unwrap();

    assert!(orchestrator.calls_matching("update:").is_empty());
    // The store learned the ingress network once; after that nothing to say.
    assert_eq!(store.app_updates.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn empty_desired_network_set_never_storms_updates() {
    // Store declares no networks and the ingress network is unresolved,
    // while the service carries an attachment: with nothing to converge
    // to, repeated sweeps must stay write-free.
    let mut app = app_fixture();
    app.network_swarm = vec![];
    let aligned_labels = map(&[
        ("tier", "web"),
        ("autoswarm.managed", "true"),
        ("traefik.enable", "true"),
        ("traefik.http.routers.web.rule", "Host(`a.example.com`)"),
    ]);
    let orchestrator = Arc::new(
        FakeOrchestrator::default().with_service(service_fixture(aligned_labels, vec!["net-stale"])),
    );
    let store = Arc::new(FakeStore::with_apps(vec![app]));
    let engine = engine(Arc::clone(&orchestrator), store, None);

    engine.reconcile_all().await.unwrap();
    engine.reconcile_all().await.unwrap();

    assert!(orchestrator.calls_matching("update:").is_empty());
}

#[tokio::test]
async fn example_scenario_adds_only_the_missing_rule() {
    // Labels already satisfied (with operator extras), networks present
    // only in the effective location, router rule missing entirely.
    let current_labels = map(&[
        ("tier", "web"),
        ("owner", "ops"),
        ("autoswarm.managed", "true"),
        ("traefik.enable", "true"),
    ]);
    let orchestrator = Arc::new(
        FakeOrchestrator::default().with_service(service_fixture(current_labels, vec!["net-edge"])),
    );
    let store = Arc::new(FakeStore::with_apps(vec![app_fixture()]));
    // Ingress network unresolved so desired networks stay at the app's own.
    let engine = engine(Arc::clone(&orchestrator), store, None);

    engine.reconcile_all().await.unwrap();

    let updates = orchestrator.calls_matching("update:");
    assert_eq!(updates, vec!["update:web".to_string()]);
    let services = orchestrator.services.lock().unwrap();
    let labels = services["web"].spec.as_ref().unwrap().labels.clone().unwrap();
    assert_eq!(
        labels.get("traefik.http.routers.web.rule").map(String::as_str),
        Some("Host(`a.example.com`)")
    );
    assert_eq!(labels.get("owner").map(String::as_str), Some("ops"));
}

#[tokio::test]
async fn unsupported_mount_leaves_container_untouched() {
    let mut container = container_fixture("web", None);
    container.mounts = Some(vec![MountPoint {
        typ: Some(MountPointTypeEnum::TMPFS),
        source: Some("tmpfs".to_string()),
        destination: Some("/scratch".to_string()),
        ..Default::default()
    }]);
    let orchestrator = Arc::new(FakeOrchestrator::default().with_container("c-web", container));
    let engine = engine(Arc::clone(&orchestrator), Arc::new(FakeStore::default()), None);

    let err = engine.convert("c-web").await.unwrap_err();
    assert!(matches!(err, SyncError::Mapping { .. }));
    assert!(orchestrator.calls_matching("create:").is_empty());
    assert!(orchestrator.containers.lock().unwrap().contains_key("c-web"));
}

#[tokio::test]
async fn conversion_creates_service_before_removing_container() {
    let orchestrator = Arc::new(
        FakeOrchestrator::default()
            .with_container("c-web", container_fixture("web", None))
            .with_network("traefik-public", "net-ingress", "overlay"),
    );
    let engine = engine(Arc::clone(&orchestrator), Arc::new(FakeStore::default()), Some("net-ingress"));

    let name = engine.convert("c-web").await.unwrap();
    assert_eq!(name.as_deref(), Some("web"));

    let calls = orchestrator.calls();
    let create_at = calls.iter().position(|c| c == "create:web").unwrap();
    let remove_at = calls.iter().position(|c| c == "remove:c-web").unwrap();
    assert!(create_at < remove_at);
    assert!(!orchestrator.containers.lock().unwrap().contains_key("c-web"));
}

#[tokio::test]
async fn failed_creation_leaves_container_running() {
    let orchestrator = Arc::new(FakeOrchestrator {
        fail_create: true,
        ..Default::default()
    }
    .with_container("c-web", container_fixture("web", None)));
    let engine = engine(Arc::clone(&orchestrator), Arc::new(FakeStore::default()), None);

    let err = engine.convert("c-web").await.unwrap_err();
    assert!(err.is_retryable());
    assert!(orchestrator.calls_matching("remove:").is_empty());
    assert!(orchestrator.containers.lock().unwrap().contains_key("c-web"));
}

#[tokio::test]
async fn already_converted_container_is_skipped() {
    let service = service_fixture(
        map(&[("autoswarm.managed", "true"), ("autoswarm.source", "web")]),
        vec![],
    );
    let orchestrator = Arc::new(
        FakeOrchestrator::default()
            .with_container("c-web", container_fixture("web", None))
            .with_service(service),
    );
    let engine = engine(Arc::clone(&orchestrator), Arc::new(FakeStore::default()), None);

    assert!(engine.convert("c-web").await.unwrap().is_none());
    assert!(orchestrator.calls_matching("create:").is_empty());
}

#[tokio::test]
async fn name_collision_gets_reproducible_suffix() {
    let unrelated = service_fixture(map(&[("autoswarm.source", "other")]), vec![]);
    let orchestrator = Arc::new(
        FakeOrchestrator::default()
            .with_container("c-web", container_fixture("web", None))
            .with_service(unrelated),
    );
    let engine = engine(Arc::clone(&orchestrator), Arc::new(FakeStore::default()), None);

    let name = engine.convert("c-web").await.unwrap().unwrap();
    assert!(name.starts_with("web-"));
    assert_eq!(name.len(), "web-".len() + 6);
}

#[tokio::test]
async fn ignored_container_is_never_converted() {
    let labels = map(&[("autoswarm.ignore", "true")]);
    let orchestrator = Arc::new(
        FakeOrchestrator::default()
            .with_container("c-web", container_fixture("web", Some(labels))),
    );
    let engine = engine(Arc::clone(&orchestrator), Arc::new(FakeStore::default()), None);

    assert!(engine.convert("c-web").await.unwrap().is_none());
    assert!(orchestrator.calls_matching("create:").is_empty());
}

#[tokio::test]
async fn one_failing_application_does_not_abort_the_sweep() {
    let mut api_app = app_fixture();
    api_app.application_id = "app-2".to_string();
    api_app.app_name = "api".to_string();
    api_app.domains[0].host = "api.example.com".to_string();

    // Both services are missing their router rule, so both need updates;
    // the "web" update is refused.
    let base_labels = map(&[
        ("tier", "web"),
        ("autoswarm.managed", "true"),
        ("traefik.enable", "true"),
    ]);
    let mut api_service = service_fixture(base_labels.clone(), vec!["net-edge"]);
    api_service.spec.as_mut().unwrap().name = Some("api".to_string());

    let orchestrator = Arc::new(
        FakeOrchestrator {
            fail_update_for: Some("web".to_string()),
            ..Default::default()
        }
        .with_service(service_fixture(base_labels, vec!["net-edge"]))
        .with_service(api_service),
    );
    let store = Arc::new(FakeStore::with_apps(vec![app_fixture(), api_app]));
    let engine = engine(Arc::clone(&orchestrator), store, None);

    engine.reconcile_all().await.unwrap();

    assert_eq!(orchestrator.calls_matching("update:"), vec!["update:api".to_string()]);
}

#[tokio::test]
async fn empty_host_domain_is_backfilled_from_observed_rule() {
    let mut app = app_fixture();
    app.domains[0].host = String::new();
    let current_labels = map(&[
        ("tier", "web"),
        ("autoswarm.managed", "true"),
        ("traefik.enable", "true"),
        ("traefik.http.routers.web.rule", "Host(`a.example.com`)"),
    ]);
    let orchestrator = Arc::new(
        FakeOrchestrator::default().with_service(service_fixture(current_labels, vec!["net-edge"])),
    );
    let store = Arc::new(FakeStore::with_apps(vec![app]));
    let engine = engine(orchestrator, Arc::clone(&store), None);

    engine.reconcile_all().await.unwrap();

    assert_eq!(
        store.domain_updates.lock().unwrap().as_slice(),
        &[("d-1".to_string(), "a.example.com".to_string())]
    );
}

#[tokio::test]
async fn duplicate_events_convert_once() {
    let orchestrator: Arc<FakeOrchestrator> = Arc::new(
        FakeOrchestrator::default()
            .with_container("c-web", container_fixture("web", None))
            .with_events(vec![
                start_event("c-web"),
                start_event("c-web"),
                EventMessage::default(), // no actor; dropped
            ]),
    );
    let engine = Arc::new(engine(
        Arc::clone(&orchestrator),
        Arc::new(FakeStore::default()),
        None,
    ));
    let scheduler = Arc::new(Scheduler::new(
        engine,
        Arc::clone(&orchestrator) as Arc<dyn Orchestrator>,
        DedupWindow::new(Duration::from_secs(60), 16),
        Duration::from_secs(60),
    ));

    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.run_event_watcher(stop_rx).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    stop_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("watcher must stop within one polling quantum")
        .unwrap();

    assert_eq!(
        orchestrator.calls_matching("create:"),
        vec!["create:web".to_string()]
    );
}
