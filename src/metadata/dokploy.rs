//! Dokploy API client over the TRPC endpoints.
//!
//! Applications live nested under projects and environments; the client
//! flattens them and keeps the flattened list in a TTL-bounded cache so a
//! reconciliation sweep does not hammer the API once per service. Writes
//! use the TRPC batch envelope and force a cache refresh.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use super::MetadataStore;
use crate::errors::{Result, SyncError};
use crate::types::{Application, SwarmNetwork};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Default, Deserialize)]
struct Project {
    #[serde(default)]
    environments: Vec<Environment>,
}

#[derive(Debug, Default, Deserialize)]
struct Environment {
    #[serde(default)]
    applications: Vec<Application>,
}

#[derive(Default)]
struct Cache {
    applications: Vec<Application>,
    fetched_at: Option<Instant>,
}

pub struct DokployClient {
    base_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
    ttl: Duration,
    cache: Mutex<Cache>,
}

impl DokployClient {
    pub fn new(base_url: &str, api_key: Option<String>, ttl: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            http,
            ttl,
            cache: Mutex::new(Cache::default()),
        })
    }

    fn key(&self) -> &str {
        self.api_key.as_deref().unwrap_or("")
    }

    /// Unwraps the TRPC `result.data.json` envelope, surfacing an `error`
    /// member as a transient failure.
    fn unwrap_envelope(mut body: Value, endpoint: &str) -> Result<Value> {
        let node = if body.is_array() {
            body.get_mut(0).map(Value::take).unwrap_or(Value::Null)
        } else {
            body
        };
        if let Some(err) = node.get("error") {
            return Err(SyncError::Transient(format!(
                "dokploy {endpoint} returned error: {err}"
            )));
        }
        Ok(node
            .get("result")
            .and_then(|r| r.get("data"))
            .and_then(|d| d.get("json"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn refresh_cache(&self, force: bool) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        {
            let cache = self.cache.lock().await;
            let fresh = cache
                .fetched_at
                .is_some_and(|at| at.elapsed() < self.ttl);
            if fresh && !force {
                return Ok(());
            }
        }

        let response = self
            .http
            .get(format!("{}/api/trpc/project.all", self.base_url))
            .query(&[("input", "{}")])
            .header("x-api-key", self.key())
            .send()
            .await?
            .error_for_status()?;
        let payload = Self::unwrap_envelope(response.json().await?, "project.all")?;

        let projects: Vec<Project> = match payload {
            Value::Null => Vec::new(),
            other => serde_json::from_value(other).map_err(|e| {
                SyncError::Transient(format!("dokploy project.all payload malformed: {e}"))
            })?,
        };
        let applications: Vec<Application> = projects
            .into_iter()
            .flat_map(|p| p.environments)
            .flat_map(|e| e.applications)
            .collect();
        debug!("Dokploy cache refreshed with {} applications.", applications.len());

        let mut cache = self.cache.lock().await;
        cache.applications = applications;
        cache.fetched_at = Some(Instant::now());
        Ok(())
    }

    async fn post_batch(&self, endpoint: &str, inner: Value) -> Result<()> {
        let body = json!({ "0": { "json": inner } });
        let response = self
            .http
            .post(format!("{}/api/trpc/{endpoint}?batch=1", self.base_url))
            .header("x-api-key", self.key())
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Self::unwrap_envelope(response.json().await?, endpoint)?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for DokployClient {
    fn is_enabled(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    async fn list_applications(&self) -> Result<Vec<Application>> {
        self.refresh_cache(false).await?;
        Ok(self.cache.lock().await.applications.clone())
    }

    async fn find_application(&self, app_name: &str) -> Result<Option<Application>> {
        if !self.is_enabled() {
            return Ok(None);
        }
        self.refresh_cache(false).await?;
        Ok(self
            .cache
            .lock()
            .await
            .applications
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
        if !self.is_enabled() {
            return Ok(());
        }
        let mut inner = json!({ "applicationId": application_id });
        if let Some(labels) = labels {
            inner["labelsSwarm"] = json!(labels);
        }
        if let Some(networks) = networks {
            inner["networkSwarm"] = json!(networks);
        }
        self.post_batch("application.update", inner).await?;
        debug!("Dokploy application {application_id} updated.");
        self.refresh_cache(true).await
    }

    async fn update_domain(&self, domain_id: &str, host: &str) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.post_batch("domain.update", json!({ "domainId": domain_id, "host": host }))
            .await?;
        debug!("Dokploy domain {domain_id} updated.");
        self.refresh_cache(true).await
    }
}
