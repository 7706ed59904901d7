//! Seam between the engine and the external metadata store.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::errors::Result;
use crate::types::{Application, SwarmNetwork};

pub mod dokploy;
pub use dokploy::DokployClient;

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// A disabled store answers reads with nothing and ignores writes.
    fn is_enabled(&self) -> bool;

    /// All known applications; served from a TTL-bounded cache.
    async fn list_applications(&self) -> Result<Vec<Application>>;

    async fn find_application(&self, app_name: &str) -> Result<Option<Application>>;

    /// Backfills labels and/or networks the cluster knows but the store
    /// does not. `None` fields are left untouched.
    async fn update_application(
        &self,
        application_id: &str,
        labels: Option<&HashMap<String, String>>,
        networks: Option<&[SwarmNetwork]>,
    ) -> Result<()>;

    async fn update_domain(&self, domain_id: &str, host: &str) -> Result<()>;
}
