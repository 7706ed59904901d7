use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Name of the overlay network Traefik routes ingress traffic on.
    pub traefik_network: String,
    /// Seconds between full reconciliation sweeps.
    pub reconcile_interval_secs: u64,
    /// Base URL of the Dokploy instance.
    pub dokploy_url: String,
    /// API key for Dokploy. Absent disables metadata reconciliation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dokploy_api_key: Option<String>,
    /// TTL of the cached Dokploy application list, in seconds.
    pub cache_ttl_secs: u64,
    /// How long a container id stays in the event dedup window, in seconds.
    pub dedup_window_secs: u64,
    /// Upper bound on dedup window entries.
    pub dedup_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            traefik_network: "traefik-public".into(),
            reconcile_interval_secs: 60,
            dokploy_url: "http://dokploy:3000".into(),
            dokploy_api_key: None,
            cache_ttl_secs: 30,
            dedup_window_secs: 120,
            dedup_capacity: 1024,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let mut config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("autoswarm.toml"))
            .merge(Json::file("autoswarm.json"))
            .merge(Env::prefixed("AUTOSWARM_"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Support Docker-style secrets
        if let Ok(key_file) = std::env::var("AUTOSWARM_DOKPLOY_API_KEY_FILE") {
            config.dokploy_api_key = Some(std::fs::read_to_string(key_file)?.trim().to_string());
        }

        config.dokploy_url = config.dokploy_url.trim_end_matches('/').to_string();

        if config.reconcile_interval_secs == 0 {
            anyhow::bail!("reconcile_interval_secs must be greater than zero");
        }
        if config.cache_ttl_secs == 0 {
            anyhow::bail!("cache_ttl_secs must be greater than zero");
        }

        Ok(config)
    }
}
