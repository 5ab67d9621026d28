use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// SQLite connection string.
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// AES-256-GCM key for credential blobs (base64-encoded, 32 bytes).
    pub encryption_key: String,

    /// Worker pool size. Each worker owns one browser session at a time.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Seconds between job-store polls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,

    /// Bound on waiting for the submission acknowledgement carrying the
    /// remote job id.
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_seconds: u64,

    /// Remote-operation completion bound for image jobs.
    #[serde(default = "default_image_timeout")]
    pub image_timeout_seconds: u64,

    /// Remote-operation completion bound for video jobs.
    #[serde(default = "default_video_timeout")]
    pub video_timeout_seconds: u64,

    /// Seconds between page reloads while awaiting completion.
    #[serde(default = "default_reload_interval")]
    pub reload_interval_seconds: u64,

    /// Run the browser headless. Disable for interactive debugging.
    #[serde(default = "default_true")]
    pub headless: bool,

    /// Chromium sandbox. Disabled in containers without user namespaces.
    #[serde(default = "default_true")]
    pub browser_sandbox: bool,

    /// Prometheus listener address (e.g. "0.0.0.0:9090"). Disabled if unset.
    #[serde(default)]
    pub metrics_addr: Option<String>,
}

fn default_database_url() -> String {
    "sqlite://genfarm.db".to_string()
}

fn default_max_workers() -> usize {
    5
}

fn default_poll_interval() -> u64 {
    5
}

fn default_ack_timeout() -> u64 {
    120
}

fn default_image_timeout() -> u64 {
    300
}

fn default_video_timeout() -> u64 {
    600
}

fn default_reload_interval() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        let mut config: AppConfig = envy::from_env()?;
        // Embedded-browser workloads do not scale past a couple hundred tabs.
        config.max_workers = config.max_workers.clamp(1, 200);
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_seconds)
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_seconds)
    }
}
