use anyhow::Context;
use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: String,
    pub namespace: String,
    pub username: String,
    pub password: String,
    /// Docker-style secret holding the password; wins over `password`.
    #[serde(default, skip_serializing)]
    pub password_file: Option<PathBuf>,
    pub group_name: String,
    pub poll_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub fetch_concurrency: usize,
    pub output_paths: Vec<PathBuf>,
    pub job_name: String,
    pub passthrough_metadata: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: "http://127.0.0.1:8848".into(),
            namespace: "dev".into(),
            username: "nacos".into(),
            password: "nacos".into(),
            password_file: None,
            group_name: "DEFAULT_GROUP".into(),
            poll_interval_secs: 10,
            request_timeout_secs: 5,
            fetch_concurrency: 8,
            output_paths: vec![
                PathBuf::from("./app/services.json"),
                PathBuf::from("./prometheus/conf/services.json"),
            ],
            job_name: "nacos-discovery".into(),
            passthrough_metadata: false,
            status_path: None,
        }
    }
}

// Hand-written so the password never reaches the startup log line.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("server", &self.server)
            .field("namespace", &self.namespace)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("password_file", &self.password_file)
            .field("group_name", &self.group_name)
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("fetch_concurrency", &self.fetch_concurrency)
            .field("output_paths", &self.output_paths)
            .field("job_name", &self.job_name)
            .field("passthrough_metadata", &self.passthrough_metadata)
            .field("status_path", &self.status_path)
            .finish()
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_figment(Self::figment())
    }

    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("nacos-sd.toml"))
            .merge(Json::file("nacos-sd.json"))
            // Older deployments export the group without the prefix.
            .merge(Env::raw().only(&["group_name"]))
            .merge(Env::prefixed("NACOS_"))
    }

    fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let mut config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Support Docker-style secrets
        if let Some(secret_file) = &config.password_file {
            config.password = std::fs::read_to_string(secret_file)
                .with_context(|| format!("Failed to read password file {}", secret_file.display()))?
                .trim()
                .to_string();
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        reqwest::Url::parse(&self.server)
            .map_err(|e| anyhow::anyhow!("Invalid server URL {:?}: {}", self.server, e))?;
        if self.output_paths.is_empty() {
            anyhow::bail!("At least one output path is required");
        }
        if self.poll_interval_secs == 0 {
            anyhow::bail!("poll_interval_secs must be greater than zero");
        }
        if self.request_timeout_secs == 0 {
            anyhow::bail!("request_timeout_secs must be greater than zero");
        }
        if self.fetch_concurrency == 0 {
            anyhow::bail!("fetch_concurrency must be greater than zero");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
