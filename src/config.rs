//! Read-only view of tunables (spec §2 "Configuration" row, §5 timeouts,
//! §6 environment variables). Built via `ConfigurationBuilder`, optionally
//! seeded from a `config.toml` in the config dir, then frozen.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which playlist variant the Analyzer should pick from a master playlist
/// when the caller doesn't care (spec §4.6 step 1: "configurable").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantSelection {
    HighestBandwidth,
    LowestBandwidth,
    ClosestTo(u64),
}

impl Default for VariantSelection {
    fn default() -> Self {
        VariantSelection::HighestBandwidth
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub max_concurrent_tasks: usize,
    pub max_workers_per_task: usize,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub max_backoff: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub merge_timeout_floor: Duration,
    pub merge_timeout_ceiling: Duration,
    pub merge_timeout_bytes_per_sec: u64,
    pub output_dir: PathBuf,
    pub config_dir: PathBuf,
    pub retain_staging_on_failure: bool,
    pub variant_selection: VariantSelection,
    pub scheduler_tick: Duration,
    pub ffmpeg_path: Option<PathBuf>,
    pub prefer_transcoder: bool,
    pub honor_proxy_env: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            max_concurrent_tasks: 3,
            max_workers_per_task: 4,
            max_retries: 5,
            backoff_base: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            merge_timeout_floor: Duration::from_secs(10),
            merge_timeout_ceiling: Duration::from_secs(600),
            merge_timeout_bytes_per_sec: 20 * 1024 * 1024,
            output_dir: default_output_dir(),
            config_dir: default_config_dir(),
            retain_staging_on_failure: false,
            variant_selection: VariantSelection::default(),
            scheduler_tick: Duration::from_secs(1),
            ffmpeg_path: None,
            prefer_transcoder: true,
            honor_proxy_env: true,
        }
    }
}

pub fn default_output_dir() -> PathBuf {
    dirs::download_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn default_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("VIDTANIUM_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs::config_dir()
        .map(|d| d.join("vidtanium"))
        .unwrap_or_else(|| PathBuf::from(".vidtanium"))
}

impl Configuration {
    pub fn builder() -> ConfigurationBuilder {
        ConfigurationBuilder::default()
    }

    /// Merge tunables from `<config_dir>/config.toml` if present. Absence
    /// is not an error (§5 "reads tolerate absence").
    pub fn load_overrides(mut self, config_dir: &Path) -> Self {
        let path = config_dir.join("config.toml");
        let Ok(text) = std::fs::read_to_string(&path) else {
            return self;
        };
        match toml::from_str::<ConfigurationOverrides>(&text) {
            Ok(overrides) => overrides.apply(&mut self),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to parse config.toml, using defaults");
            }
        }
        self
    }

    /// Merge proxy env vars into a reqwest client builder, honoring §6.
    pub fn apply_proxy(&self, mut builder: reqwest::ClientBuilder) -> reqwest::ClientBuilder {
        if !self.honor_proxy_env {
            return builder;
        }
        if let Ok(proxy) = std::env::var("HTTPS_PROXY").or_else(|_| std::env::var("https_proxy")) {
            if let Ok(p) = reqwest::Proxy::https(&proxy) {
                builder = builder.proxy(p);
            }
        }
        if let Ok(proxy) = std::env::var("HTTP_PROXY").or_else(|_| std::env::var("http_proxy")) {
            if let Ok(p) = reqwest::Proxy::http(&proxy) {
                builder = builder.proxy(p);
            }
        }
        builder
    }

    pub fn merge_timeout_for(&self, total_bytes: u64) -> Duration {
        let seconds = total_bytes / self.merge_timeout_bytes_per_sec.max(1);
        Duration::from_secs(seconds)
            .clamp(self.merge_timeout_floor, self.merge_timeout_ceiling)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigurationOverrides {
    max_concurrent_tasks: Option<usize>,
    max_workers_per_task: Option<usize>,
    max_retries: Option<u32>,
    output_dir: Option<PathBuf>,
    retain_staging_on_failure: Option<bool>,
    prefer_transcoder: Option<bool>,
}

impl ConfigurationOverrides {
    fn apply(self, cfg: &mut Configuration) {
        if let Some(v) = self.max_concurrent_tasks {
            cfg.max_concurrent_tasks = v;
        }
        if let Some(v) = self.max_workers_per_task {
            cfg.max_workers_per_task = v;
        }
        if let Some(v) = self.max_retries {
            cfg.max_retries = v;
        }
        if let Some(v) = self.output_dir {
            cfg.output_dir = v;
        }
        if let Some(v) = self.retain_staging_on_failure {
            cfg.retain_staging_on_failure = v;
        }
        if let Some(v) = self.prefer_transcoder {
            cfg.prefer_transcoder = v;
        }
    }
}

#[derive(Debug)]
pub struct ConfigurationBuilder {
    inner: Configuration,
}

impl Default for ConfigurationBuilder {
    fn default() -> Self {
        ConfigurationBuilder {
            inner: Configuration::default(),
        }
    }
}

macro_rules! setter {
    ($name:ident, $ty:ty) => {
        pub fn $name(mut self, value: $ty) -> Self {
            self.inner.$name = value;
            self
        }
    };
}

impl ConfigurationBuilder {
    setter!(max_concurrent_tasks, usize);
    setter!(max_workers_per_task, usize);
    setter!(max_retries, u32);
    setter!(output_dir, PathBuf);
    setter!(config_dir, PathBuf);
    setter!(retain_staging_on_failure, bool);
    setter!(variant_selection, VariantSelection);
    setter!(ffmpeg_path, Option<PathBuf>);
    setter!(prefer_transcoder, bool);

    pub fn build(self) -> Configuration {
        self.inner
    }
}
