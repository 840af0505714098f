//! `gantryctl` configuration: a YAML file overridden by `GANTRY_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use gantry_api::ServiceConfig;
use gantry_kubehub::FeedConfig;
use gantry_store::PipelineConfig;
use serde::Deserialize;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("parsing {path}: {source}")]
    Yaml { path: PathBuf, source: serde_yaml::Error },
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ListenerConfig {
    fn default() -> Self { Self { host: "127.0.0.1".into(), port: 7400 } }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    Memory {
        #[serde(default)]
        seed: Option<PathBuf>,
    },
    Kubernetes {
        #[serde(default)]
        namespace: Option<String>,
        #[serde(default = "default_group")]
        group: String,
        #[serde(default = "default_version")]
        version: String,
    },
}

fn default_group() -> String { gantry_kubehub::kube_store::DEFAULT_GROUP.into() }
fn default_version() -> String { "v1".into() }

impl Default for StoreConfig {
    fn default() -> Self { StoreConfig::Memory { seed: None } }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    pub quiet_window_ms: u64,
    pub max_delay_ms: u64,
    pub queue_cap: usize,
}

impl Default for PipelineSection {
    fn default() -> Self { Self { quiet_window_ms: 100, max_delay_ms: 1000, queue_cap: 1024 } }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FeedSection {
    pub backoff_base_ms: u64,
    pub backoff_max_secs: u64,
}

impl Default for FeedSection {
    fn default() -> Self { Self { backoff_base_ms: 250, backoff_max_secs: 30 } }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServiceSection {
    pub watch_buffer: usize,
}

impl Default for ServiceSection {
    fn default() -> Self { Self { watch_buffer: 1024 } }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listener: ListenerConfig,
    pub store: StoreConfig,
    pub pipeline: PipelineSection,
    pub feed: FeedSection,
    pub service: ServiceSection,
    pub metrics_addr: Option<String>,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml { path: path.to_path_buf(), source })
    }

    /// Defaults or `path`, then the process environment on top.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        cfg.apply_env(|key| std::env::var(key).ok())?;
        Ok(cfg)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = lookup("GANTRY_LISTEN") {
            let (host, port) = v.rsplit_once(':').ok_or_else(|| invalid("GANTRY_LISTEN", &v))?;
            self.listener.port = port.parse().map_err(|_| invalid("GANTRY_LISTEN", &v))?;
            self.listener.host = host.trim_start_matches('[').trim_end_matches(']').to_string();
        }
        env_num(&lookup, "GANTRY_QUIET_WINDOW_MS", &mut self.pipeline.quiet_window_ms)?;
        env_num(&lookup, "GANTRY_MAX_DELAY_MS", &mut self.pipeline.max_delay_ms)?;
        env_num(&lookup, "GANTRY_QUEUE_CAP", &mut self.pipeline.queue_cap)?;
        env_num(&lookup, "GANTRY_BACKOFF_BASE_MS", &mut self.feed.backoff_base_ms)?;
        env_num(&lookup, "GANTRY_WATCH_BACKOFF_MAX_SECS", &mut self.feed.backoff_max_secs)?;
        env_num(&lookup, "GANTRY_WATCH_BUFFER", &mut self.service.watch_buffer)?;
        if let Some(v) = lookup("GANTRY_METRICS_ADDR") {
            self.metrics_addr = Some(v);
        }
        Ok(())
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            quiet_window: Duration::from_millis(self.pipeline.quiet_window_ms),
            max_delay: Duration::from_millis(self.pipeline.max_delay_ms),
        }
    }

    pub fn feed_config(&self) -> FeedConfig {
        FeedConfig {
            backoff_base: Duration::from_millis(self.feed.backoff_base_ms),
            backoff_max: Duration::from_secs(self.feed.backoff_max_secs),
            queue_cap: self.pipeline.queue_cap.max(1),
        }
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            host: self.listener.host.clone(),
            port: self.listener.port,
            watch_buffer: self.service.watch_buffer.max(1),
        }
    }
}

fn invalid(key: &'static str, value: &str) -> ConfigError { ConfigError::Invalid { key, value: value.to_string() } }

fn env_num<N: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    slot: &mut N,
) -> Result<(), ConfigError> {
    if let Some(v) = lookup(key) {
        *slot = v.trim().parse().map_err(|_| invalid(key, &v))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_without_file() {
        let cfg = Config::default();
        assert_eq!(cfg.service_config().addr(), "127.0.0.1:7400");
        assert_eq!(cfg.store, StoreConfig::Memory { seed: None });
        assert_eq!(cfg.pipeline_config().quiet_window, Duration::from_millis(100));
        assert_eq!(cfg.feed_config().backoff_max, Duration::from_secs(30));
        assert!(cfg.metrics_addr.is_none());
    }

    #[test]
    fn file_sections_are_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
listener:
  port: 9000
store:
  type: kubernetes
  namespace: edge
pipeline:
  max_delay_ms: 250
"#
        )
        .unwrap();
        let cfg = Config::from_file(file.path()).unwrap();
        assert_eq!(cfg.listener, ListenerConfig { host: "127.0.0.1".into(), port: 9000 });
        assert_eq!(
            cfg.store,
            StoreConfig::Kubernetes { namespace: Some("edge".into()), group: "gateway.gantry.dev".into(), version: "v1".into() }
        );
        assert_eq!(cfg.pipeline.max_delay_ms, 250);
        assert_eq!(cfg.pipeline.quiet_window_ms, 100);
    }

    #[test]
    fn environment_overrides_file() {
        let mut cfg = Config::default();
        cfg.apply_env(env(&[
            ("GANTRY_LISTEN", "0.0.0.0:8081"),
            ("GANTRY_QUIET_WINDOW_MS", "5"),
            ("GANTRY_WATCH_BUFFER", "16"),
            ("GANTRY_METRICS_ADDR", "127.0.0.1:9100"),
        ]))
        .unwrap();
        assert_eq!(cfg.service_config().addr(), "0.0.0.0:8081");
        assert_eq!(cfg.service_config().watch_buffer, 16);
        assert_eq!(cfg.pipeline_config().quiet_window, Duration::from_millis(5));
        assert_eq!(cfg.metrics_addr.as_deref(), Some("127.0.0.1:9100"));
    }

    #[test]
    fn bad_values_are_rejected() {
        let err = Config::default().apply_env(env(&[("GANTRY_MAX_DELAY_MS", "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "GANTRY_MAX_DELAY_MS", .. }));
        let err = Config::default().apply_env(env(&[("GANTRY_LISTEN", "no-port")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "GANTRY_LISTEN", .. }));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "store:\n  type: etcd\n").unwrap();
        assert!(matches!(Config::from_file(file.path()), Err(ConfigError::Yaml { .. })));
        assert!(matches!(Config::from_file(Path::new("/nonexistent/gantry.yaml")), Err(ConfigError::Io { .. })));
    }
}
