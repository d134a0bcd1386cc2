use serde::Deserialize;
use std::{
  env, fmt, fs, io,
  path::{Path, PathBuf},
  time::Duration,
};
use thiserror::Error;

pub const DEFAULT_METADATA_ENDPOINT: &str = "http://100.100.100.200/latest/meta-data/";
pub const DEFAULT_ECS_ENDPOINT: &str = "https://ecs.aliyuncs.com/";
pub const DEFAULT_REGION: &str = "cn-hangzhou";

/// Environment variable naming the plugin config file.
pub const CONFIG_PATH_ENV: &str = "DISK_PLUGIN_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read config file {}", .0.display())]
  Read(PathBuf, #[source] io::Error),
  #[error("failed to parse config file {}", .0.display())]
  Parse(PathBuf, #[source] serde_json::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiskConfig {
  pub metadata_endpoint: String,
  pub ecs_endpoint: String,
  pub default_region: String,
  pub request_timeout_secs: u64,
  pub retry: RetryPolicy,
  #[serde(rename = "Global")]
  pub global: GlobalOptions,
}

impl Default for DiskConfig {
  fn default() -> Self {
    DiskConfig {
      metadata_endpoint: DEFAULT_METADATA_ENDPOINT.to_owned(),
      ecs_endpoint: DEFAULT_ECS_ENDPOINT.to_owned(),
      default_region: DEFAULT_REGION.to_owned(),
      request_timeout_secs: 10,
      retry: RetryPolicy::default(),
      global: GlobalOptions::default(),
    }
  }
}

impl DiskConfig {
  /// Loads the config file at path, or the defaults when no path is given.
  pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
    let path = match path {
      None => return Ok(DiskConfig::default()),
      Some(path) => path,
    };

    let content = fs::read(path).map_err(|e| ConfigError::Read(path.to_owned(), e))?;
    serde_json::from_slice(&content).map_err(|e| ConfigError::Parse(path.to_owned(), e))
  }

  /// Loads the file named by `DISK_PLUGIN_CONFIG`, if set.
  pub fn from_env() -> Result<Self, ConfigError> {
    match env::var_os(CONFIG_PATH_ENV) {
      Some(path) if !path.is_empty() => Self::load(Some(Path::new(&path))),
      _ => Self::load(None),
    }
  }

  /// Region used when neither the volume options nor instance metadata
  /// provide one.
  pub fn region(&self) -> &str {
    if self.global.region.is_empty() {
      &self.default_region
    } else {
      &self.global.region
    }
  }

  #[inline]
  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }
}

/// Legacy default-options block of the plugin config.
#[derive(Clone, Default, Deserialize)]
pub struct GlobalOptions {
  #[serde(rename = "KubernetesClusterTag", default)]
  pub kubernetes_cluster_tag: String,
  #[serde(rename = "accessKeyID", default)]
  pub access_key_id: String,
  #[serde(rename = "accessKeySecret", default)]
  pub access_key_secret: String,
  #[serde(default)]
  pub region: String,
}

impl fmt::Debug for GlobalOptions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("GlobalOptions")
      .field("kubernetes_cluster_tag", &self.kubernetes_cluster_tag)
      .field("access_key_id", &self.access_key_id)
      .field("access_key_secret", &"<redacted>")
      .field("region", &self.region)
      .finish()
  }
}

/// Bounded capped-exponential backoff for conflict-class control-plane errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
  /// Total number of attempts, including the first one.
  pub max_attempts: u32,
  pub initial_backoff_ms: u64,
  pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    RetryPolicy {
      max_attempts: 8,
      initial_backoff_ms: 1000,
      max_backoff_ms: 10_000,
    }
  }
}

impl RetryPolicy {
  /// Delay to wait after the given (1-based) failed attempt.
  pub fn backoff(&self, attempt: u32) -> Duration {
    let max = Duration::from_millis(self.max_backoff_ms);
    let mut delay = Duration::from_millis(self.initial_backoff_ms);
    for _ in 1..attempt {
      delay = delay.checked_mul(2).unwrap_or(max);
      if delay >= max {
        break;
      }
    }
    delay.min(max)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;
  use test_case::test_case;

  #[test_case(1 => 1000)]
  #[test_case(2 => 2000)]
  #[test_case(4 => 8000)]
  #[test_case(5 => 10_000 ; "capped")]
  #[test_case(40 => 10_000 ; "capped without overflow")]
  fn backoff(attempt: u32) -> u128 {
    RetryPolicy::default().backoff(attempt).as_millis()
  }

  #[test]
  fn load_defaults_without_path() {
    let config = DiskConfig::load(None).expect("defaults");
    assert_eq!(config.metadata_endpoint, DEFAULT_METADATA_ENDPOINT);
    assert_eq!(config.region(), DEFAULT_REGION);
    assert_eq!(config.retry, RetryPolicy::default());
  }

  #[test]
  fn load_file_with_global_block() {
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    write!(
      file,
      r#"{{
        "retry": {{ "maxAttempts": 3 }},
        "Global": {{
          "KubernetesClusterTag": "k8s",
          "accessKeyID": "id",
          "accessKeySecret": "sk-do-not-log",
          "region": "cn-beijing"
        }}
      }}"#
    )
    .expect("write");

    let config = DiskConfig::load(Some(file.path())).expect("load");
    assert_eq!(config.retry.max_attempts, 3);
    assert_eq!(config.retry.initial_backoff_ms, 1000);
    assert_eq!(config.global.access_key_id, "id");
    assert_eq!(config.region(), "cn-beijing");
    assert_eq!(config.ecs_endpoint, DEFAULT_ECS_ENDPOINT);
    assert_eq!(config.global.access_key_secret, "sk-do-not-log");
    assert!(!format!("{:?}", config).contains("sk-do-not-log"));
  }

  #[test]
  fn load_reports_bad_json() {
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    write!(file, "not json").expect("write");

    let err = DiskConfig::load(Some(file.path())).expect_err("parse error");
    assert!(matches!(err, ConfigError::Parse(..)));
  }
}
