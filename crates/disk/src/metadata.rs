use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::{fmt, time::Duration};
use tracing::{debug, instrument, warn};

pub const INSTANCE_ID: &str = "instance-id";
pub const ZONE_ID: &str = "zone-id";
pub const REGION_ID: &str = "region-id";
pub const RAM_ROLE: &str = "ram/security-credentials/";

/// Temporary credentials issued for the instance's RAM role.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RoleToken {
  pub access_key_id: String,
  pub access_key_secret: String,
  pub security_token: String,
  #[serde(default)]
  pub expiration: String,
  #[serde(default)]
  pub code: String,
}

impl fmt::Debug for RoleToken {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RoleToken")
      .field("access_key_id", &self.access_key_id)
      .field("access_key_secret", &"<redacted>")
      .field("security_token", &"<redacted>")
      .field("expiration", &self.expiration)
      .field("code", &self.code)
      .finish()
  }
}

/// Read-only view of the instance metadata service.
#[async_trait]
pub trait MetadataService: Send + Sync {
  /// Fetches a metadata resource, `None` when it could not be read.
  async fn get(&self, resource: &str) -> Option<String>;

  /// Name of the RAM role bound to this instance.
  async fn role_name(&self) -> Option<String> {
    let body = self.get(RAM_ROLE).await?;
    body
      .lines()
      .map(str::trim)
      .find(|l| !l.is_empty())
      .map(str::to_owned)
  }

  async fn role_token(&self, role: &str) -> Option<RoleToken> {
    let body = self.get(&format!("{}{}", RAM_ROLE, role)).await?;
    match serde_json::from_str::<RoleToken>(&body) {
      Ok(token) if token.code.is_empty() || token.code == "Success" => Some(token),
      Ok(token) => {
        warn!(%role, code = %token.code, "metadata refused role credentials");
        None
      }
      Err(e) => {
        warn!(%role, error = %e, "malformed role credentials");
        None
      }
    }
  }
}

/// Metadata service reached over plain HTTP.
#[derive(Debug, Clone)]
pub struct HttpMetadata {
  client: Client,
  endpoint: String,
}

impl HttpMetadata {
  pub fn new(endpoint: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
    let mut endpoint = endpoint.into();
    if !endpoint.ends_with('/') {
      endpoint.push('/');
    }

    let client = Client::builder().timeout(timeout).build()?;
    Ok(HttpMetadata { client, endpoint })
  }
}

#[async_trait]
impl MetadataService for HttpMetadata {
  #[instrument(level = "debug", skip(self))]
  async fn get(&self, resource: &str) -> Option<String> {
    let url = format!("{}{}", self.endpoint, resource);
    let response = match self.client.get(&url).send().await {
      Ok(response) => response,
      Err(e) => {
        warn!(error = %e, "metadata request failed");
        return None;
      }
    };

    let status = response.status();
    if !status.is_success() {
      warn!(%status, "metadata request rejected");
      return None;
    }

    match response.text().await {
      Ok(body) => {
        let body = body.trim();
        debug!(len = body.len(), "metadata resource read");
        if body.is_empty() {
          None
        } else {
          Some(body.to_owned())
        }
      }
      Err(e) => {
        warn!(error = %e, "failed to read metadata body");
        None
      }
    }
  }
}
