use crate::metadata::MetadataService;
use std::{env, fmt, sync::Arc};
use tracing::{debug, instrument, warn};

pub const ACCESS_KEY_ID_ENV: &str = "ACCESS_KEY_ID";
pub const ACCESS_KEY_SECRET_ENV: &str = "ACCESS_KEY_SECRET";

/// Access key pair, with a session token when issued by STS.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
  access_key_id: String,
  access_key_secret: String,
  session_token: Option<String>,
}

impl fmt::Debug for Credentials {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Credentials")
      .field("access_key_id", &self.access_key_id)
      .field("access_key_secret", &"<redacted>")
      .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
      .finish()
  }
}

impl Credentials {
  pub fn new_static(access_key_id: impl Into<String>, access_key_secret: impl Into<String>) -> Self {
    Credentials {
      access_key_id: access_key_id.into(),
      access_key_secret: access_key_secret.into(),
      session_token: None,
    }
  }

  pub fn new_sts(
    access_key_id: impl Into<String>,
    access_key_secret: impl Into<String>,
    session_token: impl Into<String>,
  ) -> Self {
    Credentials {
      access_key_id: access_key_id.into(),
      access_key_secret: access_key_secret.into(),
      session_token: Some(session_token.into()),
    }
  }

  #[inline]
  pub fn access_key_id(&self) -> &str {
    &self.access_key_id
  }

  #[inline]
  pub fn access_key_secret(&self) -> &str {
    &self.access_key_secret
  }

  #[inline]
  pub fn session_token(&self) -> Option<&str> {
    self.session_token.as_deref()
  }

  pub fn is_empty(&self) -> bool {
    self.access_key_id.is_empty() || self.access_key_secret.is_empty()
  }

  #[inline]
  pub fn is_token_based(&self) -> bool {
    self.session_token.is_some()
  }
}

pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Resolves the credentials used for control-plane calls.
///
/// Sources are tried in order: the `ACCESS_KEY_ID`/`ACCESS_KEY_SECRET`
/// environment pair, static keys from the plugin config, and finally the
/// temporary credentials of the instance RAM role.
#[derive(Clone)]
pub struct CredentialResolver {
  env: EnvLookup,
  configured: Option<Credentials>,
  metadata: Arc<dyn MetadataService>,
}

impl CredentialResolver {
  pub fn new(metadata: Arc<dyn MetadataService>) -> Self {
    CredentialResolver {
      env: Arc::new(|key| env::var(key).ok()),
      configured: None,
      metadata,
    }
  }

  /// Replaces the process environment lookup.
  pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
    self.env = Arc::new(lookup);
    self
  }

  pub fn with_static_keys(mut self, access_key_id: &str, access_key_secret: &str) -> Self {
    let credentials = Credentials::new_static(access_key_id, access_key_secret);
    self.configured = if credentials.is_empty() {
      None
    } else {
      Some(credentials)
    };
    self
  }

  /// Returns the first usable credentials, or empty credentials when every
  /// source failed.
  #[instrument(level = "debug", skip(self))]
  pub async fn resolve(&self) -> Credentials {
    if let Some(credentials) = self.local() {
      debug!(access_key_id = %credentials.access_key_id(), "using static access key");
      return credentials;
    }

    match self.role_credentials().await {
      Some(credentials) => {
        debug!(access_key_id = %credentials.access_key_id(), "using role credentials");
        credentials
      }
      None => {
        warn!("no credentials available from environment, config or instance role");
        Credentials::default()
      }
    }
  }

  fn local(&self) -> Option<Credentials> {
    let id = (self.env)(ACCESS_KEY_ID_ENV).unwrap_or_default();
    let secret = (self.env)(ACCESS_KEY_SECRET_ENV).unwrap_or_default();
    let from_env = Credentials::new_static(id, secret);
    if !from_env.is_empty() {
      return Some(from_env);
    }

    self.configured.clone()
  }

  async fn role_credentials(&self) -> Option<Credentials> {
    let role = self.metadata.role_name().await?;
    let token = self.metadata.role_token(&role).await?;
    let credentials = Credentials::new_sts(
      token.access_key_id,
      token.access_key_secret,
      token.security_token,
    );

    if credentials.is_empty() || credentials.session_token().map_or(true, str::is_empty) {
      warn!(%role, "role credentials are incomplete");
      return None;
    }

    Some(credentials)
  }
}
