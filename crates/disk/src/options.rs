use crate::metadata::{self, MetadataService};
use std::{collections::HashMap, fmt, str::FromStr};
use thiserror::Error;
use tracing::debug;

pub const DISK_ID_KEY: &str = "diskId";
pub const NODE_ID_KEY: &str = "nodeId";
pub const ZONE_ID_KEY: &str = "zoneId";
pub const REGION_ID_KEY: &str = "regionId";
pub const FS_TYPE_KEY: &str = "fsType";
pub const CATEGORY_KEY: &str = "type";
pub const READ_ONLY_KEY: &str = "readOnly";
pub const ENCRYPTED_KEY: &str = "encrypted";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
  #[error("illegal required parameter fsType: {0:?}")]
  FsType(String),
  #[error("illegal required parameter type: {0:?}")]
  Category(String),
  #[error("missing required parameter {0}")]
  Missing(&'static str),
  #[error("{0} is not set and could not be resolved from instance metadata")]
  Unresolved(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsType {
  Ext3,
  Ext4,
}

impl Default for FsType {
  fn default() -> Self {
    FsType::Ext4
  }
}

impl FsType {
  pub fn as_str(self) -> &'static str {
    match self {
      FsType::Ext3 => "ext3",
      FsType::Ext4 => "ext4",
    }
  }
}

impl FromStr for FsType {
  type Err = ValidationError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "ext3" => Ok(FsType::Ext3),
      "ext4" => Ok(FsType::Ext4),
      _ => Err(ValidationError::FsType(s.to_owned())),
    }
  }
}

impl fmt::Display for FsType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Disk category. `Available` lets the control plane pick whatever the zone
/// has in stock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiskCategory {
  Available,
  Cloud,
  CloudEfficiency,
  CloudSsd,
}

impl Default for DiskCategory {
  fn default() -> Self {
    DiskCategory::Available
  }
}

impl DiskCategory {
  pub fn as_str(self) -> &'static str {
    match self {
      DiskCategory::Available => "available",
      DiskCategory::Cloud => "cloud",
      DiskCategory::CloudEfficiency => "cloud_efficiency",
      DiskCategory::CloudSsd => "cloud_ssd",
    }
  }
}

impl FromStr for DiskCategory {
  type Err = ValidationError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "available" => Ok(DiskCategory::Available),
      "cloud" => Ok(DiskCategory::Cloud),
      "cloud_efficiency" => Ok(DiskCategory::CloudEfficiency),
      "cloud_ssd" => Ok(DiskCategory::CloudSsd),
      _ => Err(ValidationError::Category(s.to_owned())),
    }
  }
}

impl fmt::Display for DiskCategory {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Interprets a boolean volume option. Only `yes`, `true` and `1` (any case)
/// are true; anything else, including a missing key, is false.
pub fn parse_bool(value: Option<&str>) -> bool {
  match value {
    Some(v) => matches!(v.to_ascii_lowercase().as_str(), "yes" | "true" | "1"),
    None => false,
  }
}

/// Fully validated attach/detach request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRequest {
  disk_id: String,
  node_id: String,
  zone_id: String,
  region_id: String,
  fs_type: FsType,
  category: DiskCategory,
  read_only: bool,
  encrypted: bool,
}

impl VolumeRequest {
  /// Validates raw volume options, resolving missing node, zone and region
  /// from instance metadata. `default_region` is the last resort for the
  /// region.
  pub async fn parse(
    raw: &HashMap<String, String>,
    metadata: &dyn MetadataService,
    default_region: &str,
  ) -> Result<Self, ValidationError> {
    let disk_id = non_empty(raw, DISK_ID_KEY).ok_or(ValidationError::Missing(DISK_ID_KEY))?;

    let fs_type = match raw.get(FS_TYPE_KEY) {
      Some(value) => value.parse()?,
      None => FsType::default(),
    };
    let category = match raw.get(CATEGORY_KEY) {
      Some(value) => value.parse()?,
      None => DiskCategory::default(),
    };
    let read_only = parse_bool(raw.get(READ_ONLY_KEY).map(String::as_str));
    let encrypted = parse_bool(raw.get(ENCRYPTED_KEY).map(String::as_str));

    let node_id = resolve(raw, NODE_ID_KEY, metadata, metadata::INSTANCE_ID)
      .await
      .ok_or(ValidationError::Unresolved(NODE_ID_KEY))?;
    let zone_id = resolve(raw, ZONE_ID_KEY, metadata, metadata::ZONE_ID)
      .await
      .ok_or(ValidationError::Unresolved(ZONE_ID_KEY))?;
    let region_id = match resolve(raw, REGION_ID_KEY, metadata, metadata::REGION_ID).await {
      Some(region) => region,
      None if !default_region.is_empty() => {
        debug!(region = %default_region, "falling back to default region");
        default_region.to_owned()
      }
      None => return Err(ValidationError::Unresolved(REGION_ID_KEY)),
    };

    Ok(VolumeRequest {
      disk_id,
      node_id,
      zone_id,
      region_id,
      fs_type,
      category,
      read_only,
      encrypted,
    })
  }

  /// Renders the request back into volume options that parse to an equal
  /// request.
  pub fn to_options(&self) -> HashMap<String, String> {
    let mut options = HashMap::new();
    options.insert(DISK_ID_KEY.to_owned(), self.disk_id.clone());
    options.insert(NODE_ID_KEY.to_owned(), self.node_id.clone());
    options.insert(ZONE_ID_KEY.to_owned(), self.zone_id.clone());
    options.insert(REGION_ID_KEY.to_owned(), self.region_id.clone());
    options.insert(FS_TYPE_KEY.to_owned(), self.fs_type.to_string());
    options.insert(CATEGORY_KEY.to_owned(), self.category.to_string());
    options.insert(READ_ONLY_KEY.to_owned(), self.read_only.to_string());
    options.insert(ENCRYPTED_KEY.to_owned(), self.encrypted.to_string());
    options
  }

  #[inline]
  pub fn disk_id(&self) -> &str {
    &self.disk_id
  }

  #[inline]
  pub fn node_id(&self) -> &str {
    &self.node_id
  }

  #[inline]
  pub fn zone_id(&self) -> &str {
    &self.zone_id
  }

  #[inline]
  pub fn region_id(&self) -> &str {
    &self.region_id
  }

  #[inline]
  pub fn fs_type(&self) -> FsType {
    self.fs_type
  }

  #[inline]
  pub fn category(&self) -> DiskCategory {
    self.category
  }

  #[inline]
  pub fn read_only(&self) -> bool {
    self.read_only
  }

  #[inline]
  pub fn encrypted(&self) -> bool {
    self.encrypted
  }
}

fn non_empty(raw: &HashMap<String, String>, key: &str) -> Option<String> {
  raw
    .get(key)
    .map(|v| v.trim())
    .filter(|v| !v.is_empty())
    .map(str::to_owned)
}

async fn resolve(
  raw: &HashMap<String, String>,
  key: &str,
  metadata: &dyn MetadataService,
  resource: &str,
) -> Option<String> {
  if let Some(value) = non_empty(raw, key) {
    return Some(value);
  }

  let value = metadata.get(resource).await?;
  debug!(%key, %value, "resolved from instance metadata");
  Some(value)
}
