use super::{
  signer::{canonical_query, percent_encode, sign, string_to_sign},
  ApiError, ClientFactory, DiskApi, Disk, DiskStatus,
};
use crate::credentials::Credentials;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::{debug, instrument};
use uuid::Uuid;

const API_VERSION: &str = "2014-05-26";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ErrorBody {
  #[serde(default)]
  request_id: String,
  code: String,
  #[serde(default)]
  message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeDisksResponse {
  disks: DiskSet,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DiskSet {
  #[serde(default)]
  disk: Vec<DiskItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DiskItem {
  disk_id: String,
  status: String,
  #[serde(default)]
  instance_id: String,
  #[serde(default)]
  device: String,
  #[serde(default)]
  category: String,
  #[serde(default)]
  zone_id: String,
}

impl From<DiskItem> for Disk {
  fn from(item: DiskItem) -> Self {
    Disk {
      status: DiskStatus::from_api(&item.status),
      disk_id: item.disk_id,
      instance_id: item.instance_id,
      device: item.device,
      category: item.category,
      zone_id: item.zone_id,
    }
  }
}

/// Signed RPC client for the ECS disk API.
pub struct EcsClient {
  http: Client,
  endpoint: String,
  credentials: Credentials,
}

impl EcsClient {
  pub fn new(http: Client, endpoint: impl Into<String>, credentials: Credentials) -> Self {
    EcsClient {
      http,
      endpoint: endpoint.into(),
      credentials,
    }
  }

  fn params(&self, action: &str) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    params.insert("Action".to_owned(), action.to_owned());
    params.insert("Format".to_owned(), "JSON".to_owned());
    params.insert("Version".to_owned(), API_VERSION.to_owned());
    params.insert(
      "AccessKeyId".to_owned(),
      self.credentials.access_key_id().to_owned(),
    );
    params.insert("SignatureMethod".to_owned(), "HMAC-SHA1".to_owned());
    params.insert("SignatureVersion".to_owned(), "1.0".to_owned());
    params.insert("SignatureNonce".to_owned(), Uuid::new_v4().to_string());
    params.insert(
      "Timestamp".to_owned(),
      Utc::now().format(TIMESTAMP_FORMAT).to_string(),
    );
    if let Some(token) = self.credentials.session_token() {
      params.insert("SecurityToken".to_owned(), token.to_owned());
    }
    params
  }

  fn url(&self, params: &BTreeMap<String, String>) -> String {
    let signature = sign(
      self.credentials.access_key_secret(),
      &string_to_sign("GET", params),
    );
    format!(
      "{}?{}&Signature={}",
      self.endpoint,
      canonical_query(params),
      percent_encode(&signature)
    )
  }

  async fn call<T: DeserializeOwned>(&self, params: BTreeMap<String, String>) -> Result<T, ApiError> {
    let response = self
      .http
      .get(&self.url(&params))
      .send()
      .await
      .map_err(|e| ApiError::Transport(e.to_string()))?;

    let status = response.status();
    let body = response
      .bytes()
      .await
      .map_err(|e| ApiError::Transport(e.to_string()))?;

    if status.is_success() {
      return serde_json::from_slice(&body)
        .map_err(|e| ApiError::Transport(format!("malformed response: {}", e)));
    }

    match serde_json::from_slice::<ErrorBody>(&body) {
      Ok(err) => Err(ApiError::Service {
        code: err.code,
        message: err.message,
        request_id: err.request_id,
      }),
      Err(_) => Err(ApiError::Transport(format!(
        "HTTP {}: {}",
        status,
        String::from_utf8_lossy(&body)
      ))),
    }
  }
}

#[async_trait]
impl DiskApi for EcsClient {
  #[instrument(skip(self))]
  async fn attach_disk(&self, disk_id: &str, instance_id: &str) -> Result<(), ApiError> {
    let mut params = self.params("AttachDisk");
    params.insert("DiskId".to_owned(), disk_id.to_owned());
    params.insert("InstanceId".to_owned(), instance_id.to_owned());

    self.call::<serde::de::IgnoredAny>(params).await?;
    debug!("AttachDisk accepted");
    Ok(())
  }

  #[instrument(skip(self))]
  async fn detach_disk(&self, disk_id: &str, instance_id: &str) -> Result<(), ApiError> {
    let mut params = self.params("DetachDisk");
    params.insert("DiskId".to_owned(), disk_id.to_owned());
    params.insert("InstanceId".to_owned(), instance_id.to_owned());

    self.call::<serde::de::IgnoredAny>(params).await?;
    debug!("DetachDisk accepted");
    Ok(())
  }

  #[instrument(skip(self))]
  async fn describe_disk(&self, region_id: &str, disk_id: &str) -> Result<Option<Disk>, ApiError> {
    let mut params = self.params("DescribeDisks");
    params.insert("RegionId".to_owned(), region_id.to_owned());
    params.insert("DiskIds".to_owned(), format!("[\"{}\"]", disk_id));

    let response: DescribeDisksResponse = self.call(params).await?;
    Ok(
      response
        .disks
        .disk
        .into_iter()
        .find(|d| d.disk_id == disk_id)
        .map(Disk::from),
    )
  }
}

/// Builds [`EcsClient`]s sharing one HTTP connection pool.
#[derive(Debug, Clone)]
pub struct EcsClientFactory {
  http: Client,
  endpoint: String,
}

impl EcsClientFactory {
  pub fn new(endpoint: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
    let http = Client::builder().timeout(timeout).build()?;
    Ok(EcsClientFactory {
      http,
      endpoint: endpoint.into(),
    })
  }
}

impl ClientFactory for EcsClientFactory {
  fn new_client(&self, credentials: &Credentials) -> Option<Arc<dyn DiskApi>> {
    if credentials.is_empty() {
      return None;
    }

    Some(Arc::new(EcsClient::new(
      self.http.clone(),
      self.endpoint.clone(),
      credentials.clone(),
    )))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn client(credentials: Credentials) -> EcsClient {
    EcsClient::new(Client::new(), "https://ecs.aliyuncs.com/", credentials)
  }

  #[test]
  fn common_params() {
    let params = client(Credentials::new_static("ak", "sk")).params("DescribeDisks");

    assert_eq!(params["Action"], "DescribeDisks");
    assert_eq!(params["Version"], API_VERSION);
    assert_eq!(params["AccessKeyId"], "ak");
    assert_eq!(params["SignatureMethod"], "HMAC-SHA1");
    assert_eq!(params["Timestamp"].len(), "2026-10-17T12:00:00Z".len());
    assert!(params["Timestamp"].ends_with('Z'));
    assert!(!params.contains_key("SecurityToken"));
  }

  #[test]
  fn token_params_and_signed_url() {
    let client = client(Credentials::new_sts("STS.id", "sk", "token"));
    let params = client.params("AttachDisk");
    assert_eq!(params["SecurityToken"], "token");

    let url = client.url(&params);
    assert!(url.starts_with("https://ecs.aliyuncs.com/?AccessKeyId=STS.id&Action=AttachDisk&"));
    assert!(url.contains("&Signature="));
    assert!(url.contains("SecurityToken=token"));
  }

  #[test]
  fn describe_response_maps_disks() {
    let body = r#"{
      "RequestId": "r-1",
      "TotalCount": 1,
      "Disks": { "Disk": [{
        "DiskId": "d-1",
        "Status": "In_use",
        "InstanceId": "i-1",
        "Device": "/dev/xvdb",
        "Category": "cloud_ssd",
        "ZoneId": "cn-hangzhou-b",
        "Size": 20
      }]}
    }"#;

    let response: DescribeDisksResponse = serde_json::from_str(body).expect("parse");
    let disk = Disk::from(response.disks.disk.into_iter().next().expect("disk"));
    assert_eq!(disk.status, DiskStatus::InUse);
    assert_eq!(disk.device, "/dev/xvdb");
    assert!(disk.is_attached_to("i-1"));
    assert!(!disk.is_attached_to("i-2"));
  }

  #[test]
  fn error_body_parses() {
    let body = r#"{"RequestId":"r-2","HostId":"ecs.aliyuncs.com","Code":"IncorrectDiskStatus","Message":"The current disk status does not support this operation."}"#;
    let err: ErrorBody = serde_json::from_str(body).expect("parse");
    assert_eq!(err.code, "IncorrectDiskStatus");
    assert_eq!(err.request_id, "r-2");
  }

  #[test]
  fn factory_rejects_empty_credentials() {
    let factory =
      EcsClientFactory::new("https://ecs.aliyuncs.com/", Duration::from_secs(1)).expect("factory");
    assert!(factory.new_client(&Credentials::default()).is_none());
    assert!(factory
      .new_client(&Credentials::new_static("ak", "sk"))
      .is_some());
  }
}
