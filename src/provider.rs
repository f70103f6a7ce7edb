use crate::model::Region;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Provider failure families that drive credential handling. The gateway
/// names the kind when it can; otherwise we classify from the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Authentication rejected; candidate for permanent invalidation.
    InvalidCredentials,
    /// The account works but the region is still under review.
    PendingVerification,
    /// vCPU or instance quota exhausted for the requested shape.
    QuotaExceeded,
    /// Everything else, including transport errors.
    Other,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn other(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Other,
            message: message.into(),
        }
    }
}

/// Access key pair used for account-scoped provider calls.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// Everything needed to launch one instance.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunInstanceSpec {
    pub credentials: ApiCredentials,
    pub region: Region,
    pub ami: String,
    pub instance_type: String,
    pub disk_gb: u32,
    /// Rendered user-data script (bootstrap preamble + tenant script).
    pub user_data: String,
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ProvisionedInstance {
    pub instance_id: String,
    pub public_ip: String,
}

/// Narrow contract over the cloud provider. Every call carries its own
/// deadline; implementations must not be relied on to hold any shared lock.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn run_instance(&self, spec: &RunInstanceSpec) -> Result<ProvisionedInstance, ProviderError>;

    /// Rotate the public IP of an instance (allocate, associate, release).
    /// Returns the new public IP.
    async fn change_instance_ip(&self, region: Region, instance_id: &str) -> Result<String, ProviderError>;

    /// Current vCPU quota for the account in the region. Also doubles as a
    /// cheap validity probe: an invalid key pair fails here too.
    async fn describe_quota(&self, credentials: &ApiCredentials, region: Region) -> Result<f64, ProviderError>;

    async fn enable_region(&self, credentials: &ApiCredentials, region: Region) -> Result<(), ProviderError>;
}

/// Map a raw provider message onto a failure family.
///
/// The substring families mirror what the provider actually returns for
/// auth, review, and quota failures; anything unrecognized is `Other`.
pub fn classify_message(message: &str) -> ProviderErrorKind {
    let lower = message.to_ascii_lowercase();
    const INVALID: [&str; 4] = [
        "invalidclienttokenid",
        "authfailure",
        "signaturedoesnotmatch",
        "credentials invalid",
    ];
    const PENDING: [&str; 2] = ["pending verification", "pendingverification"];
    const QUOTA: [&str; 3] = ["vcpu", "quota", "limit exceeded"];

    if INVALID.iter().any(|n| lower.contains(n)) {
        ProviderErrorKind::InvalidCredentials
    } else if PENDING.iter().any(|n| lower.contains(n)) {
        ProviderErrorKind::PendingVerification
    } else if QUOTA.iter().any(|n| lower.contains(n)) {
        ProviderErrorKind::QuotaExceeded
    } else {
        ProviderErrorKind::Other
    }
}

fn kind_from_tag(tag: &str) -> Option<ProviderErrorKind> {
    match tag {
        "invalidCredentials" => Some(ProviderErrorKind::InvalidCredentials),
        "pendingVerification" => Some(ProviderErrorKind::PendingVerification),
        "quotaExceeded" => Some(ProviderErrorKind::QuotaExceeded),
        "other" => Some(ProviderErrorKind::Other),
        _ => None,
    }
}

/// JSON-over-HTTP client for the provider gateway.
pub struct HttpProvider {
    base_url: String,
    http: reqwest::Client,
}

impl HttpProvider {
    pub fn new(base_url: String, deadline: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(deadline)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    async fn call(&self, op: &str, body: Value) -> Result<Value, ProviderError> {
        let url = format!("{}/v1/{op}", self.base_url);
        let res = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::other(format!("{op} request failed: {e}")))?;

        let status = res.status();
        let payload: Value = res
            .json()
            .await
            .map_err(|e| ProviderError::other(format!("{op} returned unparsable body: {e}")))?;

        if status.is_success() {
            return Ok(payload);
        }

        let message = payload
            .pointer("/error/message")
            .and_then(Value::as_str)
            .unwrap_or("provider call failed")
            .to_string();
        let kind = payload
            .pointer("/error/kind")
            .and_then(Value::as_str)
            .and_then(kind_from_tag)
            .unwrap_or_else(|| classify_message(&message));

        Err(ProviderError { kind, message })
    }
}

fn str_field<'a>(payload: &'a Value, field: &str, op: &str) -> Result<&'a str, ProviderError> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::other(format!("{op} response missing '{field}'")))
}

#[async_trait]
impl CloudProvider for HttpProvider {
    async fn run_instance(&self, spec: &RunInstanceSpec) -> Result<ProvisionedInstance, ProviderError> {
        let body = serde_json::to_value(spec)
            .map_err(|e| ProviderError::other(format!("failed to encode run-instance spec: {e}")))?;
        let payload = self.call("run-instance", body).await?;
        Ok(ProvisionedInstance {
            instance_id: str_field(&payload, "instanceId", "run-instance")?.to_string(),
            public_ip: str_field(&payload, "publicIp", "run-instance")?.to_string(),
        })
    }

    async fn change_instance_ip(&self, region: Region, instance_id: &str) -> Result<String, ProviderError> {
        let payload = self
            .call(
                "change-instance-ip",
                serde_json::json!({ "region": region.code(), "instanceId": instance_id }),
            )
            .await?;
        Ok(str_field(&payload, "publicIp", "change-instance-ip")?.to_string())
    }

    async fn describe_quota(&self, credentials: &ApiCredentials, region: Region) -> Result<f64, ProviderError> {
        let payload = self
            .call(
                "describe-quota",
                serde_json::json!({ "credentials": credentials, "region": region.code() }),
            )
            .await?;
        payload
            .get("vcpuQuota")
            .and_then(Value::as_f64)
            .ok_or_else(|| ProviderError::other("describe-quota response missing 'vcpuQuota'"))
    }

    async fn enable_region(&self, credentials: &ApiCredentials, region: Region) -> Result<(), ProviderError> {
        self.call(
            "enable-region",
            serde_json::json!({ "credentials": credentials, "region": region.code() }),
        )
        .await?;
        Ok(())
    }
}
