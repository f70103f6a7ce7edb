use crate::model::{now_unix, Region};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

/// Status-alert sink for instance lifecycle transitions. Delivery is
/// best-effort: implementations log failures and never return them to the
/// fleet.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn instance_online(&self, tenant: u64, instance_id: &str, region: Region, ipv4: &str);
    async fn instance_offline(&self, tenant: u64, instance_id: &str, region: Region, ipv4: &str);
}

/// Posts lifecycle events as JSON to a webhook endpoint.
pub struct WebhookNotifier {
    url: String,
    http: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: String, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { url, http }
    }

    async fn post(&self, payload: Value) {
        let event = payload
            .get("event")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        match self.http.post(&self.url).json(&payload).send().await {
            Ok(res) if res.status().is_success() => {}
            Ok(res) => {
                tracing::warn!(event, status = res.status().as_u16(), "notify endpoint rejected event");
            }
            Err(err) => {
                tracing::warn!(event, error = %err, "notify delivery failed");
            }
        }
    }
}

fn payload(event: &str, tenant: u64, instance_id: &str, region: Region, ipv4: &str) -> Value {
    json!({
        "event": event,
        "tenantId": tenant,
        "instanceId": instance_id,
        "region": region.code(),
        "ipv4": ipv4,
        "at": now_unix(),
    })
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn instance_online(&self, tenant: u64, instance_id: &str, region: Region, ipv4: &str) {
        self.post(payload("instanceOnline", tenant, instance_id, region, ipv4))
            .await;
    }

    async fn instance_offline(&self, tenant: u64, instance_id: &str, region: Region, ipv4: &str) {
        self.post(payload("instanceOffline", tenant, instance_id, region, ipv4))
            .await;
    }
}

/// Sink for deployments without a webhook configured.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn instance_online(&self, tenant: u64, instance_id: &str, region: Region, ipv4: &str) {
        tracing::info!(tenant, instance_id, region = %region, ipv4, "instance online");
    }

    async fn instance_offline(&self, tenant: u64, instance_id: &str, region: Region, ipv4: &str) {
        tracing::info!(tenant, instance_id, region = %region, ipv4, "instance offline");
    }
}
