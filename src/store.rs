use crate::model::{MonitorConfig, Region, TenantSettings};
use async_trait::async_trait;
use eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// One provisioning credential as held by the external store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRecord {
    /// Numeric-sortable id; selection order depends on it.
    pub id: String,
    pub tenant_id: u64,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// The single region this credential can provision in.
    pub region: Region,
    /// Opaque provider-side status, carried for operators.
    #[serde(default)]
    pub provider_status: Option<String>,
    /// Set when the provider declared the credential permanently invalid.
    /// Invalidated records are kept for audit but never loaded into the pool.
    #[serde(default)]
    pub invalidated: bool,
}

/// Narrow contract over the relational store that owns tenants,
/// credentials, and configuration. The store is authoritative; the control
/// plane re-reads per decision and never caches configs.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn monitor_configs(&self) -> Result<Vec<MonitorConfig>>;
    async fn monitor_config(&self, tenant: u64) -> Result<Option<MonitorConfig>>;
    async fn tenant_settings(&self, tenant: u64) -> Result<Option<TenantSettings>>;
    async fn credentials(&self) -> Result<Vec<CredentialRecord>>;
    /// Persist a provider-declared invalidation so future loads skip the
    /// credential.
    async fn mark_credential_invalid(&self, id: &str) -> Result<()>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreDocument {
    #[serde(default)]
    monitors: Vec<MonitorConfig>,
    #[serde(default)]
    settings: Vec<TenantSettings>,
    #[serde(default)]
    credentials: Vec<CredentialRecord>,
}

/// JSON-file-backed store implementation.
///
/// Stands in for the external relational store behind the same contract;
/// the document is re-read on every query so out-of-band edits are picked
/// up without a restart.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read(&self) -> Result<StoreDocument> {
        let raw = fs::read_to_string(&self.path)
            .map_err(|e| eyre!("failed to read store file {}: {e}", self.path.display()))?;
        serde_json::from_str(&raw)
            .map_err(|e| eyre!("failed to parse store file {}: {e}", self.path.display()))
    }

    fn write(&self, doc: &StoreDocument) -> Result<()> {
        let json = serde_json::to_string_pretty(doc)
            .map_err(|e| eyre!("failed to serialize store document: {e}"))?;

        // Write to a temp file then rename so an interrupted write cannot
        // leave a truncated document behind.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .map_err(|e| eyre!("failed to write temp store file {}: {e}", tmp.display()))?;
        replace_file(&tmp, &self.path)
    }
}

fn replace_file(tmp: &Path, path: &Path) -> Result<()> {
    if let Err(err) = fs::rename(tmp, path) {
        if cfg!(windows) {
            let _ = fs::remove_file(path);
            fs::rename(tmp, path)
                .map_err(|e| eyre!("failed to replace store file {}: {e}", path.display()))?;
        } else {
            return Err(eyre!("failed to replace store file {}: {err}", path.display()));
        }
    }
    Ok(())
}

#[async_trait]
impl ConfigStore for FileStore {
    async fn monitor_configs(&self) -> Result<Vec<MonitorConfig>> {
        Ok(self.read()?.monitors)
    }

    async fn monitor_config(&self, tenant: u64) -> Result<Option<MonitorConfig>> {
        Ok(self.read()?.monitors.into_iter().find(|m| m.tenant_id == tenant))
    }

    async fn tenant_settings(&self, tenant: u64) -> Result<Option<TenantSettings>> {
        Ok(self.read()?.settings.into_iter().find(|s| s.tenant_id == tenant))
    }

    async fn credentials(&self) -> Result<Vec<CredentialRecord>> {
        Ok(self.read()?.credentials)
    }

    async fn mark_credential_invalid(&self, id: &str) -> Result<()> {
        let mut doc = self.read()?;
        let Some(record) = doc.credentials.iter_mut().find(|c| c.id == id) else {
            return Err(eyre!("credential {id} not found in store"));
        };
        record.invalidated = true;
        self.write(&doc)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static SEQ: AtomicU64 = AtomicU64::new(0);

    fn temp_store(doc: &StoreDocument) -> FileStore {
        let path = std::env::temp_dir().join(format!(
            "fleet-keeper-store-test-{}-{}.json",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::SeqCst),
        ));
        fs::write(&path, serde_json::to_string(doc).unwrap()).unwrap();
        FileStore::new(path)
    }

    fn cred(id: &str) -> CredentialRecord {
        CredentialRecord {
            id: id.to_string(),
            tenant_id: 7,
            access_key_id: format!("AK{id}"),
            secret_access_key: "secret".to_string(),
            region: Region::Hk,
            provider_status: None,
            invalidated: false,
        }
    }

    #[tokio::test]
    async fn reads_back_credentials_and_monitors() {
        let store = temp_store(&StoreDocument {
            monitors: vec![MonitorConfig {
                tenant_id: 7,
                enabled: true,
                threshold_hk: 3,
                threshold_jp: 0,
                threshold_sg: 0,
                ip_range_enabled: false,
                ip_prefixes: Default::default(),
            }],
            settings: vec![],
            credentials: vec![cred("2"), cred("10")],
        });

        let monitors = store.monitor_configs().await.unwrap();
        assert_eq!(monitors.len(), 1);
        assert_eq!(store.monitor_config(7).await.unwrap().unwrap().threshold_hk, 3);
        assert!(store.monitor_config(8).await.unwrap().is_none());
        assert_eq!(store.credentials().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn invalidation_persists_across_reads() {
        let store = temp_store(&StoreDocument {
            monitors: vec![],
            settings: vec![],
            credentials: vec![cred("2")],
        });

        store.mark_credential_invalid("2").await.unwrap();
        let creds = store.credentials().await.unwrap();
        assert!(creds[0].invalidated);

        assert!(store.mark_credential_invalid("missing").await.is_err());
    }
}
