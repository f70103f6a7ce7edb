use crate::model::{is_larger_variant, units_for, Region};
use crate::pool::{AccountPool, SkipReason};
use crate::provider::{
    ApiCredentials, CloudProvider, ProviderError, ProviderErrorKind, ProvisionedInstance,
    RunInstanceSpec,
};
use crate::store::ConfigStore;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Fixed bootstrap preamble injected ahead of the tenant script: set the
/// root password, allow password SSH, and bring up IPv6 on the primary
/// interface.
const BOOTSTRAP_TEMPLATE: &str = r#"#!/bin/bash
set -e
echo "root:__ROOT_PASSWORD__" | chpasswd
sed -i 's/^#\?PasswordAuthentication.*/PasswordAuthentication yes/' /etc/ssh/sshd_config
sed -i 's/^#\?PermitRootLogin.*/PermitRootLogin yes/' /etc/ssh/sshd_config
systemctl restart sshd || service ssh restart
sysctl -w net.ipv6.conf.all.disable_ipv6=0
sysctl -w net.ipv6.conf.default.disable_ipv6=0
dhclient -6 || true
"#;

fn render_user_data(root_password: &str, tenant_script: &str) -> String {
    let mut out = BOOTSTRAP_TEMPLATE.replace("__ROOT_PASSWORD__", root_password);
    if !tenant_script.is_empty() {
        out.push('\n');
        out.push_str(tenant_script);
        out.push('\n');
    }
    out
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("no eligible credential for tenant {tenant} in {region}")]
    NoEligibleCredential { tenant: u64, region: Region },
    #[error("tenant {0} has no provisioning settings")]
    MissingSettings(u64),
    #[error("tenant {tenant} has no machine image for {region}")]
    MissingImage { tenant: u64, region: Region },
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("store error: {0}")]
    Store(String),
}

impl ProvisionError {
    /// The queue treats a dry pool differently from provider failures: the
    /// task parks until credentials come back.
    pub fn is_no_credential(&self) -> bool {
        matches!(self, ProvisionError::NoEligibleCredential { .. })
    }
}

/// Bridge between the makeup queue and the provider: selects a credential,
/// launches one instance, and feeds failures back into the pool as skip
/// annotations.
pub struct Provisioner {
    pool: Arc<AccountPool>,
    store: Arc<dyn ConfigStore>,
    provider: Arc<dyn CloudProvider>,
}

impl Provisioner {
    pub fn new(
        pool: Arc<AccountPool>,
        store: Arc<dyn ConfigStore>,
        provider: Arc<dyn CloudProvider>,
    ) -> Self {
        Self { pool, store, provider }
    }

    pub async fn provision(
        &self,
        tenant: u64,
        region: Region,
    ) -> Result<ProvisionedInstance, ProvisionError> {
        let settings = self
            .store
            .tenant_settings(tenant)
            .await
            .map_err(|e| ProvisionError::Store(e.to_string()))?
            .ok_or(ProvisionError::MissingSettings(tenant))?;

        let ami = settings
            .ami_for(region)
            .ok_or(ProvisionError::MissingImage { tenant, region })?
            .to_string();

        let Some(cred) = self.pool.select_for(&settings.instance_type, region) else {
            return Err(ProvisionError::NoEligibleCredential { tenant, region });
        };

        let credentials = ApiCredentials {
            access_key_id: cred.access_key_id.clone(),
            secret_access_key: cred.secret_access_key.clone(),
        };
        let mut tags = HashMap::new();
        tags.insert("tenant".to_string(), tenant.to_string());
        tags.insert("credential".to_string(), cred.id.clone());

        let spec = RunInstanceSpec {
            credentials: credentials.clone(),
            region,
            ami,
            instance_type: settings.instance_type.clone(),
            disk_gb: settings.disk_gb,
            user_data: render_user_data(&settings.root_password, settings.boot_script_for(region)),
            tags,
        };

        match self.provider.run_instance(&spec).await {
            Ok(instance) => {
                self.pool.increment_usage(
                    &cred.id,
                    &settings.instance_type,
                    units_for(&settings.instance_type),
                );
                tracing::info!(
                    tenant,
                    region = %region,
                    credential = %cred.id,
                    instance_id = %instance.instance_id,
                    public_ip = %instance.public_ip,
                    "instance provisioned"
                );
                Ok(instance)
            }
            Err(err) => {
                self.annotate_failure(&cred.id, &credentials, &settings.instance_type, region, &err)
                    .await;
                Err(err.into())
            }
        }
    }

    /// Turn a provider failure into the right pool annotation; the original
    /// error is always returned to the caller unchanged.
    async fn annotate_failure(
        &self,
        cred_id: &str,
        credentials: &ApiCredentials,
        instance_type: &str,
        region: Region,
        err: &ProviderError,
    ) {
        tracing::warn!(
            credential = cred_id,
            region = %region,
            kind = ?err.kind,
            error = %err,
            "provisioning failed"
        );

        match err.kind {
            ProviderErrorKind::InvalidCredentials => {
                // The run call can report auth failure for region-scoped
                // reasons; only a failed quota probe proves the key pair
                // itself is dead.
                let probe_invalid = matches!(
                    self.provider.describe_quota(credentials, region).await,
                    Err(ProviderError { kind: ProviderErrorKind::InvalidCredentials, .. })
                );
                if probe_invalid {
                    if let Err(store_err) = self.store.mark_credential_invalid(cred_id).await {
                        tracing::error!(credential = cred_id, error = %store_err, "failed to persist credential invalidation");
                    }
                    self.pool.remove(cred_id);
                    tracing::error!(credential = cred_id, "credential permanently invalidated");
                } else if region == Region::Hk {
                    if let Err(enable_err) = self.provider.enable_region(credentials, region).await {
                        tracing::warn!(credential = cred_id, error = %enable_err, "region enablement request failed");
                    }
                    self.pool
                        .mark_skipped(cred_id, SkipReason::RegionNotEnabled, Some(&err.message));
                } else {
                    self.pool
                        .mark_skipped(cred_id, SkipReason::RegionCredentialsFailed, Some(&err.message));
                }
            }
            ProviderErrorKind::PendingVerification => {
                self.pool
                    .mark_skipped(cred_id, SkipReason::RegionPendingVerification, Some(&err.message));
            }
            ProviderErrorKind::QuotaExceeded => {
                if is_larger_variant(instance_type) {
                    self.pool.mark_instance_type_skipped(
                        cred_id,
                        instance_type,
                        SkipReason::RegionQuotaExhausted,
                        Some(&err.message),
                    );
                } else {
                    self.pool
                        .mark_skipped(cred_id, SkipReason::RegionQuotaExhausted, Some(&err.message));
                }
            }
            ProviderErrorKind::Other => {
                self.pool
                    .mark_skipped(cred_id, SkipReason::RegionOther, Some(&err.message));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::model::TenantSettings;
    use crate::provider::tests_support::FakeProvider;
    use crate::store::tests_support::MemStore;
    use crate::store::CredentialRecord;
    use std::sync::atomic::Ordering;

    fn settings(tenant: u64, instance_type: &str) -> TenantSettings {
        let mut amis = HashMap::new();
        amis.insert(Region::Hk, "ami-hk".to_string());
        amis.insert(Region::Jp, "ami-jp".to_string());
        let mut scripts = HashMap::new();
        scripts.insert(Region::Hk, "echo tenant-setup".to_string());
        TenantSettings {
            tenant_id: tenant,
            instance_type: instance_type.to_string(),
            disk_gb: 40,
            root_password: "hunter2".to_string(),
            amis,
            boot_scripts: scripts,
        }
    }

    fn cred(id: &str, region: Region) -> CredentialRecord {
        CredentialRecord {
            id: id.to_string(),
            tenant_id: 7,
            access_key_id: format!("AK{id}"),
            secret_access_key: "secret".to_string(),
            region,
            provider_status: None,
            invalidated: false,
        }
    }

    struct Rig {
        pool: Arc<AccountPool>,
        store: Arc<MemStore>,
        provider: Arc<FakeProvider>,
        provisioner: Provisioner,
    }

    fn rig(instance_type: &str, creds: Vec<CredentialRecord>) -> Rig {
        let bus = Arc::new(EventBus::new());
        let store = Arc::new(MemStore::default());
        store.put_settings(vec![settings(7, instance_type)]);
        let pool = Arc::new(AccountPool::new(bus, store.clone(), 4));
        for c in creds {
            pool.add(c);
        }
        let provider = Arc::new(FakeProvider::default());
        let provisioner = Provisioner::new(pool.clone(), store.clone(), provider.clone());
        Rig { pool, store, provider, provisioner }
    }

    #[test]
    fn user_data_injects_password_then_tenant_script() {
        let rendered = render_user_data("hunter2", "echo tenant-setup");
        assert!(rendered.starts_with("#!/bin/bash"));
        assert!(rendered.contains("root:hunter2"));
        let preamble_end = rendered.find("dhclient -6").unwrap();
        assert!(rendered.find("echo tenant-setup").unwrap() > preamble_end);
    }

    #[tokio::test]
    async fn success_increments_usage_and_tags_the_instance() {
        let r = rig("c5n.large", vec![cred("2", Region::Hk)]);

        let out = r.provisioner.provision(7, Region::Hk).await.unwrap();
        assert!(!out.instance_id.is_empty());

        let status = r.pool.status().remove(0);
        assert_eq!(status.used_capacity, 1);

        let calls = r.provider.run_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tags["tenant"], "7");
        assert_eq!(calls[0].tags["credential"], "2");
        assert_eq!(calls[0].ami, "ami-hk");
        assert!(calls[0].user_data.contains("echo tenant-setup"));
    }

    #[tokio::test]
    async fn empty_pool_reports_no_eligible_credential() {
        let r = rig("c5n.large", vec![]);
        let err = r.provisioner.provision(7, Region::Hk).await.unwrap_err();
        assert!(err.is_no_credential());
    }

    #[tokio::test]
    async fn missing_settings_is_an_error() {
        let r = rig("c5n.large", vec![cred("2", Region::Hk)]);
        let err = r.provisioner.provision(8, Region::Hk).await.unwrap_err();
        assert!(matches!(err, ProvisionError::MissingSettings(8)));
    }

    #[tokio::test]
    async fn quota_failure_on_large_shape_skips_the_type_only() {
        let r = rig("c5n.xlarge", vec![cred("2", Region::Hk)]);
        r.provider.push_run_err(ProviderErrorKind::QuotaExceeded, "vCPU limit exceeded");

        let err = r.provisioner.provision(7, Region::Hk).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Provider(_)));

        let status = r.pool.status().remove(0);
        assert!(status.skipped.is_none());
        assert_eq!(
            status.skipped_types,
            vec![("c5n.xlarge".to_string(), SkipReason::RegionQuotaExhausted)]
        );
    }

    #[tokio::test]
    async fn quota_failure_on_smallest_shape_skips_globally() {
        let r = rig("c5n.large", vec![cred("2", Region::Hk)]);
        r.provider.push_run_err(ProviderErrorKind::QuotaExceeded, "vCPU limit exceeded");

        r.provisioner.provision(7, Region::Hk).await.unwrap_err();
        let status = r.pool.status().remove(0);
        assert_eq!(status.skipped, Some(SkipReason::RegionQuotaExhausted));
    }

    #[tokio::test]
    async fn dead_credentials_are_invalidated_and_removed() {
        let r = rig("c5n.large", vec![cred("2", Region::Hk)]);
        r.provider.push_run_err(ProviderErrorKind::InvalidCredentials, "AuthFailure");
        r.provider.set_quota_err(ProviderErrorKind::InvalidCredentials, "AuthFailure");

        r.provisioner.provision(7, Region::Hk).await.unwrap_err();

        assert_eq!(r.store.invalidated_ids(), vec!["2".to_string()]);
        assert_eq!(r.pool.size(), 0);
    }

    #[tokio::test]
    async fn hk_auth_failure_with_live_key_requests_region_enablement() {
        let r = rig("c5n.large", vec![cred("2", Region::Hk)]);
        r.provider.push_run_err(ProviderErrorKind::InvalidCredentials, "AuthFailure");

        r.provisioner.provision(7, Region::Hk).await.unwrap_err();

        assert_eq!(r.provider.enable_calls.load(Ordering::SeqCst), 1);
        let status = r.pool.status().remove(0);
        assert_eq!(status.skipped, Some(SkipReason::RegionNotEnabled));
    }

    #[tokio::test]
    async fn non_hk_auth_failure_with_live_key_skips_as_credentials_failed() {
        let r = rig("c5n.large", vec![cred("2", Region::Jp)]);
        r.provider.push_run_err(ProviderErrorKind::InvalidCredentials, "AuthFailure");

        r.provisioner.provision(7, Region::Jp).await.unwrap_err();

        assert_eq!(r.provider.enable_calls.load(Ordering::SeqCst), 0);
        let status = r.pool.status().remove(0);
        assert_eq!(status.skipped, Some(SkipReason::RegionCredentialsFailed));
    }

    #[tokio::test]
    async fn pending_verification_and_other_map_to_their_reasons() {
        let r = rig("c5n.large", vec![cred("2", Region::Hk)]);
        r.provider.push_run_err(ProviderErrorKind::PendingVerification, "pending verification");
        r.provisioner.provision(7, Region::Hk).await.unwrap_err();
        assert_eq!(
            r.pool.status().remove(0).skipped,
            Some(SkipReason::RegionPendingVerification)
        );

        r.pool.reset("2");
        r.provider.push_run_err(ProviderErrorKind::Other, "InsufficientInstanceCapacity");
        r.provisioner.provision(7, Region::Hk).await.unwrap_err();
        assert_eq!(r.pool.status().remove(0).skipped, Some(SkipReason::RegionOther));
    }
}
