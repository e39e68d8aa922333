//! Durable per-tenant credential material.

use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;

use crate::{
    domain::{Credentials, TenantId},
    Result,
};

const CREDS_FILE: &str = "creds.json";

/// Hexagonal port for credential persistence.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self, tenant: &TenantId) -> Result<Option<Credentials>>;
    async fn save(&self, tenant: &TenantId, creds: &Credentials) -> Result<()>;
    /// Remove everything stored for `tenant`. Missing entries are not an error.
    async fn destroy(&self, tenant: &TenantId) -> Result<()>;

    async fn exists(&self, tenant: &TenantId) -> Result<bool> {
        Ok(self.load(tenant).await?.is_some())
    }
}

/// One directory per tenant under `root`.
#[derive(Clone, Debug)]
pub struct FsCredentialStore {
    root: PathBuf,
}

impl FsCredentialStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tenant_dir(&self, tenant: &TenantId) -> PathBuf {
        // TenantId's alphabet excludes separators and dots, so this cannot escape `root`.
        self.root.join(tenant.as_str())
    }
}

#[async_trait]
impl CredentialStore for FsCredentialStore {
    async fn load(&self, tenant: &TenantId) -> Result<Option<Credentials>> {
        let path = self.tenant_dir(tenant).join(CREDS_FILE);
        match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => Ok(None),
            Ok(bytes) => Ok(Some(Credentials(bytes))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, tenant: &TenantId, creds: &Credentials) -> Result<()> {
        let dir = self.tenant_dir(tenant);
        tokio::fs::create_dir_all(&dir).await?;

        // Write-then-rename so a crash never leaves a torn file behind.
        let tmp = dir.join(format!("{CREDS_FILE}.tmp"));
        tokio::fs::write(&tmp, creds.as_bytes()).await?;
        tokio::fs::rename(&tmp, dir.join(CREDS_FILE)).await?;
        Ok(())
    }

    async fn destroy(&self, tenant: &TenantId) -> Result<()> {
        match tokio::fs::remove_dir_all(self.tenant_dir(tenant)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process store for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    inner: Mutex<HashMap<TenantId, Credentials>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed credentials synchronously.
    pub fn insert(&self, tenant: TenantId, creds: Credentials) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tenant, creds);
    }

    pub fn contains(&self, tenant: &TenantId) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(tenant)
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self, tenant: &TenantId) -> Result<Option<Credentials>> {
        Ok(self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tenant)
            .cloned())
    }

    async fn save(&self, tenant: &TenantId, creds: &Credentials) -> Result<()> {
        self.insert(tenant.clone(), creds.clone());
        Ok(())
    }

    async fn destroy(&self, tenant: &TenantId) -> Result<()> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(tenant);
        Ok(())
    }
}
