//! Package and configuration storage
//!
//! Plugin packages are gzip tarballs with `plugin.json` at the root. The
//! filesystem store stages each package under `<plugin_dir>/.staging` and
//! renames it into `<plugin_dir>/<id>` on commit, so a half-written package
//! never shows up as installed.

use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{PluginResult, PluginRuntimeError};
use crate::manifest::{PluginManifest, MANIFEST_FILE};

/// Persistence for plugin-local configuration
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn load(&self, plugin_id: &str) -> PluginResult<Map<String, Value>>;

    async fn save(&self, plugin_id: &str, key: &str, value: Value) -> PluginResult<()>;

    async fn delete(&self, plugin_id: &str) -> PluginResult<()>;
}

/// In-memory [`ConfigStore`]; the default when the host supplies none
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    values: RwLock<HashMap<String, Map<String, Value>>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn load(&self, plugin_id: &str) -> PluginResult<Map<String, Value>> {
        Ok(self.values.read().await.get(plugin_id).cloned().unwrap_or_default())
    }

    async fn save(&self, plugin_id: &str, key: &str, value: Value) -> PluginResult<()> {
        self.values
            .write()
            .await
            .entry(plugin_id.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, plugin_id: &str) -> PluginResult<()> {
        self.values.write().await.remove(plugin_id);
        Ok(())
    }
}

/// An unpacked package waiting to be committed or discarded
#[derive(Debug, Clone)]
pub struct StagedPackage {
    pub dir: PathBuf,
    pub manifest: PluginManifest,
}

/// Storage for installed plugin packages
#[async_trait]
pub trait PluginStore: Send + Sync {
    /// Unpack a package into a staging area and read its manifest
    async fn unpack(&self, package: &[u8]) -> PluginResult<StagedPackage>;

    /// Move a staged package to its install directory
    async fn commit(&self, staged: &StagedPackage, plugin_id: &str) -> PluginResult<PathBuf>;

    async fn discard(&self, staged: &StagedPackage) -> PluginResult<()>;

    /// Move the installed files aside; `None` when nothing is installed
    async fn backup(&self, plugin_id: &str) -> PluginResult<Option<PathBuf>>;

    /// Put a backup back in place of whatever is installed now
    async fn restore(&self, plugin_id: &str, backup: &Path) -> PluginResult<()>;

    async fn drop_backup(&self, backup: &Path) -> PluginResult<()>;

    /// Delete the installed files, if any
    async fn remove(&self, plugin_id: &str) -> PluginResult<()>;
}

/// [`PluginStore`] rooted at a plugin directory
#[derive(Debug, Clone)]
pub struct FilesystemPluginStore {
    root: PathBuf,
}

impl FilesystemPluginStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn install_dir(&self, plugin_id: &str) -> PluginResult<PathBuf> {
        let unsafe_id = plugin_id.is_empty()
            || plugin_id.starts_with('.')
            || plugin_id.contains(['/', '\\', '\0'])
            || plugin_id.contains("..");
        if unsafe_id {
            return Err(PluginRuntimeError::Package(format!(
                "plugin id '{plugin_id}' cannot be used as a directory name"
            )));
        }
        Ok(self.root.join(plugin_id))
    }

    fn staging_dir(&self) -> PathBuf {
        self.root.join(".staging")
    }
}

async fn remove_dir_if_exists(path: &Path) -> PluginResult<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn extract(package: &[u8], dest: &Path) -> PluginResult<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(Cursor::new(package)));
    let entries = archive
        .entries()
        .map_err(|e| PluginRuntimeError::Package(format!("not a gzip tarball: {e}")))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| PluginRuntimeError::Package(format!("corrupt archive: {e}")))?;
        let kind = entry.header().entry_type();
        if !(kind.is_file() || kind.is_dir()) {
            let path = entry.path().map(|p| p.display().to_string()).unwrap_or_default();
            return Err(PluginRuntimeError::Package(format!(
                "unsupported archive entry '{path}' (only files and directories are allowed)"
            )));
        }
        let inside = entry
            .unpack_in(dest)
            .map_err(|e| PluginRuntimeError::Package(format!("cannot unpack entry: {e}")))?;
        if !inside {
            return Err(PluginRuntimeError::Package(
                "archive entry escapes the package directory".to_string(),
            ));
        }
    }
    Ok(())
}

/// Build a package from `(path, contents)` pairs
pub fn pack_package(files: &[(&str, &[u8])]) -> PluginResult<Vec<u8>> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, *contents)?;
    }
    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

#[async_trait]
impl PluginStore for FilesystemPluginStore {
    async fn unpack(&self, package: &[u8]) -> PluginResult<StagedPackage> {
        let dir = self.staging_dir().join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&dir).await?;

        let bytes = package.to_vec();
        let target = dir.clone();
        let extracted = tokio::task::spawn_blocking(move || extract(&bytes, &target))
            .await
            .map_err(|e| PluginRuntimeError::Package(format!("unpack task failed: {e}")));

        let manifest = match extracted.and_then(|r| r) {
            Ok(()) => match tokio::fs::read_to_string(dir.join(MANIFEST_FILE)).await {
                Ok(raw) => PluginManifest::from_json(&raw)
                    .map_err(|e| PluginRuntimeError::Package(format!("invalid {MANIFEST_FILE}: {e}"))),
                Err(_) => Err(PluginRuntimeError::Package(format!(
                    "package has no {MANIFEST_FILE} at its root"
                ))),
            },
            Err(e) => Err(e),
        };

        match manifest {
            Ok(manifest) => {
                debug!(staging = %dir.display(), name = %manifest.name, "Package unpacked");
                Ok(StagedPackage { dir, manifest })
            }
            Err(e) => {
                remove_dir_if_exists(&dir).await?;
                Err(e)
            }
        }
    }

    async fn commit(&self, staged: &StagedPackage, plugin_id: &str) -> PluginResult<PathBuf> {
        let target = self.install_dir(plugin_id)?;
        if tokio::fs::try_exists(&target).await? {
            return Err(PluginRuntimeError::Package(format!(
                "install directory for plugin {plugin_id} already exists"
            )));
        }
        tokio::fs::rename(&staged.dir, &target).await?;
        debug!(plugin_id, path = %target.display(), "Package committed");
        Ok(target)
    }

    async fn discard(&self, staged: &StagedPackage) -> PluginResult<()> {
        remove_dir_if_exists(&staged.dir).await
    }

    async fn backup(&self, plugin_id: &str) -> PluginResult<Option<PathBuf>> {
        let installed = self.install_dir(plugin_id)?;
        if !tokio::fs::try_exists(&installed).await? {
            return Ok(None);
        }
        let backup = self.root.join(format!(".backup-{plugin_id}-{}", Uuid::new_v4()));
        tokio::fs::rename(&installed, &backup).await?;
        Ok(Some(backup))
    }

    async fn restore(&self, plugin_id: &str, backup: &Path) -> PluginResult<()> {
        let installed = self.install_dir(plugin_id)?;
        remove_dir_if_exists(&installed).await?;
        tokio::fs::rename(backup, &installed).await?;
        warn!(plugin_id, "Restored plugin files from backup");
        Ok(())
    }

    async fn drop_backup(&self, backup: &Path) -> PluginResult<()> {
        remove_dir_if_exists(backup).await
    }

    async fn remove(&self, plugin_id: &str) -> PluginResult<()> {
        remove_dir_if_exists(&self.install_dir(plugin_id)?).await
    }
}
