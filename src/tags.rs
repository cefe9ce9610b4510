//! Out-of-band tags on mirror files
//!
//! Tags live in extended attributes where the filesystem supports them and in
//! a JSON sidecar under the state directory otherwise. Both backends behave
//! the same through `get`/`set`/`clear`.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use tracing::{debug, warn};

use crate::config::TagBackendKind;
use crate::state::StateStore;

/// Original modification time recorded when a mirror file was confirmed unchanged
pub const MTIME_TAG: &str = "user.mirrorsync.mtime";

type SidecarEntries = BTreeMap<String, BTreeMap<String, String>>;

enum Backend {
    #[cfg(unix)]
    Xattr,
    Sidecar {
        path: PathBuf,
        entries: Mutex<SidecarEntries>,
    },
}

/// Named string attributes attached to files
pub struct TagStore {
    backend: Backend,
}

impl TagStore {
    /// Pick a backend; `Auto` probes extended attribute support inside `probe_dir`
    pub fn open(kind: TagBackendKind, probe_dir: &Path, state: &StateStore) -> Result<Self> {
        match kind {
            TagBackendKind::Sidecar => Self::sidecar(state.tag_sidecar_path()),
            TagBackendKind::Xattr => Self::xattr(),
            TagBackendKind::Auto => {
                if xattr_supported(probe_dir) {
                    Self::xattr()
                } else {
                    debug!("Extended attributes unavailable in {}, using sidecar tags", probe_dir.display());
                    Self::sidecar(state.tag_sidecar_path())
                }
            }
        }
    }

    #[cfg(unix)]
    pub fn xattr() -> Result<Self> {
        Ok(Self { backend: Backend::Xattr })
    }

    #[cfg(not(unix))]
    pub fn xattr() -> Result<Self> {
        Err(crate::error::SyncError::Config("extended attributes are not supported on this platform".to_string()).into())
    }

    /// Sidecar backend persisted at `path`
    pub fn sidecar(path: PathBuf) -> Result<Self> {
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse tag sidecar {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SidecarEntries::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read tag sidecar {}", path.display()))
            }
        };

        Ok(Self {
            backend: Backend::Sidecar {
                path,
                entries: Mutex::new(entries),
            },
        })
    }

    pub fn backend_name(&self) -> &'static str {
        match self.backend {
            #[cfg(unix)]
            Backend::Xattr => "xattr",
            Backend::Sidecar { .. } => "sidecar",
        }
    }

    /// Read a tag; unreadable attributes count as absent
    pub fn get(&self, path: &Path, name: &str) -> Result<Option<String>> {
        match &self.backend {
            #[cfg(unix)]
            Backend::Xattr => match xattr::get(path, name) {
                Ok(value) => Ok(value.map(|bytes| String::from_utf8_lossy(&bytes).into_owned())),
                Err(e) => {
                    debug!("Could not read tag {} on {}: {}", name, path.display(), e);
                    Ok(None)
                }
            },
            Backend::Sidecar { entries, .. } => {
                let entries = entries.lock().unwrap_or_else(|e| e.into_inner());
                Ok(entries
                    .get(&sidecar_key(path))
                    .and_then(|tags| tags.get(name))
                    .cloned())
            }
        }
    }

    pub fn set(&self, path: &Path, name: &str, value: &str) -> Result<()> {
        match &self.backend {
            #[cfg(unix)]
            Backend::Xattr => xattr::set(path, name, value.as_bytes())
                .with_context(|| format!("Failed to set tag {} on {}", name, path.display())),
            Backend::Sidecar { path: sidecar, entries } => {
                let mut entries = entries.lock().unwrap_or_else(|e| e.into_inner());
                entries
                    .entry(sidecar_key(path))
                    .or_default()
                    .insert(name.to_string(), value.to_string());
                persist(sidecar, &entries)
            }
        }
    }

    /// Remove a tag; removing an absent tag is not an error
    pub fn clear(&self, path: &Path, name: &str) -> Result<()> {
        match &self.backend {
            #[cfg(unix)]
            Backend::Xattr => {
                if let Ok(Some(_)) = xattr::get(path, name) {
                    xattr::remove(path, name)
                        .with_context(|| format!("Failed to clear tag {} on {}", name, path.display()))?;
                }
                Ok(())
            }
            Backend::Sidecar { path: sidecar, entries } => {
                let mut entries = entries.lock().unwrap_or_else(|e| e.into_inner());
                let key = sidecar_key(path);
                let Some(tags) = entries.get_mut(&key) else {
                    return Ok(());
                };
                if tags.remove(name).is_none() {
                    return Ok(());
                }
                if tags.is_empty() {
                    entries.remove(&key);
                }
                persist(sidecar, &entries)
            }
        }
    }

    /// The recorded original modification time, if a parsable one exists
    pub fn mtime(&self, path: &Path) -> Result<Option<SystemTime>> {
        let Some(value) = self.get(path, MTIME_TAG)? else {
            return Ok(None);
        };
        match decode_mtime(&value) {
            Some(time) => Ok(Some(time)),
            None => {
                warn!("Ignoring unparsable {} tag {:?} on {}", MTIME_TAG, value, path.display());
                Ok(None)
            }
        }
    }

    /// Write the mtime tag unless one is already present; returns whether it was written
    pub fn tag_mtime_if_absent(&self, path: &Path, mtime: SystemTime) -> Result<bool> {
        if self.get(path, MTIME_TAG)?.is_some() {
            return Ok(false);
        }
        self.set(path, MTIME_TAG, &encode_mtime(mtime))?;
        Ok(true)
    }
}

pub fn encode_mtime(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn decode_mtime(value: &str) -> Option<SystemTime> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|time| SystemTime::from(time.with_timezone(&Utc)))
}

fn sidecar_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn persist(path: &Path, entries: &SidecarEntries) -> Result<()> {
    let content = serde_json::to_string_pretty(entries).context("Failed to serialize tag sidecar")?;
    std::fs::write(path, content).with_context(|| format!("Failed to write tag sidecar {}", path.display()))
}

#[cfg(unix)]
fn xattr_supported(dir: &Path) -> bool {
    if !xattr::SUPPORTED_PLATFORM {
        return false;
    }
    let Ok(probe) = tempfile::NamedTempFile::new_in(dir) else {
        return false;
    };
    xattr::set(probe.path(), "user.mirrorsync.probe", b"1").is_ok()
}

#[cfg(not(unix))]
fn xattr_supported(_dir: &Path) -> bool {
    false
}
