//! Durable image of the snapshot registry.
//!
//! The whole registry is written as one MessagePack document. Writes go to a
//! temporary file in the same directory which then replaces the durable file;
//! a corrupt durable file is moved aside at startup and the registry starts
//! empty.

use crate::core::{BlockPos, EntityId, RegionId, Result, SnapshotRecord, StateBlob, TetherError};
use crate::storage::registry::{RegistryTables, SnapshotRegistry};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;

// ============================================================================
// Image Format
// ============================================================================

pub const IMAGE_VERSION: u32 = 1;

fn legacy_version() -> u32 {
    1
}

/// Root of the durable file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistryImage {
    #[serde(default = "legacy_version")]
    pub version: u32,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub entries: Vec<ImageEntry>,
    #[serde(default)]
    pub remaps: Vec<RemapPair>,
    #[serde(default)]
    pub pending_deletions: Vec<EntityId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageEntry {
    /// Entries without an identity are skipped on import.
    #[serde(default)]
    pub id: Option<EntityId>,
    #[serde(default)]
    pub state: StateBlob,
    #[serde(default)]
    pub region: Option<RegionId>,
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,
    #[serde(default)]
    pub z: i32,
    #[serde(default)]
    pub resident: bool,
    #[serde(default)]
    pub deceased: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offline_holder: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemapPair {
    pub original: EntityId,
    pub recreated: EntityId,
}

impl RegistryImage {
    pub fn empty() -> Self {
        Self {
            version: IMAGE_VERSION,
            saved_at: None,
            entries: Vec::new(),
            remaps: Vec::new(),
            pending_deletions: Vec::new(),
        }
    }

    pub fn from_tables(tables: &RegistryTables) -> Self {
        let mut entries: Vec<ImageEntry> = tables
            .records
            .values()
            .map(|record| ImageEntry {
                id: Some(record.id),
                state: record.state.clone(),
                region: Some(record.region.clone()),
                x: record.position.x,
                y: record.position.y,
                z: record.position.z,
                resident: record.resident,
                deceased: record.deceased,
                offline_holder: record.offline_holder.clone(),
            })
            .collect();
        entries.sort_by_key(|entry| entry.id);

        let mut remaps: Vec<RemapPair> = tables
            .remaps
            .iter()
            .map(|(original, recreated)| RemapPair {
                original: *original,
                recreated: *recreated,
            })
            .collect();
        remaps.sort_by_key(|pair| pair.original);

        let mut pending_deletions: Vec<EntityId> =
            tables.pending_deletions.iter().copied().collect();
        pending_deletions.sort();

        Self {
            version: IMAGE_VERSION,
            saved_at: Some(Utc::now()),
            entries,
            remaps,
            pending_deletions,
        }
    }

    /// Rebuilds registry tables. Refresh ticks always restart at zero.
    pub fn into_tables(self, default_region: &RegionId) -> RegistryTables {
        let mut tables = RegistryTables::default();

        for entry in self.entries {
            let Some(id) = entry.id else {
                warn!("Skipping stored entry without identity");
                continue;
            };
            let region = entry
                .region
                .filter(|region| !region.as_str().is_empty())
                .unwrap_or_else(|| default_region.clone());
            let mut record = SnapshotRecord::new(
                id,
                entry.state,
                region,
                BlockPos::new(entry.x, entry.y, entry.z),
            );
            record.resident = entry.resident;
            record.deceased = entry.deceased;
            record.offline_holder = entry.offline_holder;
            tables.records.insert(id, record);
        }

        for pair in self.remaps {
            if pair.original == pair.recreated {
                warn!("Skipping self-referencing remap for {}", pair.original);
                continue;
            }
            tables.remaps.insert(pair.original, pair.recreated);
        }

        tables.pending_deletions.extend(self.pending_deletions);
        tables
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(self)
            .map_err(|e| TetherError::EncodeError(format!("Failed to serialize registry image: {}", e)))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let image: RegistryImage = rmp_serde::from_slice(bytes)
            .map_err(|e| TetherError::DecodeError(format!("Failed to deserialize registry image: {}", e)))?;
        if image.version > IMAGE_VERSION {
            return Err(TetherError::UnsupportedVersion {
                found: image.version,
                supported: IMAGE_VERSION,
            });
        }
        Ok(image)
    }
}

// ============================================================================
// Flush Policy
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum FlushPolicy {
    /// Every mutation writes the file before returning.
    #[default]
    Immediate,
    /// Mutations only mark the image dirty; a background worker writes it.
    Debounced { interval_ms: u64 },
}

// ============================================================================
// Persistence Layer
// ============================================================================

/// How a successful write reached the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Atomic,
    Fallback,
}

/// Result of reading the durable file at startup.
#[derive(Debug)]
pub enum LoadOutcome {
    Loaded(RegistryImage),
    Missing,
    Quarantined { moved_to: Option<PathBuf>, reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistenceStats {
    pub flushes: u64,
    pub fallback_writes: u64,
    pub failed_writes: u64,
    pub quarantined: u64,
}

pub struct PersistenceLayer {
    path: PathBuf,
    policy: FlushPolicy,
    dirty: AtomicBool,
    write_lock: Mutex<()>,
    flushes: AtomicU64,
    fallback_writes: AtomicU64,
    failed_writes: AtomicU64,
    quarantined: AtomicU64,
}

impl PersistenceLayer {
    pub fn new<P: AsRef<Path>>(path: P, policy: FlushPolicy) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            policy,
            dirty: AtomicBool::new(false),
            write_lock: Mutex::new(()),
            flushes: AtomicU64::new(0),
            fallback_writes: AtomicU64::new(0),
            failed_writes: AtomicU64::new(0),
            quarantined: AtomicU64::new(0),
        }
    }

    /// Loads the durable file into `registry` and attaches this layer to it.
    ///
    /// A corrupt file never fails startup: it is quarantined and the registry
    /// starts empty.
    pub fn initialize<P: AsRef<Path>>(
        path: P,
        policy: FlushPolicy,
        registry: &SnapshotRegistry,
        default_region: &RegionId,
    ) -> Result<Arc<Self>> {
        let layer = Arc::new(Self::new(path, policy));
        if let Some(parent) = layer.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| TetherError::IoError(format!("Failed to create data directory: {}", e)))?;
        }

        match layer.load() {
            LoadOutcome::Loaded(image) => {
                let tables = image.into_tables(default_region);
                info!(
                    "Loaded {} bound entities from {}",
                    tables.records.len(),
                    layer.path.display()
                );
                registry.replace_tables(tables)?;
            }
            LoadOutcome::Missing => {
                registry.replace_tables(RegistryTables::default())?;
            }
            LoadOutcome::Quarantined { moved_to, reason } => {
                warn!(
                    "Durable file {} is unreadable ({}); moved to {:?}, starting empty",
                    layer.path.display(),
                    reason,
                    moved_to
                );
                registry.replace_tables(RegistryTables::default())?;
            }
        }

        registry.attach_persistence(Arc::clone(&layer))?;
        Ok(layer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn policy(&self) -> FlushPolicy {
        self.policy
    }

    pub fn load(&self) -> LoadOutcome {
        if !self.path.is_file() {
            return LoadOutcome::Missing;
        }

        let decoded = fs::read(&self.path)
            .map_err(|e| TetherError::IoError(format!("Failed to read durable file: {}", e)))
            .and_then(|bytes| RegistryImage::decode(&bytes));

        match decoded {
            Ok(image) => LoadOutcome::Loaded(image),
            Err(err) => {
                self.quarantined.fetch_add(1, Ordering::Relaxed);
                LoadOutcome::Quarantined {
                    moved_to: self.quarantine(),
                    reason: err.to_string(),
                }
            }
        }
    }

    fn quarantine(&self) -> Option<PathBuf> {
        let mut target = sibling_with_suffix(&self.path, ".corrupt");
        if target.exists() {
            let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3f");
            target = sibling_with_suffix(&self.path, &format!(".corrupt-{}", stamp));
        }
        match fs::rename(&self.path, &target) {
            Ok(()) => Some(target),
            Err(err) => {
                warn!("Failed to quarantine {}: {}", self.path.display(), err);
                None
            }
        }
    }

    /// Writes `image` to a temp file and swaps it in; falls back to a direct
    /// write if the swap fails.
    pub fn write_image(&self, image: &RegistryImage) -> Result<WriteMode> {
        let bytes = image.encode()?;
        let result = match self.write_atomic(&bytes) {
            Ok(()) => Ok(WriteMode::Atomic),
            Err(err) => {
                warn!(
                    "Atomic replace of {} failed ({}), writing directly",
                    self.path.display(),
                    err
                );
                self.fallback_writes.fetch_add(1, Ordering::Relaxed);
                fs::write(&self.path, &bytes)
                    .map(|_| WriteMode::Fallback)
                    .map_err(|e| TetherError::IoError(format!("Failed to write durable file: {}", e)))
            }
        };

        match &result {
            Ok(_) => {
                self.flushes.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.failed_writes.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    fn write_atomic(&self, bytes: &[u8]) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut temp = NamedTempFile::new_in(&dir)?;
        temp.write_all(bytes)?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path)
            .map_err(|e| TetherError::IoError(format!("Failed to replace durable file: {}", e.error)))?;
        Ok(())
    }

    /// Exports the registry and writes it. Writers are serialized so the last
    /// write always carries the newest export.
    pub fn flush(&self, registry: &SnapshotRegistry) -> Result<WriteMode> {
        let _writer = self.write_lock.lock()?;
        self.dirty.store(false, Ordering::Release);
        let image = registry.export_image()?;
        self.write_image(&image)
    }

    /// Mutation hook. Must be called with no registry lock held.
    pub fn mark_dirty(&self, registry: &SnapshotRegistry) {
        match self.policy {
            FlushPolicy::Immediate => {
                if let Err(err) = self.flush(registry) {
                    warn!("Failed to persist bound entities: {}", err);
                }
            }
            FlushPolicy::Debounced { .. } => {
                self.dirty.store(true, Ordering::Release);
            }
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    pub fn stats(&self) -> PersistenceStats {
        PersistenceStats {
            flushes: self.flushes.load(Ordering::Relaxed),
            fallback_writes: self.fallback_writes.load(Ordering::Relaxed),
            failed_writes: self.failed_writes.load(Ordering::Relaxed),
            quarantined: self.quarantined.load(Ordering::Relaxed),
        }
    }
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}
