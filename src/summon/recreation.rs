//! Rebuilding an evicted entity from its stored snapshot.

use crate::core::{EntityId, Placement, Result, SnapshotRecord, StateBlob, TetherError};
use crate::host::EntityHost;
use crate::storage::SnapshotRegistry;
use log::{info, warn};
use serde_json::{Map, Value, json};

/// Prepares a stored state blob for instantiation at a new place.
pub trait StatePatcher: Send + Sync {
    /// Returns a copy of `state` without identity fields and carrying
    /// `placement`'s coordinates and orientation.
    fn prepare(&self, state: &StateBlob, placement: &Placement) -> Result<StateBlob>;
}

/// Treats the state blob as a JSON object of entity fields.
#[derive(Debug, Clone)]
pub struct JsonCompoundPatcher {
    identity_keys: Vec<String>,
}

impl Default for JsonCompoundPatcher {
    fn default() -> Self {
        Self {
            identity_keys: vec!["UUID".to_string(), "UUIDMost".to_string(), "UUIDLeast".to_string()],
        }
    }
}

impl JsonCompoundPatcher {
    pub fn with_identity_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            identity_keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

impl StatePatcher for JsonCompoundPatcher {
    fn prepare(&self, state: &StateBlob, placement: &Placement) -> Result<StateBlob> {
        let mut fields: Map<String, Value> = serde_json::from_slice(state.as_bytes())
            .map_err(|e| TetherError::StateError(format!("state is not a JSON object: {}", e)))?;

        for key in &self.identity_keys {
            fields.remove(key);
        }
        fields.insert("Pos".to_string(), json!([placement.x, placement.y, placement.z]));
        fields.insert("Rotation".to_string(), json!([placement.yaw, placement.pitch]));

        serde_json::to_vec(&fields)
            .map(StateBlob::from)
            .map_err(|e| TetherError::StateError(format!("failed to encode state: {}", e)))
    }
}

pub struct RecreationProtocol<'a> {
    registry: &'a SnapshotRegistry,
    host: &'a dyn EntityHost,
    patcher: &'a dyn StatePatcher,
}

impl<'a> RecreationProtocol<'a> {
    pub fn new(registry: &'a SnapshotRegistry, host: &'a dyn EntityHost, patcher: &'a dyn StatePatcher) -> Self {
        Self {
            registry,
            host,
            patcher,
        }
    }

    /// Spawns a copy of `id` from its snapshot at `placement`.
    ///
    /// Returns the identity minted for the copy. On error the registry is
    /// left as it was.
    pub fn recreate(&self, id: EntityId, placement: &Placement) -> Result<EntityId> {
        let original = self
            .registry
            .get(id)
            .ok_or_else(|| TetherError::EntityNotFound(id.to_string()))?;
        if original.deceased {
            return Err(TetherError::StateError(format!("{} is deceased", id)));
        }
        if original.state.is_empty() {
            return Err(TetherError::StateError(format!("{} has no stored state", id)));
        }
        if !self.host.region_exists(&placement.region) {
            return Err(TetherError::RegionNotFound(placement.region.to_string()));
        }

        let prepared = self.patcher.prepare(&original.state, placement)?;
        let spawned = self.host.instantiate(&prepared, placement)?;
        if spawned.id == id {
            self.discard_quietly(&spawned);
            return Err(TetherError::HostError(format!(
                "host reused identity {} for a recreated entity",
                id
            )));
        }

        let state = match self.host.capture_state(&spawned) {
            Ok(state) => state,
            Err(err) => {
                warn!("Could not capture recreated {}: {}; keeping prepared state", spawned.id, err);
                prepared
            }
        };
        let mut record = SnapshotRecord::new(spawned.id, state, spawned.region.clone(), spawned.position);
        record.resident = true;

        if let Err(err) = self.registry.commit_recreation(id, record) {
            self.discard_quietly(&spawned);
            return Err(err);
        }
        info!("Recreated {} as {} in {}", id, spawned.id, spawned.region);

        self.neutralize_original(&original);
        Ok(spawned.id)
    }

    /// Discards the stale original now if it is resident, otherwise marks it
    /// for deletion the next time it loads.
    fn neutralize_original(&self, original: &SnapshotRecord) {
        let discarded = match self.host.find_resident(&original.region, original.id) {
            Some(live) => match self.host.discard(&live) {
                Ok(()) => true,
                Err(err) => {
                    warn!("Failed to discard stale original {}: {}", original.id, err);
                    false
                }
            },
            None => false,
        };

        let result = if discarded {
            self.registry.retire_original(original.id)
        } else {
            self.registry.defer_original_deletion(original.id)
        };
        if let Err(err) = result {
            warn!("Failed to settle stale original {}: {}", original.id, err);
        }
    }

    fn discard_quietly(&self, spawned: &crate::host::LiveEntity) {
        if let Err(err) = self.host.discard(spawned) {
            warn!("Failed to discard {} after aborted recreation: {}", spawned.id, err);
        }
    }
}
