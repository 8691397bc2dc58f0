use crate::core::{Placement, Result};
use crate::host::{EntityHost, LiveEntity};
use crate::storage::SnapshotRegistry;
use log::{debug, warn};

/// Moves a resident instance to `destination` and records where it ended up.
pub fn relocate(
    host: &dyn EntityHost,
    registry: &SnapshotRegistry,
    live: &LiveEntity,
    destination: &Placement,
) -> Result<LiveEntity> {
    let moved = if live.region != destination.region {
        debug!(
            "Transferring {} from {} to {}",
            live.id, live.region, destination.region
        );
        host.transfer_region(live, destination)?
    } else {
        host.move_within_region(live, destination)?
    };

    let state = match host.capture_state(&moved) {
        Ok(state) => Some(state),
        Err(err) => {
            warn!("Relocated {} but could not capture its state: {}", moved.id, err);
            None
        }
    };
    registry.record_relocation(&moved, state)?;
    Ok(moved)
}
