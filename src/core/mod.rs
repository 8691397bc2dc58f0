pub mod error;
pub mod record;
pub mod types;

pub use error::{Result, TetherError};
pub use record::{BindingView, SnapshotRecord};
pub use types::{BlockPos, DEFAULT_REGION, EntityId, HolderRef, Placement, RegionId, StateBlob};
