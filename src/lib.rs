// ============================================================================
// Tetherkeep Library
// ============================================================================
//
// Keeps durable snapshots of entities a holder has bound, and brings them
// back on request: directly when resident, after a page-in when the region
// can be loaded, and by recreation from the snapshot when it cannot.

pub mod config;
pub mod core;
pub mod facade;
pub mod host;
pub mod storage;
pub mod summon;

pub use config::EngineConfig;
pub use core::{
    BindingView, BlockPos, EntityId, HolderRef, Placement, RegionId, Result, SnapshotRecord,
    StateBlob, TetherError,
};
pub use facade::{BindingToken, PassReport, RelinkOutcome, SummonResponse, TetherEngine};
pub use host::{EntityHost, LiveEntity, PagingTicket, RegionPager};
pub use storage::{
    FlushPolicy, LoadOutcome, PersistenceLayer, RegistryImage, ResidencyVerdict, SnapshotRegistry,
};
pub use summon::{
    JobReport, JobState, JsonCompoundPatcher, RegionRule, StatePatcher, SummonOutcome,
    SummonPolicy,
};
