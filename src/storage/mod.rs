pub mod persistence;
pub mod registry;
pub mod worker;

pub use persistence::{
    FlushPolicy, IMAGE_VERSION, ImageEntry, LoadOutcome, PersistenceLayer, PersistenceStats,
    RegistryImage, RemapPair, WriteMode,
};
pub use registry::{
    DEFAULT_REFRESH_INTERVAL, RefreshReport, RegistryTables, ResidencyVerdict, SnapshotRegistry,
};
pub use worker::{FlushWorker, spawn_flush_worker};
