/// Concurrent access tests
///
/// Bindings and summons from many tasks at once, plus the background flush worker
/// Run with: cargo test --test concurrent_access_tests

mod common;

use common::{FakeWorld, OVERWORLD, engine, holder};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tetherkeep::storage::spawn_flush_worker;
use tetherkeep::{
    BlockPos, EngineConfig, EntityId, FlushPolicy, PersistenceLayer, Placement, RegionId,
    RegistryImage, SnapshotRegistry, StateBlob, SummonOutcome,
};

#[tokio::test]
async fn test_concurrent_binds_are_all_persisted() {
    let temp_dir = TempDir::new().unwrap();
    let world = FakeWorld::new();
    let config = EngineConfig::default();
    let engine = Arc::new(engine(&world, config.clone()));
    engine.on_start(temp_dir.path()).unwrap();

    let num_tasks = 8;
    let per_task = 25;
    let mut handles = vec![];
    for task_id in 0..num_tasks {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            for i in 0..per_task {
                let position = BlockPos::new(task_id, 64, i);
                engine
                    .bind(EntityId::new_v4(), StateBlob::from(vec![task_id as u8]), RegionId::default(), position)
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(engine.registry().len(), (num_tasks * per_task) as usize);
    engine.on_stop().unwrap();

    let path = config.durable_path(temp_dir.path());
    let image = RegistryImage::decode(&fs::read(&path).unwrap()).unwrap();
    assert_eq!(image.entries.len(), (num_tasks * per_task) as usize);
}

#[tokio::test]
async fn test_summons_race_with_engine_passes() {
    let world = FakeWorld::new();
    let engine = Arc::new(engine(&world, EngineConfig::default()));

    let mut horses = Vec::new();
    for i in 0..20 {
        let horse = world.spawn(OVERWORLD, BlockPos::new(i * 3, 64, 0), "herd");
        engine.bind_live(&horse).unwrap();
        horses.push(horse.id);
    }

    let ticker = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            for now in 1..=50u64 {
                engine.run_pass(now * 20);
                tokio::task::yield_now().await;
            }
        })
    };

    let mut handles = vec![];
    for (i, id) in horses.iter().copied().enumerate() {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            let at = Placement::new(OVERWORLD, i as f64, 70.0, 100.0);
            engine.summon(&holder("rider"), &at, id)
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), SummonOutcome::Success);
    }
    ticker.await.unwrap();

    for (i, id) in horses.iter().enumerate() {
        let record = engine.registry().get(*id).unwrap();
        assert_eq!(record.position, BlockPos::new(i as i32, 70, 100));
        assert!(record.resident);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_flush_worker_writes_dirty_registry() {
    let temp_dir = TempDir::new().unwrap();
    let world = FakeWorld::new();
    let config = EngineConfig::default().flush(FlushPolicy::Debounced { interval_ms: 20 });
    let path = config.durable_path(temp_dir.path());
    let engine = engine(&world, config);
    engine.on_start(temp_dir.path()).unwrap();

    let id = EntityId::new_v4();
    engine
        .bind(id, StateBlob::from(vec![1]), RegionId::default(), BlockPos::ORIGIN)
        .unwrap();

    let mut written = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if let Ok(bytes) = fs::read(&path) {
            if let Ok(image) = RegistryImage::decode(&bytes) {
                if image.entries.iter().any(|entry| entry.id == Some(id)) {
                    written = true;
                    break;
                }
            }
        }
    }
    assert!(written, "flush worker never wrote the binding");
    assert!(!engine.registry().persistence().unwrap().is_dirty());

    engine.on_stop().unwrap();
}

#[tokio::test]
async fn test_flush_worker_stop_writes_pending_changes() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("bound.bin");
    let registry = Arc::new(SnapshotRegistry::default());
    PersistenceLayer::initialize(
        &path,
        FlushPolicy::Debounced { interval_ms: 60_000 },
        &registry,
        &RegionId::default(),
    )
    .unwrap();
    let worker = spawn_flush_worker(Arc::clone(&registry)).unwrap();

    let id = EntityId::new_v4();
    registry
        .store(id, StateBlob::from(vec![3]), RegionId::default(), BlockPos::ORIGIN)
        .unwrap();
    assert!(!path.exists());

    worker.stop().await.unwrap();

    let image = RegistryImage::decode(&fs::read(&path).unwrap()).unwrap();
    assert_eq!(image.entries.len(), 1);
    assert_eq!(image.entries[0].id, Some(id));
    assert!(!registry.persistence().unwrap().is_dirty());
}
