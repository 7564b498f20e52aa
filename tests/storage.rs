use std::sync::Arc;

use mosaic::{
    local_world,
    storage::{FileStorage, FileStorageConfig, MemoryStorage, Storage},
    BinaryBuffer, BlockCallbacks, Link, Master, MasterConfig, Result,
    Serialization,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rstest::rstest;

#[derive(Debug, Default, Clone, PartialEq)]
struct Particles {
    gid: u64,
    positions: Vec<f32>,
}

impl Particles {
    /// Same gid, same particles.
    fn generate(gid: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(gid);
        Self {
            gid,
            positions: (0..100).map(|_| rng.gen_range(0.0..1.0)).collect(),
        }
    }
}

impl Serialization for Particles {
    fn save(&self, bb: &mut BinaryBuffer) {
        self.gid.save(bb);
        self.positions.save(bb);
    }

    fn load(bb: &mut BinaryBuffer) -> Result<Self> {
        Ok(Self {
            gid: u64::load(bb)?,
            positions: Vec::load(bb)?,
        })
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

enum Backend {
    Memory,
    File { compress: bool },
}

#[rstest]
#[case(Backend::Memory)]
#[case(Backend::File { compress: false })]
#[case(Backend::File { compress: true })]
fn blocks_survive_eviction(#[case] backend: Backend) {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let storage: Arc<dyn Storage> = match backend {
        Backend::Memory => Arc::new(MemoryStorage::new()),
        Backend::File { compress } => Arc::new(
            FileStorage::new(
                FileStorageConfig::builder()
                    .dir(dir.path())
                    .compress(compress)
                    .build(),
            )
            .unwrap(),
        ),
    };

    let comm = local_world(1).pop().unwrap();
    let mut master = Master::new(
        comm,
        MasterConfig::builder().limit(2).build(),
        BlockCallbacks::of(),
        Some(storage.clone()),
    )
    .unwrap();
    for gid in 0..5 {
        master
            .add(gid, Particles::generate(gid as u64), Link::new())
            .unwrap();
    }

    master
        .foreach(|block, p| {
            assert_eq!(block.gid, p.gid() as u64);
            Ok(())
        })
        .unwrap();

    let stats = master.stats();
    assert!(stats.evictions >= 3, "{:?}", stats);
    assert!(stats.reloads >= 3, "{:?}", stats);
    assert!(stats.peak_resident <= 2, "{:?}", stats);
    assert_eq!(storage.count(), 3);

    for lid in 0..5 {
        let gid = master.gid(lid) as u64;
        assert_eq!(master.block_mut(lid).unwrap(), &Particles::generate(gid));
    }

    drop(master);
    assert_eq!(storage.count(), 0);
}

#[test]
fn parallel_batches_respect_the_limit() {
    let comm = local_world(1).pop().unwrap();
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let mut master = Master::new(
        comm,
        MasterConfig::builder().threads(4).limit(3).build(),
        BlockCallbacks::of(),
        Some(storage),
    )
    .unwrap();
    for gid in 0..10 {
        master
            .add(gid, Particles::generate(gid as u64), Link::new())
            .unwrap();
    }
    master
        .foreach(|block, _| {
            block.positions.push(-1.0);
            Ok(())
        })
        .unwrap();
    assert!(master.stats().peak_resident <= 3);
    for lid in 0..10 {
        assert_eq!(master.block_mut(lid).unwrap().positions.len(), 101);
    }
}
