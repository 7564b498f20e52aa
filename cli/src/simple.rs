// Neighbor averaging on a chain of blocks.
//
// Each block owns a few integers. In the first pass it sends its local total
// to both neighbors and posts a global sum; after one exchange every block
// averages what its neighbors sent. Blocks live under a memory limit and
// spill to disk between passes.

use std::{path::PathBuf, sync::Arc};

use mosaic::{
    ops, run_workers,
    storage::{FileStorage, FileStorageConfig, Storage},
    Assigner, BinaryBuffer, BlockCallbacks, BlockID, Communicator, Error, Gid,
    Link, Master, MasterConfig, Result, RoundRobinAssigner, Serialization,
};
use tracing::{debug, info};
use typed_builder::TypedBuilder;

#[derive(Clone, Copy, Debug, TypedBuilder)]
pub struct SimpleSettings {
    #[builder(default = 2)]
    pub workers: usize,
    #[builder(default = 128)]
    pub nblocks: usize,
    #[builder(default = 4)]
    pub threads: usize,
    #[builder(default = 8)]
    pub limit: usize,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Block {
    pub values: Vec<i64>,
    pub average: f64,
    /// Sum over every block.
    pub all_total: i64,
}

impl Block {
    fn new(gid: Gid) -> Self {
        Self {
            values: (0..3).map(|i| gid as i64 * 3 + i).collect(),
            average: 0.0,
            all_total: 0,
        }
    }
}

impl Serialization for Block {
    fn save(&self, bb: &mut BinaryBuffer) {
        self.values.save(bb);
        self.average.save(bb);
        self.all_total.save(bb);
    }

    fn load(bb: &mut BinaryBuffer) -> Result<Self> {
        Ok(Self {
            values: Vec::load(bb)?,
            average: f64::load(bb)?,
            all_total: i64::load(bb)?,
        })
    }
}

fn chain_link(gid: Gid, nblocks: usize, assigner: &dyn Assigner) -> Result<Link> {
    let mut link = Link::new();
    if gid > 0 {
        link.add_neighbor(BlockID::new(gid - 1, 0));
    }
    if gid + 1 < nblocks {
        link.add_neighbor(BlockID::new(gid + 1, 0));
    }
    link.fix(assigner)?;
    Ok(link)
}

#[derive(Clone, Debug, PartialEq)]
pub struct BlockReport {
    pub gid: Gid,
    pub average: f64,
    pub total: i64,
    pub all_total: i64,
}

async fn simple_worker(
    comm: Communicator,
    settings: SimpleSettings,
    dir: PathBuf,
) -> Result<Vec<BlockReport>> {
    let assigner = RoundRobinAssigner::new(comm.size(), settings.nblocks)?;
    let rank = comm.rank();
    let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(
        FileStorageConfig::builder()
            .dir(dir.join(format!("worker-{}", rank)))
            .build(),
    )?);
    let mut master = Master::new(
        comm,
        MasterConfig::builder()
            .threads(settings.threads)
            .limit(settings.limit)
            .build(),
        BlockCallbacks::of(),
        Some(storage.clone()),
    )?;
    for gid in assigner.local_gids(rank) {
        let link = chain_link(gid, settings.nblocks, &assigner)?;
        master.add(gid, Block::new(gid), link)?;
    }

    master.foreach(|b, p| {
        let total: i64 = b.values.iter().sum();
        let neighbors = p.link().clone();
        p.enqueue_all(neighbors.iter(), &total);
        p.all_reduce(total, ops::plus);
        Ok(())
    })?;
    master.exchange().await?;
    master.process_collectives().await?;

    master.foreach(|b, p| {
        b.all_total = p.get()?;
        let senders = p.incoming_gids();
        let mut sum = 0;
        for &from in &senders {
            sum += p.dequeue::<i64>(from)?;
        }
        b.average = sum as f64 / senders.len().max(1) as f64;
        debug!(gid = p.gid(), average = b.average, "averaged");
        Ok(())
    })?;

    let mut reports = Vec::with_capacity(master.size());
    for lid in 0..master.size() {
        let gid = master.gid(lid);
        let b = master.block_mut(lid)?;
        reports.push(BlockReport {
            gid,
            average: b.average,
            total: b.values.iter().sum(),
            all_total: b.all_total,
        });
    }
    info!(
        rank,
        stored = storage.count(),
        max_stored = storage.max_size(),
        "storage"
    );
    Ok(reports)
}

/// Runs the averaging pass. Blocks that don't fit under the limit are kept
/// in `dir`.
pub async fn run(settings: SimpleSettings, dir: PathBuf) -> Result<Vec<BlockReport>> {
    let results = run_workers(settings.workers, move |comm| {
        simple_worker(comm, settings, dir.clone())
    })
    .await?;
    let mut reports: Vec<BlockReport> =
        results.into_iter().flatten().collect();
    reports.sort_by_key(|r| r.gid);
    if reports.len() != settings.nblocks {
        Err(Error::Aborted(format!(
            "expected {} blocks, found {}",
            settings.nblocks,
            reports.len()
        )))?
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn total(gid: Gid) -> i64 {
        9 * gid as i64 + 3
    }

    #[rstest]
    #[case(1, 4, 1, 4)]
    #[case(2, 16, 4, 3)]
    #[case(3, 20, 2, 2)]
    #[tokio::test]
    async fn blocks_average_their_neighbors(
        #[case] workers: usize,
        #[case] nblocks: usize,
        #[case] threads: usize,
        #[case] limit: usize,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let settings = SimpleSettings::builder()
            .workers(workers)
            .nblocks(nblocks)
            .threads(threads)
            .limit(limit)
            .build();
        let reports = run(settings, dir.path().to_path_buf()).await.unwrap();

        let all_total: i64 = (0..nblocks).map(total).sum();
        for r in reports {
            assert_eq!(r.total, total(r.gid));
            assert_eq!(r.all_total, all_total);
            let neighbors: Vec<i64> = [r.gid.checked_sub(1), Some(r.gid + 1)]
                .into_iter()
                .flatten()
                .filter(|&g| g < nblocks)
                .map(total)
                .collect();
            let expected = neighbors.iter().sum::<i64>() as f64 / neighbors.len() as f64;
            assert!((r.average - expected).abs() < 1e-9, "{:?}", r);
        }
    }
}
