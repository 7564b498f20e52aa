// Parallel sample sort over a k-ary swap.
//
// Every block starts with random values in [min, max]. Rounds alternate
// between building a common histogram inside a contiguous group and
// exchanging values across a round-robin group: the histogram gives k split
// points, each member of the exchange group keeps one range and ships the
// rest to the member that owns it. After the last exchange every block holds
// one contiguous range of values, and ranges grow with the gid.
//
// Every block runs every round (`reduce_all`). Skipping the histogram rounds
// for blocks outside the next exchange would save work, but each histogram
// has to reach every member of its group, so nothing here is skipped.

use std::{path::PathBuf, sync::Arc};

use mosaic::{
    ops, reduce_all, run_workers,
    storage::{FileStorage, FileStorageConfig, Storage},
    Assigner, BinaryBuffer, BlockCallbacks, Communicator, ContiguousAssigner,
    Error, Gid, Link, Master, MasterConfig, Partners, ReduceProxy, Result,
    Serialization, SortPartners, SortRound,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, info};
use typed_builder::TypedBuilder;

pub type Value = f32;
type Histogram = Vec<u64>;

#[derive(Clone, Copy, Debug, TypedBuilder)]
pub struct SortSettings {
    #[builder(default = 2)]
    pub workers: usize,
    #[builder(default = 8)]
    pub nblocks: usize,
    #[builder(default = 2)]
    pub k: usize,
    /// Values generated per block.
    #[builder(default = 100)]
    pub num_values: usize,
    /// Histogram bins per exchange partner.
    #[builder(default = 32)]
    pub hist: usize,
    #[builder(default = 1)]
    pub threads: usize,
    /// Blocks kept in memory per worker.
    #[builder(default, setter(strip_option))]
    pub limit: Option<usize>,
    #[builder(default = 0.0)]
    pub min: Value,
    #[builder(default = (1 << 20) as Value)]
    pub max: Value,
    #[builder(default = 0)]
    pub seed: u64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Block {
    pub min: Value,
    pub max: Value,
    pub values: Vec<Value>,
    bins: usize,
}

impl Block {
    fn generate(settings: &SortSettings, gid: Gid) -> Self {
        let mut rng = StdRng::seed_from_u64(settings.seed.wrapping_add(gid as u64));
        Self {
            min: settings.min,
            max: settings.max,
            values: (0..settings.num_values)
                .map(|_| rng.gen_range(settings.min..settings.max))
                .collect(),
            bins: settings.k * settings.hist,
        }
    }

    fn width(&self) -> Value {
        (self.max - self.min) / self.bins as Value
    }

    fn bin(&self, x: Value) -> usize {
        let width = self.width();
        if width <= 0.0 {
            return 0;
        }
        (((x - self.min) / width) as usize).min(self.bins.saturating_sub(1))
    }

    /// Takes in values sent by the rest of the exchange group. Anything below
    /// this block's range means the splits disagreed, and the run can't
    /// continue.
    fn absorb(&mut self, incoming: Vec<Value>) -> Result<()> {
        for x in incoming {
            if x < self.min {
                Err(Error::Aborted(format!(
                    "received {} below this block's min of {}",
                    x, self.min
                )))?
            }
            self.values.push(x);
        }
        Ok(())
    }

    /// Split points for `k` ranges, starting with `min`.
    fn splits(&self, histogram: &Histogram, k: usize) -> Vec<Value> {
        let total: u64 = histogram.iter().sum();
        let width = self.width();
        let mut splits = vec![self.min];
        let mut cur = 0;
        for (i, &count) in histogram.iter().enumerate() {
            if splits.len() == k {
                break;
            }
            if cur + count > total / k as u64 * splits.len() as u64 {
                // mid-point of the bin
                splits.push(self.min + width * i as Value + width / 2.0);
            }
            cur += count;
        }
        while splits.len() < k {
            splits.push(self.max);
        }
        splits
    }
}

impl Serialization for Block {
    fn save(&self, bb: &mut BinaryBuffer) {
        self.min.save(bb);
        self.max.save(bb);
        self.values.save(bb);
        self.bins.save(bb);
    }

    fn load(bb: &mut BinaryBuffer) -> Result<Self> {
        Ok(Self {
            min: Value::load(bb)?,
            max: Value::load(bb)?,
            values: Vec::load(bb)?,
            bins: usize::load(bb)?,
        })
    }
}

fn compute_local_histogram(b: &mut Block, rp: &mut ReduceProxy<'_>) -> Result<()> {
    if rp.round() == 0 {
        b.min = rp.get()?;
        b.max = rp.get()?;
    }
    let mut histogram: Histogram = vec![0; b.bins];
    for &x in &b.values {
        histogram[b.bin(x)] += 1;
    }
    let targets = rp.out_link().clone();
    rp.enqueue_all(targets.iter(), &histogram);
    Ok(())
}

fn receive_histogram(rp: &mut ReduceProxy<'_>) -> Result<Histogram> {
    let mut histogram = Histogram::new();
    let senders: Vec<Gid> = rp.in_link().iter().map(|t| t.gid).collect();
    for from in senders {
        let hist: Histogram = rp.dequeue(from)?;
        if histogram.len() < hist.len() {
            histogram.resize(hist.len(), 0);
        }
        for (total, count) in histogram.iter_mut().zip(hist) {
            *total += count;
        }
    }
    Ok(histogram)
}

fn add_histogram(rp: &mut ReduceProxy<'_>) -> Result<()> {
    let histogram = receive_histogram(rp)?;
    let targets = rp.out_link().clone();
    rp.enqueue_all(targets.iter(), &histogram);
    Ok(())
}

fn enqueue_exchange(
    b: &mut Block,
    rp: &mut ReduceProxy<'_>,
    histogram: &Histogram,
) -> Result<()> {
    let targets = rp.out_link().clone();
    let k = targets.size();
    if k == 0 {
        return Ok(());
    }
    let mut splits = b.splits(histogram, k);

    let mut out: Vec<Vec<Value>> = vec![Vec::new(); k];
    for x in b.values.drain(..) {
        let loc = splits.partition_point(|s| *s <= x).saturating_sub(1);
        out[loc].push(x);
    }

    let mut pos = None;
    for (i, values) in out.into_iter().enumerate() {
        let target = targets.target(i);
        if target.gid == rp.gid() {
            b.values = values;
            pos = Some(i);
        } else {
            rp.enqueue(target, &values);
        }
    }
    let pos = pos.ok_or_else(|| {
        Error::Aborted(format!("block {} isn't in its exchange group", rp.gid()))
    })?;
    splits.push(b.max);
    b.min = splits[pos];
    b.max = splits[pos + 1];
    debug!(gid = rp.gid(), min = b.min, max = b.max, "new range");
    Ok(())
}

fn dequeue_exchange(b: &mut Block, rp: &mut ReduceProxy<'_>) -> Result<()> {
    let senders: Vec<Gid> = rp.in_link().iter().map(|t| t.gid).collect();
    for from in senders {
        if from == rp.gid() {
            continue;
        }
        let incoming: Vec<Value> = rp.dequeue(from)?;
        b.absorb(incoming)?;
    }
    Ok(())
}

fn sort_round(
    b: &mut Block,
    rp: &mut ReduceProxy<'_>,
    partners: &SortPartners,
) -> Result<()> {
    match partners.kind(rp.round()) {
        None => {
            dequeue_exchange(b, rp)?;
            b.values.sort_by(|x, y| x.total_cmp(y));
            Ok(())
        }
        Some((SortRound::Exchange, _)) => {
            let histogram = receive_histogram(rp)?;
            enqueue_exchange(b, rp, &histogram)
        }
        Some((SortRound::Histogram, 0)) => {
            if rp.round() > 0 {
                dequeue_exchange(b, rp)?;
            }
            compute_local_histogram(b, rp)
        }
        Some((SortRound::Histogram, _)) => add_histogram(rp),
    }
}

#[derive(Clone, Debug)]
pub struct WorkerReport {
    pub blocks: Vec<(Gid, Block)>,
    pub stored: usize,
    pub max_stored: usize,
}

async fn sort_worker(
    comm: Communicator,
    settings: SortSettings,
    dir: Option<PathBuf>,
) -> Result<WorkerReport> {
    let assigner = ContiguousAssigner::new(comm.size(), settings.nblocks)?;
    let rank = comm.rank();
    let storage: Option<Arc<dyn Storage>> = match dir {
        Some(dir) => Some(Arc::new(FileStorage::new(
            FileStorageConfig::builder()
                .dir(dir.join(format!("worker-{}", rank)))
                .compress(true)
                .build(),
        )?)),
        None => None,
    };
    let config = MasterConfig {
        threads: settings.threads,
        limit: settings.limit,
    };
    let mut master = Master::new(comm, config, BlockCallbacks::of(), storage.clone())?;

    for gid in assigner.local_gids(rank) {
        let lid = master.add(gid, Block::generate(&settings, gid), Link::new())?;
        let mut proxy = master.proxy(lid)?;
        proxy.all_reduce(settings.min, ops::minimum);
        proxy.all_reduce(settings.max, ops::maximum);
    }
    master.process_collectives().await?;

    let partners = SortPartners::new(settings.nblocks, settings.k)?;
    info!(rank, rounds = partners.rounds(), "sorting");
    reduce_all(&mut master, &assigner, &partners, sort_round).await?;

    let mut blocks = Vec::with_capacity(master.size());
    for lid in 0..master.size() {
        blocks.push((master.gid(lid), master.block_mut(lid)?.clone()));
    }
    let (stored, max_stored) = storage
        .as_ref()
        .map_or((0, 0), |s| (s.count(), s.max_size()));
    info!(rank, stored, max_stored, "storage");
    Ok(WorkerReport {
        blocks,
        stored,
        max_stored,
    })
}

/// Sorts on `settings.workers` local workers. `dir` is where blocks go when
/// they don't fit under the memory limit.
pub async fn run(settings: SortSettings, dir: Option<PathBuf>) -> Result<Vec<WorkerReport>> {
    run_workers(settings.workers, move |comm| {
        sort_worker(comm, settings, dir.clone())
    })
    .await
}

/// Checks that every block is sorted and inside its range, and that ranges
/// follow gid order. Returns the number of values seen.
pub fn verify(reports: &[WorkerReport]) -> Result<usize> {
    let mut blocks: Vec<&(Gid, Block)> =
        reports.iter().flat_map(|r| r.blocks.iter()).collect();
    blocks.sort_by_key(|(gid, _)| *gid);

    let mut last = Value::NEG_INFINITY;
    let mut count = 0;
    for (gid, b) in blocks {
        for &x in &b.values {
            if x < b.min || x > b.max {
                Err(Error::Aborted(format!(
                    "block {}: {} outside of [{}, {}]",
                    gid, x, b.min, b.max
                )))?
            }
            if x < last {
                Err(Error::Aborted(format!(
                    "block {}: {} comes after {}",
                    gid, x, last
                )))?
            }
            last = x;
        }
        count += b.values.len();
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(SortSettings::builder().workers(1).nblocks(4).build())]
    #[case(SortSettings::builder().workers(3).nblocks(8).threads(2).build())]
    #[case(SortSettings::builder().workers(2).nblocks(9).k(3).num_values(300).build())]
    #[case(SortSettings::builder().workers(4).nblocks(16).k(4).seed(7).build())]
    #[tokio::test]
    async fn blocks_end_up_globally_sorted(#[case] settings: SortSettings) {
        let reports = run(settings, None).await.unwrap();
        let count = verify(&reports).unwrap();
        assert_eq!(count, settings.nblocks * settings.num_values);
    }

    #[tokio::test]
    async fn sorting_works_out_of_core() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SortSettings::builder()
            .workers(2)
            .nblocks(8)
            .limit(2)
            .build();
        let reports = run(settings, Some(dir.path().to_path_buf())).await.unwrap();
        assert_eq!(verify(&reports).unwrap(), 800);
        assert!(reports.iter().all(|r| r.max_stored >= 2));
    }

    #[test]
    fn values_below_the_range_abort() {
        let mut b = Block {
            min: 10.0,
            max: 20.0,
            values: vec![],
            bins: 4,
        };
        b.absorb(vec![12.0, 15.0]).unwrap();
        assert!(matches!(b.absorb(vec![9.5]), Err(Error::Aborted(_))));
    }

    #[test]
    fn splits_follow_the_histogram() {
        let b = Block {
            min: 0.0,
            max: 8.0,
            values: vec![],
            bins: 8,
        };
        // everything sits in the upper half
        let histogram = vec![0, 0, 0, 0, 10, 10, 10, 10];
        let splits = b.splits(&histogram, 2);
        assert_eq!(splits, vec![0.0, 6.5]);
    }
}
