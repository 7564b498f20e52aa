//! Static mapping between global block ids and the workers that own them.

use crate::{
    error::{Error, Result},
    types::{Gid, Rank},
};

/// Every gid maps to exactly one worker, and every worker can enumerate
/// exactly the gids it owns.
pub trait Assigner: Send + Sync {
    /// Number of workers.
    fn size(&self) -> usize;

    /// Total number of blocks.
    fn nblocks(&self) -> usize;

    /// The worker that owns `gid`.
    fn rank(&self, gid: Gid) -> Result<Rank>;

    /// The gids owned by `rank`, ascending.
    fn local_gids(&self, rank: Rank) -> Vec<Gid>;
}

fn check(size: usize, nblocks: usize) -> Result<()> {
    if size == 0 {
        Err(Error::Config("assigner needs at least one worker".into()))?
    }
    if nblocks == 0 {
        Err(Error::Config("assigner needs at least one block".into()))?
    }
    Ok(())
}

/// Gives each worker a contiguous range of gids; the first
/// `nblocks % size` workers get one extra block.
#[derive(Clone, Copy, Debug)]
pub struct ContiguousAssigner {
    size: usize,
    nblocks: usize,
}

impl ContiguousAssigner {
    pub fn new(size: usize, nblocks: usize) -> Result<Self> {
        check(size, nblocks)?;
        Ok(Self { size, nblocks })
    }
}

impl Assigner for ContiguousAssigner {
    fn size(&self) -> usize {
        self.size
    }

    fn nblocks(&self) -> usize {
        self.nblocks
    }

    fn rank(&self, gid: Gid) -> Result<Rank> {
        if gid >= self.nblocks {
            Err(Error::NoRoute(gid))?
        }
        let div = self.nblocks / self.size;
        let rem = self.nblocks % self.size;
        let r = gid / (div + 1);
        if r < rem {
            Ok(r)
        } else {
            Ok(rem + (gid - (div + 1) * rem) / div)
        }
    }

    fn local_gids(&self, rank: Rank) -> Vec<Gid> {
        if rank >= self.size {
            return Vec::new();
        }
        let div = self.nblocks / self.size;
        let rem = self.nblocks % self.size;
        let from = if rank < rem {
            rank * (div + 1)
        } else {
            rem * (div + 1) + (rank - rem) * div
        };
        let to = from + div + usize::from(rank < rem);
        (from..to).collect()
    }
}

/// Deals gids out to workers like cards: gid `i` goes to worker
/// `i % size`.
#[derive(Clone, Copy, Debug)]
pub struct RoundRobinAssigner {
    size: usize,
    nblocks: usize,
}

impl RoundRobinAssigner {
    pub fn new(size: usize, nblocks: usize) -> Result<Self> {
        check(size, nblocks)?;
        Ok(Self { size, nblocks })
    }
}

impl Assigner for RoundRobinAssigner {
    fn size(&self) -> usize {
        self.size
    }

    fn nblocks(&self) -> usize {
        self.nblocks
    }

    fn rank(&self, gid: Gid) -> Result<Rank> {
        if gid >= self.nblocks {
            Err(Error::NoRoute(gid))?
        }
        Ok(gid % self.size)
    }

    fn local_gids(&self, rank: Rank) -> Vec<Gid> {
        if rank >= self.size {
            return Vec::new();
        }
        (rank..self.nblocks).step_by(self.size).collect()
    }
}
