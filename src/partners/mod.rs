//! Communication patterns for multi-round reductions.
//!
//! A partners object answers, for every round and every block, whether the
//! block takes part, which blocks it hears from and which blocks it sends
//! to. The executor in [`crate::reduce`] runs rounds `0..=rounds()`; the last
//! round only receives, so `outgoing(rounds(), _)` is always empty and
//! `incoming(0, _)` is always empty.
//!
//! Everything here is computed arithmetically from the gid; nothing is
//! stored per block.

mod all_reduce;
mod merge;
mod sort;
mod swap;

pub use all_reduce::RegularAllReducePartners;
pub use merge::RegularMergePartners;
pub use sort::{RoundSchedule, SortPartners, SortRound};
pub use swap::RegularSwapPartners;

use crate::{
    error::{Error, Result},
    types::Gid,
};

pub trait Partners: Send + Sync {
    /// Number of blocks the pattern was built for.
    fn nblocks(&self) -> usize;

    /// Number of sending rounds.
    fn rounds(&self) -> usize;

    fn active(&self, round: usize, gid: Gid) -> bool;

    /// The blocks `gid` receives from at the start of `round`, ascending.
    fn incoming(&self, round: usize, gid: Gid) -> Vec<Gid>;

    /// The blocks `gid` may send to at the end of `round`, ascending.
    fn outgoing(&self, round: usize, gid: Gid) -> Vec<Gid>;
}

/// `ceil(log_k(n))`: the number of base-`k` digits needed to write every gid
/// below `n`.
pub(crate) fn ceil_log(n: usize, k: usize) -> usize {
    let mut rounds = 0;
    let mut reach = 1usize;
    while reach < n {
        reach = reach.saturating_mul(k);
        rounds += 1;
    }
    rounds
}

/// The k-ary grouping shared by the regular patterns.
///
/// Write every gid in base `k` with `rounds` digits. In each round, blocks
/// that differ only in one digit form a group of up to `k`. Contiguous
/// grouping starts from the lowest digit, so early groups are made of
/// neighboring gids; round-robin grouping starts from the highest. Groups are
/// cut short where gids would reach `nblocks`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegularPartners {
    nblocks: usize,
    k: usize,
    rounds: usize,
    contiguous: bool,
}

impl RegularPartners {
    pub fn new(nblocks: usize, k: usize, contiguous: bool) -> Result<Self> {
        if nblocks == 0 {
            Err(Error::Config("partners need at least one block".into()))?
        }
        if k < 2 {
            Err(Error::Config(format!(
                "group size must be at least 2, got {}",
                k
            )))?
        }
        Ok(Self {
            nblocks,
            k,
            rounds: ceil_log(nblocks, k),
            contiguous,
        })
    }

    pub fn nblocks(&self) -> usize {
        self.nblocks
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn rounds(&self) -> usize {
        self.rounds
    }

    pub fn contiguous(&self) -> bool {
        self.contiguous
    }

    /// Distance between consecutive members of a group in `round`.
    pub fn step(&self, round: usize) -> usize {
        let digit = if self.contiguous {
            round
        } else {
            self.rounds.saturating_sub(round + 1)
        };
        self.k.pow(digit as u32)
    }

    /// The gids grouped with `gid` in `round`, ascending and including `gid`.
    /// Empty outside of `0..rounds`.
    pub fn group(&self, round: usize, gid: Gid) -> Vec<Gid> {
        if round >= self.rounds || gid >= self.nblocks {
            return Vec::new();
        }
        let step = self.step(round);
        let base = gid - self.position(round, gid) * step;
        (0..self.k)
            .map(|j| base + j * step)
            .take_while(|&g| g < self.nblocks)
            .collect()
    }

    /// Index of `gid` within its group in `round`.
    pub fn position(&self, round: usize, gid: Gid) -> usize {
        (gid / self.step(round)) % self.k
    }
}
