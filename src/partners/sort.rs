use super::{Partners, RegularSwapPartners};
use crate::{
    error::{Error, Result},
    types::Gid,
};

/// A sequence of rounds, each borrowed from some underlying pattern: the tag
/// says which one, the number which of its rounds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoundSchedule<T> {
    rounds: Vec<(T, usize)>,
}

impl<T> Default for RoundSchedule<T> {
    fn default() -> Self {
        Self { rounds: Vec::new() }
    }
}

impl<T: Copy> RoundSchedule<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, tag: T, sub_round: usize) {
        self.rounds.push((tag, sub_round));
    }

    pub fn get(&self, round: usize) -> Option<(T, usize)> {
        self.rounds.get(round).copied()
    }

    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortRound {
    /// Merge histograms within a contiguous group.
    Histogram,
    /// Split values by range across a round-robin group.
    Exchange,
}

/// Partners for a k-ary sample sort.
///
/// Before each exchange, the blocks that are about to trade values first
/// build a common histogram with a contiguous swap over every digit still in
/// play; the exchange itself is a round-robin swap that settles one more
/// digit. Every block is active in every round.
#[derive(Clone, Debug)]
pub struct SortPartners {
    histogram: RegularSwapPartners,
    exchange: RegularSwapPartners,
    schedule: RoundSchedule<SortRound>,
}

impl SortPartners {
    /// Only exact powers of `k` split evenly at every level, so any other
    /// `nblocks` is rejected.
    pub fn new(nblocks: usize, k: usize) -> Result<Self> {
        let histogram = RegularSwapPartners::new(nblocks, k, true)?;
        let exchange = RegularSwapPartners::new(nblocks, k, false)?;
        let levels = exchange.rounds();
        if k.checked_pow(levels as u32) != Some(nblocks) {
            Err(Error::Config(format!(
                "sorting needs a power of {} blocks, got {}",
                k, nblocks
            )))?
        }

        let mut schedule = RoundSchedule::new();
        for i in 0..levels {
            for j in 0..histogram.rounds() - i {
                schedule.push(SortRound::Histogram, j);
            }
            schedule.push(SortRound::Exchange, i);
        }
        Ok(Self {
            histogram,
            exchange,
            schedule,
        })
    }

    /// What `round` does and which round of the underlying swap it is.
    /// `None` for the final, receive-only round.
    pub fn kind(&self, round: usize) -> Option<(SortRound, usize)> {
        self.schedule.get(round)
    }

    pub fn exchange_round(&self, round: usize) -> bool {
        matches!(self.kind(round), Some((SortRound::Exchange, _)))
    }

    pub fn sub_round(&self, round: usize) -> Option<usize> {
        self.kind(round).map(|(_, sub)| sub)
    }

    fn sends(&self, round: usize, gid: Gid) -> Vec<Gid> {
        match self.kind(round) {
            Some((SortRound::Histogram, sub)) => self.histogram.outgoing(sub, gid),
            Some((SortRound::Exchange, sub)) => self.exchange.outgoing(sub, gid),
            None => Vec::new(),
        }
    }
}

impl Partners for SortPartners {
    fn nblocks(&self) -> usize {
        self.exchange.nblocks()
    }

    fn rounds(&self) -> usize {
        self.schedule.len()
    }

    fn active(&self, round: usize, _gid: Gid) -> bool {
        round <= self.rounds()
    }

    fn incoming(&self, round: usize, gid: Gid) -> Vec<Gid> {
        match round {
            0 => Vec::new(),
            r => self.sends(r - 1, gid),
        }
    }

    fn outgoing(&self, round: usize, gid: Gid) -> Vec<Gid> {
        self.sends(round, gid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partners::tests::assert_symmetric;

    #[test]
    fn histograms_shrink_before_each_exchange() {
        let p = SortPartners::new(8, 2).unwrap();
        let kinds: Vec<_> = (0..p.rounds()).filter_map(|r| p.kind(r)).collect();
        use SortRound::*;
        assert_eq!(
            kinds,
            vec![
                (Histogram, 0),
                (Histogram, 1),
                (Histogram, 2),
                (Exchange, 0),
                (Histogram, 0),
                (Histogram, 1),
                (Exchange, 1),
                (Histogram, 0),
                (Exchange, 2),
            ]
        );
        assert!(p.kind(p.rounds()).is_none());
        assert_symmetric(&p, 8);
    }

    #[test]
    fn exchanges_cross_the_whole_range_first() {
        let p = SortPartners::new(4, 2).unwrap();
        // rounds: H0 H1 X0 H0 X1
        assert!(p.exchange_round(2));
        assert_eq!(p.outgoing(2, 1), vec![1, 3]);
        assert_eq!(p.outgoing(3, 1), vec![0, 1]);
        assert_eq!(p.incoming(5, 1), vec![0, 1]);
    }

    #[test]
    fn uneven_block_counts_are_rejected() {
        assert!(matches!(SortPartners::new(6, 2), Err(Error::Config(_))));
        assert!(SortPartners::new(9, 3).is_ok());
    }
}
