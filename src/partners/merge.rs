use super::{Partners, RegularPartners};
use crate::{error::Result, types::Gid};

/// Merges `k` blocks into one per round until a single block, gid 0, holds
/// the result.
///
/// In every group the member with digit 0 survives and receives from the
/// rest; the others drop out for good. With contiguous grouping the blocks
/// still active in round `r` are the multiples of `k^r`; with round-robin
/// grouping they are the first `ceil(nblocks / k^r)` gids.
#[derive(Clone, Copy, Debug)]
pub struct RegularMergePartners {
    parent: RegularPartners,
}

impl RegularMergePartners {
    pub fn new(nblocks: usize, k: usize, contiguous: bool) -> Result<Self> {
        Ok(Self {
            parent: RegularPartners::new(nblocks, k, contiguous)?,
        })
    }

    pub fn parent(&self) -> &RegularPartners {
        &self.parent
    }

    /// `k^round`, or `None` once that no longer fits in a usize.
    fn span(&self, round: usize) -> Option<usize> {
        self.parent.k().checked_pow(round as u32)
    }

    /// Number of blocks still active in `round` under round-robin grouping.
    fn survivors(&self, round: usize) -> usize {
        match self.span(round) {
            Some(span) => {
                let n = self.parent.nblocks();
                n / span + usize::from(n % span != 0)
            }
            None => 1,
        }
    }

    /// The block `gid` hands its data to at the end of `round`.
    fn root(&self, round: usize, gid: Gid) -> Gid {
        if self.parent.contiguous() {
            match self.span(round + 1) {
                Some(span) => gid - gid % span,
                None => 0,
            }
        } else {
            gid % self.survivors(round + 1)
        }
    }

    /// The active blocks grouped with an active `gid` in `round`.
    fn group(&self, round: usize, gid: Gid) -> Vec<Gid> {
        if self.parent.contiguous() {
            return self.parent.group(round, gid);
        }
        let stride = self.survivors(round + 1);
        let limit = self.survivors(round);
        let root = gid % stride;
        (0..self.parent.k())
            .map(|j| root + j * stride)
            .take_while(|&g| g < limit)
            .collect()
    }
}

impl Partners for RegularMergePartners {
    fn nblocks(&self) -> usize {
        self.parent.nblocks()
    }

    fn rounds(&self) -> usize {
        self.parent.rounds()
    }

    fn active(&self, round: usize, gid: Gid) -> bool {
        if gid >= self.parent.nblocks() || round > self.rounds() {
            return false;
        }
        if self.parent.contiguous() {
            match self.span(round) {
                Some(span) => gid % span == 0,
                None => gid == 0,
            }
        } else {
            gid < self.survivors(round)
        }
    }

    fn incoming(&self, round: usize, gid: Gid) -> Vec<Gid> {
        if round == 0 || !self.active(round, gid) {
            return Vec::new();
        }
        self.group(round - 1, gid)
    }

    fn outgoing(&self, round: usize, gid: Gid) -> Vec<Gid> {
        if round >= self.rounds() || !self.active(round, gid) {
            return Vec::new();
        }
        vec![self.root(round, gid)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partners::tests::assert_symmetric;
    use rstest::rstest;

    #[rstest]
    #[case(1, 2, true)]
    #[case(4, 2, true)]
    #[case(4, 2, false)]
    #[case(7, 2, true)]
    #[case(7, 2, false)]
    #[case(10, 3, true)]
    #[case(10, 3, false)]
    #[case(27, 3, false)]
    fn single_survivor_is_gid_zero(
        #[case] nblocks: usize,
        #[case] k: usize,
        #[case] contiguous: bool,
    ) {
        let p = RegularMergePartners::new(nblocks, k, contiguous).unwrap();
        let last: Vec<_> =
            (0..nblocks).filter(|&g| p.active(p.rounds(), g)).collect();
        assert_eq!(last, vec![0]);
        assert_symmetric(&p, nblocks);
    }

    #[test]
    fn contiguous_merge_of_four() {
        let p = RegularMergePartners::new(4, 2, true).unwrap();
        assert_eq!(p.rounds(), 2);
        assert_eq!(p.outgoing(0, 1), vec![0]);
        assert_eq!(p.outgoing(0, 3), vec![2]);
        assert_eq!(p.incoming(1, 2), vec![2, 3]);
        assert!(!p.active(1, 3));
        assert_eq!(p.incoming(2, 0), vec![0, 2]);
    }

    #[test]
    fn round_robin_merge_folds_the_upper_half() {
        let p = RegularMergePartners::new(8, 2, false).unwrap();
        assert_eq!(p.outgoing(0, 5), vec![1]);
        assert_eq!(p.incoming(1, 1), vec![1, 5]);
        assert!(p.active(1, 3));
        assert!(!p.active(1, 4));
    }

    #[test]
    fn every_block_reaches_the_root() {
        for contiguous in [true, false] {
            let p = RegularMergePartners::new(13, 3, contiguous).unwrap();
            for start in 0..13 {
                let mut gid = start;
                for round in 0..p.rounds() {
                    if let Some(&next) = p.outgoing(round, gid).first() {
                        gid = next;
                    }
                }
                assert_eq!(gid, 0);
            }
        }
    }
}
