use super::{Partners, RegularMergePartners};
use crate::{error::Result, types::Gid};

/// A merge followed by the same merge run backwards: rounds `0..=R` reduce
/// into gid 0, rounds `R..=2R` send the result back down the same tree.
#[derive(Clone, Copy, Debug)]
pub struct RegularAllReducePartners {
    merge: RegularMergePartners,
}

impl RegularAllReducePartners {
    pub fn new(nblocks: usize, k: usize, contiguous: bool) -> Result<Self> {
        Ok(Self {
            merge: RegularMergePartners::new(nblocks, k, contiguous)?,
        })
    }

    pub fn merge(&self) -> &RegularMergePartners {
        &self.merge
    }

    /// Whether `round` still belongs to the reducing half. The middle round
    /// belongs to both.
    pub fn in_up_phase(&self, round: usize) -> bool {
        round < self.merge.rounds()
    }

    /// The merge round that `round` mirrors.
    pub fn parent_round(&self, round: usize) -> usize {
        let top = self.merge.rounds();
        if round < top {
            round
        } else {
            (2 * top).saturating_sub(round)
        }
    }
}

impl Partners for RegularAllReducePartners {
    fn nblocks(&self) -> usize {
        self.merge.nblocks()
    }

    fn rounds(&self) -> usize {
        2 * self.merge.rounds()
    }

    fn active(&self, round: usize, gid: Gid) -> bool {
        round <= self.rounds() && self.merge.active(self.parent_round(round), gid)
    }

    fn incoming(&self, round: usize, gid: Gid) -> Vec<Gid> {
        if round > self.rounds() {
            Vec::new()
        } else if round <= self.merge.rounds() {
            self.merge.incoming(round, gid)
        } else {
            self.merge.outgoing(self.parent_round(round), gid)
        }
    }

    fn outgoing(&self, round: usize, gid: Gid) -> Vec<Gid> {
        if round >= self.rounds() {
            Vec::new()
        } else if round < self.merge.rounds() {
            self.merge.outgoing(round, gid)
        } else {
            self.merge.incoming(self.parent_round(round), gid)
        }
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
    #[case(6, 2, true)]
    #[case(10, 3, false)]
    #[case(16, 4, true)]
    fn mirrored_rounds_are_symmetric(
        #[case] nblocks: usize,
        #[case] k: usize,
        #[case] contiguous: bool,
    ) {
        let p = RegularAllReducePartners::new(nblocks, k, contiguous).unwrap();
        assert_eq!(p.rounds(), 2 * p.merge().rounds());
        assert_symmetric(&p, nblocks);
        // everyone is back in play at the end
        assert!((0..nblocks).all(|g| p.active(p.rounds(), g)));
    }

    #[test]
    fn down_phase_retraces_the_merge() {
        let p = RegularAllReducePartners::new(4, 2, true).unwrap();
        assert!(p.in_up_phase(1));
        assert!(!p.in_up_phase(2));
        assert_eq!(p.outgoing(2, 0), vec![0, 2]);
        assert_eq!(p.incoming(3, 2), vec![0]);
        assert_eq!(p.outgoing(3, 2), vec![2, 3]);
        assert_eq!(p.incoming(4, 3), vec![2]);
    }
}
