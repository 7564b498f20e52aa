use super::{Partners, RegularPartners};
use crate::{error::Result, types::Gid};

/// Every block stays active in every round and exchanges with its whole
/// group, itself included. After all rounds each block has heard, directly
/// or not, from every other block (when `nblocks` is a power of `k`).
#[derive(Clone, Copy, Debug)]
pub struct RegularSwapPartners {
    parent: RegularPartners,
}

impl RegularSwapPartners {
    pub fn new(nblocks: usize, k: usize, contiguous: bool) -> Result<Self> {
        Ok(Self {
            parent: RegularPartners::new(nblocks, k, contiguous)?,
        })
    }

    pub fn parent(&self) -> &RegularPartners {
        &self.parent
    }

    pub fn group(&self, round: usize, gid: Gid) -> Vec<Gid> {
        self.parent.group(round, gid)
    }
}

impl Partners for RegularSwapPartners {
    fn nblocks(&self) -> usize {
        self.parent.nblocks()
    }

    fn rounds(&self) -> usize {
        self.parent.rounds()
    }

    fn active(&self, round: usize, gid: Gid) -> bool {
        round <= self.rounds() && gid < self.parent.nblocks()
    }

    fn incoming(&self, round: usize, gid: Gid) -> Vec<Gid> {
        match round {
            0 => Vec::new(),
            r => self.parent.group(r - 1, gid),
        }
    }

    fn outgoing(&self, round: usize, gid: Gid) -> Vec<Gid> {
        self.parent.group(round, gid)
    }
}
