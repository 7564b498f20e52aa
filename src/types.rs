use std::fmt;

use crate::{
    error::Result,
    serialization::{BinaryBuffer, Serialization},
};

/// Global block id, dense and unique across the whole collection.
pub type Gid = usize;

/// Index of a worker in the transport.
pub type Rank = usize;

/// Addresses a block anywhere in the collection: its gid plus the worker that
/// currently owns it.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockID {
    pub gid: Gid,
    pub proc: Rank,
}

impl BlockID {
    pub fn new(gid: Gid, proc: Rank) -> Self {
        Self { gid, proc }
    }
}

impl fmt::Display for BlockID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.gid, self.proc)
    }
}

impl Serialization for BlockID {
    fn save(&self, bb: &mut BinaryBuffer) {
        self.gid.save(bb);
        self.proc.save(bb);
    }

    fn load(bb: &mut BinaryBuffer) -> Result<Self> {
        Ok(Self {
            gid: Gid::load(bb)?,
            proc: Rank::load(bb)?,
        })
    }
}
