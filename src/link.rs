use crate::{
    assigner::Assigner,
    error::Result,
    serialization::{BinaryBuffer, Serialization},
    types::{BlockID, Gid},
};

/// A block's static wiring: the neighbors it talks to outside of a
/// reduction. The order of neighbors is preserved.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Link {
    neighbors: Vec<BlockID>,
}

impl Link {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(&self) -> usize {
        self.neighbors.len()
    }

    /// Number of distinct neighbors; a block may appear more than once, e.g.
    /// in a periodic decomposition.
    pub fn size_unique(&self) -> usize {
        let mut tmp = self.neighbors.clone();
        tmp.sort();
        tmp.dedup();
        tmp.len()
    }

    pub fn target(&self, i: usize) -> &BlockID {
        &self.neighbors[i]
    }

    pub fn target_mut(&mut self, i: usize) -> &mut BlockID {
        &mut self.neighbors[i]
    }

    /// Position of the first neighbor with this gid.
    pub fn find(&self, gid: Gid) -> Option<usize> {
        self.neighbors.iter().position(|n| n.gid == gid)
    }

    pub fn contains(&self, gid: Gid) -> bool {
        self.find(gid).is_some()
    }

    pub fn add_neighbor(&mut self, block: BlockID) {
        self.neighbors.push(block);
    }

    pub fn neighbors(&self) -> &[BlockID] {
        &self.neighbors
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlockID> {
        self.neighbors.iter()
    }

    /// Recomputes every neighbor's owner from the assigner.
    pub fn fix(&mut self, assigner: &dyn Assigner) -> Result<()> {
        for n in self.neighbors.iter_mut() {
            n.proc = assigner.rank(n.gid)?;
        }
        Ok(())
    }
}

impl FromIterator<BlockID> for Link {
    fn from_iter<I: IntoIterator<Item = BlockID>>(iter: I) -> Self {
        Self {
            neighbors: iter.into_iter().collect(),
        }
    }
}

impl Serialization for Link {
    fn save(&self, bb: &mut BinaryBuffer) {
        self.neighbors.save(bb);
    }

    fn load(bb: &mut BinaryBuffer) -> Result<Self> {
        Ok(Self {
            neighbors: Vec::load(bb)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assigner::RoundRobinAssigner;

    #[test]
    fn unique_and_find() {
        let mut link = Link::new();
        link.add_neighbor(BlockID::new(3, 0));
        link.add_neighbor(BlockID::new(1, 0));
        link.add_neighbor(BlockID::new(3, 0));

        assert_eq!(link.size(), 3);
        assert_eq!(link.size_unique(), 2);
        assert_eq!(link.find(1), Some(1));
        assert_eq!(link.find(7), None);
    }

    #[test]
    fn fix_rewrites_owners() {
        let assigner = RoundRobinAssigner::new(2, 4).unwrap();
        let mut link: Link =
            (0..4).map(|gid| BlockID::new(gid, 99)).collect();
        link.fix(&assigner).unwrap();
        let owners: Vec<_> = link.iter().map(|n| n.proc).collect();
        assert_eq!(owners, vec![0, 1, 0, 1]);
    }

    #[test]
    fn survives_serialization() {
        let link: Link = [BlockID::new(5, 1), BlockID::new(2, 0)]
            .into_iter()
            .collect();
        let mut bb = BinaryBuffer::new();
        link.save(&mut bb);
        assert_eq!(Link::load(&mut bb).unwrap(), link);
    }
}
