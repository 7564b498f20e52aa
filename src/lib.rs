//! Block-parallel data decomposition: a registry of blocks per worker,
//! neighbor exchanges between them, deferred collectives, and multi-round
//! reductions over k-ary partner patterns.

pub mod assigner;
pub mod comm;
pub mod error;
pub mod link;
pub mod master;
pub mod partners;
pub mod reduce;
pub mod serialization;
pub mod storage;
pub mod types;

pub use assigner::{Assigner, ContiguousAssigner, RoundRobinAssigner};
pub use comm::{local_world, ops, run_workers, Communicator};
pub use error::{Error, Result};
pub use link::Link;
pub use master::{BlockCallbacks, Master, MasterConfig, MasterStats, Proxy};
pub use partners::{
    Partners, RegularAllReducePartners, RegularMergePartners, RegularSwapPartners,
    SortPartners, SortRound,
};
pub use reduce::{no_skip, reduce, reduce_all, ReduceProxy};
pub use serialization::{BinaryBuffer, Serialization};
pub use types::{BlockID, Gid, Rank};
