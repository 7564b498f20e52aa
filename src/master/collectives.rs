//! Deferred collectives.
//!
//! Blocks post all-reduce, scan and scratch operations through their proxy;
//! nothing happens until the registry's `process_collectives`, which resolves
//! every pending operation of every block on every worker at once. Operations
//! resolve in posting order, so the i-th `get` of every block refers to the
//! same collective.

use std::any::Any;

use tracing::{debug, debug_span, Instrument};

use super::Master;
use crate::{
    error::{Error, Result},
    serialization::{BinaryBuffer, Serialization},
    types::{Gid, Rank},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollectiveKind {
    AllReduce,
    Scan,
    Scratch,
}

impl CollectiveKind {
    fn code(self) -> u8 {
        match self {
            CollectiveKind::AllReduce => 0,
            CollectiveKind::Scan => 1,
            CollectiveKind::Scratch => 2,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(CollectiveKind::AllReduce),
            1 => Ok(CollectiveKind::Scan),
            2 => Ok(CollectiveKind::Scratch),
            _ => Err(Error::InvalidData("unknown collective kind")),
        }
    }
}

/// A type-erased pending operation. Every method that takes another
/// operation or a serialized value assumes it was posted with the same value
/// type as `self`.
pub(crate) trait CollectiveOp: Send + Sync {
    fn kind(&self) -> CollectiveKind;

    /// The current output value, as `&T`.
    fn result(&self) -> &dyn Any;

    /// Folds `other`'s output into this one. Returns false if the value
    /// types differ.
    fn combine(&mut self, other: &dyn CollectiveOp) -> bool;

    fn save_result(&self, bb: &mut BinaryBuffer);

    /// Folds a value saved by `save_result` into this output.
    fn combine_saved(&mut self, bb: &mut BinaryBuffer) -> Result<()>;

    /// Replaces this output with a value saved by `save_result`.
    fn load_result(&mut self, bb: &mut BinaryBuffer) -> Result<()>;

    fn save_input(&self, bb: &mut BinaryBuffer);

    /// Inclusive prefix over saved inputs, in the given order.
    fn prefix(&self, inputs: Vec<BinaryBuffer>) -> Result<Vec<BinaryBuffer>>;
}

pub(crate) struct ReduceOp<T, F> {
    kind: CollectiveKind,
    input: T,
    output: T,
    op: F,
}

impl<T: Clone, F> ReduceOp<T, F> {
    pub(crate) fn all_reduce(x: T, op: F) -> Self {
        Self {
            kind: CollectiveKind::AllReduce,
            output: x.clone(),
            input: x,
            op,
        }
    }

    pub(crate) fn scan(x: T, op: F) -> Self {
        Self {
            kind: CollectiveKind::Scan,
            output: x.clone(),
            input: x,
            op,
        }
    }
}

impl<T, F> CollectiveOp for ReduceOp<T, F>
where
    T: Serialization + Clone + Send + Sync + 'static,
    F: Fn(&T, &T) -> T + Send + Sync + 'static,
{
    fn kind(&self) -> CollectiveKind {
        self.kind
    }

    fn result(&self) -> &dyn Any {
        &self.output
    }

    fn combine(&mut self, other: &dyn CollectiveOp) -> bool {
        match other.result().downcast_ref::<T>() {
            Some(x) => {
                self.output = (self.op)(&self.output, x);
                true
            }
            None => false,
        }
    }

    fn save_result(&self, bb: &mut BinaryBuffer) {
        self.output.save(bb);
    }

    fn combine_saved(&mut self, bb: &mut BinaryBuffer) -> Result<()> {
        let x = T::load(bb)?;
        self.output = (self.op)(&self.output, &x);
        Ok(())
    }

    fn load_result(&mut self, bb: &mut BinaryBuffer) -> Result<()> {
        self.output = T::load(bb)?;
        Ok(())
    }

    fn save_input(&self, bb: &mut BinaryBuffer) {
        self.input.save(bb);
    }

    fn prefix(&self, inputs: Vec<BinaryBuffer>) -> Result<Vec<BinaryBuffer>> {
        let mut acc: Option<T> = None;
        let mut outputs = Vec::with_capacity(inputs.len());
        for mut bb in inputs {
            let x = T::load(&mut bb)?;
            let next = match acc {
                Some(a) => (self.op)(&a, &x),
                None => x,
            };
            let mut out = BinaryBuffer::new();
            next.save(&mut out);
            outputs.push(out);
            acc = Some(next);
        }
        Ok(outputs)
    }
}

pub(crate) struct ScratchOp<T> {
    value: T,
}

impl<T> ScratchOp<T> {
    pub(crate) fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T> CollectiveOp for ScratchOp<T>
where
    T: Serialization + Clone + Send + Sync + 'static,
{
    fn kind(&self) -> CollectiveKind {
        CollectiveKind::Scratch
    }

    fn result(&self) -> &dyn Any {
        &self.value
    }

    fn combine(&mut self, other: &dyn CollectiveOp) -> bool {
        other.result().is::<T>()
    }

    fn save_result(&self, bb: &mut BinaryBuffer) {
        self.value.save(bb);
    }

    fn combine_saved(&mut self, bb: &mut BinaryBuffer) -> Result<()> {
        T::load(bb)?;
        Ok(())
    }

    fn load_result(&mut self, bb: &mut BinaryBuffer) -> Result<()> {
        self.value = T::load(bb)?;
        Ok(())
    }

    fn save_input(&self, bb: &mut BinaryBuffer) {
        self.value.save(bb);
    }

    fn prefix(&self, inputs: Vec<BinaryBuffer>) -> Result<Vec<BinaryBuffer>> {
        Ok(inputs)
    }
}

/// A posted operation and whether its result is ready.
pub(crate) struct Collective {
    op: Box<dyn CollectiveOp>,
    resolved: bool,
}

impl Collective {
    pub(crate) fn new(op: Box<dyn CollectiveOp>) -> Self {
        Self {
            op,
            resolved: false,
        }
    }

    pub(crate) fn kind(&self) -> CollectiveKind {
        self.op.kind()
    }

    pub(crate) fn resolved(&self) -> bool {
        self.resolved
    }

    pub(crate) fn result<T: Clone + 'static>(&self, gid: Gid) -> Result<T> {
        if !self.resolved {
            Err(Error::CollectiveUnresolved(gid))?
        }
        self.op
            .result()
            .downcast_ref::<T>()
            .cloned()
            .ok_or(Error::CollectiveTypeMismatch(gid))
    }
}

/// What one worker reports before collectives are resolved: an error, or the
/// kinds its blocks have pending (none if it holds no blocks).
type Report = (Option<String>, Option<Vec<u8>>);

/// What the checking worker answers: an error, or the worker that leads the
/// reductions together with the kinds to resolve.
type Verdict = (Option<String>, Option<(Rank, Vec<u8>)>);

impl<B> Master<B> {
    /// Resolves every pending collective of every local block. Must be called
    /// by every worker; every block on every worker must have posted the
    /// same sequence of operations since the last call.
    pub async fn process_collectives(&mut self) -> Result<()> {
        let span = debug_span!("collectives", rank = self.comm.rank());
        async move {
            let (leader, kinds) = self.agree_on_pending().await?;
            for (i, kind) in kinds.iter().enumerate() {
                match kind {
                    CollectiveKind::AllReduce => {
                        self.resolve_all_reduce(i, kinds.len(), leader).await?
                    }
                    CollectiveKind::Scan => {
                        self.resolve_scan(i, kinds.len(), leader).await?
                    }
                    CollectiveKind::Scratch => {
                        for slot in &mut self.slots {
                            let at = slot.collectives.len() - kinds.len() + i;
                            slot.collectives[at].resolved = true;
                        }
                    }
                }
            }
            debug!(resolved = kinds.len(), "collectives processed");
            Ok(())
        }
        .instrument(span)
        .await
    }

    fn local_report(&self) -> Report {
        let mut seen: Option<(Gid, Vec<u8>)> = None;
        for slot in &self.slots {
            let kinds: Vec<u8> = slot
                .collectives
                .iter()
                .filter(|c| !c.resolved())
                .map(|c| c.kind().code())
                .collect();
            match &seen {
                None => seen = Some((slot.gid, kinds)),
                Some((gid, first)) if *first != kinds => {
                    return (
                        Some(format!(
                            "block {} posted {} collectives, block {} posted {}",
                            gid,
                            first.len(),
                            slot.gid,
                            kinds.len()
                        )),
                        None,
                    );
                }
                Some(_) => {}
            }
        }
        (None, seen.map(|(_, kinds)| kinds))
    }

    async fn agree_on_pending(&mut self) -> Result<(Rank, Vec<CollectiveKind>)> {
        let mut bb = BinaryBuffer::new();
        self.local_report().save(&mut bb);
        let parts = self.comm.gather(bb, 0).await?;

        let verdict = if self.comm.rank() == 0 {
            let mut verdict: Verdict = (None, None);
            for (rank, mut part) in parts.into_iter().enumerate() {
                let (error, kinds) = Report::load(&mut part)?;
                if let Some(error) = error {
                    verdict = (Some(error), None);
                    break;
                }
                let Some(kinds) = kinds else { continue };
                if let Some((leader, expected)) = &verdict.1 {
                    if *expected != kinds {
                        let error = format!(
                            "worker {} has {} collectives pending, worker {} has {}",
                            leader,
                            expected.len(),
                            rank,
                            kinds.len()
                        );
                        verdict = (Some(error), None);
                        break;
                    }
                } else {
                    verdict.1 = Some((rank, kinds));
                }
            }
            Some(verdict)
        } else {
            None
        };

        match self.comm.broadcast(verdict, 0).await? {
            (Some(error), _) => Err(Error::CollectiveMismatch(error)),
            (None, None) => Ok((0, Vec::new())),
            (None, Some((leader, codes))) => {
                let kinds = codes
                    .into_iter()
                    .map(CollectiveKind::from_code)
                    .collect::<Result<Vec<_>>>()?;
                Ok((leader, kinds))
            }
        }
    }

    /// Combines the `i`-th of `n` pending operations locally, then across
    /// workers at `leader`, and hands the result to every block.
    async fn resolve_all_reduce(
        &mut self,
        i: usize,
        n: usize,
        leader: Rank,
    ) -> Result<()> {
        let mut contribution = BinaryBuffer::new();
        match self.slots.split_first_mut() {
            Some((first, rest)) => {
                let at = first.collectives.len() - n + i;
                let acc = &mut first.collectives[at].op;
                for slot in rest.iter() {
                    let theirs = &slot.collectives[slot.collectives.len() - n + i];
                    if !acc.combine(&*theirs.op) {
                        Err(Error::CollectiveTypeMismatch(slot.gid))?
                    }
                }
                true.save(&mut contribution);
                acc.save_result(&mut contribution);
            }
            None => false.save(&mut contribution),
        }

        let parts = self.comm.gather(contribution, leader).await?;
        let total = if self.comm.rank() == leader {
            let first = self
                .slots
                .first_mut()
                .ok_or_else(|| Error::Aborted("reduction leader holds no blocks".into()))?;
            let at = first.collectives.len() - n + i;
            let acc = &mut first.collectives[at].op;
            for (rank, mut part) in parts.into_iter().enumerate() {
                if rank != leader && bool::load(&mut part)? {
                    acc.combine_saved(&mut part)?;
                }
            }
            let mut total = BinaryBuffer::new();
            acc.save_result(&mut total);
            Some(total)
        } else {
            None
        };

        let total = self.comm.broadcast_buffer(total, leader).await?;
        for slot in &mut self.slots {
            let at = slot.collectives.len() - n + i;
            let collective = &mut slot.collectives[at];
            collective.op.load_result(&mut total.clone())?;
            collective.resolved = true;
        }
        Ok(())
    }

    /// Inclusive prefix of the `i`-th of `n` pending operations in gid order.
    /// Inputs are collected at `leader`, which computes every prefix and
    /// scatters them back to their owners.
    async fn resolve_scan(&mut self, i: usize, n: usize, leader: Rank) -> Result<()> {
        let inputs: Vec<(Gid, Vec<u8>)> = self
            .slots
            .iter()
            .map(|slot| {
                let mut bb = BinaryBuffer::new();
                slot.collectives[slot.collectives.len() - n + i]
                    .op
                    .save_input(&mut bb);
                (slot.gid, bb.into_vec())
            })
            .collect();
        let mut bb = BinaryBuffer::new();
        inputs.save(&mut bb);
        let parts = self.comm.gather(bb, leader).await?;

        let outputs = if self.comm.rank() == leader {
            let mut everyone: Vec<(Gid, Rank, Vec<u8>)> = Vec::new();
            for (rank, mut part) in parts.into_iter().enumerate() {
                for (gid, bytes) in Vec::<(Gid, Vec<u8>)>::load(&mut part)? {
                    everyone.push((gid, rank, bytes));
                }
            }
            everyone.sort_by_key(|(gid, _, _)| *gid);

            let first = self
                .slots
                .first()
                .ok_or_else(|| Error::Aborted("scan leader holds no blocks".into()))?;
            let op = &first.collectives[first.collectives.len() - n + i].op;
            let prefixes = op.prefix(
                everyone
                    .iter()
                    .map(|(_, _, bytes)| BinaryBuffer::from_vec(bytes.clone()))
                    .collect(),
            )?;

            let mut per_rank: Vec<Vec<(Gid, Vec<u8>)>> =
                vec![Vec::new(); self.comm.size()];
            for ((gid, rank, _), prefix) in everyone.into_iter().zip(prefixes) {
                per_rank[rank].push((gid, prefix.into_vec()));
            }
            per_rank
                .into_iter()
                .map(|mine| {
                    let mut bb = BinaryBuffer::new();
                    mine.save(&mut bb);
                    bb
                })
                .collect()
        } else {
            Vec::new()
        };

        let mut mine = self.comm.scatter(outputs, leader).await?;
        for (gid, bytes) in Vec::<(Gid, Vec<u8>)>::load(&mut mine)? {
            let lid = *self.lids.get(&gid).ok_or(Error::UnknownBlock(gid))?;
            let slot = &mut self.slots[lid];
            let at = slot.collectives.len() - n + i;
            let collective = &mut slot.collectives[at];
            collective
                .op
                .load_result(&mut BinaryBuffer::from_vec(bytes))?;
            collective.resolved = true;
        }
        Ok(())
    }
}
