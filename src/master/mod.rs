//! The block registry.

// A master owns the blocks one worker is responsible for, addressed locally
// by lid (the order they were added in) and globally by gid. Each block comes
// with its link, its message queues and its list of posted collectives.
//
// Blocks are opaque to the registry: everything it needs to create, drop,
// save or load one is in the `BlockCallbacks` it was built with. When a
// memory limit is set, the least recently touched blocks are serialized into
// the storage to keep at most `limit` of them in memory, and loaded back
// right before a callback needs them. Queues and collectives always stay in
// memory, so a stored block can still receive messages.
//
// Callbacks run in batches of at most `threads` blocks (and never more than
// the memory limit), resident blocks first so a batch doesn't evict what the
// next one is about to use. Each callback only ever sees its own block and
// its own proxy, so a batch runs in parallel on scoped threads without any
// locking.

mod collectives;
mod proxy;

pub use collectives::CollectiveKind;
pub use proxy::Proxy;

use std::{mem, sync::Arc, thread};

use hashbrown::HashMap;
use tracing::{debug, debug_span, trace, warn, Instrument};
use typed_builder::TypedBuilder;

use self::proxy::{CollectivesList, IncomingQueues, OutgoingQueues};
use crate::{
    comm::{tags, Communicator, Tag},
    error::{Error, Result},
    link::Link,
    serialization::{BinaryBuffer, Serialization},
    storage::{Storage, StorageHandle},
    types::Gid,
};

/// How the registry creates, drops and (de)serializes blocks.
pub struct BlockCallbacks<B> {
    pub create: fn() -> B,
    pub destroy: fn(B),
    pub save: fn(&B, &mut BinaryBuffer),
    pub load: fn(&mut B, &mut BinaryBuffer) -> Result<()>,
}

impl<B> Clone for BlockCallbacks<B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B> Copy for BlockCallbacks<B> {}

impl<B: Default + Serialization> BlockCallbacks<B> {
    /// Callbacks for blocks that know how to build and serialize themselves.
    pub fn of() -> Self {
        Self {
            create: B::default,
            destroy: drop,
            save: |b, bb| b.save(bb),
            load: |b, bb| {
                *b = B::load(bb)?;
                Ok(())
            },
        }
    }
}

#[derive(Clone, Debug, TypedBuilder)]
pub struct MasterConfig {
    /// Callbacks run in parallel, at most this many at once.
    #[builder(default = 1)]
    pub threads: usize,
    /// Blocks kept in memory at once. Unlimited if unset; otherwise the
    /// registry needs a storage to move the rest to.
    #[builder(default, setter(strip_option))]
    pub limit: Option<usize>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MasterStats {
    /// Blocks moved to storage.
    pub evictions: usize,
    /// Blocks brought back from storage.
    pub reloads: usize,
    /// Blocks in memory right now.
    pub resident: usize,
    /// The most blocks ever in memory at once.
    pub peak_resident: usize,
}

enum Residence<B> {
    Resident(B),
    Stored(StorageHandle),
    // only seen while a block is on its way to or from storage
    Moving,
}

struct Slot<B> {
    gid: Gid,
    link: Link,
    residence: Residence<B>,
    touched: u64,
    incoming: IncomingQueues,
    outgoing: OutgoingQueues,
    collectives: CollectivesList,
}

impl<B> Slot<B> {
    fn is_resident(&self) -> bool {
        matches!(self.residence, Residence::Resident(_))
    }

    fn proxy(&mut self) -> Proxy<'_> {
        Proxy::new(
            self.gid,
            &self.link,
            &mut self.incoming,
            &mut self.outgoing,
            &mut self.collectives,
        )
    }

    fn split(&mut self) -> Result<(&mut B, Proxy<'_>)> {
        match &mut self.residence {
            Residence::Resident(block) => Ok((
                block,
                Proxy::new(
                    self.gid,
                    &self.link,
                    &mut self.incoming,
                    &mut self.outgoing,
                    &mut self.collectives,
                ),
            )),
            _ => Err(Error::Aborted(format!(
                "block {} is not in memory",
                self.gid
            ))),
        }
    }

    /// Brings the block back from storage if it was evicted.
    fn reload(
        &mut self,
        storage: Option<&dyn Storage>,
        callbacks: &BlockCallbacks<B>,
    ) -> Result<()> {
        let Residence::Stored(handle) = self.residence else {
            return Ok(());
        };
        let storage = storage.ok_or_else(|| {
            Error::Config("no storage to load blocks from".into())
        })?;
        let mut bb = storage.get(handle)?;
        let mut block = (callbacks.create)();
        (callbacks.load)(&mut block, &mut bb)?;
        self.residence = Residence::Resident(block);
        trace!(gid = self.gid, handle, "reloaded block");
        Ok(())
    }

    /// Drops fully read queues and returns the first source that still has
    /// unread data.
    fn undrained(&mut self) -> Option<Gid> {
        self.incoming.retain(|_, bb| !bb.exhausted());
        self.incoming.keys().copied().min()
    }
}

pub struct Master<B> {
    comm: Communicator,
    config: MasterConfig,
    callbacks: BlockCallbacks<B>,
    storage: Option<Arc<dyn Storage>>,
    slots: Vec<Slot<B>>,
    lids: HashMap<Gid, usize>,
    clock: u64,
    stats: MasterStats,
}

impl<B> Master<B> {
    pub fn new(
        comm: Communicator,
        config: MasterConfig,
        callbacks: BlockCallbacks<B>,
        storage: Option<Arc<dyn Storage>>,
    ) -> Result<Self> {
        if config.threads == 0 {
            Err(Error::Config("need at least one thread".into()))?
        }
        match config.limit {
            Some(0) => Err(Error::Config(
                "memory limit must allow at least one block".into(),
            ))?,
            Some(_) if storage.is_none() => Err(Error::Config(
                "a memory limit needs a storage for evicted blocks".into(),
            ))?,
            _ => {}
        }
        debug!(rank = comm.rank(), threads = config.threads, limit = ?config.limit, "master ready");
        Ok(Self {
            comm,
            config,
            callbacks,
            storage,
            slots: Vec::new(),
            lids: HashMap::new(),
            clock: 0,
            stats: MasterStats::default(),
        })
    }

    /// Registers a block and returns its lid.
    pub fn add(&mut self, gid: Gid, block: B, link: Link) -> Result<usize> {
        if self.lids.contains_key(&gid) {
            Err(Error::Config(format!("block {} added twice", gid)))?
        }
        self.make_room(&[], 1)?;
        let lid = self.slots.len();
        self.slots.push(Slot {
            gid,
            link,
            residence: Residence::Resident(block),
            touched: 0,
            incoming: HashMap::new(),
            outgoing: HashMap::new(),
            collectives: CollectivesList::new(),
        });
        self.lids.insert(gid, lid);
        self.became_resident();
        self.touch(lid);
        trace!(gid, lid, "added block");
        Ok(lid)
    }

    /// Removes a block from the registry and hands it back with its link.
    /// Anything still queued for it is dropped; lids after it shift down.
    pub fn release(&mut self, lid: usize) -> Result<(B, Link)> {
        self.ensure_resident(&[lid])?;
        let slot = self.slots.remove(lid);
        self.lids.remove(&slot.gid);
        for (l, s) in self.slots.iter().enumerate().skip(lid) {
            self.lids.insert(s.gid, l);
        }
        match slot.residence {
            Residence::Resident(block) => {
                self.stats.resident -= 1;
                trace!(gid = slot.gid, "released block");
                Ok((block, slot.link))
            }
            _ => Err(Error::Aborted(format!(
                "block {} is not in memory",
                slot.gid
            ))),
        }
    }

    /// The block at `lid`, loaded from storage if necessary.
    pub fn block_mut(&mut self, lid: usize) -> Result<&mut B> {
        self.ensure_resident(&[lid])?;
        let slot = &mut self.slots[lid];
        match &mut slot.residence {
            Residence::Resident(block) => Ok(block),
            _ => Err(Error::Aborted(format!(
                "block {} is not in memory",
                slot.gid
            ))),
        }
    }

    /// The block at `lid` if it's in memory.
    pub fn block(&self, lid: usize) -> Option<&B> {
        match &self.slots.get(lid)?.residence {
            Residence::Resident(block) => Some(block),
            _ => None,
        }
    }

    /// A proxy for the block at `lid`, e.g. to post collectives outside of a
    /// callback. The block itself doesn't need to be in memory.
    pub fn proxy(&mut self, lid: usize) -> Result<Proxy<'_>> {
        self.check_lid(lid)?;
        Ok(self.slots[lid].proxy())
    }

    /// Runs `f` on every local block.
    pub fn foreach<F>(&mut self, f: F) -> Result<()>
    where
        B: Send,
        F: Fn(&mut B, &mut Proxy<'_>) -> Result<()> + Sync,
    {
        let lids = (0..self.slots.len()).collect();
        self.run(lids, |_, block, mut proxy| f(block, &mut proxy))
    }

    /// Delivers everything enqueued since the last exchange. Incoming queues
    /// from the previous exchange must have been read completely.
    pub async fn exchange(&mut self) -> Result<()> {
        let span = debug_span!("exchange", rank = self.comm.rank());
        async move {
            self.check_drained(0..self.slots.len())?;
            self.deliver(tags::EXCHANGE).await
        }
        .instrument(span)
        .await
    }

    pub fn gid(&self, lid: usize) -> Gid {
        self.slots[lid].gid
    }

    pub fn lid(&self, gid: Gid) -> Option<usize> {
        self.lids.get(&gid).copied()
    }

    pub fn local(&self, gid: Gid) -> bool {
        self.lids.contains_key(&gid)
    }

    /// Local gids in lid order.
    pub fn gids(&self) -> Vec<Gid> {
        self.slots.iter().map(|s| s.gid).collect()
    }

    /// Number of local blocks.
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn link(&self, lid: usize) -> &Link {
        &self.slots[lid].link
    }

    pub fn link_mut(&mut self, lid: usize) -> &mut Link {
        &mut self.slots[lid].link
    }

    pub fn communicator(&self) -> &Communicator {
        &self.comm
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    pub fn storage(&self) -> Option<&Arc<dyn Storage>> {
        self.storage.as_ref()
    }

    pub fn stats(&self) -> MasterStats {
        self.stats
    }

    fn check_lid(&self, lid: usize) -> Result<()> {
        if lid >= self.slots.len() {
            Err(Error::UnknownBlock(lid))?
        }
        Ok(())
    }

    fn touch(&mut self, lid: usize) {
        self.clock += 1;
        self.slots[lid].touched = self.clock;
    }

    fn became_resident(&mut self) {
        self.stats.resident += 1;
        self.stats.peak_resident = self.stats.peak_resident.max(self.stats.resident);
    }

    /// Evicts least recently touched blocks, never one of `pinned`, until
    /// `needed` more blocks fit under the limit.
    fn make_room(&mut self, pinned: &[usize], needed: usize) -> Result<()> {
        let Some(limit) = self.config.limit else {
            return Ok(());
        };
        while self.stats.resident + needed > limit {
            let victim = self
                .slots
                .iter()
                .enumerate()
                .filter(|(lid, slot)| slot.is_resident() && !pinned.contains(lid))
                .min_by_key(|(_, slot)| slot.touched)
                .map(|(lid, _)| lid)
                .ok_or_else(|| {
                    Error::Config(format!(
                        "memory limit of {} blocks leaves no room to load more",
                        limit
                    ))
                })?;
            self.evict(victim)?;
        }
        Ok(())
    }

    fn evict(&mut self, lid: usize) -> Result<()> {
        let storage = self.storage.clone().ok_or_else(|| {
            Error::Config("no storage to evict blocks to".into())
        })?;
        let slot = &mut self.slots[lid];
        let block = match mem::replace(&mut slot.residence, Residence::Moving) {
            Residence::Resident(block) => block,
            other => {
                slot.residence = other;
                return Ok(());
            }
        };
        let mut bb = BinaryBuffer::new();
        (self.callbacks.save)(&block, &mut bb);
        let bytes = bb.len();
        match storage.put(bb) {
            Ok(handle) => {
                (self.callbacks.destroy)(block);
                slot.residence = Residence::Stored(handle);
                self.stats.resident -= 1;
                self.stats.evictions += 1;
                trace!(gid = slot.gid, handle, bytes, "evicted block");
                Ok(())
            }
            Err(e) => {
                slot.residence = Residence::Resident(block);
                Err(e)
            }
        }
    }

    fn load(&mut self, lid: usize, pinned: &[usize]) -> Result<()> {
        if self.slots[lid].is_resident() {
            return Ok(());
        }
        self.make_room(pinned, 1)?;
        let storage = self.storage.clone();
        self.slots[lid].reload(storage.as_deref(), &self.callbacks)?;
        self.stats.reloads += 1;
        self.became_resident();
        Ok(())
    }

    /// Makes sure every block of `batch` can be in memory at the same time,
    /// evicting others as needed, and marks them as touched.
    fn reserve(&mut self, batch: &[usize]) -> Result<()> {
        for &lid in batch {
            self.check_lid(lid)?;
        }
        if let Some(limit) = self.config.limit {
            if batch.len() > limit {
                Err(Error::Config(format!(
                    "{} blocks can't be in memory under a limit of {}",
                    batch.len(),
                    limit
                )))?
            }
        }
        let missing = batch
            .iter()
            .filter(|&&lid| !self.slots[lid].is_resident())
            .count();
        self.make_room(batch, missing)?;
        for &lid in batch {
            self.touch(lid);
        }
        Ok(())
    }

    /// Brings every block of `batch` into memory at the same time.
    fn ensure_resident(&mut self, batch: &[usize]) -> Result<()> {
        self.reserve(batch)?;
        for &lid in batch {
            self.load(lid, batch)?;
        }
        Ok(())
    }

    fn resident_among(&self, lids: &[usize]) -> usize {
        lids.iter()
            .filter(|&&lid| self.slots[lid].is_resident())
            .count()
    }

    /// Splits `lids` into batches that fit both the thread count and the
    /// memory limit, blocks already in memory first.
    fn batches(&self, mut lids: Vec<usize>) -> Vec<Vec<usize>> {
        lids.sort_by_key(|&lid| (!self.slots[lid].is_resident(), lid));
        let width = self
            .config
            .threads
            .min(self.config.limit.unwrap_or(usize::MAX))
            .max(1);
        lids.chunks(width).map(<[usize]>::to_vec).collect()
    }

    /// Runs `f` on the blocks at `lids` with their proxies.
    pub(crate) fn run<F>(&mut self, lids: Vec<usize>, f: F) -> Result<()>
    where
        B: Send,
        F: Fn(usize, &mut B, Proxy<'_>) -> Result<()> + Sync,
    {
        for batch in self.batches(lids) {
            self.reserve(&batch)?;
            self.run_batch(&batch, &f)?;
        }
        Ok(())
    }

    /// Runs one reserved batch. Evicted blocks are reloaded by the thread
    /// that runs their callback.
    fn run_batch<F>(&mut self, batch: &[usize], f: &F) -> Result<()>
    where
        B: Send,
        F: Fn(usize, &mut B, Proxy<'_>) -> Result<()> + Sync,
    {
        let storage = self.storage.clone();
        let storage = storage.as_deref();
        let callbacks = self.callbacks;
        let before = self.resident_among(batch);

        let run_one = |lid: usize, slot: &mut Slot<B>| -> Result<()> {
            slot.reload(storage, &callbacks)?;
            let (block, proxy) = slot.split()?;
            f(lid, block, proxy)
        };
        let run_one = &run_one;

        let selected: Vec<(usize, &mut Slot<B>)> = self
            .slots
            .iter_mut()
            .enumerate()
            .filter(|(lid, _)| batch.contains(lid))
            .collect();

        let result = if selected.len() <= 1 {
            selected
                .into_iter()
                .try_for_each(|(lid, slot)| run_one(lid, slot))
        } else {
            thread::scope(|scope| {
                let handles: Vec<_> = selected
                    .into_iter()
                    .map(|(lid, slot)| scope.spawn(move || run_one(lid, slot)))
                    .collect();
                let mut result = Ok(());
                for handle in handles {
                    let outcome = handle.join().unwrap_or_else(|_| {
                        Err(Error::Aborted("block callback panicked".into()))
                    });
                    if result.is_ok() {
                        result = outcome;
                    }
                }
                result
            })
        };

        // count reloads even when a callback failed
        let reloaded = self.resident_among(batch) - before;
        self.stats.reloads += reloaded;
        for _ in 0..reloaded {
            self.became_resident();
        }
        result
    }

    /// Fails on the first block among `lids` that left unread data behind.
    pub(crate) fn check_drained<I>(&mut self, lids: I) -> Result<()>
    where
        I: IntoIterator<Item = usize>,
    {
        for lid in lids {
            let slot = &mut self.slots[lid];
            if let Some(from) = slot.undrained() {
                Err(Error::UndrainedQueue {
                    gid: slot.gid,
                    from,
                })?
            }
        }
        Ok(())
    }

    /// Targets every local block enqueued to, as `(lid, target gid)`.
    pub(crate) fn pending_targets(&self) -> Vec<(usize, Gid)> {
        self.slots
            .iter()
            .enumerate()
            .flat_map(|(lid, slot)| slot.outgoing.keys().map(move |to| (lid, to.gid)))
            .collect()
    }

    /// Moves every outgoing queue to its target's incoming queue. Every
    /// worker sends each peer exactly one batch (possibly empty) per call,
    /// so all workers must call this together.
    pub(crate) async fn deliver(&mut self, tag: Tag) -> Result<()> {
        let rank = self.comm.rank();
        let size = self.comm.size();

        let mut local = Vec::new();
        let mut remote: Vec<Vec<(Gid, Gid, BinaryBuffer)>> =
            (0..size).map(|_| Vec::new()).collect();
        for slot in &mut self.slots {
            let mut queues: Vec<_> = slot.outgoing.drain().collect();
            queues.sort_by_key(|(to, _)| *to);
            for (to, bb) in queues {
                if to.proc == rank {
                    local.push((slot.gid, to.gid, bb));
                } else {
                    remote
                        .get_mut(to.proc)
                        .ok_or(Error::NoRoute(to.gid))?
                        .push((slot.gid, to.gid, bb));
                }
            }
        }

        let mut sent = 0;
        for (peer, queues) in remote.into_iter().enumerate() {
            if peer == rank {
                continue;
            }
            sent += queues.len();
            let mut batch = BinaryBuffer::new();
            batch.save_len(queues.len());
            for (from, to, bb) in &queues {
                from.save(&mut batch);
                to.save(&mut batch);
                batch.save_len(bb.len());
                batch.save_binary(bb.as_slice());
            }
            self.comm.send(peer, tag, batch)?;
        }

        let kept = local.len();
        for (from, to, bb) in local {
            self.receive(from, to, bb)?;
        }

        let mut received = 0;
        for peer in (0..size).filter(|&peer| peer != rank) {
            let mut batch = self.comm.recv(peer, tag).await?;
            let n = batch.load_len()?;
            for _ in 0..n {
                let from = Gid::load(&mut batch)?;
                let to = Gid::load(&mut batch)?;
                let len = batch.load_len()?;
                let bytes = batch.load_binary(len)?.to_vec();
                self.receive(from, to, BinaryBuffer::from_vec(bytes))?;
            }
            received += n;
        }
        trace!(kept, sent, received, "delivered queues");
        Ok(())
    }

    fn receive(&mut self, from: Gid, to: Gid, bb: BinaryBuffer) -> Result<()> {
        let lid = *self.lids.get(&to).ok_or(Error::NoRoute(to))?;
        let incoming = &mut self.slots[lid].incoming;
        match incoming.get_mut(&from) {
            Some(queue) => queue.append(&bb),
            None => {
                incoming.insert(from, bb);
            }
        }
        Ok(())
    }
}

impl<B> Drop for Master<B> {
    fn drop(&mut self) {
        for slot in self.slots.drain(..) {
            match slot.residence {
                Residence::Resident(block) => (self.callbacks.destroy)(block),
                Residence::Stored(handle) => {
                    let Some(storage) = &self.storage else { continue };
                    if let Err(e) = storage.discard(handle) {
                        warn!(gid = slot.gid, handle, error = %e, "couldn't discard stored block");
                    }
                }
                Residence::Moving => {}
            }
        }
    }
}
