use std::collections::VecDeque;

use hashbrown::HashMap;

use super::collectives::{Collective, ReduceOp, ScratchOp};
use crate::{
    error::{Error, Result},
    link::Link,
    serialization::{BinaryBuffer, Serialization},
    types::{BlockID, Gid},
};

pub(crate) type IncomingQueues = HashMap<Gid, BinaryBuffer>;
pub(crate) type OutgoingQueues = HashMap<BlockID, BinaryBuffer>;
pub(crate) type CollectivesList = VecDeque<Collective>;

/// A block's communication handle for the duration of one callback.
///
/// The proxy borrows the registry's queues for this block only; it can't
/// outlive the callback it was handed to, and it can't reach any other
/// block's queues.
pub struct Proxy<'a> {
    gid: Gid,
    link: &'a Link,
    incoming: &'a mut IncomingQueues,
    outgoing: &'a mut OutgoingQueues,
    collectives: &'a mut CollectivesList,
}

impl<'a> Proxy<'a> {
    pub(crate) fn new(
        gid: Gid,
        link: &'a Link,
        incoming: &'a mut IncomingQueues,
        outgoing: &'a mut OutgoingQueues,
        collectives: &'a mut CollectivesList,
    ) -> Self {
        Self {
            gid,
            link,
            incoming,
            outgoing,
            collectives,
        }
    }

    pub fn gid(&self) -> Gid {
        self.gid
    }

    /// The block's static link.
    pub fn link(&self) -> &Link {
        self.link
    }

    /// Queues `x` for `to`.
    pub fn enqueue<T: Serialization>(&mut self, to: &BlockID, x: &T) {
        x.save(self.outgoing(to));
    }

    /// Queues `x` for `to` using a custom serializer.
    pub fn enqueue_with<T, F>(&mut self, to: &BlockID, x: &T, save: F)
    where
        F: FnOnce(&mut BinaryBuffer, &T),
    {
        save(self.outgoing(to), x);
    }

    /// Queues the elements of `xs` back to back with no length prefix; the
    /// receiver must know how many to expect (see [`Proxy::dequeue_into`]).
    pub fn enqueue_slice<T: Serialization>(&mut self, to: &BlockID, xs: &[T]) {
        let out = self.outgoing(to);
        for x in xs {
            x.save(out);
        }
    }

    /// Queues the same value for every target.
    pub fn enqueue_all<'b, T, I>(&mut self, targets: I, x: &T)
    where
        T: Serialization,
        I: IntoIterator<Item = &'b BlockID>,
    {
        for to in targets {
            self.enqueue(to, x);
        }
    }

    /// Reads the next value sent by `from`.
    pub fn dequeue<T: Serialization>(&mut self, from: Gid) -> Result<T> {
        self.dequeue_with(from, T::load)
    }

    /// Reads the next value sent by `from` with a custom deserializer.
    pub fn dequeue_with<T, F>(&mut self, from: Gid, load: F) -> Result<T>
    where
        F: FnOnce(&mut BinaryBuffer) -> Result<T>,
    {
        let bb = self.incoming.get_mut(&from).ok_or(Error::EmptyQueue {
            gid: self.gid,
            from,
        })?;
        let x = load(bb)?;
        if bb.exhausted() {
            self.incoming.remove(&from);
        }
        Ok(x)
    }

    /// Fills `xs` from values sent with [`Proxy::enqueue_slice`].
    pub fn dequeue_into<T: Serialization>(
        &mut self,
        from: Gid,
        xs: &mut [T],
    ) -> Result<()> {
        self.dequeue_with(from, |bb| {
            for x in xs.iter_mut() {
                *x = T::load(bb)?;
            }
            Ok(())
        })
    }

    /// Gids that have sent this block something, ascending.
    pub fn incoming_gids(&self) -> Vec<Gid> {
        let mut gids: Vec<_> = self.incoming.keys().copied().collect();
        gids.sort_unstable();
        gids
    }

    /// Raw access to the queue from `from`.
    pub fn incoming(&mut self, from: Gid) -> Option<&mut BinaryBuffer> {
        self.incoming.get_mut(&from)
    }

    /// Raw access to the queue for `to`, created on first use.
    pub fn outgoing(&mut self, to: &BlockID) -> &mut BinaryBuffer {
        self.outgoing.entry(*to).or_default()
    }

    /// Posts an all-reduce of `x` over every block; the result is available
    /// through [`Proxy::get`] once the registry has processed collectives.
    pub fn all_reduce<T, F>(&mut self, x: T, op: F)
    where
        T: Serialization + Clone + Send + Sync + 'static,
        F: Fn(&T, &T) -> T + Send + Sync + 'static,
    {
        self.collectives
            .push_back(Collective::new(Box::new(ReduceOp::all_reduce(x, op))));
    }

    /// Posts an inclusive scan: the result combines the values of every block
    /// with a gid at most this block's, in gid order.
    pub fn scan<T, F>(&mut self, x: T, op: F)
    where
        T: Serialization + Clone + Send + Sync + 'static,
        F: Fn(&T, &T) -> T + Send + Sync + 'static,
    {
        self.collectives
            .push_back(Collective::new(Box::new(ReduceOp::scan(x, op))));
    }

    /// Posts a value that comes back unchanged, in order with the other
    /// collectives.
    pub fn scratch<T>(&mut self, x: T)
    where
        T: Serialization + Clone + Send + Sync + 'static,
    {
        self.collectives
            .push_back(Collective::new(Box::new(ScratchOp::new(x))));
    }

    /// The oldest collective's result, left in place.
    pub fn read<T: Clone + 'static>(&self) -> Result<T> {
        let front = self
            .collectives
            .front()
            .ok_or(Error::CollectiveUnresolved(self.gid))?;
        front.result::<T>(self.gid)
    }

    /// The oldest collective's result, removed from the list.
    pub fn get<T: Clone + 'static>(&mut self) -> Result<T> {
        let x = self.read::<T>()?;
        self.collectives.pop_front();
        Ok(x)
    }

    /// Number of posted collectives not yet taken with `get`.
    pub fn pending_collectives(&self) -> usize {
        self.collectives.len()
    }
}
