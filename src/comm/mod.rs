//! Message-passing transport between workers.
//!
//! Workers are connected by a full mesh of unbounded channels. Messages are
//! matched on `(sender, tag)`; anything that arrives for a different pair is
//! stashed until someone asks for it, so per-pair order is always the order
//! of sending. Collectives (barrier, gather, broadcast, all-reduce) are built
//! on top of point-to-point messages through worker 0.
//!
//! When a worker under [`run_workers`] fails, it raises a world-wide abort
//! flag and every pending or later `recv` elsewhere returns
//! [`Error::PeerFailed`] instead of waiting forever.

use std::{collections::VecDeque, future::Future, sync::Arc};

use futures::future::join_all;
use hashbrown::HashMap;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, debug_span, trace, Instrument};

use crate::{
    error::{Error, Result},
    serialization::{BinaryBuffer, Serialization},
    types::Rank,
};

pub mod ops;

pub type Tag = u32;

/// Tags used by the library itself. User code sending directly over a
/// communicator should stay below `RESERVED`.
pub(crate) mod tags {
    use super::Tag;

    pub const RESERVED: Tag = 0xFFFF_0000;
    pub const BARRIER: Tag = RESERVED;
    pub const GATHER: Tag = RESERVED + 1;
    pub const BROADCAST: Tag = RESERVED + 2;
    pub const SCATTER: Tag = RESERVED + 3;
    pub const EXCHANGE: Tag = RESERVED + 4;
    pub const ROUND: Tag = RESERVED + 5;
}

struct Envelope {
    from: Rank,
    tag: Tag,
    payload: BinaryBuffer,
}

struct Mailbox {
    rx: mpsc::UnboundedReceiver<Envelope>,
    failed: watch::Receiver<Option<Rank>>,
    stash: HashMap<(Rank, Tag), VecDeque<BinaryBuffer>>,
}

/// One worker's handle onto the transport. There is no process-wide
/// instance; every registry is handed the communicator it should use.
pub struct Communicator {
    rank: Rank,
    peers: Vec<mpsc::UnboundedSender<Envelope>>,
    failed: Arc<watch::Sender<Option<Rank>>>,
    mailbox: Mutex<Mailbox>,
}

/// Marks a worker as failed for the whole world.
#[derive(Clone)]
pub struct AbortHandle {
    rank: Rank,
    failed: Arc<watch::Sender<Option<Rank>>>,
}

impl AbortHandle {
    pub fn abort(&self) {
        // the first failure is the one worth reporting
        self.failed.send_if_modified(|failed| {
            if failed.is_some() {
                return false;
            }
            *failed = Some(self.rank);
            true
        });
    }
}

// Aborts on drop unless disarmed, so a panicking worker also counts.
struct AbortGuard(Option<AbortHandle>);

impl AbortGuard {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

/// Builds `size` connected communicators, one per worker, indexed by rank.
pub fn local_world(size: usize) -> Vec<Communicator> {
    let (txs, rxs): (Vec<_>, Vec<_>) =
        (0..size).map(|_| mpsc::unbounded_channel()).unzip();
    let (failed, watcher) = watch::channel(None);
    let failed = Arc::new(failed);
    rxs.into_iter()
        .enumerate()
        .map(|(rank, rx)| Communicator {
            rank,
            peers: txs.clone(),
            failed: failed.clone(),
            mailbox: Mutex::new(Mailbox {
                rx,
                failed: watcher.clone(),
                stash: HashMap::new(),
            }),
        })
        .collect()
}

/// Runs `worker` once per rank of a fresh local world, each in its own task,
/// and collects the results in rank order. A worker that fails or panics
/// aborts the others. The error returned is the one that caused the abort,
/// not the [`Error::PeerFailed`] it led to elsewhere.
pub async fn run_workers<F, Fut, T>(size: usize, worker: F) -> Result<Vec<T>>
where
    F: Fn(Communicator) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let handles = local_world(size)
        .into_iter()
        .map(|comm| {
            let rank = comm.rank();
            let span = debug_span!("worker", rank);
            let mut guard = AbortGuard(Some(comm.abort_handle()));
            let work = worker(comm);
            tokio::spawn(
                async move {
                    let result = work.await;
                    match &result {
                        Ok(_) => guard.disarm(),
                        Err(e) => debug!(error = %e, "worker failed"),
                    }
                    result
                }
                .instrument(span),
            )
        })
        .collect::<Vec<_>>();

    let mut results = Vec::with_capacity(size);
    let mut error: Option<Error> = None;
    for joined in join_all(handles).await {
        let result = joined
            .map_err(|e| Error::Aborted(format!("worker died: {}", e)))
            .and_then(|result| result);
        match result {
            Ok(value) => results.push(value),
            Err(e) => {
                let replace = match (&error, &e) {
                    (None, _) => true,
                    (Some(Error::PeerFailed(_)), Error::PeerFailed(_)) => false,
                    (Some(Error::PeerFailed(_)), _) => true,
                    _ => false,
                };
                if replace {
                    error = Some(e);
                }
            }
        }
    }
    match error {
        Some(e) => Err(e),
        None => Ok(results),
    }
}

impl Communicator {
    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.peers.len()
    }

    /// A handle that marks this worker as failed for everyone.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            rank: self.rank,
            failed: self.failed.clone(),
        }
    }

    /// Sends without waiting for the receiver.
    pub fn send(&self, to: Rank, tag: Tag, payload: BinaryBuffer) -> Result<()> {
        let peer = self.peers.get(to).ok_or(Error::NoRoute(to))?;
        trace!(to, tag, bytes = payload.len(), "send");
        peer.send(Envelope {
            from: self.rank,
            tag,
            payload,
        })
        .map_err(|_| Error::TransportClosed(to))
    }

    /// Waits for the next message from `from` with `tag`.
    pub async fn recv(&self, from: Rank, tag: Tag) -> Result<BinaryBuffer> {
        if from >= self.size() {
            Err(Error::NoRoute(from))?
        }
        let mut guard = self.mailbox.lock().await;
        let mailbox = &mut *guard;
        if let Some(payload) = mailbox
            .stash
            .get_mut(&(from, tag))
            .and_then(|queue| queue.pop_front())
        {
            return Ok(payload);
        }
        loop {
            let failed = *mailbox.failed.borrow_and_update();
            if let Some(rank) = failed {
                Err(Error::PeerFailed(rank))?
            }
            let envelope = tokio::select! {
                biased;
                // we hold a sender to ourselves, so the channel can't close
                envelope = mailbox.rx.recv() => {
                    envelope.ok_or(Error::TransportClosed(self.rank))?
                }
                Ok(()) = mailbox.failed.changed() => continue,
            };
            if envelope.from == from && envelope.tag == tag {
                trace!(from, tag, bytes = envelope.payload.len(), "recv");
                return Ok(envelope.payload);
            }
            mailbox
                .stash
                .entry((envelope.from, envelope.tag))
                .or_default()
                .push_back(envelope.payload);
        }
    }

    /// Collects one buffer from every worker at `root`, in rank order. Other
    /// workers get an empty vector back.
    pub async fn gather(
        &self,
        payload: BinaryBuffer,
        root: Rank,
    ) -> Result<Vec<BinaryBuffer>> {
        if self.rank != root {
            self.send(root, tags::GATHER, payload)?;
            return Ok(Vec::new());
        }
        let mut parts = Vec::with_capacity(self.size());
        let mut own = Some(payload);
        for from in 0..self.size() {
            if from == root {
                parts.push(own.take().unwrap_or_default());
            } else {
                parts.push(self.recv(from, tags::GATHER).await?);
            }
        }
        Ok(parts)
    }

    /// Sends `parts[r]` from `root` to every worker `r`; returns this
    /// worker's part.
    pub async fn scatter(
        &self,
        parts: Vec<BinaryBuffer>,
        root: Rank,
    ) -> Result<BinaryBuffer> {
        if self.rank != root {
            return self.recv(root, tags::SCATTER).await;
        }
        if parts.len() != self.size() {
            Err(Error::Config(format!(
                "scatter needs {} parts, got {}",
                self.size(),
                parts.len()
            )))?
        }
        let mut own = BinaryBuffer::new();
        for (to, part) in parts.into_iter().enumerate() {
            if to == root {
                own = part;
            } else {
                self.send(to, tags::SCATTER, part)?;
            }
        }
        Ok(own)
    }

    /// Distributes `root`'s buffer to every worker. Only the root's `payload`
    /// is used.
    pub async fn broadcast_buffer(
        &self,
        payload: Option<BinaryBuffer>,
        root: Rank,
    ) -> Result<BinaryBuffer> {
        if self.rank != root {
            return self.recv(root, tags::BROADCAST).await;
        }
        let payload = payload.ok_or_else(|| {
            Error::Config("broadcast root has nothing to send".into())
        })?;
        for to in (0..self.size()).filter(|&to| to != root) {
            self.send(to, tags::BROADCAST, payload.clone())?;
        }
        Ok(payload)
    }

    pub async fn broadcast<T: Serialization>(
        &self,
        value: Option<T>,
        root: Rank,
    ) -> Result<T> {
        if self.rank == root {
            let value = value.ok_or_else(|| {
                Error::Config("broadcast root has nothing to send".into())
            })?;
            let mut bb = BinaryBuffer::new();
            value.save(&mut bb);
            self.broadcast_buffer(Some(bb), root).await?;
            Ok(value)
        } else {
            let mut bb = self.broadcast_buffer(None, root).await?;
            T::load(&mut bb)
        }
    }

    /// Combines every worker's `value` with `op` (in rank order) and returns
    /// the result everywhere.
    pub async fn all_reduce<T, F>(&self, value: T, op: F) -> Result<T>
    where
        T: Serialization,
        F: Fn(&T, &T) -> T,
    {
        let mut bb = BinaryBuffer::new();
        value.save(&mut bb);
        let parts = self.gather(bb, 0).await?;
        let combined = if self.rank == 0 {
            let mut acc = value;
            for mut part in parts.into_iter().skip(1) {
                acc = op(&acc, &T::load(&mut part)?);
            }
            Some(acc)
        } else {
            None
        };
        self.broadcast(combined, 0).await
    }

    /// Returns once every worker has entered the barrier.
    pub async fn barrier(&self) -> Result<()> {
        if self.rank == 0 {
            for from in 1..self.size() {
                self.recv(from, tags::BARRIER).await?;
            }
            for to in 1..self.size() {
                self.send(to, tags::BARRIER, BinaryBuffer::new())?;
            }
        } else {
            self.send(0, tags::BARRIER, BinaryBuffer::new())?;
            self.recv(0, tags::BARRIER).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_match_on_sender_and_tag() {
        let world = local_world(2);
        let mut a = BinaryBuffer::new();
        1u32.save(&mut a);
        let mut b = BinaryBuffer::new();
        2u32.save(&mut b);
        let mut c = BinaryBuffer::new();
        3u32.save(&mut c);

        world[0].send(1, 7, a).unwrap();
        world[0].send(1, 8, b).unwrap();
        world[0].send(1, 7, c).unwrap();

        let mut got = world[1].recv(0, 8).await.unwrap();
        assert_eq!(u32::load(&mut got).unwrap(), 2);
        let mut got = world[1].recv(0, 7).await.unwrap();
        assert_eq!(u32::load(&mut got).unwrap(), 1);
        let mut got = world[1].recv(0, 7).await.unwrap();
        assert_eq!(u32::load(&mut got).unwrap(), 3);
    }

    #[tokio::test]
    async fn all_reduce_reaches_everyone() {
        let results = run_workers(4, |comm| async move {
            let rank = comm.rank() as i64;
            let sum = comm.all_reduce(rank, ops::plus).await?;
            let max = comm.all_reduce(rank, ops::maximum).await?;
            comm.barrier().await?;
            Ok::<_, Error>((sum, max))
        })
        .await
        .unwrap();
        assert_eq!(results, vec![(6, 3); 4]);
    }

    #[tokio::test]
    async fn scatter_delivers_each_part() {
        let results = run_workers(3, |comm| async move {
            let parts = if comm.rank() == 1 {
                (0..3u32)
                    .map(|r| {
                        let mut bb = BinaryBuffer::new();
                        (r * 10).save(&mut bb);
                        bb
                    })
                    .collect()
            } else {
                Vec::new()
            };
            let mut mine = comm.scatter(parts, 1).await?;
            u32::load(&mut mine)
        })
        .await
        .unwrap();
        assert_eq!(results, vec![0, 10, 20]);
    }

    #[tokio::test]
    async fn a_failed_worker_releases_its_peers() {
        let result = run_workers(3, |comm| async move {
            if comm.rank() == 2 {
                Err(Error::Aborted("gave up".into()))?
            }
            // never completes without worker 2
            comm.barrier().await?;
            Ok::<_, Error>(())
        })
        .await;
        assert!(matches!(result, Err(Error::Aborted(msg)) if msg == "gave up"));
    }

    #[tokio::test]
    async fn a_finished_worker_doesnt_abort_the_rest() {
        let results = run_workers(2, |comm| async move {
            if comm.rank() == 0 {
                let mut bb = BinaryBuffer::new();
                5u32.save(&mut bb);
                comm.send(1, 9, bb)?;
                return Ok(0);
            }
            // give worker 0 time to finish first
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            let mut bb = comm.recv(0, 9).await?;
            u32::load(&mut bb)
        })
        .await
        .unwrap();
        assert_eq!(results, vec![0, 5]);
    }

    #[tokio::test]
    async fn unknown_rank_has_no_route() {
        let world = local_world(1);
        assert!(matches!(
            world[0].send(3, 0, BinaryBuffer::new()),
            Err(Error::NoRoute(3))
        ));
    }
}
