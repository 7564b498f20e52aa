//! Multi-round reductions driven by a [`Partners`] pattern.

// Every round runs the callback on the local blocks the pattern marks active,
// handing each a proxy whose in-link names who it hears from this round and
// whose out-link names who it may send to. Once every callback of the round
// has returned, queues are checked and delivered, and the next round starts.
// The last round (`partners.rounds()`) only receives.
//
// A skipped block runs nothing in that round. Whatever was delivered to it
// stays in its incoming queues and is still there, together with anything
// delivered later, the next round it runs. Nothing may be left unread once
// the last round is over, and the pattern must cover exactly the assigner's
// blocks.

use std::ops::{Deref, DerefMut};

use hashbrown::HashMap;
use tracing::{debug, debug_span, trace, Instrument};

use crate::{
    assigner::Assigner,
    comm::tags,
    error::{Error, Result},
    link::Link,
    master::{Master, Proxy},
    partners::Partners,
    types::{BlockID, Gid},
};

/// A block's proxy during one reduction round.
pub struct ReduceProxy<'a> {
    proxy: Proxy<'a>,
    round: usize,
    nblocks: usize,
    in_link: &'a Link,
    out_link: &'a Link,
}

impl<'a> ReduceProxy<'a> {
    pub fn round(&self) -> usize {
        self.round
    }

    /// Total number of blocks taking part in the reduction.
    pub fn nblocks(&self) -> usize {
        self.nblocks
    }

    /// The blocks this one hears from at the start of this round.
    pub fn in_link(&self) -> &Link {
        self.in_link
    }

    /// The blocks this one may send to at the end of this round.
    pub fn out_link(&self) -> &Link {
        self.out_link
    }
}

impl<'a> Deref for ReduceProxy<'a> {
    type Target = Proxy<'a>;

    fn deref(&self) -> &Self::Target {
        &self.proxy
    }
}

impl<'a> DerefMut for ReduceProxy<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.proxy
    }
}

/// A skip predicate that never skips.
pub fn no_skip<B>(_round: usize, _lid: usize, _master: &Master<B>) -> bool {
    false
}

/// Runs `callback` round by round over the pattern given by `partners`, on
/// every block. Must be called by every worker.
pub async fn reduce_all<B, P, F>(
    master: &mut Master<B>,
    assigner: &dyn Assigner,
    partners: &P,
    callback: F,
) -> Result<()>
where
    B: Send,
    P: Partners + ?Sized,
    F: Fn(&mut B, &mut ReduceProxy<'_>, &P) -> Result<()> + Sync,
{
    reduce(master, assigner, partners, callback, no_skip).await
}

/// Like [`reduce_all`], but a block is left out of any round for which
/// `skip(round, lid, master)` is true.
pub async fn reduce<B, P, F, S>(
    master: &mut Master<B>,
    assigner: &dyn Assigner,
    partners: &P,
    callback: F,
    skip: S,
) -> Result<()>
where
    B: Send,
    P: Partners + ?Sized,
    F: Fn(&mut B, &mut ReduceProxy<'_>, &P) -> Result<()> + Sync,
    S: Fn(usize, usize, &Master<B>) -> bool,
{
    let span = debug_span!(
        "reduce",
        rank = master.communicator().rank(),
        rounds = partners.rounds()
    );
    async move {
        let nblocks = assigner.nblocks();
        if partners.nblocks() != nblocks {
            Err(Error::Config(format!(
                "partners cover {} blocks, the assigner {}",
                partners.nblocks(),
                nblocks
            )))?
        }
        master.check_drained(0..master.size())?;

        for round in 0..=partners.rounds() {
            let mut links: HashMap<usize, (Link, Link)> = HashMap::new();
            let mut skipped = 0;
            for lid in 0..master.size() {
                let gid = master.gid(lid);
                if !partners.active(round, gid) {
                    continue;
                }
                if skip(round, lid, master) {
                    skipped += 1;
                    continue;
                }
                let in_link = resolve(assigner, partners.incoming(round, gid))?;
                let out_link = resolve(assigner, partners.outgoing(round, gid))?;
                links.insert(lid, (in_link, out_link));
            }
            trace!(round, running = links.len(), skipped, "round starts");

            let lids: Vec<usize> = links.keys().copied().collect();
            master.run(lids, |lid, block, proxy| {
                let Some((in_link, out_link)) = links.get(&lid) else {
                    return Ok(());
                };
                let mut rp = ReduceProxy {
                    proxy,
                    round,
                    nblocks,
                    in_link,
                    out_link,
                };
                callback(block, &mut rp, partners)
            })?;

            master.check_drained(links.keys().copied())?;
            for (lid, to) in master.pending_targets() {
                let allowed = links
                    .get(&lid)
                    .map_or(false, |(_, out_link)| out_link.contains(to));
                if !allowed {
                    Err(Error::UnexpectedTarget {
                        round,
                        from: master.gid(lid),
                        to,
                    })?
                }
            }

            if round < partners.rounds() {
                master.deliver(tags::ROUND).await?;
            }
        }
        // the last round has no later one to hand leftovers to
        master.check_drained(0..master.size())?;
        debug!("reduction done");
        Ok(())
    }
    .instrument(span)
    .await
}

fn resolve(assigner: &dyn Assigner, gids: Vec<Gid>) -> Result<Link> {
    gids.into_iter()
        .map(|gid| Ok(BlockID::new(gid, assigner.rank(gid)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assigner::ContiguousAssigner,
        comm::local_world,
        master::{BlockCallbacks, MasterConfig},
        partners::{RegularMergePartners, RegularSwapPartners},
    };

    fn single_worker(nblocks: usize) -> (Master<u64>, ContiguousAssigner) {
        let comm = local_world(1).pop().unwrap();
        let mut master = Master::new(
            comm,
            MasterConfig::builder().threads(2).build(),
            BlockCallbacks::of(),
            None,
        )
        .unwrap();
        for gid in 0..nblocks {
            master.add(gid, gid as u64 + 1, Link::new()).unwrap();
        }
        (master, ContiguousAssigner::new(1, nblocks).unwrap())
    }

    #[tokio::test]
    async fn sending_outside_the_out_link_fails() {
        let (mut master, assigner) = single_worker(4);
        let partners = RegularMergePartners::new(4, 2, true).unwrap();
        let result = reduce_all(&mut master, &assigner, &partners, |_, rp, _| {
            if rp.round() == 0 && rp.gid() == 1 {
                rp.enqueue(&BlockID::new(3, 0), &1u8);
            }
            Ok(())
        })
        .await;
        assert!(matches!(
            result,
            Err(Error::UnexpectedTarget {
                round: 0,
                from: 1,
                to: 3
            })
        ));
    }

    #[tokio::test]
    async fn unread_messages_fail_the_round() {
        let (mut master, assigner) = single_worker(2);
        let partners = RegularSwapPartners::new(2, 2, true).unwrap();
        let result = reduce_all(&mut master, &assigner, &partners, |_, rp, _| {
            let targets = rp.out_link().clone();
            rp.enqueue_all(targets.iter(), &7u32);
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(Error::UndrainedQueue { .. })));
    }

    #[tokio::test]
    async fn skipped_blocks_keep_their_messages() {
        let (mut master, assigner) = single_worker(4);
        let partners = RegularSwapPartners::new(4, 2, true).unwrap();
        // block 0 sits out round 1 and reads both rounds' messages in round 2
        let skip = |round: usize, lid: usize, _: &Master<u64>| round == 1 && lid == 0;
        reduce(
            &mut master,
            &assigner,
            &partners,
            |b, rp, _| {
                let mut total = 0u64;
                for from in rp.incoming_gids() {
                    while rp.incoming(from).map_or(false, |q| !q.exhausted()) {
                        total += rp.dequeue::<u64>(from)?;
                    }
                }
                if rp.round() > 0 {
                    *b = total;
                }
                let targets = rp.out_link().clone();
                let value = *b;
                rp.enqueue_all(targets.iter(), &value);
                Ok(())
            },
            skip,
        )
        .await
        .unwrap();
        // 1 and 2 from round 0, plus block 2's round 1 sum of 3 + 4
        assert_eq!(master.block(0), Some(&10));
        assert_eq!(master.block(1), Some(&10));
    }

    #[tokio::test]
    async fn partners_and_assigner_must_agree_on_the_block_count() {
        let (mut master, assigner) = single_worker(8);
        let partners = RegularMergePartners::new(4, 2, true).unwrap();
        let result = reduce_all(&mut master, &assigner, &partners, |b, _, _| {
            *b = 0;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(Error::Config(_))));
        for lid in 0..8 {
            assert_eq!(master.block(lid), Some(&(lid as u64 + 1)));
        }
    }

    #[tokio::test]
    async fn skipping_the_last_round_leaves_messages_unread() {
        let (mut master, assigner) = single_worker(2);
        let partners = RegularSwapPartners::new(2, 2, true).unwrap();
        let last = partners.rounds();
        let skip = move |round: usize, lid: usize, _: &Master<u64>| round == last && lid == 0;
        let result = reduce(
            &mut master,
            &assigner,
            &partners,
            |_, rp, _| {
                for from in rp.incoming_gids() {
                    rp.dequeue::<Gid>(from)?;
                }
                let targets = rp.out_link().clone();
                let gid = rp.gid();
                rp.enqueue_all(targets.iter(), &gid);
                Ok(())
            },
            skip,
        )
        .await;
        assert!(matches!(
            result,
            Err(Error::UndrainedQueue { gid: 0, from: 0 })
        ));
    }
}
