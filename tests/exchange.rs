use mosaic::{
    run_workers, Assigner, BlockCallbacks, BlockID, ContiguousAssigner, Error,
    Link, Master, MasterConfig,
};

const NBLOCKS: usize = 6;

fn ring_link(gid: usize, assigner: &dyn Assigner) -> mosaic::Result<Link> {
    let mut link: Link = [(gid + NBLOCKS - 1) % NBLOCKS, (gid + 1) % NBLOCKS]
        .into_iter()
        .map(|g| BlockID::new(g, 0))
        .collect();
    link.fix(assigner)?;
    Ok(link)
}

#[tokio::test]
async fn neighbors_swap_values_across_workers() {
    let results = run_workers(3, |comm| async move {
        let assigner = ContiguousAssigner::new(comm.size(), NBLOCKS)?;
        let rank = comm.rank();
        let mut master: Master<Vec<u64>> = Master::new(
            comm,
            MasterConfig::builder().threads(2).build(),
            BlockCallbacks::of(),
            None,
        )?;
        for gid in assigner.local_gids(rank) {
            master.add(gid, vec![gid as u64 * 10], Link::new())?;
            let lid = master.size() - 1;
            *master.link_mut(lid) = ring_link(gid, &assigner)?;
        }

        for _ in 0..2 {
            master.foreach(|values, p| {
                let last = *values.last().unwrap_or(&0);
                let neighbors = p.link().clone();
                p.enqueue_all(neighbors.iter(), &last);
                Ok(())
            })?;
            master.exchange().await?;
            master.foreach(|values, p| {
                let neighbors = p.link().clone();
                let mut sum = 0;
                for n in neighbors.iter() {
                    sum += p.dequeue::<u64>(n.gid)?;
                }
                values.push(sum);
                Ok(())
            })?;
        }

        let mut out = Vec::new();
        for lid in 0..master.size() {
            out.push((master.gid(lid), master.block_mut(lid)?.clone()));
        }
        Ok::<_, Error>(out)
    })
    .await
    .unwrap();

    let mut all: Vec<_> = results.into_iter().flatten().collect();
    all.sort();
    let first = |g: usize| ((g + NBLOCKS - 1) % NBLOCKS + (g + 1) % NBLOCKS) as u64 * 10;
    for (gid, values) in all {
        let left = (gid + NBLOCKS - 1) % NBLOCKS;
        let right = (gid + 1) % NBLOCKS;
        assert_eq!(values[1], first(gid));
        assert_eq!(values[2], first(left) + first(right));
    }
}

#[tokio::test]
async fn unknown_targets_have_no_route() {
    let results = run_workers(1, |comm| async move {
        let mut master: Master<u8> =
            Master::new(comm, MasterConfig::default(), BlockCallbacks::of(), None)?;
        master.add(0, 0, Link::new())?;
        master.foreach(|_, p| {
            p.enqueue(&BlockID::new(9, 0), &1u8);
            Ok(())
        })?;
        Ok::<_, Error>(matches!(master.exchange().await, Err(Error::NoRoute(9))))
    })
    .await
    .unwrap();
    assert_eq!(results, vec![true]);
}
