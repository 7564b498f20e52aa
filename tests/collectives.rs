use mosaic::{
    ops, run_workers, Assigner, BlockCallbacks, ContiguousAssigner, Error, Gid,
    Link, Master, MasterConfig, RoundRobinAssigner,
};
use rstest::rstest;

#[derive(Debug, Default, Clone, PartialEq)]
struct Results {
    sum: i64,
    min: i64,
    max: i64,
    scratch: String,
    prefix: i64,
}

#[rstest]
#[case(1, 5)]
#[case(3, 7)]
// more workers than blocks: some workers hold nothing
#[case(4, 3)]
#[tokio::test]
async fn collectives_resolve_in_posting_order(
    #[case] workers: usize,
    #[case] nblocks: usize,
) {
    let results = run_workers(workers, move |comm| async move {
        let assigner = RoundRobinAssigner::new(comm.size(), nblocks)?;
        let rank = comm.rank();
        let mut master: Master<i64> = Master::new(
            comm,
            MasterConfig::default(),
            BlockCallbacks::of(),
            None,
        )?;
        for gid in assigner.local_gids(rank) {
            master.add(gid, gid as i64 * 3 - 4, Link::new())?;
        }

        master.foreach(|value, p| {
            p.all_reduce(*value, ops::plus);
            p.all_reduce(*value, ops::minimum);
            p.all_reduce(*value, ops::maximum);
            p.scratch(format!("block {}", p.gid()));
            p.scan(*value, ops::plus);
            Ok(())
        })?;
        master.process_collectives().await?;

        let mut out = Vec::new();
        for lid in 0..master.size() {
            let mut p = master.proxy(lid)?;
            let gid = p.gid();
            let results = Results {
                sum: p.get()?,
                min: p.get()?,
                max: p.get()?,
                scratch: p.get()?,
                prefix: p.get()?,
            };
            assert_eq!(p.pending_collectives(), 0);
            out.push((gid, results));
        }
        Ok::<_, Error>(out)
    })
    .await
    .unwrap();

    let value = |gid: Gid| gid as i64 * 3 - 4;
    let all: Vec<(Gid, Results)> = results.into_iter().flatten().collect();
    assert_eq!(all.len(), nblocks);
    for (gid, r) in all {
        assert_eq!(r.sum, (0..nblocks).map(value).sum::<i64>());
        assert_eq!(r.min, value(0));
        assert_eq!(r.max, value(nblocks - 1));
        assert_eq!(r.scratch, format!("block {}", gid));
        assert_eq!(r.prefix, (0..=gid).map(value).sum::<i64>());
    }
}

#[tokio::test]
async fn read_leaves_the_result_in_place() {
    let results = run_workers(2, |comm| async move {
        let assigner = ContiguousAssigner::new(comm.size(), 4)?;
        let rank = comm.rank();
        let mut master: Master<u32> =
            Master::new(comm, MasterConfig::default(), BlockCallbacks::of(), None)?;
        for gid in assigner.local_gids(rank) {
            master.add(gid, gid as u32, Link::new())?;
            let lid = master.size() - 1;
            master.proxy(lid)?.all_reduce(gid as u32, ops::maximum);
        }
        master.process_collectives().await?;

        let mut p = master.proxy(0)?;
        let peek: u32 = p.read()?;
        let taken: u32 = p.get()?;
        let after = p.get::<u32>();
        Ok::<_, Error>((peek, taken, matches!(after, Err(Error::CollectiveUnresolved(_)))))
    })
    .await
    .unwrap();
    assert_eq!(results, vec![(3, 3, true); 2]);
}

#[tokio::test]
async fn workers_disagreeing_on_collectives_fail_together() {
    let results = run_workers(2, |comm| async move {
        let rank = comm.rank();
        let mut master: Master<u32> =
            Master::new(comm, MasterConfig::default(), BlockCallbacks::of(), None)?;
        master.add(rank, 0, Link::new())?;
        if rank == 0 {
            master.proxy(0)?.all_reduce(1u32, ops::plus);
        }
        Ok::<_, Error>(matches!(
            master.process_collectives().await,
            Err(Error::CollectiveMismatch(_))
        ))
    })
    .await
    .unwrap();
    assert_eq!(results, vec![true, true]);
}
