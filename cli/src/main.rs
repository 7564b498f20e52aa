mod simple;
mod sort;

use mosaic::Result;
use tracing::info;

use simple::SimpleSettings;
use sort::SortSettings;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let dir = tempfile::tempdir()?;

    let settings = SimpleSettings::builder().build();
    let reports = simple::run(settings, dir.path().join("simple")).await?;
    for r in reports.iter().take(4) {
        println!(
            "block {}: total {}, neighbor average {}, all blocks {}",
            r.gid, r.total, r.average, r.all_total
        );
    }

    let settings = SortSettings::builder()
        .workers(4)
        .nblocks(16)
        .k(4)
        .threads(2)
        .limit(2)
        .num_values(1000)
        .build();
    let reports = sort::run(settings, Some(dir.path().join("sort"))).await?;
    let count = sort::verify(&reports)?;
    for (rank, r) in reports.iter().enumerate() {
        println!(
            "worker {}: {} blocks, storage count {} max size {}",
            rank,
            r.blocks.len(),
            r.stored,
            r.max_stored
        );
    }
    info!(count, "sorted");
    Ok(())
}
