use std::path::PathBuf;

use anyhow::Context;
use journal::changeset::{FakeChangeset, FakeCodec};
use journal::policy::StaticPolicy;
use journal::Journal;

fn main() -> anyhow::Result<()> {
    init_logging()?;

    let storage_path = std::env::args().nth(1).map(PathBuf::from).unwrap_or_else(|| {
        std::env::temp_dir().join("journal-demo")
    });

    let mut journal: Journal<FakeCodec, StaticPolicy> = Journal::new(StaticPolicy(false));
    journal
        .open(&storage_path, 2 << 20, b"example.com.")
        .context("opening journal")?;

    let ch = FakeChangeset::new(
        0,
        1,
        vec![(true, "www.example.com. 300 IN A 192.0.2.1".to_string())],
    );
    journal.store_changeset(&ch).context("storing changeset")?;

    println!("journal holds {} changeset(s) at {}", journal.count()?, storage_path.display());
    for ch in journal.load_changesets(0).context("loading changesets")? {
        println!("  {} -> {}: {} record(s)", ch.serial_from, ch.serial_to, ch.records.len());
    }

    journal.flush_mark().context("marking flushed")?;
    let report = journal.check().context("checking invariants")?;
    for line in &report.info {
        println!("info: {line}");
    }
    for line in &report.warnings {
        println!("warning: {line}");
    }

    Ok(())
}

fn init_logging() -> anyhow::Result<()> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!("[{}] {}", record.level(), message))
        })
        .level(log::LevelFilter::Info)
        .chain(std::io::stderr())
        .apply()
        .context("installing logger")
}
