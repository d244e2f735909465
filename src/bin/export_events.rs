//! export_events - one-shot export of committed count events to JSON

use anyhow::Result;
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use visitor_counter::{EventStore, Exporter, SqliteEventStore, SystemClock};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the visitor database.
    #[arg(long, env = "COUNTER_DB_PATH", default_value = "visitors.db")]
    db: PathBuf,
    /// Output file for the export artifact.
    #[arg(long, env = "COUNTER_EXPORT_PATH", default_value = "visitors_export.json")]
    output: PathBuf,
    /// Stage progress on stderr.
    #[arg(long, value_enum, default_value = "auto", value_name = "MODE")]
    ui: ui::UiMode,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = ui::Ui::new(args.ui, std::io::stderr().is_terminal());

    let mut store = {
        let mut stage = ui.stage("Open event store");
        let mut store = SqliteEventStore::open(&args.db)?;
        stage.detail(format!("{} event(s)", store.event_count()?));
        store
    };
    let tracks = store.track_count()?;

    let summary = {
        let mut stage = ui.stage("Export events");
        let mut exporter = Exporter::new(Box::new(store), args.output.clone(), Arc::new(SystemClock));
        let summary = exporter.export()?;
        stage.detail(format!("{} event(s)", summary.total));
        summary
    };

    println!(
        "{} count event(s) written to {} ({} retired track(s) on record)",
        summary.total,
        summary.path.display(),
        tracks
    );
    Ok(())
}
