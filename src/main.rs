use std::{
    collections::HashSet,
    io,
    path::PathBuf,
    process::ExitCode,
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::Result;
use bitleech::{
    storage::{FileSink, PieceSink},
    TorrentClientBuilder,
};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::info;

/// Download the content of a single-file torrent.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to the .torrent file
    torrent: PathBuf,
    /// Output file, defaults to the name in the torrent
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Port reported to the tracker
    #[arg(long, default_value_t = 6881)]
    port: u16,
    /// Maximum number of session rounds
    #[arg(long, default_value_t = 8)]
    max_rounds: u32,
}

/// Advances the progress bar by each piece the first time it is stored.
struct ProgressSink {
    inner: FileSink,
    bar: ProgressBar,
    stored: Mutex<HashSet<u32>>,
}

impl PieceSink for ProgressSink {
    fn store(&self, index: u32, data: &[u8]) -> io::Result<()> {
        self.inner.store(index, data)?;
        let first = self
            .stored
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(index);
        if first {
            self.bar.inc(data.len() as u64);
        }
        Ok(())
    }
}

async fn run(args: Args) -> Result<()> {
    let client = TorrentClientBuilder::new()
        .add_torrent_path(&args.torrent)?
        .set_port(args.port)
        .set_max_rounds(args.max_rounds)
        .build()?;
    let meta = client.metadata();
    let output = args
        .output
        .unwrap_or_else(|| PathBuf::from(&meta.name));

    let bar = ProgressBar::new(meta.length);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})",
        )?
        .progress_chars("#>-"),
    );
    let sink = Arc::new(ProgressSink {
        inner: FileSink::create(&output, meta.length, meta.piece_length)?,
        bar: bar.clone(),
        stored: Mutex::new(HashSet::new()),
    });

    let report = client.download(sink).await?;
    bar.finish();
    info!(
        "saved {} pieces to {} in {} rounds",
        report.completed,
        output.display(),
        report.rounds
    );
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error processing torrent file: {:#}", err);
            ExitCode::FAILURE
        }
    }
}
