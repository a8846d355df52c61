use anyhow::{Context, Result};
use clap::Parser;
use dpl_core::{classify, status_topic, wire::FeedFrame};
use dpl_hub::{FeedReader, LocalHub};
use dpl_sync::{EventChannel, StatusSync};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::{info, warn};

mod config;
mod console;
mod logging;
mod snapshot;

use config::{load_watch_config, resolve_debug, resolve_log_dir, Cli, Command, WatchConfig};
use console::{render_rows, ConsoleSink};
use logging::{init_logging, LogGuard};
use snapshot::FileSnapshotFetcher;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Classify { statuses } => {
            for status in statuses {
                println!("{status}\t{}", classify(Some(&status)));
            }
            Ok(())
        }
        Command::Topic { deployment_id } => {
            println!("{}", status_topic(deployment_id.trim()));
            Ok(())
        }
        Command::Watch(args) => {
            let config = load_watch_config(&args)?;
            let fetcher = FileSnapshotFetcher::new(config.snapshot.clone());
            let project_id = match &config.project_id {
                Some(id) => id.clone(),
                None => {
                    fetcher
                        .load()
                        .await
                        .with_context(|| {
                            format!("failed to read snapshot {}", config.snapshot.display())
                        })?
                        .id
                }
            };
            let log_dir = resolve_log_dir(&cli.log_dir);
            let log_guard = init_logging(resolve_debug(cli.debug), &log_dir, &project_id);
            if log_guard.as_ref().is_some_and(LogGuard::file_enabled) {
                info!(event = "log_file_enabled", log_dir = %log_dir);
            }
            run_watch(config, fetcher, project_id).await
        }
    }
}

async fn run_watch(
    config: WatchConfig,
    fetcher: FileSnapshotFetcher,
    project_id: String,
) -> Result<()> {
    let hub = Arc::new(LocalHub::new());
    let sink = Arc::new(ConsoleSink::default());
    let sync = StatusSync::start(
        config.sync.clone(),
        hub.clone(),
        Arc::new(fetcher),
        sink.clone(),
    );

    let project = sync
        .refresh(&project_id)
        .await
        .with_context(|| format!("failed to load project {project_id}"))?;
    info!(
        event = "watch_start",
        project_id = %project.id,
        project = %project.name,
        services = project.services.len(),
        topics = sync.active_topics().len(),
    );
    if !sync.wait_until_joined(config.join_timeout).await {
        warn!(event = "watch_join_timeout", phase = "initial");
    }
    let refresh_loop = sync.spawn_refresh_loop(project_id.clone());

    let reader: Box<dyn AsyncRead + Unpin + Send> = match &config.feed {
        Some(path) => Box::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("failed to open feed {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdin()),
    };
    let mut feed = FeedReader::new(reader);
    let mut frames = 0usize;
    let mut delivered = 0usize;
    while let Some(frame) = feed.next_frame().await.context("failed to read feed")? {
        frames += 1;
        let rejoining = matches!(frame, FeedFrame::Connectivity { connected: true })
            && !hub.is_connected();
        delivered += hub.apply_frame(frame);
        if rejoining && !sync.wait_until_joined(config.join_timeout).await {
            warn!(event = "watch_join_timeout", phase = "reconnect");
        }
    }
    info!(
        event = "watch_feed_done",
        frames = frames,
        delivered = delivered,
        decode_errors = feed.decode_errors(),
        notifications = sink.printed(),
    );

    let rows = sync.service_rows();
    if config.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        print!("{}", render_rows(&rows));
    }

    sync.shutdown();
    if let Some(handle) = refresh_loop {
        let _ = handle.await;
    }
    Ok(())
}
