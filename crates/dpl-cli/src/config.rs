use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use dpl_sync::{NotifyMode, SyncConfig};
use std::path::PathBuf;
use std::time::Duration;

use crate::logging::non_empty_env;

#[derive(Parser, Debug)]
#[command(name = "dpl", about = "Deployment status sync")]
pub struct Cli {
    #[arg(long, global = true, default_value_t = false)]
    pub debug: bool,
    #[arg(long, global = true, default_value = "")]
    pub log_dir: String,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load a project snapshot, replay an NDJSON status feed through the
    /// sync pipeline and print the resulting service table.
    Watch(WatchArgs),
    /// Print the display class of one or more raw statuses.
    Classify {
        #[arg(required = true)]
        statuses: Vec<String>,
    },
    /// Print the push topic for a deployment id.
    Topic { deployment_id: String },
}

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Project snapshot JSON.
    #[arg(long)]
    pub snapshot: PathBuf,
    /// Defaults to the id found in the snapshot file.
    #[arg(long, default_value = "")]
    pub project: String,
    /// NDJSON feed of status events and connectivity frames; `-` reads stdin.
    #[arg(long, default_value = "-")]
    pub feed: String,
    #[arg(long, default_value = "")]
    pub notify_mode: String,
    /// Re-read the snapshot every N seconds while the feed is replayed.
    #[arg(long)]
    pub refresh_secs: Option<u64>,
    /// Keep pushed statuses across redeploys.
    #[arg(long, default_value_t = false)]
    pub keep_overrides: bool,
    #[arg(long, default_value_t = 5)]
    pub join_timeout_secs: u64,
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Clone, Debug)]
pub struct WatchConfig {
    pub snapshot: PathBuf,
    pub project_id: Option<String>,
    pub feed: Option<PathBuf>,
    pub sync: SyncConfig,
    pub join_timeout: Duration,
    pub json: bool,
}

pub fn load_watch_config(args: &WatchArgs) -> Result<WatchConfig> {
    let notify_mode = resolve_notify_mode(&args.notify_mode)?;
    let refresh_interval = resolve_refresh_secs(args.refresh_secs)?
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs);
    let project_id = Some(args.project.trim().to_string()).filter(|id| !id.is_empty());
    let feed = match args.feed.trim() {
        "" | "-" => None,
        path => Some(PathBuf::from(path)),
    };
    Ok(WatchConfig {
        snapshot: args.snapshot.clone(),
        project_id,
        feed,
        sync: SyncConfig {
            notify_mode,
            clear_override_on_redeploy: !args.keep_overrides,
            refresh_interval,
        },
        join_timeout: Duration::from_secs(args.join_timeout_secs.max(1)),
        json: args.json,
    })
}

pub fn resolve_debug(flag: bool) -> bool {
    flag || env_true("DPL_DEBUG")
}

pub fn resolve_log_dir(log_dir_flag: &str) -> String {
    if !log_dir_flag.trim().is_empty() {
        return log_dir_flag.to_string();
    }
    non_empty_env("DPL_LOG_DIR").unwrap_or_default()
}

fn resolve_notify_mode(flag: &str) -> Result<NotifyMode> {
    let raw = if flag.trim().is_empty() {
        match non_empty_env("DPL_NOTIFY_MODE") {
            Some(value) => value,
            None => return Ok(NotifyMode::default()),
        }
    } else {
        flag.to_string()
    };
    raw.parse::<NotifyMode>().map_err(|err| anyhow!(err))
}

fn resolve_refresh_secs(flag: Option<u64>) -> Result<Option<u64>> {
    if flag.is_some() {
        return Ok(flag);
    }
    non_empty_env("DPL_REFRESH_SECS")
        .map(|value| {
            value
                .trim()
                .parse::<u64>()
                .with_context(|| format!("invalid DPL_REFRESH_SECS: {value}"))
        })
        .transpose()
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> WatchArgs {
        let cli = Cli::try_parse_from(args).expect("parse");
        match cli.command {
            Command::Watch(args) => args,
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn watch_flags_map_onto_sync_config() {
        let args = parse(&[
            "dpl",
            "watch",
            "--snapshot",
            "project.json",
            "--project",
            " p1 ",
            "--feed",
            "events.ndjson",
            "--notify-mode",
            "transition",
            "--refresh-secs",
            "30",
            "--keep-overrides",
        ]);
        let config = load_watch_config(&args).expect("config");
        assert_eq!(config.project_id.as_deref(), Some("p1"));
        assert_eq!(config.feed, Some(PathBuf::from("events.ndjson")));
        assert_eq!(config.sync.notify_mode, NotifyMode::TransitionTriggered);
        assert_eq!(config.sync.refresh_interval, Some(Duration::from_secs(30)));
        assert!(!config.sync.clear_override_on_redeploy);
    }

    #[test]
    fn dash_feed_means_stdin_and_zero_refresh_disables_loop() {
        let args = parse(&[
            "dpl",
            "watch",
            "--snapshot",
            "project.json",
            "--refresh-secs",
            "0",
            "--notify-mode",
            "event",
        ]);
        let config = load_watch_config(&args).expect("config");
        assert_eq!(config.feed, None);
        assert_eq!(config.project_id, None);
        assert_eq!(config.sync.refresh_interval, None);
        assert!(config.sync.clear_override_on_redeploy);
    }

    #[test]
    fn unknown_notify_mode_is_rejected() {
        let args = parse(&[
            "dpl",
            "watch",
            "--snapshot",
            "project.json",
            "--notify-mode",
            "sometimes",
        ]);
        let err = load_watch_config(&args).expect_err("bad mode");
        assert!(err.to_string().contains("sometimes"));
    }

    #[test]
    fn classify_requires_a_status() {
        assert!(Cli::try_parse_from(["dpl", "classify"]).is_err());
        let cli = Cli::try_parse_from(["dpl", "--debug", "classify", "live"]).expect("parse");
        assert!(cli.debug);
    }
}
