//! replaycast agent
//!
//! Plays a queue of replay files through an external playback engine and
//! drives OBS recording in lock-step with the playback lifecycle.

mod config;
mod logging;
mod obs;
mod orchestrator;
mod playback;
mod queue;

use anyhow::{bail, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::obs::{ObsController, RecordingController};
use crate::orchestrator::{OrchestrationMode, Orchestrator};
use crate::playback::{PlaybackEngine, ProcessEngine};
use crate::queue::{PendingQueue, QueueOptions};

#[derive(Debug, Default)]
struct CliArgs {
    files: Vec<PathBuf>,
    record: bool,
    stop_between: bool,
    looping: bool,
    shuffle: bool,
    export: Option<PathBuf>,
    help: bool,
}

fn parse_args(args: &[String]) -> Result<CliArgs> {
    let mut parsed = CliArgs::default();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-h" | "--help" => parsed.help = true,
            "-r" | "--record" => parsed.record = true,
            "--stop-between" => parsed.stop_between = true,
            "--looping" => parsed.looping = true,
            "--shuffle" => parsed.shuffle = true,
            "--export" => match iter.next() {
                Some(path) => parsed.export = Some(PathBuf::from(path)),
                None => bail!("--export requires a destination path"),
            },
            other if other.starts_with('-') => bail!("unknown option: {other}"),
            other => parsed.files.push(PathBuf::from(other)),
        }
    }

    Ok(parsed)
}

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = logging::init_logging()?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(e) => {
            error!("{e:#}");
            print_help();
            std::process::exit(2);
        }
    };

    if cli.help {
        print_help();
        return Ok(());
    }

    let config = Config::load()?;
    info!("Configuration loaded from {:?}", config.config_path()?);

    let options = QueueOptions {
        looping: cli.looping,
        shuffle: cli.shuffle,
    };
    let mut pending = PendingQueue::new(options);
    pending.extend(cli.files);

    if let Some(dest) = cli.export {
        pending.export(&dest)?;
        return Ok(());
    }

    let mode = OrchestrationMode {
        recording_enabled: cli.record || config.recording.enabled,
        pause_between_entries: if cli.stop_between {
            false
        } else {
            config.recording.pause_between_entries
        },
    };

    let Some(materialized) = pending.materialize()? else {
        warn!("No playable replay files given, nothing to do");
        return Ok(());
    };

    let recorder: Arc<dyn RecordingController> = if mode.recording_enabled {
        match ObsController::connect(&config.obs).await {
            Ok(controller) => {
                info!(
                    "Connected to OBS WebSocket at {}:{}",
                    config.obs.host, config.obs.port
                );
                Arc::new(controller)
            }
            Err(e) => {
                error!("Failed to connect to OBS: {e:#}");
                error!("Make sure OBS is running and its WebSocket server is enabled.");
                std::process::exit(1);
            }
        }
    } else {
        Arc::new(ObsController::offline())
    };

    let engine: Arc<dyn PlaybackEngine> = Arc::new(ProcessEngine::new(config.playback.clone()));

    let mut orchestrator = Orchestrator::new(recorder, Arc::clone(&engine));

    // Display-only subscriber for the currently loaded file.
    let mut basename = orchestrator.current_basename();
    tokio::spawn(async move {
        while basename.changed().await.is_ok() {
            let current = basename.borrow().clone();
            if let Some(name) = current {
                info!("Now playing: {name}");
            }
        }
    });

    orchestrator.load_queue(&materialized, mode).await?;

    let mut run = tokio::spawn(orchestrator.run());
    tokio::select! {
        result = &mut run => result??,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
            engine.kill().await;
            run.await??;
        }
    }

    info!("replaycast finished");
    Ok(())
}

fn print_help() {
    println!("replaycast - replay playback with lock-step OBS recording");
    println!();
    println!("USAGE:");
    println!("    replaycast [OPTIONS] <replay-file>...");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help           Print this help message");
    println!("    -r, --record         Record playback through OBS");
    println!("    --stop-between       Stop recording between entries instead of pausing");
    println!("    --looping            Restart the queue when the last entry finishes");
    println!("    --shuffle            Play queue entries in random order");
    println!("    --export <path>      Write the queue file to <path> and exit");
    println!();
    println!("ENVIRONMENT:");
    println!("    RUST_LOG             Set log level (e.g., debug, info, warn)");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags_and_files() {
        let args: Vec<String> = ["-r", "--stop-between", "a.slp", "b.slp"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let cli = parse_args(&args).unwrap();
        assert!(cli.record);
        assert!(cli.stop_between);
        assert_eq!(cli.files, vec![PathBuf::from("a.slp"), PathBuf::from("b.slp")]);
    }

    #[test]
    fn export_requires_a_destination() {
        let args = vec!["--export".to_string()];
        assert!(parse_args(&args).is_err());
    }

    #[test]
    fn unknown_options_are_rejected() {
        let args = vec!["--frobnicate".to_string()];
        assert!(parse_args(&args).is_err());
    }
}
