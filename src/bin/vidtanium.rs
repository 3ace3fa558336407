//! CLI front-end (spec §6). The core honors the same operations whether or
//! not a GUI attaches; this binary is a thin console driver: resolve a URL
//! (if given), submit it, print progress events, and map the final task
//! status to a process exit code. With no URL it runs as a background
//! service driving the persisted [`vidtanium_core::scheduler::Scheduler`]
//! until interrupted.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use vidtanium_core::analyzer::Analyzer;
use vidtanium_core::config::Configuration;
use vidtanium_core::events::TaskEventKind;
use vidtanium_core::manager::TaskManager;
use vidtanium_core::model::PriorityClass;
use vidtanium_core::playlist::Playlist;
use vidtanium_core::scheduler::{Scheduler, SystemClock};

#[derive(Parser, Debug)]
#[command(name = "vidtanium", about = "Resumable concurrent HLS downloader")]
struct Cli {
    /// The media or web URL to download.
    url: Option<String>,

    /// Output directory for the merged file (default: ~/Downloads).
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Route to the CLI front-end; the core behaves identically either way.
    #[arg(long)]
    no_gui: bool,

    /// Location of settings and persisted scheduler state.
    #[arg(long, value_name = "DIR")]
    config_dir: Option<PathBuf>,
}

const EXIT_OK: i32 = 0;
const EXIT_FAILURE: i32 = 1;
const EXIT_INTERRUPTED: i32 = 130;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let _ = cli.no_gui; // core behavior does not branch on this; CLI-only hint.
    vidtanium_core::logging::init();

    let config_dir = cli
        .config_dir
        .clone()
        .unwrap_or_else(|| Configuration::default().config_dir);
    let mut config = Configuration::default().load_overrides(&config_dir);
    config.config_dir = config_dir;
    if let Some(dir) = cli.output_dir {
        config.output_dir = dir;
    }

    let exit_code = match cli.url {
        Some(url) => run_single_download(config, url).await,
        None => run_service(config).await,
    };

    std::process::exit(exit_code);
}

async fn run_single_download(config: Configuration, url: String) -> i32 {
    let http = vidtanium_core::http::HttpContext::new(&config);
    let analyzer = Analyzer::new(&http, config.variant_selection);
    let media = match analyzer.analyze(&url).await {
        Ok(Playlist::Media(media)) => media,
        Ok(Playlist::Master(_)) => {
            tracing::error!("analyzer returned an unresolved master playlist");
            return EXIT_FAILURE;
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to analyze URL");
            return EXIT_FAILURE;
        }
    };

    let output_path = config.output_dir.join(output_file_name(&url));
    let plan = media.into_plan(url, output_path);

    let manager = TaskManager::new(config);
    let subscription = manager.on();
    let task_id = manager.submit(plan, PriorityClass::Normal).await;

    let printer_task_id = task_id.clone();
    let printer = tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            if event.source_id == printer_task_id {
                print_event(&event);
            }
        }
    });

    tokio::select! {
        status = await_terminal(&manager, &task_id) => {
            printer.abort();
            match status {
                vidtanium_core::TaskStatus::Completed => EXIT_OK,
                _ => EXIT_FAILURE,
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let _ = manager.cancel(&task_id).await;
            let _ = await_terminal(&manager, &task_id).await;
            printer.abort();
            EXIT_INTERRUPTED
        }
        signum = await_fatal_signal() => {
            let _ = manager.cancel(&task_id).await;
            printer.abort();
            128 + signum
        }
    }
}

async fn run_service(config: Configuration) -> i32 {
    let manager = TaskManager::new(config.clone());
    let scheduler = Scheduler::new(&config, manager, Arc::new(SystemClock)).await;
    let cancel = tokio_util::sync::CancellationToken::new();
    let runner = tokio::spawn(scheduler.run(cancel.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            let _ = runner.await;
            EXIT_INTERRUPTED
        }
        signum = await_fatal_signal() => {
            cancel.cancel();
            let _ = runner.await;
            128 + signum
        }
    }
}

async fn await_terminal(manager: &TaskManager, task_id: &str) -> vidtanium_core::TaskStatus {
    loop {
        if let Ok(snapshot) = manager.snapshot_of(task_id).await {
            if snapshot.status.is_terminal() {
                return snapshot.status;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}

#[cfg(unix)]
async fn await_fatal_signal() -> i32 {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    term.recv().await;
    15 // SIGTERM
}

#[cfg(not(unix))]
async fn await_fatal_signal() -> i32 {
    std::future::pending().await
}

fn output_file_name(url: &str) -> String {
    url.rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(|s| s.split('?').next().unwrap_or(s).to_string())
        .filter(|s| s.ends_with(".ts") || s.ends_with(".mp4"))
        .unwrap_or_else(|| format!("{}.ts", uuid::Uuid::new_v4()))
}

fn print_event(event: &vidtanium_core::events::TaskEvent) {
    match &event.kind {
        TaskEventKind::Created => println!("task created"),
        TaskEventKind::StatusChanged { from, to } => println!("status: {from:?} -> {to:?}"),
        TaskEventKind::Progress(p) => {
            println!(
                "progress: {}/{} segments ({:.1}%)",
                p.completed_segments,
                p.total_segments,
                p.percent()
            )
        }
        TaskEventKind::Completed => println!("completed"),
        TaskEventKind::Failed { index, kind, reason } => {
            println!("failed at segment {index} ({kind}): {reason}")
        }
    }
}
