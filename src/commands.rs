use anyhow::{bail, Context, Result};
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use reqwest::header::HeaderMap;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use fdl::config::{clamp_connections, SETTING_DEFAULT_CONNECTIONS, SETTING_MAX_CONCURRENT};
use fdl::naming::filename_from;
use fdl::probe::probe;
use fdl::state;
use fdl::{
    AddRequest, DownloadSession, DownloadStatus, DownloadTask, EngineConfig, JsonStore, QueueScheduler,
    SessionEvent, SessionOutcome, SessionRequest, TaskStore,
};

use crate::cli::{Cli, Command, TransferArgs};

const BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes:>12}/{total_bytes:<12} {bytes_per_sec:>12} {eta:>4} {msg}";

pub async fn run(cli: Cli) -> Result<()> {
    let config = EngineConfig {
        download_dir: cli.download_dir.clone(),
        proxy: cli.proxy.clone(),
        ..EngineConfig::default()
    };

    match cli.command {
        Command::Get {
            url,
            output,
            transfer,
        } => run_single_download(config, url, output, transfer).await,
        Command::Add {
            url,
            filename,
            priority,
            referer,
            headers,
            transfer,
        } => {
            let mut request = AddRequest::new(url);
            request.filename = filename;
            request.priority = priority;
            request.referer = referer.unwrap_or_default();
            request.extra_headers = parse_headers(&headers)?;
            request.connections = transfer.connections;
            request.speed_limit = transfer.rate_limit.unwrap_or(0);
            request.auto_start = false;
            add_task(config, &cli.store, request).await
        }
        Command::List => list_tasks(&cli.store),
        Command::Run { concurrency } => run_queue(config, &cli.store, concurrency).await,
        Command::Remove { id, delete_file } => remove_task(config, &cli.store, &id, delete_file).await,
        Command::Set { key, value } => set_setting(&cli.store, &key, &value),
    }
}

fn progress_bar(target: &MultiProgress) -> Result<ProgressBar> {
    let pb = target.add(ProgressBar::new(0));
    pb.set_style(
        ProgressStyle::default_bar()
            .template(BAR_TEMPLATE)?
            .progress_chars("=>-"),
    );
    Ok(pb)
}

pub async fn run_single_download(
    config: EngineConfig,
    url: String,
    output: Option<PathBuf>,
    transfer: TransferArgs,
) -> Result<()> {
    let client = config.build_client().context("Failed to build HTTP client")?;

    let filepath = match output {
        Some(path) => path,
        None => {
            let info = probe(&client, &url, &HeaderMap::new(), config.probe_timeout).await;
            let filename = filename_from(&info.final_url, info.content_disposition.as_deref());
            config.download_dir.join(filename)
        }
    };
    let state_path = state::state_path(&filepath);
    if filepath.exists() && !state_path.exists() {
        println!("Skipped {} (already exists)", filepath.display());
        return Ok(());
    }

    let connections = clamp_connections(transfer.connections.unwrap_or(config.default_connections));
    let request = SessionRequest::new("cli", url.clone(), filepath.clone())
        .connections(connections)
        .speed_limit(transfer.rate_limit.unwrap_or(0));
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let session = DownloadSession::builder(client, config, request)
        .events(events_tx)
        .build();

    let multi_progress = MultiProgress::new();
    multi_progress.set_draw_target(ProgressDrawTarget::stderr_with_hz(5));
    let pb = progress_bar(&multi_progress)?;
    let name = display_name(&filepath);
    pb.set_message(format!("Downloading {}", name));

    let bar = pb.clone();
    let bar_name = name.clone();
    let renderer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                SessionEvent::Progress(progress) => {
                    if progress.total > 0 {
                        bar.set_length(progress.total);
                    }
                    bar.set_position(progress.downloaded);
                }
                SessionEvent::Status { status, .. } => {
                    bar.set_message(format!("{:<11} {}", status, bar_name));
                }
            }
        }
    });

    let runner = session.clone();
    let mut run = tokio::spawn(async move { runner.run().await });
    let outcome = tokio::select! {
        outcome = &mut run => outcome.context("Download task panicked")?,
        _ = tokio::signal::ctrl_c() => {
            session.stop_and_save();
            run.await.context("Download task panicked")?
        }
    };
    drop(session);
    renderer.abort();

    match outcome {
        SessionOutcome::Completed => {
            pb.finish_with_message(format!("Completed   {}", name));
            Ok(())
        }
        SessionOutcome::Stopped => {
            pb.abandon_with_message(format!("Stopped     {} (run again to resume)", name));
            Ok(())
        }
        SessionOutcome::Failed(message) => {
            pb.abandon_with_message(format!("Failed      {}", name));
            bail!("Failed to download {}: {}", url, message)
        }
    }
}

fn open_store(path: &Path) -> Result<Arc<JsonStore>> {
    let store = JsonStore::open(path).with_context(|| format!("Failed to open task store {:?}", path))?;
    Ok(Arc::new(store))
}

async fn add_task(config: EngineConfig, store_path: &Path, request: AddRequest) -> Result<()> {
    let scheduler = QueueScheduler::new(open_store(store_path)?, config, None)?;
    scheduler.load_from_store()?;
    let id = scheduler.add(request).await?;
    if let Some(task) = scheduler.task(&id) {
        println!(
            "Queued {} {} ({})",
            id,
            task.filepath.display(),
            size_label(task.total_size)
        );
    }
    Ok(())
}

fn list_tasks(store_path: &Path) -> Result<()> {
    let store = open_store(store_path)?;
    let rows = store.rows()?;
    if rows.is_empty() {
        println!("No tasks in {:?}.", store_path);
        return Ok(());
    }

    let completed = rows
        .iter()
        .filter(|t| t.status == DownloadStatus::Completed)
        .count();
    let downloaded: u64 = rows.iter().map(|t| t.downloaded).sum();
    let known: u64 = rows.iter().map(|t| t.total_size).sum();
    println!(
        "Summary: Files: {}/{} | Downloaded: {} / {}",
        completed,
        rows.len(),
        HumanBytes(downloaded),
        HumanBytes(known)
    );
    println!();

    println!(
        "{:<17} {:<40} {:<12} {:<10} {:<12}",
        "ID", "Filename", "Status", "Progress", "Size"
    );
    println!("{:-<17} {:-<40} {:-<12} {:-<10} {:-<12}", "", "", "", "", "");
    for task in &rows {
        println!(
            "{:<17} {:<40} {:<12} {:<10} {:<12}",
            task.id,
            truncate(&task.filename, 40),
            task.status,
            format!("{:.2}%", task.percent()),
            size_label(task.total_size)
        );
        if task.status == DownloadStatus::Error && !task.error_message.is_empty() {
            println!("{:<17} {}", "", task.error_message);
        }
    }
    Ok(())
}

async fn run_queue(config: EngineConfig, store_path: &Path, concurrency: Option<usize>) -> Result<()> {
    let store = open_store(store_path)?;
    if let Some(n) = concurrency {
        store.set_setting(SETTING_MAX_CONCURRENT, &n.max(1).to_string())?;
    }

    let (updates_tx, mut updates_rx) = mpsc::unbounded_channel::<DownloadTask>();
    let scheduler = QueueScheduler::new(store, config, Some(updates_tx))?;
    scheduler.load_from_store()?;

    let multi_progress = MultiProgress::new();
    multi_progress.set_draw_target(ProgressDrawTarget::stderr_with_hz(5));
    let header_pb = multi_progress.add(ProgressBar::new(0));
    header_pb.set_style(ProgressStyle::default_bar().template("{msg}")?);

    let bars_target = multi_progress.clone();
    let header = header_pb.clone();
    let renderer = tokio::spawn(async move {
        let mut bars: HashMap<String, ProgressBar> = HashMap::new();
        let mut statuses: HashMap<String, DownloadStatus> = HashMap::new();
        while let Some(task) = updates_rx.recv().await {
            statuses.insert(task.id.clone(), task.status);
            let bar = match bars.get(&task.id) {
                Some(bar) => bar.clone(),
                None => match progress_bar(&bars_target) {
                    Ok(bar) => {
                        bars.insert(task.id.clone(), bar.clone());
                        bar
                    }
                    Err(_) => continue,
                },
            };
            if task.total_size > 0 {
                bar.set_length(task.total_size);
            }
            bar.set_position(task.downloaded);
            let message = format!("{:<11} {}", task.status, task.filename);
            match task.status {
                DownloadStatus::Completed => bar.finish_with_message(message),
                DownloadStatus::Error | DownloadStatus::Stopped => bar.abandon_with_message(message),
                _ => bar.set_message(message),
            }
            let done = statuses
                .values()
                .filter(|s| **s == DownloadStatus::Completed)
                .count();
            header.set_message(format!("Summary: Files: {}/{}", done, statuses.len()));
        }
    });

    scheduler.start_all();
    let background = scheduler.spawn_loop();

    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                header_pb.println("Stopping, progress is saved for the next run");
                break;
            }
            _ = ticker.tick() => {
                if scheduler.is_idle() {
                    break;
                }
            }
        }
    }

    scheduler.shutdown().await;
    background.await.context("Scheduler loop panicked")?;
    renderer.abort();
    header_pb.finish();

    let tasks = scheduler.tasks();
    let count = |status: DownloadStatus| tasks.iter().filter(|t| t.status == status).count();
    println!(
        "Completed: {} | Failed: {} | Stopped: {} | Queued: {}",
        count(DownloadStatus::Completed),
        count(DownloadStatus::Error),
        count(DownloadStatus::Stopped),
        count(DownloadStatus::Queued)
    );
    Ok(())
}

async fn remove_task(config: EngineConfig, store_path: &Path, id: &str, delete_file: bool) -> Result<()> {
    let scheduler = QueueScheduler::new(open_store(store_path)?, config, None)?;
    scheduler.load_from_store()?;
    scheduler
        .remove(id, delete_file)
        .await
        .with_context(|| format!("Failed to remove task {}", id))?;
    println!("Removed {}", id);
    Ok(())
}

fn set_setting(store_path: &Path, key: &str, value: &str) -> Result<()> {
    if key != SETTING_MAX_CONCURRENT && key != SETTING_DEFAULT_CONNECTIONS {
        bail!(
            "Unknown setting '{}' (expected {} or {})",
            key,
            SETTING_MAX_CONCURRENT,
            SETTING_DEFAULT_CONNECTIONS
        );
    }
    let number: usize = value
        .trim()
        .parse()
        .with_context(|| format!("'{}' is not a number", value))?;
    if number == 0 {
        bail!("{} must be at least 1", key);
    }
    open_store(store_path)?.set_setting(key, &number.to_string())?;
    println!("{} = {}", key, number);
    Ok(())
}

fn parse_headers(raw: &[String]) -> Result<BTreeMap<String, String>> {
    raw.iter()
        .map(|line| {
            let (name, value) = line
                .split_once(':')
                .with_context(|| format!("Header '{}' is not in 'Name: value' form", line))?;
            Ok((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn size_label(size: u64) -> String {
    if size == 0 {
        "unknown".to_string()
    } else {
        HumanBytes(size).to_string()
    }
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        text.to_string()
    } else {
        let kept: String = text.chars().take(width.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
