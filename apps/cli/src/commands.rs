//! CLI command implementations

use crate::output;
use crate::progress::TransferProgress;
use crate::OutputFormat;
use anyhow::{anyhow, Result};
use console::style;
use modelfetch_core::{DownloadEngine, EngineConfig, FetchError};
use modelfetch_types::DownloadEvent;
use std::path::PathBuf;
use std::sync::Arc;

// ============================================================================
// Download Commands
// ============================================================================

pub async fn get(
    data_dir: PathBuf,
    url: &str,
    output: Option<PathBuf>,
    fresh: bool,
    format: OutputFormat,
) -> Result<()> {
    let destination = match output {
        Some(path) => path,
        None => {
            let name = url
                .rsplit('/')
                .next()
                .filter(|s| !s.is_empty())
                .unwrap_or("download.bin");
            std::env::current_dir()?.join(name)
        }
    };

    let engine = DownloadEngine::new(EngineConfig::with_data_dir(&data_dir)).await?;

    if fresh {
        engine.cancel().await;
    }

    if let Some(record) = engine.cache_info().await {
        if matches!(format, OutputFormat::Human) {
            println!(
                "{} Resuming from {}",
                style("↻").cyan(),
                output::format_bytes(record.bytes_written.max(0) as u64)
            );
        }
    }

    let mut events = match engine.start(url, &destination).await {
        Ok(events) => events,
        Err(FetchError::NoResumeData) => {
            return Err(anyhow!(
                "resume state was unusable and has been cleared; run again to start fresh"
            ));
        }
        Err(e) => return Err(e.into()),
    };

    let bar = TransferProgress::new(&destination);

    // Ctrl-C pauses the transfer instead of dropping it
    let engine = Arc::new(engine);
    let pauser = engine.clone();
    let ctrlc = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            pauser.pause().await;
        }
    });

    let mut finished: Option<PathBuf> = None;
    let mut failure: Option<FetchError> = None;

    while let Some(item) = events.recv().await {
        match item {
            Ok(DownloadEvent::Progress {
                bytes_written,
                bytes_expected,
            }) => bar.update(bytes_written, bytes_expected),
            Ok(DownloadEvent::Finished { path }) => finished = Some(path),
            Err(e) => failure = Some(e),
        }
    }
    ctrlc.abort();

    if let Some(e) = failure {
        bar.fail();
        return Err(e.into());
    }

    match finished {
        Some(path) => {
            bar.finish();
            match format {
                OutputFormat::Json => {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&serde_json::json!({
                            "status": "finished",
                            "path": path,
                        }))?
                    );
                }
                OutputFormat::Human => {
                    println!(
                        "{} Saved to {}",
                        style("✓").green().bold(),
                        style(path.display()).cyan()
                    );
                }
            }
        }
        None => {
            // Normal close without a finished event: paused or cancelled
            if let Some(record) = engine.cache_info().await {
                bar.pause();
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&record)?);
                    }
                    OutputFormat::Human => {
                        println!(
                            "{} Paused at {}; run the same command to resume",
                            style("⏸").yellow(),
                            output::format_bytes(record.bytes_written.max(0) as u64)
                        );
                    }
                }
            } else {
                bar.cancel();
                if matches!(format, OutputFormat::Human) {
                    println!("{} Transfer stopped, nothing to resume", style("○").dim());
                }
            }
        }
    }

    Ok(())
}

// ============================================================================
// Cache Commands
// ============================================================================

pub async fn status(data_dir: PathBuf, format: OutputFormat) -> Result<()> {
    let engine = DownloadEngine::new(EngineConfig::with_data_dir(&data_dir)).await?;

    match engine.cache_info().await {
        Some(record) => match format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&record)?);
            }
            OutputFormat::Human => {
                println!("{} Paused download", style("⏸").yellow().bold());
                println!("  URL:  {}", style(&record.download_link).cyan());
                println!(
                    "  Done: {}{}",
                    output::format_bytes(record.bytes_written.max(0) as u64),
                    match record.progress() {
                        Some(pct) => format!(
                            " of {} ({:.1}%)",
                            output::format_bytes(record.bytes_expected as u64),
                            pct
                        ),
                        None => " (total unknown)".to_string(),
                    }
                );
            }
        },
        None => match format {
            OutputFormat::Json => println!("null"),
            OutputFormat::Human => println!("{}", style("No paused download").dim()),
        },
    }

    Ok(())
}

pub async fn clear(data_dir: PathBuf, format: OutputFormat) -> Result<()> {
    let engine = DownloadEngine::new(EngineConfig::with_data_dir(&data_dir)).await?;

    let had_record = engine.cache_info().await.is_some();
    engine.cancel().await;

    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({ "cleared": had_record }))?
            );
        }
        OutputFormat::Human => {
            if had_record {
                println!("{} Resume state cleared", style("✓").green().bold());
            } else {
                println!("{}", style("Nothing to clear").dim());
            }
        }
    }

    Ok(())
}
