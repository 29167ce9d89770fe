//! docscan - Crash-Isolated File Crawler and Indexer
//!
//! Entry point for the CLI application.

use anyhow::{Context, Result};
use clap::Parser;
use docscan::config::{CliArgs, Command, ScanConfig};
use docscan::index::shard::read_documents;
use docscan::index::{list_shards, IndexDescriptor};
use docscan::progress::{print_header, print_summary, ProgressReporter};
use docscan::scan::mime::mime_name;
use docscan::{ScanError, Scanner};
use serde_json::json;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    // Parse CLI arguments
    let args = CliArgs::parse();

    // Setup logging
    setup_logging(args.verbose)?;

    if let Some(Command::Dump { index }) = &args.command {
        return dump(index);
    }

    // Validate and create config
    let config = ScanConfig::from_args(args).context("Invalid configuration")?;

    if config.show_progress {
        print_header(&config);
    }

    let scanner = Scanner::new(config.clone());

    // Setup signal handler for graceful shutdown
    let interrupt = scanner.interrupt_flag();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupt received, shutting down...");
        interrupt.store(true, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")?;

    let progress = config.show_progress.then(ProgressReporter::new);
    if let Some(ref p) = progress {
        p.set_status("Starting workers...");
    }

    let outcome = scanner.run_with_progress(|status| {
        if let Some(ref p) = progress {
            p.update(status);
        }
    });

    let result = match outcome {
        Ok(result) => result,
        Err(ScanError::Interrupted) => {
            if let Some(ref p) = progress {
                p.finish("Scan interrupted");
            }
            warn!(output = %config.output.display(), "Scan was interrupted; the index is incomplete");
            return Err(ScanError::Interrupted.into());
        }
        Err(e) => {
            if let Some(ref p) = progress {
                p.finish_and_clear();
            }
            return Err(e).context("Scan failed");
        }
    };

    if let Some(ref p) = progress {
        p.finish("Scan completed");
        print_summary(&result, &config.output);
    }

    if !result.pool.crashes.is_empty() {
        info!(crashes = result.pool.crashes.len(), "Scan completed with worker crashes");
    }
    if result.walk.errors > 0 {
        info!(errors = result.walk.errors, "Scan completed with errors");
    }

    Ok(())
}

/// Print every document of an index as one JSON object per line
fn dump(index: &Path) -> Result<()> {
    let descriptor = IndexDescriptor::read_compatible(index)
        .with_context(|| format!("Failed to open index {}", index.display()))?;
    info!(index = %descriptor.id, name = %descriptor.name, "Dumping index");

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let shards = list_shards(index).context("Failed to list shards")?;
    for shard in shards {
        let docs = read_documents(&shard)
            .with_context(|| format!("Failed to read shard {}", shard.display()))?;
        for doc in docs {
            let mut value = doc.to_json();
            if let Some(name) = mime_name(doc.mime) {
                value["mime_name"] = json!(name);
            }
            serde_json::to_writer(&mut out, &value)?;
            out.write_all(b"\n")?;
        }
    }
    out.flush()?;
    Ok(())
}

fn setup_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("docscan=debug,warn")
    } else {
        EnvFilter::new("docscan=info,warn")
    };

    // Workers are forked from this process and log through the same writer
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    Ok(())
}
