use clap::{Parser, Subcommand};
use std::path::PathBuf;

use save_media_chunks::config::{load_client_config, load_server_config};
use save_media_chunks::context::SyncContext;
use save_media_chunks::ids::RecordingId;
use save_media_chunks::ledger::UploadStatus;
use save_media_chunks::recovery::RecoveryScanner;
use save_media_chunks::serve;

#[derive(Parser, Debug)]
#[command(author, version, about = "Record media chunks locally and sync them to a remote store")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the remote chunk store, registry and room server
    Serve {
        /// Path to server config file (TOML format)
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Reconcile unfinished recordings and redrive their uploads
    Recover {
        /// Path to client config file (TOML format)
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show local recordings and their upload progress
    Status {
        /// Path to client config file (TOML format)
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Delete a recording's local chunks and sync bookkeeping
    Discard {
        /// Path to client config file (TOML format)
        #[arg(short, long)]
        config: PathBuf,

        /// Local recording id
        recording_id: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        match args.command {
            Command::Serve { config } => {
                let config = load_server_config(&config)?;
                serve::serve(&config).await?;
            }
            Command::Recover { config } => recover(config).await?,
            Command::Status { config } => status(config).await?,
            Command::Discard {
                config,
                recording_id,
            } => {
                let config = load_client_config(&config)?;
                let (ctx, _lock) = SyncContext::connect(&config).await?;
                let id = RecordingId::new(recording_id);
                ctx.recordings.get(&id).await?;
                ctx.discard(&id).await?;
                println!("Discarded {}", id);
            }
        }
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}

async fn recover(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_client_config(&config_path)?;
    let (ctx, _lock) = SyncContext::connect(&config).await?;
    let report = RecoveryScanner::new(ctx).run().await?;

    println!("Marked interrupted: {}", report.interrupted.len());
    for id in &report.synced {
        println!("  synced      {}", id);
    }
    for (id, stats) in &report.incomplete {
        println!(
            "  incomplete  {} ({} of {} uploaded, {} failed)",
            id, stats.uploaded, stats.total, stats.failed
        );
    }
    for (id, remote_id) in &report.discard_recommended {
        println!(
            "  gone        {} (remote {} no longer exists, run `discard`)",
            id, remote_id
        );
    }
    for (id, err) in &report.errors {
        println!("  error       {}: {}", id, err);
    }

    if report.incomplete.is_empty() && report.errors.is_empty() {
        Ok(())
    } else {
        Err(format!(
            "{} recording(s) still need a resume",
            report.incomplete.len() + report.errors.len()
        )
        .into())
    }
}

async fn status(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_client_config(&config_path)?;
    let (ctx, _lock) = SyncContext::connect(&config).await?;

    let recordings = ctx.recordings.list().await?;
    if recordings.is_empty() {
        println!("No recordings");
        return Ok(());
    }
    for recording in recordings {
        let remote = match ctx.mappings.get(&recording.id).await? {
            Some(mapping) => mapping.remote_recording_id.to_string(),
            None => "-".to_string(),
        };
        let entries = ctx.ledger.list(&recording.id).await?;
        let count = |status: UploadStatus| entries.iter().filter(|e| e.status == status).count();
        println!(
            "{}  {:<11} chunks={} bytes={} remote={} uploaded={} pending={} failed={}",
            recording.id,
            recording.state.as_str(),
            recording.chunk_count,
            recording.total_size,
            remote,
            count(UploadStatus::Uploaded),
            count(UploadStatus::Pending) + count(UploadStatus::Uploading),
            count(UploadStatus::Failed),
        );
    }
    Ok(())
}
