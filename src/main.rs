use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use matchcast::upload::UploadStatus;
use matchcast::{
    create_router, AppState, ChunkedUploadService, Config, FileUploadStore, HttpTransport,
    ServerStorage, UploadEvent, UploadRequest,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};

#[derive(Parser)]
#[command(name = "matchcast")]
#[command(about = "Resumable match video uploads and live segment buffering")]
struct Args {
    /// Configuration file (extension optional)
    #[arg(short, long, default_value = "config/matchcast")]
    config: String,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the upload server
    Serve,

    /// Upload a video file in chunks
    Upload {
        /// File to upload
        path: PathBuf,

        /// Match the file belongs to
        #[arg(short, long)]
        match_id: String,

        /// Continue a previously interrupted upload
        #[arg(short, long)]
        resume: Option<String>,
    },

    /// List resumable uploads for a match
    List {
        #[arg(short, long)]
        match_id: String,
    },

    /// Forget a persisted upload
    Clear { upload_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .init();

    let cfg = Config::load(&args.config)?;
    info!("{} v{}", cfg.service.name, env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::Serve => serve(cfg).await,
        Command::Upload {
            path,
            match_id,
            resume,
        } => upload(cfg, path, match_id, resume).await,
        Command::List { match_id } => {
            let store = FileUploadStore::open(&cfg.upload.state_dir).await?;
            let uploads =
                ChunkedUploadService::get_persisted_uploads_for_match(&store, &match_id).await?;

            if uploads.is_empty() {
                info!("No resumable uploads for match {}", match_id);
            }
            for upload in uploads {
                println!(
                    "{}  {}  {}/{} chunks  {:?}  (updated {})",
                    upload.upload_id,
                    upload.filename,
                    upload.sent_chunks,
                    upload.total_chunks,
                    upload.status,
                    upload.updated_at.to_rfc3339()
                );
            }
            Ok(())
        }
        Command::Clear { upload_id } => {
            let store = FileUploadStore::open(&cfg.upload.state_dir).await?;
            ChunkedUploadService::clear_persisted_upload(&store, &upload_id).await?;
            Ok(())
        }
    }
}

async fn serve(cfg: Config) -> Result<()> {
    let storage = ServerStorage::open(cfg.storage.clone()).await?;
    let app = create_router(AppState::new(storage), cfg.service.http.max_body_bytes);

    let addr = format!("{}:{}", cfg.service.http.bind, cfg.service.http.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Upload server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn upload(
    cfg: Config,
    path: PathBuf,
    match_id: String,
    resume: Option<String>,
) -> Result<()> {
    let data = tokio::fs::read(&path)
        .await
        .with_context(|| format!("Failed to read {:?}", path))?;
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload.bin")
        .to_string();

    let transport = HttpTransport::new(&cfg.upload.endpoint, cfg.upload.request_timeout())?;
    let store = FileUploadStore::open(&cfg.upload.state_dir).await?;
    let (events_tx, mut events_rx) = mpsc::channel(cfg.upload.event_buffer.max(1));

    let service = ChunkedUploadService::new(cfg.upload.clone(), Arc::new(transport), Arc::new(store));
    let upload_id = service
        .start(
            UploadRequest {
                data: Bytes::from(data),
                filename,
                match_id: match_id.clone(),
                resume_upload_id: resume,
            },
            events_tx,
        )
        .await?;
    info!("Upload id: {}", upload_id);

    loop {
        tokio::select! {
            event = events_rx.recv() => match event {
                Some(UploadEvent::Progress(p)) => {
                    info!(
                        "{:>5.1}%  {}/{} chunks",
                        p.fraction * 100.0,
                        p.sent_chunks,
                        p.total_chunks
                    );
                }
                Some(UploadEvent::StatusChanged(status)) => {
                    if status.is_processing_stage() || status == UploadStatus::Assembling {
                        info!("Upload {} is {:?}", upload_id, status);
                    }
                }
                Some(UploadEvent::Completed(assembled)) => {
                    info!("Done: {} ({} bytes)", assembled.file_url, assembled.size_bytes);
                    return Ok(());
                }
                Some(UploadEvent::Failed(e)) => {
                    error!("Upload failed: {}", e);
                    error!("Resume with: {}", resume_command(&path, &match_id, &upload_id));
                    anyhow::bail!(e);
                }
                None => anyhow::bail!("Upload worker stopped unexpectedly"),
            },
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, pausing upload {}", upload_id);
                service.pause().await?;
                info!("Resume with: {}", resume_command(&path, &match_id, &upload_id));
                return Ok(());
            }
        }
    }
}

/// Command line that picks an interrupted upload back up
fn resume_command(path: &Path, match_id: &str, upload_id: &str) -> String {
    format!(
        "matchcast upload {:?} --match-id {} --resume {}",
        path, match_id, upload_id
    )
}
