use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use client_core::{
    ClientConfig, ClientEvent, SessionOutcome, SubmitOutcome, TranslationClient, UploadFile,
};
use shared::protocol::UploadSettings;
use tokio::sync::broadcast;

mod config;

#[derive(Parser, Debug)]
#[command(name = "imgtrans", about = "Upload images for translation and follow progress")]
struct Args {
    /// Image files to translate
    #[arg(required = true)]
    files: Vec<PathBuf>,
    /// Overrides the configured server URL
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long, default_value = "en")]
    ocr_languages: String,
    #[arg(long, default_value = "Japanese")]
    target_language: String,
    /// Ask the server to run OCR on CPU
    #[arg(long)]
    no_gpu: bool,
    /// Directory translated files are saved to
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

fn guess_mime(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "bmp" => "image/bmp",
        "tiff" | "tif" => "image/tiff",
        _ => return None,
    };
    Some(mime.to_string())
}

async fn read_upload_files(paths: &[PathBuf]) -> Result<Vec<UploadFile>> {
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("invalid file name: {}", path.display()))?;
        files.push(UploadFile {
            mime_type: guess_mime(path),
            filename,
            bytes,
        });
    }
    Ok(files)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let mut settings = config::load_settings();
    if let Some(url) = args.server_url {
        settings.server_url = url;
    }
    if let Some(dir) = args.output_dir {
        settings.output_dir = dir;
    }

    let client = TranslationClient::new(
        ClientConfig::new(settings.server_url.clone()).with_uploads_path(settings.uploads_path.clone()),
    );
    let mut events = client.subscribe_events();
    client.connect().await?;

    let files = read_upload_files(&args.files).await?;
    let upload_settings = UploadSettings {
        ocr_languages: args.ocr_languages,
        target_language: args.target_language,
        use_gpu: !args.no_gpu,
    };

    let session_id = match client.submit(files, upload_settings).await? {
        SubmitOutcome::Started {
            session_id,
            file_count,
        } => {
            println!("session {session_id}: {file_count} file(s) accepted");
            session_id
        }
        SubmitOutcome::Rejected(reason) => bail!("submission rejected: {reason:?}"),
    };

    // No client-side deadline: the session runs until the server reports
    // completion or an error.
    loop {
        match events.recv().await {
            Ok(ClientEvent::ProgressUpdated(snapshot)) => {
                let status = snapshot.status.unwrap_or_default();
                match (snapshot.current_file, snapshot.total_files) {
                    (Some(current), Some(total)) => {
                        println!("[{:>3}%] ({current}/{total}) {status}", snapshot.percent)
                    }
                    _ => println!("[{:>3}%] {status}", snapshot.percent),
                }
            }
            Ok(ClientEvent::ResultsReady(entries)) => {
                if entries.is_empty() {
                    println!("no translated files were produced");
                    continue;
                }
                tokio::fs::create_dir_all(&settings.output_dir)
                    .await
                    .with_context(|| {
                        format!("failed to create {}", settings.output_dir.display())
                    })?;
                for entry in entries {
                    let bytes = client.download_result(&entry.download_url).await?;
                    let filename = entry
                        .download_url
                        .rsplit('/')
                        .next()
                        .filter(|name| !name.is_empty())
                        .unwrap_or(entry.original_name.as_str());
                    let target = settings.output_dir.join(filename);
                    tokio::fs::write(&target, bytes)
                        .await
                        .with_context(|| format!("failed to write {}", target.display()))?;
                    println!("saved {} -> {}", entry.original_name, target.display());
                }
            }
            Ok(ClientEvent::SessionEnded(outcome)) => match outcome {
                SessionOutcome::Completed { result_count } => {
                    println!("session {session_id} complete: {result_count} file(s)");
                    return Ok(());
                }
                SessionOutcome::Cancelled => {
                    println!("session {session_id} cancelled");
                    return Ok(());
                }
                SessionOutcome::Failed(message) => bail!("processing failed: {message}"),
            },
            Ok(ClientEvent::ChannelDisconnected) => {
                bail!("push channel closed before the session finished")
            }
            Ok(ClientEvent::ChannelConnected)
            | Ok(ClientEvent::SessionStarted { .. })
            | Ok(ClientEvent::LogAppended(_)) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => bail!("event stream closed"),
        }
    }
}
