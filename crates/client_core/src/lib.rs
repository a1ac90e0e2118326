use std::{collections::VecDeque, sync::Arc};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::{multipart, Client};
use shared::{
    domain::{LogSeverity, SessionId},
    error::{ApiException, ErrorBody},
    protocol::{
        DownloadLink, OutputListing, ProgressUpdate, ServerEvent, UploadResponse, UploadSettings,
    },
};
use tokio::sync::{broadcast, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{error, info, warn};

/// Activity log cap; oldest entries are evicted first.
pub const LOG_CAPACITY: usize = 100;

const DEFAULT_UPLOADS_PATH: &str = "/uploads";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    /// Route prefix the server serves uploaded originals from. Used to
    /// build an original-image URL when a result descriptor does not carry
    /// one explicitly.
    pub uploads_path: String,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        let server_url = server_url.into().trim_end_matches('/').to_string();
        Self {
            server_url,
            uploads_path: DEFAULT_UPLOADS_PATH.to_string(),
        }
    }

    pub fn with_uploads_path(mut self, uploads_path: impl Into<String>) -> Self {
        self.uploads_path = uploads_path.into().trim_end_matches('/').to_string();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Uploading,
    Processing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub message: String,
    pub severity: LogSeverity,
}

/// Last-seen progress for the active session. Fields absent from an
/// incoming update keep their previous value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub percent: u8,
    pub status: Option<String>,
    pub current_file: Option<u32>,
    pub total_files: Option<u32>,
}

/// One before/after comparison row, ready for rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultEntry {
    pub original_name: String,
    pub download_url: String,
    pub original_url: Option<String>,
}

impl ResultEntry {
    fn from_link(link: &DownloadLink, uploads_path: &str) -> Self {
        let original_url = link.original_url.clone().or_else(|| {
            derive_original_url(&link.download_url, &link.original_name, uploads_path)
        });
        Self {
            original_name: link.original_name.clone(),
            download_url: link.download_url.clone(),
            original_url,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed { result_count: usize },
    Cancelled,
    Failed(String),
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    ChannelConnected,
    ChannelDisconnected,
    SessionStarted {
        session_id: SessionId,
        file_count: u32,
    },
    ProgressUpdated(ProgressSnapshot),
    ResultsReady(Vec<ResultEntry>),
    SessionEnded(SessionOutcome),
    LogAppended(LogEntry),
}

/// One file selected for upload, held in memory until submission.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NoFilesSelected,
    AlreadyProcessing,
    /// The user cancelled while the upload request was in flight; the
    /// server's response was discarded.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Started {
        session_id: SessionId,
        file_count: u32,
    },
    Rejected(RejectReason),
}

struct ControllerState {
    phase: SessionPhase,
    session: Option<SessionId>,
    channel_connected: bool,
    progress: ProgressSnapshot,
    log: VecDeque<LogEntry>,
}

/// True when a pushed event applies to the client's active session.
/// Events naming a different session belong to someone else's work and
/// are dropped; events without a session id follow the active one.
fn targets_active_session(state: &ControllerState, event_session: Option<&SessionId>) -> bool {
    if state.phase != SessionPhase::Processing {
        return false;
    }
    match (event_session, state.session.as_ref()) {
        (Some(from_event), Some(active)) => from_event == active,
        (None, Some(_)) => true,
        (_, None) => false,
    }
}

/// Derives the uploaded original's URL from a translated-file download URL
/// of the `/{route}/{session_id}/{filename}` shape the server uses for
/// both `/output/...` and `/uploads/...`.
fn derive_original_url(download_url: &str, original_name: &str, uploads_path: &str) -> Option<String> {
    let path = match url::Url::parse(download_url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => download_url.to_string(),
    };
    let mut segments = path.split('/').filter(|segment| !segment.is_empty());
    let _route = segments.next()?;
    let session_id = segments.next()?;
    segments.next()?;
    Some(format!("{uploads_path}/{session_id}/{original_name}"))
}

fn push_channel_url(server_url: &str) -> Result<String> {
    let ws_url = if server_url.starts_with("https://") {
        server_url.replacen("https://", "wss://", 1)
    } else if server_url.starts_with("http://") {
        server_url.replacen("http://", "ws://", 1)
    } else {
        return Err(anyhow!("server_url must start with http:// or https://"));
    };
    Ok(format!("{ws_url}/ws"))
}

/// Session controller for the image-translation service: owns upload
/// submission, tracks the single outstanding session, consumes pushed
/// progress/completion/error events and keeps the bounded activity log.
/// Front ends observe it through [`subscribe_events`](Self::subscribe_events).
pub struct TranslationClient {
    http: Client,
    config: ClientConfig,
    inner: Mutex<ControllerState>,
    events: broadcast::Sender<ClientEvent>,
}

impl TranslationClient {
    pub fn new(config: ClientConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            http: Client::new(),
            config,
            inner: Mutex::new(ControllerState {
                phase: SessionPhase::Idle,
                session: None,
                channel_connected: false,
                progress: ProgressSnapshot::default(),
                log: VecDeque::with_capacity(LOG_CAPACITY),
            }),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn phase(&self) -> SessionPhase {
        self.inner.lock().await.phase
    }

    pub async fn active_session(&self) -> Option<SessionId> {
        self.inner.lock().await.session.clone()
    }

    pub async fn progress(&self) -> ProgressSnapshot {
        self.inner.lock().await.progress.clone()
    }

    pub async fn log_entries(&self) -> Vec<LogEntry> {
        self.inner.lock().await.log.iter().cloned().collect()
    }

    pub async fn is_channel_connected(&self) -> bool {
        self.inner.lock().await.channel_connected
    }

    /// Opens the push channel and spawns the reader task. Pushed events for
    /// the active session drive the controller until the stream ends.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        {
            let guard = self.inner.lock().await;
            // One reader task per client; a second connect would dispatch
            // every pushed event twice.
            if guard.channel_connected {
                return Ok(());
            }
        }

        let ws_url = push_channel_url(&self.config.server_url)?;
        let (ws_stream, _) = match connect_async(&ws_url).await {
            Ok(connected) => connected,
            Err(err) => {
                self.append_log(
                    format!("サーバーへの接続に失敗しました: {err}"),
                    LogSeverity::Error,
                )
                .await;
                return Err(err)
                    .with_context(|| format!("failed to connect push channel: {ws_url}"));
            }
        };
        let (_, mut ws_reader) = ws_stream.split();

        {
            let mut guard = self.inner.lock().await;
            guard.channel_connected = true;
        }
        self.append_log("サーバーに接続しました", LogSeverity::Info)
            .await;
        let _ = self.events.send(ClientEvent::ChannelConnected);

        let client = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => client.handle_server_event(event).await,
                        Err(err) => {
                            client
                                .append_log(
                                    format!("不正なサーバーイベントを受信しました: {err}"),
                                    LogSeverity::Error,
                                )
                                .await;
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        client
                            .append_log(
                                format!("プッシュチャンネルの受信に失敗しました: {err}"),
                                LogSeverity::Error,
                            )
                            .await;
                        break;
                    }
                }
            }
            {
                let mut guard = client.inner.lock().await;
                guard.channel_connected = false;
            }
            client
                .append_log("サーバーから切断されました", LogSeverity::Warning)
                .await;
            let _ = client.events.send(ClientEvent::ChannelDisconnected);
        });

        Ok(())
    }

    /// Uploads `files` with the given settings and arms the session.
    ///
    /// Guarded single-flight: while a session is uploading or processing,
    /// and when no file is selected, the submission is rejected with one
    /// warning log entry and no request leaves the client. Transport and
    /// server failures restore the idle state before the error is returned.
    pub async fn submit(
        &self,
        files: Vec<UploadFile>,
        settings: UploadSettings,
    ) -> Result<SubmitOutcome> {
        {
            let mut guard = self.inner.lock().await;
            if guard.phase != SessionPhase::Idle {
                drop(guard);
                self.append_log(
                    "処理が進行中です。完了までお待ちください",
                    LogSeverity::Warning,
                )
                .await;
                return Ok(SubmitOutcome::Rejected(RejectReason::AlreadyProcessing));
            }
            if files.is_empty() {
                drop(guard);
                self.append_log("ファイルが選択されていません", LogSeverity::Warning)
                    .await;
                return Ok(SubmitOutcome::Rejected(RejectReason::NoFilesSelected));
            }
            guard.phase = SessionPhase::Uploading;
            guard.progress = ProgressSnapshot::default();
        }
        let _ = self
            .events
            .send(ClientEvent::ProgressUpdated(ProgressSnapshot::default()));

        match self.post_upload(files, &settings).await {
            Ok(response) => {
                let armed = {
                    let mut guard = self.inner.lock().await;
                    // A cancel may have landed while the upload was in
                    // flight; arming the session then would resurrect a
                    // state already announced as terminated.
                    if guard.phase == SessionPhase::Uploading {
                        guard.phase = SessionPhase::Processing;
                        guard.session = Some(response.session_id.clone());
                        true
                    } else {
                        false
                    }
                };
                if !armed {
                    self.append_log(
                        "アップロード中にキャンセルされたため応答を破棄しました",
                        LogSeverity::Warning,
                    )
                    .await;
                    return Ok(SubmitOutcome::Rejected(RejectReason::Cancelled));
                }
                info!(
                    session_id = %response.session_id,
                    file_count = response.file_count,
                    "upload accepted"
                );
                self.append_log(
                    format!("{}個のファイルをアップロードしました", response.file_count),
                    LogSeverity::Success,
                )
                .await;
                let _ = self.events.send(ClientEvent::SessionStarted {
                    session_id: response.session_id.clone(),
                    file_count: response.file_count,
                });
                Ok(SubmitOutcome::Started {
                    session_id: response.session_id,
                    file_count: response.file_count,
                })
            }
            Err(err) => {
                {
                    let mut guard = self.inner.lock().await;
                    guard.phase = SessionPhase::Idle;
                    guard.session = None;
                }
                self.append_log(format!("アップロードエラー: {err}"), LogSeverity::Error)
                    .await;
                Err(err)
            }
        }
    }

    async fn post_upload(
        &self,
        files: Vec<UploadFile>,
        settings: &UploadSettings,
    ) -> Result<UploadResponse> {
        let mut form = multipart::Form::new()
            .text("ocr_languages", settings.ocr_languages.clone())
            .text("target_language", settings.target_language.clone())
            .text("use_gpu", settings.use_gpu.to_string());
        for file in files {
            let mut part = multipart::Part::bytes(file.bytes).file_name(file.filename);
            if let Some(mime) = file.mime_type {
                part = part
                    .mime_str(&mime)
                    .context("invalid mime type for upload part")?;
            }
            form = form.part("files", part);
        }

        let response = self
            .http
            .post(format!("{}/upload", self.config.server_url))
            .multipart(form)
            .send()
            .await
            .context("upload request failed")?;

        let status = response.status();
        if !status.is_success() {
            let message = match response.json::<ErrorBody>().await {
                Ok(body) => body.error,
                Err(_) => "アップロードに失敗しました".to_string(),
            };
            return Err(ApiException::new(status.as_u16(), message).into());
        }
        response
            .json::<UploadResponse>()
            .await
            .context("invalid upload response body")
    }

    async fn handle_server_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::Progress(update) => self.handle_progress(update).await,
            ServerEvent::ProcessingComplete {
                session_id,
                message,
                download_links,
                output_folder: _,
            } => {
                self.handle_completion(session_id, message, download_links)
                    .await
            }
            ServerEvent::Error {
                session_id,
                message,
            } => self.handle_error(session_id, message).await,
        }
    }

    /// Applies a progress update field-wise; missing fields leave the
    /// snapshot untouched. Never fails.
    async fn handle_progress(&self, update: ProgressUpdate) {
        let snapshot = {
            let mut guard = self.inner.lock().await;
            if !targets_active_session(&guard, update.session_id.as_ref()) {
                return;
            }
            if let Some(percent) = update.progress {
                guard.progress.percent = percent;
            }
            if let Some(message) = update.message {
                guard.progress.status = Some(message);
            }
            if let Some(current) = update.current_file {
                guard.progress.current_file = Some(current);
            }
            if let Some(total) = update.total_files {
                guard.progress.total_files = Some(total);
            }
            guard.progress.clone()
        };
        let _ = self.events.send(ClientEvent::ProgressUpdated(snapshot));
    }

    async fn handle_completion(
        &self,
        session_id: Option<SessionId>,
        message: Option<String>,
        links: Vec<DownloadLink>,
    ) {
        let entries: Vec<ResultEntry> = {
            let mut guard = self.inner.lock().await;
            if !targets_active_session(&guard, session_id.as_ref()) {
                return;
            }
            guard.session = None;
            guard.phase = SessionPhase::Idle;
            links
                .iter()
                .map(|link| ResultEntry::from_link(link, &self.config.uploads_path))
                .collect()
        };

        let _ = self.events.send(ClientEvent::ResultsReady(entries.clone()));
        if entries.is_empty() {
            self.append_log(
                "ダウンロード可能なファイルがありません",
                LogSeverity::Warning,
            )
            .await;
        }
        let summary = message.unwrap_or_else(|| "処理が完了しました".to_string());
        self.append_log(summary, LogSeverity::Success).await;
        let _ = self
            .events
            .send(ClientEvent::SessionEnded(SessionOutcome::Completed {
                result_count: entries.len(),
            }));
    }

    async fn handle_error(&self, session_id: Option<SessionId>, message: String) {
        {
            let mut guard = self.inner.lock().await;
            if !targets_active_session(&guard, session_id.as_ref()) {
                return;
            }
            guard.session = None;
            guard.phase = SessionPhase::Idle;
        }
        self.append_log(message.clone(), LogSeverity::Error).await;
        let _ = self
            .events
            .send(ClientEvent::SessionEnded(SessionOutcome::Failed(message)));
    }

    /// Cancels the active session locally. No request is sent to the
    /// server; its in-flight work continues and later events for the
    /// abandoned session id no longer match anything here.
    pub async fn cancel(&self) -> bool {
        let cancelled = {
            let mut guard = self.inner.lock().await;
            if guard.phase == SessionPhase::Idle && guard.session.is_none() {
                false
            } else {
                guard.session = None;
                guard.phase = SessionPhase::Idle;
                true
            }
        };
        if cancelled {
            self.append_log("処理をキャンセルしました", LogSeverity::Info)
                .await;
            let _ = self
                .events
                .send(ClientEvent::SessionEnded(SessionOutcome::Cancelled));
        }
        cancelled
    }

    /// Appends to the bounded activity log, mirrors the entry to tracing
    /// and notifies subscribers so a front end can scroll to it.
    pub async fn append_log(&self, message: impl Into<String>, severity: LogSeverity) {
        let entry = LogEntry {
            at: Utc::now(),
            message: message.into(),
            severity,
        };
        {
            let mut guard = self.inner.lock().await;
            if guard.log.len() == LOG_CAPACITY {
                guard.log.pop_front();
            }
            guard.log.push_back(entry.clone());
        }
        match entry.severity {
            LogSeverity::Warning => warn!("{}", entry.message),
            LogSeverity::Error => error!("{}", entry.message),
            LogSeverity::Info | LogSeverity::Success => info!("{}", entry.message),
        }
        let _ = self.events.send(ClientEvent::LogAppended(entry));
    }

    /// Legacy results listing, for sessions whose completion event was
    /// missed (page reloads lose all in-memory state).
    pub async fn fetch_output_listing(&self, session_id: &SessionId) -> Result<OutputListing> {
        self.http
            .get(format!("{}/output/{session_id}", self.config.server_url))
            .send()
            .await
            .context("output listing request failed")?
            .error_for_status()
            .context("output listing request rejected")?
            .json()
            .await
            .context("invalid output listing body")
    }

    pub async fn download_result(&self, download_url: &str) -> Result<Vec<u8>> {
        let url = if download_url.starts_with("http://") || download_url.starts_with("https://") {
            download_url.to_string()
        } else {
            format!("{}{download_url}", self.config.server_url)
        };
        let bytes = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("download request failed: {url}"))?
            .error_for_status()
            .with_context(|| format!("download rejected: {url}"))?
            .bytes()
            .await
            .context("download body read failed")?;
        Ok(bytes.to_vec())
    }
}

/// Controller surface a front end drives; implemented for the shared
/// client handle so UI code stays independent of the concrete type.
#[async_trait]
pub trait SessionHandle: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn submit(&self, files: Vec<UploadFile>, settings: UploadSettings)
        -> Result<SubmitOutcome>;
    async fn cancel(&self) -> bool;
    async fn fetch_output_listing(&self, session_id: &SessionId) -> Result<OutputListing>;
    async fn download_result(&self, download_url: &str) -> Result<Vec<u8>>;
    async fn phase(&self) -> SessionPhase;
    async fn progress(&self) -> ProgressSnapshot;
    async fn log_entries(&self) -> Vec<LogEntry>;
    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent>;
}

#[async_trait]
impl SessionHandle for Arc<TranslationClient> {
    async fn connect(&self) -> Result<()> {
        TranslationClient::connect(self).await
    }

    async fn submit(
        &self,
        files: Vec<UploadFile>,
        settings: UploadSettings,
    ) -> Result<SubmitOutcome> {
        TranslationClient::submit(self, files, settings).await
    }

    async fn cancel(&self) -> bool {
        TranslationClient::cancel(self).await
    }

    async fn fetch_output_listing(&self, session_id: &SessionId) -> Result<OutputListing> {
        TranslationClient::fetch_output_listing(self, session_id).await
    }

    async fn download_result(&self, download_url: &str) -> Result<Vec<u8>> {
        TranslationClient::download_result(self, download_url).await
    }

    async fn phase(&self) -> SessionPhase {
        TranslationClient::phase(self).await
    }

    async fn progress(&self) -> ProgressSnapshot {
        TranslationClient::progress(self).await
    }

    async fn log_entries(&self) -> Vec<LogEntry> {
        TranslationClient::log_entries(self).await
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        TranslationClient::subscribe_events(self)
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
