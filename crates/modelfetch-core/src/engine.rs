//! Download engine - the transfer lifecycle state machine
//!
//! One transfer at a time. Every state transition is applied by a single
//! driver task per transfer: public operations are funneled through a
//! control channel and network callbacks through the signal channel, so
//! no callback ever touches [`TransferState`] from an arbitrary thread.

use crate::cache::CacheStore;
use crate::client::{ResumeToken, TransferClient, TransferHandle, TransferKind, TransferSignal};
use crate::error::FetchError;
use futures::Stream;
use modelfetch_types::{
    DownloadEvent, ResumeCacheRecord, TransferRequest, TransferState, TransferStatus,
};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::fs;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};
use url::Url;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding the resume record, cache files, and staging area
    pub data_dir: PathBuf,
    pub user_agent: String,
    pub connect_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_dir()
                .map(|d| d.join("modelfetch"))
                .unwrap_or_else(|| PathBuf::from(".modelfetch")),
            user_agent: format!("modelfetch/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }
}

/// Ordered event sequence for one transfer.
///
/// Ends after the terminal item: a `Finished` event, an error, or a
/// plain close when the transfer was paused or cancelled.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<Result<DownloadEvent, FetchError>>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<Result<DownloadEvent, FetchError>> {
        self.rx.recv().await
    }
}

impl Stream for EventStream {
    type Item = Result<DownloadEvent, FetchError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

enum Ctrl {
    Pause(oneshot::Sender<()>),
    Cancel(oneshot::Sender<()>),
}

struct ActiveTransfer {
    ctrl_tx: mpsc::UnboundedSender<Ctrl>,
}

/// The resumable download engine
pub struct DownloadEngine {
    client: TransferClient,
    cache: CacheStore,
    staging_dir: PathBuf,
    state: Arc<RwLock<TransferState>>,
    active: Arc<Mutex<Option<ActiveTransfer>>>,
    current: Mutex<Option<TransferRequest>>,
}

impl DownloadEngine {
    /// Create an engine with its own cache store under `config.data_dir`.
    pub async fn new(config: EngineConfig) -> Result<Self, FetchError> {
        let cache = CacheStore::new(&config.data_dir).await?;
        Self::with_store(config, cache).await
    }

    /// Create an engine around an explicitly injected cache store.
    pub async fn with_store(config: EngineConfig, cache: CacheStore) -> Result<Self, FetchError> {
        let staging_dir = config.data_dir.join("staging");
        fs::create_dir_all(&staging_dir).await?;

        let http = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .connect_timeout(config.connect_timeout)
            .build()?;
        let client = TransferClient::new(http, cache.cache_dir());

        Ok(Self {
            client,
            cache,
            staging_dir,
            state: Arc::new(RwLock::new(TransferState::default())),
            active: Arc::new(Mutex::new(None)),
            current: Mutex::new(None),
        })
    }

    /// Snapshot of the transfer state.
    pub async fn state(&self) -> TransferState {
        self.state.read().await.clone()
    }

    /// Read-only view of the persisted resume record, for restoring a
    /// "paused at N%" display without starting a transfer.
    pub async fn cache_info(&self) -> Option<ResumeCacheRecord> {
        self.cache.load().await.ok().flatten()
    }

    /// Start a transfer, fresh or resumed from persisted state.
    ///
    /// Fails before any network or disk I/O when the URL does not parse
    /// as http/https, and with [`FetchError::TransferInFlight`] while a
    /// transfer is active. A resume record whose blob has gone missing
    /// clears the cache and fails with [`FetchError::NoResumeData`].
    pub async fn start(
        &self,
        source_url: &str,
        destination: impl Into<PathBuf>,
    ) -> Result<EventStream, FetchError> {
        self.begin(TransferRequest::new(source_url, destination))
            .await
    }

    /// Start again from the request of the previous transfer.
    pub async fn resume(&self) -> Result<EventStream, FetchError> {
        let request = self
            .current
            .lock()
            .await
            .clone()
            .ok_or(FetchError::NoResumeData)?;
        self.begin(request).await
    }

    /// Pause the active transfer, persisting resume data when the server
    /// supports it.
    ///
    /// Returns only after the resume token and record are durably on
    /// disk, so a process kill right after `pause()` cannot lose them.
    /// Without resume data this degrades to a plain cancel with nothing
    /// persisted. No-op when no transfer is active.
    pub async fn pause(&self) {
        let ctrl_tx = {
            let active = self.active.lock().await;
            active.as_ref().map(|a| a.ctrl_tx.clone())
        };

        if let Some(ctrl_tx) = ctrl_tx {
            let (ack_tx, ack_rx) = oneshot::channel();
            if ctrl_tx.send(Ctrl::Pause(ack_tx)).is_ok() {
                let _ = ack_rx.await;
            }
        }
    }

    /// Cancel the active transfer and drop any resume state.
    ///
    /// With no transfer active this still clears persisted state, so a
    /// consumer can discard a paused download from a cold start.
    pub async fn cancel(&self) {
        let ctrl_tx = {
            let active = self.active.lock().await;
            active.as_ref().map(|a| a.ctrl_tx.clone())
        };

        match ctrl_tx {
            Some(ctrl_tx) => {
                let (ack_tx, ack_rx) = oneshot::channel();
                if ctrl_tx.send(Ctrl::Cancel(ack_tx)).is_ok() {
                    let _ = ack_rx.await;
                } else {
                    clear_cache(&self.cache).await;
                }
            }
            None => clear_cache(&self.cache).await,
        }
    }

    async fn begin(&self, request: TransferRequest) -> Result<EventStream, FetchError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(FetchError::TransferInFlight);
        }

        let url = parse_url(&request.source_url)?;
        let file_name = request
            .file_name()
            .ok_or_else(|| FetchError::InvalidUrl(request.source_url.clone()))?
            .to_string();

        let kind = self.entry_kind(&url, &file_name).await?;
        let (initial_written, initial_expected) = match &kind {
            TransferKind::Resumed { token } => (token.offset, token.bytes_expected),
            TransferKind::Fresh { .. } => (0, -1),
        };

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let handle = match self.client.begin(kind, signal_tx).await {
            Ok(handle) => handle,
            Err(FetchError::NoResumeData) => {
                warn!("resume preconditions failed, clearing cache");
                clear_cache(&self.cache).await;
                return Err(FetchError::NoResumeData);
            }
            Err(e) => return Err(e),
        };

        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        *active = Some(ActiveTransfer { ctrl_tx });
        drop(active);

        *self.current.lock().await = Some(request.clone());
        {
            let mut state = self.state.write().await;
            state.status = TransferStatus::Downloading;
            state.bytes_written = initial_written;
            state.bytes_expected = initial_expected;
        }

        let driver = Driver {
            cache: self.cache.clone(),
            staging_dir: self.staging_dir.clone(),
            state: self.state.clone(),
            active: self.active.clone(),
            request,
            file_name,
            handle,
            event_tx,
        };
        tokio::spawn(driver.run(signal_rx, ctrl_rx));

        Ok(EventStream { rx: event_rx })
    }

    /// Decide between a fresh and a resumed entry from the cache state.
    async fn entry_kind(&self, url: &Url, file_name: &str) -> Result<TransferKind, FetchError> {
        let record = match self.cache.load().await {
            Ok(record) => record,
            Err(e) if e.is_stale_cache() => {
                warn!("discarding undecodable resume record: {}", e);
                clear_cache(&self.cache).await;
                None
            }
            Err(e) => return Err(e),
        };

        let Some(record) = record else {
            return Ok(TransferKind::Fresh {
                url: url.clone(),
                partial_file_name: CacheStore::partial_name(file_name),
            });
        };

        if !self.cache.blob_exists(&record.cache_file_name).await {
            warn!("resume record references a missing blob, clearing cache");
            clear_cache(&self.cache).await;
            return Err(FetchError::NoResumeData);
        }

        let bytes = self.cache.read_blob(&record.cache_file_name).await?;
        match ResumeToken::from_bytes(&bytes) {
            Ok(token) => {
                if token.url != url.as_str() {
                    debug!(
                        "resume token url {} differs from requested {}, token wins",
                        token.url, url
                    );
                }
                Ok(TransferKind::Resumed { token })
            }
            Err(e) => {
                warn!("resume token blob is corrupt, clearing cache: {}", e);
                clear_cache(&self.cache).await;
                Err(FetchError::NoResumeData)
            }
        }
    }
}

enum PendingOp {
    Pause,
    Cancel,
}

/// Per-transfer task owning all state transitions
struct Driver {
    cache: CacheStore,
    staging_dir: PathBuf,
    state: Arc<RwLock<TransferState>>,
    active: Arc<Mutex<Option<ActiveTransfer>>>,
    request: TransferRequest,
    file_name: String,
    handle: TransferHandle,
    event_tx: mpsc::UnboundedSender<Result<DownloadEvent, FetchError>>,
}

impl Driver {
    async fn run(
        mut self,
        mut signal_rx: mpsc::UnboundedReceiver<TransferSignal>,
        mut ctrl_rx: mpsc::UnboundedReceiver<Ctrl>,
    ) {
        let mut pending: Option<(PendingOp, oneshot::Sender<()>)> = None;

        loop {
            tokio::select! {
                Some(ctrl) = ctrl_rx.recv(), if pending.is_none() => {
                    match ctrl {
                        Ctrl::Pause(ack) => {
                            self.handle.interrupt(true);
                            pending = Some((PendingOp::Pause, ack));
                        }
                        Ctrl::Cancel(ack) => {
                            self.handle.interrupt(false);
                            pending = Some((PendingOp::Cancel, ack));
                        }
                    }
                }
                signal = signal_rx.recv() => {
                    let Some(signal) = signal else {
                        warn!("transfer task ended without a terminal signal");
                        self.set_status(TransferStatus::Failed).await;
                        break;
                    };
                    if self.apply(signal, &mut pending).await {
                        break;
                    }
                }
            }
        }

        self.release().await;
        if let Some((_, ack)) = pending.take() {
            let _ = ack.send(());
        }
    }

    /// Apply one signal; returns true when the transfer reached a
    /// terminal state.
    async fn apply(
        &mut self,
        signal: TransferSignal,
        pending: &mut Option<(PendingOp, oneshot::Sender<()>)>,
    ) -> bool {
        match signal {
            TransferSignal::Progress {
                bytes_written,
                bytes_expected,
            } => {
                {
                    let mut state = self.state.write().await;
                    state.bytes_written = bytes_written;
                    state.bytes_expected = bytes_expected;
                }
                let _ = self.event_tx.send(Ok(DownloadEvent::Progress {
                    bytes_written,
                    bytes_expected: normalize_expected(bytes_expected),
                }));
                false
            }

            TransferSignal::Completed { partial } => {
                let moved = self.finish(&partial).await;
                self.release().await;
                match moved {
                    Ok(path) => {
                        self.set_status(TransferStatus::Finished).await;
                        info!("download finished: {:?}", path);
                        let _ = self.event_tx.send(Ok(DownloadEvent::Finished { path }));
                    }
                    Err(e) => {
                        self.set_status(TransferStatus::Failed).await;
                        let _ = self.event_tx.send(Err(e));
                    }
                }
                true
            }

            TransferSignal::Interrupted { token } => {
                match pending.take() {
                    Some((PendingOp::Cancel, ack)) => {
                        clear_cache(&self.cache).await;
                        self.release().await;
                        self.set_status(TransferStatus::Cancelled).await;
                        info!("download cancelled: {}", self.request.source_url);
                        let _ = ack.send(());
                    }
                    other => {
                        let persisted = match &token {
                            Some(token) => self.persist_pause(token).await,
                            None => Ok(()),
                        };
                        self.release().await;
                        match persisted {
                            Ok(()) => {
                                self.set_status(TransferStatus::Paused).await;
                                info!(
                                    "download paused (resume data: {})",
                                    token.is_some()
                                );
                            }
                            Err(e) => {
                                self.set_status(TransferStatus::Failed).await;
                                let _ = self.event_tx.send(Err(e));
                            }
                        }
                        if let Some((_, ack)) = other {
                            let _ = ack.send(());
                        }
                    }
                }
                true
            }

            TransferSignal::Failed(e) => {
                self.release().await;
                self.set_status(TransferStatus::Failed).await;
                let _ = self.event_tx.send(Err(e));
                if let Some((_, ack)) = pending.take() {
                    let _ = ack.send(());
                }
                true
            }
        }
    }

    /// Write the resume token blob, then the record, both synced.
    async fn persist_pause(&self, token: &ResumeToken) -> Result<(), FetchError> {
        let blob_name = CacheStore::blob_name(&self.file_name);
        self.cache.write_blob(&blob_name, &token.to_bytes()?).await?;

        let record = ResumeCacheRecord {
            download_link: self.request.source_url.clone(),
            cache_file_name: blob_name,
            bytes_written: token.offset as i64,
            bytes_expected: token.bytes_expected,
        };
        self.cache.save(&record).await?;

        Ok(())
    }

    /// Two-hop durable move: partial payload into the private staging
    /// area, then staging to the caller's destination.
    async fn finish(&self, partial: &Path) -> Result<PathBuf, FetchError> {
        let destination = self.request.destination.clone();
        let staged = self.staging_dir.join(&self.file_name);

        fs::rename(partial, &staged).await?;

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }
        move_file(&staged, &destination).await?;

        clear_cache(&self.cache).await;
        Ok(destination)
    }

    async fn set_status(&self, status: TransferStatus) {
        self.state.write().await.status = status;
    }

    async fn release(&self) {
        self.active.lock().await.take();
    }
}

/// Move a file across a possible volume boundary: rename first, fall
/// back to copy + sync + remove.
async fn move_file(src: &Path, dest: &Path) -> Result<(), FetchError> {
    if fs::rename(src, dest).await.is_ok() {
        return Ok(());
    }

    fs::copy(src, dest).await?;
    let file = fs::File::open(dest).await?;
    file.sync_all().await?;
    if let Err(e) = fs::remove_file(src).await {
        warn!("failed to remove staging file {:?}: {}", src, e);
    }
    Ok(())
}

async fn clear_cache(cache: &CacheStore) {
    if let Err(e) = cache.clear().await {
        warn!("failed to clear resume cache: {}", e);
    }
}

fn parse_url(raw: &str) -> Result<Url, FetchError> {
    let url = Url::parse(raw).map_err(|_| FetchError::InvalidUrl(raw.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        _ => Err(FetchError::InvalidUrl(raw.to_string())),
    }
}

/// Servers that omit `Content-Length` report a non-positive expected
/// size; consumers see that as unknown rather than a literal zero.
fn normalize_expected(bytes_expected: i64) -> Option<u64> {
    (bytes_expected > 0).then_some(bytes_expected as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_positive_expected_reads_as_unknown() {
        assert_eq!(normalize_expected(-1), None);
        assert_eq!(normalize_expected(0), None);
        assert_eq!(normalize_expected(10_000), Some(10_000));
    }

    #[test]
    fn only_http_schemes_are_accepted() {
        assert!(parse_url("https://host/model.bin").is_ok());
        assert!(parse_url("http://host/model.bin").is_ok());
        assert!(matches!(
            parse_url("ftp://host/model.bin"),
            Err(FetchError::InvalidUrl(_))
        ));
        assert!(matches!(
            parse_url("file:///model.bin"),
            Err(FetchError::InvalidUrl(_))
        ));
        assert!(matches!(
            parse_url("not a url"),
            Err(FetchError::InvalidUrl(_))
        ));
    }
}
