//! Transfer client - adapter over the HTTP stack
//!
//! Issues exactly one fresh or resume-token request at a time, streams
//! the response body into the partial payload file, and reports raw
//! signals back to the engine. Deliberate cancellation surfaces as an
//! [`TransferSignal::Interrupted`], never as a failure, so the engine
//! can tell a pause/cancel apart from a genuine error.

use crate::error::FetchError;
use futures::StreamExt;
use reqwest::header;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use url::Url;

/// Opaque resume token persisted in the `.resume` blob between sessions.
///
/// Produced on cancellation-with-resume-data and consumed by a later
/// resumed request. The engine never looks inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeToken {
    pub url: String,
    pub partial_file_name: String,
    pub offset: u64,
    pub bytes_expected: i64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl ResumeToken {
    pub fn to_bytes(&self) -> Result<Vec<u8>, FetchError> {
        serde_json::to_vec(self).map_err(|e| FetchError::Encoding(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FetchError> {
        serde_json::from_slice(bytes).map_err(|e| FetchError::Decoding(e.to_string()))
    }
}

/// How a transfer enters the network layer.
#[derive(Debug)]
pub enum TransferKind {
    /// Full request against the source URL, partial payload truncated.
    Fresh {
        url: Url,
        partial_file_name: String,
    },
    /// Byte-range request continuing from a stored token.
    Resumed { token: ResumeToken },
}

/// Raw signals delivered to the engine, in the order the underlying
/// callbacks occurred. `bytes_expected <= 0` means the server did not
/// report a total; normalization is the engine's job.
#[derive(Debug)]
pub enum TransferSignal {
    Progress {
        bytes_written: u64,
        bytes_expected: i64,
    },
    Completed {
        partial: PathBuf,
    },
    Interrupted {
        token: Option<ResumeToken>,
    },
    Failed(FetchError),
}

/// Control handle for an in-flight transfer.
#[derive(Clone)]
pub struct TransferHandle {
    want_resume: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl TransferHandle {
    fn new() -> Self {
        Self {
            want_resume: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Ask the streaming loop to stop at the next chunk boundary. The
    /// notify permit is retained, so an interrupt issued while the
    /// response headers are still in flight is picked up once streaming
    /// begins.
    ///
    /// With `produce_resume_data` set, the loop emits a resume token when
    /// the server supports byte ranges and bytes have been written.
    pub fn interrupt(&self, produce_resume_data: bool) {
        self.want_resume
            .store(produce_resume_data, Ordering::Release);
        self.notify.notify_one();
    }
}

/// Adapter that owns the HTTP client and the partial payload directory
#[derive(Debug, Clone)]
pub struct TransferClient {
    http: reqwest::Client,
    cache_dir: PathBuf,
}

impl TransferClient {
    pub fn new(http: reqwest::Client, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            http,
            cache_dir: cache_dir.into(),
        }
    }

    /// Begin a transfer, spawning the streaming task.
    ///
    /// Resume preconditions are validated here, before any network I/O:
    /// a missing partial payload or one shorter than the acknowledged
    /// offset yields [`FetchError::NoResumeData`]. A partial longer than
    /// the offset is truncated back to it.
    pub async fn begin(
        &self,
        kind: TransferKind,
        signal_tx: mpsc::UnboundedSender<TransferSignal>,
    ) -> Result<TransferHandle, FetchError> {
        if let TransferKind::Resumed { token } = &kind {
            let partial = self.cache_dir.join(&token.partial_file_name);
            let len = match tokio::fs::metadata(&partial).await {
                Ok(meta) => meta.len(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(FetchError::NoResumeData);
                }
                Err(e) => return Err(FetchError::FileSystem(e)),
            };

            if len < token.offset {
                warn!(
                    "partial payload {:?} holds {} bytes, token acknowledges {}",
                    partial, len, token.offset
                );
                return Err(FetchError::NoResumeData);
            }

            if len > token.offset {
                debug!(
                    "truncating partial payload {:?} from {} to acknowledged {} bytes",
                    partial, len, token.offset
                );
                let file = OpenOptions::new().write(true).open(&partial).await?;
                file.set_len(token.offset).await?;
                file.sync_all().await?;
            }
        }

        let handle = TransferHandle::new();
        let worker = TransferWorker {
            http: self.http.clone(),
            cache_dir: self.cache_dir.clone(),
            handle: handle.clone(),
            signal_tx,
        };
        tokio::spawn(worker.run(kind));

        Ok(handle)
    }
}

/// Streaming task for one transfer
struct TransferWorker {
    http: reqwest::Client,
    cache_dir: PathBuf,
    handle: TransferHandle,
    signal_tx: mpsc::UnboundedSender<TransferSignal>,
}

impl TransferWorker {
    async fn run(self, kind: TransferKind) {
        if let Err(err) = self.stream(kind).await {
            let _ = self.signal_tx.send(TransferSignal::Failed(err));
        }
    }

    async fn stream(&self, kind: TransferKind) -> Result<(), FetchError> {
        let (url, partial_file_name, mut offset, mut etag, mut last_modified) = match kind {
            TransferKind::Fresh {
                url,
                partial_file_name,
            } => (url.to_string(), partial_file_name, 0u64, None, None),
            TransferKind::Resumed { token } => (
                token.url,
                token.partial_file_name,
                token.offset,
                token.etag,
                token.last_modified,
            ),
        };
        let partial = self.cache_dir.join(&partial_file_name);

        let mut request = self.http.get(&url);
        if offset > 0 {
            request = request.header(header::RANGE, format!("bytes={offset}-"));
            if let Some(validator) = etag.as_deref().or(last_modified.as_deref()) {
                request = request.header(header::IF_RANGE, validator);
            }
            info!("resuming transfer of {} from byte {}", url, offset);
        } else {
            info!("starting fresh transfer of {}", url);
        }

        let response = request.send().await?;
        let status = response.status();

        let append = match status {
            StatusCode::PARTIAL_CONTENT if offset > 0 => true,
            s if s.is_success() => {
                if offset > 0 {
                    info!("server ignored range request, restarting from byte 0");
                    offset = 0;
                }
                false
            }
            s => return Err(FetchError::ServerStatus(s.as_u16())),
        };

        let resumable = append || accepts_byte_ranges(&response);
        if let Some(value) = header_string(&response, header::ETAG) {
            etag = Some(value);
        }
        if let Some(value) = header_string(&response, header::LAST_MODIFIED) {
            last_modified = Some(value);
        }

        let bytes_expected: i64 = if append {
            content_range_total(&response)
                .or_else(|| response.content_length().map(|len| offset + len))
                .map(|total| total as i64)
                .unwrap_or(-1)
        } else {
            response
                .content_length()
                .map(|len| len as i64)
                .unwrap_or(-1)
        };

        let mut file = if append {
            let mut file = OpenOptions::new().write(true).open(&partial).await?;
            file.seek(SeekFrom::Start(offset)).await?;
            file
        } else {
            File::create(&partial).await?
        };

        let mut bytes_written = offset;
        let mut body = response.bytes_stream();

        loop {
            let chunk = tokio::select! {
                _ = self.handle.notify.notified() => {
                    return self
                        .finish_interrupted(
                            &mut file,
                            &partial,
                            InterruptContext {
                                url: &url,
                                partial_file_name: &partial_file_name,
                                bytes_written,
                                bytes_expected,
                                resumable,
                                etag,
                                last_modified,
                            },
                        )
                        .await;
                }
                next = body.next() => match next {
                    Some(Ok(chunk)) => chunk,
                    Some(Err(e)) => return Err(FetchError::Transfer(e)),
                    None => break,
                },
            };

            file.write_all(&chunk).await?;
            bytes_written += chunk.len() as u64;

            let _ = self.signal_tx.send(TransferSignal::Progress {
                bytes_written,
                bytes_expected,
            });
        }

        file.flush().await?;
        file.sync_all().await?;

        let _ = self
            .signal_tx
            .send(TransferSignal::Completed { partial });
        Ok(())
    }

    async fn finish_interrupted(
        &self,
        file: &mut File,
        partial: &Path,
        ctx: InterruptContext<'_>,
    ) -> Result<(), FetchError> {
        file.flush().await?;
        file.sync_all().await?;

        let want_resume = self.handle.want_resume.load(Ordering::Acquire);
        let token = if want_resume && ctx.resumable && ctx.bytes_written > 0 {
            Some(ResumeToken {
                url: ctx.url.to_string(),
                partial_file_name: ctx.partial_file_name.to_string(),
                offset: ctx.bytes_written,
                bytes_expected: ctx.bytes_expected,
                etag: ctx.etag,
                last_modified: ctx.last_modified,
            })
        } else {
            None
        };

        if token.is_none() {
            if let Err(e) = tokio::fs::remove_file(partial).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove partial payload {:?}: {}", partial, e);
                }
            }
        }

        info!(
            "transfer interrupted at byte {} (resume data: {})",
            ctx.bytes_written,
            token.is_some()
        );
        let _ = self.signal_tx.send(TransferSignal::Interrupted { token });
        Ok(())
    }
}

struct InterruptContext<'a> {
    url: &'a str,
    partial_file_name: &'a str,
    bytes_written: u64,
    bytes_expected: i64,
    resumable: bool,
    etag: Option<String>,
    last_modified: Option<String>,
}

fn accepts_byte_ranges(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(header::ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .map(|s| s == "bytes")
        .unwrap_or(false)
}

fn header_string(response: &reqwest::Response, name: header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Parse the total from a `Content-Range: bytes a-b/total` header.
/// A total of `*` means the server does not know the size.
fn content_range_total(response: &reqwest::Response) -> Option<u64> {
    let raw = response
        .headers()
        .get(header::CONTENT_RANGE)?
        .to_str()
        .ok()?;
    raw.rsplit('/').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trips_through_bytes() {
        let token = ResumeToken {
            url: "https://host/model.bin".to_string(),
            partial_file_name: "model.bin.part".to_string(),
            offset: 8192,
            bytes_expected: 65536,
            etag: Some("\"abc123\"".to_string()),
            last_modified: None,
        };

        let bytes = token.to_bytes().unwrap();
        assert_eq!(ResumeToken::from_bytes(&bytes).unwrap(), token);
    }

    #[test]
    fn garbage_token_bytes_fail_to_decode() {
        let err = ResumeToken::from_bytes(b"definitely not a token").err().unwrap();
        assert!(matches!(err, FetchError::Decoding(_)));
    }
}
