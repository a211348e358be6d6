//! Chunked image upload: START, paced chunk writes with retry, FINISH.
//!
//! The whole sequence runs as one queued operation so nothing else reaches
//! the wire mid-upload. Any failure after START best-effort sends CANCEL so
//! the device discards the partial file.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::error::{FrameError, Result};
use crate::protocol::{chunk_data, Opcode, ResponseCode, CHUNK_SIZE, PACKED_LEN};
use crate::session::Link;

/// Write attempts per chunk before the upload gives up.
pub const MAX_CHUNK_ATTEMPTS: u32 = 3;
/// Backoff unit; attempt `n` waits `n` units before the next try.
pub const RETRY_BACKOFF: Duration = Duration::from_millis(300);
/// Pause after every acknowledged chunk so the receiver can drain its buffer.
pub const CHUNK_PACING: Duration = Duration::from_millis(10);
/// Pause between the last chunk and FINISH.
pub const FINISH_SETTLE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    Starting,
    Transferring,
    Finishing,
    Done,
    Failed,
    Cancelled,
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UploadState::Idle => "idle",
            UploadState::Starting => "start",
            UploadState::Transferring => "transfer",
            UploadState::Finishing => "finish",
            UploadState::Done => "done",
            UploadState::Failed => "failed",
            UploadState::Cancelled => "cancelled",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    pub state: UploadState,
    pub sent: usize,
    pub total: usize,
}

impl UploadProgress {
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        (self.sent * 100 / self.total).min(100) as u8
    }
}

/// Cooperative cancel flag, checked between chunks and between retries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A named buffer to store on the frame.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    name: String,
    data: Vec<u8>,
    cancel: Option<CancelToken>,
}

impl UploadRequest {
    pub fn new(name: &str, data: Vec<u8>) -> Result<Self> {
        let name = check_name(name)?;
        if data.is_empty() {
            return Err(FrameError::InvalidImage("upload buffer is empty".into()));
        }
        if data.len() != PACKED_LEN {
            debug!("uploading {} bytes, panel buffers are {PACKED_LEN}", data.len());
        }
        Ok(Self {
            name,
            data,
            cancel: None,
        })
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Image names go out as a command parameter and come back in a
/// newline-separated list, so they must be non-empty single lines.
pub(crate) fn check_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.contains(['\n', '\r', '\0']) {
        return Err(FrameError::InvalidName(name.to_string()));
    }
    Ok(trimmed.to_string())
}

enum Transfer {
    Complete,
    Cancelled,
}

struct Upload<'a> {
    link: &'a Link,
    progress: &'a mut (dyn FnMut(UploadProgress) + Send),
    cancel: Option<CancelToken>,
    state: UploadState,
    sent: usize,
    total: usize,
}

/// Runs one upload to completion. Called from inside the operation queue.
pub(crate) async fn run(
    link: &Link,
    request: UploadRequest,
    progress: &mut (dyn FnMut(UploadProgress) + Send),
) -> Result<()> {
    let UploadRequest { name, data, cancel } = request;
    let mut upload = Upload {
        link,
        progress,
        cancel,
        state: UploadState::Idle,
        sent: 0,
        total: data.len(),
    };
    upload.run(&name, &data).await
}

impl Upload<'_> {
    fn report(&mut self) {
        (self.progress)(UploadProgress {
            state: self.state,
            sent: self.sent,
            total: self.total,
        });
    }

    fn enter(&mut self, state: UploadState) {
        debug!("upload {} -> {}", self.state, state);
        self.state = state;
        self.report();
    }

    fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }

    /// Wraps `source` with the phase and offset reached, and moves to Failed.
    fn fail(&mut self, source: FrameError) -> FrameError {
        let phase = self.state;
        error!("upload failed during {phase} at {}/{} bytes: {source}", self.sent, self.total);
        self.enter(UploadState::Failed);
        FrameError::UploadFailed {
            phase,
            sent: self.sent,
            total: self.total,
            source: Box::new(source),
        }
    }

    async fn run(&mut self, name: &str, data: &[u8]) -> Result<()> {
        info!("uploading {name:?} ({} bytes)", self.total);
        self.enter(UploadState::Starting);
        if let Err(e) = self
            .link
            .command(Opcode::StartUpload, Some(name), ResponseCode::Ok)
            .await
        {
            return Err(self.fail(e));
        }

        self.enter(UploadState::Transferring);
        let outcome = match self.transfer(data).await {
            Ok(Transfer::Complete) => self.finish().await.map(|()| Transfer::Complete),
            other => other,
        };

        match outcome {
            Ok(Transfer::Complete) => {
                self.enter(UploadState::Done);
                info!("upload of {name:?} complete");
                Ok(())
            }
            Ok(Transfer::Cancelled) => {
                info!("upload of {name:?} cancelled at {}/{} bytes", self.sent, self.total);
                self.send_cancel().await;
                self.enter(UploadState::Cancelled);
                Err(FrameError::UploadCancelled {
                    sent: self.sent,
                    total: self.total,
                })
            }
            Err(e) => {
                self.send_cancel().await;
                Err(self.fail(e))
            }
        }
    }

    async fn transfer(&mut self, data: &[u8]) -> Result<Transfer> {
        let chunks = chunk_data(data, CHUNK_SIZE);
        let count = chunks.len();
        for (index, chunk) in chunks.into_iter().enumerate() {
            if self.cancelled() {
                return Ok(Transfer::Cancelled);
            }
            if let Transfer::Cancelled = self.write_with_retry(index, count, chunk).await? {
                return Ok(Transfer::Cancelled);
            }
            self.sent += chunk.len();
            self.report();
            sleep(CHUNK_PACING).await;
        }
        Ok(Transfer::Complete)
    }

    async fn write_with_retry(&mut self, index: usize, count: usize, chunk: &[u8]) -> Result<Transfer> {
        let mut attempt = 1;
        loop {
            match self.link.write_chunk(chunk).await {
                Ok(()) => return Ok(Transfer::Complete),
                Err(FrameError::LinkLost) => return Err(FrameError::LinkLost),
                Err(e) if attempt >= MAX_CHUNK_ATTEMPTS => {
                    error!("chunk {}/{count} failed after {attempt} attempts: {e}", index + 1);
                    return Err(e);
                }
                Err(e) => {
                    warn!("chunk {}/{count} attempt {attempt} failed: {e}", index + 1);
                    sleep(RETRY_BACKOFF * attempt).await;
                    if self.cancelled() {
                        return Ok(Transfer::Cancelled);
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn finish(&mut self) -> Result<()> {
        self.enter(UploadState::Finishing);
        sleep(FINISH_SETTLE).await;
        self.link
            .command(Opcode::FinishUpload, None, ResponseCode::Ok)
            .await
            .map(drop)
    }

    /// CANCEL during cleanup; its own failure is only logged.
    async fn send_cancel(&mut self) {
        if let Err(e) = self
            .link
            .command(Opcode::CancelUpload, None, ResponseCode::Ok)
            .await
        {
            warn!("cleanup cancel failed: {e}");
        }
    }
}
