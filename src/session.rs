//! One connected frame: command exchanges, cached device state and link events.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::{FrameError, Result};
use crate::protocol::{
    build_command, parse_response, DeviceInfo, DeviceSettings, Opcode, ResponseCode, ResponseFrame,
    COMMAND_TIMEOUT,
};
use crate::queue::OperationQueue;
use crate::upload::{self, UploadProgress, UploadRequest};

/// Link primitives the session needs. Implement this for BLE or a mock.
///
/// Both writes resolve once the peer has acknowledged them.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write a command frame on the control channel.
    async fn write_command(&self, frame: &[u8]) -> Result<()>;
    /// Write raw upload bytes on the bulk-data channel.
    async fn write_chunk(&self, chunk: &[u8]) -> Result<()>;
}

/// What the transport pushes up to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// One inbound notification.
    Frame(Vec<u8>),
    Disconnected,
}

/// What the session tells its listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Disconnected,
    /// Device-reported upload offset. The device does not send a total.
    Progress(u32),
}

/// Last known device-derived state. Cleared when the link drops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceState {
    pub info: Option<DeviceInfo>,
    pub settings: Option<DeviceSettings>,
    pub images: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

struct Pending {
    opcode: u8,
    reply: oneshot::Sender<Result<ResponseFrame>>,
}

/// State shared between the queued operations and the inbound reader.
pub(crate) struct Link {
    transport: Arc<dyn Transport>,
    pending: Mutex<Option<Pending>>,
    connected: AtomicBool,
    state: Mutex<DeviceState>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
    timeout: Duration,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Link {
    /// Sends one command and waits for the next response frame.
    ///
    /// Only one exchange may be outstanding; callers go through the queue.
    /// The timeout covers the write as well as the wait for the reply.
    pub(crate) async fn exchange(&self, opcode: Opcode, param: Option<&str>) -> Result<ResponseFrame> {
        let (reply, rx) = oneshot::channel();
        {
            // checked under the slot lock so a concurrent disconnect either
            // sees this exchange or we see the disconnect
            let mut slot = lock(&self.pending);
            if !self.connected.load(Ordering::SeqCst) {
                return Err(FrameError::LinkLost);
            }
            let pending = Pending {
                opcode: opcode.byte(),
                reply,
            };
            if slot.replace(pending).is_some() {
                warn!("command 0x{:02X} replaced an outstanding exchange", opcode.byte());
            }
        }

        let frame = build_command(opcode, param);
        debug!("-> 0x{:02X} ({} bytes)", opcode.byte(), frame.len());
        let outcome = tokio::time::timeout(self.timeout, async {
            self.transport.write_command(&frame).await?;
            // reply dropped unanswered
            rx.await.unwrap_or(Err(FrameError::LinkLost))
        })
        .await;

        match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                lock(&self.pending).take();
                warn!("command 0x{:02X} failed: {e}", opcode.byte());
                Err(e)
            }
            Err(_) => {
                lock(&self.pending).take();
                warn!("no response to command 0x{:02X} within {:?}", opcode.byte(), self.timeout);
                Err(FrameError::Timeout {
                    opcode: opcode.byte(),
                })
            }
        }
    }

    /// [`exchange`](Self::exchange) plus a check of the response code.
    pub(crate) async fn command(
        &self,
        opcode: Opcode,
        param: Option<&str>,
        expected: ResponseCode,
    ) -> Result<ResponseFrame> {
        let frame = self.exchange(opcode, param).await?;
        expect(frame, opcode, expected)
    }

    pub(crate) async fn write_chunk(&self, chunk: &[u8]) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(FrameError::LinkLost);
        }
        self.transport.write_chunk(chunk).await
    }

    fn dispatch(&self, bytes: Vec<u8>) {
        let Some(frame) = parse_response(&bytes) else {
            trace!("ignoring empty notification");
            return;
        };
        if frame.is(ResponseCode::Progress) {
            match frame.progress_offset() {
                Ok(offset) => {
                    trace!("device progress offset {offset}");
                    self.notify(&SessionEvent::Progress(offset));
                }
                Err(e) => warn!("bad progress frame: {e}"),
            }
            return;
        }
        match lock(&self.pending).take() {
            Some(pending) => {
                debug!(
                    "<- 0x{:02X} for command 0x{:02X} ({} bytes)",
                    frame.code_byte(),
                    pending.opcode,
                    bytes.len()
                );
                // a timed-out caller has already dropped the receiver
                let _ = pending.reply.send(Ok(frame));
            }
            None => debug!("dropping unsolicited frame 0x{:02X}", frame.code_byte()),
        }
    }

    fn disconnect(&self) {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        *lock(&self.state) = DeviceState::default();
        if let Some(pending) = lock(&self.pending).take() {
            debug!("failing command 0x{:02X}: link lost", pending.opcode);
            let _ = pending.reply.send(Err(FrameError::LinkLost));
        }
        if was_connected {
            info!("frame disconnected");
            self.notify(&SessionEvent::Disconnected);
        }
    }

    /// Listeners run with the registry unlocked, so they may add or remove listeners.
    fn notify(&self, event: &SessionEvent) {
        let listeners: Vec<Listener> = lock(&self.listeners)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    pub(crate) fn update_state(&self, f: impl FnOnce(&mut DeviceState)) {
        f(&mut lock(&self.state));
    }

    async fn get_info(&self) -> Result<DeviceInfo> {
        let info = self
            .command(Opcode::GetInfo, None, ResponseCode::Info)
            .await?
            .device_info()?;
        self.update_state(|s| s.info = Some(info.clone()));
        Ok(info)
    }

    async fn list_images(&self) -> Result<Vec<String>> {
        let images = self
            .command(Opcode::GetImages, None, ResponseCode::ImageList)
            .await?
            .image_list()?;
        self.update_state(|s| s.images = images.clone());
        Ok(images)
    }

    async fn get_settings(&self) -> Result<DeviceSettings> {
        let settings = self
            .command(Opcode::GetSettings, None, ResponseCode::Settings)
            .await?
            .settings()?;
        self.update_state(|s| s.settings = Some(settings.clone()));
        Ok(settings)
    }

    async fn ok(&self, opcode: Opcode, param: Option<&str>) -> Result<()> {
        self.command(opcode, param, ResponseCode::Ok).await.map(drop)
    }
}

/// Checks a response against the code the command should produce.
fn expect(frame: ResponseFrame, opcode: Opcode, expected: ResponseCode) -> Result<ResponseFrame> {
    if frame.is(expected) {
        Ok(frame)
    } else if frame.is(ResponseCode::Error) {
        Err(FrameError::Device {
            opcode: opcode.byte(),
            message: frame.error_message(),
        })
    } else {
        Err(FrameError::UnexpectedResponse {
            opcode: opcode.byte(),
            expected,
            actual: frame.code_byte(),
        })
    }
}

/// A connected photo frame.
///
/// Every operation goes through one FIFO lane, so callers on different tasks
/// never interleave on the wire. Must be created inside a tokio runtime.
pub struct FrameSession {
    link: Arc<Link>,
    queue: OperationQueue,
    reader: JoinHandle<()>,
}

impl FrameSession {
    /// Wraps a connected transport and the channel its notifications arrive on.
    pub fn new(transport: Arc<dyn Transport>, events: mpsc::UnboundedReceiver<LinkEvent>) -> Self {
        Self::with_timeout(transport, events, COMMAND_TIMEOUT)
    }

    pub fn with_timeout(
        transport: Arc<dyn Transport>,
        mut events: mpsc::UnboundedReceiver<LinkEvent>,
        timeout: Duration,
    ) -> Self {
        let link = Arc::new(Link {
            transport,
            pending: Mutex::new(None),
            connected: AtomicBool::new(true),
            state: Mutex::new(DeviceState::default()),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            timeout,
        });
        let reader_link = link.clone();
        let reader = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    LinkEvent::Frame(bytes) => reader_link.dispatch(bytes),
                    LinkEvent::Disconnected => reader_link.disconnect(),
                }
            }
            // transport dropped its sender
            reader_link.disconnect();
        });
        Self {
            link,
            queue: OperationQueue::new(),
            reader,
        }
    }

    async fn run<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce(Arc<Link>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let link = self.link.clone();
        self.queue.enqueue(move || op(link)).await
    }

    pub fn is_connected(&self) -> bool {
        self.link.connected.load(Ordering::SeqCst)
    }

    /// True while a queued operation is executing.
    pub fn is_busy(&self) -> bool {
        self.queue.is_busy()
    }

    /// Snapshot of the cached device state.
    pub fn state(&self) -> DeviceState {
        lock(&self.link.state).clone()
    }

    pub fn add_listener(&self, listener: impl Fn(&SessionEvent) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.link.next_listener.fetch_add(1, Ordering::Relaxed));
        lock(&self.link.listeners).push((id, Arc::new(listener)));
        id
    }

    /// Returns false if the listener was already gone.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.link.listeners);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub async fn get_info(&self) -> Result<DeviceInfo> {
        self.run(|link| async move { link.get_info().await }).await
    }

    pub async fn list_images(&self) -> Result<Vec<String>> {
        self.run(|link| async move { link.list_images().await }).await
    }

    pub async fn get_settings(&self) -> Result<DeviceSettings> {
        self.run(|link| async move { link.get_settings().await }).await
    }

    pub async fn display_image(&self, name: &str) -> Result<()> {
        let name = upload::check_name(name)?;
        self.run(|link| async move { link.ok(Opcode::DisplayImage, Some(&name)).await })
            .await
    }

    pub async fn next_image(&self) -> Result<()> {
        self.run(|link| async move { link.ok(Opcode::NextImage, None).await }).await
    }

    pub async fn prev_image(&self) -> Result<()> {
        self.run(|link| async move { link.ok(Opcode::PrevImage, None).await }).await
    }

    pub async fn delete_image(&self, name: &str) -> Result<()> {
        let name = upload::check_name(name)?;
        self.run(|link| async move {
            link.ok(Opcode::DeleteImage, Some(&name)).await?;
            link.update_state(|s| s.images.retain(|n| *n != name));
            Ok::<_, FrameError>(())
        })
        .await
    }

    pub async fn delete_all(&self) -> Result<()> {
        self.run(|link| async move {
            link.ok(Opcode::DeleteAll, None).await?;
            link.update_state(|s| s.images.clear());
            Ok::<_, FrameError>(())
        })
        .await
    }

    pub async fn set_slideshow(&self, enabled: bool) -> Result<()> {
        self.run(move |link| async move {
            link.ok(Opcode::SetSlideshow, Some(if enabled { "1" } else { "0" }))
                .await?;
            link.update_state(|s| {
                if let Some(settings) = s.settings.as_mut() {
                    settings.slideshow_enabled = enabled;
                }
            });
            Ok::<_, FrameError>(())
        })
        .await
    }

    pub async fn set_interval(&self, minutes: u32) -> Result<()> {
        self.run(move |link| async move {
            link.ok(Opcode::SetInterval, Some(&minutes.to_string())).await?;
            link.update_state(|s| {
                if let Some(settings) = s.settings.as_mut() {
                    settings.interval_minutes = minutes;
                }
            });
            Ok::<_, FrameError>(())
        })
        .await
    }

    pub async fn restart(&self) -> Result<()> {
        self.run(|link| async move { link.ok(Opcode::Restart, None).await }).await
    }

    pub async fn sleep_now(&self) -> Result<()> {
        self.run(|link| async move { link.ok(Opcode::SleepNow, None).await }).await
    }

    /// Asks the device to drop any partial upload.
    pub async fn cancel_upload(&self) -> Result<()> {
        self.run(|link| async move { link.ok(Opcode::CancelUpload, None).await })
            .await
    }

    /// Uploads a packed image as one queued operation.
    ///
    /// `progress` sees every phase change and every acknowledged chunk.
    pub async fn upload<P>(&self, request: UploadRequest, mut progress: P) -> Result<()>
    where
        P: FnMut(UploadProgress) + Send + 'static,
    {
        self.run(move |link| async move { upload::run(&link, request, &mut progress).await })
            .await
    }
}

impl Drop for FrameSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
