//! In-memory stand-in for a BLE photo frame.

#![allow(dead_code)]

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use epaper_frame::{FrameError, FrameSession, LinkEvent, Opcode, Result, Transport};
use tokio::sync::mpsc;

pub const INFO_JSON: &str = r#"{"totalBytes":1048576,"usedBytes":96000,"freeBytes":952576,"imageCount":2,"maxImages":20,"width":800,"height":480}"#;
pub const SETTINGS_JSON: &str =
    r#"{"slideshowEnabled":"1","intervalMinutes":30,"randomOrder":0,"currentImageName":"beach.bin"}"#;

#[derive(Default)]
pub struct FakeState {
    /// Every command frame written, in order.
    pub commands: Vec<Vec<u8>>,
    /// Chunks the frame acknowledged.
    pub chunks: Vec<Vec<u8>>,
    pub chunk_attempts: usize,
    /// chunk index -> failures still to inject
    chunk_failures: HashMap<usize, u32>,
    /// opcode -> times to ignore the command
    silent: HashMap<u8, u32>,
    /// opcode -> frames to answer with next time
    scripted: HashMap<u8, Vec<Vec<u8>>>,
    failing_writes: HashMap<u8, u32>,
    /// opcode -> writes that never get acknowledged
    hanging_writes: HashMap<u8, u32>,
}

pub struct FakeFrame {
    events: mpsc::UnboundedSender<LinkEvent>,
    pub state: Mutex<FakeState>,
}

fn with_code(code: u8, text: &str) -> Vec<u8> {
    let mut out = vec![code];
    out.extend_from_slice(text.as_bytes());
    out
}

impl FakeFrame {
    /// A healthy frame holding two images, plus a session connected to it.
    pub fn connect() -> (Arc<FakeFrame>, FrameSession) {
        let (tx, rx) = mpsc::unbounded_channel();
        let fake = Arc::new(FakeFrame {
            events: tx,
            state: Mutex::new(FakeState::default()),
        });
        let session = FrameSession::new(fake.clone(), rx);
        (fake, session)
    }

    fn default_reply(opcode: u8) -> Vec<Vec<u8>> {
        let frame = match opcode {
            0x01 => with_code(0x02, INFO_JSON),
            0x02 => with_code(0x03, "beach.bin\nkids.bin\n"),
            0x20 => with_code(0x04, SETTINGS_JSON),
            _ => vec![0x00],
        };
        vec![frame]
    }

    /// Next time `opcode` is written, answer with exactly these frames.
    pub fn script(&self, opcode: Opcode, frames: Vec<Vec<u8>>) {
        self.state.lock().unwrap().scripted.insert(opcode.byte(), frames);
    }

    pub fn stay_silent(&self, opcode: Opcode, times: u32) {
        self.state.lock().unwrap().silent.insert(opcode.byte(), times);
    }

    pub fn fail_command_write(&self, opcode: Opcode, times: u32) {
        self.state.lock().unwrap().failing_writes.insert(opcode.byte(), times);
    }

    /// The next `times` writes of `opcode` never complete.
    pub fn hang_command_write(&self, opcode: Opcode, times: u32) {
        self.state.lock().unwrap().hanging_writes.insert(opcode.byte(), times);
    }

    pub fn fail_chunk(&self, index: usize, times: u32) {
        self.state.lock().unwrap().chunk_failures.insert(index, times);
    }

    pub fn push(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    pub fn opcodes(&self) -> Vec<u8> {
        self.state.lock().unwrap().commands.iter().map(|c| c[0]).collect()
    }

    pub fn commands(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn chunks(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().chunks.clone()
    }

    pub fn chunk_attempts(&self) -> usize {
        self.state.lock().unwrap().chunk_attempts
    }

    pub fn count(&self, opcode: Opcode) -> usize {
        self.opcodes().iter().filter(|&&op| op == opcode.byte()).count()
    }
}

fn take_one<K: Hash + Eq>(map: &mut HashMap<K, u32>, key: K) -> bool {
    match map.get_mut(&key) {
        Some(n) if *n > 0 => {
            *n -= 1;
            true
        }
        _ => false,
    }
}

#[async_trait]
impl Transport for FakeFrame {
    async fn write_command(&self, frame: &[u8]) -> Result<()> {
        let replies = {
            let mut state = self.state.lock().unwrap();
            let opcode = frame[0];
            if take_one(&mut state.failing_writes, opcode) {
                return Err(FrameError::transport("gatt write rejected"));
            }
            state.commands.push(frame.to_vec());
            if take_one(&mut state.hanging_writes, opcode) {
                None
            } else if take_one(&mut state.silent, opcode) {
                Some(Vec::new())
            } else {
                Some(
                    state
                        .scripted
                        .remove(&opcode)
                        .unwrap_or_else(|| Self::default_reply(opcode)),
                )
            }
        };
        let Some(replies) = replies else {
            return std::future::pending().await;
        };
        for reply in replies {
            let _ = self.events.send(LinkEvent::Frame(reply));
        }
        Ok(())
    }

    async fn write_chunk(&self, chunk: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.chunk_attempts += 1;
        let index = state.chunks.len();
        if take_one(&mut state.chunk_failures, index) {
            return Err(FrameError::transport("gatt busy"));
        }
        state.chunks.push(chunk.to_vec());
        Ok(())
    }
}
