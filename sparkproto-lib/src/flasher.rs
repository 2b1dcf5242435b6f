//! OTA firmware transfer over an established session.
//!
//! Stages run `Prepare -> BeginUpdate -> SendFile -> Teardown -> Done`; any
//! of them can end in `Failed`. The flasher owns the session for the whole
//! transfer, so nothing else can write to the device meanwhile.
//!
//! Two transfer modes exist. Legacy firmware acks every chunk and the
//! flasher waits for each ack in turn, resending on a CRC mismatch. Firmware
//! that answers `UpdateReady` with a non-zero version gets every chunk back
//! to back, then asks for whatever it missed with `ChunkMissed`.

use crate::config::FlashConfig;
use crate::constants::FLAG_FAST_OTA;
use crate::device::{DeviceSession, OwnerId, Request, Subscription};
use crate::error::ProtocolError;
use crate::message::MessageName;
use crate::packet::Message;
use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use std::io::{Cursor, Read};
use std::sync::Arc;
use strum_macros::Display;
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum FlashStage {
    Prepare,
    BeginUpdate,
    SendFile,
    Teardown,
    Done,
    Failed,
}

/// Progress of one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashSession {
    pub stage: FlashStage,
    pub chunk_index: usize,
    pub chunk_size: usize,
    pub last_crc: u32,
    /// Missed-chunk reports so far. Starts at minus the chunk count in fast
    /// mode so every chunk may be re-requested once.
    pub missed_chunks: i64,
    /// Version from `UpdateReady`. 0 is legacy lockstep.
    pub protocol_version: u8,
}

/// Firmware image read chunk by chunk, seekable for resends.
struct FirmwareStream {
    cursor: Cursor<Bytes>,
    chunk_size: usize,
}

impl FirmwareStream {
    fn new(binary: Bytes, chunk_size: usize) -> Self {
        Self {
            cursor: Cursor::new(binary),
            chunk_size,
        }
    }

    fn len(&self) -> usize {
        self.cursor.get_ref().len()
    }

    fn chunk_count(&self) -> usize {
        self.len().div_ceil(self.chunk_size)
    }

    /// Next chunk, zero-padded to full size. Firmware mis-parses short chunks.
    fn read_chunk(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        let mut buf = vec![0u8; self.chunk_size];
        let read = self.cursor.read(&mut buf)?;
        Ok((read > 0).then(|| Bytes::from(buf)))
    }

    /// Re-read the chunk at `index`, leaving the sequential position alone.
    fn chunk_at(&mut self, index: usize) -> Result<Bytes, ProtocolError> {
        let offset = index * self.chunk_size;
        if offset >= self.len() {
            return Err(ProtocolError::Flash(format!("device asked for chunk {index} past the end")));
        }
        let resume = self.cursor.position();
        self.cursor.set_position(offset as u64);
        let chunk = self.read_chunk();
        self.cursor.set_position(resume);
        chunk?.ok_or_else(|| ProtocolError::Flash(format!("chunk {index} is empty")))
    }
}

/// Releases session ownership when the transfer ends, however it ends.
struct OwnershipGuard {
    session: Arc<DeviceSession>,
    owner: OwnerId,
}

impl Drop for OwnershipGuard {
    fn drop(&mut self) {
        self.session.release_ownership(self.owner);
    }
}

/// `[u8 flags][u16 chunk size][u32 file size][u8 dest flag][u32 dest addr]`
pub fn update_begin_payload(flags: u8, chunk_size: u16, file_size: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(12);
    buf.put_u8(flags);
    buf.put_u16(chunk_size);
    buf.put_u32(file_size);
    buf.put_u8(0);
    buf.put_u32(0);
    buf.freeze()
}

/// Chunk indices travel as a `u16` query option.
fn index_option(index: usize) -> Result<[u8; 2], ProtocolError> {
    u16::try_from(index)
        .map(u16::to_be_bytes)
        .map_err(|_| ProtocolError::Flash(format!("chunk index {index} does not fit in 16 bits")))
}

pub struct FirmwareFlasher {
    session: Arc<DeviceSession>,
    config: FlashConfig,
    owner: OwnerId,
    progress: FlashSession,
}

impl FirmwareFlasher {
    pub fn new(session: Arc<DeviceSession>, config: FlashConfig) -> Self {
        let chunk_size = config.effective_chunk_size();
        Self {
            session,
            config,
            owner: OwnerId::new(),
            progress: FlashSession {
                stage: FlashStage::Prepare,
                chunk_index: 0,
                chunk_size,
                last_crc: 0,
                missed_chunks: 0,
                protocol_version: 0,
            },
        }
    }

    pub fn progress(&self) -> &FlashSession {
        &self.progress
    }

    fn set_stage(&mut self, stage: FlashStage) {
        debug!(
            device_id = %self.session.device_id(),
            "Flash stage {} -> {}",
            self.progress.stage,
            stage
        );
        self.progress.stage = stage;
    }

    /// Run the whole transfer.
    pub async fn run(mut self, binary: Bytes) -> Result<(), ProtocolError> {
        let result = self.transfer(binary).await;
        // Ownership and listeners were released as transfer() unwound.
        match &result {
            Ok(()) => self.set_stage(FlashStage::Done),
            Err(_) => self.set_stage(FlashStage::Failed),
        }
        result
    }

    async fn transfer(&mut self, binary: Bytes) -> Result<(), ProtocolError> {
        if binary.is_empty() {
            return Err(ProtocolError::Flash("binary is empty".to_string()));
        }
        if binary.len() > self.config.max_binary_size {
            return Err(ProtocolError::Flash(format!(
                "binary is too large: {} bytes, limit {}",
                binary.len(),
                self.config.max_binary_size
            )));
        }
        let file_size = u32::try_from(binary.len())
            .map_err(|_| ProtocolError::Flash(format!("binary is too large: {} bytes", binary.len())))?;
        let chunk_count = binary.len().div_ceil(self.progress.chunk_size);
        if chunk_count > usize::from(u16::MAX) + 1 {
            return Err(ProtocolError::Flash(format!(
                "binary is too large: {chunk_count} chunks of {} bytes",
                self.progress.chunk_size
            )));
        }

        self.session.take_ownership(self.owner)?;
        let _guard = OwnershipGuard {
            session: Arc::clone(&self.session),
            owner: self.owner,
        };
        // Listen before UpdateBegin so a report during the handshake is kept.
        let mut missed = self.session.listen(&[MessageName::ChunkMissed], None, None)?;
        let mut file = FirmwareStream::new(binary, self.progress.chunk_size);

        self.set_stage(FlashStage::BeginUpdate);
        self.progress.protocol_version = self.begin_update(file_size).await?;

        self.set_stage(FlashStage::SendFile);
        if self.progress.protocol_version > 0 {
            info!(
                device_id = %self.session.device_id(),
                "Fast OTA v{}, {} chunks",
                self.progress.protocol_version,
                file.chunk_count()
            );
            self.send_file_fast(&mut file, &mut missed).await?;
        } else {
            info!(device_id = %self.session.device_id(), "Legacy OTA, {} chunks", file.chunk_count());
            let ceiling = self.config.send_timeout;
            timeout(ceiling, self.send_file_legacy(&mut file, &mut missed))
                .await
                .map_err(|_| ProtocolError::Flash(format!("timed out sending file after {ceiling:?}")))??;
        }

        self.set_stage(FlashStage::Teardown);
        Ok(())
    }

    /// Send `UpdateBegin` until the device is ready. Returns its protocol version.
    async fn begin_update(&mut self, file_size: u32) -> Result<u8, ProtocolError> {
        let flags = if self.config.fast_ota { FLAG_FAST_OTA } else { 0 };
        let chunk_size = u16::try_from(self.progress.chunk_size)
            .map_err(|_| ProtocolError::Flash(format!("chunk size {} is too large", self.progress.chunk_size)))?;
        let payload = update_begin_payload(flags, chunk_size, file_size);
        let request = Request::new().payload(payload).owner(self.owner);

        let retries = self.config.begin_retries;
        for attempt in 0..=retries {
            let wait = if attempt < retries {
                self.config.begin_retry_interval
            } else {
                self.config.begin_final_timeout
            };
            let mut pending = self.session.request(MessageName::UpdateBegin, &request)?;
            match pending.recv_timeout(wait).await {
                Ok(reply) if reply.is_success() => return Ok(reply.payload.first().copied().unwrap_or(0)),
                Ok(reply) => {
                    let reason = if reply.payload.is_empty() {
                        format!("code {:#04x}", reply.code)
                    } else {
                        String::from_utf8_lossy(&reply.payload).into_owned()
                    };
                    return Err(ProtocolError::Flash(format!("device aborted update: {reason}")));
                }
                Err(ProtocolError::Timeout(_)) => {
                    debug!(
                        device_id = %self.session.device_id(),
                        "No UpdateReady after attempt {}",
                        attempt + 1
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Err(ProtocolError::Flash("out of retries".to_string()))
    }

    async fn send_file_legacy(
        &mut self,
        file: &mut FirmwareStream,
        missed: &mut Subscription,
    ) -> Result<(), ProtocolError> {
        while let Some(chunk) = file.read_chunk()? {
            loop {
                while let Some(report) = missed.try_recv() {
                    self.handle_missed(&report, file, false)?;
                }

                let request = self.chunk_request(&chunk, None)?;
                let mut pending = self.session.request(MessageName::Chunk, &request)?;
                match pending.recv_timeout(self.config.chunk_ack_timeout).await {
                    Ok(ack) if ack.is_success() => break,
                    Ok(ack) => warn!(
                        device_id = %self.session.device_id(),
                        "Chunk {} rejected with {:#04x}, resending",
                        self.progress.chunk_index,
                        ack.code
                    ),
                    Err(ProtocolError::Timeout(_)) => debug!(
                        device_id = %self.session.device_id(),
                        "No ack for chunk {}, resending",
                        self.progress.chunk_index
                    ),
                    Err(e) => return Err(e),
                }
            }
            self.progress.chunk_index += 1;
        }

        self.send_update_done()
    }

    async fn send_file_fast(&mut self, file: &mut FirmwareStream, missed: &mut Subscription) -> Result<(), ProtocolError> {
        self.progress.missed_chunks = -(file.chunk_count() as i64);

        while let Some(chunk) = file.read_chunk()? {
            let request = self.chunk_request(&chunk, Some(self.progress.chunk_index))?;
            self.session.send_message(MessageName::Chunk, &request)?;
            self.progress.chunk_index += 1;
        }
        self.send_update_done()?;

        // The window restarts after every report.
        loop {
            match missed.recv_timeout(self.config.missed_chunk_window).await {
                Ok(report) => self.handle_missed(&report, file, true)?,
                Err(ProtocolError::Timeout(_)) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    fn chunk_request(&mut self, chunk: &Bytes, index: Option<usize>) -> Result<Request, ProtocolError> {
        let crc = crc32fast::hash(chunk);
        self.progress.last_crc = crc;
        let mut request = Request::new()
            .param("crc", crc.to_be_bytes())
            .payload(chunk.clone())
            .owner(self.owner);
        if let Some(index) = index {
            request = request.param("index", index_option(index)?);
        }
        Ok(request)
    }

    fn send_update_done(&self) -> Result<(), ProtocolError> {
        self.session
            .send_message(MessageName::UpdateDone, &Request::new().owner(self.owner))
            .map(|_| ())
    }

    /// Acknowledge a missed-chunk report and resend what it lists.
    fn handle_missed(&mut self, report: &Message, file: &mut FirmwareStream, fast: bool) -> Result<(), ProtocolError> {
        // Ack first so the device's retry timer stops.
        self.session.send_reply(
            MessageName::ChunkMissedAck,
            report.id,
            report.token,
            None,
            Some(self.owner),
        )?;

        for raw in report.payload.chunks_exact(2) {
            let index = BigEndian::read_u16(raw) as usize;
            self.progress.missed_chunks += 1;
            if self.progress.missed_chunks > self.config.missed_chunk_slack {
                warn!(
                    device_id = %self.session.device_id(),
                    "Too many missed chunks ({})",
                    self.progress.missed_chunks
                );
                return Err(ProtocolError::Flash("core over limit, killing".to_string()));
            }
            debug!(device_id = %self.session.device_id(), "Resending missed chunk {}", index);
            let chunk = file.chunk_at(index)?;
            let request = self.chunk_request(&chunk, fast.then_some(index))?;
            self.session.send_message(MessageName::Chunk, &request)?;
        }
        Ok(())
    }
}
