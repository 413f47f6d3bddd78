//! The OTA flasher: the chunked firmware transfer state machine,
//! gated by the session's exclusive ownership lock.
//!
//! ```text
//! UpdateBegin ──> UpdateReady ──> Chunk/ChunkReceived ... ──> UpdateDone
//!                                    │  crc mismatch or
//!                                    │  timeout: retransmit
//!                                    └─ (bounded)
//! ```
//!
//! While the transfer runs, no other caller can emit frames; inbound
//! routing keeps running so chunk acks reach the flasher's listeners.

use std::sync::atomic::{AtomicU64, Ordering};

use super::{DeviceSession, SendAuth, SendOutcome, SessionEvent};
use crate::config::FlashConfig;
use crate::error::{CoreError, Result};
use crate::messages::{MessageName, Params};

/// Default target store for firmware binaries.
pub const FIRMWARE_STORE: &str = "firmware";

static FLASHER_IDS: AtomicU64 = AtomicU64::new(1);

/// Where the binary lands on the device.
#[derive(Debug, Clone)]
pub struct FlashOptions {
    pub store: String,
    pub address: String,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            store: FIRMWARE_STORE.to_string(),
            address: "0x0".to_string(),
        }
    }
}

impl DeviceSession {
    /// Stream a firmware binary to the device.
    ///
    /// Fails immediately with `FlashInProgress` if another transfer
    /// holds the lock. Emits `FlashStarted` once, then `FlashSuccess`
    /// or `FlashFailed`, and always releases the lock.
    pub async fn flash(&self, binary: &[u8], options: FlashOptions) -> Result<()> {
        let holder = FLASHER_IDS.fetch_add(1, Ordering::Relaxed);
        if !self.take_ownership(holder).await {
            return Err(CoreError::FlashInProgress);
        }

        tracing::info!(
            connection_key = %self.connection_key(),
            size = binary.len(),
            store = %options.store,
            "flash starting"
        );
        self.bus().emit_lifecycle(SessionEvent::FlashStarted);

        let result = self.run_flash(holder, binary, &options).await;
        self.release_ownership(holder).await;

        match result {
            Ok(()) => {
                tracing::info!(connection_key = %self.connection_key(), "flash complete");
                self.bus().emit_lifecycle(SessionEvent::FlashSuccess);
                Ok(())
            }
            Err(err) => {
                let failure = match err {
                    CoreError::Flash(_) => err,
                    other => CoreError::Flash(other.to_string()),
                };
                tracing::warn!(connection_key = %self.connection_key(), "{failure}");
                self.bus()
                    .emit_lifecycle(SessionEvent::FlashFailed(failure.to_string()));
                Err(failure)
            }
        }
    }

    async fn run_flash(&self, holder: u64, binary: &[u8], options: &FlashOptions) -> Result<()> {
        let config = self.config().flash.clone();
        let (reported_max, reported_chunk) = self.reported_limits().await;

        let max_binary = reported_max.map_or(config.max_binary_size, |reported| {
            reported.min(config.max_binary_size)
        });
        if binary.is_empty() {
            return Err(CoreError::Flash("empty binary".to_string()));
        }
        if binary.len() > max_binary {
            return Err(CoreError::Flash(format!(
                "binary is {} bytes, device limit is {max_binary}",
                binary.len()
            )));
        }

        let chunk_size = reported_chunk
            .map_or(config.chunk_size, |reported| reported.min(config.chunk_size))
            .max(1);

        let response_timeout = self.config().protocol.listener_timeout();

        let begin = serde_json::json!({
            "store": options.store,
            "address": options.address,
            "size": binary.len(),
            "chunkSize": chunk_size,
        });
        self.flash_request(
            holder,
            MessageName::UpdateBegin,
            &Params::new(),
            begin.to_string().as_bytes(),
            response_timeout,
        )
        .await
        .map_err(|err| CoreError::Flash(format!("device not ready: {err}")))?;

        for (index, chunk) in binary.chunks(chunk_size).enumerate() {
            self.send_chunk(holder, index, chunk, &config).await?;
        }

        self.flash_request(
            holder,
            MessageName::UpdateDone,
            &Params::new(),
            &[],
            response_timeout,
        )
        .await
        .map_err(|err| CoreError::Flash(format!("no terminal ack: {err}")))?;

        Ok(())
    }

    /// Send one chunk and wait for a CRC-matching ack, retransmitting
    /// the same chunk on mismatch or timeout up to the retry bound.
    async fn send_chunk(
        &self,
        holder: u64,
        index: usize,
        chunk: &[u8],
        config: &FlashConfig,
    ) -> Result<()> {
        let crc = crc32fast::hash(chunk);
        let mut attempts = 0u32;

        loop {
            let params = Params::new().with_field("crc", format!("{crc:08x}"));

            match self
                .flash_request(
                    holder,
                    MessageName::Chunk,
                    &params,
                    chunk,
                    config.chunk_ack_timeout(),
                )
                .await
            {
                Ok(reply) => {
                    let device_crc = reply
                        .payload
                        .get(..4)
                        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]));
                    if device_crc == Some(crc) {
                        return Ok(());
                    }
                    tracing::warn!(
                        connection_key = %self.connection_key(),
                        chunk = index,
                        expected = %format!("{crc:08x}"),
                        got = ?device_crc.map(|c| format!("{c:08x}")),
                        "chunk crc mismatch, retransmitting"
                    );
                }
                Err(CoreError::Timeout) => {
                    tracing::warn!(
                        connection_key = %self.connection_key(),
                        chunk = index,
                        "chunk ack timed out, retransmitting"
                    );
                }
                Err(err) => return Err(CoreError::Flash(err.to_string())),
            }

            attempts += 1;
            if attempts > config.chunk_retry_limit {
                return Err(CoreError::Flash(format!(
                    "chunk {index} failed after {attempts} attempts"
                )));
            }
        }
    }

    /// Send one transfer frame and await its response, with the waiter
    /// registered before the frame leaves.
    async fn flash_request(
        &self,
        holder: u64,
        name: MessageName,
        params: &Params,
        payload: &[u8],
        timeout: std::time::Duration,
    ) -> Result<crate::coap::Message> {
        let result = self
            .send_listening(name, params, payload, SendAuth::Flasher(holder), 1)
            .await?;
        if result.outcome == SendOutcome::Refused {
            return Err(CoreError::Flash(
                "session refused the transfer frame".to_string(),
            ));
        }
        let handle = result
            .handles
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::Protocol(format!("{name} has no response type")))?;
        self.bus().wait(handle, timeout).await
    }
}
