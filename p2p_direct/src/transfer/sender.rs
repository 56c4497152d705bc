use crate::config::TransferConfig;
use crate::error::{FailureKind, TransferError};
use crate::events::{EventBus, TransferEvent, TransferFailure};
use crate::{Direction, FileStatus, TransferManifest};
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::hash::{Blake3Digest, DigestProvider};
use super::protocol::{
    CancelNotice, ChunkHeader, ControlMessage, FileEnd, FileStart, WireMessage, encode_control,
};
use super::session::{SessionSummary, TransferSession};
use super::source::SourceFile;
use super::transport::MessageTransport;
use super::utils::format_transfer_speed;

/// Per-batch options chosen by the caller.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Advertised in the manifest. Payload encryption itself is the transport's job.
    pub encryption: bool,
    /// Required when `encryption` is set. Never sent to the peer.
    pub encryption_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    Sent,
    Cancelled,
}

/// Cooperative cancellation shared between an engine and its observers.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    session: CancellationToken,
    files: Arc<RwLock<HashSet<u32>>>,
}

impl CancelHandle {
    /// Cancel the whole session
    pub fn cancel(&self) {
        self.session.cancel();
    }

    /// Cancel one file. The rest of the batch continues.
    pub fn cancel_file(&self, file_id: u32) {
        self.files
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(file_id);
    }

    pub fn is_cancelled(&self) -> bool {
        self.session.is_cancelled()
    }

    pub fn is_file_cancelled(&self, file_id: u32) -> bool {
        self.files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&file_id)
    }
}

/// Streams a batch of files over a message transport.
///
/// One engine drives one session. Chunk emission is sequential, and every
/// outbound frame waits until the transport buffer is below the high-water mark.
pub struct SenderEngine {
    config: TransferConfig,
    digest: Arc<dyn DigestProvider>,
    events: EventBus,
    cancel: CancelHandle,
    session: Option<TransferSession>,
    current: Option<u32>,
}

impl SenderEngine {
    pub fn new(config: TransferConfig) -> Self {
        Self::with_digest(config, Arc::new(Blake3Digest))
    }

    pub fn with_digest(config: TransferConfig, digest: Arc<dyn DigestProvider>) -> Self {
        Self {
            config: config.clamped(),
            digest,
            events: EventBus::new(),
            cancel: CancelHandle::default(),
            session: None,
            current: None,
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn session(&self) -> Option<&TransferSession> {
        self.session.as_ref()
    }

    /// Send `files` as one session: manifest, each file in order, then `complete`.
    ///
    /// Emits a terminal `Complete` event on success and a fatal `Error` event otherwise.
    pub async fn send_batch<T: MessageTransport>(
        &mut self,
        files: Vec<SourceFile>,
        transport: &T,
        options: SendOptions,
    ) -> Result<SessionSummary, TransferError> {
        match self.run_batch(files, transport, options).await {
            Ok(summary) => {
                info!(
                    "Session {} complete: {} files, {} bytes in {:.2}s",
                    summary.session_id,
                    summary.files.len(),
                    summary.bytes_moved,
                    summary.elapsed.as_secs_f64()
                );
                self.events.emit(&TransferEvent::Complete(summary.clone()));
                Ok(summary)
            }
            Err(e) => {
                if let Some(session) = self.session.as_mut() {
                    session.fail_in_flight(e.kind());
                }
                if matches!(e, TransferError::Cancelled) {
                    info!("Send session cancelled");
                    self.notify_session_cancel(transport, "cancelled by sender").await;
                } else {
                    error!("Send session failed: {}", e);
                }
                self.events.emit(&TransferEvent::Error(TransferFailure {
                    direction: Direction::Sending,
                    file_id: e.file_id().or(self.current),
                    kind: e.kind(),
                    message: e.to_string(),
                    fatal: true,
                }));
                Err(e)
            }
        }
    }

    async fn run_batch<T: MessageTransport>(
        &mut self,
        files: Vec<SourceFile>,
        transport: &T,
        options: SendOptions,
    ) -> Result<SessionSummary, TransferError> {
        if files.is_empty() {
            return Err(TransferError::InvalidBatch("no files to send".into()));
        }
        if options.encryption && options.encryption_key.is_none() {
            return Err(TransferError::InvalidBatch(
                "encryption requested without a key".into(),
            ));
        }
        if !transport.is_open() {
            return Err(TransferError::TransportClosed);
        }
        let count = u32::try_from(files.len())
            .map_err(|_| TransferError::InvalidBatch("too many files".into()))?;

        let descriptors = (0..count)
            .zip(&files)
            .map(|(id, file)| file.descriptor(id))
            .collect();
        let manifest = TransferManifest::new(descriptors, options.encryption, self.digest.name());
        info!(
            "Starting session {}: {} files, {} bytes, chunk size {}",
            manifest.session_id,
            manifest.files.len(),
            manifest.total_size,
            self.config.chunk_size
        );
        if options.encryption {
            debug!("Encryption requested; payload protection is left to the transport");
        }

        self.session = Some(TransferSession::new(manifest.clone(), Direction::Sending));
        self.send_control(transport, &ControlMessage::Manifest(manifest))
            .await?;

        for (id, file) in (0..count).zip(&files) {
            self.send_file(file, id, transport).await?;
        }

        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        self.send_control(transport, &ControlMessage::Complete)
            .await?;

        self.session
            .as_ref()
            .map(TransferSession::summary)
            .ok_or(TransferError::NoActiveSession)
    }

    /// Stream one file of the active session: `file-start`, chunks, `file-end`.
    pub async fn send_file<T: MessageTransport>(
        &mut self,
        file: &SourceFile,
        file_id: u32,
        transport: &T,
    ) -> Result<FileOutcome, TransferError> {
        if self.session.is_none() {
            return Err(TransferError::NoActiveSession);
        }
        if self.check_cancelled(file_id)? {
            return self.cancel_file(transport, file_id).await;
        }

        let digest = file.digest(self.digest.as_ref()).await?;
        let session = self.session_mut()?;
        let state = session.state_mut(file_id).ok_or_else(|| {
            TransferError::InvalidBatch(format!("file {} is not in the manifest", file_id))
        })?;
        state.activate();
        state.digest = digest.clone();
        self.current = Some(file_id);

        debug!("Sending file {}: {} ({} bytes)", file_id, file.name(), file.size());
        self.events.emit(&TransferEvent::FileStarted {
            direction: Direction::Sending,
            file_id,
            name: file.name().to_string(),
            size: file.size(),
        });
        self.send_control(
            transport,
            &ControlMessage::FileStart(FileStart {
                file_id,
                name: file.name().to_string(),
                size: file.size(),
                media_type: file.media_type().to_string(),
                digest: digest.clone(),
            }),
        )
        .await?;

        let mut reader = file.open().await?;
        let mut buf = vec![0u8; self.config.chunk_size];
        let mut offset: u64 = 0;

        while offset < file.size() {
            self.wait_for_drain(transport).await?;
            if self.check_cancelled(file_id)? {
                return self.cancel_file(transport, file_id).await;
            }

            let want = (file.size() - offset).min(buf.len() as u64) as usize;
            let n = reader.read_chunk(&mut buf[..want]).await?;
            if n == 0 {
                return Err(TransferError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("{} shrank while being sent", file.name()),
                )));
            }

            let header = ChunkHeader {
                file_id,
                offset,
                length: n as u32,
            };
            // Header and payload go out back to back
            transport
                .send(WireMessage::Text(encode_control(&ControlMessage::Chunk(
                    header,
                ))?))
                .await?;
            transport
                .send(WireMessage::Binary(Bytes::copy_from_slice(&buf[..n])))
                .await?;
            offset += n as u64;

            if let Some(update) = self.session_mut()?.record_progress(file_id, n as u64) {
                self.events.emit(&TransferEvent::Progress(update));
            }
        }

        self.send_control(
            transport,
            &ControlMessage::FileEnd(FileEnd {
                file_id,
                digest: digest.clone(),
            }),
        )
        .await?;

        let session = self.session_mut()?;
        if let Some(state) = session.state_mut(file_id) {
            state.status = FileStatus::Complete;
            let elapsed = state
                .started_at
                .map_or(0.0, |started| started.elapsed().as_secs_f64());
            debug!(
                "File {} sent: {} bytes, {}",
                file_id,
                state.bytes_moved,
                format_transfer_speed(state.bytes_moved, elapsed)
            );
        }
        self.current = None;
        self.events.emit(&TransferEvent::FileFinished {
            direction: Direction::Sending,
            file_id,
            digest,
            verified: true,
            artifact: None,
        });
        Ok(FileOutcome::Sent)
    }

    fn session_mut(&mut self) -> Result<&mut TransferSession, TransferError> {
        self.session.as_mut().ok_or(TransferError::NoActiveSession)
    }

    /// `Err(Cancelled)` for a session cancel, `Ok(true)` when only this file is cancelled
    fn check_cancelled(&self, file_id: u32) -> Result<bool, TransferError> {
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        Ok(self.cancel.is_file_cancelled(file_id))
    }

    /// Drop a cancelled file from the session and tell the receiver.
    ///
    /// The notice waits for the buffer to drain like any other control frame:
    /// the receiver cannot settle the file without it.
    async fn cancel_file<T: MessageTransport>(
        &mut self,
        transport: &T,
        file_id: u32,
    ) -> Result<FileOutcome, TransferError> {
        info!("File {} cancelled", file_id);
        self.current = None;
        if let Some(session) = self.session.as_mut() {
            session.remove(file_id);
        }
        self.send_control(
            transport,
            &ControlMessage::Cancel(CancelNotice {
                file_id: Some(file_id),
                reason: "cancelled by sender".to_string(),
            }),
        )
        .await?;
        self.events.emit(&TransferEvent::Error(TransferFailure {
            direction: Direction::Sending,
            file_id: Some(file_id),
            kind: FailureKind::Cancelled,
            message: format!("file {} cancelled", file_id),
            fatal: false,
        }));
        Ok(FileOutcome::Cancelled)
    }

    /// Best-effort session cancel notice. Skipped when the transport is closed or still congested.
    async fn notify_session_cancel<T: MessageTransport>(&self, transport: &T, reason: &str) {
        if !transport.is_open() || transport.buffered_amount() > self.config.buffer_high_water_mark
        {
            return;
        }
        let notice = ControlMessage::Cancel(CancelNotice {
            file_id: None,
            reason: reason.to_string(),
        });
        match encode_control(&notice) {
            Ok(text) => {
                if let Err(e) = transport.send(WireMessage::Text(text)).await {
                    debug!("Cancel notice not delivered: {}", e);
                }
            }
            Err(e) => warn!("Failed to encode cancel notice: {}", e),
        }
    }

    async fn send_control<T: MessageTransport>(
        &self,
        transport: &T,
        message: &ControlMessage,
    ) -> Result<(), TransferError> {
        let text = encode_control(message)?;
        self.wait_for_drain(transport).await?;
        transport.send(WireMessage::Text(text)).await?;
        Ok(())
    }

    /// Suspend while the transport holds more than the high-water mark.
    async fn wait_for_drain<T: MessageTransport>(&self, transport: &T) -> Result<(), TransferError> {
        let mark = self.config.buffer_high_water_mark;
        let mut stalled = false;
        while transport.buffered_amount() > mark {
            if !transport.is_open() {
                return Err(TransferError::TransportClosed);
            }
            if !stalled {
                debug!(
                    "Backpressure: {} bytes buffered (mark {}), waiting",
                    transport.buffered_amount(),
                    mark
                );
                stalled = true;
            }
            tokio::select! {
                _ = self.cancel.session.cancelled() => return Err(TransferError::Cancelled),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        if stalled {
            debug!("Backpressure released");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::protocol::decode_control;
    use crate::transfer::transport::{InboundMessages, memory_channel};

    async fn drain(rx: &mut crate::transfer::MemoryInbound) -> Vec<WireMessage> {
        let mut out = Vec::new();
        while let Ok(Some(m)) =
            tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv()).await
        {
            out.push(m);
        }
        out
    }

    #[tokio::test]
    async fn test_empty_batch_rejected() {
        let (tx, _rx) = memory_channel();
        let mut engine = SenderEngine::new(TransferConfig::default());
        let err = engine
            .send_batch(Vec::new(), &tx, SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidBatch(_)));
    }

    #[tokio::test]
    async fn test_send_file_without_session() {
        let (tx, _rx) = memory_channel();
        let mut engine = SenderEngine::new(TransferConfig::default());
        let file = SourceFile::from_bytes("a.txt", &b"abc"[..]);
        assert!(matches!(
            engine.send_file(&file, 0, &tx).await,
            Err(TransferError::NoActiveSession)
        ));
    }

    #[tokio::test]
    async fn test_message_sequence_for_single_file() {
        let (tx, mut rx) = memory_channel();
        let config = TransferConfig::default().with_chunk_size(16 * 1024);
        let mut engine = SenderEngine::new(config);
        let data = vec![7u8; 40 * 1024];
        engine
            .send_batch(
                vec![SourceFile::from_bytes("x.bin", data)],
                &tx,
                SendOptions::default(),
            )
            .await
            .unwrap();

        let kinds: Vec<String> = drain(&mut rx)
            .await
            .into_iter()
            .map(|m| match m {
                WireMessage::Text(t) => decode_control(t.as_bytes()).unwrap().type_name().into(),
                WireMessage::Binary(b) => format!("payload:{}", b.len()),
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                "manifest",
                "file-start",
                "chunk",
                "payload:16384",
                "chunk",
                "payload:16384",
                "chunk",
                "payload:8192",
                "file-end",
                "complete",
            ]
        );
    }

    #[tokio::test]
    async fn test_encryption_requires_key() {
        let (tx, _rx) = memory_channel();
        let mut engine = SenderEngine::new(TransferConfig::default());
        let options = SendOptions {
            encryption: true,
            encryption_key: None,
        };
        let err = engine
            .send_batch(vec![SourceFile::from_bytes("a", &b"a"[..])], &tx, options)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidBatch(_)));
    }

    #[test]
    fn test_cancel_handle_is_shared() {
        let engine = SenderEngine::new(TransferConfig::default());
        let handle = engine.cancel_handle();
        handle.cancel_file(4);
        assert!(engine.cancel.is_file_cancelled(4));
        assert!(!engine.cancel.is_file_cancelled(5));
        handle.cancel();
        assert!(engine.cancel.is_cancelled());
    }
}
