use crate::adaptive::MAX_CHUNK_SIZE;
use crate::error::{FailureKind, TransferError};
use crate::events::{EventBus, TransferEvent, TransferFailure};
use crate::{Direction, FileStatus, TransferManifest};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::hash::{DigestProvider, IncrementalDigest, provider_for};
use super::protocol::{
    CancelNotice, ChunkHeader, ControlMessage, FileEnd, FileStart, WireMessage, decode_control,
};
use super::session::{SessionSummary, TransferSession};
use super::storage::StorageSink;
use super::transport::InboundMessages;
use super::utils::format_transfer_speed;

/// Where the receiver is in the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Idle,
    ManifestReceived,
    FileOpen(u32),
    FileClosed,
    SessionComplete,
    Failed,
}

/// Reassembly of the file currently open.
///
/// Payload is written to storage as it arrives. The digest is fed strictly in
/// offset order, so chunks arriving ahead of the next expected offset are held
/// back until the gap closes.
struct FileAssembly {
    file_id: u32,
    size: u64,
    expected_digest: String,
    hasher: Box<dyn IncrementalDigest>,
    next_offset: u64,
    held: BTreeMap<u64, Bytes>,
    failed: bool,
}

impl FileAssembly {
    fn accept(&mut self, offset: u64, bytes: Bytes) -> Result<(), String> {
        let end = offset + bytes.len() as u64;
        if offset < self.next_offset {
            return Err(format!(
                "chunk at offset {} overlaps bytes already received",
                offset
            ));
        }
        if let Some((prev, held)) = self.held.range(..=offset).next_back() {
            if prev + held.len() as u64 > offset {
                return Err(format!("chunk at offset {} overlaps a held chunk", offset));
            }
        }
        if let Some((next, _)) = self.held.range(offset..).next() {
            if *next < end {
                return Err(format!("chunk at offset {} overlaps a held chunk", offset));
            }
        }

        if offset > self.next_offset {
            self.held.insert(offset, bytes);
            return Ok(());
        }

        self.hasher.update(&bytes);
        self.next_offset = end;
        while let Some(entry) = self.held.first_entry() {
            if *entry.key() != self.next_offset {
                break;
            }
            let bytes = entry.remove();
            self.hasher.update(&bytes);
            self.next_offset += bytes.len() as u64;
        }
        Ok(())
    }

    fn is_covered(&self) -> bool {
        self.next_offset == self.size && self.held.is_empty()
    }
}

/// Reassembles an inbound session into a storage sink.
///
/// Messages are classified by state: with no chunk header pending everything
/// is decoded as control, otherwise the next frame is the chunk's payload.
pub struct ReceiverEngine<S: StorageSink> {
    storage: S,
    providers: Vec<Arc<dyn DigestProvider>>,
    events: EventBus,
    state: ReceiverState,
    session: Option<TransferSession>,
    pending_chunk: Option<ChunkHeader>,
    current: Option<FileAssembly>,
}

impl<S: StorageSink> ReceiverEngine<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            providers: Vec::new(),
            events: EventBus::new(),
            state: ReceiverState::Idle,
            session: None,
            pending_chunk: None,
            current: None,
        }
    }

    /// Register a digest provider. It takes precedence over a built-in one of the same name.
    pub fn with_digest_provider(mut self, provider: Arc<dyn DigestProvider>) -> Self {
        self.providers.insert(0, provider);
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    pub fn session(&self) -> Option<&TransferSession> {
        self.session.as_ref()
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn into_storage(self) -> S {
        self.storage
    }

    /// Drive the engine from an inbound stream until the session completes or fails.
    pub async fn run<I: InboundMessages>(
        &mut self,
        inbound: &mut I,
    ) -> Result<SessionSummary, TransferError> {
        loop {
            let Some(message) = inbound.recv().await else {
                return Err(self.fail(TransferError::TransportClosed).await);
            };
            if let Err(e) = self.handle_message(message).await {
                if self.state == ReceiverState::Failed {
                    return Err(e);
                }
            }
            if self.state == ReceiverState::SessionComplete {
                return self
                    .session
                    .as_ref()
                    .map(TransferSession::summary)
                    .ok_or(TransferError::NoActiveSession);
            }
        }
    }

    /// Feed one inbound message.
    ///
    /// Decode errors are recoverable: the message is dropped and the state is
    /// unchanged. Any other error leaves the engine in `Failed`.
    pub async fn handle_message(&mut self, message: WireMessage) -> Result<(), TransferError> {
        match self.state {
            ReceiverState::Failed => {
                return Err(TransferError::ProtocolViolation(
                    "session has already failed".into(),
                ));
            }
            ReceiverState::SessionComplete => {
                return Err(TransferError::ProtocolViolation(
                    "session is already complete".into(),
                ));
            }
            _ => {}
        }

        match self.process(message).await {
            Ok(()) => Ok(()),
            Err(TransferError::Decode(err)) => {
                warn!("Dropping malformed control message: {}", err);
                self.events.emit(&TransferEvent::Error(TransferFailure {
                    direction: Direction::Receiving,
                    file_id: None,
                    kind: FailureKind::Decode,
                    message: err.to_string(),
                    fatal: false,
                }));
                Err(TransferError::Decode(err))
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn process(&mut self, message: WireMessage) -> Result<(), TransferError> {
        if let Some(header) = self.pending_chunk.take() {
            let payload = match message {
                WireMessage::Binary(bytes) => bytes,
                WireMessage::Text(text) => {
                    if let Ok(control) = decode_control(text.as_bytes()) {
                        return Err(TransferError::ProtocolViolation(format!(
                            "{} message while payload for file {} was pending",
                            control.type_name(),
                            header.file_id
                        )));
                    }
                    Bytes::from(text.into_bytes())
                }
            };
            return self.on_payload(header, payload).await;
        }

        match decode_control(message.as_bytes())? {
            ControlMessage::Manifest(manifest) => self.on_manifest(manifest).await,
            ControlMessage::FileStart(start) => self.on_file_start(start),
            ControlMessage::Chunk(header) => self.on_chunk(header),
            ControlMessage::FileEnd(end) => self.on_file_end(end).await,
            ControlMessage::Complete => self.on_complete(),
            ControlMessage::Cancel(notice) => self.on_cancel(notice).await,
        }
    }

    async fn on_manifest(&mut self, manifest: TransferManifest) -> Result<(), TransferError> {
        if self.state != ReceiverState::Idle {
            return Err(TransferError::ProtocolViolation(
                "manifest received twice".into(),
            ));
        }
        manifest.validate()?;
        if self.begin_digest(&manifest.digest_algorithm).is_none() {
            return Err(TransferError::ProtocolViolation(format!(
                "unsupported digest algorithm '{}'",
                manifest.digest_algorithm
            )));
        }

        self.storage.prepare(&manifest).await?;
        info!(
            "Receiving session {}: {} files, {} bytes",
            manifest.session_id,
            manifest.files.len(),
            manifest.total_size
        );
        self.session = Some(TransferSession::new(manifest, Direction::Receiving));
        self.state = ReceiverState::ManifestReceived;
        Ok(())
    }

    fn on_file_start(&mut self, start: FileStart) -> Result<(), TransferError> {
        if !matches!(
            self.state,
            ReceiverState::ManifestReceived | ReceiverState::FileClosed
        ) {
            return Err(TransferError::ProtocolViolation(format!(
                "file-start for {} in state {:?}",
                start.file_id, self.state
            )));
        }
        let session = self.session.as_mut().ok_or(TransferError::NoActiveSession)?;
        let descriptor = session.manifest().file(start.file_id).cloned().ok_or_else(|| {
            TransferError::ProtocolViolation(format!(
                "file-start for undeclared file {}",
                start.file_id
            ))
        })?;
        if descriptor.size != start.size {
            return Err(TransferError::ProtocolViolation(format!(
                "file {} announced {} bytes, manifest declared {}",
                start.file_id, start.size, descriptor.size
            )));
        }
        let algorithm = session.manifest().digest_algorithm.clone();
        let state = session.state_mut(start.file_id).ok_or_else(|| {
            TransferError::ProtocolViolation(format!("file {} is not active", start.file_id))
        })?;
        if state.status != FileStatus::Pending {
            return Err(TransferError::ProtocolViolation(format!(
                "file {} started twice",
                start.file_id
            )));
        }
        state.activate();
        state.digest = start.digest.clone();

        let hasher = self.begin_digest(&algorithm).ok_or_else(|| {
            TransferError::ProtocolViolation(format!("unsupported digest algorithm '{}'", algorithm))
        })?;
        self.current = Some(FileAssembly {
            file_id: start.file_id,
            size: start.size,
            expected_digest: start.digest,
            hasher,
            next_offset: 0,
            held: BTreeMap::new(),
            failed: false,
        });
        self.state = ReceiverState::FileOpen(start.file_id);

        debug!(
            "Receiving file {}: {} ({} bytes)",
            start.file_id, descriptor.name, descriptor.size
        );
        self.events.emit(&TransferEvent::FileStarted {
            direction: Direction::Receiving,
            file_id: start.file_id,
            name: descriptor.name,
            size: descriptor.size,
        });
        Ok(())
    }

    fn on_chunk(&mut self, header: ChunkHeader) -> Result<(), TransferError> {
        if self.state != ReceiverState::FileOpen(header.file_id) {
            return Err(TransferError::ProtocolViolation(format!(
                "chunk for file {} in state {:?}",
                header.file_id, self.state
            )));
        }
        if header.length as usize > MAX_CHUNK_SIZE {
            return Err(TransferError::ProtocolViolation(format!(
                "chunk of {} bytes exceeds the {} byte limit",
                header.length, MAX_CHUNK_SIZE
            )));
        }
        self.pending_chunk = Some(header);
        Ok(())
    }

    async fn on_payload(&mut self, header: ChunkHeader, payload: Bytes) -> Result<(), TransferError> {
        let file_id = header.file_id;
        let Some(assembly) = self.current.as_mut() else {
            return Err(TransferError::ProtocolViolation(format!(
                "payload for file {} with no open file",
                file_id
            )));
        };
        if assembly.failed {
            return Ok(());
        }

        if payload.len() != header.length as usize {
            let err = TransferError::ChunkLengthMismatch {
                file_id,
                expected: header.length,
                actual: payload.len(),
            };
            return self.fail_file(file_id, err).await;
        }
        match header.end() {
            Some(end) if end <= assembly.size => {}
            _ => {
                let err = TransferError::ProtocolViolation(format!(
                    "chunk at offset {} (+{}) runs past the end of file {} ({} bytes)",
                    header.offset, header.length, file_id, assembly.size
                ));
                return self.fail_file(file_id, err).await;
            }
        }
        if let Err(reason) = assembly.accept(header.offset, payload.clone()) {
            return self
                .fail_file(file_id, TransferError::ProtocolViolation(reason))
                .await;
        }

        self.storage
            .write_region(file_id, header.offset, &payload)
            .await?;

        if payload.is_empty() {
            return Ok(());
        }
        let session = self.session.as_mut().ok_or(TransferError::NoActiveSession)?;
        if let Some(update) = session.record_progress(file_id, payload.len() as u64) {
            self.events.emit(&TransferEvent::Progress(update));
        }
        Ok(())
    }

    async fn on_file_end(&mut self, end: FileEnd) -> Result<(), TransferError> {
        if self.state != ReceiverState::FileOpen(end.file_id) {
            return Err(TransferError::ProtocolViolation(format!(
                "file-end for {} in state {:?}",
                end.file_id, self.state
            )));
        }
        self.state = ReceiverState::FileClosed;
        let Some(assembly) = self.current.take() else {
            return Err(TransferError::NoActiveSession);
        };
        if assembly.failed {
            return Ok(());
        }
        let file_id = assembly.file_id;

        if !assembly.is_covered() {
            let err = TransferError::ProtocolViolation(format!(
                "file {} ended with {} of {} bytes in order",
                file_id, assembly.next_offset, assembly.size
            ));
            return self.fail_file(file_id, err).await;
        }

        let expected = if assembly.expected_digest.is_empty() {
            end.digest
        } else {
            assembly.expected_digest
        };
        let actual = assembly.hasher.finalize_hex();
        // Nothing to compare against when neither side declared a digest
        let declared = !expected.is_empty();
        let verified = !declared || actual == expected;
        if !declared {
            debug!("File {} carried no digest; skipping verification", file_id);
        }
        let artifact = self.storage.finalize(file_id).await?;

        let session = self.session.as_mut().ok_or(TransferError::NoActiveSession)?;
        if let Some(state) = session.state_mut(file_id) {
            state.digest = actual.clone();
            state.verified = declared.then_some(verified);
            if verified {
                state.status = FileStatus::Complete;
            } else {
                state.fail(FailureKind::IntegrityCheckFailed);
            }
            let elapsed = state
                .started_at
                .map_or(0.0, |started| started.elapsed().as_secs_f64());
            debug!(
                "File {} received: {} bytes, {}",
                file_id,
                state.bytes_moved,
                format_transfer_speed(state.bytes_moved, elapsed)
            );
        }

        self.events.emit(&TransferEvent::FileFinished {
            direction: Direction::Receiving,
            file_id,
            digest: actual.clone(),
            verified,
            artifact: Some(artifact),
        });

        if !verified {
            let err = TransferError::IntegrityCheckFailed {
                file_id,
                expected,
                actual,
            };
            warn!("{}", err);
            self.events.emit(&TransferEvent::Error(TransferFailure {
                direction: Direction::Receiving,
                file_id: Some(file_id),
                kind: err.kind(),
                message: err.to_string(),
                fatal: false,
            }));
        }
        Ok(())
    }

    fn on_complete(&mut self) -> Result<(), TransferError> {
        if !matches!(
            self.state,
            ReceiverState::ManifestReceived | ReceiverState::FileClosed
        ) {
            return Err(TransferError::ProtocolViolation(format!(
                "complete in state {:?}",
                self.state
            )));
        }
        let session = self.session.as_ref().ok_or(TransferError::NoActiveSession)?;
        let unsettled = session.unsettled();
        if !unsettled.is_empty() {
            return Err(TransferError::ProtocolViolation(format!(
                "complete received with unfinished files {:?}",
                unsettled
            )));
        }

        self.state = ReceiverState::SessionComplete;
        let summary = session.summary();
        info!(
            "Session {} received: {} files, {} bytes in {:.2}s",
            summary.session_id,
            summary.files.len(),
            summary.bytes_moved,
            summary.elapsed.as_secs_f64()
        );
        self.events.emit(&TransferEvent::Complete(summary));
        Ok(())
    }

    async fn on_cancel(&mut self, notice: CancelNotice) -> Result<(), TransferError> {
        let Some(file_id) = notice.file_id else {
            info!("Peer cancelled the session: {}", notice.reason);
            return Err(TransferError::Cancelled);
        };
        let session = self.session.as_mut().ok_or_else(|| {
            TransferError::ProtocolViolation("cancel before manifest".into())
        })?;
        if session.remove(file_id).is_none() {
            debug!("Ignoring cancel for unknown file {}", file_id);
            return Ok(());
        }

        info!("Peer cancelled file {}: {}", file_id, notice.reason);
        if self.state == ReceiverState::FileOpen(file_id) {
            self.current = None;
            self.state = ReceiverState::FileClosed;
        }
        self.storage.abort(file_id).await;
        self.events.emit(&TransferEvent::Error(TransferFailure {
            direction: Direction::Receiving,
            file_id: Some(file_id),
            kind: FailureKind::Cancelled,
            message: format!("file {} cancelled by peer", file_id),
            fatal: false,
        }));
        Ok(())
    }

    /// Fail one file and keep the session going. Remaining chunks for it are discarded.
    async fn fail_file(&mut self, file_id: u32, err: TransferError) -> Result<(), TransferError> {
        warn!("File {} failed: {}", file_id, err);
        if let Some(assembly) = self.current.as_mut() {
            assembly.failed = true;
        }
        if let Some(state) = self.session.as_mut().and_then(|s| s.state_mut(file_id)) {
            state.fail(err.kind());
        }
        self.storage.abort(file_id).await;
        self.events.emit(&TransferEvent::Error(TransferFailure {
            direction: Direction::Receiving,
            file_id: Some(file_id),
            kind: err.kind(),
            message: err.to_string(),
            fatal: false,
        }));
        Ok(())
    }

    /// Move to `Failed` and publish the terminal error.
    async fn fail(&mut self, err: TransferError) -> TransferError {
        let file_id = err
            .file_id()
            .or(self.current.as_ref().map(|a| a.file_id));
        error!("Receive session failed: {}", err);

        self.state = ReceiverState::Failed;
        self.pending_chunk = None;
        let mut discard: Vec<u32> = self.current.take().map(|a| a.file_id).into_iter().collect();
        if let Some(session) = self.session.as_mut() {
            discard.extend(session.unsettled());
            session.fail_in_flight(err.kind());
        }
        // Storage may hold placeholders for files that never started
        discard.sort_unstable();
        discard.dedup();
        for file_id in discard {
            self.storage.abort(file_id).await;
        }
        self.events.emit(&TransferEvent::Error(TransferFailure {
            direction: Direction::Receiving,
            file_id,
            kind: err.kind(),
            message: err.to_string(),
            fatal: true,
        }));
        err
    }

    fn begin_digest(&self, name: &str) -> Option<Box<dyn IncrementalDigest>> {
        match self.providers.iter().find(|p| p.name() == name) {
            Some(provider) => Some(provider.begin()),
            None => provider_for(name).map(|p| p.begin()),
        }
    }
}
