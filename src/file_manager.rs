//! Per-connection file manager: owns the local and remote file maps for one
//! session, serializes outbound RMF traffic through a single send worker,
//! and decodes inbound RMF messages, invoking the notification hooks the
//! connection registered.
//!
//! The server never exposes files of its own in the normal broker role -
//! the node instance and its buffers live on the peer - so `local` usually
//! stays empty, but the type stays symmetric with `remote` so the same
//! logic would serve a client-mode file manager too.

use crate::error::ApxError;
use crate::file_map::{File, FileKind, FileMap, FileMapError};
use crate::framing::frame_message;
use crate::rmf::{FileInfoMsg, FileType, RmfMessage};
use crate::worker::Worker;
use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default cap on queued-but-unsent outbound RMF messages (§5).
pub const DEFAULT_QUEUE_DEPTH: usize = 1000;
pub const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
pub const MAX_DEFINITION_SIZE: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub enum FileManagerEvent {
    RemoteFileAnnounced(File),
    LocalFileOpened(File),
    RemoteFileClosed(u32),
    Write { file: File, offset: u32, data: Vec<u8> },
}

enum OutEvent {
    Message(RmfMessage),
    Shutdown,
}

type OpenNotify = dyn FnMut(&File) + Send;
type WriteNotify = dyn FnMut(&File, u32, &[u8]) + Send;

pub struct FileManager {
    connection_id: u32,
    local: Mutex<FileMap>,
    remote: Mutex<FileMap>,
    header_accepted: AtomicBool,
    outbound_tx: crossbeam::channel::Sender<OutEvent>,
    worker: Mutex<Option<Worker>>,
    open_notify: Mutex<Option<Box<OpenNotify>>>,
    write_notify: Mutex<Option<Box<WriteNotify>>>,
}

impl FileManager {
    pub fn new(connection_id: u32, mut send: impl FnMut(&[u8]) -> io::Result<()> + Send + 'static) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = crossbeam::channel::bounded(DEFAULT_QUEUE_DEPTH);
        let worker = Worker::spawn(format!("apx-fm-{connection_id}"), move || {
            for event in outbound_rx {
                match event {
                    OutEvent::Shutdown => break,
                    OutEvent::Message(msg) => {
                        let framed = frame_message(&msg.encode());
                        if let Err(e) = send(&framed) {
                            tracing::warn!(connection_id, error = %e, "transport write failed, stopping send worker");
                            break;
                        }
                    }
                }
            }
        });
        Arc::new(Self {
            connection_id,
            local: Mutex::new(FileMap::new()),
            remote: Mutex::new(FileMap::new()),
            header_accepted: AtomicBool::new(false),
            outbound_tx,
            worker: Mutex::new(Some(worker)),
            open_notify: Mutex::new(None),
            write_notify: Mutex::new(None),
        })
    }

    pub fn set_open_notify(&self, f: impl FnMut(&File) + Send + 'static) {
        *self.open_notify.lock() = Some(Box::new(f));
    }

    pub fn set_write_notify(&self, f: impl FnMut(&File, u32, &[u8]) + Send + 'static) {
        *self.write_notify.lock() = Some(Box::new(f));
    }

    fn enqueue(&self, msg: RmfMessage) -> Result<()> {
        self.outbound_tx
            .send(OutEvent::Message(msg))
            .map_err(|_| anyhow!("file manager outbound queue is closed"))
    }

    pub fn enqueue_ack(&self) -> Result<()> {
        self.enqueue(RmfMessage::Ack)
    }

    pub fn write(&self, address: u32, data: &[u8]) -> Result<()> {
        self.enqueue(RmfMessage::Write { address, data: data.to_vec() })
    }

    pub fn request_open(&self, address: u32) -> Result<()> {
        self.enqueue(RmfMessage::FileOpen { address })
    }

    pub fn request_close(&self, address: u32) -> Result<()> {
        self.enqueue(RmfMessage::FileClose { address })
    }

    /// Adds a file to the local map and, if the header has already been
    /// accepted, immediately announces it to the peer.
    pub fn attach_local_file(&self, name: String, size: u32, kind: FileKind) -> Result<File> {
        let file = {
            let mut local = self.local.lock();
            local
                .create_file(name, None, size, kind, false)
                .map_err(|e| anyhow!("local file map: {e}"))?
                .clone()
        };
        if self.header_accepted.load(Ordering::Acquire) {
            self.enqueue(RmfMessage::FileInfo(to_file_info(&file)))?;
        }
        Ok(file)
    }

    /// Marks the session up and announces every file already in the local
    /// map.
    pub fn on_header_accepted(&self) {
        self.header_accepted.store(true, Ordering::Release);
        let files: Vec<File> = self.local.lock().files().to_vec();
        for file in files {
            let _ = self.enqueue(RmfMessage::FileInfo(to_file_info(&file)));
        }
    }

    pub fn find_remote_file(&self, name: &str) -> Option<File> {
        self.remote.lock().find_by_name(name).cloned()
    }

    /// Writes into the peer's `.in` file for `node_name`, if it has
    /// announced one. A no-op if it hasn't (yet).
    pub fn write_require_mirror(&self, node_name: &str, offset: u32, data: &[u8]) -> Result<()> {
        let addr = {
            let remote = self.remote.lock();
            let name = format!("{node_name}.in");
            remote.find_by_name(&name).map(|f| f.base_address() + offset)
        };
        if let Some(addr) = addr {
            self.write(addr, data)?;
        }
        Ok(())
    }

    /// Decodes one inbound message and dispatches it. Errors carry the
    /// severity §7 assigns their cause: a malformed message is tolerated
    /// (logged by the caller, session continues), while an oversize
    /// definition or a resource failure in the remote file map is
    /// connection-fatal.
    pub fn on_recv(&self, payload: &[u8]) -> Result<Option<FileManagerEvent>, ApxError> {
        let msg = RmfMessage::decode(payload).map_err(ApxError::tolerated)?;
        match msg {
            RmfMessage::Ack => Ok(None),
            RmfMessage::FileInfo(info) => self.handle_file_info(info),
            RmfMessage::FileOpen { address } => self.handle_file_open(address),
            RmfMessage::FileClose { address } => self.handle_file_close(address),
            RmfMessage::Write { address, data } => self.handle_write(address, data),
        }
    }

    fn handle_file_info(&self, info: FileInfoMsg) -> Result<Option<FileManagerEvent>, ApxError> {
        let mut remote = self.remote.lock();
        if remote.find_by_address(info.address).is_some() {
            tracing::debug!(connection = self.connection_id, address = info.address, "duplicate FILE_INFO, ignoring");
            return Ok(None);
        }
        let kind = FileKind::from_name(&info.name)
            .ok_or_else(|| ApxError::tolerated(anyhow!("FILE_INFO names an unrecognized file extension: {}", info.name)))?;
        if kind == FileKind::Definition && info.size > MAX_DEFINITION_SIZE {
            return Err(ApxError::connection_fatal(anyhow!(
                "definition file {} is {} bytes, exceeding the {} byte limit",
                info.name,
                info.size,
                MAX_DEFINITION_SIZE
            )));
        }
        let file = remote
            .create_file(info.name, Some(info.address), info.size, kind, true)
            .map_err(|e| file_map_error_severity(e, "remote file map"))?
            .clone();
        Ok(Some(FileManagerEvent::RemoteFileAnnounced(file)))
    }

    fn handle_file_open(&self, address: u32) -> Result<Option<FileManagerEvent>, ApxError> {
        let mut local = self.local.lock();
        let Some(file) = local.find_by_address_mut(address) else {
            tracing::warn!(connection = self.connection_id, address, "FILE_OPEN for unknown local file");
            return Ok(None);
        };
        file.open = true;
        let file = file.clone();
        drop(local);
        if let Some(hook) = self.open_notify.lock().as_mut() {
            hook(&file);
        }
        Ok(Some(FileManagerEvent::LocalFileOpened(file)))
    }

    fn handle_file_close(&self, address: u32) -> Result<Option<FileManagerEvent>, ApxError> {
        let mut local = self.local.lock();
        if let Some(file) = local.find_by_address_mut(address) {
            file.open = false;
        }
        Ok(Some(FileManagerEvent::RemoteFileClosed(address)))
    }

    fn handle_write(&self, address: u32, data: Vec<u8>) -> Result<Option<FileManagerEvent>, ApxError> {
        let found = {
            let local = self.local.lock();
            local.find_by_address(address).cloned()
        };
        let found = found.or_else(|| {
            let remote = self.remote.lock();
            remote.find_by_address(address).cloned()
        });
        let Some(file) = found else {
            tracing::warn!(connection = self.connection_id, address, "write to unknown address, discarding");
            return Ok(None);
        };
        let offset = address - file.base_address();
        if let Some(hook) = self.write_notify.lock().as_mut() {
            hook(&file, offset, &data);
        }
        Ok(Some(FileManagerEvent::Write { file, offset, data }))
    }

    /// Shuts the send worker down, waiting up to the standard timeout.
    pub fn shutdown(&self) {
        let _ = self.outbound_tx.send(OutEvent::Shutdown);
        let mut guard = self.worker.lock();
        if let Some(worker) = guard.as_mut() {
            if !worker.is_current_thread() {
                worker.join_timeout(WORKER_JOIN_TIMEOUT);
            }
        }
    }
}

/// `NameTooLong`/`RegionFull` are resource exhaustion (§7: connection-fatal);
/// `Overlap`/`Duplicate` mean the peer re-announced something, which is
/// tolerated the same way a duplicate FILE_INFO is.
fn file_map_error_severity(e: FileMapError, context: &str) -> ApxError {
    let err = anyhow!("{context}: {e}");
    match e {
        FileMapError::NameTooLong | FileMapError::RegionFull => ApxError::connection_fatal(err),
        FileMapError::Overlap | FileMapError::Duplicate => ApxError::tolerated(err),
    }
}

fn to_file_info(file: &File) -> FileInfoMsg {
    FileInfoMsg {
        address: file.address,
        size: file.size,
        file_type: FileType::Fixed,
        digest_type: 0,
        digest: [0u8; 32],
        name: file.name.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn test_manager() -> (Arc<FileManager>, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel();
        let fm = FileManager::new(1, move |bytes: &[u8]| {
            let _ = tx.send(bytes.to_vec());
            Ok(())
        });
        (fm, rx)
    }

    #[test]
    fn on_header_accepted_announces_local_files() {
        let (fm, rx) = test_manager();
        fm.attach_local_file("N.out".to_string(), 10, FileKind::ProvideData).unwrap();
        fm.on_header_accepted();
        let bytes = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        match RmfMessage::decode(&bytes[..]).unwrap() {
            RmfMessage::FileInfo(info) => assert_eq!(info.name, "N.out"),
            other => panic!("expected FileInfo, got {other:?}"),
        }
    }

    #[test]
    fn remote_file_info_is_tracked_and_duplicates_ignored() {
        let (fm, _rx) = test_manager();
        let payload = RmfMessage::FileInfo(FileInfoMsg {
            address: 0,
            size: 10,
            file_type: FileType::Fixed,
            digest_type: 0,
            digest: [0u8; 32],
            name: "N.out".to_string(),
        })
        .encode();
        let event = fm.on_recv(&payload).unwrap();
        assert!(matches!(event, Some(FileManagerEvent::RemoteFileAnnounced(_))));
        let again = fm.on_recv(&payload).unwrap();
        assert!(again.is_none());
    }

    #[test]
    fn oversize_definition_file_info_is_rejected() {
        let (fm, _rx) = test_manager();
        let payload = RmfMessage::FileInfo(FileInfoMsg {
            address: 0x0400_0000,
            size: MAX_DEFINITION_SIZE + 1,
            file_type: FileType::Fixed,
            digest_type: 0,
            digest: [0u8; 32],
            name: "N.apx".to_string(),
        })
        .encode();
        assert!(fm.on_recv(&payload).is_err());
    }

    #[test]
    fn write_to_unknown_address_is_tolerated() {
        let (fm, _rx) = test_manager();
        let payload = RmfMessage::Write { address: 0x1000, data: vec![1, 2, 3] }.encode();
        let event = fm.on_recv(&payload).unwrap();
        assert!(event.is_none());
    }

    #[test]
    fn file_open_invokes_hook_for_local_file() {
        let (fm, _rx) = test_manager();
        let file = fm.attach_local_file("N.out".to_string(), 4, FileKind::ProvideData).unwrap();
        let seen = Arc::new(Mutex::new(false));
        let seen2 = seen.clone();
        fm.set_open_notify(move |_f| *seen2.lock() = true);
        let payload = RmfMessage::FileOpen { address: file.address }.encode();
        fm.on_recv(&payload).unwrap();
        assert!(*seen.lock());
    }
}
