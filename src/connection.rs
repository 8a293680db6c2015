//! One session's worth of state: the reader thread that turns transport
//! bytes into framed messages, the event-loop thread that reacts to them,
//! and the node table those reactions populate.
//!
//! Three threads cooperate per connection (§5): this module's reader and
//! event-loop threads, plus the send worker owned by its
//! [`crate::file_manager::FileManager`]. Each has its own bounded hand-off
//! and its own timeout on shutdown, so a wedged peer degrades one
//! connection rather than the whole server.

use crate::broker::{Broker, ConnectionHandle};
use crate::file_manager::{FileManager, FileManagerEvent, DEFAULT_QUEUE_DEPTH, WORKER_JOIN_TIMEOUT};
use crate::file_map::{File, FileKind};
use crate::framing::{self, Framer, FramerEvent};
use crate::idl;
use crate::layout;
use crate::node_instance::NodeInstance;
use crate::routing::ConnectorChangeTable;
use crate::transport::Transport;
use crate::worker::Worker;
use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub enum ConnectionEvent {
    HeaderAccepted,
    Inbound(Vec<u8>),
    RequirePortConnect(ConnectorChangeTable),
    RequirePortDisconnect(ConnectorChangeTable),
    ProvidePortConnect(ConnectorChangeTable),
    ProvidePortDisconnect(ConnectorChangeTable),
    Fatal(String),
    Shutdown,
}

pub struct Connection {
    pub connection_id: u32,
    broker: Arc<Broker>,
    file_manager: Arc<FileManager>,
    events_tx: crossbeam::channel::Sender<ConnectionEvent>,
    nodes: Mutex<HashMap<String, Arc<NodeInstance>>>,
    nodes_by_id: Mutex<HashMap<u32, Arc<NodeInstance>>>,
    next_node_id: AtomicU32,
    shutdown_handle: Mutex<Option<Box<dyn Transport>>>,
    reader: Mutex<Option<Worker>>,
    event_loop: Mutex<Option<Worker>>,
}

impl Connection {
    /// Writes the greeting, wires up the file manager's send worker, and
    /// spawns the reader and event-loop threads. Returns once the session
    /// is live; the threads run until the peer disconnects or
    /// [`Connection::shutdown`] is called.
    pub fn spawn(connection_id: u32, mut transport: Box<dyn Transport>, broker: Arc<Broker>) -> Result<Arc<Self>> {
        let mut write_half = transport.try_clone()?;
        let shutdown_handle = transport.try_clone()?;
        write_half
            .write_all(&framing::encode_greeting())
            .map_err(|e| anyhow!("failed to write greeting: {e}"))?;

        let (events_tx, events_rx) = crossbeam::channel::bounded(DEFAULT_QUEUE_DEPTH);
        let file_manager = FileManager::new(connection_id, move |bytes| write_half.write_all(bytes));

        let connection = Arc::new(Connection {
            connection_id,
            broker: broker.clone(),
            file_manager: file_manager.clone(),
            events_tx: events_tx.clone(),
            nodes: Mutex::new(HashMap::new()),
            nodes_by_id: Mutex::new(HashMap::new()),
            next_node_id: AtomicU32::new(0),
            shutdown_handle: Mutex::new(Some(shutdown_handle)),
            reader: Mutex::new(None),
            event_loop: Mutex::new(None),
        });

        broker.connections.insert(
            connection_id,
            ConnectionHandle { events: events_tx.clone(), file_manager },
        );

        let reader_tx = events_tx;
        let reader = Worker::spawn(format!("apx-reader-{connection_id}"), move || {
            let mut framer = Framer::new();
            let mut buf = [0u8; 8192];
            loop {
                match transport.read(&mut buf) {
                    Ok(0) => {
                        let _ = reader_tx.send(ConnectionEvent::Shutdown);
                        return;
                    }
                    Ok(n) => {
                        framer.push(&buf[..n]);
                        loop {
                            match framer.next_event() {
                                Ok(Some(FramerEvent::Greeting(_))) => {
                                    let _ = reader_tx.send(ConnectionEvent::HeaderAccepted);
                                }
                                Ok(Some(FramerEvent::Message(payload))) => {
                                    let _ = reader_tx.send(ConnectionEvent::Inbound(payload));
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    let _ = reader_tx.send(ConnectionEvent::Fatal(e.to_string()));
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        let _ = reader_tx.send(ConnectionEvent::Fatal(e.to_string()));
                        return;
                    }
                }
            }
        });
        *connection.reader.lock() = Some(reader);

        let worker_conn = connection.clone();
        let event_loop = Worker::spawn(format!("apx-events-{connection_id}"), move || {
            worker_conn.run_event_loop(events_rx);
        });
        *connection.event_loop.lock() = Some(event_loop);

        Ok(connection)
    }

    fn run_event_loop(&self, events_rx: crossbeam::channel::Receiver<ConnectionEvent>) {
        for event in events_rx {
            match event {
                ConnectionEvent::HeaderAccepted => {
                    self.file_manager.on_header_accepted();
                    let _ = self.file_manager.enqueue_ack();
                }
                ConnectionEvent::Inbound(payload) => {
                    if self.handle_inbound(payload) {
                        break;
                    }
                }
                ConnectionEvent::RequirePortConnect(t)
                | ConnectionEvent::RequirePortDisconnect(t)
                | ConnectionEvent::ProvidePortConnect(t)
                | ConnectionEvent::ProvidePortDisconnect(t) => self.apply_connector_change(&t),
                ConnectionEvent::Fatal(msg) => {
                    tracing::warn!(connection_id = self.connection_id, error = %msg, "connection reader failed, tearing down");
                    break;
                }
                ConnectionEvent::Shutdown => break,
            }
        }
        self.teardown();
    }

    /// Returns `true` if the error was connection-fatal and the event loop
    /// must tear the session down (§7); otherwise logs and continues.
    fn handle_inbound(&self, payload: Vec<u8>) -> bool {
        match self.file_manager.on_recv(&payload) {
            Ok(Some(FileManagerEvent::RemoteFileAnnounced(file))) => {
                self.on_remote_file_announced(file);
                false
            }
            Ok(Some(FileManagerEvent::Write { file, offset, data })) => {
                self.on_file_write(file, offset, data);
                false
            }
            Ok(Some(FileManagerEvent::LocalFileOpened(_))) | Ok(Some(FileManagerEvent::RemoteFileClosed(_))) | Ok(None) => false,
            Err(e) if e.is_connection_fatal() => {
                tracing::warn!(connection_id = self.connection_id, error = %e, "connection-fatal error, tearing down");
                true
            }
            Err(e) => {
                tracing::warn!(connection_id = self.connection_id, error = %e, "malformed RMF message, ignoring");
                false
            }
        }
    }

    fn on_remote_file_announced(&self, file: File) {
        if let Err(e) = self.file_manager.request_open(file.address) {
            tracing::warn!(connection_id = self.connection_id, error = %e, "failed to queue FILE_OPEN");
        }
        self.get_or_create_node(file.node_name());
    }

    fn get_or_create_node(&self, name: &str) -> Arc<NodeInstance> {
        let mut nodes = self.nodes.lock();
        if let Some(existing) = nodes.get(name) {
            return existing.clone();
        }
        let node_id = self.next_node_id.fetch_add(1, Ordering::SeqCst);
        let node = Arc::new(NodeInstance::new_shell(node_id, self.connection_id, name.to_string()));
        nodes.insert(name.to_string(), node.clone());
        self.nodes_by_id.lock().insert(node_id, node.clone());
        self.broker.nodes.insert((self.connection_id, node_id), node.clone());
        node
    }

    fn on_file_write(&self, file: File, offset: u32, data: Vec<u8>) {
        let node = self.get_or_create_node(file.node_name());
        match file.kind {
            FileKind::Definition => {
                node.write_definition_at(offset, &data);
                if node.definition_len() as u32 >= file.size {
                    self.try_finalize_node(&node);
                }
            }
            FileKind::ProvideData => {
                if !node.is_ready() {
                    return;
                }
                node.write_provide_raw(offset, &data);
                if let Some(port_id) = node.provide_port_id_at_offset(offset) {
                    self.broker.fanout_provide_write(self.connection_id, node.node_id, port_id);
                }
            }
            FileKind::RequireData => {
                tracing::trace!(
                    connection_id = self.connection_id,
                    node = %file.node_name(),
                    "ignoring inbound write to a require-data mirror"
                );
            }
        }
    }

    fn try_finalize_node(&self, node: &Arc<NodeInstance>) {
        let text = node.definition_text();
        let outcome: Result<()> = (|| {
            let mut parsed = idl::parse(&text).map_err(|e| anyhow!(e.to_string()))?;
            idl::finalize(&mut parsed).map_err(|e| anyhow!(e.to_string()))?;
            let layout = layout::compute_layout(&parsed).map_err(|e| anyhow!(e.to_string()))?;
            node.finalize(layout);
            Ok(())
        })();
        match outcome {
            Ok(()) => self.broker.attach_node(self.connection_id, node.node_id, node),
            Err(e) => {
                tracing::warn!(
                    connection_id = self.connection_id,
                    node = %node.name,
                    error = %e,
                    "node definition failed to parse, marking invalid"
                );
                node.mark_invalid(e.to_string());
            }
        }
    }

    fn apply_connector_change(&self, table: &ConnectorChangeTable) {
        let Some(node) = self.nodes_by_id.lock().get(&table.node_id).cloned() else { return };
        for change in &table.require_changes {
            for _ in 0..change.count.unsigned_abs() {
                if change.count > 0 {
                    node.inc_require_connection_count(change.port_id);
                } else {
                    node.dec_require_connection_count(change.port_id);
                }
            }
        }
        for change in &table.provide_changes {
            for _ in 0..change.count.unsigned_abs() {
                if change.count > 0 {
                    node.inc_provide_connection_count(change.port_id);
                } else {
                    node.dec_provide_connection_count(change.port_id);
                }
            }
        }
    }

    fn teardown(&self) {
        // Closes the transport if `Connection::shutdown` hasn't already -
        // necessary when the event loop itself decided to tear down (a
        // connection-fatal inbound error), since the reader thread is
        // otherwise still blocked in `transport.read()`.
        if let Some(mut handle) = self.shutdown_handle.lock().take() {
            let _ = handle.shutdown();
        }
        let nodes: Vec<Arc<NodeInstance>> = self.nodes.lock().values().cloned().collect();
        for node in nodes {
            if node.is_ready() {
                self.broker.detach_node(self.connection_id, node.node_id, &node);
            }
        }
        self.broker.connections.remove(self.connection_id);
        self.file_manager.shutdown();
    }

    /// Requests an orderly shutdown: unblocks the reader thread via the
    /// transport, then joins both threads with the standard timeout.
    pub fn shutdown(&self) {
        if let Some(mut handle) = self.shutdown_handle.lock().take() {
            let _ = handle.shutdown();
        }
        let _ = self.events_tx.send(ConnectionEvent::Shutdown);
        if let Some(mut w) = self.event_loop.lock().take() {
            w.join_timeout(WORKER_JOIN_TIMEOUT);
        }
        if let Some(mut w) = self.reader.lock().take() {
            w.join_timeout(WORKER_JOIN_TIMEOUT);
        }
    }
}
