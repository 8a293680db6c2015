//! Cross-connection glue: the node registry and connection directory that
//! let a routing decision made while handling one connection's traffic
//! reach into another connection's buffers and event loop.
//!
//! [`crate::routing::RoutingTable`] itself stays a pure, connection-unaware
//! leaf; `Broker` is the composition point above it that actually moves
//! bytes and dispatches events, matching the way the original C sources
//! tangle `apx_nodeInstance` and `apx_routingTable` together through direct
//! calls rather than a layered API.

use crate::connection::ConnectionEvent;
use crate::file_manager::FileManager;
use crate::node_instance::NodeInstance;
use crate::routing::{ConnectorChangeTable, CopyInstruction, PortRef, RoutingTable};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub struct ConnectionHandle {
    pub events: crossbeam::channel::Sender<ConnectionEvent>,
    pub file_manager: Arc<FileManager>,
}

#[derive(Default)]
pub struct NodeRegistry {
    nodes: Mutex<HashMap<(u32, u32), Arc<NodeInstance>>>,
}

impl NodeRegistry {
    pub fn insert(&self, key: (u32, u32), node: Arc<NodeInstance>) {
        self.nodes.lock().insert(key, node);
    }

    pub fn remove(&self, key: (u32, u32)) -> Option<Arc<NodeInstance>> {
        self.nodes.lock().remove(&key)
    }

    pub fn get(&self, key: (u32, u32)) -> Option<Arc<NodeInstance>> {
        self.nodes.lock().get(&key).cloned()
    }
}

#[derive(Default)]
pub struct ConnectionDirectory {
    connections: Mutex<HashMap<u32, ConnectionHandle>>,
}

impl ConnectionDirectory {
    pub fn insert(&self, connection_id: u32, handle: ConnectionHandle) {
        self.connections.lock().insert(connection_id, handle);
    }

    pub fn remove(&self, connection_id: u32) {
        self.connections.lock().remove(&connection_id);
    }

    fn send(&self, connection_id: u32, event: ConnectionEvent) {
        if let Some(handle) = self.connections.lock().get(&connection_id) {
            let _ = handle.events.send(event);
        }
    }

    fn file_manager(&self, connection_id: u32) -> Option<Arc<FileManager>> {
        self.connections.lock().get(&connection_id).map(|h| h.file_manager.clone())
    }
}

#[derive(Default)]
pub struct Broker {
    pub routing: RoutingTable,
    pub nodes: NodeRegistry,
    pub connections: ConnectionDirectory,
}

impl Broker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attach_node(&self, connection_id: u32, node_id: u32, node: &Arc<NodeInstance>) {
        let require_sigs = node.require_signatures();
        let provide_sigs = node.provide_signatures();
        let result = self.routing.attach_node(connection_id, node_id, &require_sigs, &provide_sigs);
        self.apply_copies(&result.copies);
        self.dispatch_changes(result.changes, true);
    }

    pub fn detach_node(&self, connection_id: u32, node_id: u32, node: &Arc<NodeInstance>) {
        let require_sigs = node.require_signatures();
        let provide_sigs = node.provide_signatures();
        let result = self.routing.detach_node(connection_id, node_id, &require_sigs, &provide_sigs);
        self.apply_copies(&result.copies);
        self.dispatch_changes(result.changes, false);
        self.nodes.remove((connection_id, node_id));
    }

    /// Called after a `.out` write lands in a provide buffer: finds every
    /// require port currently bound to `port_id` as its driving provider
    /// and propagates the new bytes, mirroring the write onward if the
    /// consumer's `.in` file has been announced.
    pub fn fanout_provide_write(&self, connection_id: u32, node_id: u32, port_id: u32) {
        let Some(node) = self.nodes.get((connection_id, node_id)) else { return };
        let signature = node.provide_signature(port_id);
        let bytes = node.read_provide(port_id);
        let provider = PortRef { connection_id, node_id, port_id };
        for consumer in self.routing.current_consumers(&signature, provider) {
            self.copy_into(provider, &bytes, consumer);
        }
    }

    fn apply_copies(&self, copies: &[CopyInstruction]) {
        for copy in copies {
            let Some(src) = self.nodes.get((copy.from.connection_id, copy.from.node_id)) else { continue };
            let bytes = src.read_provide(copy.from.port_id);
            self.copy_into(copy.from, &bytes, copy.to);
        }
    }

    fn copy_into(&self, _from: PortRef, bytes: &[u8], to: PortRef) {
        let Some(dst) = self.nodes.get((to.connection_id, to.node_id)) else { return };
        dst.write_require(to.port_id, bytes);
        let (offset, _) = dst.require_offset_size(to.port_id);
        if let Some(fm) = self.connections.file_manager(to.connection_id) {
            let _ = fm.write_require_mirror(&dst.name, offset, bytes);
        }
    }

    fn dispatch_changes(&self, changes: Vec<ConnectorChangeTable>, connect: bool) {
        for table in changes {
            let connection_id = table.connection_id;
            if !table.require_changes.is_empty() {
                let t = ConnectorChangeTable {
                    connection_id,
                    node_id: table.node_id,
                    require_changes: table.require_changes.clone(),
                    provide_changes: Vec::new(),
                };
                let event = if connect {
                    ConnectionEvent::RequirePortConnect(t)
                } else {
                    ConnectionEvent::RequirePortDisconnect(t)
                };
                self.connections.send(connection_id, event);
            }
            if !table.provide_changes.is_empty() {
                let t = ConnectorChangeTable {
                    connection_id,
                    node_id: table.node_id,
                    require_changes: Vec::new(),
                    provide_changes: table.provide_changes.clone(),
                };
                let event = if connect {
                    ConnectionEvent::ProvidePortConnect(t)
                } else {
                    ConnectionEvent::ProvidePortDisconnect(t)
                };
                self.connections.send(connection_id, event);
            }
        }
    }
}
