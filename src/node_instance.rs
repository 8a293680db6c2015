//! A node instance is the server's runtime record for one `.apx` definition
//! on one connection: its require/provide byte buffers, the layout that
//! describes them, and the per-port connection counts used by routing.
//!
//! Require data, provide data, and the accumulating definition buffer each
//! sit behind their own mutex (§4.G), so a require-side read never blocks
//! behind an unrelated provide-side write.

use crate::layout::{NodeLayout, PortDataProps};
use parking_lot::{Mutex, RwLock};

enum Lifecycle {
    /// Definition bytes are still streaming in; no buffers exist yet.
    Parsing,
    Ready,
    /// Parsing or layout computation failed; the node is inert for the
    /// remainder of the session but the `.apx` file stays open so the peer
    /// can see what happened via logs.
    Invalid { error: String },
}

struct Direction {
    props: Vec<PortDataProps>,
    data: Vec<u8>,
    conn_count: Vec<u32>,
}

impl Direction {
    fn new(props: Vec<PortDataProps>, data: Vec<u8>) -> Self {
        let conn_count = vec![0; props.len()];
        Self { props, data, conn_count }
    }
}

pub struct NodeInstance {
    pub node_id: u32,
    pub connection_id: u32,
    pub name: String,
    definition: Mutex<Vec<u8>>,
    lifecycle: RwLock<Lifecycle>,
    require: RwLock<Option<Direction>>,
    provide: RwLock<Option<Direction>>,
}

impl NodeInstance {
    pub fn new_shell(node_id: u32, connection_id: u32, name: String) -> Self {
        Self {
            node_id,
            connection_id,
            name,
            definition: Mutex::new(Vec::new()),
            lifecycle: RwLock::new(Lifecycle::Parsing),
            require: RwLock::new(None),
            provide: RwLock::new(None),
        }
    }

    /// Accumulates bytes received for the `.apx` file at `offset`.
    pub fn write_definition_at(&self, offset: u32, data: &[u8]) {
        let mut buf = self.definition.lock();
        let end = offset as usize + data.len();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[offset as usize..end].copy_from_slice(data);
    }

    pub fn definition_len(&self) -> usize {
        self.definition.lock().len()
    }

    pub fn definition_text(&self) -> String {
        String::from_utf8_lossy(&self.definition.lock()).into_owned()
    }

    pub fn finalize(&self, layout: NodeLayout) {
        *self.require.write() = Some(Direction::new(layout.require_props, layout.require_init_image));
        *self.provide.write() = Some(Direction::new(layout.provide_props, layout.provide_init_image));
        *self.lifecycle.write() = Lifecycle::Ready;
    }

    pub fn mark_invalid(&self, error: impl Into<String>) {
        *self.lifecycle.write() = Lifecycle::Invalid { error: error.into() };
    }

    pub fn is_ready(&self) -> bool {
        matches!(&*self.lifecycle.read(), Lifecycle::Ready)
    }

    pub fn is_invalid(&self) -> bool {
        matches!(&*self.lifecycle.read(), Lifecycle::Invalid { .. })
    }

    fn with_require<R>(&self, f: impl FnOnce(&Direction) -> R) -> Option<R> {
        self.require.read().as_ref().map(f)
    }

    fn with_provide<R>(&self, f: impl FnOnce(&Direction) -> R) -> Option<R> {
        self.provide.read().as_ref().map(f)
    }

    pub fn require_signatures(&self) -> Vec<String> {
        self.with_require(|r| r.props.iter().map(|p| p.signature.clone()).collect())
            .unwrap_or_default()
    }

    pub fn provide_signatures(&self) -> Vec<String> {
        self.with_provide(|p| p.props.iter().map(|p| p.signature.clone()).collect())
            .unwrap_or_default()
    }

    pub fn require_offset_size(&self, port_id: u32) -> (u32, u32) {
        self.with_require(|r| {
            let p = &r.props[port_id as usize];
            (p.offset, p.data_size)
        })
        .unwrap_or((0, 0))
    }

    pub fn provide_offset_size(&self, port_id: u32) -> (u32, u32) {
        self.with_provide(|p| {
            let props = &p.props[port_id as usize];
            (props.offset, props.data_size)
        })
        .unwrap_or((0, 0))
    }

    pub fn provide_port_id_at_offset(&self, offset: u32) -> Option<u32> {
        self.with_provide(|p| p.props.iter().find(|props| props.offset == offset).map(|props| props.port_id))
            .flatten()
    }

    pub fn provide_signature(&self, port_id: u32) -> String {
        self.with_provide(|p| p.props[port_id as usize].signature.clone()).unwrap_or_default()
    }

    pub fn read_require(&self, port_id: u32) -> Vec<u8> {
        self.with_require(|r| {
            let p = &r.props[port_id as usize];
            r.data[p.offset as usize..(p.offset + p.data_size) as usize].to_vec()
        })
        .unwrap_or_default()
    }

    pub fn write_require(&self, port_id: u32, data: &[u8]) {
        if let Some(require) = self.require.write().as_mut() {
            let p = &require.props[port_id as usize];
            let start = p.offset as usize;
            let len = (p.data_size as usize).min(data.len());
            require.data[start..start + len].copy_from_slice(&data[..len]);
        }
    }

    /// Writes raw bytes into the provide buffer at a byte offset (used when
    /// an inbound `.out` write arrives; the offset is expected to line up
    /// with a port boundary, which the caller verifies).
    pub fn write_provide_raw(&self, offset: u32, data: &[u8]) {
        if let Some(provide) = self.provide.write().as_mut() {
            let start = offset as usize;
            let end = start + data.len();
            if end <= provide.data.len() {
                provide.data[start..end].copy_from_slice(data);
            }
        }
    }

    pub fn read_provide(&self, port_id: u32) -> Vec<u8> {
        self.with_provide(|p| {
            let props = &p.props[port_id as usize];
            p.data[props.offset as usize..(props.offset + props.data_size) as usize].to_vec()
        })
        .unwrap_or_default()
    }

    pub fn inc_require_connection_count(&self, port_id: u32) {
        if let Some(require) = self.require.write().as_mut() {
            if let Some(c) = require.conn_count.get_mut(port_id as usize) {
                *c += 1;
            }
        }
    }

    pub fn dec_require_connection_count(&self, port_id: u32) {
        if let Some(require) = self.require.write().as_mut() {
            if let Some(c) = require.conn_count.get_mut(port_id as usize) {
                *c = c.saturating_sub(1);
            }
        }
    }

    pub fn inc_provide_connection_count(&self, port_id: u32) {
        if let Some(provide) = self.provide.write().as_mut() {
            if let Some(c) = provide.conn_count.get_mut(port_id as usize) {
                *c += 1;
            }
        }
    }

    pub fn dec_provide_connection_count(&self, port_id: u32) {
        if let Some(provide) = self.provide.write().as_mut() {
            if let Some(c) = provide.conn_count.get_mut(port_id as usize) {
                *c = c.saturating_sub(1);
            }
        }
    }

    pub fn require_connection_count(&self, port_id: u32) -> u32 {
        self.with_require(|r| r.conn_count[port_id as usize]).unwrap_or(0)
    }

    pub fn provide_connection_count(&self, port_id: u32) -> u32 {
        self.with_provide(|p| p.conn_count[port_id as usize]).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{idl, layout};

    fn ready_node() -> NodeInstance {
        let mut node = idl::parse("APX/1.2\nN\"N\"\nR\"A\"C:=1\nP\"B\"S:=2\n").unwrap();
        idl::finalize(&mut node).unwrap();
        let layout = layout::compute_layout(&node).unwrap();
        let instance = NodeInstance::new_shell(0, 0, "N".to_string());
        instance.finalize(layout);
        instance
    }

    #[test]
    fn starts_with_init_values() {
        let n = ready_node();
        assert_eq!(n.read_require(0), vec![1u8]);
        assert_eq!(n.read_provide(0), 2u16.to_le_bytes());
    }

    #[test]
    fn write_and_read_require_buffer() {
        let n = ready_node();
        n.write_require(0, &[9]);
        assert_eq!(n.read_require(0), vec![9u8]);
    }

    #[test]
    fn connection_counts_increment_and_decrement() {
        let n = ready_node();
        n.inc_require_connection_count(0);
        n.inc_require_connection_count(0);
        assert_eq!(n.require_connection_count(0), 2);
        n.dec_require_connection_count(0);
        assert_eq!(n.require_connection_count(0), 1);
    }

    #[test]
    fn shell_accumulates_definition_bytes_out_of_order() {
        let n = NodeInstance::new_shell(0, 0, "N".to_string());
        n.write_definition_at(5, b"world");
        n.write_definition_at(0, b"hello");
        assert_eq!(n.definition_text(), "helloworld");
    }

    #[test]
    fn require_and_provide_writes_do_not_contend_on_one_lock() {
        let n = ready_node();
        let _require_guard = n.require.read();
        // Provide-side reads/writes must still succeed while a require
        // guard is held, since they're independent locks.
        assert_eq!(n.read_provide(0), 2u16.to_le_bytes());
        n.write_provide_raw(0, &9u16.to_le_bytes());
        assert_eq!(n.read_provide(0), 9u16.to_le_bytes());
    }
}
