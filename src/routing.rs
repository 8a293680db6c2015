//! The routing table pairs require ports with provide ports that share a
//! derived signature. It holds no byte buffers and knows nothing about
//! connections or transports - it is pure bookkeeping over `(connection,
//! node, port)` references, which keeps it a leaf dependency even though
//! almost everything else in the broker ends up calling it.

use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRef {
    pub connection_id: u32,
    pub node_id: u32,
    pub port_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    Require,
    Provide,
}

struct RoutingEntry {
    provide_refs: Vec<PortRef>,
    require_refs: Vec<PortRef>,
}

impl RoutingEntry {
    fn new() -> Self {
        Self {
            provide_refs: Vec::new(),
            require_refs: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.provide_refs.is_empty() && self.require_refs.is_empty()
    }
}

/// One port's worth of connect/disconnect bookkeeping produced by a single
/// attach or detach call: how many pairings appeared or vanished, and with
/// which peers.
#[derive(Debug, Clone)]
pub struct ConnectorChange {
    pub port_id: u32,
    pub count: i32,
    pub peers: Vec<PortRef>,
}

/// All the bookkeeping produced for one node by a single attach or detach
/// call, destined for that node's owning connection.
#[derive(Debug, Clone)]
pub struct ConnectorChangeTable {
    pub connection_id: u32,
    pub node_id: u32,
    pub require_changes: Vec<ConnectorChange>,
    pub provide_changes: Vec<ConnectorChange>,
}

impl ConnectorChangeTable {
    fn new(connection_id: u32, node_id: u32) -> Self {
        Self {
            connection_id,
            node_id,
            require_changes: Vec::new(),
            provide_changes: Vec::new(),
        }
    }
}

/// Instructs the caller to copy a provider's current byte snapshot into a
/// newly- (or newly-current-ly-) paired require port.
#[derive(Debug, Clone)]
pub struct CopyInstruction {
    pub from: PortRef,
    pub to: PortRef,
}

#[derive(Default)]
pub struct AttachResult {
    pub changes: Vec<ConnectorChangeTable>,
    pub copies: Vec<CopyInstruction>,
}

#[derive(Default)]
pub struct DetachResult {
    pub changes: Vec<ConnectorChangeTable>,
    pub copies: Vec<CopyInstruction>,
}

pub struct RoutingTable {
    entries: Mutex<HashMap<String, RoutingEntry>>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

fn note_change(
    table: &mut HashMap<(u32, u32), ConnectorChangeTable>,
    connection_id: u32,
    node_id: u32,
    kind: PortKind,
    port_id: u32,
    delta: i32,
    peer: PortRef,
) {
    let ct = table
        .entry((connection_id, node_id))
        .or_insert_with(|| ConnectorChangeTable::new(connection_id, node_id));
    let list = match kind {
        PortKind::Require => &mut ct.require_changes,
        PortKind::Provide => &mut ct.provide_changes,
    };
    if let Some(existing) = list.iter_mut().find(|c| c.port_id == port_id) {
        existing.count += delta;
        existing.peers.push(peer);
    } else {
        list.push(ConnectorChange {
            port_id,
            count: delta,
            peers: vec![peer],
        });
    }
}

impl RoutingTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Attaches a freshly-parsed node's ports to the table. `require_sigs`
    /// and `provide_sigs` are indexed by port id. Require ports are
    /// processed before provide ports, matching the order the original
    /// design notes call for: a node never pairs with its own provide ports
    /// as though they were already established peers.
    pub fn attach_node(
        &self,
        connection_id: u32,
        node_id: u32,
        require_sigs: &[String],
        provide_sigs: &[String],
    ) -> AttachResult {
        let mut entries = self.entries.lock();
        let mut changes: HashMap<(u32, u32), ConnectorChangeTable> = HashMap::new();
        let mut copies = Vec::new();

        for (port_id, sig) in require_sigs.iter().enumerate() {
            let port_id = port_id as u32;
            let me = PortRef { connection_id, node_id, port_id };
            let entry = entries.entry(sig.clone()).or_insert_with(RoutingEntry::new);
            let existing_providers = entry.provide_refs.clone();
            entry.require_refs.push(me);
            for provider in &existing_providers {
                note_change(&mut changes, connection_id, node_id, PortKind::Require, port_id, 1, *provider);
                note_change(
                    &mut changes,
                    provider.connection_id,
                    provider.node_id,
                    PortKind::Provide,
                    provider.port_id,
                    1,
                    me,
                );
            }
            if let Some(current) = existing_providers.first() {
                copies.push(CopyInstruction { from: *current, to: me });
            }
        }

        for (port_id, sig) in provide_sigs.iter().enumerate() {
            let port_id = port_id as u32;
            let me = PortRef { connection_id, node_id, port_id };
            let entry = entries.entry(sig.clone()).or_insert_with(RoutingEntry::new);
            let existing_requires = entry.require_refs.clone();
            let becomes_current = entry.provide_refs.is_empty();
            entry.provide_refs.push(me);
            for req in &existing_requires {
                note_change(&mut changes, req.connection_id, req.node_id, PortKind::Require, req.port_id, 1, me);
                note_change(&mut changes, connection_id, node_id, PortKind::Provide, port_id, 1, *req);
            }
            if becomes_current {
                for req in &existing_requires {
                    copies.push(CopyInstruction { from: me, to: *req });
                }
            }
        }

        AttachResult {
            changes: changes.into_values().collect(),
            copies,
        }
    }

    pub fn detach_node(
        &self,
        connection_id: u32,
        node_id: u32,
        require_sigs: &[String],
        provide_sigs: &[String],
    ) -> DetachResult {
        let mut entries = self.entries.lock();
        let mut changes: HashMap<(u32, u32), ConnectorChangeTable> = HashMap::new();
        let mut copies = Vec::new();
        let mut removed_signatures = Vec::new();

        for (port_id, sig) in require_sigs.iter().enumerate() {
            let port_id = port_id as u32;
            let me = PortRef { connection_id, node_id, port_id };
            if let Some(entry) = entries.get_mut(sig) {
                entry.require_refs.retain(|r| *r != me);
                for provider in entry.provide_refs.clone() {
                    note_change(&mut changes, connection_id, node_id, PortKind::Require, port_id, -1, provider);
                    note_change(
                        &mut changes,
                        provider.connection_id,
                        provider.node_id,
                        PortKind::Provide,
                        provider.port_id,
                        -1,
                        me,
                    );
                }
                if entry.is_empty() {
                    removed_signatures.push(sig.clone());
                }
            }
        }

        for (port_id, sig) in provide_sigs.iter().enumerate() {
            let port_id = port_id as u32;
            let me = PortRef { connection_id, node_id, port_id };
            if let Some(entry) = entries.get_mut(sig) {
                let was_current = entry.provide_refs.first() == Some(&me);
                entry.provide_refs.retain(|r| *r != me);
                for req in entry.require_refs.clone() {
                    note_change(&mut changes, req.connection_id, req.node_id, PortKind::Require, req.port_id, -1, me);
                    note_change(&mut changes, connection_id, node_id, PortKind::Provide, port_id, -1, req);
                }
                if was_current {
                    if let Some(new_current) = entry.provide_refs.first().copied() {
                        for req in entry.require_refs.clone() {
                            copies.push(CopyInstruction { from: new_current, to: req });
                        }
                    }
                }
                if entry.is_empty() {
                    removed_signatures.push(sig.clone());
                }
            }
        }

        for sig in removed_signatures {
            entries.remove(&sig);
        }

        DetachResult {
            changes: changes.into_values().collect(),
            copies,
        }
    }

    /// Returns the require-side peers of `provider`, but only if `provider`
    /// is still the current (oldest) provider for `signature` - standby
    /// providers never drive data.
    pub fn current_consumers(&self, signature: &str, provider: PortRef) -> Vec<PortRef> {
        let entries = self.entries.lock();
        match entries.get(signature) {
            Some(e) if e.provide_refs.first() == Some(&provider) => e.require_refs.clone(),
            _ => Vec::new(),
        }
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port_ref(connection_id: u32, node_id: u32, port_id: u32) -> PortRef {
        PortRef { connection_id, node_id, port_id }
    }

    #[test]
    fn first_provider_becomes_current_and_backfills_existing_requires() {
        let table = RoutingTable::new();
        let result = table.attach_node(1, 0, &["sig".to_string()], &[]);
        assert!(result.copies.is_empty());

        let attach2 = table.attach_node(2, 0, &[], &["sig".to_string()]);
        assert_eq!(attach2.copies.len(), 1);
        assert_eq!(attach2.copies[0].from, port_ref(2, 0, 0));
        assert_eq!(attach2.copies[0].to, port_ref(1, 0, 0));
    }

    #[test]
    fn second_provider_is_standby_and_does_not_copy() {
        let table = RoutingTable::new();
        table.attach_node(1, 0, &["sig".to_string()], &[]);
        table.attach_node(2, 0, &[], &["sig".to_string()]);
        let attach3 = table.attach_node(3, 0, &[], &["sig".to_string()]);
        assert!(attach3.copies.is_empty());
        assert_eq!(attach3.changes.len(), 1);
    }

    #[test]
    fn detaching_current_provider_promotes_standby_and_copies() {
        let table = RoutingTable::new();
        table.attach_node(1, 0, &["sig".to_string()], &[]);
        table.attach_node(2, 0, &[], &["sig".to_string()]);
        table.attach_node(3, 0, &[], &["sig".to_string()]);

        let p1 = port_ref(2, 0, 0);
        let consumers_before = table.current_consumers("sig", p1);
        assert_eq!(consumers_before, vec![port_ref(1, 0, 0)]);

        let detach = table.detach_node(2, 0, &[], &["sig".to_string()]);
        assert_eq!(detach.copies.len(), 1);
        assert_eq!(detach.copies[0].from, port_ref(3, 0, 0));
        assert_eq!(detach.copies[0].to, port_ref(1, 0, 0));

        let p3 = port_ref(3, 0, 0);
        assert_eq!(table.current_consumers("sig", p3), vec![port_ref(1, 0, 0)]);
    }

    #[test]
    fn entry_is_removed_once_both_sides_are_empty() {
        let table = RoutingTable::new();
        table.attach_node(1, 0, &["sig".to_string()], &[]);
        table.attach_node(2, 0, &[], &["sig".to_string()]);
        assert_eq!(table.entry_count(), 1);
        table.detach_node(1, 0, &["sig".to_string()], &[]);
        assert_eq!(table.entry_count(), 1);
        table.detach_node(2, 0, &[], &["sig".to_string()]);
        assert_eq!(table.entry_count(), 0);
    }

    #[test]
    fn standby_provider_does_not_drive_data() {
        let table = RoutingTable::new();
        table.attach_node(1, 0, &["sig".to_string()], &[]);
        table.attach_node(2, 0, &[], &["sig".to_string()]);
        table.attach_node(3, 0, &[], &["sig".to_string()]);
        let standby = port_ref(3, 0, 0);
        assert!(table.current_consumers("sig", standby).is_empty());
    }
}
