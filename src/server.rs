//! Top-level connection bookkeeping: hands out connection ids, spawns a
//! [`Connection`] per accepted transport, and tears every connection down
//! on shutdown.

use crate::broker::Broker;
use crate::connection::Connection;
use crate::transport::Transport;
use anyhow::Result;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;

struct ServerState {
    next_connection_id: u32,
    live_ids: HashSet<u32>,
    connections: HashMap<u32, Arc<Connection>>,
}

pub struct Server {
    pub broker: Arc<Broker>,
    state: Mutex<ServerState>,
}

impl Server {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            broker: Broker::new(),
            state: Mutex::new(ServerState {
                next_connection_id: 0,
                live_ids: HashSet::new(),
                connections: HashMap::new(),
            }),
        })
    }

    /// Spawns a connection for a freshly-accepted transport and returns its
    /// assigned id.
    pub fn accept(self: &Arc<Self>, transport: Box<dyn Transport>) -> Result<u32> {
        let connection_id = {
            let mut state = self.state.lock();
            let id = allocate_id(&mut state.next_connection_id, &state.live_ids);
            state.live_ids.insert(id);
            id
        };
        let connection = Connection::spawn(connection_id, transport, self.broker.clone())?;
        self.state.lock().connections.insert(connection_id, connection);
        Ok(connection_id)
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Drops bookkeeping for a connection that has already torn itself
    /// down. Safe to call more than once for the same id; the connection
    /// id stays out of circulation once forgotten, matching the id-reuse
    /// avoidance `allocate_id` is built around.
    pub fn forget_connection(&self, connection_id: u32) {
        self.state.lock().connections.remove(&connection_id);
    }

    /// Shuts every live connection down in parallel - each bounded by its
    /// own worker-join timeout - and waits for all of them before
    /// returning.
    pub fn shutdown(&self) {
        let connections: Vec<Arc<Connection>> = {
            let state = self.state.lock();
            state.connections.values().cloned().collect()
        };
        let handles: Vec<_> = connections
            .into_iter()
            .map(|c| thread::spawn(move || c.shutdown()))
            .collect();
        for h in handles {
            let _ = h.join();
        }
        let mut state = self.state.lock();
        state.connections.clear();
        state.live_ids.clear();
    }

    #[cfg(test)]
    fn force_next_connection_id(&self, id: u32) {
        self.state.lock().next_connection_id = id;
    }
}

/// Finds the next id not already in use, skipping over ids the counter
/// would otherwise hand out a second time while their connection is still
/// live (e.g. after wraparound, or in tests that pin the counter).
fn allocate_id(counter: &mut u32, live: &HashSet<u32>) -> u32 {
    loop {
        let candidate = *counter;
        *counter = counter.wrapping_add(1);
        if !live.contains(&candidate) {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;

    #[test]
    fn connection_ids_are_assigned_sequentially() {
        let server = Server::new();
        let (a, _keep_a) = LoopbackTransport::pair();
        let (b, _keep_b) = LoopbackTransport::pair();
        let id_a = server.accept(Box::new(a)).unwrap();
        let id_b = server.accept(Box::new(b)).unwrap();
        assert_eq!(id_a, 0);
        assert_eq!(id_b, 1);
        server.shutdown();
    }

    #[test]
    fn allocator_skips_ids_still_marked_live_after_a_counter_reset() {
        let server = Server::new();
        let (a, _keep_a) = LoopbackTransport::pair();
        let id_a = server.accept(Box::new(a)).unwrap();
        server.force_next_connection_id(id_a);
        let (b, _keep_b) = LoopbackTransport::pair();
        let id_b = server.accept(Box::new(b)).unwrap();
        assert_ne!(id_a, id_b);
        server.shutdown();
    }
}
