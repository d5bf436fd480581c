use std::collections::VecDeque;

use rand::seq::SliceRandom;
use rhubarb_proto::ServerAddr;
use tokio::time::Instant;

/// One server in the pool, with its reconnect bookkeeping
#[derive(Debug, Clone)]
pub(crate) struct PoolServer {
    pub(crate) addr: ServerAddr,
    pub(crate) did_connect: bool,
    pub(crate) reconnects: u32,
    pub(crate) last_attempt: Option<Instant>,
}

impl PoolServer {
    fn new(addr: ServerAddr) -> Self {
        Self {
            addr,
            did_connect: false,
            reconnects: 0,
            last_attempt: None,
        }
    }
}

/// The rotating pool of candidate servers
///
/// The head of the pool is the server the connection is currently
/// driving (or about to attempt). Failed attempts rotate the head to the
/// back; a server whose consecutive failed reconnects reach the
/// configured maximum is removed entirely. An empty pool means reconnect
/// exhaustion.
#[derive(Debug)]
pub(crate) struct ServerPool {
    servers: VecDeque<PoolServer>,
}

impl ServerPool {
    /// Build the pool out of the configured URLs, shuffling unless asked
    /// not to.
    pub(crate) fn new(addrs: Vec<ServerAddr>, no_randomize: bool) -> Self {
        let mut servers: Vec<_> = addrs.into_iter().map(PoolServer::new).collect();
        if !no_randomize && servers.len() > 1 {
            servers.shuffle(&mut rand::thread_rng());
        }

        Self {
            servers: servers.into(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.servers.len()
    }

    /// The server the connection is currently driving
    pub(crate) fn current(&self) -> Option<&PoolServer> {
        self.servers.front()
    }

    pub(crate) fn current_mut(&mut self) -> Option<&mut PoolServer> {
        self.servers.front_mut()
    }

    /// Mark the current server as successfully connected, resetting its
    /// failure bookkeeping.
    pub(crate) fn note_connected(&mut self) {
        if let Some(server) = self.servers.front_mut() {
            server.did_connect = true;
            server.reconnects = 0;
        }
    }

    /// Rotate the current server to the back after a failed attempt.
    pub(crate) fn rotate(&mut self) {
        if self.servers.len() > 1 {
            if let Some(server) = self.servers.pop_front() {
                self.servers.push_back(server);
            }
        }
    }

    /// Advance to the next reconnect candidate.
    ///
    /// The current server is retired once it has accumulated
    /// `max_reconnect` failed attempts, otherwise it rotates to the back
    /// of the pool; the new head is the next candidate. Returns `false`
    /// when the pool has been exhausted.
    pub(crate) fn next(&mut self, max_reconnect: u32) -> bool {
        if let Some(current) = self.servers.front() {
            if current.reconnects >= max_reconnect {
                self.servers.pop_front();
            } else {
                self.rotate();
            }
        }

        while let Some(head) = self.servers.front() {
            if head.reconnects >= max_reconnect {
                self.servers.pop_front();
            } else {
                return true;
            }
        }

        false
    }
}
