use std::sync::Arc;

use arc_swap::ArcSwapOption;
use rhubarb_proto::ServerInfo;

use crate::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use crate::error::Error;

/// The lifecycle state of a client connection
///
/// `Closed` is terminal; every operation on a closed client fails with
/// `ErrorKind::ConnectionClosed`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No connection attempt has been made yet
    Disconnected,
    /// The initial connection handshake is in progress
    Connecting,
    /// The client is connected and operational
    Connected,
    /// The connection was lost and the client is walking the server pool
    Reconnecting,
    /// The client has been closed
    Closed,
}

/// Transport and delivery counters for one client
///
/// Obtained from `Client::stats`. Counters are cumulative over the
/// client's lifetime, across reconnects.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ClientStatistics {
    /// Messages received from the server
    pub in_msgs: u64,
    /// Payload bytes received from the server
    pub in_bytes: u64,
    /// Messages sent to the server
    pub out_msgs: u64,
    /// Payload bytes sent to the server
    pub out_bytes: u64,
    /// Completed reconnections
    pub reconnects: u64,
}

/// State shared between the caller facing [`Client`], the handler task
/// and the connection driver
///
/// [`Client`]: crate::Client
#[derive(Debug)]
pub(crate) struct SharedState {
    status: AtomicU32,
    in_msgs: AtomicU64,
    in_bytes: AtomicU64,
    out_msgs: AtomicU64,
    out_bytes: AtomicU64,
    reconnects: AtomicU64,
    /// Bytes held in the reconnect pending buffer
    pending_bytes: AtomicUsize,
    last_error: ArcSwapOption<Error>,
    /// The most recent `INFO` document from the current server
    info: ArcSwapOption<ServerInfo>,
}

const STATUS_DISCONNECTED: u32 = 0;
const STATUS_CONNECTING: u32 = 1;
const STATUS_CONNECTED: u32 = 2;
const STATUS_RECONNECTING: u32 = 3;
const STATUS_CLOSED: u32 = 4;

impl SharedState {
    pub(crate) fn new() -> Self {
        Self {
            status: AtomicU32::new(STATUS_DISCONNECTED),
            in_msgs: AtomicU64::new(0),
            in_bytes: AtomicU64::new(0),
            out_msgs: AtomicU64::new(0),
            out_bytes: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            pending_bytes: AtomicUsize::new(0),
            last_error: ArcSwapOption::empty(),
            info: ArcSwapOption::empty(),
        }
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        match self.status.load(Ordering::Acquire) {
            STATUS_CONNECTING => ConnectionStatus::Connecting,
            STATUS_CONNECTED => ConnectionStatus::Connected,
            STATUS_RECONNECTING => ConnectionStatus::Reconnecting,
            STATUS_CLOSED => ConnectionStatus::Closed,
            _ => ConnectionStatus::Disconnected,
        }
    }

    /// Transition the status; `Closed` is terminal and never overwritten
    pub(crate) fn store_status(&self, status: ConnectionStatus) {
        let val = match status {
            ConnectionStatus::Disconnected => STATUS_DISCONNECTED,
            ConnectionStatus::Connecting => STATUS_CONNECTING,
            ConnectionStatus::Connected => STATUS_CONNECTED,
            ConnectionStatus::Reconnecting => STATUS_RECONNECTING,
            ConnectionStatus::Closed => STATUS_CLOSED,
        };

        let _ = self
            .status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| {
                (prev != STATUS_CLOSED).then_some(val)
            });
    }

    pub(crate) fn record_in_message(&self, payload_len: usize) {
        self.in_msgs.fetch_add(1, Ordering::AcqRel);
        self.in_bytes
            .fetch_add(payload_len as u64, Ordering::AcqRel);
    }

    pub(crate) fn record_out_message(&self, payload_len: usize) {
        self.out_msgs.fetch_add(1, Ordering::AcqRel);
        self.out_bytes
            .fetch_add(payload_len as u64, Ordering::AcqRel);
    }

    pub(crate) fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn stats(&self) -> ClientStatistics {
        ClientStatistics {
            in_msgs: self.in_msgs.load(Ordering::Acquire),
            in_bytes: self.in_bytes.load(Ordering::Acquire),
            out_msgs: self.out_msgs.load(Ordering::Acquire),
            out_bytes: self.out_bytes.load(Ordering::Acquire),
            reconnects: self.reconnects.load(Ordering::Acquire),
        }
    }

    pub(crate) fn pending_bytes(&self) -> usize {
        self.pending_bytes.load(Ordering::Acquire)
    }

    pub(crate) fn store_pending_bytes(&self, val: usize) {
        self.pending_bytes.store(val, Ordering::Release);
    }

    pub(crate) fn store_info(&self, info: Box<ServerInfo>) {
        self.info.store(Some(Arc::from(info)));
    }

    pub(crate) fn server_info(&self) -> Option<Arc<ServerInfo>> {
        self.info.load_full()
    }

    pub(crate) fn record_error(&self, err: &Error) {
        self.last_error.store(Some(Arc::new(err.clone())));
    }

    pub(crate) fn last_error(&self) -> Option<Error> {
        self.last_error.load().as_deref().cloned()
    }
}

#[cfg(test)]
mod tests {
    use crate::error::{Error, ErrorKind};

    use super::{ConnectionStatus, SharedState};

    #[test]
    fn closed_is_terminal() {
        let state = SharedState::new();
        assert_eq!(ConnectionStatus::Disconnected, state.status());

        state.store_status(ConnectionStatus::Connecting);
        state.store_status(ConnectionStatus::Connected);
        assert_eq!(ConnectionStatus::Connected, state.status());

        state.store_status(ConnectionStatus::Closed);
        state.store_status(ConnectionStatus::Reconnecting);
        assert_eq!(ConnectionStatus::Closed, state.status());
    }

    #[test]
    fn counters_accumulate() {
        let state = SharedState::new();
        state.record_in_message(10);
        state.record_in_message(5);
        state.record_out_message(3);
        state.record_reconnect();

        let stats = state.stats();
        assert_eq!(2, stats.in_msgs);
        assert_eq!(15, stats.in_bytes);
        assert_eq!(1, stats.out_msgs);
        assert_eq!(3, stats.out_bytes);
        assert_eq!(1, stats.reconnects);
    }

    #[test]
    fn remembers_last_error() {
        let state = SharedState::new();
        assert!(state.last_error().is_none());

        state.record_error(&Error::new(ErrorKind::Timeout));
        state.record_error(&Error::new(ErrorKind::SlowConsumer));
        assert_eq!(
            ErrorKind::SlowConsumer,
            state.last_error().unwrap().kind()
        );
    }
}
