use std::fmt;
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::error::Error;

/// A lifecycle event emitted by the connection driver
#[derive(Debug)]
pub(crate) enum Event {
    Connected,
    Disconnected,
    Reconnected,
    Closed,
    AsyncError(Error),
}

/// User callbacks for lifecycle events
///
/// Invoked serially by a per-client dispatcher task, so for one client
/// `connected` → `disconnected` → `reconnected` → `closed` can never be
/// observed out of order or concurrently.
#[derive(Default)]
pub(crate) struct EventCallbacks {
    pub(crate) connected: Mutex<Option<Box<dyn FnMut() + Send>>>,
    pub(crate) disconnected: Mutex<Option<Box<dyn FnMut() + Send>>>,
    pub(crate) reconnected: Mutex<Option<Box<dyn FnMut() + Send>>>,
    pub(crate) closed: Mutex<Option<Box<dyn FnMut() + Send>>>,
    pub(crate) async_error: Mutex<Option<Box<dyn FnMut(Error) + Send>>>,
}

impl fmt::Debug for EventCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventCallbacks")
            .field("connected", &self.connected.lock().unwrap().is_some())
            .field("disconnected", &self.disconnected.lock().unwrap().is_some())
            .field("reconnected", &self.reconnected.lock().unwrap().is_some())
            .field("closed", &self.closed.lock().unwrap().is_some())
            .field("async_error", &self.async_error.lock().unwrap().is_some())
            .finish()
    }
}

/// Drain lifecycle events and invoke the matching callbacks.
///
/// Runs as its own task so slow or blocking user callbacks never stall
/// the connection handler. Exits once every event sender is gone, which
/// happens after the driver has published `Closed`.
pub(crate) async fn dispatch_events(
    mut events: mpsc::UnboundedReceiver<Event>,
    callbacks: EventCallbacks,
) {
    while let Some(event) = events.recv().await {
        match event {
            Event::Connected => {
                if let Some(cb) = callbacks.connected.lock().unwrap().as_mut() {
                    cb();
                }
            }
            Event::Disconnected => {
                if let Some(cb) = callbacks.disconnected.lock().unwrap().as_mut() {
                    cb();
                }
            }
            Event::Reconnected => {
                if let Some(cb) = callbacks.reconnected.lock().unwrap().as_mut() {
                    cb();
                }
            }
            Event::Closed => {
                if let Some(cb) = callbacks.closed.lock().unwrap().as_mut() {
                    cb();
                }
            }
            Event::AsyncError(err) => {
                if let Some(cb) = callbacks.async_error.lock().unwrap().as_mut() {
                    cb(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    use tokio::sync::mpsc;

    use crate::error::{Error, ErrorKind};

    use super::{dispatch_events, Event, EventCallbacks};

    #[tokio::test]
    async fn callbacks_fire_in_event_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let push = |log: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str| {
            let log = Arc::clone(log);
            Box::new(move || log.lock().unwrap().push(tag))
        };

        let callbacks = EventCallbacks {
            connected: Mutex::new(Some(push(&log, "connected"))),
            disconnected: Mutex::new(Some(push(&log, "disconnected"))),
            reconnected: Mutex::new(Some(push(&log, "reconnected"))),
            closed: Mutex::new(Some(push(&log, "closed"))),
            async_error: Mutex::new(None),
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        sender.send(Event::Connected).unwrap();
        sender.send(Event::Disconnected).unwrap();
        sender.send(Event::Reconnected).unwrap();
        sender.send(Event::Closed).unwrap();
        drop(sender);

        dispatch_events(receiver, callbacks).await;
        assert_eq!(
            vec!["connected", "disconnected", "reconnected", "closed"],
            *log.lock().unwrap()
        );
    }

    #[tokio::test]
    async fn async_errors_reach_the_callback() {
        let seen = Arc::new(AtomicUsize::new(0));
        let callbacks = EventCallbacks {
            async_error: Mutex::new(Some(Box::new({
                let seen = Arc::clone(&seen);
                move |err: Error| {
                    assert_eq!(ErrorKind::SlowConsumer, err.kind());
                    seen.fetch_add(1, Ordering::AcqRel);
                }
            }))),
            ..EventCallbacks::default()
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        sender
            .send(Event::AsyncError(Error::new(ErrorKind::SlowConsumer)))
            .unwrap();
        drop(sender);

        dispatch_events(receiver, callbacks).await;
        assert_eq!(1, seen.load(Ordering::Acquire));
    }
}
