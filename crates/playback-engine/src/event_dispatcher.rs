// crates/playback-engine/src/event_dispatcher.rs
//
// EventDispatcher: fans Events out to per-kind and global listeners. Each
// listener resolves its delivery mode at registration time — Direct runs it
// on the dispatching thread right away, Queued banks the event for a later
// drain (manual or via a background thread), Auto picks Direct if the
// dispatcher itself was created on the calling thread, Queued otherwise.
// A panicking listener is caught and logged; it never reaches the caller.

use std::any::Any;
use std::collections::HashMap;
use std::mem::Discriminant;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use tracing::error;

use playback_types::{Event, EventKind};

/// How long the drain thread blocks on the queue channel between stop-flag
/// checks. Bounds reaction latency to `stop_async_processing` without
/// busy-polling.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionType {
    Direct,
    Queued,
    Auto,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

struct Listener {
    id: u64,
    /// Resolved at registration: never `Auto` once stored.
    connection: ConnectionType,
    callback: Arc<dyn Fn(&Event) + Send + Sync>,
}

pub struct EventDispatcher {
    creator_thread: ThreadId,
    next_id: AtomicU64,
    global_listeners: Mutex<Vec<Listener>>,
    type_listeners: Mutex<HashMap<Discriminant<EventKind>, Vec<Listener>>>,
    queue_tx: Sender<Event>,
    queue_rx: Receiver<Event>,
    drain_active: AtomicBool,
    drain_stop: Arc<AtomicBool>,
    drain_thread: Mutex<Option<JoinHandle<()>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        let (queue_tx, queue_rx) = crossbeam_channel::unbounded();
        Self {
            creator_thread: thread::current().id(),
            next_id: AtomicU64::new(1),
            global_listeners: Mutex::new(Vec::new()),
            type_listeners: Mutex::new(HashMap::new()),
            queue_tx,
            queue_rx,
            drain_active: AtomicBool::new(false),
            drain_stop: Arc::new(AtomicBool::new(false)),
            drain_thread: Mutex::new(None),
        }
    }

    fn resolve(&self, connection: ConnectionType) -> ConnectionType {
        match connection {
            ConnectionType::Auto => {
                if thread::current().id() == self.creator_thread {
                    ConnectionType::Direct
                } else {
                    ConnectionType::Queued
                }
            }
            other => other,
        }
    }

    fn next_handle(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Subscribe to every event kind that matches `sample`'s variant
    /// (fields are ignored — only the variant is used as the key).
    pub fn subscribe(
        &self,
        sample: &EventKind,
        connection: ConnectionType,
        listener: impl Fn(&Event) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let id = self.next_handle();
        let entry = Listener {
            id,
            connection: self.resolve(connection),
            callback: Arc::new(listener),
        };
        self.type_listeners
            .lock()
            .unwrap()
            .entry(std::mem::discriminant(sample))
            .or_default()
            .push(entry);
        ListenerHandle(id)
    }

    pub fn subscribe_global(
        &self,
        connection: ConnectionType,
        listener: impl Fn(&Event) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let id = self.next_handle();
        let entry = Listener {
            id,
            connection: self.resolve(connection),
            callback: Arc::new(listener),
        };
        self.global_listeners.lock().unwrap().push(entry);
        ListenerHandle(id)
    }

    pub fn unsubscribe(&self, sample: &EventKind, handle: ListenerHandle) -> bool {
        if let Some(list) = self.type_listeners.lock().unwrap().get_mut(&std::mem::discriminant(sample)) {
            let before = list.len();
            list.retain(|l| l.id != handle.0);
            return list.len() != before;
        }
        false
    }

    pub fn unsubscribe_global(&self, handle: ListenerHandle) -> bool {
        let mut list = self.global_listeners.lock().unwrap();
        let before = list.len();
        list.retain(|l| l.id != handle.0);
        list.len() != before
    }

    /// Deliver `event`. Direct listeners run inline; Queued listeners'
    /// invocation is deferred to the next [`EventDispatcher::pump_queued`].
    pub fn dispatch(&self, event: Event) {
        let mut run_now: Vec<Arc<dyn Fn(&Event) + Send + Sync>> = Vec::new();
        let mut any_queued = false;

        for l in self.global_listeners.lock().unwrap().iter() {
            match l.connection {
                ConnectionType::Direct => run_now.push(Arc::clone(&l.callback)),
                ConnectionType::Queued => any_queued = true,
                ConnectionType::Auto => unreachable!("resolved at registration"),
            }
        }
        if let Some(list) = self.type_listeners.lock().unwrap().get(&std::mem::discriminant(&event.kind)) {
            for l in list {
                match l.connection {
                    ConnectionType::Direct => run_now.push(Arc::clone(&l.callback)),
                    ConnectionType::Queued => any_queued = true,
                    ConnectionType::Auto => unreachable!("resolved at registration"),
                }
            }
        }

        for cb in run_now {
            invoke(&cb, &event);
        }
        if any_queued {
            // An unbounded channel never blocks the dispatching thread; a
            // closed receiver (dispatcher already dropped its queue_rx,
            // which never happens while `self` is alive) would only mean
            // a lost event, not a panic.
            let _ = self.queue_tx.send(event);
        }
    }

    fn deliver_queued(&self, event: &Event) {
        let global = self.global_listeners.lock().unwrap();
        for l in global.iter().filter(|l| l.connection == ConnectionType::Queued) {
            invoke(&l.callback, event);
        }
        drop(global);
        let typed = self.type_listeners.lock().unwrap();
        if let Some(list) = typed.get(&std::mem::discriminant(&event.kind)) {
            for l in list.iter().filter(|l| l.connection == ConnectionType::Queued) {
                invoke(&l.callback, event);
            }
        }
    }

    /// Deliver every currently-banked event to Queued listeners, without
    /// blocking for more to arrive.
    pub fn pump_queued(&self) {
        while let Ok(event) = self.queue_rx.try_recv() {
            self.deliver_queued(&event);
        }
    }

    pub fn start_async_processing(self: &Arc<Self>) {
        if self.drain_active.swap(true, Ordering::AcqRel) {
            return;
        }
        self.drain_stop.store(false, Ordering::Release);
        let this = Arc::clone(self);
        let stop = Arc::clone(&self.drain_stop);
        let handle = thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                match this.queue_rx.recv_timeout(DRAIN_POLL_INTERVAL) {
                    Ok(event) => this.deliver_queued(&event),
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                }
            }
        });
        *self.drain_thread.lock().unwrap() = Some(handle);
    }

    pub fn stop_async_processing(&self) {
        if !self.drain_active.swap(false, Ordering::AcqRel) {
            return;
        }
        self.drain_stop.store(true, Ordering::Release);
        if let Some(handle) = self.drain_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    pub fn is_async_processing_active(&self) -> bool {
        self.drain_active.load(Ordering::Acquire)
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        self.stop_async_processing();
    }
}

fn invoke(callback: &Arc<dyn Fn(&Event) + Send + Sync>, event: &Event) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| callback(event)));
    if let Err(payload) = result {
        error!(panic = %describe_panic(&payload), "event listener panicked");
    }
}

fn describe_panic(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn direct_listener_runs_inline() {
        let dispatcher = EventDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c2 = Arc::clone(&count);
        dispatcher.subscribe_global(ConnectionType::Direct, move |_| {
            c2.fetch_add(1, Ordering::SeqCst);
        });
        dispatcher.dispatch(Event::new("test", "x", EventKind::StreamEnded));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn queued_listener_waits_for_pump() {
        let dispatcher = EventDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c2 = Arc::clone(&count);
        dispatcher.subscribe_global(ConnectionType::Queued, move |_| {
            c2.fetch_add(1, Ordering::SeqCst);
        });
        dispatcher.dispatch(Event::new("test", "x", EventKind::StreamEnded));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        dispatcher.pump_queued();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn type_listener_only_matches_its_variant() {
        let dispatcher = EventDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c2 = Arc::clone(&count);
        dispatcher.subscribe(&EventKind::StreamEnded, ConnectionType::Direct, move |_| {
            c2.fetch_add(1, Ordering::SeqCst);
        });
        dispatcher.dispatch(Event::new("test", "x", EventKind::StreamClosed));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        dispatcher.dispatch(Event::new("test", "x", EventKind::StreamEnded));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_listener_does_not_propagate() {
        let dispatcher = EventDispatcher::new();
        dispatcher.subscribe_global(ConnectionType::Direct, |_| panic!("boom"));
        dispatcher.dispatch(Event::new("test", "x", EventKind::StreamEnded));
    }

    #[test]
    fn async_drain_thread_delivers_queued_events_without_manual_pump() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let count = Arc::new(AtomicUsize::new(0));
        let c2 = Arc::clone(&count);
        dispatcher.subscribe_global(ConnectionType::Queued, move |_| {
            c2.fetch_add(1, Ordering::SeqCst);
        });
        dispatcher.start_async_processing();
        dispatcher.dispatch(Event::new("test", "x", EventKind::StreamEnded));
        for _ in 0..200 {
            if count.load(Ordering::SeqCst) == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        dispatcher.stop_async_processing();
    }

    #[test]
    fn unsubscribe_global_removes_listener() {
        let dispatcher = EventDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c2 = Arc::clone(&count);
        let handle = dispatcher.subscribe_global(ConnectionType::Direct, move |_| {
            c2.fetch_add(1, Ordering::SeqCst);
        });
        assert!(dispatcher.unsubscribe_global(handle));
        dispatcher.dispatch(Event::new("test", "x", EventKind::StreamEnded));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
