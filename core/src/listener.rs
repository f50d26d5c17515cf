use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use ferrite_support::error::Result;
use slog::{o, warn, Logger};

use crate::handle::{Handle, SlotTable};
use crate::value::Value;

/// Default listener table capacity.
pub const DEFAULT_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EventType {
    Created,
    Deleted,
    ValueChanged,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub timestamp: u64,
    pub event_type: EventType,
    pub path: String,
    pub old_value: Value,
    pub new_value: Value,
}

pub type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

struct Listener {
    prefix: String,
    creation_timestamp: u64,
    callback: Callback,
}

struct Shared {
    listeners: Mutex<SlotTable<Listener>>,
    queue: Mutex<VecDeque<Event>>,
    cv: Condvar,
    stopped: Mutex<bool>,
    log: Logger,
}

/// Prefix-matched, time-filtered event fan-out on a dedicated worker thread.
/// Producers call `notify`; the worker wakes, moves the queue
/// aside, and delivers each event without holding either the listener or
/// the queue lock during a callback.
pub struct ListenerDispatcher {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl ListenerDispatcher {
    pub fn new(log: Logger, capacity: usize) -> ListenerDispatcher {
        let shared = Arc::new(Shared {
            listeners: Mutex::new(SlotTable::with_capacity(capacity)),
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            stopped: Mutex::new(false),
            log: log.new(o!("component" => "listener-dispatcher")),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("listener-dispatcher".to_string())
            .spawn(move || run(worker_shared))
            .expect("failed to spawn listener dispatcher thread");

        ListenerDispatcher {
            shared,
            worker: Some(worker),
        }
    }

    pub fn register(
        &self,
        prefix: String,
        creation_timestamp: u64,
        callback: Callback,
    ) -> Result<Handle> {
        let mut listeners = self.shared.listeners.lock().unwrap();
        listeners.insert(Listener {
            prefix,
            creation_timestamp,
            callback,
        })
    }

    pub fn deregister(&self, handle: Handle) -> Result<()> {
        let mut listeners = self.shared.listeners.lock().unwrap();
        listeners.remove(handle)?;
        Ok(())
    }

    pub fn notify(&self, event: Event) {
        let mut queue = self.shared.queue.lock().unwrap();
        queue.push_back(event);
        self.shared.cv.notify_one();
    }
}

impl Drop for ListenerDispatcher {
    fn drop(&mut self) {
        *self.shared.stopped.lock().unwrap() = true;
        self.shared.cv.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run(shared: Arc<Shared>) {
    loop {
        let mut queue = shared.queue.lock().unwrap();
        while queue.is_empty() && !*shared.stopped.lock().unwrap() {
            queue = shared.cv.wait(queue).unwrap();
        }

        if queue.is_empty() && *shared.stopped.lock().unwrap() {
            return;
        }

        let drained: VecDeque<Event> = std::mem::take(&mut *queue);
        drop(queue);

        for event in drained {
            deliver(&shared, &event);
        }
    }
}

fn deliver(shared: &Shared, event: &Event) {
    let matching: Vec<Callback> = {
        let listeners = shared.listeners.lock().unwrap();
        listeners
            .iter()
            .filter(|(_, l)| {
                event.path.starts_with(&l.prefix) && event.timestamp >= l.creation_timestamp
            })
            .map(|(_, l)| Arc::clone(&l.callback))
            .collect()
    };

    for callback in matching {
        let result = panic::catch_unwind(AssertUnwindSafe(|| callback(event)));
        if result.is_err() {
            warn!(shared.log, "listener callback panicked"; "path" => &event.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrite_support::logging;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn delivers_only_to_matching_prefix() {
        let dispatcher = ListenerDispatcher::new(logging::init(), DEFAULT_CAPACITY);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);

        dispatcher
            .register(
                "/a".to_string(),
                0,
                Arc::new(move |_event: &Event| {
                    hits_clone.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        dispatcher.notify(Event {
            timestamp: 1,
            event_type: EventType::ValueChanged,
            path: "/a/b".to_string(),
            old_value: Value::Empty,
            new_value: Value::I32(1),
        });
        dispatcher.notify(Event {
            timestamp: 1,
            event_type: EventType::ValueChanged,
            path: "/other".to_string(),
            old_value: Value::Empty,
            new_value: Value::I32(1),
        });

        // give the worker thread a moment; deterministic tests would use a
        // sync channel, kept simple here since this is a smoke test.
        thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn ignores_events_before_creation_timestamp() {
        let dispatcher = ListenerDispatcher::new(logging::init(), DEFAULT_CAPACITY);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);

        dispatcher
            .register(
                "/".to_string(),
                100,
                Arc::new(move |_event: &Event| {
                    hits_clone.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        dispatcher.notify(Event {
            timestamp: 50,
            event_type: EventType::Created,
            path: "/x".to_string(),
            old_value: Value::Empty,
            new_value: Value::Empty,
        });

        thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
