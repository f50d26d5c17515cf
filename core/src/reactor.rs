use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ferrite_support::error::Result;
use mio::{Events, Poll, PollOpt, Ready, Token};
use slog::{o, warn, Logger};

/// Default poll timeout: bounded by the smallest active timer.
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(5);

// `IoCallback`/`TimerCallback` only ever run on the reactor thread itself
// (registered from it, invoked from it), so unlike `Submission` — which
// crosses threads through `submit_async`/`submit_sync` — they carry no
// `Send` bound. That lets session code close over an `Rc<RefCell<_>>`
// instead of an `Arc<Mutex<_>>` for state only the reactor thread touches.
pub type IoCallback = Box<dyn FnMut(Ready)>;
pub type TimerCallback = Box<dyn FnMut()>;
pub type Submission = Box<dyn FnOnce() + Send>;

/// How `modify` changes a registration's interest set.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum InterestChange {
    Replace,
    Add,
    Remove,
}

struct Timer {
    period: Duration,
    next_fire: Instant,
    callback: TimerCallback,
    stopped: bool,
}

/// Cross-thread work queued for the reactor's own thread to run.
/// `add`/`remove`/`modify` mutate `Reactor` state directly rather than going
/// through this queue, since every caller of those already holds `&mut
/// Reactor` on the reactor's own thread; only `submit_async`/`submit_sync`
/// cross a thread boundary.
enum Work {
    Submit(Submission),
}

/// Single-threaded cooperative reactor. Owns one `mio::Poll`;
/// callers on other threads reach it only through `submit`, which wakes the
/// loop via a dedicated registration. `run_once` is the whole iteration:
/// drain pending subscription changes, poll, dispatch, check timers.
pub struct Reactor {
    poll: Poll,
    events: Events,
    io_callbacks: HashMap<Token, IoCallback>,
    timers: HashMap<Token, Timer>,
    pending: Arc<Mutex<Vec<Work>>>,
    wake_registration: mio::Registration,
    wake_readiness: mio::SetReadiness,
    next_token: AtomicUsize,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    log: Logger,
}

const WAKE_TOKEN: Token = Token(0);
const FIRST_USER_TOKEN: usize = 1;

impl Reactor {
    pub fn new(log: Logger) -> io::Result<Reactor> {
        let poll = Poll::new()?;
        let (wake_registration, set_readiness) = mio::Registration::new2();
        poll.register(&wake_registration, WAKE_TOKEN, Ready::readable(), PollOpt::edge())?;

        let (wake_tx, wake_rx) = mpsc::channel();
        // `set_readiness` is what actually nudges the poll; `submit_async`
        // calls it after queueing work so the loop notices before its next
        // timer-bounded timeout instead of waiting one out.

        Ok(Reactor {
            poll,
            events: Events::with_capacity(1024),
            io_callbacks: HashMap::new(),
            timers: HashMap::new(),
            pending: Arc::new(Mutex::new(Vec::new())),
            wake_registration,
            wake_readiness: set_readiness,
            next_token: AtomicUsize::new(FIRST_USER_TOKEN),
            wake_tx,
            wake_rx,
            log: log.new(o!("component" => "reactor")),
        })
    }

    fn alloc_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Registers a handle for the given interest set and callback, invoked
    /// with the handle and the readiness that triggered it.
    pub fn add(&mut self, handle: &dyn mio::Evented, interest: Ready, callback: IoCallback) -> Result<Token> {
        let token = self.alloc_token();
        self.poll.register(handle, token, interest, PollOpt::edge())?;
        self.io_callbacks.insert(token, callback);
        Ok(token)
    }

    pub fn remove(&mut self, handle: &dyn mio::Evented, token: Token) -> Result<()> {
        self.poll.deregister(handle)?;
        self.io_callbacks.remove(&token);
        Ok(())
    }

    pub fn modify(
        &mut self,
        handle: &dyn mio::Evented,
        token: Token,
        interest: Ready,
        change: InterestChange,
    ) -> Result<()> {
        let _ = change; // mio 0.6's reregister always replaces the interest set.
        self.poll.reregister(handle, token, interest, PollOpt::edge())?;
        Ok(())
    }

    pub fn create_timer(&mut self, period: Duration, callback: TimerCallback) -> Token {
        let token = self.alloc_token();
        self.timers.insert(
            token,
            Timer {
                period,
                next_fire: Instant::now() + period,
                callback,
                stopped: false,
            },
        );
        token
    }

    pub fn stop_timer(&mut self, token: Token) {
        if let Some(timer) = self.timers.get_mut(&token) {
            timer.stopped = true;
        }
    }

    /// Cross-thread submission. `async` returns immediately;
    /// `sync` blocks the caller until the closure has run on the loop
    /// thread.
    pub fn submit_async(&self, closure: Submission) {
        self.pending.lock().unwrap().push(Work::Submit(closure));
        let _ = self.wake_tx.send(());
        let _ = self.wake_readiness.set_readiness(Ready::readable());
    }

    pub fn submit_sync<F: FnOnce() + Send + 'static>(&self, closure: F) {
        let (tx, rx) = mpsc::channel::<()>();
        self.submit_async(Box::new(move || {
            closure();
            let _ = tx.send(());
        }));
        let _ = rx.recv();
    }

    /// One loop iteration: drain subscription work,
    /// poll with a timeout bounded by the nearest timer, dispatch ready I/O,
    /// then fire any due timers.
    pub fn run_once(&mut self) -> io::Result<()> {
        self.drain_pending();

        let timeout = self.next_timeout();
        if let Err(err) = self.poll.poll(&mut self.events, Some(timeout)) {
            log_poll_error(&self.log, &err);
            return Err(err);
        }

        // Drain (and ignore the payloads of) cross-thread wake notifications.
        while self.wake_rx.try_recv().is_ok() {}

        let ready: Vec<(Token, Ready)> = self.events.iter().map(|e| (e.token(), e.readiness())).collect();
        for (token, readiness) in ready {
            if token == WAKE_TOKEN {
                let _ = self.wake_readiness.set_readiness(Ready::empty());
                self.drain_pending();
                continue;
            }
            if let Some(callback) = self.io_callbacks.get_mut(&token) {
                // Callers own the actual `Evented` handle (a socket); the
                // reactor only tracks the callback, which closes over its own
                // handle.
                callback(readiness);
            }
        }

        self.fire_timers();
        Ok(())
    }

    fn next_timeout(&self) -> Duration {
        let now = Instant::now();
        self.timers
            .values()
            .filter(|t| !t.stopped)
            .map(|t| t.next_fire.saturating_duration_since(now))
            .min()
            .unwrap_or(DEFAULT_POLL_TIMEOUT)
            .min(DEFAULT_POLL_TIMEOUT)
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        let due: Vec<Token> = self
            .timers
            .iter()
            .filter(|(_, t)| !t.stopped && t.next_fire <= now)
            .map(|(tok, _)| *tok)
            .collect();

        for token in due {
            if let Some(timer) = self.timers.get_mut(&token) {
                (timer.callback)();
                timer.next_fire = now + timer.period;
            }
        }
    }

    fn drain_pending(&mut self) {
        let work: Vec<Work> = std::mem::take(&mut *self.pending.lock().unwrap());
        for item in work {
            match item {
                Work::Submit(closure) => closure(),
            }
        }
    }
}

fn log_poll_error(log: &Logger, err: &io::Error) {
    warn!(log, "reactor poll failed"; "error" => %err);
}
