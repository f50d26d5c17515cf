use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Ready, Token};
use slog::{debug, info, o, warn, Logger};

use crate::clock::Clock;
use crate::queue::{EnqueueFlags, MessageQueue};
use crate::reactor::Reactor;
use crate::storage::{Storage, UNASSIGNED_NET_ID};
use crate::wire::{self, FrameEvent, FrameReader, Message};

use super::FRAME_CAPACITY;

const DEFAULT_CONNECT_RETRY: Duration = Duration::from_millis(1000);
const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_millis(1000);

/// Client connection states.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ClientState {
    Idle,
    Opening,
    Connecting,
    HandshakeSyncing,
    HandshakeSyncSent,
    HandshakeReporting,
    Handshaking,
    Active,
}

/// The client-side connect/handshake/resync state machine. Owns
/// its socket and framing; driven by [`tick`] (called every reactor loop
/// iteration, like the original's `client::update()`) and by the I/O
/// callback registered when a connection attempt starts.
pub struct ClientSession {
    state: ClientState,
    target: Option<SocketAddr>,
    socket: Option<TcpStream>,
    token: Option<Token>,
    reader: FrameReader,
    queue: MessageQueue,
    retry_started: Option<Instant>,
    sync_started: Option<Instant>,
    closed: bool,
    storage: Arc<Storage>,
    clock: Arc<Clock>,
    connect_retry: Duration,
    sync_interval: Duration,
    log: Logger,
}

impl ClientSession {
    pub fn new(storage: Arc<Storage>, clock: Arc<Clock>, log: Logger) -> ClientSession {
        ClientSession {
            state: ClientState::Idle,
            target: None,
            socket: None,
            token: None,
            reader: FrameReader::new(crate::wire::buffer::DEFAULT_CAPACITY),
            queue: MessageQueue::new(crate::wire::buffer::DEFAULT_CAPACITY),
            retry_started: None,
            sync_started: None,
            closed: false,
            storage,
            clock,
            connect_retry: DEFAULT_CONNECT_RETRY,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            log: log.new(o!("component" => "client-session")),
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Overrides the connect-retry and clock-sync intervals from their
    /// 1000ms defaults, e.g. from a loaded `ClientConfig`.
    pub fn configure(&mut self, connect_retry: Duration, sync_interval: Duration) {
        self.connect_retry = connect_retry;
        self.sync_interval = sync_interval;
    }

    /// `start(host, port)`: clears locally-held net-ids (the
    /// server will hand out fresh ones), stops the retry/sync timers, and
    /// moves to `Opening`.
    pub fn start(&mut self, target: SocketAddr) {
        self.storage.clear_net_ids();
        self.retry_started = None;
        self.sync_started = None;
        self.target = Some(target);
        self.state = ClientState::Opening;
    }

    pub fn stop(&mut self, reactor: &mut Reactor) {
        self.teardown(reactor);
        self.state = ClientState::Idle;
    }

    fn teardown(&mut self, reactor: &mut Reactor) {
        if let (Some(socket), Some(token)) = (self.socket.take(), self.token.take()) {
            let _ = reactor.remove(&socket, token);
        }
        self.reader = FrameReader::new(crate::wire::buffer::DEFAULT_CAPACITY);
        self.queue = MessageQueue::new(crate::wire::buffer::DEFAULT_CAPACITY);
    }

    fn sync_due(&self) -> bool {
        self.sync_started
            .map(|t| t.elapsed() >= self.sync_interval)
            .unwrap_or(true)
    }

    fn send(&mut self, message: Message, flags: EnqueueFlags) -> bool {
        if !self.queue.enqueue(&message, flags, FRAME_CAPACITY) {
            return false;
        }
        if let Some(socket) = &self.socket {
            if self.queue.flush(socket).is_err() {
                self.closed = true;
            }
        }
        true
    }

    fn on_message(&mut self, message: Message) {
        match message {
            Message::EntryCreate { send_time, id, name, value } => {
                if let Err(err) = self.storage.on_entry_created(id, &name, value, send_time) {
                    warn!(self.log, "failed to apply remote entry create"; "error" => %err);
                }
            }
            Message::EntryUpdate { send_time, id, value } => {
                if let Err(err) = self.storage.on_entry_updated(id, value, send_time) {
                    warn!(self.log, "failed to apply remote entry update"; "error" => %err);
                }
            }
            Message::EntryDelete { send_time, id } => {
                if let Err(err) = self.storage.on_entry_deleted(id, send_time) {
                    warn!(self.log, "failed to apply remote entry delete"; "error" => %err);
                }
            }
            Message::EntryIdAssign { id, name } => {
                if let Err(err) = self.storage.on_entry_id_assigned(id, &name) {
                    warn!(self.log, "failed to record entry id assignment"; "error" => %err);
                }
            }
            Message::HandshakeFinished => {
                info!(self.log, "handshake finished, entering active state");
                self.state = ClientState::Active;
                self.sync_started = Some(Instant::now());
            }
            Message::TimeSyncResponse { send_time, request_time } => {
                let local_recv = self.clock.now();
                self.clock.sync(request_time, request_time, send_time, local_recv);
                debug!(self.log, "synced clock with server"; "offset_basis" => send_time);

                if self.state == ClientState::HandshakeSyncSent {
                    if self.send(Message::HandshakeReady, EnqueueFlags::IMMEDIATE) {
                        self.state = ClientState::Handshaking;
                    } else {
                        self.state = ClientState::HandshakeReporting;
                    }
                } else {
                    self.sync_started = Some(Instant::now());
                }
            }
            Message::HandshakeReady | Message::TimeSyncRequest { .. } => {
                warn!(self.log, "received server-only message on client session");
            }
        }
    }

    fn on_ready(&mut self, ready: Ready) {
        if self.state == ClientState::Connecting && ready.is_writable() {
            let ok = self
                .socket
                .as_ref()
                .and_then(|s| s.take_error().ok())
                .flatten()
                .is_none();

            if !ok {
                self.closed = true;
                return;
            }

            info!(self.log, "connected to server, starting first time sync");
            let now = self.clock.now();
            if self.send(Message::TimeSyncRequest { send_time: now }, EnqueueFlags::IMMEDIATE) {
                self.state = ClientState::HandshakeSyncSent;
            } else {
                self.state = ClientState::HandshakeSyncing;
            }
            return;
        }

        if ready.is_readable() {
            self.read_available();
        }
        if ready.is_writable() {
            if let Some(socket) = &self.socket {
                if self.queue.flush(socket).is_err() {
                    self.closed = true;
                }
            }
        }
    }

    fn read_available(&mut self) {
        let socket = match &self.socket {
            Some(s) => s,
            None => return,
        };

        if let Err(err) = self.reader.fill(socket) {
            if !err.is_wait() {
                warn!(self.log, "read failed, closing session"; "error" => %err);
                self.closed = true;
            }
            return;
        }

        loop {
            match self.reader.poll() {
                FrameEvent::NeedMore => break,
                FrameEvent::Error(err) => {
                    debug!(self.log, "discarding malformed frame"; "error" => %err);
                }
                FrameEvent::Frame(header, payload) => match wire::decode(header.type_tag, &payload) {
                    Ok(message) => self.on_message(message),
                    Err(err) => debug!(self.log, "failed to decode message"; "error" => %err),
                },
            }
        }
    }
}

/// Drives dirty-entry replication for an `Active` session: for
/// each dirty entry, emit `EntryDelete`/`EntryCreate`/`EntryUpdate` as
/// appropriate; a dirty, net-id-less tombstone is dropped silently (nothing
/// to tell the server it never heard about).
fn drain_dirty(session: &Rc<RefCell<ClientSession>>) {
    let storage = Arc::clone(&session.borrow().storage);
    let clock = Arc::clone(&session.borrow().clock);

    storage.drain_dirty(|snapshot| {
        let mut s = session.borrow_mut();
        let now = clock.now();

        if snapshot.deleted {
            if snapshot.net_id == UNASSIGNED_NET_ID {
                return true; // server never heard of this entry; nothing to delete
            }
            return s.send(
                Message::EntryDelete { send_time: now, id: snapshot.net_id },
                EnqueueFlags::NONE,
            );
        }

        if snapshot.net_id == UNASSIGNED_NET_ID {
            s.send(
                Message::EntryCreate {
                    send_time: now,
                    id: UNASSIGNED_NET_ID,
                    name: snapshot.path.clone(),
                    value: snapshot.value.clone(),
                },
                EnqueueFlags::NONE,
            )
        } else {
            s.send(
                Message::EntryUpdate {
                    send_time: now,
                    id: snapshot.net_id,
                    value: snapshot.value.clone(),
                },
                EnqueueFlags::NONE,
            )
        }
    });
}

fn open_and_connect(session: &Rc<RefCell<ClientSession>>, reactor: &mut Reactor) {
    let target = session.borrow().target.expect("Opening requires a target");

    let socket = match TcpStream::connect(&target) {
        Ok(socket) => socket,
        Err(err) => {
            let mut s = session.borrow_mut();
            warn!(s.log, "connect failed, will retry"; "error" => %err);
            s.retry_started = Some(Instant::now());
            return;
        }
    };

    let weak = Rc::clone(session);
    let callback_ready = Box::new(move |ready: Ready| {
        weak.borrow_mut().on_ready(ready);
    });

    let token = match reactor.add(&socket, Ready::readable() | Ready::writable(), callback_ready) {
        Ok(token) => token,
        Err(err) => {
            let mut s = session.borrow_mut();
            warn!(s.log, "failed to register socket with reactor"; "error" => %err);
            s.retry_started = Some(Instant::now());
            return;
        }
    };

    let mut s = session.borrow_mut();
    s.socket = Some(socket);
    s.token = Some(token);
    s.state = ClientState::Connecting;
}

/// One reactor-tick's worth of client session work. Called
/// on a fast repeating timer rather than only on socket readiness, since
/// `Opening`'s retry backoff and `Active`'s dirty-drain have nothing to do
/// with I/O readiness.
pub fn tick(session: &Rc<RefCell<ClientSession>>, reactor: &mut Reactor) {
    let (state, closed) = {
        let s = session.borrow();
        (s.state, s.closed)
    };

    if closed && state != ClientState::Idle {
        let mut s = session.borrow_mut();
        s.teardown(reactor);
        s.state = ClientState::Opening;
        s.retry_started = Some(Instant::now());
        return;
    }

    match state {
        ClientState::Idle => {}
        ClientState::Opening => {
            let retry_ready = {
                let s = session.borrow();
                s.retry_started.map(|t| t.elapsed() >= s.connect_retry).unwrap_or(true)
            };
            if retry_ready {
                open_and_connect(session, reactor);
            }
        }
        ClientState::HandshakeSyncing => {
            let mut s = session.borrow_mut();
            let now = s.clock.now();
            if s.send(Message::TimeSyncRequest { send_time: now }, EnqueueFlags::IMMEDIATE) {
                s.state = ClientState::HandshakeSyncSent;
            }
        }
        ClientState::HandshakeReporting => {
            let mut s = session.borrow_mut();
            if s.send(Message::HandshakeReady, EnqueueFlags::IMMEDIATE) {
                s.state = ClientState::Handshaking;
            }
        }
        ClientState::Connecting | ClientState::HandshakeSyncSent | ClientState::Handshaking => {
            // driven entirely by incoming messages and connect completion.
        }
        ClientState::Active => {
            if session.borrow().sync_due() {
                let mut s = session.borrow_mut();
                let now = s.clock.now();
                if s.send(Message::TimeSyncRequest { send_time: now }, EnqueueFlags::IMMEDIATE) {
                    s.sync_started = Some(Instant::now());
                }
            }
            drain_dirty(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrite_support::logging;

    fn new_session() -> ClientSession {
        let clock = Arc::new(Clock::new());
        let listeners = Arc::new(crate::listener::ListenerDispatcher::new(
            logging::init(),
            crate::listener::DEFAULT_CAPACITY,
        ));
        let storage = Arc::new(Storage::new(
            crate::storage::DEFAULT_CAPACITY,
            Arc::clone(&clock),
            listeners,
            logging::init(),
        ));
        ClientSession::new(storage, clock, logging::init())
    }

    #[test]
    fn start_moves_to_opening_and_clears_net_ids() {
        let mut session = new_session();
        let h = session.storage.get_or_create("/a").unwrap();
        session.storage.assign_net_id(h, 5).unwrap();

        session.start("127.0.0.1:0".parse().unwrap());

        assert_eq!(session.state(), ClientState::Opening);
        assert!(session.storage.handle_for_net_id(5).is_none());
    }

    #[test]
    fn handshake_finished_enters_active_and_starts_sync_timer() {
        let mut session = new_session();
        session.on_message(Message::HandshakeFinished);
        assert_eq!(session.state(), ClientState::Active);
        assert!(session.sync_started.is_some());
    }
}
