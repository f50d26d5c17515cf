use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Ready, Token};
use slog::{debug, info, o, warn, Logger};

use crate::clock::Clock;
use crate::queue::{EnqueueFlags, MessageQueue};
use crate::reactor::Reactor;
use crate::storage::{Storage, UNASSIGNED_NET_ID};
use crate::wire::{self, FrameEvent, FrameReader, Message};

use super::FRAME_CAPACITY;

/// Default dirty-drain-and-broadcast cadence (spec §4.8).
const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_millis(200);

/// Per-connection identifier the server assigns on accept, distinct from the
/// wire-level net-id.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct PeerId(u64);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum PeerState {
    Connected,
    InHandshake,
    Active,
}

struct Peer {
    socket: TcpStream,
    token: Token,
    state: PeerState,
    reader: FrameReader,
    queue: MessageQueue,
    known_net_ids: HashSet<u16>,
    closed: bool,
}

impl Peer {
    fn is_known(&self, id: u16) -> bool {
        self.known_net_ids.contains(&id)
    }

    fn publish(&mut self, id: u16, path: &str) {
        self.enqueue(Message::EntryIdAssign { id, name: path.to_string() }, EnqueueFlags::NONE);
        self.known_net_ids.insert(id);
    }

    fn enqueue(&mut self, message: Message, flags: EnqueueFlags) {
        if !self.queue.enqueue(&message, flags, FRAME_CAPACITY) {
            return;
        }
        if flags.contains(EnqueueFlags::IMMEDIATE) && self.queue.flush(&self.socket).is_err() {
            self.closed = true;
        }
    }

    fn flush(&mut self) {
        if self.queue.flush(&self.socket).is_err() {
            self.closed = true;
        }
    }
}

/// Server-side per-peer lifecycle plus accept loop and id allocation.
/// Wrapped in `Rc<RefCell<_>>` by callers so accept and
/// per-peer readiness callbacks registered on the reactor can share it.
pub struct ServerSession {
    listener: Option<TcpListener>,
    listener_token: Option<Token>,
    peers: HashMap<PeerId, Peer>,
    next_peer_id: u64,
    next_net_id: u16,
    /// `net_id -> path`, replayed to newly-handshaking peers.
    id_assignments: HashMap<u16, String>,
    /// Set by the listener's I/O callback, drained by [`tick`]. The
    /// callback can't call `accept_all` itself — it only gets a `Ready`,
    /// not `&mut Reactor` — so it just raises this flag instead.
    accept_pending: bool,
    storage: Arc<Storage>,
    clock: Arc<Clock>,
    update_interval: Duration,
    last_drain: Instant,
    log: Logger,
}

impl ServerSession {
    pub fn new(storage: Arc<Storage>, clock: Arc<Clock>, log: Logger) -> ServerSession {
        ServerSession {
            listener: None,
            listener_token: None,
            peers: HashMap::new(),
            next_peer_id: 0,
            next_net_id: 0,
            id_assignments: HashMap::new(),
            accept_pending: false,
            storage,
            clock,
            update_interval: DEFAULT_UPDATE_INTERVAL,
            last_drain: Instant::now(),
            log: log.new(o!("component" => "server-session")),
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Overrides the 200ms dirty-drain-and-broadcast cadence, e.g. from a
    /// loaded `ServerConfig`.
    pub fn configure(&mut self, update_interval: Duration) {
        self.update_interval = update_interval;
    }

    fn assign_id(&mut self, path: &str) -> u16 {
        let id = self.next_net_id;
        self.next_net_id = self.next_net_id.wrapping_add(1);
        self.id_assignments.insert(id, path.to_string());
        id
    }

    fn broadcast(&mut self, message: Message, skip: PeerId) {
        let id = match &message {
            Message::EntryCreate { id, .. } | Message::EntryUpdate { id, .. } | Message::EntryDelete { id, .. } => *id,
            _ => return,
        };
        let path = self.id_assignments.get(&id).cloned();

        for (&peer_id, peer) in self.peers.iter_mut() {
            if peer_id == skip {
                continue;
            }
            if !peer.is_known(id) {
                if let Some(path) = &path {
                    peer.publish(id, path);
                }
            }
            peer.enqueue(message.clone(), EnqueueFlags::NONE);
        }
    }

    fn on_peer_message(&mut self, peer_id: PeerId, message: Message) {
        match message {
            Message::EntryCreate { send_time, mut id, name, value } => {
                if id == UNASSIGNED_NET_ID {
                    id = self.assign_id(&name);
                }
                if let Err(err) = self.storage.on_entry_created(id, &name, value.clone(), send_time) {
                    warn!(self.log, "failed to apply peer entry create"; "error" => %err);
                    return;
                }
                self.broadcast(Message::EntryCreate { send_time, id, name, value }, peer_id);
            }
            Message::EntryUpdate { send_time, id, value } => {
                if let Err(err) = self.storage.on_entry_updated(id, value.clone(), send_time) {
                    warn!(self.log, "failed to apply peer entry update"; "error" => %err);
                    return;
                }
                self.broadcast(Message::EntryUpdate { send_time, id, value }, peer_id);
            }
            Message::EntryDelete { send_time, id } => {
                if let Err(err) = self.storage.on_entry_deleted(id, send_time) {
                    warn!(self.log, "failed to apply peer entry delete"; "error" => %err);
                    return;
                }
                self.broadcast(Message::EntryDelete { send_time, id }, peer_id);
            }
            Message::TimeSyncRequest { send_time } => {
                let now = self.clock.now();
                if let Some(peer) = self.peers.get_mut(&peer_id) {
                    peer.enqueue(
                        Message::TimeSyncResponse { send_time: now, request_time: send_time },
                        EnqueueFlags::IMMEDIATE,
                    );
                }
            }
            Message::HandshakeReady => self.handshake_peer(peer_id),
            Message::EntryIdAssign { .. } | Message::HandshakeFinished | Message::TimeSyncResponse { .. } => {
                warn!(self.log, "received client-only message on server session"; "peer" => peer_id.0);
            }
        }
    }

    /// Replays id assignments and current values, then declares the
    /// handshake finished, exactly once per handshake.
    fn handshake_peer(&mut self, peer_id: PeerId) {
        let now = self.clock.now();
        let assignments: Vec<(u16, String)> = self
            .id_assignments
            .iter()
            .map(|(id, path)| (*id, path.clone()))
            .collect();

        let peer = match self.peers.get_mut(&peer_id) {
            Some(p) => p,
            None => return,
        };

        for (id, path) in assignments {
            if peer.is_known(id) {
                continue;
            }
            peer.publish(id, &path);

            if let Some(handle) = self.storage.handle_for_net_id(id) {
                if let Ok(value) = self.storage.get_value(handle) {
                    peer.enqueue(Message::EntryUpdate { send_time: now, id, value }, EnqueueFlags::NONE);
                }
            }
        }

        peer.enqueue(Message::HandshakeFinished, EnqueueFlags::NONE);
        peer.state = PeerState::Active;
        info!(self.log, "finished handshake for peer"; "peer" => peer_id.0);
    }

    fn on_peer_ready(&mut self, peer_id: PeerId, ready: Ready) {
        if ready.is_readable() {
            let frames = {
                let peer = match self.peers.get_mut(&peer_id) {
                    Some(p) => p,
                    None => return,
                };
                if let Err(err) = peer.reader.fill(&peer.socket) {
                    if !err.is_wait() {
                        peer.closed = true;
                    }
                    Vec::new()
                } else {
                    let mut frames = Vec::new();
                    loop {
                        match peer.reader.poll() {
                            FrameEvent::NeedMore => break,
                            FrameEvent::Error(err) => debug!(self.log, "discarding malformed frame"; "error" => %err),
                            FrameEvent::Frame(header, payload) => frames.push((header.type_tag, payload)),
                        }
                    }
                    frames
                }
            };

            for (type_tag, payload) in frames {
                match wire::decode(type_tag, &payload) {
                    Ok(message) => self.on_peer_message(peer_id, message),
                    Err(err) => debug!(self.log, "failed to decode peer message"; "error" => %err),
                }
            }
        }

        if ready.is_writable() {
            if let Some(peer) = self.peers.get_mut(&peer_id) {
                peer.flush();
            }
        }
    }

    /// Accepts every connection currently queued on the listener. Called
    /// from [`tick`], not from the listener's own I/O callback — that
    /// callback only gets a `Ready`, not `&mut Reactor`, and registering a
    /// freshly-accepted peer's socket needs one.
    fn accept_all(session: &Rc<RefCell<ServerSession>>, reactor: &mut Reactor) {
        loop {
            let accepted = {
                let s = session.borrow();
                let listener = match &s.listener {
                    Some(l) => l,
                    None => return,
                };
                match listener.accept() {
                    Ok(pair) => Some(pair),
                    Err(err) => {
                        if err.kind() != std::io::ErrorKind::WouldBlock {
                            warn!(s.log, "accept failed"; "error" => %err);
                        }
                        None
                    }
                }
            };

            let (socket, addr) = match accepted {
                Some(pair) => pair,
                None => return,
            };

            let peer_id = {
                let mut s = session.borrow_mut();
                let id = PeerId(s.next_peer_id);
                s.next_peer_id += 1;
                id
            };

            let weak = Rc::clone(session);
            let callback = Box::new(move |ready: Ready| {
                weak.borrow_mut().on_peer_ready(peer_id, ready);
            });

            let token = match reactor.add(&socket, Ready::readable() | Ready::writable(), callback) {
                Ok(token) => token,
                Err(err) => {
                    warn!(session.borrow().log, "failed to register accepted peer"; "error" => %err);
                    continue;
                }
            };

            let mut s = session.borrow_mut();
            info!(s.log, "accepted peer"; "peer" => peer_id.0, "addr" => %addr);
            s.peers.insert(
                peer_id,
                Peer {
                    socket,
                    token,
                    state: PeerState::InHandshake,
                    reader: FrameReader::new(crate::wire::buffer::DEFAULT_CAPACITY),
                    queue: MessageQueue::new(crate::wire::buffer::DEFAULT_CAPACITY),
                    known_net_ids: HashSet::new(),
                    closed: false,
                },
            );
        }
    }

    /// Drops peers whose socket errored, deregistering them from the
    /// reactor first.
    fn reap_closed_peers(&mut self, reactor: &mut Reactor) {
        let dead: Vec<PeerId> = self.peers.iter().filter(|(_, p)| p.closed).map(|(&id, _)| id).collect();
        for id in dead {
            if let Some(peer) = self.peers.remove(&id) {
                let _ = reactor.remove(&peer.socket, peer.token);
                info!(self.log, "peer disconnected"; "peer" => id.0);
            }
        }
    }
}

/// Binds the listening socket and registers the accept callback.
/// Resets net-id allocation, mirroring the original's
/// `m_next_entry_id = 0` on `start()`.
pub fn start(session: &Rc<RefCell<ServerSession>>, bind_addr: SocketAddr, reactor: &mut Reactor) -> std::io::Result<()> {
    let listener = TcpListener::bind(&bind_addr)?;

    let weak = Rc::clone(session);
    let token = reactor.add(&listener, Ready::readable(), Box::new(move |_ready: Ready| {
        weak.borrow_mut().accept_pending = true;
    }))?;

    let mut s = session.borrow_mut();
    s.next_net_id = 0;
    s.id_assignments.clear();
    s.peers.clear();
    s.storage.clear_net_ids();
    s.listener = Some(listener);
    s.listener_token = Some(token);
    Ok(())
}

/// One reactor-tick's worth of server session work: accept
/// queued connections, then — on the 200 ms update cadence — allocate ids
/// for newly-dirty entries, publish them, replicate to peers that know
/// them, and flush every peer's queue.
pub fn tick(session: &Rc<RefCell<ServerSession>>, reactor: &mut Reactor) {
    if session.borrow().accept_pending {
        session.borrow_mut().accept_pending = false;
        ServerSession::accept_all(session, reactor);
    }

    let due = {
        let s = session.borrow();
        s.last_drain.elapsed() >= s.update_interval
    };
    if due {
        drain_dirty(session);
        session.borrow_mut().last_drain = Instant::now();

        let mut s = session.borrow_mut();
        for peer in s.peers.values_mut() {
            peer.flush();
        }
    }

    session.borrow_mut().reap_closed_peers(reactor);
}

fn drain_dirty(session: &Rc<RefCell<ServerSession>>) {
    let storage = Arc::clone(&session.borrow().storage);
    let clock = Arc::clone(&session.borrow().clock);

    storage.drain_dirty(|snapshot| {
        let mut s = session.borrow_mut();
        if s.peers.is_empty() {
            return false; // nothing to replicate to; leave it dirty for later
        }

        let id = if snapshot.net_id == UNASSIGNED_NET_ID {
            let id = s.assign_id(&snapshot.path);
            if let Ok(handle) = s.storage.get_or_create(&snapshot.path) {
                let _ = s.storage.assign_net_id(handle, id);
            }
            id
        } else {
            snapshot.net_id
        };

        let message = if snapshot.deleted {
            Message::EntryDelete { send_time: clock.now(), id }
        } else {
            Message::EntryUpdate { send_time: snapshot.last_update_timestamp, id, value: snapshot.value.clone() }
        };

        let path = snapshot.path.clone();
        for peer in s.peers.values_mut() {
            if !peer.is_known(id) {
                peer.publish(id, &path);
            }
            peer.enqueue(message.clone(), EnqueueFlags::NONE);
        }
        true
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use ferrite_support::logging;

    fn new_session() -> ServerSession {
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
        ServerSession::new(storage, clock, logging::init())
    }

    #[test]
    fn assign_id_is_monotonic_and_recorded() {
        let mut session = new_session();
        let a = session.assign_id("/a");
        let b = session.assign_id("/b");
        assert_eq!(b, a + 1);
        assert_eq!(session.id_assignments.get(&a).map(String::as_str), Some("/a"));
    }

    #[test]
    fn peer_message_entry_create_assigns_id_and_applies_locally() {
        let mut session = new_session();
        let peer_id = PeerId(0);
        session.peers.insert(
            peer_id,
            Peer {
                socket: TcpStream::connect(&"127.0.0.1:1".parse().unwrap()).unwrap(),
                token: Token(1),
                state: PeerState::InHandshake,
                reader: FrameReader::new(crate::wire::buffer::DEFAULT_CAPACITY),
                queue: MessageQueue::new(crate::wire::buffer::DEFAULT_CAPACITY),
                known_net_ids: HashSet::new(),
                closed: false,
            },
        );

        session.on_peer_message(
            peer_id,
            Message::EntryCreate {
                send_time: 1,
                id: UNASSIGNED_NET_ID,
                name: "/x".to_string(),
                value: Value::I32(7),
            },
        );

        let handle = session.storage.get_or_create("/x").unwrap();
        assert_eq!(session.storage.get_value(handle).unwrap(), Value::I32(7));
        assert_eq!(session.id_assignments.len(), 1);
    }

    #[test]
    fn peer_count_reflects_connected_peers() {
        let session = new_session();
        assert_eq!(session.peer_count(), 0);
    }
}
