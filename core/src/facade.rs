//! The object/entry façade, grounded in the original's `instance.h`/
//! `instance.cpp`. A thin path-keyed object table layered on top of
//! [`crate::storage::Storage`], with the root object pre-created and
//! the network side wired up behind `start_server`/`start_client`.

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::rc::Rc;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ferrite_support::error::{Error, Result};
use slog::{info, o, Logger};

use crate::clock::Clock;
use crate::handle::{Handle, SlotTable};
use crate::listener::{Callback, ListenerDispatcher};
use crate::path::{join, validate_name, validate_path};
use crate::reactor::Reactor;
use crate::session::{client, server};
use crate::storage::{Storage, DEFAULT_CAPACITY as STORAGE_CAPACITY};
use crate::value::Value;

const OBJECT_TABLE_CAPACITY: usize = 256;
const LISTENER_TABLE_CAPACITY: usize = 16;

/// How often a running client/server session is ticked against its
/// reactor. Also bounds how quickly `stop_network` notices the stop flag,
/// since a `mio::Poll::poll` call blocks at most this long when nothing
/// else wakes it.
const TICK_INTERVAL: Duration = Duration::from_millis(50);

struct ObjectData {
    path: String,
}

struct NetworkHandle {
    stop: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

/// Path-keyed object table plus the storage, clock, listener dispatcher,
/// and (optional) running network session that back one replicated store.
/// An explicit value rather than a process-wide singleton, since it needs
/// no global state to construct multiple isolated instances in tests.
pub struct Instance {
    clock: Arc<Clock>,
    listeners: Arc<ListenerDispatcher>,
    storage: Arc<Storage>,
    objects: Mutex<ObjectTable>,
    network: Mutex<Option<NetworkHandle>>,
    log: Logger,
}

struct ObjectTable {
    table: SlotTable<ObjectData>,
    paths: std::collections::HashMap<String, Handle>,
    root: Handle,
}

impl Instance {
    pub fn new(log: Logger) -> Instance {
        Instance::with_capacities(log, STORAGE_CAPACITY, LISTENER_TABLE_CAPACITY)
    }

    /// Builds an `Instance` with entry-table and listener-table capacities
    /// other than the built-in defaults, e.g. a `ServerConfig`'s
    /// `max_entries`/`max_listeners`.
    pub fn with_capacities(log: Logger, storage_capacity: usize, listener_capacity: usize) -> Instance {
        let clock = Arc::new(Clock::new());
        let listeners = Arc::new(ListenerDispatcher::new(log.clone(), listener_capacity));
        let storage = Arc::new(Storage::new(storage_capacity, Arc::clone(&clock), Arc::clone(&listeners), log.clone()));

        let mut table: SlotTable<ObjectData> = SlotTable::with_capacity(OBJECT_TABLE_CAPACITY);
        let root = table
            .insert(ObjectData { path: "/".to_string() })
            .expect("object table capacity exceeded allocating root");
        let mut paths = std::collections::HashMap::new();
        paths.insert("/".to_string(), root);

        Instance {
            clock,
            listeners,
            storage,
            objects: Mutex::new(ObjectTable { table, paths, root }),
            network: Mutex::new(None),
            log: log.new(o!("component" => "facade")),
        }
    }

    /// Clock-adjusted wall time.
    pub fn time(&self) -> u64 {
        self.clock.now()
    }

    pub fn get_root(&self) -> Handle {
        self.objects.lock().unwrap().root
    }

    pub fn get_child(&self, parent: Handle, name: &str) -> Result<Handle> {
        validate_name(name)?;
        let mut objects = self.objects.lock().unwrap();
        let parent_path = objects.table.get(parent)?.path.clone();
        let path = join(&parent_path, name);

        if let Some(&handle) = objects.paths.get(&path) {
            return Ok(handle);
        }

        let handle = objects.table.insert(ObjectData { path: path.clone() })?;
        objects.paths.insert(path, handle);
        Ok(handle)
    }

    /// `get_entry(path)`: creates the object hierarchy along the
    /// way, mirroring the original's `get_or_create_object` walk.
    pub fn get_entry_by_path(&self, path: &str) -> Result<Handle> {
        validate_path(path)?;
        if path == "/" {
            return Err(Error::InvalidPath);
        }

        let slash = path.rfind('/').unwrap();
        let parent_path = if slash == 0 { "/" } else { &path[..slash] };
        self.ensure_object_path(parent_path)?;
        self.storage.get_or_create(path)
    }

    pub fn get_entry(&self, parent: Handle, name: &str) -> Result<Handle> {
        validate_name(name)?;
        let path = {
            let objects = self.objects.lock().unwrap();
            join(&objects.table.get(parent)?.path, name)
        };
        self.storage.get_or_create(&path)
    }

    fn ensure_object_path(&self, path: &str) -> Result<Handle> {
        if path == "/" {
            return Ok(self.get_root());
        }
        let mut current = self.get_root();
        for name in path.trim_start_matches('/').split('/') {
            current = self.get_child(current, name)?;
        }
        Ok(current)
    }

    /// Root deletion fails with `CannotDeleteRoot`. Deleting any
    /// other object tombstones every entry under its path.
    pub fn delete_object(&self, object: Handle) -> Result<()> {
        let mut objects = self.objects.lock().unwrap();
        if object == objects.root {
            return Err(Error::CannotDeleteRoot);
        }
        let path = objects.table.remove(object)?.path;
        objects.paths.remove(&path);
        drop(objects);
        self.storage.delete_subtree(&path)
    }

    pub fn delete_entry(&self, entry: Handle) -> Result<()> {
        self.storage.delete(entry)
    }

    pub fn probe(&self, entry: Handle) -> u32 {
        self.storage.probe(entry)
    }

    pub fn get_value(&self, entry: Handle) -> Result<Value> {
        self.storage.get_value(entry)
    }

    pub fn set_value(&self, entry: Handle, value: Value) -> Result<()> {
        self.storage.set_value(entry, value)
    }

    pub fn clear_value(&self, entry: Handle) -> Result<()> {
        self.storage.clear_value(entry)
    }

    pub fn listen_object(&self, object: Handle, callback: Callback) -> Result<Handle> {
        let path = self.objects.lock().unwrap().table.get(object)?.path.clone();
        self.listeners.register(path, self.clock.now(), callback)
    }

    pub fn listen_entry(&self, entry: Handle, callback: Callback) -> Result<Handle> {
        let path = self.storage.path_of(entry)?;
        self.listeners.register(path, self.clock.now(), callback)
    }

    pub fn delete_listener(&self, listener: Handle) -> Result<()> {
        self.listeners.deregister(listener)
    }

    /// Starts a server session bound to `bind_port` on a dedicated thread.
    /// Fails with `Config` if networking is already
    /// running, matching the original's `illegal_state_exception`.
    pub fn start_server(&self, bind_port: u16) -> Result<()> {
        self.start_server_with_interval(bind_port, Duration::from_millis(200))
    }

    /// As `start_server`, but overrides the 200ms dirty-drain-and-broadcast
    /// cadence, e.g. from a loaded `ServerConfig::update_interval_ms`.
    pub fn start_server_with_interval(&self, bind_port: u16, update_interval: Duration) -> Result<()> {
        let mut network = self.network.lock().unwrap();
        if network.is_some() {
            return Err(Error::Config("network interface already open".to_string()));
        }

        let bind_addr: SocketAddr = format!("0.0.0.0:{}", bind_port).parse()?;
        // fail fast on an unbindable port, rather than only discovering it
        // on the reactor thread with nothing watching for the error.
        drop(StdTcpListener::bind(bind_addr).map_err(Error::from)?);

        let storage = Arc::clone(&self.storage);
        let clock = Arc::clone(&self.clock);
        let log = self.log.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop);

        let join = thread::Builder::new()
            .name("ferrite-server".to_string())
            .spawn(move || {
                let mut reactor = match Reactor::new(log.clone()) {
                    Ok(r) => r,
                    Err(err) => {
                        info!(log, "failed to start server reactor"; "error" => %err);
                        return;
                    }
                };
                let session = Rc::new(RefCell::new(server::ServerSession::new(storage, clock, log.clone())));
                session.borrow_mut().configure(update_interval);
                if let Err(err) = server::start(&session, bind_addr, &mut reactor) {
                    info!(log, "failed to bind server listener"; "error" => %err);
                    return;
                }
                // bounds run_once's poll wait so the loop notices `stop` and
                // calls `tick` promptly even with no socket activity.
                reactor.create_timer(TICK_INTERVAL, Box::new(|| {}));

                loop {
                    if stop_thread.load(Ordering::Relaxed) {
                        return;
                    }
                    let _ = reactor.run_once();
                    server::tick(&session, &mut reactor);
                }
            })
            .expect("failed to spawn server thread");

        *network = Some(NetworkHandle { stop, join });
        Ok(())
    }

    /// Starts a client session targeting `host:port` on a dedicated thread.
    pub fn start_client(&self, host: &str, server_port: u16) -> Result<()> {
        self.start_client_with_intervals(
            host,
            server_port,
            Duration::from_millis(1000),
            Duration::from_millis(1000),
        )
    }

    /// As `start_client`, but overrides the connect-retry and clock-sync
    /// intervals, e.g. from a loaded `ClientConfig`.
    pub fn start_client_with_intervals(
        &self,
        host: &str,
        server_port: u16,
        connect_retry: Duration,
        sync_interval: Duration,
    ) -> Result<()> {
        let mut network = self.network.lock().unwrap();
        if network.is_some() {
            return Err(Error::Config("network interface already open".to_string()));
        }

        let target: SocketAddr = format!("{}:{}", host, server_port).parse()?;

        let storage = Arc::clone(&self.storage);
        let clock = Arc::clone(&self.clock);
        let log = self.log.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop);

        let join = thread::Builder::new()
            .name("ferrite-client".to_string())
            .spawn(move || {
                let mut reactor = match Reactor::new(log.clone()) {
                    Ok(r) => r,
                    Err(err) => {
                        info!(log, "failed to start client reactor"; "error" => %err);
                        return;
                    }
                };
                let session = Rc::new(RefCell::new(client::ClientSession::new(storage, clock, log.clone())));
                session.borrow_mut().configure(connect_retry, sync_interval);
                session.borrow_mut().start(target);
                reactor.create_timer(TICK_INTERVAL, Box::new(|| {}));

                loop {
                    if stop_thread.load(Ordering::Relaxed) {
                        return;
                    }
                    let _ = reactor.run_once();
                    client::tick(&session, &mut reactor);
                }
            })
            .expect("failed to spawn client thread");

        *network = Some(NetworkHandle { stop, join });
        Ok(())
    }

    pub fn stop_network(&self) {
        let handle = self.network.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.stop.store(true, Ordering::Relaxed);
            let _ = handle.join.join();
        }
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        self.stop_network();
    }
}

