use std::sync::{Arc, Mutex};

use ferrite_support::error::{Error, Result};
use hashbrown::HashMap;
use slog::{o, warn, Logger};

use crate::clock::Clock;
use crate::handle::{Handle, SlotTable};
use crate::listener::{Event, EventType, ListenerDispatcher};
use crate::path::validate_path;
use crate::value::Value;

use super::entry::{Entry, EntrySnapshot, ENTRY_NOT_EXISTS, UNASSIGNED_NET_ID};

/// Default entry table capacity.
pub const DEFAULT_CAPACITY: usize = 256;

struct Inner {
    table: SlotTable<Entry>,
    paths: HashMap<String, Handle>,
    net_ids: HashMap<u16, Handle>,
}

/// The typed entry table: path index, net-id index, dirty set, and the
/// merge policy for incoming remote mutations. One `Storage`
/// backs exactly one `Instance`; sessions and the façade share it through
/// `Arc`.
pub struct Storage {
    inner: Mutex<Inner>,
    clock: Arc<Clock>,
    listeners: Arc<ListenerDispatcher>,
    log: Logger,
}

impl Storage {
    pub fn new(capacity: usize, clock: Arc<Clock>, listeners: Arc<ListenerDispatcher>, log: Logger) -> Storage {
        Storage {
            inner: Mutex::new(Inner {
                table: SlotTable::with_capacity(capacity),
                paths: HashMap::new(),
                net_ids: HashMap::new(),
            }),
            clock,
            listeners,
            log: log.new(o!("component" => "storage")),
        }
    }

    pub fn get_or_create(&self, path: &str) -> Result<Handle> {
        validate_path(path)?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(&handle) = inner.paths.get(path) {
            return Ok(handle);
        }

        let now = self.clock.now();
        let handle = inner.table.insert(Entry::new(path.to_string(), now))?;
        inner.paths.insert(path.to_string(), handle);
        Ok(handle)
    }

    pub fn probe(&self, handle: Handle) -> u32 {
        let inner = self.inner.lock().unwrap();
        match inner.table.get(handle) {
            Ok(entry) => entry.public_flags(),
            Err(_) => ENTRY_NOT_EXISTS,
        }
    }

    pub fn get_value(&self, handle: Handle) -> Result<Value> {
        let inner = self.inner.lock().unwrap();
        let entry = inner.table.get(handle)?;
        if entry.is_deleted() {
            return Err(Error::EntryDeleted);
        }
        Ok(entry.value().clone())
    }

    pub fn set_value(&self, handle: Handle, value: Value) -> Result<()> {
        value.check_len()?;

        let (path, old_value, was_created_or_deleted, now) = {
            let mut inner = self.inner.lock().unwrap();
            let entry = inner.table.get_mut(handle)?;

            if !entry.value().is_empty()
                && !value.is_empty()
                && !entry.is_deleted()
                && entry.value().value_type() != value.value_type()
            {
                return Err(Error::TypeMismatch);
            }

            let was_created_or_deleted = entry.is_created() || entry.is_deleted();
            let old_value = entry.value().clone();
            let now = self.clock.now();

            entry.set_value(value.clone());
            entry.mark_dirty();
            if was_created_or_deleted {
                entry.clear_created_and_deleted();
            }
            entry.set_last_update_timestamp(now);

            (entry.path().to_string(), old_value, was_created_or_deleted, now)
        };

        if was_created_or_deleted {
            self.listeners.notify(Event {
                timestamp: now,
                event_type: EventType::Created,
                path: path.clone(),
                old_value: Value::Empty,
                new_value: Value::Empty,
            });
        }
        self.listeners.notify(Event {
            timestamp: now,
            event_type: EventType::ValueChanged,
            path,
            old_value,
            new_value: value,
        });

        Ok(())
    }

    pub fn clear_value(&self, handle: Handle) -> Result<()> {
        let (path, old_value, was_created_or_deleted, now) = {
            let mut inner = self.inner.lock().unwrap();
            let entry = inner.table.get_mut(handle)?;

            let was_created_or_deleted = entry.is_created() || entry.is_deleted();
            let old_value = entry.value().clone();
            let now = self.clock.now();

            entry.set_value(Value::Empty);
            entry.mark_dirty();
            if was_created_or_deleted {
                entry.clear_created_and_deleted();
            }
            entry.set_last_update_timestamp(now);

            (entry.path().to_string(), old_value, was_created_or_deleted, now)
        };

        if was_created_or_deleted {
            self.listeners.notify(Event {
                timestamp: now,
                event_type: EventType::Created,
                path: path.clone(),
                old_value: Value::Empty,
                new_value: Value::Empty,
            });
        }
        self.listeners.notify(Event {
            timestamp: now,
            event_type: EventType::ValueChanged,
            path,
            old_value,
            new_value: Value::Empty,
        });

        Ok(())
    }

    pub fn delete(&self, handle: Handle) -> Result<()> {
        let (path, old_value, now) = {
            let mut inner = self.inner.lock().unwrap();
            let entry = inner.table.get_mut(handle)?;
            if entry.is_deleted() {
                return Ok(());
            }
            let old_value = entry.value().clone();
            let now = self.clock.now();
            entry.set_value(Value::Empty);
            entry.mark_deleted();
            entry.mark_dirty();
            entry.set_last_update_timestamp(now);
            (entry.path().to_string(), old_value, now)
        };

        self.listeners.notify(Event {
            timestamp: now,
            event_type: EventType::Deleted,
            path,
            old_value,
            new_value: Value::Empty,
        });

        Ok(())
    }

    pub fn delete_subtree(&self, prefix: &str) -> Result<()> {
        let handles: Vec<Handle> = {
            let inner = self.inner.lock().unwrap();
            inner
                .paths
                .iter()
                .filter(|(path, _)| path.starts_with(prefix))
                .map(|(_, &handle)| handle)
                .collect()
        };

        for handle in handles {
            self.delete(handle)?;
        }
        Ok(())
    }

    /// Iterates dirty entries, releasing the lock around each visitor call
    /// Stops as soon as a visitor returns `false`, leaving
    /// that entry (and any after it) dirty.
    pub fn drain_dirty(&self, mut visitor: impl FnMut(&EntrySnapshot) -> bool) {
        let dirty: Vec<Handle> = {
            let inner = self.inner.lock().unwrap();
            inner
                .table
                .iter()
                .filter(|(_, e)| e.is_dirty())
                .map(|(h, _)| h)
                .collect()
        };

        for handle in dirty {
            let snapshot = {
                let inner = self.inner.lock().unwrap();
                match inner.table.get(handle) {
                    Ok(entry) if entry.is_dirty() => EntrySnapshot::from(entry),
                    _ => continue,
                }
            };

            if !visitor(&snapshot) {
                return;
            }

            let mut inner = self.inner.lock().unwrap();
            if let Ok(entry) = inner.table.get_mut(handle) {
                entry.clear_dirty();
            }
        }
    }

    pub fn clear_net_ids(&self) {
        let mut inner = self.inner.lock().unwrap();
        for (_, entry) in inner.table.iter_mut() {
            entry.clear_net_id();
        }
        inner.net_ids.clear();
    }

    /// Used by the server's own id-allocation tick to stamp a
    /// locally-owned entry with a freshly minted net-id.
    pub fn assign_net_id(&self, handle: Handle, id: u16) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        {
            let entry = inner.table.get_mut(handle)?;
            entry.set_net_id(id);
        }
        inner.net_ids.insert(id, handle);
        Ok(())
    }

    pub fn handle_for_net_id(&self, id: u16) -> Option<Handle> {
        let inner = self.inner.lock().unwrap();
        inner.net_ids.get(&id).copied()
    }

    pub fn path_of(&self, handle: Handle) -> Result<String> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.table.get(handle)?.path().to_string())
    }

    // --- merge policy for incoming remote mutations ---

    pub fn on_entry_created(&self, id: u16, path: &str, value: Value, remote_timestamp: u64) -> Result<()> {
        validate_path(path)?;

        let mut inner = self.inner.lock().unwrap();

        if id != UNASSIGNED_NET_ID {
            if let Some(&existing) = inner.net_ids.get(&id) {
                let existing_path = inner.table.get(existing).ok().map(|e| e.path().to_string());
                if existing_path.as_deref() != Some(path) {
                    warn!(self.log, "rejecting entry create: net-id already bound to a different path";
                        "id" => id, "path" => path);
                    return Ok(());
                }
            }
        }

        let handle = match inner.paths.get(path).copied() {
            Some(h) => h,
            None => {
                let now = self.clock.now();
                let h = inner.table.insert(Entry::new(path.to_string(), now))?;
                inner.paths.insert(path.to_string(), h);
                h
            }
        };

        let (emit_created, old_value, changed) = {
            let entry = inner.table.get_mut(handle)?;

            if remote_timestamp < entry.last_update_timestamp() {
                return Ok(()); // stale, drop
            }

            if !entry.value().is_empty()
                && !value.is_empty()
                && !entry.is_deleted()
                && entry.value().value_type() != value.value_type()
            {
                return Err(Error::TypeMismatch);
            }

            let emit_created = entry.is_created() || entry.is_deleted();
            let old_value = entry.value().clone();
            entry.clear_created_and_deleted();
            entry.set_value(value.clone());
            if id != UNASSIGNED_NET_ID {
                entry.set_net_id(id);
            }
            entry.set_last_update_timestamp(remote_timestamp);
            (emit_created, old_value, value)
        };

        if id != UNASSIGNED_NET_ID {
            inner.net_ids.insert(id, handle);
        }
        drop(inner);

        if emit_created {
            self.listeners.notify(Event {
                timestamp: remote_timestamp,
                event_type: EventType::Created,
                path: path.to_string(),
                old_value: Value::Empty,
                new_value: Value::Empty,
            });
        }
        self.listeners.notify(Event {
            timestamp: remote_timestamp,
            event_type: EventType::ValueChanged,
            path: path.to_string(),
            old_value,
            new_value: changed,
        });

        Ok(())
    }

    pub fn on_entry_updated(&self, id: u16, value: Value, remote_timestamp: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let handle = match inner.net_ids.get(&id).copied() {
            Some(h) => h,
            None => return Ok(()), // unknown net-id, nothing to update
        };

        let (path, emit_created, old_value) = {
            let entry = inner.table.get_mut(handle)?;

            if remote_timestamp < entry.last_update_timestamp() {
                return Ok(());
            }

            if !entry.value().is_empty()
                && !value.is_empty()
                && !entry.is_deleted()
                && entry.value().value_type() != value.value_type()
            {
                return Err(Error::TypeMismatch);
            }

            let emit_created = entry.is_created() || entry.is_deleted();
            let old_value = entry.value().clone();
            entry.clear_created_and_deleted();
            entry.set_value(value.clone());
            entry.set_last_update_timestamp(remote_timestamp);
            (entry.path().to_string(), emit_created, old_value)
        };
        drop(inner);

        if emit_created {
            self.listeners.notify(Event {
                timestamp: remote_timestamp,
                event_type: EventType::Created,
                path: path.clone(),
                old_value: Value::Empty,
                new_value: Value::Empty,
            });
        }
        self.listeners.notify(Event {
            timestamp: remote_timestamp,
            event_type: EventType::ValueChanged,
            path,
            old_value,
            new_value: value,
        });

        Ok(())
    }

    pub fn on_entry_deleted(&self, id: u16, remote_timestamp: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let handle = match inner.net_ids.get(&id).copied() {
            Some(h) => h,
            None => return Ok(()),
        };

        let (path, old_value) = {
            let entry = inner.table.get_mut(handle)?;

            if remote_timestamp < entry.last_update_timestamp() {
                return Ok(());
            }
            if entry.is_deleted() {
                return Ok(());
            }

            let old_value = entry.value().clone();
            entry.set_value(Value::Empty);
            entry.mark_deleted();
            entry.set_last_update_timestamp(remote_timestamp);
            (entry.path().to_string(), old_value)
        };
        drop(inner);

        self.listeners.notify(Event {
            timestamp: remote_timestamp,
            event_type: EventType::Deleted,
            path,
            old_value,
            new_value: Value::Empty,
        });

        Ok(())
    }

    /// Records a server-assigned net-id without touching the value or the
    /// `CREATED` flag.
    pub fn on_entry_id_assigned(&self, id: u16, path: &str) -> Result<()> {
        validate_path(path)?;
        let mut inner = self.inner.lock().unwrap();

        let handle = match inner.paths.get(path).copied() {
            Some(h) => h,
            None => {
                let now = self.clock.now();
                let h = inner.table.insert(Entry::new(path.to_string(), now))?;
                inner.paths.insert(path.to_string(), h);
                h
            }
        };

        inner.table.get_mut(handle)?.set_net_id(id);
        inner.net_ids.insert(id, handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrite_support::logging;

    fn new_storage() -> Storage {
        let clock = Arc::new(Clock::new());
        let listeners = Arc::new(ListenerDispatcher::new(logging::init(), crate::listener::DEFAULT_CAPACITY));
        Storage::new(DEFAULT_CAPACITY, clock, listeners, logging::init())
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let storage = new_storage();
        let h1 = storage.get_or_create("/a/b").unwrap();
        let h2 = storage.get_or_create("/a/b").unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn set_value_type_mismatch_is_rejected() {
        let storage = new_storage();
        let h = storage.get_or_create("/x").unwrap();
        storage.set_value(h, Value::I32(1)).unwrap();
        let err = storage.set_value(h, Value::F32(1.0)).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch));
        assert_eq!(storage.get_value(h).unwrap(), Value::I32(1));
    }

    #[test]
    fn delete_then_set_recreates() {
        let storage = new_storage();
        let h = storage.get_or_create("/x").unwrap();
        storage.set_value(h, Value::I64(42)).unwrap();
        storage.delete(h).unwrap();
        assert!(storage.get_value(h).is_err());
        storage.set_value(h, Value::I64(7)).unwrap();
        assert_eq!(storage.get_value(h).unwrap(), Value::I64(7));
    }

    #[test]
    fn clear_value_on_tombstone_recreates_it() {
        let storage = new_storage();
        let h = storage.get_or_create("/x").unwrap();
        storage.set_value(h, Value::I64(42)).unwrap();
        storage.delete(h).unwrap();
        assert!(storage.get_value(h).is_err());

        storage.clear_value(h).unwrap();
        assert_eq!(storage.get_value(h).unwrap(), Value::Empty);
    }

    #[test]
    fn stale_remote_update_is_dropped() {
        let storage = new_storage();
        storage.on_entry_created(1, "/k", Value::I32(2), 200).unwrap();
        storage.on_entry_updated(1, Value::I32(1), 100).unwrap();
        let handle = storage.handle_for_net_id(1).unwrap();
        assert_eq!(storage.get_value(handle).unwrap(), Value::I32(2));
    }

    #[test]
    fn drain_dirty_clears_flag_on_true_and_stops_on_false() {
        let storage = new_storage();
        let h1 = storage.get_or_create("/a").unwrap();
        let h2 = storage.get_or_create("/b").unwrap();
        storage.set_value(h1, Value::I32(1)).unwrap();
        storage.set_value(h2, Value::I32(2)).unwrap();

        let mut visited = 0;
        storage.drain_dirty(|_snapshot| {
            visited += 1;
            false
        });
        assert_eq!(visited, 1);

        // the first visited entry's dirty flag stays set since we returned false
        let dirty_count = {
            let mut n = 0;
            storage.drain_dirty(|_| {
                n += 1;
                true
            });
            n
        };
        assert!(dirty_count >= 1);
    }
}
