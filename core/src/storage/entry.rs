use crate::value::Value;

/// Sentinel meaning "no net-id assigned yet".
pub const UNASSIGNED_NET_ID: u16 = 0xFFFF;

/// Sentinel returned by `probe` for a stale/unknown handle.
pub const ENTRY_NOT_EXISTS: u32 = 0xFFFF_FFFF;

const FLAG_DIRTY: u16 = 1 << 8;
const FLAG_DELETED: u16 = 1 << 9;
const FLAG_CREATED: u16 = 1 << 10;
const PUBLIC_FLAGS_MASK: u16 = 0x00FF;

/// A persistent storage record. `path` never changes after
/// construction; everything else is mutated in place by `Storage`.
#[derive(Debug, Clone)]
pub struct Entry {
    path: String,
    value: Value,
    net_id: u16,
    flags: u16,
    last_update_timestamp: u64,
}

impl Entry {
    pub fn new(path: String, now: u64) -> Entry {
        Entry {
            path,
            value: Value::Empty,
            net_id: UNASSIGNED_NET_ID,
            flags: FLAG_CREATED,
            last_update_timestamp: now,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn set_value(&mut self, value: Value) {
        self.value = value;
    }

    pub fn net_id(&self) -> u16 {
        self.net_id
    }

    pub fn set_net_id(&mut self, id: u16) {
        self.net_id = id;
    }

    pub fn clear_net_id(&mut self) {
        self.net_id = UNASSIGNED_NET_ID;
    }

    pub fn has_net_id(&self) -> bool {
        self.net_id != UNASSIGNED_NET_ID
    }

    /// Only the application-visible low 8 bits, as returned by `probe`.
    pub fn public_flags(&self) -> u32 {
        (self.flags & PUBLIC_FLAGS_MASK) as u32
    }

    pub fn is_dirty(&self) -> bool {
        self.flags & FLAG_DIRTY != 0
    }

    pub fn mark_dirty(&mut self) {
        self.flags |= FLAG_DIRTY;
    }

    pub fn clear_dirty(&mut self) {
        self.flags &= !FLAG_DIRTY;
    }

    pub fn is_deleted(&self) -> bool {
        self.flags & FLAG_DELETED != 0
    }

    pub fn is_created(&self) -> bool {
        self.flags & FLAG_CREATED != 0
    }

    pub fn mark_deleted(&mut self) {
        self.flags |= FLAG_DELETED;
        self.flags &= !FLAG_CREATED;
    }

    /// Clears both tombstone and never-observed markers, e.g. when a value
    /// is set again after a delete, or a remote Create/Update arrives.
    pub fn clear_created_and_deleted(&mut self) {
        self.flags &= !(FLAG_CREATED | FLAG_DELETED);
    }

    pub fn last_update_timestamp(&self) -> u64 {
        self.last_update_timestamp
    }

    pub fn set_last_update_timestamp(&mut self, ts: u64) {
        self.last_update_timestamp = ts;
    }
}

/// A read-only snapshot handed to `drain_dirty` visitors and listener
/// callbacks, so neither holds a reference into the locked table.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub path: String,
    pub value: Value,
    pub net_id: u16,
    pub deleted: bool,
    pub last_update_timestamp: u64,
}

impl From<&Entry> for EntrySnapshot {
    fn from(entry: &Entry) -> Self {
        EntrySnapshot {
            path: entry.path.to_string(),
            value: entry.value.clone(),
            net_id: entry.net_id,
            deleted: entry.is_deleted(),
            last_update_timestamp: entry.last_update_timestamp,
        }
    }
}
