pub mod entry;
pub mod table;

pub use entry::{Entry, EntrySnapshot, ENTRY_NOT_EXISTS, UNASSIGNED_NET_ID};
pub use table::{Storage, DEFAULT_CAPACITY};
