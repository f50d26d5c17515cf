use ferrite_support::error::{Error, ProtocolError};

use crate::value::{Value, ValueType, MAX_SEQUENCE_LEN};

/// The eight message kinds. The numeric value is the frame
/// header's `type` byte, not a byte inside the payload.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum MessageKind {
    EntryCreate = 1,
    EntryUpdate = 2,
    EntryDelete = 3,
    EntryIdAssign = 4,
    HandshakeFinished = 5,
    TimeSyncRequest = 6,
    TimeSyncResponse = 7,
    HandshakeReady = 8,
}

impl MessageKind {
    pub fn from_tag(tag: u8) -> Option<MessageKind> {
        Some(match tag {
            1 => MessageKind::EntryCreate,
            2 => MessageKind::EntryUpdate,
            3 => MessageKind::EntryDelete,
            4 => MessageKind::EntryIdAssign,
            5 => MessageKind::HandshakeFinished,
            6 => MessageKind::TimeSyncRequest,
            7 => MessageKind::TimeSyncResponse,
            8 => MessageKind::HandshakeReady,
            _ => return None,
        })
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    EntryCreate {
        send_time: u64,
        id: u16,
        name: String,
        value: Value,
    },
    EntryUpdate {
        send_time: u64,
        id: u16,
        value: Value,
    },
    EntryDelete {
        send_time: u64,
        id: u16,
    },
    EntryIdAssign {
        id: u16,
        name: String,
    },
    HandshakeFinished,
    TimeSyncRequest {
        send_time: u64,
    },
    TimeSyncResponse {
        send_time: u64,
        request_time: u64,
    },
    HandshakeReady,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::EntryCreate { .. } => MessageKind::EntryCreate,
            Message::EntryUpdate { .. } => MessageKind::EntryUpdate,
            Message::EntryDelete { .. } => MessageKind::EntryDelete,
            Message::EntryIdAssign { .. } => MessageKind::EntryIdAssign,
            Message::HandshakeFinished => MessageKind::HandshakeFinished,
            Message::TimeSyncRequest { .. } => MessageKind::TimeSyncRequest,
            Message::TimeSyncResponse { .. } => MessageKind::TimeSyncResponse,
            Message::HandshakeReady => MessageKind::HandshakeReady,
        }
    }
}

/// Consumes `n` bytes from the front of `buf`, or returns `None` (leaving
/// `buf` untouched) if fewer than `n` are currently buffered — the
/// "insufficient data, wait for more" leg of every parser state.
pub(super) fn take(buf: &mut Vec<u8>, n: usize) -> Option<Vec<u8>> {
    if buf.len() < n {
        return None;
    }
    Some(buf.drain(..n).collect())
}

pub(super) fn read_u8(buf: &mut Vec<u8>) -> Option<u8> {
    take(buf, 1).map(|b| b[0])
}

pub(super) fn read_u16(buf: &mut Vec<u8>) -> Option<u16> {
    take(buf, 2).map(|b| u16::from_be_bytes([b[0], b[1]]))
}

pub(super) fn read_u64(buf: &mut Vec<u8>) -> Option<u64> {
    take(buf, 8).map(|b| {
        let mut a = [0u8; 8];
        a.copy_from_slice(&b);
        u64::from_be_bytes(a)
    })
}

pub(super) fn read_name(buf: &mut Vec<u8>) -> Option<String> {
    let len = read_u8(buf)? as usize;
    let bytes = take(buf, len)?;
    String::from_utf8(bytes).ok()
}

/// Reads a `Value` whose tag has already been read as `value_type`.
/// Returns `Err(ReadData)` if the payload is truncated.
pub(super) fn read_value(
    value_type: ValueType,
    buf: &mut Vec<u8>,
) -> Result<Option<Value>, ProtocolError> {
    macro_rules! scalar {
        ($n:expr, $make:expr) => {
            match take(buf, $n) {
                Some(bytes) => Ok(Some($make(bytes))),
                None => Ok(None),
            }
        };
    }

    macro_rules! sequence {
        ($elem_size:expr, $decode_elem:expr, $variant:ident) => {{
            let count = match read_u8(buf) {
                Some(c) => c as usize,
                None => return Ok(None),
            };
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                let bytes = match take(buf, $elem_size) {
                    Some(b) => b,
                    None => return Ok(None),
                };
                items.push($decode_elem(bytes));
            }
            Ok(Some(Value::$variant(items)))
        }};
    }

    match value_type {
        ValueType::Empty => Ok(Some(Value::Empty)),
        ValueType::Bool => scalar!(1, |b: Vec<u8>| Value::Bool(b[0] != 0)),
        ValueType::I32 => scalar!(4, |b: Vec<u8>| Value::I32(i32::from_be_bytes(
            [b[0], b[1], b[2], b[3]]
        ))),
        ValueType::I64 => scalar!(8, |b: Vec<u8>| {
            let mut a = [0u8; 8];
            a.copy_from_slice(&b);
            Value::I64(i64::from_be_bytes(a))
        }),
        ValueType::F32 => scalar!(4, |b: Vec<u8>| Value::F32(f32::from_be_bytes(
            [b[0], b[1], b[2], b[3]]
        ))),
        ValueType::F64 => scalar!(8, |b: Vec<u8>| {
            let mut a = [0u8; 8];
            a.copy_from_slice(&b);
            Value::F64(f64::from_be_bytes(a))
        }),
        ValueType::Raw => {
            let count = match read_u8(buf) {
                Some(c) => c as usize,
                None => return Ok(None),
            };
            match take(buf, count) {
                Some(bytes) => Ok(Some(Value::Raw(bytes))),
                None => Ok(None),
            }
        }
        ValueType::I32Array => sequence!(
            4,
            |b: Vec<u8>| i32::from_be_bytes([b[0], b[1], b[2], b[3]]),
            I32Array
        ),
        ValueType::I64Array => sequence!(
            8,
            |b: Vec<u8>| {
                let mut a = [0u8; 8];
                a.copy_from_slice(&b);
                i64::from_be_bytes(a)
            },
            I64Array
        ),
        ValueType::F32Array => sequence!(
            4,
            |b: Vec<u8>| f32::from_be_bytes([b[0], b[1], b[2], b[3]]),
            F32Array
        ),
        ValueType::F64Array => sequence!(
            8,
            |b: Vec<u8>| {
                let mut a = [0u8; 8];
                a.copy_from_slice(&b);
                f64::from_be_bytes(a)
            },
            F64Array
        ),
    }
}

/// Appends `value`'s wire encoding (tag byte plus contents) to
/// `out`. Fails with `DataTooLarge` before writing anything if a raw/array
/// value exceeds the 254-element limit.
pub(super) fn write_value(value: &Value, out: &mut Vec<u8>) -> Result<(), Error> {
    value.check_len()?;
    out.push(value.value_type() as u8);

    match value {
        Value::Empty => {}
        Value::Bool(b) => out.push(if *b { 1 } else { 0 }),
        Value::I32(v) => out.extend_from_slice(&v.to_be_bytes()),
        Value::I64(v) => out.extend_from_slice(&v.to_be_bytes()),
        Value::F32(v) => out.extend_from_slice(&v.to_be_bytes()),
        Value::F64(v) => out.extend_from_slice(&v.to_be_bytes()),
        Value::Raw(bytes) => {
            out.push(bytes.len() as u8);
            out.extend_from_slice(bytes);
        }
        Value::I32Array(items) => {
            out.push(items.len() as u8);
            for item in items {
                out.extend_from_slice(&item.to_be_bytes());
            }
        }
        Value::I64Array(items) => {
            out.push(items.len() as u8);
            for item in items {
                out.extend_from_slice(&item.to_be_bytes());
            }
        }
        Value::F32Array(items) => {
            out.push(items.len() as u8);
            for item in items {
                out.extend_from_slice(&item.to_be_bytes());
            }
        }
        Value::F64Array(items) => {
            out.push(items.len() as u8);
            for item in items {
                out.extend_from_slice(&item.to_be_bytes());
            }
        }
    }

    debug_assert!(MAX_SEQUENCE_LEN <= u8::max_value() as usize);
    Ok(())
}
