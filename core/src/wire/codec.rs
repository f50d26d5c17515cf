use ferrite_support::error::ProtocolError;

use crate::value::{Value, ValueType, MAX_SEQUENCE_LEN};

use super::message::{read_name, read_u16, read_u64, read_u8, read_value, write_value, Message, MessageKind};

/// Parser states. `CheckType` is resolved the moment a
/// message starts (it only ever looks at the type tag already carried by
/// the frame header) so it never appears as `self.state` mid-parse.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum ParseState {
    CheckType,
    ReadSendTime,
    ReadId,
    ReadName,
    ReadValueType,
    ReadValue,
    ReadTimeValue,
}

pub enum ParseOutcome {
    NeedMore,
    Done(Message),
    Error(ProtocolError),
}

/// Incremental message decoder. Feed it bytes with `feed`, drive it with
/// `step`; a `NeedMore` result means "call again once more bytes are
/// buffered". One parser decodes exactly one message — construct a fresh
/// one (or call `reset`) for the next.
pub struct MessageParser {
    state: ParseState,
    kind: Option<MessageKind>,
    buf: Vec<u8>,
    send_time: u64,
    id: u16,
    name: String,
    value_type: Option<ValueType>,
}

impl MessageParser {
    pub fn new() -> MessageParser {
        MessageParser {
            state: ParseState::CheckType,
            kind: None,
            buf: Vec::new(),
            send_time: 0,
            id: 0,
            name: String::new(),
            value_type: None,
        }
    }

    pub fn reset(&mut self) {
        self.state = ParseState::CheckType;
        self.kind = None;
        self.buf.clear();
        self.send_time = 0;
        self.id = 0;
        self.name.clear();
        self.value_type = None;
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Advances as far as currently buffered bytes allow. The caller does
    /// not restart the parser on `Error` — it resets and moves
    /// on to the next frame.
    pub fn step(&mut self, type_tag: u8) -> ParseOutcome {
        if self.kind.is_none() {
            let kind = match MessageKind::from_tag(type_tag) {
                Some(k) => k,
                None => return ParseOutcome::Error(ProtocolError::UnknownType),
            };

            match kind {
                MessageKind::HandshakeFinished => return ParseOutcome::Done(Message::HandshakeFinished),
                MessageKind::HandshakeReady => return ParseOutcome::Done(Message::HandshakeReady),
                MessageKind::EntryIdAssign => {
                    self.kind = Some(kind);
                    self.state = ParseState::ReadId;
                }
                _ => {
                    self.kind = Some(kind);
                    self.state = ParseState::ReadSendTime;
                }
            }
        }

        let kind = self.kind.expect("resolved above");

        loop {
            match (kind, self.state) {
                (_, ParseState::CheckType) => unreachable!("CheckType is resolved before the loop"),

                (
                    MessageKind::EntryCreate
                    | MessageKind::EntryUpdate
                    | MessageKind::EntryDelete
                    | MessageKind::TimeSyncRequest
                    | MessageKind::TimeSyncResponse,
                    ParseState::ReadSendTime,
                ) => match read_u64(&mut self.buf) {
                    Some(t) => {
                        self.send_time = t;
                        self.state = match kind {
                            MessageKind::TimeSyncRequest => {
                                return ParseOutcome::Done(Message::TimeSyncRequest { send_time: t })
                            }
                            MessageKind::TimeSyncResponse => ParseState::ReadTimeValue,
                            _ => ParseState::ReadId,
                        };
                    }
                    None => return ParseOutcome::NeedMore,
                },

                (MessageKind::TimeSyncResponse, ParseState::ReadTimeValue) => {
                    match read_u64(&mut self.buf) {
                        Some(request_time) => {
                            return ParseOutcome::Done(Message::TimeSyncResponse {
                                send_time: self.send_time,
                                request_time,
                            })
                        }
                        None => return ParseOutcome::NeedMore,
                    }
                }

                (
                    MessageKind::EntryCreate | MessageKind::EntryUpdate | MessageKind::EntryDelete
                    | MessageKind::EntryIdAssign,
                    ParseState::ReadId,
                ) => match read_u16(&mut self.buf) {
                    Some(id) => {
                        self.id = id;
                        self.state = match kind {
                            MessageKind::EntryCreate | MessageKind::EntryIdAssign => ParseState::ReadName,
                            MessageKind::EntryUpdate => ParseState::ReadValueType,
                            MessageKind::EntryDelete => {
                                return ParseOutcome::Done(Message::EntryDelete {
                                    send_time: self.send_time,
                                    id,
                                })
                            }
                            _ => unreachable!(),
                        };
                    }
                    None => return ParseOutcome::NeedMore,
                },

                (MessageKind::EntryCreate | MessageKind::EntryIdAssign, ParseState::ReadName) => {
                    match read_name(&mut self.buf) {
                        Some(name) => {
                            self.state = match kind {
                                MessageKind::EntryCreate => {
                                    self.name = name;
                                    ParseState::ReadValueType
                                }
                                MessageKind::EntryIdAssign => {
                                    return ParseOutcome::Done(Message::EntryIdAssign { id: self.id, name })
                                }
                                _ => unreachable!(),
                            };
                        }
                        None => return ParseOutcome::NeedMore,
                    }
                }

                (MessageKind::EntryCreate | MessageKind::EntryUpdate, ParseState::ReadValueType) => {
                    match read_u8(&mut self.buf) {
                        Some(tag) => match ValueType::from_tag(tag) {
                            Some(vt) => {
                                self.value_type = Some(vt);
                                self.state = ParseState::ReadValue;
                            }
                            None => return ParseOutcome::Error(ProtocolError::ReadData),
                        },
                        None => return ParseOutcome::NeedMore,
                    }
                }

                (MessageKind::EntryCreate, ParseState::ReadValue) => {
                    let vt = self.value_type.expect("value type read before ReadValue");
                    match read_value(vt, &mut self.buf) {
                        Ok(Some(value)) => {
                            return ParseOutcome::Done(Message::EntryCreate {
                                send_time: self.send_time,
                                id: self.id,
                                name: std::mem::take(&mut self.name),
                                value,
                            })
                        }
                        Ok(None) => return ParseOutcome::NeedMore,
                        Err(e) => return ParseOutcome::Error(e),
                    }
                }

                (MessageKind::EntryUpdate, ParseState::ReadValue) => {
                    let vt = self.value_type.expect("value type read before ReadValue");
                    match read_value(vt, &mut self.buf) {
                        Ok(Some(value)) => {
                            return ParseOutcome::Done(Message::EntryUpdate {
                                send_time: self.send_time,
                                id: self.id,
                                value,
                            })
                        }
                        Ok(None) => return ParseOutcome::NeedMore,
                        Err(e) => return ParseOutcome::Error(e),
                    }
                }

                _ => return ParseOutcome::Error(ProtocolError::UnknownState),
            }
        }
    }
}

impl Default for MessageParser {
    fn default() -> Self {
        MessageParser::new()
    }
}

/// One-shot decode of a complete frame payload. `Err(ReadData)` covers both
/// a truncated payload and a parser left mid-state with no more bytes
/// coming.
pub fn decode(type_tag: u8, payload: &[u8]) -> Result<Message, ProtocolError> {
    let mut parser = MessageParser::new();
    parser.feed(payload);
    match parser.step(type_tag) {
        ParseOutcome::Done(msg) => Ok(msg),
        ParseOutcome::NeedMore => Err(ProtocolError::ReadData),
        ParseOutcome::Error(e) => Err(e),
    }
}

/// Writes into a linear buffer sized to one frame. Each
/// `write_*` method stages its body in a scratch buffer first, so a
/// mid-message failure never leaves a partial prefix committed.
pub struct MessageSerializer {
    buf: Vec<u8>,
    capacity: usize,
}

impl MessageSerializer {
    pub fn new(capacity: usize) -> MessageSerializer {
        MessageSerializer {
            buf: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }

    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    fn commit(&mut self, body: Vec<u8>) -> bool {
        if body.len() > self.capacity {
            return false;
        }
        self.buf = body;
        true
    }

    pub fn write_entry_create(&mut self, send_time: u64, id: u16, name: &str, value: &Value) -> bool {
        if name.len() > MAX_SEQUENCE_LEN {
            return false;
        }
        let mut body = Vec::new();
        body.extend_from_slice(&send_time.to_be_bytes());
        body.extend_from_slice(&id.to_be_bytes());
        body.push(name.len() as u8);
        body.extend_from_slice(name.as_bytes());
        if write_value(value, &mut body).is_err() {
            return false;
        }
        self.commit(body)
    }

    pub fn write_entry_update(&mut self, send_time: u64, id: u16, value: &Value) -> bool {
        let mut body = Vec::new();
        body.extend_from_slice(&send_time.to_be_bytes());
        body.extend_from_slice(&id.to_be_bytes());
        if write_value(value, &mut body).is_err() {
            return false;
        }
        self.commit(body)
    }

    pub fn write_entry_delete(&mut self, send_time: u64, id: u16) -> bool {
        let mut body = Vec::new();
        body.extend_from_slice(&send_time.to_be_bytes());
        body.extend_from_slice(&id.to_be_bytes());
        self.commit(body)
    }

    pub fn write_entry_id_assign(&mut self, id: u16, name: &str) -> bool {
        if name.len() > MAX_SEQUENCE_LEN {
            return false;
        }
        let mut body = Vec::new();
        body.extend_from_slice(&id.to_be_bytes());
        body.push(name.len() as u8);
        body.extend_from_slice(name.as_bytes());
        self.commit(body)
    }

    pub fn write_handshake_finished(&mut self) -> bool {
        self.commit(Vec::new())
    }

    pub fn write_handshake_ready(&mut self) -> bool {
        self.commit(Vec::new())
    }

    pub fn write_time_sync_request(&mut self, send_time: u64) -> bool {
        self.commit(send_time.to_be_bytes().to_vec())
    }

    pub fn write_time_sync_response(&mut self, send_time: u64, request_time: u64) -> bool {
        let mut body = Vec::new();
        body.extend_from_slice(&send_time.to_be_bytes());
        body.extend_from_slice(&request_time.to_be_bytes());
        self.commit(body)
    }
}

/// One-shot encode of a `Message` into a frame payload, or `None` if it
/// doesn't fit in `capacity` (callers abandon the message).
pub fn encode(message: &Message, capacity: usize) -> Option<Vec<u8>> {
    let mut serializer = MessageSerializer::new(capacity);
    let ok = match message {
        Message::EntryCreate { send_time, id, name, value } => {
            serializer.write_entry_create(*send_time, *id, name, value)
        }
        Message::EntryUpdate { send_time, id, value } => {
            serializer.write_entry_update(*send_time, *id, value)
        }
        Message::EntryDelete { send_time, id } => serializer.write_entry_delete(*send_time, *id),
        Message::EntryIdAssign { id, name } => serializer.write_entry_id_assign(*id, name),
        Message::HandshakeFinished => serializer.write_handshake_finished(),
        Message::HandshakeReady => serializer.write_handshake_ready(),
        Message::TimeSyncRequest { send_time } => serializer.write_time_sync_request(*send_time),
        Message::TimeSyncResponse { send_time, request_time } => {
            serializer.write_time_sync_response(*send_time, *request_time)
        }
    };

    if ok {
        Some(serializer.data().to_vec())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn entry_create_roundtrip() {
        let msg = Message::EntryCreate {
            send_time: 42,
            id: 7,
            name: "x".to_string(),
            value: Value::I32(9),
        };
        let bytes = encode(&msg, 1024).unwrap();
        let decoded = decode(MessageKind::EntryCreate.tag(), &bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn handshake_messages_have_empty_payload() {
        let bytes = encode(&Message::HandshakeReady, 1024).unwrap();
        assert!(bytes.is_empty());
        let decoded = decode(MessageKind::HandshakeReady.tag(), &bytes).unwrap();
        assert_eq!(decoded, Message::HandshakeReady);
    }

    #[test]
    fn time_sync_response_roundtrip() {
        let msg = Message::TimeSyncResponse {
            send_time: 100,
            request_time: 50,
        };
        let bytes = encode(&msg, 1024).unwrap();
        let decoded = decode(MessageKind::TimeSyncResponse.tag(), &bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn truncated_payload_is_read_data_error() {
        let bytes = vec![0u8; 3]; // EntryDelete needs 10 bytes (send_time + id)
        let err = decode(MessageKind::EntryDelete.tag(), &bytes).unwrap_err();
        assert_eq!(err, ProtocolError::ReadData);
    }

    #[test]
    fn unknown_type_tag_is_rejected() {
        let err = decode(200, &[]).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownType);
    }

    #[test]
    fn oversize_raw_value_is_rejected_without_partial_write() {
        let value = Value::Raw(vec![0u8; 255]);
        let mut serializer = MessageSerializer::new(1024);
        assert!(!serializer.write_entry_update(1, 1, &value));
        assert_eq!(serializer.size(), 0);
    }
}
