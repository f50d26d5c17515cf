use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use ferrite_support::error::{ProtocolError, Result};

use super::buffer::RingBuffer;

pub const MAGIC: u8 = 0x29;
pub const VERSION: u8 = 1;
pub const HEADER_SIZE: usize = 11;
pub const MAX_LENGTH: u32 = 1024;

/// The fixed 11-byte frame header.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Header {
    pub index: u32,
    pub type_tag: u8,
    pub length: u32,
}

enum ReaderState {
    Header,
    Message(Header),
}

/// One completed read from a `FrameReader::poll` call.
pub enum FrameEvent {
    /// Not enough bytes buffered yet; caller should `fill` from the socket.
    NeedMore,
    /// A complete frame.
    Frame(Header, Vec<u8>),
    /// A malformed frame; the reader has already resynchronized (or
    /// discarded the oversize payload) and is ready to `poll` again.
    Error(ProtocolError),
}

/// Drives the two-state HEADER/MESSAGE machine over
/// a ring buffer. Does not own a socket; callers `fill` it from a
/// `Read` and `poll` it for completed frames.
pub struct FrameReader {
    buffer: RingBuffer,
    state: ReaderState,
}

impl FrameReader {
    pub fn new(capacity: usize) -> FrameReader {
        FrameReader {
            buffer: RingBuffer::new(capacity),
            state: ReaderState::Header,
        }
    }

    pub fn fill<R: Read>(&mut self, reader: R) -> Result<usize> {
        self.buffer.ingress(reader)
    }

    /// Advances the state machine as far as buffered bytes allow. Call in a
    /// loop until `NeedMore` to drain every complete frame currently
    /// buffered.
    pub fn poll(&mut self) -> FrameEvent {
        loop {
            match &self.state {
                ReaderState::Header => {
                    if !self.buffer.find_and_seek(MAGIC) {
                        return FrameEvent::NeedMore;
                    }
                    if self.buffer.len() < HEADER_SIZE {
                        return FrameEvent::NeedMore;
                    }

                    let mut raw = [0u8; HEADER_SIZE];
                    raw.copy_from_slice(&self.buffer.read_slice()[..HEADER_SIZE]);
                    let mut cursor: &[u8] = &raw;

                    let magic = cursor.read_u8().expect("fixed-size header read");
                    let version = cursor.read_u8().expect("fixed-size header read");
                    debug_assert_eq!(magic, MAGIC);

                    if version != VERSION {
                        // Restart the scan one byte past the suspect magic.
                        self.buffer.move_head(1);
                        continue;
                    }

                    let index = cursor.read_u32::<BigEndian>().expect("fixed-size header read");
                    let type_tag = cursor.read_u8().expect("fixed-size header read");
                    let length = cursor.read_u32::<BigEndian>().expect("fixed-size header read");
                    self.buffer.move_head(HEADER_SIZE);

                    if length > MAX_LENGTH {
                        let available = self.buffer.len() as u32;
                        let skip = length.min(available) as usize;
                        self.buffer.move_head(skip);
                        self.state = ReaderState::Header;
                        return FrameEvent::Error(ProtocolError::UnsupportedSize);
                    }

                    self.state = ReaderState::Message(Header {
                        index,
                        type_tag,
                        length,
                    });
                }
                ReaderState::Message(header) => {
                    if (self.buffer.len() as u32) < header.length {
                        return FrameEvent::NeedMore;
                    }
                    let header = *header;
                    let payload = self.buffer.read_slice()[..header.length as usize].to_vec();
                    self.buffer.move_head(header.length as usize);
                    self.state = ReaderState::Header;
                    return FrameEvent::Frame(header, payload);
                }
            }
        }
    }
}

/// Buffers outgoing frames and hands their bytes to a socket. The `index`
/// field is a diagnostic-only monotonic counter — receivers
/// never enforce ordering from it.
pub struct FrameWriter {
    buffer: RingBuffer,
    next_index: u32,
}

impl FrameWriter {
    pub fn new(capacity: usize) -> FrameWriter {
        FrameWriter {
            buffer: RingBuffer::new(capacity),
            next_index: 0,
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Appends one frame's header and payload. Returns `false` (buffer
    /// unchanged) if there isn't room for header + payload right now;
    /// callers treat that as "abandon this message".
    pub fn write_frame(&mut self, type_tag: u8, payload: &[u8]) -> bool {
        let total = HEADER_SIZE + payload.len();
        if self.buffer.free_capacity() < total {
            return false;
        }

        let mut header = Vec::with_capacity(HEADER_SIZE);
        header.write_u8(MAGIC).unwrap();
        header.write_u8(VERSION).unwrap();
        header.write_u32::<BigEndian>(self.next_index).unwrap();
        header.write_u8(type_tag).unwrap();
        header.write_u32::<BigEndian>(payload.len() as u32).unwrap();

        let ok = self.buffer.push(&header) && self.buffer.push(payload);
        debug_assert!(ok, "capacity was checked above");
        self.next_index = self.next_index.wrapping_add(1);
        true
    }

    pub fn egress<W: Write>(&mut self, writer: W) -> Result<usize> {
        self.buffer.egress(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn write_then_read_roundtrip() {
        let mut writer = FrameWriter::new(super::super::buffer::DEFAULT_CAPACITY);
        assert!(writer.write_frame(5, &[]));
        assert!(writer.write_frame(6, &[1, 2, 3, 4, 5, 6, 7, 8]));

        let mut wire = Vec::new();
        writer.egress(&mut wire).unwrap();

        let mut reader = FrameReader::new(super::super::buffer::DEFAULT_CAPACITY);
        reader.fill(Cursor::new(wire)).unwrap();

        match reader.poll() {
            FrameEvent::Frame(header, payload) => {
                assert_eq!(header.type_tag, 5);
                assert!(payload.is_empty());
            }
            _ => panic!("expected a frame"),
        }

        match reader.poll() {
            FrameEvent::Frame(header, payload) => {
                assert_eq!(header.type_tag, 6);
                assert_eq!(payload, vec![1, 2, 3, 4, 5, 6, 7, 8]);
            }
            _ => panic!("expected a frame"),
        }

        assert!(matches!(reader.poll(), FrameEvent::NeedMore));
    }

    #[test]
    fn resyncs_past_noise_before_a_valid_frame() {
        let mut writer = FrameWriter::new(super::super::buffer::DEFAULT_CAPACITY);
        writer.write_frame(8, &[]);
        let mut wire = Vec::new();
        writer.egress(&mut wire).unwrap();

        let mut noisy = vec![0u8; 100];
        noisy.extend_from_slice(&wire);
        noisy.extend(vec![0u8; 50]);

        let mut writer2 = FrameWriter::new(super::super::buffer::DEFAULT_CAPACITY);
        writer2.write_frame(6, &[0, 0, 0, 0, 0, 0, 0, 1]);
        let mut wire2 = Vec::new();
        writer2.egress(&mut wire2).unwrap();
        noisy.extend_from_slice(&wire2);

        let mut reader = FrameReader::new(super::super::buffer::DEFAULT_CAPACITY * 2);
        reader.fill(Cursor::new(noisy)).unwrap();

        let mut frames = Vec::new();
        loop {
            match reader.poll() {
                FrameEvent::Frame(header, payload) => frames.push((header.type_tag, payload)),
                FrameEvent::NeedMore => break,
                FrameEvent::Error(_) => continue,
            }
        }

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].0, 8);
        assert_eq!(frames[1].0, 6);
    }

    #[test]
    fn oversize_length_reports_unsupported_size() {
        let mut raw = Vec::new();
        raw.write_u8(MAGIC).unwrap();
        raw.write_u8(VERSION).unwrap();
        raw.write_u32::<BigEndian>(0).unwrap();
        raw.write_u8(1).unwrap();
        raw.write_u32::<BigEndian>(MAX_LENGTH + 1).unwrap();

        let mut reader = FrameReader::new(super::super::buffer::DEFAULT_CAPACITY);
        reader.fill(Cursor::new(raw)).unwrap();

        assert!(matches!(
            reader.poll(),
            FrameEvent::Error(ProtocolError::UnsupportedSize)
        ));
    }
}
