use std::collections::VecDeque;
use std::io::Write;

use ferrite_support::error::Result;

use crate::wire::{FrameWriter, Message};

/// Enqueue flags. `IMMEDIATE` attempts a synchronous write
/// through the frame writer before falling back to the tail of the queue.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct EnqueueFlags(u8);

impl EnqueueFlags {
    pub const NONE: EnqueueFlags = EnqueueFlags(0);
    pub const IMMEDIATE: EnqueueFlags = EnqueueFlags(1);

    pub fn contains(self, other: EnqueueFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Per-peer outgoing FIFO over a [`FrameWriter`]. `enqueue`
/// tries an immediate write when asked to; `flush` drains from the head,
/// stopping at the first message the writer won't currently accept so the
/// queue stays in order.
pub struct MessageQueue {
    pending: VecDeque<(u8, Vec<u8>)>,
    writer: FrameWriter,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> MessageQueue {
        MessageQueue {
            pending: VecDeque::new(),
            writer: FrameWriter::new(capacity),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && !self.writer.has_pending()
    }

    /// Encodes `message` and either writes it immediately (if `flags`
    /// requests it and the writer currently accepts a frame of this size)
    /// or appends it to the tail. Returns `false` if encoding failed (the
    /// message was too large to fit the frame budget) — callers treat that
    /// as "abandon this message".
    pub fn enqueue(&mut self, message: &Message, flags: EnqueueFlags, frame_capacity: usize) -> bool {
        let payload = match crate::wire::encode(message, frame_capacity) {
            Some(bytes) => bytes,
            None => return false,
        };
        let type_tag = message.kind().tag();

        if flags.contains(EnqueueFlags::IMMEDIATE) && self.pending.is_empty() {
            if self.writer.write_frame(type_tag, &payload) {
                return true;
            }
        }

        self.pending.push_back((type_tag, payload));
        true
    }

    /// Moves queued frames into the writer's own buffer until the writer
    /// refuses one (buffer full); that frame and everything after it stays
    /// queued. Returns the number of frames moved into the writer.
    pub fn drain_into_writer(&mut self) -> usize {
        let mut moved = 0;
        while let Some((type_tag, payload)) = self.pending.front() {
            if !self.writer.write_frame(*type_tag, payload) {
                break;
            }
            self.pending.pop_front();
            moved += 1;
        }
        moved
    }

    /// Flushes the writer's buffered bytes to the socket. On a hard I/O
    /// error the caller is expected to tear the session down.
    pub fn flush<W: Write>(&mut self, writer: W) -> Result<usize> {
        self.drain_into_writer();
        self.writer.egress(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::MessageKind;

    fn msg(send_time: u64) -> Message {
        Message::TimeSyncRequest { send_time }
    }

    #[test]
    fn immediate_enqueue_writes_through() {
        let mut queue = MessageQueue::new(4096);
        assert!(queue.enqueue(&msg(1), EnqueueFlags::IMMEDIATE, 1024));

        let mut out = Vec::new();
        let n = queue.flush(&mut out).unwrap();
        assert!(n > 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn queued_without_immediate_flag_waits_for_flush() {
        let mut queue = MessageQueue::new(4096);
        assert!(queue.enqueue(&msg(1), EnqueueFlags::NONE, 1024));
        assert!(!queue.is_empty());

        let mut out = Vec::new();
        queue.flush(&mut out).unwrap();
        assert!(!out.is_empty());
    }

    #[test]
    fn fifo_order_preserved_across_flushes() {
        let mut queue = MessageQueue::new(4096);
        queue.enqueue(&msg(1), EnqueueFlags::NONE, 1024);
        queue.enqueue(&msg(2), EnqueueFlags::NONE, 1024);

        let mut out = Vec::new();
        queue.flush(&mut out).unwrap();

        let mut reader = crate::wire::FrameReader::new(4096);
        reader.fill(std::io::Cursor::new(out)).unwrap();

        let first = reader.poll();
        match first {
            crate::wire::FrameEvent::Frame(header, payload) => {
                assert_eq!(header.type_tag, MessageKind::TimeSyncRequest.tag());
                let decoded = crate::wire::decode(header.type_tag, &payload).unwrap();
                assert_eq!(decoded, msg(1));
            }
            _ => panic!("expected first frame"),
        }
    }
}
