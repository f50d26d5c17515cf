use std::io;

use ferrite_support::error::{Error, IoErrorKind, Result};
use slice_deque::SliceDeque;

/// Default capacity for read/write ring buffers. Must hold at least one
/// full frame (`HEADER_SIZE + MAX_LENGTH` = 1035 bytes) with room to spare,
/// since a burst of small frames (e.g. handshake replay) can deliver more
/// than one frame's worth of bytes in a single readable event.
pub const DEFAULT_CAPACITY: usize = 2048;

/// A fixed-capacity ring buffer backed by `slice_deque`, whose virtual
/// memory mapping trick keeps `read_slice`/`write_slice` contiguous even
/// across a wraparound — this is what lets `find_and_seek` scan for the
/// magic byte with a single linear scan instead of the two-part wraparound
/// scan the original ring buffer needs.
pub struct RingBuffer {
    data: SliceDeque<u8>,
    capacity: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> RingBuffer {
        let mut data = SliceDeque::new();
        data.reserve(capacity);
        RingBuffer { data, capacity }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.data.len())
    }

    #[inline]
    pub fn move_head(&mut self, count: usize) {
        unsafe { self.data.move_head(count as isize) }
    }

    #[inline]
    pub fn move_tail(&mut self, count: usize) {
        unsafe { self.data.move_tail(count as isize) }
    }

    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        self.data.as_slice()
    }

    #[inline]
    pub fn write_slice(&mut self) -> &mut [u8] {
        let avail = self.free_capacity();
        let full = unsafe { self.data.tail_head_slice() };
        let len = full.len().min(avail);
        &mut full[..len]
    }

    #[inline]
    pub fn clear(&mut self) {
        let len = self.len();
        self.move_head(len);
    }

    /// Scans forward for `marker`, discarding every byte before it. Returns
    /// `true` if found, `false` if the whole buffer was discarded without a
    /// match. Used for HEADER-state resync on a bad magic byte.
    pub fn find_and_seek(&mut self, marker: u8) -> bool {
        match self.data.iter().position(|&b| b == marker) {
            Some(pos) => {
                self.move_head(pos);
                true
            }
            None => {
                let len = self.len();
                self.move_head(len);
                false
            }
        }
    }

    /// Writes the buffer's contents out, advancing the read offset as it
    /// goes. Stops at the first short write below capacity (the writer is
    /// not ready for more); a zero-length write is treated as a closed peer.
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> Result<usize> {
        let orig_len = self.data.len();

        while !self.data.is_empty() {
            let written = writer.write(self.data.as_slice())?;
            if written == 0 {
                return Err(Error::Io(IoErrorKind::ClosedFd));
            }
            self.move_head(written);
        }

        Ok(orig_len - self.data.len())
    }

    /// Appends `bytes`, looping over `write_slice` chunks in case a
    /// wraparound splits the write. Returns `false` and leaves the buffer
    /// unchanged if there isn't enough free capacity for all of `bytes`.
    pub fn push(&mut self, bytes: &[u8]) -> bool {
        if self.free_capacity() < bytes.len() {
            return false;
        }
        let mut offset = 0;
        while offset < bytes.len() {
            let chunk = self.write_slice();
            let n = chunk.len().min(bytes.len() - offset);
            chunk[..n].copy_from_slice(&bytes[offset..offset + n]);
            self.move_tail(n);
            offset += n;
        }
        true
    }

    /// Reads as much as the reader offers, up to this buffer's capacity. A
    /// zero-length read means the peer has no more data right now (not
    /// necessarily closed). A buffer that fills up before that just stops —
    /// the caller drains whatever frames are now available and calls
    /// `ingress` again on the next readable event; it is not an error.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> Result<usize> {
        let orig_free = self.free_capacity();

        while self.data.len() < self.capacity {
            let read = reader.read(self.write_slice())?;
            if read == 0 {
                break;
            }
            self.move_tail(read);
        }

        Ok(orig_free - self.free_capacity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;
    use std::io::Cursor;

    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        max_size: usize,
    }

    impl MockChannel {
        fn new(data: Vec<u8>, chunk: usize, max_size: usize) -> MockChannel {
            MockChannel {
                data,
                cursor: 0,
                chunk,
                max_size,
            }
        }

        fn clear(&mut self) {
            self.data.clear();
            self.cursor = 0;
        }
    }

    impl io::Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let offset = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..offset].copy_from_slice(&self.data[self.cursor..self.cursor + offset]);
            self.cursor += offset;
            Ok(offset)
        }
    }

    impl io::Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.data.len() == self.max_size {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let count = min(self.chunk, buf.len());
            self.data.extend(&buf[..count]);
            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn roundtrip() {
        let mock_data: Vec<u8> = (0..512).map(|i| i as u8).collect();
        let mut channel = MockChannel::new(mock_data.clone(), 64, mock_data.len());

        let mut buffer = RingBuffer::new(DEFAULT_CAPACITY);
        let result = buffer.ingress(&mut channel);
        assert!(result.is_ok());
        assert_eq!(buffer.read_slice(), &mock_data[..]);

        channel.clear();
        let written = buffer.egress(&mut channel).unwrap();
        assert_eq!(written, mock_data.len());
        assert_eq!(buffer.len(), 0);
        assert_eq!(channel.data, mock_data);
    }

    #[test]
    fn egress_error_on_zero_write() {
        let mut zero_vec: Vec<u8> = vec![];
        let mut buffer = RingBuffer::new(DEFAULT_CAPACITY);
        buffer.data.push_back(1);

        let result = buffer.egress(&mut zero_vec[..]);
        assert!(matches!(result, Err(Error::Io(IoErrorKind::ClosedFd))));
    }

    #[test]
    fn ingress_stops_when_full_without_erroring() {
        let mock_data: Vec<u8> = (0..DEFAULT_CAPACITY * 2).map(|i| i as u8).collect();
        let mut buffer = RingBuffer::new(DEFAULT_CAPACITY);
        let read = buffer.ingress(&mock_data[..]).unwrap();
        assert_eq!(read, DEFAULT_CAPACITY);
        assert_eq!(buffer.len(), DEFAULT_CAPACITY);
        assert_eq!(buffer.free_capacity(), 0);
    }

    #[test]
    fn find_and_seek_resyncs_past_noise() {
        let mut buffer = RingBuffer::new(DEFAULT_CAPACITY);
        let mut cursor = Cursor::new(vec![0xAA, 0xBB, 0xCC, 0x29, 0x01]);
        buffer.ingress(&mut cursor).unwrap();

        assert!(buffer.find_and_seek(0x29));
        assert_eq!(buffer.read_slice(), &[0x29, 0x01]);
    }

    #[test]
    fn find_and_seek_discards_when_absent() {
        let mut buffer = RingBuffer::new(DEFAULT_CAPACITY);
        let mut cursor = Cursor::new(vec![0xAA, 0xBB, 0xCC]);
        buffer.ingress(&mut cursor).unwrap();

        assert!(!buffer.find_and_seek(0x29));
        assert!(buffer.is_empty());
    }
}
