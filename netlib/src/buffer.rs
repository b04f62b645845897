use byteorder::{ByteOrder, LittleEndian};

use crate::error::{NetError, Result};

/// Fixed-capacity byte cursor with independent read/write offsets.
///
/// Grounded on the teacher's `net::buffer::Buffer` (an `io::Read`/`io::Write`
/// byte queue) and `net::frame::Header::deserialize` (bounds-checked
/// `byteorder` reads against a known `SIZE`), simplified from the teacher's
/// chunked deque: that shape exists to stream an unbounded `TcpStream`, while
/// every buffer here backs a single bounded UDP datagram or message payload,
/// so one flat `Vec<u8>` is enough.
pub struct Buffer {
    data: Vec<u8>,
    write_pos: usize,
    read_pos: usize,
    read_overrun: bool,
}

impl Buffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Buffer {
            data: vec![0u8; capacity],
            write_pos: 0,
            read_pos: 0,
            read_overrun: false,
        }
    }

    /// Wraps already-populated data for reading (e.g. a received datagram).
    pub fn wrap(data: Vec<u8>) -> Self {
        let write_pos = data.len();
        Buffer {
            data,
            write_pos,
            read_pos: 0,
            read_overrun: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn written_len(&self) -> usize {
        self.write_pos
    }

    pub fn remaining_to_read(&self) -> usize {
        self.write_pos.saturating_sub(self.read_pos)
    }

    pub fn as_written_slice(&self) -> &[u8] {
        &self.data[..self.write_pos]
    }

    pub fn into_written_vec(mut self) -> Vec<u8> {
        self.data.truncate(self.write_pos);
        self.data
    }

    /// Rewinds both cursors so the buffer's existing allocation can be reused
    /// for a fresh write, instead of allocating a new `Vec<u8>` per packet.
    pub fn reset_write(&mut self) {
        self.write_pos = 0;
        self.read_pos = 0;
        self.read_overrun = false;
    }

    /// Consulted by callers after a run of reads past the end of the written
    /// region, per spec.md §4.2.
    pub fn has_overrun(&self) -> bool {
        self.read_overrun
    }

    fn ensure_write(&mut self, len: usize) -> Result<()> {
        if self.write_pos + len > self.data.len() {
            return Err(NetError::BufferOverrun);
        }
        Ok(())
    }

    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        self.ensure_write(1)?;
        self.data[self.write_pos] = v;
        self.write_pos += 1;
        Ok(())
    }

    pub fn write_u16(&mut self, v: u16) -> Result<()> {
        self.ensure_write(2)?;
        LittleEndian::write_u16(&mut self.data[self.write_pos..], v);
        self.write_pos += 2;
        Ok(())
    }

    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        self.ensure_write(4)?;
        LittleEndian::write_u32(&mut self.data[self.write_pos..], v);
        self.write_pos += 4;
        Ok(())
    }

    pub fn write_u64(&mut self, v: u64) -> Result<()> {
        self.ensure_write(8)?;
        LittleEndian::write_u64(&mut self.data[self.write_pos..], v);
        self.write_pos += 8;
        Ok(())
    }

    pub fn write_f32(&mut self, v: f32) -> Result<()> {
        self.ensure_write(4)?;
        LittleEndian::write_f32(&mut self.data[self.write_pos..], v);
        self.write_pos += 4;
        Ok(())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.ensure_write(bytes.len())?;
        self.data[self.write_pos..self.write_pos + bytes.len()].copy_from_slice(bytes);
        self.write_pos += bytes.len();
        Ok(())
    }

    pub fn read_u8(&mut self) -> u8 {
        if self.read_pos + 1 > self.write_pos {
            self.read_overrun = true;
            return 0;
        }
        let v = self.data[self.read_pos];
        self.read_pos += 1;
        v
    }

    pub fn read_u16(&mut self) -> u16 {
        if self.read_pos + 2 > self.write_pos {
            self.read_overrun = true;
            return 0;
        }
        let v = LittleEndian::read_u16(&self.data[self.read_pos..]);
        self.read_pos += 2;
        v
    }

    pub fn read_u32(&mut self) -> u32 {
        if self.read_pos + 4 > self.write_pos {
            self.read_overrun = true;
            return 0;
        }
        let v = LittleEndian::read_u32(&self.data[self.read_pos..]);
        self.read_pos += 4;
        v
    }

    pub fn read_u64(&mut self) -> u64 {
        if self.read_pos + 8 > self.write_pos {
            self.read_overrun = true;
            return 0;
        }
        let v = LittleEndian::read_u64(&self.data[self.read_pos..]);
        self.read_pos += 8;
        v
    }

    pub fn read_f32(&mut self) -> f32 {
        if self.read_pos + 4 > self.write_pos {
            self.read_overrun = true;
            return 0.0;
        }
        let v = LittleEndian::read_f32(&self.data[self.read_pos..]);
        self.read_pos += 4;
        v
    }

    pub fn read_bytes(&mut self, len: usize) -> Vec<u8> {
        if self.read_pos + len > self.write_pos {
            self.read_overrun = true;
            return vec![0u8; len];
        }
        let v = self.data[self.read_pos..self.read_pos + len].to_vec();
        self.read_pos += len;
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_primitives() {
        let mut buf = Buffer::with_capacity(64);
        buf.write_u8(7).unwrap();
        buf.write_u16(1234).unwrap();
        buf.write_u32(0xDEAD_BEEF).unwrap();
        buf.write_u64(0x1122_3344_5566_7788).unwrap();
        buf.write_f32(3.5).unwrap();
        buf.write_bytes(b"hello").unwrap();

        let mut read = Buffer::wrap(buf.into_written_vec());
        assert_eq!(read.read_u8(), 7);
        assert_eq!(read.read_u16(), 1234);
        assert_eq!(read.read_u32(), 0xDEAD_BEEF);
        assert_eq!(read.read_u64(), 0x1122_3344_5566_7788);
        assert_eq!(read.read_f32(), 3.5);
        assert_eq!(read.read_bytes(5), b"hello");
        assert!(!read.has_overrun());
    }

    #[test]
    fn write_past_capacity_fails() {
        let mut buf = Buffer::with_capacity(2);
        assert!(buf.write_u32(1).is_err());
    }

    #[test]
    fn read_past_written_sets_overrun_flag() {
        let mut buf = Buffer::with_capacity(4);
        buf.write_u8(1).unwrap();
        let mut read = Buffer::wrap(buf.into_written_vec());
        assert_eq!(read.read_u8(), 1);
        assert_eq!(read.read_u32(), 0);
        assert!(read.has_overrun());
    }
}
