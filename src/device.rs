//! Access to the backing block device.
//!
//! The file system only needs a positioned byte stream over a fixed-size
//! store; [`ImageCursor`] provides that over anything byte-addressable
//! (an mmap'd image file in the host program, a plain `Vec<u8>` in tests).

use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};

use memmap2::MmapMut;

/// A seekable byte store holding the file system image.
///
/// `sync` is the durability point: it must not return before the written
/// bytes have reached the backing store.
pub trait BlockDevice: Read + Write + Seek {
    fn sync(&mut self) -> std::io::Result<()> {
        self.flush()
    }
}

/// Cursor with an explicit position over a fixed-size byte buffer.
///
/// Writes never grow the buffer; writing past the end is a short write.
#[derive(Debug, Default)]
pub struct ImageCursor<T> {
    inner: T,
    pos: u64,
}

impl<T> ImageCursor<T> {
    pub fn new(inner: T) -> Self {
        Self { inner, pos: 0 }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    pub const fn position(&self) -> u64 {
        self.pos
    }
}

impl<T: AsRef<[u8]>> Seek for ImageCursor<T> {
    fn seek(&mut self, style: SeekFrom) -> std::io::Result<u64> {
        let (base, offset) = match style {
            SeekFrom::Start(n) => {
                self.pos = n;
                return Ok(n);
            }
            SeekFrom::End(n) => (self.inner.as_ref().len() as u64, n),
            SeekFrom::Current(n) => (self.pos, n),
        };
        match base.checked_add_signed(offset) {
            Some(n) => {
                self.pos = n;
                Ok(n)
            }
            None => Err(ErrorKind::InvalidInput.into()),
        }
    }

    fn stream_position(&mut self) -> std::io::Result<u64> {
        Ok(self.pos)
    }
}

impl<T: AsRef<[u8]>> Read for ImageCursor<T> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let slice = self.inner.as_ref();
        let start = self.pos.min(slice.len() as u64) as usize;
        let n = buf.len().min(slice.len() - start);
        buf[..n].copy_from_slice(&slice[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Write for ImageCursor<T> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let slice = self.inner.as_mut();
        let start = self.pos.min(slice.len() as u64) as usize;
        let n = buf.len().min(slice.len() - start);
        slice[start..start + n].copy_from_slice(&buf[..n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl BlockDevice for ImageCursor<MmapMut> {
    fn sync(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl BlockDevice for ImageCursor<Vec<u8>> {}

impl BlockDevice for std::io::Cursor<Vec<u8>> {}

impl BlockDevice for std::fs::File {
    fn sync(&mut self) -> std::io::Result<()> {
        self.sync_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positioned_read_and_write() {
        let mut cursor = ImageCursor::new(vec![0u8; 1024]);
        cursor.seek(SeekFrom::Start(512)).unwrap();
        assert_eq!(cursor.write(&[1u8; 512]).unwrap(), 512);

        cursor.seek(SeekFrom::Start(512)).unwrap();
        let mut buf = vec![0u8; 512];
        cursor.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [1; 512]);
    }

    #[test]
    fn unaligned_writes_track_position() {
        let mut cursor = ImageCursor::new(vec![0u8; 64]);
        assert_eq!(cursor.write(&[1, 3, 8, 7, 6, 29]).unwrap(), 6);
        assert_eq!(cursor.position(), 6);
        assert_eq!(cursor.write(&[1, 2, 3, 4]).unwrap(), 4);

        cursor.seek(SeekFrom::Start(0)).unwrap();
        let mut buf = vec![0; 10];
        cursor.read_exact(&mut buf).unwrap();
        assert_eq!(cursor.position(), 10);
        assert_eq!(buf, [1, 3, 8, 7, 6, 29, 1, 2, 3, 4]);
    }

    #[test]
    fn write_past_end_is_short() {
        let mut cursor = ImageCursor::new(vec![0u8; 8]);
        cursor.seek(SeekFrom::Start(6)).unwrap();
        assert_eq!(cursor.write(&[9u8; 4]).unwrap(), 2);
        assert!(cursor.write_all(&[9u8; 4]).is_err());
    }

    #[test]
    fn relative_seek() {
        let mut cursor = ImageCursor::new(vec![0u8; 32]);
        cursor.seek(SeekFrom::Start(8)).unwrap();
        cursor.seek(SeekFrom::Current(4)).unwrap();
        assert_eq!(cursor.position(), 12);
        cursor.seek(SeekFrom::End(-2)).unwrap();
        assert_eq!(cursor.position(), 30);
    }
}
