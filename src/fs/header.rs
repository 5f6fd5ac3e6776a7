//! Codec for the image header.
//!
//! | Off | Size | Field          |
//! |-----|------|----------------|
//! | 0   | 4    | magic          |
//! | 4   | 4    | reserved       |
//! | 8   | 8    | size_b         |
//! | 16  | 4    | write_ptr      |
//! | 20  | 4    | bmap_valid     |
//! | 24  | 4    | nextBlockID    |
//! | 28  | 4    | usedBlocks     |
//! | 32  | 4    | lastUmountTime |

use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::error;

use crate::error::{FsError, Result};
use crate::fs::{FS_MAGIC, FS_MAX_SIZE, FS_MIN_SIZE};

pub const WRITE_PTR_OFFSET: u64 = 16;
pub const BMAP_VALID_OFFSET: u64 = 20;
pub const NEXT_BLOCK_ID_OFFSET: u64 = 24;
pub const USED_BLOCKS_OFFSET: u64 = 28;
pub const LAST_UMOUNT_TIME_OFFSET: u64 = 32;

#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub size_b: u64,
    pub write_ptr: u32,
    pub bmap_valid: bool,
    pub next_block_id: u32,
    pub used_blocks: u32,
    pub last_umount_time: u32,
}

impl Header {
    /// Reads and sanity-checks the header. The deeper checks against the
    /// log geometry happen in the mount path once the layout is known.
    pub fn read_from<R: Read + Seek>(r: &mut R) -> Result<Self> {
        r.seek(SeekFrom::Start(0))?;
        let magic = r.read_u32::<LittleEndian>()?;
        if magic != FS_MAGIC {
            error!("fs: wrong magic, expected {:#x}, got {:#x}", FS_MAGIC, magic);
            return Err(FsError::Corruption("bad magic"));
        }
        let _reserved = r.read_u32::<LittleEndian>()?;
        let size_b = r.read_u64::<LittleEndian>()?;
        if !(FS_MIN_SIZE..=FS_MAX_SIZE).contains(&size_b) {
            error!("fs: invalid size {}", size_b);
            return Err(FsError::Corruption("size out of range"));
        }
        let write_ptr = r.read_u32::<LittleEndian>()?;
        if write_ptr == 0 {
            error!("fs: invalid next write position zero");
            return Err(FsError::Corruption("write_ptr zero"));
        }
        let bmap_valid = r.read_u32::<LittleEndian>()? == 1;
        let next_block_id = r.read_u32::<LittleEndian>()?;
        let used_blocks = r.read_u32::<LittleEndian>()?;
        if used_blocks == 0 {
            error!("fs: invalid number of used blocks, got zero");
            return Err(FsError::Corruption("no used blocks"));
        }
        let last_umount_time = r.read_u32::<LittleEndian>()?;
        Ok(Self {
            size_b,
            write_ptr,
            bmap_valid,
            next_block_id,
            used_blocks,
            last_umount_time,
        })
    }

    pub fn write_to<W: Write + Seek>(&self, w: &mut W) -> Result<()> {
        w.seek(SeekFrom::Start(0))?;
        w.write_u32::<LittleEndian>(FS_MAGIC)?;
        w.write_u32::<LittleEndian>(0)?;
        w.write_u64::<LittleEndian>(self.size_b)?;
        w.write_u32::<LittleEndian>(self.write_ptr)?;
        w.write_u32::<LittleEndian>(self.bmap_valid as u32)?;
        w.write_u32::<LittleEndian>(self.next_block_id)?;
        w.write_u32::<LittleEndian>(self.used_blocks)?;
        w.write_u32::<LittleEndian>(self.last_umount_time)?;
        Ok(())
    }
}

/// Overwrites a single header field in place.
pub fn write_field<W: Write + Seek>(w: &mut W, offset: u64, value: u32) -> Result<()> {
    w.seek(SeekFrom::Start(offset))?;
    w.write_u32::<LittleEndian>(value)?;
    Ok(())
}

pub fn read_field<R: Read + Seek>(r: &mut R, offset: u64) -> Result<u32> {
    r.seek(SeekFrom::Start(offset))?;
    Ok(r.read_u32::<LittleEndian>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample() -> Header {
        Header {
            size_b: 1 << 20,
            write_ptr: 5,
            bmap_valid: true,
            next_block_id: 9,
            used_blocks: 4,
            last_umount_time: 1234,
        }
    }

    #[test]
    fn round_trip() {
        let mut buf = Cursor::new(vec![0u8; 64]);
        sample().write_to(&mut buf).unwrap();
        let header = Header::read_from(&mut buf).unwrap();
        assert_eq!(header.size_b, 1 << 20);
        assert_eq!(header.write_ptr, 5);
        assert!(header.bmap_valid);
        assert_eq!(header.next_block_id, 9);
        assert_eq!(header.used_blocks, 4);
        assert_eq!(header.last_umount_time, 1234);
    }

    #[test]
    fn rejects_bad_magic() {
        let buf = vec![0u8; 64];
        let mut cursor = Cursor::new(buf);
        assert!(matches!(
            Header::read_from(&mut cursor),
            Err(FsError::Corruption(_))
        ));
    }

    #[test]
    fn rejects_out_of_range_size() {
        let mut buf = Cursor::new(vec![0u8; 64]);
        let mut header = sample();
        header.size_b = 1024;
        header.write_to(&mut buf).unwrap();
        assert!(Header::read_from(&mut buf).is_err());
    }

    #[test]
    fn field_patching() {
        let mut buf = Cursor::new(vec![0u8; 64]);
        sample().write_to(&mut buf).unwrap();
        write_field(&mut buf, BMAP_VALID_OFFSET, 0).unwrap();
        let header = Header::read_from(&mut buf).unwrap();
        assert!(!header.bmap_valid);
        assert_eq!(read_field(&mut buf, WRITE_PTR_OFFSET).unwrap(), 5);
    }
}
