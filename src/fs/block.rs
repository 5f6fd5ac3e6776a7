//! Common block machinery: the 8-byte header every block starts with, the
//! trait blocks implement to be persisted by the log writer, and the codec
//! for fixed-width hardlink names.

use std::io::{Read, Seek, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::error;

use crate::error::{FsError, Result};
use crate::fs::MAX_LINK_NAME_LENGTH;

/// Block id plus the timestamp of the most recent write of this block.
/// A persisted slot whose id reads as zero is free.
#[derive(Debug, Clone, Copy)]
pub struct BlockHeader {
    id: u32,
    last_write_time: u32,
}

impl BlockHeader {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            last_write_time: 0,
        }
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let id = r.read_u32::<LittleEndian>()?;
        if id == 0 {
            error!("fs: found block with id zero");
            return Err(FsError::Corruption("block id zero"));
        }
        let last_write_time = r.read_u32::<LittleEndian>()?;
        Ok(Self {
            id,
            last_write_time,
        })
    }

    /// Stamps the header with `now` and emits it.
    pub fn write_to<W: Write>(&mut self, w: &mut W, now: u32) -> Result<()> {
        w.write_u32::<LittleEndian>(self.id)?;
        self.last_write_time = now;
        w.write_u32::<LittleEndian>(now)?;
        Ok(())
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn last_write_time(&self) -> u32 {
        self.last_write_time
    }
}

/// A block the log writer can persist. `write_to` produces the complete
/// 4096-byte image of the block; the caller positions the stream at the
/// start of a log slot beforehand. Padding may be skipped with seeks, so a
/// reader can observe arbitrary bytes there.
pub trait DiskBlock {
    fn id(&self) -> u32;
    fn write_to<W: Write + Seek>(&mut self, w: &mut W, now: u32) -> Result<()>;
}

/// Releases blocks by id. Directory and File aggregates hold this seam so
/// they can drop emptied list blocks without a back-reference to the FS.
pub trait BlockAllocator {
    fn dealloc_block(&mut self, id: u32);
}

/// Writes a name into its fixed 28-byte slot, zero-padded and always
/// NUL-terminated.
pub fn write_name<W: Write>(w: &mut W, name: &str) -> Result<()> {
    let mut slot = [0u8; MAX_LINK_NAME_LENGTH];
    let n = name.len().min(MAX_LINK_NAME_LENGTH - 1);
    slot[..n].copy_from_slice(&name.as_bytes()[..n]);
    w.write_all(&slot)?;
    Ok(())
}

/// Reads a 28-byte name slot back into a string, stopping at the
/// terminator.
pub fn read_name<R: Read>(r: &mut R) -> Result<String> {
    let mut slot = [0u8; MAX_LINK_NAME_LENGTH];
    r.read_exact(&mut slot)?;
    let end = slot.iter().position(|&b| b == 0).unwrap_or(slot.len());
    Ok(String::from_utf8_lossy(&slot[..end]).into_owned())
}
