//! Metadata shared by all INode blocks.

use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::error;

use crate::error::{FsError, Result};
use crate::fs::block::BlockHeader;
use crate::fs::MAX_NUMBER_OF_LINKS_TO_INODE;

/// INode type; only the lower nibble is stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InodeKind {
    Directory = 1,
    RegularFile = 2,
    /// Reserved type code, never constructed.
    Symlink = 3,
}

impl InodeKind {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(InodeKind::Directory),
            2 => Some(InodeKind::RegularFile),
            3 => Some(InodeKind::Symlink),
            _ => None,
        }
    }

    pub fn as_raw(self) -> u8 {
        self as u8
    }
}

/// The common INode header: block header plus creation time, content size,
/// packed type/inline byte and the hardlink counter. 20 bytes on disk.
#[derive(Debug, Clone)]
pub struct Inode {
    header: BlockHeader,
    creation_time: u32,
    size_b: u32,
    kind: InodeKind,
    inlined: bool,
    link_counter: u16,
}

impl Inode {
    pub fn new(id: u32, kind: InodeKind, now: u32) -> Self {
        Self {
            header: BlockHeader::new(id),
            creation_time: now,
            size_b: 0,
            kind,
            inlined: true,
            link_counter: 0,
        }
    }

    /// Reads the 20-byte INode header. The stream must be positioned at the
    /// start of the block.
    pub fn read_from<R: Read + Seek>(r: &mut R) -> Result<Self> {
        let header = BlockHeader::read_from(r)?;
        let creation_time = r.read_u32::<LittleEndian>()?;
        let size_b = r.read_u32::<LittleEndian>()?;
        let packed = r.read_u8()?;
        let kind = InodeKind::from_raw((packed >> 4) & 0xF).ok_or_else(|| {
            error!("fs: unknown INode type in block {}", header.id());
            FsError::Corruption("unknown inode type")
        })?;
        let inlined = packed & 0x08 != 0;
        r.seek(SeekFrom::Current(1))?;
        let link_counter = r.read_u16::<LittleEndian>()?;
        Ok(Self {
            header,
            creation_time,
            size_b,
            kind,
            inlined,
            link_counter,
        })
    }

    pub fn write_to<W: Write + Seek>(&mut self, w: &mut W, now: u32) -> Result<()> {
        self.header.write_to(w, now)?;
        w.write_u32::<LittleEndian>(self.creation_time)?;
        w.write_u32::<LittleEndian>(self.size_b)?;
        let packed = (self.kind.as_raw() << 4) | ((self.inlined as u8) << 3);
        w.write_u8(packed)?;
        w.seek(SeekFrom::Current(1))?;
        w.write_u16::<LittleEndian>(self.link_counter)?;
        Ok(())
    }

    pub fn id(&self) -> u32 {
        self.header.id()
    }

    pub fn last_write_time(&self) -> u32 {
        self.header.last_write_time()
    }

    pub fn creation_time(&self) -> u32 {
        self.creation_time
    }

    pub fn kind(&self) -> InodeKind {
        self.kind
    }

    pub fn is_inlined(&self) -> bool {
        self.inlined
    }

    pub(crate) fn set_inlined(&mut self, inlined: bool) {
        self.inlined = inlined;
    }

    pub fn internal_size(&self) -> u32 {
        self.size_b
    }

    pub(crate) fn set_internal_size(&mut self, size_b: u32) {
        self.size_b = size_b;
    }

    pub fn link_counter(&self) -> u16 {
        self.link_counter
    }

    pub fn increment_link_counter(&mut self) -> Result<()> {
        if self.link_counter == MAX_NUMBER_OF_LINKS_TO_INODE {
            return Err(FsError::CapacityExceeded);
        }
        self.link_counter += 1;
        Ok(())
    }

    pub fn decrement_link_counter(&mut self) {
        self.link_counter = self.link_counter.saturating_sub(1);
    }
}
