//! DataBlock: a block of raw file content.

use std::io::{Read, Seek, Write};

use log::error;

use crate::error::{FsError, Result};
use crate::fs::block::{BlockHeader, DiskBlock};
use crate::fs::MAX_BYTES_PER_DATABLOCK;

#[derive(Debug)]
pub struct DataBlock {
    header: BlockHeader,
    data: Box<[u8]>,
    /// Set by every write, so the owning File knows the cached copy must be
    /// persisted before it is displaced.
    dirty: bool,
}

impl DataBlock {
    pub fn new(id: u32) -> Self {
        Self {
            header: BlockHeader::new(id),
            data: vec![0u8; MAX_BYTES_PER_DATABLOCK as usize].into_boxed_slice(),
            dirty: false,
        }
    }

    pub fn read_from<R: Read + Seek>(r: &mut R) -> Result<Self> {
        let header = BlockHeader::read_from(r)?;
        let mut data = vec![0u8; MAX_BYTES_PER_DATABLOCK as usize].into_boxed_slice();
        r.read_exact(&mut data)?;
        Ok(Self {
            header,
            data,
            dirty: false,
        })
    }

    pub fn id(&self) -> u32 {
        self.header.id()
    }

    pub fn read(&self, target: &mut [u8], pos: u32) -> Result<()> {
        let end = pos as usize + target.len();
        if end > MAX_BYTES_PER_DATABLOCK as usize {
            error!(
                "fs: out-of-bound read in block {} at {} len {}",
                self.header.id(),
                pos,
                target.len()
            );
            return Err(FsError::InvalidArgument);
        }
        target.copy_from_slice(&self.data[pos as usize..end]);
        Ok(())
    }

    pub fn write(&mut self, source: &[u8], pos: u32) -> Result<()> {
        let end = pos as usize + source.len();
        if end > MAX_BYTES_PER_DATABLOCK as usize {
            error!(
                "fs: out-of-bound write in block {} at {} len {}",
                self.header.id(),
                pos,
                source.len()
            );
            return Err(FsError::InvalidArgument);
        }
        self.data[pos as usize..end].copy_from_slice(source);
        self.dirty = true;
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

impl DiskBlock for DataBlock {
    fn id(&self) -> u32 {
        self.header.id()
    }

    fn write_to<W: Write + Seek>(&mut self, w: &mut W, now: u32) -> Result<()> {
        self.header.write_to(w, now)?;
        w.write_all(&self.data)?;
        Ok(())
    }
}
