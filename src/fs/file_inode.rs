//! The primary INode of a regular file.
//!
//! Small files live entirely inside this block (inline payload); once a
//! write crosses the inline capacity the payload moves into DataBlocks and
//! this block holds the ids of the DataBlockList blocks instead.

use std::io::{Read, Seek, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::error;

use crate::error::{FsError, Result};
use crate::fs::block::DiskBlock;
use crate::fs::data_block::DataBlock;
use crate::fs::inode::{Inode, InodeKind};
use crate::fs::{
    BLOCK_SIZE, MAX_BYTES_PER_DATABLOCK, MAX_BYTES_PER_INODE, MAX_DATABLOCKLISTS_PER_FILE,
    MAX_FILE_SIZE,
};

#[derive(Debug)]
pub struct FileInode {
    inode: Inode,
    /// Inline payload; length tracks internal_size while inlined.
    data: Vec<u8>,
    /// External contents: ids of DataBlockList blocks, insertion order.
    block_list_ids: Vec<u32>,
}

impl FileInode {
    pub fn new(id: u32, now: u32) -> Self {
        Self {
            inode: Inode::new(id, InodeKind::RegularFile, now),
            data: Vec::new(),
            block_list_ids: Vec::new(),
        }
    }

    pub fn read_from<R: Read + Seek>(r: &mut R) -> Result<Self> {
        let inode = Inode::read_from(r)?;
        if inode.kind() != InodeKind::RegularFile {
            error!(
                "fs: inconsistency, reading FileINode from INode of type {:?}",
                inode.kind()
            );
            return Err(FsError::Corruption("not a file inode"));
        }
        let mut data = Vec::new();
        let mut block_list_ids = Vec::new();
        if inode.is_inlined() {
            data = vec![0u8; inode.internal_size() as usize];
            r.read_exact(&mut data)?;
        } else {
            for _ in 0..MAX_DATABLOCKLISTS_PER_FILE {
                let id = r.read_u32::<LittleEndian>()?;
                if id == 0 {
                    break;
                }
                block_list_ids.push(id);
            }
        }
        Ok(Self {
            inode,
            data,
            block_list_ids,
        })
    }

    pub fn id(&self) -> u32 {
        self.inode.id()
    }

    pub fn inode(&self) -> &Inode {
        &self.inode
    }

    pub fn inode_mut(&mut self) -> &mut Inode {
        &mut self.inode
    }

    pub fn is_inlined(&self) -> bool {
        self.inode.is_inlined()
    }

    pub fn internal_size(&self) -> u32 {
        self.inode.internal_size()
    }

    pub fn set_internal_size(&mut self, size_b: u32) -> Result<()> {
        if size_b > MAX_FILE_SIZE {
            error!(
                "fs: cannot set size of file {}, limit exceeded ({})",
                self.inode.id(),
                size_b
            );
            return Err(FsError::CapacityExceeded);
        }
        self.inode.set_internal_size(size_b);
        Ok(())
    }

    /// Disk footprint: this block, plus lists and DataBlocks once external.
    pub fn user_visible_size(&self) -> u32 {
        if self.is_inlined() {
            BLOCK_SIZE
        } else {
            let data_blocks = self.internal_size().div_ceil(MAX_BYTES_PER_DATABLOCK);
            (1 + self.block_list_ids.len() as u32 + data_blocks) * BLOCK_SIZE
        }
    }

    pub fn read_inline(&self, target: &mut [u8], pos: u32) -> Result<()> {
        let end = pos as usize + target.len();
        if !self.is_inlined() || end > self.data.len() {
            error!(
                "fs: invalid inline read from file {} at {} len {}",
                self.inode.id(),
                pos,
                target.len()
            );
            return Err(FsError::InvalidArgument);
        }
        target.copy_from_slice(&self.data[pos as usize..end]);
        Ok(())
    }

    /// Copies into the inline payload, growing it as needed. The caller
    /// updates internal_size afterwards.
    pub fn write_inline(&mut self, source: &[u8], pos: u32) -> Result<()> {
        let end = pos as usize + source.len();
        if !self.is_inlined() || end > MAX_BYTES_PER_INODE as usize {
            error!(
                "fs: invalid inline write to file {} at {} len {}",
                self.inode.id(),
                pos,
                source.len()
            );
            return Err(FsError::InvalidArgument);
        }
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[pos as usize..end].copy_from_slice(source);
        Ok(())
    }

    /// Moves the inline payload into the given DataBlock and switches to
    /// the external layout, registering the first DataBlockList id.
    pub fn convert_to_non_inline(&mut self, list_id: u32, block: &mut DataBlock) -> Result<()> {
        if !self.is_inlined() {
            return Err(FsError::Corruption("file inode already external"));
        }
        self.block_list_ids.push(list_id);
        let payload = std::mem::take(&mut self.data);
        block.write(&payload, 0)?;
        self.inode.set_inlined(false);
        Ok(())
    }

    pub fn block_list_ids(&self) -> &[u32] {
        &self.block_list_ids
    }

    pub fn push_block_list(&mut self, id: u32) -> Result<()> {
        if self.block_list_ids.len() == MAX_DATABLOCKLISTS_PER_FILE {
            return Err(FsError::CapacityExceeded);
        }
        self.block_list_ids.push(id);
        Ok(())
    }

    /// Drops the last DataBlockList id; the first list is never removed.
    pub fn pop_block_list(&mut self) -> u32 {
        if self.block_list_ids.len() <= 1 {
            return 0;
        }
        self.block_list_ids.pop().unwrap_or(0)
    }
}

impl DiskBlock for FileInode {
    fn id(&self) -> u32 {
        self.inode.id()
    }

    fn write_to<W: Write + Seek>(&mut self, w: &mut W, now: u32) -> Result<()> {
        self.inode.write_to(w, now)?;
        if self.inode.is_inlined() {
            let len = (self.inode.internal_size() as usize).min(self.data.len());
            w.write_all(&self.data[..len])?;
        } else {
            for id in &self.block_list_ids {
                w.write_u32::<LittleEndian>(*id)?;
            }
            for _ in self.block_list_ids.len()..MAX_DATABLOCKLISTS_PER_FILE {
                w.write_u32::<LittleEndian>(0)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn inline_payload_round_trip() {
        let mut fi = FileInode::new(4, 1);
        fi.write_inline(b"hello world", 0).unwrap();
        fi.set_internal_size(11).unwrap();

        let mut buf = Cursor::new(vec![0u8; BLOCK_SIZE as usize]);
        fi.write_to(&mut buf, 2).unwrap();
        buf.set_position(0);
        let read = FileInode::read_from(&mut buf).unwrap();
        assert!(read.is_inlined());
        assert_eq!(read.internal_size(), 11);
        let mut out = [0u8; 5];
        read.read_inline(&mut out, 6).unwrap();
        assert_eq!(&out, b"world");
    }

    #[test]
    fn inline_write_grows_but_respects_capacity() {
        let mut fi = FileInode::new(4, 1);
        fi.write_inline(&[7u8; MAX_BYTES_PER_INODE as usize], 0)
            .unwrap();
        assert!(fi.write_inline(&[7u8; 2], MAX_BYTES_PER_INODE - 1).is_err());
    }

    #[test]
    fn external_round_trip() {
        let mut fi = FileInode::new(4, 1);
        fi.write_inline(b"abc", 0).unwrap();
        fi.set_internal_size(3).unwrap();
        let mut block = DataBlock::new(9);
        fi.convert_to_non_inline(8, &mut block).unwrap();
        assert!(!fi.is_inlined());
        let mut out = [0u8; 3];
        block.read(&mut out, 0).unwrap();
        assert_eq!(&out, b"abc");

        let mut buf = Cursor::new(vec![0u8; BLOCK_SIZE as usize]);
        fi.write_to(&mut buf, 2).unwrap();
        buf.set_position(0);
        let read = FileInode::read_from(&mut buf).unwrap();
        assert!(!read.is_inlined());
        assert_eq!(read.block_list_ids(), &[8]);
    }

    #[test]
    fn first_block_list_is_never_popped() {
        let mut fi = FileInode::new(4, 1);
        let mut block = DataBlock::new(9);
        fi.convert_to_non_inline(8, &mut block).unwrap();
        fi.push_block_list(12).unwrap();
        assert_eq!(fi.pop_block_list(), 12);
        assert_eq!(fi.pop_block_list(), 0);
        assert_eq!(fi.block_list_ids(), &[8]);
    }
}
