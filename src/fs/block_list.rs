//! DataBlockList: an auxiliary block holding an ordered run of DataBlock
//! ids for one file. Ids are packed without gaps.

use std::io::{Read, Seek, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;
use crate::fs::block::{BlockHeader, DiskBlock};
use crate::fs::MAX_DATABLOCKS_PER_DATABLOCKLIST;

#[derive(Debug)]
pub struct DataBlockList {
    header: BlockHeader,
    entries: Vec<u32>,
}

impl DataBlockList {
    pub fn new(id: u32) -> Self {
        Self {
            header: BlockHeader::new(id),
            entries: Vec::new(),
        }
    }

    pub fn read_from<R: Read + Seek>(r: &mut R) -> Result<Self> {
        let header = BlockHeader::read_from(r)?;
        let mut entries = Vec::new();
        for _ in 0..MAX_DATABLOCKS_PER_DATABLOCKLIST {
            let id = r.read_u32::<LittleEndian>()?;
            if id == 0 {
                break;
            }
            entries.push(id);
        }
        Ok(Self { header, entries })
    }

    pub fn id(&self) -> u32 {
        self.header.id()
    }

    pub fn push_data_block(&mut self, id: u32) -> bool {
        if self.entries.len() == MAX_DATABLOCKS_PER_DATABLOCKLIST {
            return false;
        }
        self.entries.push(id);
        true
    }

    /// Removes and returns the last id; zero when the list is empty.
    pub fn pop_data_block(&mut self) -> u32 {
        self.entries.pop().unwrap_or(0)
    }

    pub fn data_block(&self, index: usize) -> u32 {
        self.entries.get(index).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn blocks(&self, result: &mut Vec<u32>) {
        result.extend_from_slice(&self.entries);
    }
}

impl DiskBlock for DataBlockList {
    fn id(&self) -> u32 {
        self.header.id()
    }

    fn write_to<W: Write + Seek>(&mut self, w: &mut W, now: u32) -> Result<()> {
        self.header.write_to(w, now)?;
        for id in &self.entries {
            w.write_u32::<LittleEndian>(*id)?;
        }
        for _ in self.entries.len()..MAX_DATABLOCKS_PER_DATABLOCKLIST {
            w.write_u32::<LittleEndian>(0)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::BLOCK_SIZE;
    use std::io::Cursor;

    #[test]
    fn push_pop_round_trip() {
        let mut list = DataBlockList::new(3);
        assert!(list.push_data_block(10));
        assert!(list.push_data_block(11));

        let mut buf = Cursor::new(vec![0u8; BLOCK_SIZE as usize]);
        list.write_to(&mut buf, 1).unwrap();
        assert_eq!(buf.position(), BLOCK_SIZE as u64);
        buf.set_position(0);
        let mut read = DataBlockList::read_from(&mut buf).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read.data_block(0), 10);
        assert_eq!(read.data_block(2), 0);
        assert_eq!(read.pop_data_block(), 11);
        assert_eq!(read.pop_data_block(), 10);
        assert_eq!(read.pop_data_block(), 0);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut list = DataBlockList::new(3);
        for i in 0..MAX_DATABLOCKS_PER_DATABLOCKLIST {
            assert!(list.push_data_block(i as u32 + 2));
        }
        assert!(!list.push_data_block(9999));
        assert_eq!(list.len(), MAX_DATABLOCKS_PER_DATABLOCKLIST);
    }
}
