//! DirectoryEntryList: an auxiliary block holding hardlinks for a
//! directory that outgrew its inline table.

use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;
use crate::fs::block::{read_name, write_name, BlockHeader, DiskBlock};
use crate::fs::hardlink::Hardlink;
use crate::fs::{MAX_LINKS_PER_DIRENTRYLIST, MAX_LINK_NAME_LENGTH};

/// Padding between the block header and the entry table.
const ENTRY_TABLE_PAD: i64 = 24;

#[derive(Debug)]
pub struct DirectoryEntryList {
    header: BlockHeader,
    entries: Vec<Hardlink>,
}

impl DirectoryEntryList {
    pub fn new(id: u32) -> Self {
        Self {
            header: BlockHeader::new(id),
            entries: Vec::new(),
        }
    }

    /// Reads a list from a stream positioned at the start of its log slot.
    pub fn read_from<R: Read + Seek>(r: &mut R) -> Result<Self> {
        let header = BlockHeader::read_from(r)?;
        r.seek(SeekFrom::Current(ENTRY_TABLE_PAD))?;
        let mut entries = Vec::new();
        for _ in 0..MAX_LINKS_PER_DIRENTRYLIST {
            let id = r.read_u32::<LittleEndian>()?;
            if id == 0 {
                break;
            }
            entries.push(Hardlink::new(read_name(r)?, id));
        }
        Ok(Self { header, entries })
    }

    pub fn id(&self) -> u32 {
        self.header.id()
    }

    pub fn add_link(&mut self, link: Hardlink) -> std::result::Result<(), Hardlink> {
        if self.entries.len() >= MAX_LINKS_PER_DIRENTRYLIST {
            return Err(link);
        }
        self.entries.push(link);
        Ok(())
    }

    pub fn remove_link(&mut self, name: &str) -> Option<Hardlink> {
        let index = self.entries.iter().position(|l| l.name() == name)?;
        Some(self.entries.remove(index))
    }

    pub fn find_link(&self, name: &str) -> Option<&Hardlink> {
        self.entries.iter().find(|l| l.name() == name)
    }

    pub fn link_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ls(&self, result: &mut Vec<String>) {
        result.extend(self.entries.iter().map(|l| l.name().to_owned()));
    }
}

impl DiskBlock for DirectoryEntryList {
    fn id(&self) -> u32 {
        self.header.id()
    }

    fn write_to<W: Write + Seek>(&mut self, w: &mut W, now: u32) -> Result<()> {
        self.header.write_to(w, now)?;
        w.seek(SeekFrom::Current(ENTRY_TABLE_PAD))?;
        for link in &self.entries {
            w.write_u32::<LittleEndian>(link.target())?;
            write_name(w, link.name())?;
        }
        for _ in self.entries.len()..MAX_LINKS_PER_DIRENTRYLIST {
            w.write_u32::<LittleEndian>(0)?;
            w.seek(SeekFrom::Current(MAX_LINK_NAME_LENGTH as i64))?;
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
    fn round_trip_preserves_order() {
        let mut list = DirectoryEntryList::new(9);
        list.add_link(Hardlink::new("b", 4)).unwrap();
        list.add_link(Hardlink::new("a", 5)).unwrap();

        let mut buf = Cursor::new(vec![0u8; BLOCK_SIZE as usize]);
        list.write_to(&mut buf, 1).unwrap();
        buf.set_position(0);
        let read = DirectoryEntryList::read_from(&mut buf).unwrap();
        assert_eq!(read.id(), 9);
        let mut names = Vec::new();
        read.ls(&mut names);
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(read.find_link("a").unwrap().target(), 5);
    }

    #[test]
    fn add_refuses_when_full() {
        let mut list = DirectoryEntryList::new(1);
        for i in 0..MAX_LINKS_PER_DIRENTRYLIST {
            list.add_link(Hardlink::new(format!("n{i}"), i as u32 + 2))
                .unwrap();
        }
        assert!(list.add_link(Hardlink::new("overflow", 999)).is_err());
        assert_eq!(list.link_count(), MAX_LINKS_PER_DIRENTRYLIST);
    }

    #[test]
    fn remove_by_name() {
        let mut list = DirectoryEntryList::new(1);
        list.add_link(Hardlink::new("x", 2)).unwrap();
        list.add_link(Hardlink::new("y", 3)).unwrap();
        let removed = list.remove_link("x").unwrap();
        assert_eq!(removed.target(), 2);
        assert!(list.find_link("x").is_none());
        assert!(list.remove_link("x").is_none());
        assert_eq!(list.link_count(), 1);
    }

    #[test]
    fn full_table_fits_the_block_exactly() {
        let mut list = DirectoryEntryList::new(1);
        for i in 0..MAX_LINKS_PER_DIRENTRYLIST {
            list.add_link(Hardlink::new(format!("entry-{i:03}"), i as u32 + 2))
                .unwrap();
        }
        let mut buf = Cursor::new(vec![0u8; BLOCK_SIZE as usize]);
        list.write_to(&mut buf, 1).unwrap();
        assert_eq!(buf.position(), BLOCK_SIZE as u64);
    }
}
