//! The primary INode of a directory.
//!
//! Two physical layouts share the block: while inlined, the hardlinks live
//! directly behind the INode header; once converted, the block holds the
//! ids of the DirectoryEntryList blocks instead. The conversion is one-way.

use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::error;

use crate::error::{FsError, Result};
use crate::fs::block::{read_name, write_name, DiskBlock};
use crate::fs::entry_list::DirectoryEntryList;
use crate::fs::hardlink::Hardlink;
use crate::fs::inode::{Inode, InodeKind};
use crate::fs::{
    BLOCK_SIZE, MAX_DIRENTRYLISTS_PER_DIR, MAX_LINKS_PER_DIRENTRYLIST, MAX_LINK_NAME_LENGTH,
};

/// Padding between the INode header and the inline entry table.
const INLINE_TABLE_PAD: i64 = 12;

#[derive(Debug)]
pub struct DirectoryInode {
    inode: Inode,
    /// Inline contents; empty once converted.
    entries: Vec<Hardlink>,
    /// External contents: ids of DirectoryEntryList blocks.
    entry_list_ids: Vec<u32>,
}

impl DirectoryInode {
    pub fn new(id: u32, now: u32) -> Self {
        Self {
            inode: Inode::new(id, InodeKind::Directory, now),
            entries: Vec::new(),
            entry_list_ids: Vec::new(),
        }
    }

    pub fn read_from<R: Read + Seek>(r: &mut R) -> Result<Self> {
        let inode = Inode::read_from(r)?;
        if inode.kind() != InodeKind::Directory {
            error!(
                "fs: inconsistency, reading DirectoryINode from INode of type {:?}",
                inode.kind()
            );
            return Err(FsError::Corruption("not a directory inode"));
        }
        let mut entries = Vec::new();
        let mut entry_list_ids = Vec::new();
        if inode.is_inlined() {
            r.seek(SeekFrom::Current(INLINE_TABLE_PAD))?;
            for _ in 0..MAX_LINKS_PER_DIRENTRYLIST {
                let id = r.read_u32::<LittleEndian>()?;
                if id == 0 {
                    break;
                }
                entries.push(Hardlink::new(read_name(r)?, id));
            }
        } else {
            for _ in 0..MAX_DIRENTRYLISTS_PER_DIR {
                let id = r.read_u32::<LittleEndian>()?;
                if id == 0 {
                    break;
                }
                entry_list_ids.push(id);
            }
        }
        Ok(Self {
            inode,
            entries,
            entry_list_ids,
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

    /// Disk footprint: this block plus every entry-list block.
    pub fn user_visible_size(&self) -> u32 {
        (self.entry_list_ids.len() as u32 + 1) * BLOCK_SIZE
    }

    pub fn add_link(&mut self, link: Hardlink) -> std::result::Result<(), Hardlink> {
        debug_assert!(self.is_inlined());
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

    pub fn inline_link_count(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn ls_inline(&self, result: &mut Vec<String>) {
        result.extend(self.entries.iter().map(|l| l.name().to_owned()));
    }

    /// Moves every inline entry into the given (empty) list and switches
    /// this INode to the external layout. Irreversible.
    pub fn convert_to_non_inline(&mut self, list: &mut DirectoryEntryList) -> Result<()> {
        if !self.is_inlined() {
            error!(
                "fs: cannot convert non-inlined INode {} again",
                self.inode.id()
            );
            return Err(FsError::Corruption("directory inode already external"));
        }
        if list.link_count() != 0 {
            return Err(FsError::Corruption("conversion target list not empty"));
        }
        for link in self.entries.drain(..) {
            if let Err(link) = list.add_link(link) {
                error!("fs: cannot move hardlink {:?} during conversion", link.name());
                return Err(FsError::Corruption("conversion target list overflow"));
            }
        }
        self.inode.set_inlined(false);
        self.entry_list_ids.push(list.id());
        Ok(())
    }

    pub fn entry_list_ids(&self) -> &[u32] {
        &self.entry_list_ids
    }

    pub fn add_entry_list(&mut self, id: u32) -> Result<()> {
        debug_assert!(!self.is_inlined());
        if self.entry_list_ids.len() == MAX_DIRENTRYLISTS_PER_DIR {
            return Err(FsError::CapacityExceeded);
        }
        self.entry_list_ids.push(id);
        Ok(())
    }

    pub fn remove_entry_list(&mut self, id: u32) -> bool {
        if let Some(index) = self.entry_list_ids.iter().position(|&e| e == id) {
            self.entry_list_ids.remove(index);
            true
        } else {
            false
        }
    }
}

impl DiskBlock for DirectoryInode {
    fn id(&self) -> u32 {
        self.inode.id()
    }

    fn write_to<W: Write + Seek>(&mut self, w: &mut W, now: u32) -> Result<()> {
        self.inode.write_to(w, now)?;
        if self.inode.is_inlined() {
            w.seek(SeekFrom::Current(INLINE_TABLE_PAD))?;
            for link in &self.entries {
                w.write_u32::<LittleEndian>(link.target())?;
                write_name(w, link.name())?;
            }
            for _ in self.entries.len()..MAX_LINKS_PER_DIRENTRYLIST {
                w.write_u32::<LittleEndian>(0)?;
                w.seek(SeekFrom::Current(MAX_LINK_NAME_LENGTH as i64))?;
            }
        } else {
            for id in &self.entry_list_ids {
                w.write_u32::<LittleEndian>(*id)?;
            }
            for _ in self.entry_list_ids.len()..MAX_DIRENTRYLISTS_PER_DIR {
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
    fn inline_round_trip() {
        let mut di = DirectoryInode::new(1, 10);
        di.add_link(Hardlink::new(".", 1)).unwrap();
        di.add_link(Hardlink::new("..", 1)).unwrap();
        di.add_link(Hardlink::new("etc", 3)).unwrap();

        let mut buf = Cursor::new(vec![0u8; BLOCK_SIZE as usize]);
        di.write_to(&mut buf, 11).unwrap();
        buf.set_position(0);
        let read = DirectoryInode::read_from(&mut buf).unwrap();
        assert!(read.is_inlined());
        assert_eq!(read.inline_link_count(), 3);
        assert_eq!(read.find_link("etc").unwrap().target(), 3);
        let mut names = Vec::new();
        read.ls_inline(&mut names);
        assert_eq!(names, vec![".", "..", "etc"]);
    }

    #[test]
    fn external_round_trip() {
        let mut di = DirectoryInode::new(2, 10);
        let mut list = DirectoryEntryList::new(7);
        di.add_link(Hardlink::new(".", 2)).unwrap();
        di.convert_to_non_inline(&mut list).unwrap();
        di.add_entry_list(8).unwrap();

        let mut buf = Cursor::new(vec![0u8; BLOCK_SIZE as usize]);
        di.write_to(&mut buf, 11).unwrap();
        buf.set_position(0);
        let read = DirectoryInode::read_from(&mut buf).unwrap();
        assert!(!read.is_inlined());
        assert_eq!(read.entry_list_ids(), &[7, 8]);
        assert_eq!(read.user_visible_size(), 3 * BLOCK_SIZE);
    }

    #[test]
    fn conversion_moves_all_links_and_is_one_way() {
        let mut di = DirectoryInode::new(1, 0);
        for i in 0..5 {
            di.add_link(Hardlink::new(format!("f{i}"), i + 2)).unwrap();
        }
        let mut list = DirectoryEntryList::new(9);
        di.convert_to_non_inline(&mut list).unwrap();
        assert_eq!(di.inline_link_count(), 0);
        assert_eq!(list.link_count(), 5);
        assert!(!di.is_inlined());

        let mut second = DirectoryEntryList::new(10);
        assert!(di.convert_to_non_inline(&mut second).is_err());
    }

    #[test]
    fn wrong_kind_is_rejected() {
        let mut inode = Inode::new(4, InodeKind::RegularFile, 0);
        let mut buf = Cursor::new(vec![0u8; BLOCK_SIZE as usize]);
        inode.write_to(&mut buf, 0).unwrap();
        buf.set_position(0);
        assert!(matches!(
            DirectoryInode::read_from(&mut buf),
            Err(FsError::Corruption(_))
        ));
    }
}
