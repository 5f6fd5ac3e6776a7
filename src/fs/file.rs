//! The File aggregate: a primary FileINode, its DataBlockLists, and a
//! single-slot DataBlock cache that is written through on eviction.
//!
//! Like [`Directory`](crate::fs::directory::Directory), mutators return the
//! ids of every metadata block they touched; new list blocks come from a
//! [`BlockListAllocator`].

use log::error;

use crate::device::BlockDevice;
use crate::error::{FsError, Result};
use crate::fs::block::BlockAllocator;
use crate::fs::core::FsCore;
use crate::fs::block_list::DataBlockList;
use crate::fs::data_block::DataBlock;
use crate::fs::directory::add_unique;
use crate::fs::file_inode::FileInode;
use crate::fs::{MAX_BYTES_PER_DATABLOCK, MAX_DATABLOCKS_PER_DATABLOCKLIST};

pub trait BlockListAllocator: BlockAllocator {
    fn alloc_block_list(&mut self) -> Result<DataBlockList>;
}

#[derive(Debug)]
pub struct File {
    inode: FileInode,
    block_lists: Vec<DataBlockList>,
    number_of_data_blocks: u32,
    cached: Option<DataBlock>,
}

impl File {
    /// Assembles a file loaded from disk. `block_lists` must be the lists
    /// referenced by the INode, in order.
    pub fn from_parts(inode: FileInode, block_lists: Vec<DataBlockList>) -> Self {
        let number_of_data_blocks = if inode.is_inlined() {
            0
        } else {
            inode.internal_size().div_ceil(MAX_BYTES_PER_DATABLOCK)
        };
        Self {
            inode,
            block_lists,
            number_of_data_blocks,
            cached: None,
        }
    }

    /// A brand-new empty (inlined) file.
    pub fn new(inode: FileInode) -> Self {
        Self {
            inode,
            block_lists: Vec::new(),
            number_of_data_blocks: 0,
            cached: None,
        }
    }

    pub fn primary(&self) -> &FileInode {
        &self.inode
    }

    pub fn primary_mut(&mut self) -> &mut FileInode {
        &mut self.inode
    }

    pub fn is_inlined(&self) -> bool {
        self.inode.is_inlined()
    }

    pub fn number_of_data_blocks(&self) -> u32 {
        self.number_of_data_blocks
    }

    /// Switches to the external layout: the inline payload moves into
    /// `block`, referenced by a freshly allocated first DataBlockList.
    /// `block` becomes the cached DataBlock. Returns changed block ids
    /// (list, INode and the DataBlock itself).
    pub fn convert_to_non_inline<A: BlockListAllocator>(
        &mut self,
        mut block: DataBlock,
        alloc: &mut A,
    ) -> Result<Vec<u32>> {
        if !self.is_inlined() {
            return Err(FsError::Corruption("file already non-inline"));
        }
        let mut list = alloc.alloc_block_list()?;
        list.push_data_block(block.id());
        self.inode.convert_to_non_inline(list.id(), &mut block)?;
        let changed = vec![list.id(), self.inode.id(), block.id()];
        self.block_lists.push(list);
        self.number_of_data_blocks += 1;
        self.cached = Some(block);
        Ok(changed)
    }

    /// Appends a DataBlock, allocating a new DataBlockList when the last
    /// one is full. The block becomes the cached DataBlock (the caller has
    /// already persisted the previous cache if it was dirty). Returns
    /// changed metadata block ids.
    pub fn add_data_block<A: BlockListAllocator>(
        &mut self,
        block: DataBlock,
        alloc: &mut A,
    ) -> Result<Vec<u32>> {
        if self.is_inlined() {
            error!(
                "fs: cannot add DataBlock to inline-mode file {}",
                self.inode.id()
            );
            return Err(FsError::Corruption("add to inline file"));
        }
        let mut changed = Vec::new();
        if self.number_of_data_blocks as usize % MAX_DATABLOCKS_PER_DATABLOCKLIST == 0 {
            let list = alloc.alloc_block_list()?;
            if let Err(e) = self.inode.push_block_list(list.id()) {
                alloc.dealloc_block(list.id());
                return Err(e);
            }
            add_unique(&mut changed, vec![self.inode.id()]);
            self.block_lists.push(list);
        }
        let last = self
            .block_lists
            .last_mut()
            .ok_or(FsError::Corruption("file without block list"))?;
        if !last.push_data_block(block.id()) {
            return Err(FsError::Corruption("full block list selected"));
        }
        add_unique(&mut changed, vec![last.id()]);
        self.number_of_data_blocks += 1;
        self.cached = Some(block);
        Ok(changed)
    }

    /// Removes the last DataBlock, releasing its id, and drops the last
    /// DataBlockList when the removal drained it while more than one list
    /// is in use. Returns changed metadata block ids.
    pub fn remove_data_block<A: BlockListAllocator>(
        &mut self,
        alloc: &mut A,
    ) -> Result<Vec<u32>> {
        if self.is_inlined() {
            error!(
                "fs: cannot remove a DataBlock from inline-mode file {}",
                self.inode.id()
            );
            return Err(FsError::Corruption("remove from inline file"));
        }
        let last = self
            .block_lists
            .last_mut()
            .ok_or(FsError::Corruption("file without block list"))?;
        let removed = last.pop_data_block();
        if removed == 0 {
            return Err(FsError::Corruption("empty block list on remove"));
        }
        alloc.dealloc_block(removed);
        if self.cached.as_ref().map_or(false, |c| c.id() == removed) {
            self.cached = None;
        }
        self.number_of_data_blocks -= 1;

        let mut changed = Vec::new();
        let last_is_empty = self.block_lists.last().map_or(false, |l| l.is_empty());
        if last_is_empty && self.block_lists.len() > 1 {
            if let Some(list) = self.block_lists.pop() {
                alloc.dealloc_block(list.id());
                self.inode.pop_block_list();
                changed.push(self.inode.id());
            }
        } else if let Some(list) = self.block_lists.last() {
            changed.push(list.id());
        }
        Ok(changed)
    }

    /// Id of the n-th DataBlock (zero-based); zero if out of range.
    pub fn data_block_id(&self, block_no: u32) -> u32 {
        if self.is_inlined() || block_no >= self.number_of_data_blocks {
            return 0;
        }
        let list_no = block_no as usize / MAX_DATABLOCKS_PER_DATABLOCKLIST;
        self.block_lists[list_no].data_block(block_no as usize % MAX_DATABLOCKS_PER_DATABLOCKLIST)
    }

    /// Ids of every block belonging to this file: the primary INode, all
    /// DataBlockLists and all DataBlocks.
    pub fn blocks(&self) -> Vec<u32> {
        let mut result = vec![self.inode.id()];
        if !self.is_inlined() {
            for list in &self.block_lists {
                result.push(list.id());
                list.blocks(&mut result);
            }
        }
        result
    }

    /// Persists every block of this file whose id appears in `ids`
    /// (primary INode, block lists, or the cached DataBlock). Foreign ids
    /// are ignored.
    pub fn save_changed<D: BlockDevice>(
        &mut self,
        core: &mut FsCore<D>,
        ids: &[u32],
    ) -> Result<()> {
        for &id in ids {
            if id == self.inode.id() {
                core.save_block(&mut self.inode)?;
            } else if let Some(list) = self.block_lists.iter_mut().find(|l| l.id() == id) {
                core.save_block(list)?;
            } else if let Some(cached) = self.cached.as_mut() {
                if cached.id() == id {
                    core.save_block(cached)?;
                }
            }
        }
        Ok(())
    }

    pub fn cached_data_block_id(&self) -> u32 {
        self.cached.as_ref().map_or(0, |c| c.id())
    }

    pub fn cached_data_block_is_dirty(&self) -> bool {
        self.cached.as_ref().map_or(false, |c| c.is_dirty())
    }

    pub fn set_cached_data_block(&mut self, block: DataBlock) {
        self.cached = Some(block);
    }

    pub fn release_cached_data_block(&mut self) -> Option<DataBlock> {
        self.cached.take()
    }

    pub fn read_from_cached_data_block(&self, target: &mut [u8], pos: u32) -> Result<()> {
        match &self.cached {
            Some(block) => block.read(target, pos),
            None => Err(FsError::Corruption("no cached data block")),
        }
    }

    pub fn write_to_cached_data_block(&mut self, source: &[u8], pos: u32) -> Result<()> {
        match &mut self.cached {
            Some(block) => block.write(source, pos),
            None => Err(FsError::Corruption("no cached data block")),
        }
    }
}
