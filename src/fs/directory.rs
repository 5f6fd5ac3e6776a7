//! The Directory aggregate: a primary DirectoryINode plus the
//! DirectoryEntryLists it references, presented as one name→id table.
//!
//! Mutators return the ids of every block they touched (deduplicated); the
//! FS decides when and where those blocks hit the log. New entry-list
//! blocks are requested through [`EntryListAllocator`] so this type needs
//! no back-reference to the FS.

use log::warn;

use crate::device::BlockDevice;
use crate::error::{FsError, Result};
use crate::fs::block::BlockAllocator;
use crate::fs::core::FsCore;
use crate::fs::dir_inode::DirectoryInode;
use crate::fs::entry_list::DirectoryEntryList;
use crate::fs::hardlink::Hardlink;
use crate::fs::inode::Inode;
use crate::fs::MAX_HARDLINKS_PER_DIR;

pub trait EntryListAllocator: BlockAllocator {
    fn alloc_entry_list(&mut self) -> Result<DirectoryEntryList>;
}

/// Pushes each id of `more` not already present.
pub fn add_unique(changed: &mut Vec<u32>, more: Vec<u32>) {
    for id in more {
        if !changed.contains(&id) {
            changed.push(id);
        }
    }
}

#[derive(Debug)]
pub struct Directory {
    inode: DirectoryInode,
    child_count: u32,
    entry_lists: Vec<DirectoryEntryList>,
}

impl Directory {
    /// Assembles a directory loaded from disk. `entry_lists` must be the
    /// lists referenced by the INode, in order.
    pub fn from_parts(inode: DirectoryInode, entry_lists: Vec<DirectoryEntryList>) -> Self {
        let child_count = if inode.is_inlined() {
            inode.inline_link_count()
        } else {
            entry_lists.iter().map(|l| l.link_count() as u32).sum()
        };
        Self {
            inode,
            child_count,
            entry_lists,
        }
    }

    /// Creates a new directory below `parent`, with "." and ".." already
    /// linked. Returns the directory and the changed block ids (the fresh
    /// INode and the parent INode, whose link counter grew by the "..").
    pub fn create(mut inode: DirectoryInode, parent: &mut Inode) -> Result<(Self, Vec<u32>)> {
        let own_id = inode.id();
        inode.inode_mut().increment_link_counter()?;
        inode
            .add_link(Hardlink::new(".", own_id))
            .map_err(|_| FsError::CapacityExceeded)?;
        parent.increment_link_counter()?;
        inode
            .add_link(Hardlink::new("..", parent.id()))
            .map_err(|_| FsError::CapacityExceeded)?;
        let changed = vec![own_id, parent.id()];
        Ok((
            Self {
                inode,
                child_count: 2,
                entry_lists: Vec::new(),
            },
            changed,
        ))
    }

    /// Creates the root directory; "." and ".." both point at itself.
    pub fn create_root(mut inode: DirectoryInode) -> Self {
        let own_id = inode.id();
        // a fresh inode counts zero links, the two increments cannot fail
        let _ = inode.inode_mut().increment_link_counter();
        let _ = inode.inode_mut().increment_link_counter();
        let _ = inode.add_link(Hardlink::new(".", own_id));
        let _ = inode.add_link(Hardlink::new("..", own_id));
        Self {
            inode,
            child_count: 2,
            entry_lists: Vec::new(),
        }
    }

    pub fn primary(&self) -> &DirectoryInode {
        &self.inode
    }

    pub fn primary_mut(&mut self) -> &mut DirectoryInode {
        &mut self.inode
    }

    pub fn child_count(&self) -> u32 {
        self.child_count
    }

    pub fn entry_list_ids(&self) -> Vec<u32> {
        self.entry_lists.iter().map(|l| l.id()).collect()
    }

    /// Resolves a name to its target block id; zero if absent or invalid.
    pub fn search_hardlink(&self, name: &str) -> u32 {
        if name.is_empty() || name.contains('/') {
            warn!("fs: {:?} is not a valid link name", name);
            return 0;
        }
        if self.inode.is_inlined() {
            self.inode.find_link(name).map_or(0, |l| l.target())
        } else {
            self.entry_lists
                .iter()
                .find_map(|list| list.find_link(name))
                .map_or(0, |l| l.target())
        }
    }

    /// Links `name` to `target`, incrementing its link counter. Placement:
    /// inline while there is room, otherwise the INode converts and the
    /// link goes into the first entry list with a free slot (allocating
    /// another list when all are full). Returns changed block ids.
    pub fn add_hardlink<A: EntryListAllocator>(
        &mut self,
        target: &mut Inode,
        name: &str,
        alloc: &mut A,
    ) -> Result<Vec<u32>> {
        if self.search_hardlink(name) != 0 {
            warn!("fs: cannot add hardlink {:?}, already present", name);
            return Err(FsError::AlreadyExists);
        }
        if self.child_count == MAX_HARDLINKS_PER_DIR {
            warn!(
                "fs: cannot add hardlink, max # of links in dir {} reached",
                self.inode.id()
            );
            return Err(FsError::CapacityExceeded);
        }
        target.increment_link_counter().map_err(|e| {
            warn!(
                "fs: cannot add hardlink, max # of links to INode {} reached",
                target.id()
            );
            e
        })?;

        let mut changed = vec![target.id()];
        let mut pending = Hardlink::new(name, target.id());

        if self.inode.is_inlined() {
            match self.inode.add_link(pending) {
                Ok(()) => {
                    add_unique(&mut changed, vec![self.inode.id()]);
                    self.child_count += 1;
                    return Ok(changed);
                }
                Err(rejected) => {
                    // inline table full: convert, then place externally
                    pending = rejected;
                    let mut list = match alloc.alloc_entry_list() {
                        Ok(list) => list,
                        Err(e) => {
                            target.decrement_link_counter();
                            return Err(e);
                        }
                    };
                    self.inode.convert_to_non_inline(&mut list)?;
                    add_unique(&mut changed, vec![self.inode.id(), list.id()]);
                    self.entry_lists.push(list);
                }
            }
        }

        for list in &mut self.entry_lists {
            match list.add_link(pending) {
                Ok(()) => {
                    add_unique(&mut changed, vec![list.id()]);
                    self.child_count += 1;
                    return Ok(changed);
                }
                Err(rejected) => pending = rejected,
            }
        }

        // every list full: allocate one more
        let mut list = match alloc.alloc_entry_list() {
            Ok(list) => list,
            Err(e) => {
                target.decrement_link_counter();
                return Err(e);
            }
        };
        if let Err(e) = self.inode.add_entry_list(list.id()) {
            target.decrement_link_counter();
            alloc.dealloc_block(list.id());
            return Err(e);
        }
        list.add_link(pending)
            .map_err(|_| FsError::Corruption("fresh entry list full"))?;
        add_unique(&mut changed, vec![self.inode.id(), list.id()]);
        self.entry_lists.push(list);
        self.child_count += 1;
        Ok(changed)
    }

    /// Unlinks `name` (which must point at `target`), decrementing the
    /// target's link counter. An entry list drained by the removal is
    /// deallocated and unlinked from the INode; the directory never
    /// converts back to inline. Returns changed block ids.
    pub fn rm_hardlink<A: EntryListAllocator>(
        &mut self,
        target: &mut Inode,
        name: &str,
        alloc: &mut A,
    ) -> Result<Vec<u32>> {
        if name.is_empty() || name.contains('/') {
            warn!("fs: cannot remove hardlink {:?}, not a valid link name", name);
            return Err(FsError::InvalidArgument);
        }
        if self.search_hardlink(name) == 0 {
            return Err(FsError::NotFound);
        }
        target.decrement_link_counter();
        let mut changed = vec![target.id()];

        if self.inode.is_inlined() {
            self.inode.remove_link(name);
            add_unique(&mut changed, vec![self.inode.id()]);
        } else if let Some(index) = self
            .entry_lists
            .iter_mut()
            .position(|list| list.remove_link(name).is_some())
        {
            if self.entry_lists[index].is_empty() {
                let list_id = self.entry_lists[index].id();
                alloc.dealloc_block(list_id);
                self.inode.remove_entry_list(list_id);
                self.entry_lists.remove(index);
                add_unique(&mut changed, vec![self.inode.id()]);
            } else {
                add_unique(&mut changed, vec![self.entry_lists[index].id()]);
            }
        }

        self.child_count -= 1;
        Ok(changed)
    }

    /// Persists every block of this directory whose id appears in `ids`.
    /// Foreign ids (the link target, blocks of other directories) are
    /// ignored; their owners persist them.
    pub fn save_changed<D: BlockDevice>(
        &mut self,
        core: &mut FsCore<D>,
        ids: &[u32],
    ) -> Result<()> {
        for &id in ids {
            if id == self.inode.id() {
                core.save_block(&mut self.inode)?;
            } else if let Some(list) = self.entry_lists.iter_mut().find(|l| l.id() == id) {
                core.save_block(list)?;
            }
        }
        Ok(())
    }

    /// All link names, dotfiles included, in insertion order.
    pub fn ls(&self) -> Vec<String> {
        let mut result = Vec::new();
        if self.inode.is_inlined() {
            self.inode.ls_inline(&mut result);
        } else {
            for list in &self.entry_lists {
                list.ls(&mut result);
            }
        }
        result
    }
}
