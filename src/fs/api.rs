//! The public operations of the file system.
//!
//! Every mutating operation validates its arguments and checks its
//! worst-case free-block budget before the first block write; once writes
//! begin they run to completion, so the on-disk invariants hold whether an
//! operation succeeds or is rejected.

use std::collections::HashMap;

use log::warn;

use crate::device::BlockDevice;
use crate::error::{FsError, Result};
use crate::fs::core::FsCore;
use crate::fs::data_block::DataBlock;
use crate::fs::dir_inode::DirectoryInode;
use crate::fs::directory::{add_unique, Directory};
use crate::fs::file::File;
use crate::fs::file_inode::FileInode;
use crate::fs::inode::{Inode, InodeKind};
use crate::fs::{
    MAX_BYTES_PER_DATABLOCK, MAX_BYTES_PER_INODE, MAX_DATABLOCKS_PER_FILE, MAX_FILE_SIZE,
    MAX_HARDLINKS_PER_DIR, MAX_NUMBER_OF_LINKS_TO_INODE, ROOT_BLOCK_ID,
};
use crate::path;
use crate::time::Clock;

const LS_HEADER: &str = "t #links size disksize t_created t_mod name";

/// The directory or file an operation moves around.
enum Entity {
    Dir(Directory),
    File(File),
}

impl Entity {
    fn inode_mut(&mut self) -> &mut Inode {
        match self {
            Entity::Dir(dir) => dir.primary_mut().inode_mut(),
            Entity::File(file) => file.primary_mut().inode_mut(),
        }
    }

    fn save_changed<D: BlockDevice>(&mut self, core: &mut FsCore<D>, ids: &[u32]) -> Result<()> {
        match self {
            Entity::Dir(dir) => dir.save_changed(core, ids),
            Entity::File(file) => file.save_changed(core, ids),
        }
    }
}

fn ls_line(kind: char, inode: &Inode, user_visible_size: u32, name: &str) -> String {
    format!(
        "{} {} {} {} {} {} {}",
        kind,
        inode.link_counter(),
        inode.internal_size(),
        user_visible_size,
        inode.creation_time(),
        inode.last_write_time(),
        name
    )
}

/// A mounted file system.
///
/// All methods must be called from one thread; consistency across mounts
/// is guaranteed when [`Fs::umount`] finishes the session. A mount that is
/// simply dropped leaves the image recoverable through the full-log scan
/// on the next mount, at the price of losing unflushed file contents.
pub struct Fs<D> {
    core: FsCore<D>,
    /// One [`File`] per open id; a file can only be opened once.
    open_files: HashMap<u32, File>,
}

impl<D: BlockDevice> Fs<D> {
    pub fn mount(dev: D) -> Result<Self> {
        Self::mount_with_clock(dev, Clock::System)
    }

    pub fn mount_with_clock(dev: D, clock: Clock) -> Result<Self> {
        Ok(Self {
            core: FsCore::mount(dev, clock)?,
            open_files: HashMap::new(),
        })
    }

    /// Finalizes the bmap on disk and hands the device back. Open files
    /// are not flushed; close them first.
    pub fn umount(self) -> Result<D> {
        let mut core = self.core;
        core.unmount()?;
        Ok(core.into_device())
    }

    /// Abandons the mount without finalizing the bmap, as a crash would.
    /// The next mount runs recovery.
    pub fn into_device(self) -> D {
        self.core.into_device()
    }

    pub fn used_blocks(&self) -> u32 {
        self.core.used_blocks()
    }

    pub fn total_blocks(&self) -> u32 {
        self.core.log_size()
    }

    /// Creates a new directory. Requires up to 4 free blocks (new dir,
    /// updated parent, and a rare inline-to-external switch of the
    /// parent).
    pub fn mkdir(&mut self, absolute_path: &str) -> Result<()> {
        let absolute_path = path::normalize(absolute_path);
        if !absolute_path.starts_with('/') {
            warn!("fs: mkdir: path {:?} is not absolute", absolute_path);
            return Err(FsError::InvalidArgument);
        }
        if !self.core.has_free_blocks(4) {
            warn!("fs: mkdir: cannot create new directory, fs is full");
            return Err(FsError::OutOfSpace);
        }
        let mut parent = self.core.search_parent(&absolute_path)?;
        let name = path::last_name(&absolute_path);
        if !path::is_valid_name(name) {
            warn!("fs: mkdir: {:?} is not a valid name", name);
            return Err(FsError::InvalidArgument);
        }
        if parent.search_hardlink(name) != 0 {
            warn!("fs: mkdir: {:?} exists", absolute_path);
            return Err(FsError::AlreadyExists);
        }
        if parent.child_count() == MAX_HARDLINKS_PER_DIR {
            warn!(
                "fs: mkdir: max # of links in parent dir {} reached",
                parent.primary().id()
            );
            return Err(FsError::CapacityExceeded);
        }
        if parent.primary().inode().link_counter() == MAX_NUMBER_OF_LINKS_TO_INODE {
            warn!(
                "fs: mkdir: max # of links to parent dir {} reached",
                parent.primary().id()
            );
            return Err(FsError::CapacityExceeded);
        }

        let new_id = self.core.get_next_block_id()?;
        let now = self.core.now();
        let (mut new_dir, mut changed) = Directory::create(
            DirectoryInode::new(new_id, now),
            parent.primary_mut().inode_mut(),
        )?;
        add_unique(
            &mut changed,
            parent.add_hardlink(new_dir.primary_mut().inode_mut(), name, &mut self.core)?,
        );
        new_dir.save_changed(&mut self.core, &changed)?;
        parent.save_changed(&mut self.core, &changed)?;
        Ok(())
    }

    /// Removes an empty directory. Requires up to 2 free blocks for the
    /// rewritten parent and child blocks; refuses the root.
    pub fn rmdir(&mut self, absolute_path: &str) -> Result<()> {
        let absolute_path = path::normalize(absolute_path);
        if !absolute_path.starts_with('/') {
            warn!("fs: rmdir: path {:?} is not absolute", absolute_path);
            return Err(FsError::InvalidArgument);
        }
        if !self.core.has_free_blocks(2) {
            warn!("fs: rmdir: fs is full (2 blocks buffer required)");
            return Err(FsError::OutOfSpace);
        }
        let mut parent = self.core.search_parent(&absolute_path)?;
        let name = path::last_name(&absolute_path);
        let id = parent.search_hardlink(name);
        if id == 0 {
            warn!("fs: rmdir: {:?} does not exist", absolute_path);
            return Err(FsError::NotFound);
        }
        if id == ROOT_BLOCK_ID {
            warn!("fs: rmdir: cannot remove the root directory");
            return Err(FsError::InvalidArgument);
        }
        if self.core.peek_inode_kind(id)? != Some(InodeKind::Directory) {
            warn!("fs: rmdir: {:?} is not a directory", absolute_path);
            return Err(FsError::WrongType);
        }
        let mut dir = self.core.load_directory(id)?;
        // "." and ".." are always present
        if dir.child_count() > 2 {
            warn!("fs: rmdir: {:?} is not empty", absolute_path);
            return Err(FsError::InvalidArgument);
        }

        let mut changed =
            parent.rm_hardlink(dir.primary_mut().inode_mut(), name, &mut self.core)?;
        // removing ".." pays back the parent's link counter
        add_unique(
            &mut changed,
            dir.rm_hardlink(parent.primary_mut().inode_mut(), "..", &mut self.core)?,
        );
        parent.save_changed(&mut self.core, &changed)?;
        dir.save_changed(&mut self.core, &changed)?;

        // directory hardlinks beyond "." and ".." do not exist, so the
        // removed name was the only way in and the blocks can go
        for list_id in dir.entry_list_ids() {
            self.core.free_block(list_id);
        }
        self.core.free_block(dir.primary().id());
        Ok(())
    }

    /// Moves a hardlink, possibly across directories. Requires up to 5
    /// free blocks (2 for the removal, 3 for the insertion).
    pub fn rename(&mut self, source_path: &str, dest_path: &str) -> Result<()> {
        let source_path = path::normalize(source_path);
        let dest_path = path::normalize(dest_path);
        if !source_path.starts_with('/') || !dest_path.starts_with('/') {
            warn!(
                "fs: rename: both paths must be absolute ({:?} -> {:?})",
                source_path, dest_path
            );
            return Err(FsError::InvalidArgument);
        }
        if !self.core.has_free_blocks(5) {
            warn!("fs: rename: fs is full (5 blocks buffer required)");
            return Err(FsError::OutOfSpace);
        }
        // the new path must not sit below the old one
        if dest_path.len() > source_path.len()
            && dest_path.starts_with(source_path.as_str())
            && (source_path == "/" || dest_path.as_bytes()[source_path.len()] == b'/')
        {
            warn!("fs: rename: new path cannot be a child of the old path");
            return Err(FsError::InvalidArgument);
        }

        let mut old_parent = self.core.search_parent(&source_path)?;
        let source_name = path::last_name(&source_path);
        let target_id = old_parent.search_hardlink(source_name);
        if target_id == 0 {
            warn!("fs: rename: source {:?} does not exist", source_path);
            return Err(FsError::NotFound);
        }
        let mut new_parent = self.core.search_parent(&dest_path)?;
        let dest_name = path::last_name(&dest_path);
        if !path::is_valid_name(dest_name) {
            warn!("fs: rename: {:?} is not a valid name", dest_name);
            return Err(FsError::InvalidArgument);
        }
        if new_parent.search_hardlink(dest_name) != 0 {
            warn!("fs: rename: target {:?} exists", dest_path);
            return Err(FsError::AlreadyExists);
        }

        let is_directory = match self.core.peek_inode_kind(target_id)? {
            Some(InodeKind::Directory) => true,
            Some(InodeKind::RegularFile) => false,
            _ => {
                warn!("fs: rename: cannot move target with unknown INode type");
                return Err(FsError::Corruption("unknown inode type"));
            }
        };
        let mut entity = if is_directory {
            Entity::Dir(self.core.load_directory(target_id)?)
        } else {
            Entity::File(self.core.load_file(target_id)?)
        };

        if old_parent.primary().id() == new_parent.primary().id() {
            // same directory; from here on only old_parent is touched so
            // the two in-memory copies cannot diverge
            drop(new_parent);
            let mut changed =
                old_parent.rm_hardlink(entity.inode_mut(), source_name, &mut self.core)?;
            add_unique(
                &mut changed,
                old_parent.add_hardlink(entity.inode_mut(), dest_name, &mut self.core)?,
            );
            entity.save_changed(&mut self.core, &changed)?;
            old_parent.save_changed(&mut self.core, &changed)?;
        } else {
            if new_parent.child_count() == MAX_HARDLINKS_PER_DIR {
                warn!("fs: rename: max # of links in new parent dir reached");
                return Err(FsError::CapacityExceeded);
            }
            if new_parent.primary().inode().link_counter() == MAX_NUMBER_OF_LINKS_TO_INODE {
                warn!("fs: rename: max # of links to new parent dir reached");
                return Err(FsError::CapacityExceeded);
            }
            let mut changed =
                old_parent.rm_hardlink(entity.inode_mut(), source_name, &mut self.core)?;
            add_unique(
                &mut changed,
                new_parent.add_hardlink(entity.inode_mut(), dest_name, &mut self.core)?,
            );
            if let Entity::Dir(dir) = &mut entity {
                // a moved directory points its ".." at the new parent
                add_unique(
                    &mut changed,
                    dir.rm_hardlink(old_parent.primary_mut().inode_mut(), "..", &mut self.core)?,
                );
                add_unique(
                    &mut changed,
                    dir.add_hardlink(new_parent.primary_mut().inode_mut(), "..", &mut self.core)?,
                );
            }
            entity.save_changed(&mut self.core, &changed)?;
            old_parent.save_changed(&mut self.core, &changed)?;
            new_parent.save_changed(&mut self.core, &changed)?;
        }
        Ok(())
    }

    /// Creates an empty regular file. Requires up to 4 free blocks, like
    /// mkdir.
    pub fn touch(&mut self, absolute_path: &str) -> Result<()> {
        let absolute_path = path::normalize(absolute_path);
        if !absolute_path.starts_with('/') {
            warn!("fs: touch: path {:?} is not absolute", absolute_path);
            return Err(FsError::InvalidArgument);
        }
        if !self.core.has_free_blocks(4) {
            warn!("fs: touch: cannot create new file, fs is full");
            return Err(FsError::OutOfSpace);
        }
        let mut parent = self.core.search_parent(&absolute_path)?;
        let name = path::last_name(&absolute_path);
        if !path::is_valid_name(name) {
            warn!("fs: touch: {:?} is not a valid name", name);
            return Err(FsError::InvalidArgument);
        }
        if parent.search_hardlink(name) != 0 {
            warn!("fs: touch: {:?} exists", absolute_path);
            return Err(FsError::AlreadyExists);
        }
        if parent.child_count() == MAX_HARDLINKS_PER_DIR {
            warn!(
                "fs: touch: max # of links in parent dir {} reached",
                parent.primary().id()
            );
            return Err(FsError::CapacityExceeded);
        }

        let new_id = self.core.get_next_block_id()?;
        let now = self.core.now();
        let mut file = File::new(FileInode::new(new_id, now));
        let changed =
            parent.add_hardlink(file.primary_mut().inode_mut(), name, &mut self.core)?;
        file.save_changed(&mut self.core, &changed)?;
        parent.save_changed(&mut self.core, &changed)?;
        Ok(())
    }

    /// Lists a directory, dotfiles included. The first line is a column
    /// header, present iff at least one entry follows.
    pub fn ls(&mut self, absolute_path: &str) -> Result<Vec<String>> {
        let absolute_path = path::normalize(absolute_path);
        if !absolute_path.starts_with('/') {
            warn!("fs: ls: path {:?} is not absolute", absolute_path);
            return Err(FsError::InvalidArgument);
        }
        let parent = self.core.search_parent(&absolute_path)?;
        let id = if absolute_path == "/" {
            // the root is its own parent
            ROOT_BLOCK_ID
        } else {
            let name = path::last_name(&absolute_path);
            let id = parent.search_hardlink(name);
            if id == 0 {
                warn!("fs: ls: {:?} does not exist", absolute_path);
                return Err(FsError::NotFound);
            }
            if self.core.peek_inode_kind(id)? != Some(InodeKind::Directory) {
                warn!("fs: ls: {:?} is not a directory", absolute_path);
                return Err(FsError::WrongType);
            }
            id
        };
        let dir = self.core.load_directory(id)?;
        let names = dir.ls();
        let mut result = Vec::with_capacity(names.len() + 1);
        if !names.is_empty() {
            result.push(LS_HEADER.to_owned());
        }
        for name in &names {
            let child_id = dir.search_hardlink(name);
            match self.core.peek_inode_kind(child_id) {
                Ok(Some(InodeKind::Directory)) => {
                    let inode = self.core.load_directory_inode(child_id)?;
                    result.push(ls_line('d', inode.inode(), inode.user_visible_size(), name));
                }
                Ok(Some(InodeKind::RegularFile)) => {
                    let inode = self.core.load_file_inode(child_id)?;
                    result.push(ls_line('f', inode.inode(), inode.user_visible_size(), name));
                }
                Ok(_) | Err(FsError::NotFound) => {
                    warn!("fs: ls: cannot list child {:?} with unknown INode type", name);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(result)
    }

    /// Removes a hardlink to a file; the file itself is deleted once no
    /// hardlink points at it anymore. Requires up to 2 free blocks for the
    /// rewritten parent.
    pub fn rm(&mut self, absolute_path: &str) -> Result<()> {
        let absolute_path = path::normalize(absolute_path);
        if !absolute_path.starts_with('/') {
            warn!("fs: rm: path {:?} is not absolute", absolute_path);
            return Err(FsError::InvalidArgument);
        }
        if !self.core.has_free_blocks(2) {
            warn!("fs: rm: fs is full (2 blocks buffer required)");
            return Err(FsError::OutOfSpace);
        }
        let mut parent = self.core.search_parent(&absolute_path)?;
        let name = path::last_name(&absolute_path);
        let id = parent.search_hardlink(name);
        if id == 0 {
            warn!("fs: rm: {:?} does not exist", absolute_path);
            return Err(FsError::NotFound);
        }
        if self.core.peek_inode_kind(id)? != Some(InodeKind::RegularFile) {
            warn!("fs: rm: {:?} is not a file", absolute_path);
            return Err(FsError::WrongType);
        }
        let mut file = self.core.load_file(id)?;

        let changed = parent.rm_hardlink(file.primary_mut().inode_mut(), name, &mut self.core)?;
        file.save_changed(&mut self.core, &changed)?;
        parent.save_changed(&mut self.core, &changed)?;

        if file.primary().inode().link_counter() == 0 {
            for block_id in file.blocks() {
                self.core.free_block(block_id);
            }
        }
        Ok(())
    }

    /// Creates a new hardlink `source_path` to the existing file at
    /// `target_path`. Requires up to 3 free blocks, all in the link's
    /// parent.
    pub fn link(&mut self, source_path: &str, target_path: &str) -> Result<()> {
        let source_path = path::normalize(source_path);
        let target_path = path::normalize(target_path);
        if !source_path.starts_with('/') || !target_path.starts_with('/') {
            warn!(
                "fs: link: both paths must be absolute ({:?} -> {:?})",
                source_path, target_path
            );
            return Err(FsError::InvalidArgument);
        }
        if !self.core.has_free_blocks(3) {
            warn!("fs: link: fs is full (3 blocks buffer required)");
            return Err(FsError::OutOfSpace);
        }
        let mut parent = self.core.search_parent(&source_path)?;
        let link_name = path::last_name(&source_path);
        if !path::is_valid_name(link_name) {
            warn!("fs: link: {:?} is not a valid name", link_name);
            return Err(FsError::InvalidArgument);
        }
        if parent.search_hardlink(link_name) != 0 {
            warn!("fs: link: {:?} exists", source_path);
            return Err(FsError::AlreadyExists);
        }
        if parent.child_count() == MAX_HARDLINKS_PER_DIR {
            warn!(
                "fs: link: max # of links in parent dir {} reached",
                parent.primary().id()
            );
            return Err(FsError::CapacityExceeded);
        }
        self.core.search_parent(&target_path)?;
        let target_id = parent.search_hardlink(path::last_name(&target_path));
        if target_id == 0 {
            warn!("fs: link: target {:?} does not exist", target_path);
            return Err(FsError::NotFound);
        }
        if self.core.peek_inode_kind(target_id)? != Some(InodeKind::RegularFile) {
            warn!("fs: link: target {:?} is not a file", target_path);
            return Err(FsError::WrongType);
        }
        let mut file = self.core.load_file(target_id)?;
        if file.primary().inode().link_counter() == MAX_NUMBER_OF_LINKS_TO_INODE {
            warn!("fs: link: max # of links to target {:?} reached", target_path);
            return Err(FsError::CapacityExceeded);
        }
        let changed =
            parent.add_hardlink(file.primary_mut().inode_mut(), link_name, &mut self.core)?;
        file.save_changed(&mut self.core, &changed)?;
        parent.save_changed(&mut self.core, &changed)?;
        Ok(())
    }

    /// Size of the file in bytes. Returns 0 both for an empty file and on
    /// any failure; open the file to tell the two apart.
    pub fn file_size(&mut self, absolute_path: &str) -> u32 {
        match self.file_size_inner(absolute_path) {
            Ok(size) => size,
            Err(e) => {
                warn!("fs: fileSize: cannot stat {:?}: {}", absolute_path, e);
                0
            }
        }
    }

    fn file_size_inner(&mut self, absolute_path: &str) -> Result<u32> {
        let absolute_path = path::normalize(absolute_path);
        if !absolute_path.starts_with('/') {
            return Err(FsError::InvalidArgument);
        }
        let parent = self.core.search_parent(&absolute_path)?;
        let id = parent.search_hardlink(path::last_name(&absolute_path));
        if id == 0 {
            return Err(FsError::NotFound);
        }
        if self.core.peek_inode_kind(id)? != Some(InodeKind::RegularFile) {
            return Err(FsError::WrongType);
        }
        Ok(self.core.load_file_inode(id)?.internal_size())
    }

    /// Opens a file; the returned handle is the file's INode id, so zero
    /// never denotes an open file. A file can only be opened once.
    pub fn open_file(&mut self, absolute_path: &str) -> Result<u32> {
        let absolute_path = path::normalize(absolute_path);
        if !absolute_path.starts_with('/') {
            warn!("fs: openFile: path {:?} is not absolute", absolute_path);
            return Err(FsError::InvalidArgument);
        }
        let parent = self.core.search_parent(&absolute_path)?;
        let id = parent.search_hardlink(path::last_name(&absolute_path));
        if id == 0 {
            warn!("fs: openFile: {:?} does not exist", absolute_path);
            return Err(FsError::NotFound);
        }
        if self.core.peek_inode_kind(id)? != Some(InodeKind::RegularFile) {
            warn!("fs: openFile: {:?} is not a file", absolute_path);
            return Err(FsError::WrongType);
        }
        if self.open_files.contains_key(&id) {
            warn!("fs: openFile: {:?} is already open", absolute_path);
            return Err(FsError::AlreadyExists);
        }
        let file = self.core.load_file(id)?;
        self.open_files.insert(id, file);
        Ok(id)
    }

    /// Flushes and forgets the handle; unknown handles are ignored.
    pub fn close_file(&mut self, handle: u32) -> Result<()> {
        self.flush_file(handle)?;
        self.open_files.remove(&handle);
        Ok(())
    }

    /// Persists the file's metadata and its dirty cached DataBlock, then
    /// syncs the device. Unknown handles are ignored.
    pub fn flush_file(&mut self, handle: u32) -> Result<()> {
        if let Some(file) = self.open_files.get_mut(&handle) {
            self.core.save_block(file.primary_mut())?;
            if file.cached_data_block_is_dirty() {
                if let Some(mut block) = file.release_cached_data_block() {
                    self.core.save_block(&mut block)?;
                }
            }
            self.core.sync()?;
        }
        Ok(())
    }

    /// Reads `target.len()` bytes starting at `pos`. The whole range must
    /// lie inside the file.
    pub fn read(&mut self, handle: u32, target: &mut [u8], pos: u32) -> Result<()> {
        if target.is_empty() {
            warn!("fs: read failed, must read at least 1 byte");
            return Err(FsError::InvalidArgument);
        }
        let file = self.open_files.get_mut(&handle).ok_or_else(|| {
            warn!("fs: read failed, unknown handle {}", handle);
            FsError::NotFound
        })?;
        let size = file.primary().internal_size();
        let end = pos as u64 + target.len() as u64;
        if pos as u64 >= size as u64 || end > size as u64 {
            warn!(
                "fs: read failed, invalid byte range (from {}, n {}, fileSize {})",
                pos,
                target.len(),
                size
            );
            return Err(FsError::InvalidArgument);
        }
        if file.is_inlined() {
            return file.primary().read_inline(target, pos);
        }

        let end = end as u32;
        let mut current = pos;
        let mut copied = 0usize;
        while current < end {
            let block_no = current / MAX_BYTES_PER_DATABLOCK;
            let block_start = current - block_no * MAX_BYTES_PER_DATABLOCK;
            let block_bytes = (MAX_BYTES_PER_DATABLOCK - block_start).min(end - current) as usize;
            let block_id = file.data_block_id(block_no);
            if block_id == 0 {
                return Err(FsError::Corruption("missing data block"));
            }
            if file.cached_data_block_id() != block_id {
                if file.cached_data_block_is_dirty() {
                    if let Some(mut dirty) = file.release_cached_data_block() {
                        self.core.save_block(&mut dirty)?;
                    }
                }
                file.set_cached_data_block(self.core.load_data_block(block_id)?);
            }
            file.read_from_cached_data_block(
                &mut target[copied..copied + block_bytes],
                block_start,
            )?;
            current += block_bytes as u32;
            copied += block_bytes;
        }
        Ok(())
    }

    /// Writes `source` at `pos`, which must lie inside the file or at its
    /// end (append); the file grows as needed and never shrinks here.
    pub fn write(&mut self, handle: u32, source: &[u8], pos: u32) -> Result<()> {
        if source.is_empty() {
            warn!("fs: write failed, must write at least 1 byte");
            return Err(FsError::InvalidArgument);
        }
        let file = self.open_files.get_mut(&handle).ok_or_else(|| {
            warn!("fs: write failed, unknown handle {}", handle);
            FsError::NotFound
        })?;
        let size = file.primary().internal_size();
        if pos > size {
            warn!("fs: write failed, start position {} beyond file size {}", pos, size);
            return Err(FsError::InvalidArgument);
        }
        let end = pos as u64 + source.len() as u64;
        if end >= MAX_FILE_SIZE as u64 {
            warn!("fs: write failed, max file size exceeded");
            return Err(FsError::CapacityExceeded);
        }
        let end = end as u32;

        if file.is_inlined() && end <= MAX_BYTES_PER_INODE {
            file.primary_mut().write_inline(source, pos)?;
            file.primary_mut().set_internal_size(size.max(end))?;
            return Ok(());
        }
        if file.is_inlined() {
            // switching needs a new DataBlockList, a new DataBlock and the
            // rewritten INode
            if !self.core.has_free_blocks(3) {
                warn!(
                    "fs: write: fs too full for non-inline switch of file {}",
                    file.primary().id()
                );
                return Err(FsError::OutOfSpace);
            }
            let block = DataBlock::new(self.core.get_next_block_id()?);
            let changed = file.convert_to_non_inline(block, &mut self.core)?;
            file.save_changed(&mut self.core, &changed)?;
        }

        let mut changed_meta: Vec<u32> = Vec::new();
        let mut current = pos;
        let mut copied = 0usize;
        while current < end {
            let block_no = current / MAX_BYTES_PER_DATABLOCK;
            if file.number_of_data_blocks() == block_no {
                add_unique(&mut changed_meta, Self::add_data_block(&mut self.core, file)?);
            } else if file.data_block_id(block_no) != file.cached_data_block_id() {
                if file.cached_data_block_is_dirty() {
                    if let Some(mut dirty) = file.release_cached_data_block() {
                        self.core.save_block(&mut dirty)?;
                    }
                }
                let block_id = file.data_block_id(block_no);
                file.set_cached_data_block(self.core.load_data_block(block_id)?);
            }
            let block_start = current - block_no * MAX_BYTES_PER_DATABLOCK;
            let block_bytes = (MAX_BYTES_PER_DATABLOCK - block_start).min(end - current) as usize;
            file.write_to_cached_data_block(&source[copied..copied + block_bytes], block_start)?;
            current += block_bytes as u32;
            copied += block_bytes;
        }

        file.primary_mut().set_internal_size(size.max(end))?;
        // the cached DataBlock stays in memory; it is persisted when
        // displaced or on flush/close
        file.save_changed(&mut self.core, &changed_meta)?;
        Ok(())
    }

    /// Shrinks the file to `new_size`, which must be smaller than the
    /// current size. An external file always keeps its last DataBlock, so
    /// it cannot be truncated to zero.
    pub fn truncate(&mut self, handle: u32, new_size: u32) -> Result<()> {
        let file = self.open_files.get_mut(&handle).ok_or_else(|| {
            warn!("fs: truncate failed, unknown handle {}", handle);
            FsError::NotFound
        })?;
        let size = file.primary().internal_size();
        if new_size >= size {
            warn!(
                "fs: truncate failed, new size ({}) must be smaller than old size ({})",
                new_size, size
            );
            return Err(FsError::InvalidArgument);
        }
        if !file.is_inlined() {
            let old_count = size.div_ceil(MAX_BYTES_PER_DATABLOCK);
            let new_count = new_size.div_ceil(MAX_BYTES_PER_DATABLOCK);
            if old_count > new_count {
                if file.cached_data_block_is_dirty() {
                    if let Some(mut block) = file.release_cached_data_block() {
                        self.core.save_block(&mut block)?;
                    }
                }
                Self::remove_data_blocks(&mut self.core, file, old_count - new_count)?;
            }
        }
        file.primary_mut().set_internal_size(new_size)?;
        self.core.save_block(file.primary_mut())?;
        Ok(())
    }

    /// Appends a fresh DataBlock to the file and makes it the cached
    /// block, saving the displaced cache first. Needs 3 free blocks in the
    /// worst case (INode, new list, new block).
    fn add_data_block(core: &mut FsCore<D>, file: &mut File) -> Result<Vec<u32>> {
        if !core.has_free_blocks(3) {
            warn!(
                "fs: write: fs too full to add a data block to file {}",
                file.primary().id()
            );
            return Err(FsError::OutOfSpace);
        }
        if file.number_of_data_blocks() == MAX_DATABLOCKS_PER_FILE {
            warn!("fs: write: max size of file {} reached", file.primary().id());
            return Err(FsError::CapacityExceeded);
        }
        if file.cached_data_block_is_dirty() {
            if let Some(mut block) = file.release_cached_data_block() {
                core.save_block(&mut block)?;
            }
        }
        let block = DataBlock::new(core.get_next_block_id()?);
        file.add_data_block(block, core)
    }

    /// Removes the last `n` DataBlocks of the file; `n` must leave at
    /// least one block. Needs 1 free block for the rewritten metadata.
    fn remove_data_blocks(core: &mut FsCore<D>, file: &mut File, n: u32) -> Result<()> {
        if !core.has_free_blocks(1) {
            warn!(
                "fs: cannot remove DataBlocks, 1 free block required, file {}",
                file.primary().id()
            );
            return Err(FsError::OutOfSpace);
        }
        if n >= file.number_of_data_blocks() {
            warn!(
                "fs: invalid number of data blocks to remove, requested {}, present {}",
                n,
                file.number_of_data_blocks()
            );
            return Err(FsError::InvalidArgument);
        }
        let mut changed = Vec::new();
        for _ in 0..n {
            add_unique(&mut changed, file.remove_data_block(core)?);
        }
        file.save_changed(core, &changed)
    }
}
