//! Mechanics of the mounted file system: the device handle, the in-memory
//! bmap, the log writer with its lazy garbage collector, the block-id
//! allocator, recovery, and the loaders for every block type.

use std::io::{Read, Seek, SeekFrom, Write};

use bitvec::prelude::*;
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, error, info, warn};

use crate::device::BlockDevice;
use crate::error::{FsError, Result};
use crate::fs::block::{BlockAllocator, DiskBlock};
use crate::fs::block_list::DataBlockList;
use crate::fs::data_block::DataBlock;
use crate::fs::dir_inode::DirectoryInode;
use crate::fs::directory::{Directory, EntryListAllocator};
use crate::fs::entry_list::DirectoryEntryList;
use crate::fs::file::{BlockListAllocator, File};
use crate::fs::file_inode::FileInode;
use crate::fs::header::{self, Header};
use crate::fs::inode::InodeKind;
use crate::fs::layout::Layout;
use crate::fs::ROOT_BLOCK_ID;
use crate::path;
use crate::time::Clock;

/// Device, bmap and header state of one mount.
///
/// Separated from the operation layer so that Directory and File
/// aggregates (and the open-file table) can borrow it as their block
/// allocator while they are being mutated.
pub struct FsCore<D> {
    dev: D,
    layout: Layout,
    size_b: u64,
    /// Log slot the next block image goes to (1-based).
    write_ptr: u32,
    /// Search hint for the id allocator.
    next_block_id: u32,
    used_blocks: u32,
    /// Block id - 1 → current log slot, zero when not present.
    bmap: Vec<u32>,
    clock: Clock,
}

impl<D: BlockDevice> FsCore<D> {
    /// Reads the header, loads or reconstructs the bmap, and marks the
    /// mount in-flight on disk.
    pub fn mount(mut dev: D, mut clock: Clock) -> Result<Self> {
        info!("fs: accessing block device...");
        let hdr = Header::read_from(&mut dev)?;
        let layout = Layout::for_size(hdr.size_b);
        if hdr.used_blocks > layout.log_size || hdr.write_ptr > layout.log_size {
            error!("fs: invalid header (step 2)");
            return Err(FsError::Corruption("header out of bounds"));
        }
        if hdr.bmap_valid {
            // restore the persisted counter on hosts without a clock
            clock.restore(header::read_field(
                &mut dev,
                header::LAST_UMOUNT_TIME_OFFSET,
            )?);
        }
        let mut core = Self {
            dev,
            layout,
            size_b: hdr.size_b,
            write_ptr: hdr.write_ptr,
            next_block_id: hdr.next_block_id,
            used_blocks: hdr.used_blocks,
            bmap: vec![0u32; (layout.bmap_size / 4) as usize],
            clock,
        };
        if hdr.bmap_valid {
            core.load_bmap()?;
        } else {
            info!("fs: detected invalid previous unmount, reconstructing bmap...");
            core.reconstruct_bmap()?;
        }
        // mark bmap dirty (fs mounted)
        header::write_field(&mut core.dev, header::BMAP_VALID_OFFSET, 0)?;
        core.dev.flush()?;
        info!(
            "fs: {}B total, {} of {} blocks in use",
            core.size_b, core.used_blocks, core.layout.log_size
        );
        Ok(core)
    }

    /// Persists bmap and header fields and marks the unmount complete.
    pub fn unmount(&mut self) -> Result<()> {
        self.save_bmap()?;
        header::write_field(&mut self.dev, header::WRITE_PTR_OFFSET, self.write_ptr)?;
        header::write_field(
            &mut self.dev,
            header::NEXT_BLOCK_ID_OFFSET,
            self.next_block_id,
        )?;
        header::write_field(&mut self.dev, header::USED_BLOCKS_OFFSET, self.used_blocks)?;
        let now = self.clock.now();
        header::write_field(&mut self.dev, header::LAST_UMOUNT_TIME_OFFSET, now)?;
        header::write_field(&mut self.dev, header::BMAP_VALID_OFFSET, 1)?;
        self.dev.flush()?;
        self.dev.sync()?;
        info!("fs: unmount ok");
        Ok(())
    }

    pub fn into_device(self) -> D {
        self.dev
    }

    pub fn used_blocks(&self) -> u32 {
        self.used_blocks
    }

    pub fn log_size(&self) -> u32 {
        self.layout.log_size
    }

    /// True when the log can still absorb `n` more blocks. Mutating
    /// operations check their worst-case budget with this before touching
    /// anything.
    pub fn has_free_blocks(&self, n: u32) -> bool {
        self.used_blocks + n <= self.layout.log_size
    }

    pub(crate) fn now(&mut self) -> u32 {
        self.clock.now()
    }

    pub fn sync(&mut self) -> Result<()> {
        self.dev.flush()?;
        self.dev.sync()?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn live_bmap_entries(&self) -> u32 {
        self.bmap.iter().filter(|&&slot| slot != 0).count() as u32
    }

    fn load_bmap(&mut self) -> Result<()> {
        self.dev.seek(SeekFrom::Start(self.layout.bmap_start))?;
        let mut raw = vec![0u8; self.layout.bmap_size as usize];
        self.dev.read_exact(&mut raw)?;
        LittleEndian::read_u32_into(&raw, &mut self.bmap);
        Ok(())
    }

    fn save_bmap(&mut self) -> Result<()> {
        let mut raw = vec![0u8; self.layout.bmap_size as usize];
        LittleEndian::write_u32_into(&self.bmap, &mut raw);
        self.dev.seek(SeekFrom::Start(self.layout.bmap_start))?;
        self.dev.write_all(&raw)?;
        Ok(())
    }

    /// Latest log slot of a block; zero if unknown or invalid.
    fn lookup_block_address(&self, id: u32) -> u32 {
        if id == 0 || id > self.layout.log_size {
            warn!("fs: request for invalid block {}", id);
            return 0;
        }
        self.bmap[(id - 1) as usize]
    }

    /// Positions the device at the block's current log slot.
    fn seek_to_block(&mut self, id: u32) -> Result<()> {
        let log_ptr = self.lookup_block_address(id);
        if log_ptr == 0 || log_ptr > self.layout.log_size {
            warn!("fs: block not found: {}", id);
            return Err(FsError::NotFound);
        }
        self.dev
            .seek(SeekFrom::Start(self.layout.slot_offset(log_ptr)))?;
        Ok(())
    }

    pub(crate) fn load_directory_inode(&mut self, id: u32) -> Result<DirectoryInode> {
        self.seek_to_block(id)?;
        let inode = DirectoryInode::read_from(&mut self.dev)?;
        if inode.id() != id {
            error!(
                "fs: inconsistency, tried to load inode {}, got {}",
                id,
                inode.id()
            );
            return Err(FsError::Corruption("inode id mismatch"));
        }
        Ok(inode)
    }

    pub fn load_directory(&mut self, id: u32) -> Result<Directory> {
        let inode = self.load_directory_inode(id)?;
        let mut entry_lists = Vec::with_capacity(inode.entry_list_ids().len());
        for list_id in inode.entry_list_ids().to_vec() {
            entry_lists.push(self.load_dir_entry_list(list_id).map_err(|e| {
                error!(
                    "fs: unable to load directory {}, dirEntryList {} not found",
                    id, list_id
                );
                e
            })?);
        }
        Ok(Directory::from_parts(inode, entry_lists))
    }

    fn load_dir_entry_list(&mut self, id: u32) -> Result<DirectoryEntryList> {
        self.seek_to_block(id)?;
        let list = DirectoryEntryList::read_from(&mut self.dev)?;
        if list.id() != id {
            error!(
                "fs: inconsistency, tried to load dirEntryList {}, got {}",
                id,
                list.id()
            );
            return Err(FsError::Corruption("entry list id mismatch"));
        }
        Ok(list)
    }

    pub(crate) fn load_file_inode(&mut self, id: u32) -> Result<FileInode> {
        self.seek_to_block(id)?;
        let inode = FileInode::read_from(&mut self.dev)?;
        if inode.id() != id {
            error!(
                "fs: inconsistency, tried to load inode {}, got {}",
                id,
                inode.id()
            );
            return Err(FsError::Corruption("inode id mismatch"));
        }
        Ok(inode)
    }

    pub fn load_file(&mut self, id: u32) -> Result<File> {
        let inode = self.load_file_inode(id)?;
        let mut block_lists = Vec::with_capacity(inode.block_list_ids().len());
        for list_id in inode.block_list_ids().to_vec() {
            block_lists.push(self.load_data_block_list(list_id).map_err(|e| {
                error!(
                    "fs: unable to load file {}, dataBlockList {} not found",
                    id, list_id
                );
                e
            })?);
        }
        Ok(File::from_parts(inode, block_lists))
    }

    fn load_data_block_list(&mut self, id: u32) -> Result<DataBlockList> {
        self.seek_to_block(id)?;
        let list = DataBlockList::read_from(&mut self.dev)?;
        if list.id() != id {
            error!(
                "fs: inconsistency, tried to load DataBlockList {}, got {}",
                id,
                list.id()
            );
            return Err(FsError::Corruption("block list id mismatch"));
        }
        Ok(list)
    }

    pub(crate) fn load_data_block(&mut self, id: u32) -> Result<DataBlock> {
        self.seek_to_block(id)?;
        let block = DataBlock::read_from(&mut self.dev)?;
        if block.id() != id {
            error!(
                "fs: inconsistency, tried to load DataBlock {}, got {}",
                id,
                block.id()
            );
            return Err(FsError::Corruption("data block id mismatch"));
        }
        Ok(block)
    }

    /// Reads only the type nibble of an INode block, without constructing
    /// the whole INode.
    pub(crate) fn peek_inode_kind(&mut self, id: u32) -> Result<Option<InodeKind>> {
        if id == 0 {
            warn!("fs: tried to peek at INode with id zero");
            return Err(FsError::NotFound);
        }
        let log_ptr = self.lookup_block_address(id);
        if log_ptr == 0 || log_ptr > self.layout.log_size {
            warn!("fs: peeking INode type failed, not found: {}", id);
            return Err(FsError::NotFound);
        }
        // packed type/inline byte sits at offset 16 of the block
        self.dev
            .seek(SeekFrom::Start(self.layout.slot_offset(log_ptr) + 16))?;
        let packed = self.dev.read_u8()?;
        Ok(InodeKind::from_raw((packed >> 4) & 0xF))
    }

    /// Walks all intermediate components of an absolute path and returns
    /// the parent directory of the final component.
    pub fn search_parent(&mut self, absolute_path: &str) -> Result<Directory> {
        if !absolute_path.starts_with('/') {
            warn!(
                "fs: cannot traverse {:?}, path is not absolute",
                absolute_path
            );
            return Err(FsError::InvalidArgument);
        }
        let mut current = self.load_directory(ROOT_BLOCK_ID)?;
        for component in path::parent_components(absolute_path) {
            let next_id = current.search_hardlink(component);
            if next_id == 0 {
                return Err(FsError::NotFound);
            }
            if self.peek_inode_kind(next_id)? != Some(InodeKind::Directory) {
                warn!(
                    "fs: path traversal impossible, {:?} is not a directory",
                    component
                );
                return Err(FsError::NotFound);
            }
            current = self.load_directory(next_id)?;
        }
        Ok(current)
    }

    /// Finds the next usable log slot, reclaiming superseded copies on the
    /// way. Returns the slot the caller must write to (always the current
    /// write_ptr); the write_ptr itself is advanced by `save_block` after
    /// the write.
    fn gc(&mut self) -> Result<u32> {
        if self.used_blocks == self.layout.log_size {
            warn!("fs: cannot alloc new block, fs full");
            return Err(FsError::OutOfSpace);
        }
        for _ in 0..self.layout.log_size {
            let offset = self.layout.slot_offset(self.write_ptr);
            self.dev.seek(SeekFrom::Start(offset))?;
            let id = self.dev.read_u32::<LittleEndian>()?;
            if id == 0 {
                // free slot
                return Ok(self.write_ptr);
            }
            let live = id <= self.layout.log_size
                && self.bmap[(id - 1) as usize] == self.write_ptr;
            if live {
                self.write_ptr += 1;
                if self.write_ptr > self.layout.log_size {
                    self.write_ptr = 1;
                }
            } else {
                // superseded copy: invalidate and reuse the slot
                self.dev.seek(SeekFrom::Start(offset))?;
                self.dev.write_u32::<LittleEndian>(0)?;
                return Ok(self.write_ptr);
            }
        }
        error!("fs: inconsistency, unable to find a usable block in gc");
        Err(FsError::Corruption("gc found no usable slot"))
    }

    /// Returns a currently unused block id, scanning the bmap from the
    /// hint with wrap-around in [1, logSize].
    pub(crate) fn get_next_block_id(&mut self) -> Result<u32> {
        if self.used_blocks == self.layout.log_size {
            warn!("fs: cannot alloc id for new block, fs full");
            return Err(FsError::OutOfSpace);
        }
        for i in 0..self.layout.log_size {
            let mut candidate = self.next_block_id + i;
            if candidate > self.layout.log_size {
                candidate -= self.layout.log_size;
            }
            if candidate == 0 {
                candidate = self.layout.log_size;
            }
            if self.bmap[(candidate - 1) as usize] == 0 {
                self.next_block_id = candidate + 1;
                if self.next_block_id > self.layout.log_size {
                    self.next_block_id -= self.layout.log_size;
                }
                return Ok(candidate);
            }
        }
        Err(FsError::OutOfSpace)
    }

    /// Writes the block image into the next usable log slot and updates
    /// bmap and usedBlocks.
    pub fn save_block<B: DiskBlock>(&mut self, block: &mut B) -> Result<()> {
        let log_ptr = self.gc()?;
        self.dev
            .seek(SeekFrom::Start(self.layout.slot_offset(log_ptr)))?;
        let now = self.clock.now();
        block.write_to(&mut self.dev, now)?;
        let index = (block.id() - 1) as usize;
        if self.bmap[index] == 0 {
            self.used_blocks += 1;
        }
        self.bmap[index] = log_ptr;
        // do not reinspect the slot just written
        self.write_ptr += 1;
        if self.write_ptr > self.layout.log_size {
            self.write_ptr = 1;
        }
        Ok(())
    }

    /// Drops a block from the bmap; the stale log slot is reclaimed lazily
    /// by gc.
    pub fn free_block(&mut self, id: u32) {
        if id == 0 {
            warn!("fs: cannot free block with id zero");
            return;
        }
        if id == ROOT_BLOCK_ID {
            warn!("fs: cannot free the root inode block");
            return;
        }
        self.bmap[(id - 1) as usize] = 0;
        self.used_blocks -= 1;
    }

    /// Rebuilds bmap, write_ptr, nextBlockID and usedBlocks from the log
    /// after an unclean unmount. Three passes: find the newest slot and
    /// the highest id, rebuild the bmap preferring newer copies, prune
    /// everything unreachable from the root.
    fn reconstruct_bmap(&mut self) -> Result<()> {
        let log_size = self.layout.log_size;

        // pass A: newest write and highest id
        let mut last_write_ptr: u32 = 0;
        let mut latest_write_time: u32 = 0;
        let mut max_id: u32 = 0;
        for i in 0..log_size {
            self.dev
                .seek(SeekFrom::Start(self.layout.slot_offset(i + 1)))?;
            let id = self.dev.read_u32::<LittleEndian>()?;
            let write_time = self.dev.read_u32::<LittleEndian>()?;
            if id != 0 && write_time >= latest_write_time {
                latest_write_time = write_time;
                last_write_ptr = i + 1;
            }
            if id > max_id {
                max_id = id;
            }
        }
        self.next_block_id = max_id + 1;
        info!("fs: recovered nextBlockID {} (estimated)", self.next_block_id);
        self.write_ptr = if last_write_ptr >= log_size {
            1
        } else {
            last_write_ptr + 1
        };
        info!("fs: recovered write_ptr {} (estimated)", self.write_ptr);
        self.clock.restore(latest_write_time.wrapping_add(1));

        // pass B: sweep in circular order starting right after the newest
        // slot, so equal timestamps resolve in favor of the copy that is
        // physically newer in the wrap order
        self.used_blocks = 0;
        let mut latest_write_times = vec![0u32; log_size as usize];
        for i in 0..log_size {
            let mut j = i + last_write_ptr;
            if j >= log_size {
                j -= log_size;
            }
            self.dev
                .seek(SeekFrom::Start(self.layout.slot_offset(j + 1)))?;
            let id = self.dev.read_u32::<LittleEndian>()?;
            let write_time = self.dev.read_u32::<LittleEndian>()?;
            if id == 0 {
                continue;
            }
            if id > log_size {
                warn!("fs: ignoring block with invalid id {} at slot {}", id, j + 1);
                continue;
            }
            let index = (id - 1) as usize;
            if self.bmap[index] == 0 {
                self.used_blocks += 1;
            }
            if latest_write_times[index] <= write_time {
                debug!("fs: block {} at slot {} time {} -> saved", id, j + 1, write_time);
                self.bmap[index] = j + 1;
                latest_write_times[index] = write_time;
            } else {
                debug!("fs: block {} at slot {} time {} -> outdated", id, j + 1, write_time);
            }
        }

        // pass C: depth-first reachability from the root, prune the rest
        let mut reachable = bitvec![u8, Lsb0; 0; log_size as usize];
        let root = self.load_directory(ROOT_BLOCK_ID)?;
        self.mark_reachable(&mut reachable, &root)?;
        for i in 0..log_size as usize {
            if !reachable[i] && self.bmap[i] != 0 {
                debug!("fs: unreachable block {} removed from bmap", i + 1);
                self.bmap[i] = 0;
                self.used_blocks -= 1;
            }
        }
        if self.used_blocks == 0 {
            error!("fs: recovery failed, zero blocks found");
            return Err(FsError::Corruption("recovery found no live blocks"));
        }
        Ok(())
    }

    /// Marks a directory, its entry lists and everything below it. "." and
    /// ".." are skipped to avoid cycles.
    fn mark_reachable(
        &mut self,
        reachable: &mut BitVec<u8, Lsb0>,
        dir: &Directory,
    ) -> Result<()> {
        reachable.set((dir.primary().id() - 1) as usize, true);
        for list_id in dir.entry_list_ids() {
            reachable.set((list_id - 1) as usize, true);
        }
        for name in dir.ls() {
            if name == "." || name == ".." {
                continue;
            }
            let link_id = dir.search_hardlink(&name);
            match self.peek_inode_kind(link_id) {
                Ok(Some(InodeKind::Directory)) => {
                    let child = self.load_directory(link_id)?;
                    self.mark_reachable(reachable, &child)?;
                }
                Ok(Some(InodeKind::RegularFile)) => {
                    let file = self.load_file(link_id)?;
                    for block_id in file.blocks() {
                        reachable.set((block_id - 1) as usize, true);
                    }
                }
                Ok(_) | Err(FsError::NotFound) => {
                    warn!("fs: traversal found unknown INode type, id {}", link_id);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl<D: BlockDevice> BlockAllocator for FsCore<D> {
    fn dealloc_block(&mut self, id: u32) {
        self.free_block(id);
    }
}

impl<D: BlockDevice> EntryListAllocator for FsCore<D> {
    fn alloc_entry_list(&mut self) -> Result<DirectoryEntryList> {
        if !self.has_free_blocks(1) {
            warn!("fs: cannot create new DirEntryList, fs is full");
            return Err(FsError::OutOfSpace);
        }
        Ok(DirectoryEntryList::new(self.get_next_block_id()?))
    }
}

impl<D: BlockDevice> BlockListAllocator for FsCore<D> {
    fn alloc_block_list(&mut self) -> Result<DataBlockList> {
        if !self.has_free_blocks(1) {
            warn!("fs: cannot create new DataBlockList, fs is full");
            return Err(FsError::OutOfSpace);
        }
        Ok(DataBlockList::new(self.get_next_block_id()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mkfs;
    use std::io::Cursor;

    const SMALL_IMAGE: u64 = 64 * 1024; // 14 log slots

    fn fresh_core() -> FsCore<Cursor<Vec<u8>>> {
        let mut dev = Cursor::new(vec![0u8; SMALL_IMAGE as usize]);
        mkfs::format(&mut dev, SMALL_IMAGE, &mut Clock::Pseudo(1)).unwrap();
        FsCore::mount(dev, Clock::Pseudo(0)).unwrap()
    }

    #[test]
    fn mount_restores_header_state() {
        let core = fresh_core();
        assert_eq!(core.used_blocks(), 1);
        assert_eq!(core.log_size(), 14);
        assert_eq!(core.write_ptr, 2);
        assert_eq!(core.next_block_id, 2);
    }

    #[test]
    fn mount_marks_bmap_invalid_on_disk() {
        let core = fresh_core();
        let mut dev = core.into_device();
        assert_eq!(
            header::read_field(&mut dev, header::BMAP_VALID_OFFSET).unwrap(),
            0
        );
    }

    #[test]
    fn block_id_allocation_skips_live_ids_and_wraps() {
        let mut core = fresh_core();
        assert_eq!(core.get_next_block_id().unwrap(), 2);
        assert_eq!(core.get_next_block_id().unwrap(), 3);
        // force the hint past the end
        core.next_block_id = core.log_size();
        assert_eq!(core.get_next_block_id().unwrap(), core.log_size());
        // wraps around and skips the live root at id 1
        assert_eq!(core.get_next_block_id().unwrap(), 2);
    }

    #[test]
    fn save_load_round_trip_through_the_log() {
        let mut core = fresh_core();
        let mut block = DataBlock::new(core.get_next_block_id().unwrap());
        block.write(b"some bytes", 0).unwrap();
        core.save_block(&mut block).unwrap();
        assert_eq!(core.used_blocks(), 2);

        let loaded = core.load_data_block(block.id()).unwrap();
        let mut out = [0u8; 10];
        loaded.read(&mut out, 0).unwrap();
        assert_eq!(&out, b"some bytes");

        // rewriting the same block moves it to a new slot, count unchanged
        let old_slot = core.lookup_block_address(block.id());
        core.save_block(&mut block).unwrap();
        assert_ne!(core.lookup_block_address(block.id()), old_slot);
        assert_eq!(core.used_blocks(), 2);
    }

    #[test]
    fn free_block_guards_root_and_zero() {
        let mut core = fresh_core();
        core.free_block(0);
        core.free_block(ROOT_BLOCK_ID);
        assert_eq!(core.used_blocks(), 1);
    }

    #[test]
    fn gc_reclaims_superseded_slots_over_many_rewrites() {
        let mut core = fresh_core();
        let mut block = DataBlock::new(core.get_next_block_id().unwrap());
        // far more rewrites than the log has slots
        for i in 0..100u32 {
            block.write(&i.to_le_bytes(), 0).unwrap();
            core.save_block(&mut block).unwrap();
        }
        assert_eq!(core.used_blocks(), 2);
        let loaded = core.load_data_block(block.id()).unwrap();
        let mut out = [0u8; 4];
        loaded.read(&mut out, 0).unwrap();
        assert_eq!(u32::from_le_bytes(out), 99);
    }

    #[test]
    fn full_log_reports_out_of_space() {
        let mut core = fresh_core();
        while core.has_free_blocks(1) {
            let id = core.get_next_block_id().unwrap();
            core.save_block(&mut DataBlock::new(id)).unwrap();
        }
        assert_eq!(core.used_blocks(), core.log_size());
        assert!(matches!(core.get_next_block_id(), Err(FsError::OutOfSpace)));
        let mut extra = DataBlock::new(5);
        assert!(matches!(
            core.save_block(&mut extra),
            Err(FsError::OutOfSpace)
        ));
    }

    #[test]
    fn peek_reads_only_the_type_nibble() {
        let mut core = fresh_core();
        assert_eq!(
            core.peek_inode_kind(ROOT_BLOCK_ID).unwrap(),
            Some(InodeKind::Directory)
        );
        assert!(matches!(core.peek_inode_kind(0), Err(FsError::NotFound)));
        assert!(matches!(core.peek_inode_kind(9), Err(FsError::NotFound)));
    }

    #[test]
    fn used_blocks_always_matches_live_bmap_entries() {
        let mut core = fresh_core();
        assert_eq!(core.used_blocks(), core.live_bmap_entries());
        let id = core.get_next_block_id().unwrap();
        core.save_block(&mut DataBlock::new(id)).unwrap();
        assert_eq!(core.used_blocks(), core.live_bmap_entries());
        core.free_block(id);
        assert_eq!(core.used_blocks(), core.live_bmap_entries());
    }
}
