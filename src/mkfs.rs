//! Creates an empty file system image.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};
use log::info;
use memmap2::MmapMut;

use crate::device::{BlockDevice, ImageCursor};
use crate::error::{FsError, Result};
use crate::fs::block::DiskBlock;
use crate::fs::dir_inode::DirectoryInode;
use crate::fs::directory::Directory;
use crate::fs::header::Header;
use crate::fs::layout::Layout;
use crate::fs::{FS_MAX_SIZE, FS_MIN_SIZE, ROOT_BLOCK_ID};
use crate::time::Clock;

/// Writes a fresh file system onto the device: header, zeroed bmap, an
/// invalidated log, and the root directory (block id 1) in log slot 1.
pub fn format<D: BlockDevice>(dev: &mut D, size_b: u64, clock: &mut Clock) -> Result<()> {
    if !(FS_MIN_SIZE..=FS_MAX_SIZE).contains(&size_b) {
        return Err(FsError::InvalidArgument);
    }
    let layout = Layout::for_size(size_b);

    // zero the bmap region
    dev.seek(SeekFrom::Start(layout.bmap_start))?;
    dev.write_all(&vec![0u8; layout.bmap_size as usize])?;
    // invalidate every log slot by zeroing its id word
    for slot in 1..=layout.log_size {
        dev.seek(SeekFrom::Start(layout.slot_offset(slot)))?;
        dev.write_u32::<LittleEndian>(0)?;
    }

    // root directory, its own parent, in slot 1
    let mut root = Directory::create_root(DirectoryInode::new(ROOT_BLOCK_ID, clock.now()));
    dev.seek(SeekFrom::Start(layout.slot_offset(1)))?;
    let now = clock.now();
    root.primary_mut().write_to(dev, now)?;
    dev.seek(SeekFrom::Start(layout.bmap_start))?;
    dev.write_u32::<LittleEndian>(1)?;

    let header = Header {
        size_b,
        write_ptr: 2,
        bmap_valid: true,
        next_block_id: 2,
        used_blocks: 1,
        last_umount_time: clock.now(),
    };
    header.write_to(dev)?;
    dev.flush()?;
    dev.sync()?;
    info!(
        "mkfs: created {}B image, {} log slots",
        size_b, layout.log_size
    );
    Ok(())
}

/// Creates, sizes and formats an image file, mapping it like the mounted
/// host does.
pub fn mkfs<P: AsRef<Path>>(image_path: P, size_b: u64) -> Result<()> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(image_path)?;
    file.set_len(size_b)?;
    let mmap = unsafe { MmapMut::map_mut(&file)? };
    let mut dev = ImageCursor::new(mmap);
    format(&mut dev, size_b, &mut Clock::System)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::Fs;
    use std::io::Cursor;

    #[test]
    fn format_rejects_out_of_range_sizes() {
        let mut dev = Cursor::new(vec![0u8; 1024]);
        assert!(matches!(
            format(&mut dev, 1024, &mut Clock::Pseudo(1)),
            Err(FsError::InvalidArgument)
        ));
    }

    #[test]
    fn formatted_image_mounts_with_root_only() {
        let size = 64 * 1024;
        let mut dev = Cursor::new(vec![0u8; size as usize]);
        format(&mut dev, size, &mut Clock::Pseudo(1)).unwrap();

        let mut fs = Fs::mount_with_clock(dev, Clock::Pseudo(100)).unwrap();
        assert_eq!(fs.used_blocks(), 1);
        let listing = fs.ls("/").unwrap();
        // header plus "." and ".."
        assert_eq!(listing.len(), 3);
        assert!(listing[1].ends_with(" ."));
        assert!(listing[2].ends_with(" .."));
        fs.umount().unwrap();
    }

    #[test]
    fn mkfs_creates_a_mountable_image_file() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("test.img");
        mkfs(&image, 1 << 20).unwrap();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&image)
            .unwrap();
        let mmap = unsafe { MmapMut::map_mut(&file).unwrap() };
        let mut fs = Fs::mount(ImageCursor::new(mmap)).unwrap();
        fs.mkdir("/tmp").unwrap();
        fs.umount().unwrap();

        // reopen and verify the directory survived
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&image)
            .unwrap();
        let mmap = unsafe { MmapMut::map_mut(&file).unwrap() };
        let mut fs = Fs::mount(ImageCursor::new(mmap)).unwrap();
        let listing = fs.ls("/").unwrap();
        assert!(listing.iter().any(|line| line.ends_with(" tmp")));
        fs.umount().unwrap();
    }

    #[test]
    fn mkfs_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("test.img");
        mkfs(&image, 64 * 1024).unwrap();
        assert!(mkfs(&image, 64 * 1024).is_err());
    }
}
