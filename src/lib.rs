//! SDI4FS is a single-writer, log-structured file system that operates on
//! a seekable block-device image.
//!
//! Layout of an image, in order:
//! - Header: magic, total size, write pointer, bmap validity flag, block-id
//!   hint, used-block count, last unmount time.
//! - BMap region: one u32 per log slot, mapping block id to the slot that
//!   holds the block's newest copy.
//! - Log: 4096-byte slots; every block write appends at the write pointer,
//!   and stale copies are reclaimed lazily by the garbage collector.
//!
//! A clean unmount persists the bmap; after an unclean unmount the next
//! mount rebuilds it with a full-log scan (newest copy wins, unreachable
//! blocks are pruned).
//!
//! ```no_run
//! use sdi4fs::{mkfs, Fs};
//!
//! # fn main() -> sdi4fs::Result<()> {
//! let mut dev = std::io::Cursor::new(vec![0u8; 1 << 20]);
//! mkfs::format(&mut dev, 1 << 20, &mut sdi4fs::Clock::System)?;
//! let mut fs = Fs::mount(dev)?;
//! fs.mkdir("/docs")?;
//! fs.touch("/docs/readme")?;
//! let handle = fs.open_file("/docs/readme")?;
//! fs.write(handle, b"hello", 0)?;
//! fs.close_file(handle)?;
//! fs.umount()?;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod device;
mod error;
pub mod fs;
pub mod mkfs;
pub mod path;
pub mod time;

pub use device::{BlockDevice, ImageCursor};
pub use error::{FsError, Result};
pub use fs::{Fs, InodeKind};
pub use time::Clock;
