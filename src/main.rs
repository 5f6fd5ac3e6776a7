use std::fs::OpenOptions;
use std::io::Write;

use anyhow::Context;
use clap::Parser;
use memmap2::MmapMut;

use sdi4fs::cli::{Sdi4fsCli, TwoPathArgs};
use sdi4fs::{Fs, FsError, ImageCursor};

type HostFs = Fs<ImageCursor<MmapMut>>;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_default_env()
        .format_timestamp(None)
        .init();
    match Sdi4fsCli::parse() {
        Sdi4fsCli::Mkfs(args) => sdi4fs::mkfs::mkfs(&args.image, args.size)
            .with_context(|| format!("cannot create image {}", args.image))?,
        Sdi4fsCli::Ls(args) => run_on(&args.image, |fs| {
            for line in fs.ls(&args.path)? {
                println!("{line}");
            }
            Ok(())
        })?,
        Sdi4fsCli::Mkdir(args) => run_on(&args.image, |fs| fs.mkdir(&args.path))?,
        Sdi4fsCli::Rmdir(args) => run_on(&args.image, |fs| fs.rmdir(&args.path))?,
        Sdi4fsCli::Touch(args) => run_on(&args.image, |fs| fs.touch(&args.path))?,
        Sdi4fsCli::Rm(args) => run_on(&args.image, |fs| fs.rm(&args.path))?,
        Sdi4fsCli::Mv(TwoPathArgs { image, source, dest }) => {
            run_on(&image, |fs| fs.rename(&source, &dest))?
        }
        Sdi4fsCli::Ln(TwoPathArgs { image, source, dest }) => {
            run_on(&image, |fs| fs.link(&source, &dest))?
        }
        Sdi4fsCli::Stat(args) => run_on(&args.image, |fs| {
            println!("{}", fs.file_size(&args.path));
            Ok(())
        })?,
        Sdi4fsCli::Cat(args) => run_on(&args.image, |fs| {
            let size = fs.file_size(&args.path);
            let handle = fs.open_file(&args.path)?;
            if size > 0 {
                let mut data = vec![0u8; size as usize];
                fs.read(handle, &mut data, 0)?;
                std::io::stdout().write_all(&data)?;
            }
            fs.close_file(handle)
        })?,
        Sdi4fsCli::Put(args) => {
            let data = std::fs::read(&args.local)
                .with_context(|| format!("cannot read {}", args.local))?;
            run_on(&args.image, |fs| {
                let old_size = fs.file_size(&args.path);
                let handle = match fs.open_file(&args.path) {
                    Ok(handle) => handle,
                    Err(FsError::NotFound) => {
                        fs.touch(&args.path)?;
                        fs.open_file(&args.path)?
                    }
                    Err(e) => return Err(e),
                };
                if !data.is_empty() {
                    fs.write(handle, &data, 0)?;
                    if old_size as usize > data.len() {
                        fs.truncate(handle, data.len() as u32)?;
                    }
                }
                fs.close_file(handle)
            })?
        }
    }
    Ok(())
}

/// Mounts the image, runs the operation and unmounts, even when the
/// operation fails.
fn run_on(image: &str, op: impl FnOnce(&mut HostFs) -> sdi4fs::Result<()>) -> anyhow::Result<()> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(image)
        .with_context(|| format!("cannot open image {image}"))?;
    let mmap = unsafe { MmapMut::map_mut(&file)? };
    let mut fs = Fs::mount(ImageCursor::new(mmap))?;
    let result = op(&mut fs);
    fs.umount()?;
    Ok(result?)
}
