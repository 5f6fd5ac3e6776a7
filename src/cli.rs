//! Command-line surface of the host program.

use clap::Parser;

#[derive(Parser, Debug, PartialEq)]
#[command(author, version, about = "log-structured file system image tool")]
pub enum Sdi4fsCli {
    /// create a new file system image
    Mkfs(MkfsArgs),
    /// list a directory
    Ls(PathArgs),
    /// create a directory
    Mkdir(PathArgs),
    /// remove an empty directory
    Rmdir(PathArgs),
    /// create an empty file
    Touch(PathArgs),
    /// remove a hardlink to a file
    Rm(PathArgs),
    /// rename (move) a file or directory
    Mv(TwoPathArgs),
    /// create a hardlink to an existing file
    Ln(TwoPathArgs),
    /// print the size of a file in bytes
    Stat(PathArgs),
    /// write a file's contents to stdout
    Cat(PathArgs),
    /// copy a local file into the image
    Put(PutArgs),
}

#[derive(clap::Args, Debug, PartialEq)]
pub struct MkfsArgs {
    /// path of the image file to create
    #[clap(short, long)]
    pub image: String,
    /// image size in bytes
    #[clap(short, long)]
    pub size: u64,
}

#[derive(clap::Args, Debug, PartialEq)]
pub struct PathArgs {
    /// path of the image file
    #[clap(short, long)]
    pub image: String,
    /// absolute path inside the file system
    pub path: String,
}

#[derive(clap::Args, Debug, PartialEq)]
pub struct TwoPathArgs {
    /// path of the image file
    #[clap(short, long)]
    pub image: String,
    /// absolute source path inside the file system
    pub source: String,
    /// absolute destination path inside the file system
    pub dest: String,
}

#[derive(clap::Args, Debug, PartialEq)]
pub struct PutArgs {
    /// path of the image file
    #[clap(short, long)]
    pub image: String,
    /// local file to copy from
    pub local: String,
    /// absolute destination path inside the file system
    pub path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mkfs() {
        let args =
            Sdi4fsCli::parse_from(["sdi4fs", "mkfs", "--image", "dev.img", "--size", "1048576"]);
        assert_eq!(
            args,
            Sdi4fsCli::Mkfs(MkfsArgs {
                image: "dev.img".to_string(),
                size: 1_048_576,
            })
        );
    }

    #[test]
    fn parses_path_commands() {
        let args = Sdi4fsCli::parse_from(["sdi4fs", "ls", "-i", "dev.img", "/a/b"]);
        assert_eq!(
            args,
            Sdi4fsCli::Ls(PathArgs {
                image: "dev.img".to_string(),
                path: "/a/b".to_string(),
            })
        );
    }

    #[test]
    fn parses_two_path_commands() {
        let args = Sdi4fsCli::parse_from(["sdi4fs", "mv", "-i", "dev.img", "/a", "/b"]);
        assert_eq!(
            args,
            Sdi4fsCli::Mv(TwoPathArgs {
                image: "dev.img".to_string(),
                source: "/a".to_string(),
                dest: "/b".to_string(),
            })
        );
    }
}
