//! The filesystem abstraction the engine is written against.
//!
//! Production code runs on `FileStorage`; tests run on `MemStorage`. Both
//! expose the same unified `File` handle rather than separate
//! sequential/random/writable types, with the convention that files
//! opened through `Storage::create` are written and files opened through
//! `Storage::open` are read.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::IResult;

pub mod file;
pub mod mem;

pub trait Storage: Sync + Send {
    type F: File + 'static;

    /// Creates a file at `name`, truncating any existing file.
    fn create<P: AsRef<Path>>(&self, name: P) -> IResult<Self::F>;

    /// Opens the file at `name` for reading.
    fn open<P: AsRef<Path>>(&self, name: P) -> IResult<Self::F>;

    /// Deletes the named file.
    fn remove<P: AsRef<Path>>(&self, name: P) -> IResult<()>;

    /// Removes a directory at this path. If `recursively`, removes all its
    /// contents.
    fn remove_dir<P: AsRef<Path>>(&self, dir: P, recursively: bool) -> IResult<()>;

    /// Returns true iff the named file or dir exists.
    fn exists<P: AsRef<Path>>(&self, name: P) -> bool;

    /// Returns the path to each file in the given directory.
    fn list<P: AsRef<Path>>(&self, dir: P) -> IResult<Vec<PathBuf>>;

    /// Renames a file or directory to a new name, replacing the original
    /// if `target` already exists.
    fn rename<P: AsRef<Path>>(&self, src: P, target: P) -> IResult<()>;

    /// Recursively creates a directory and all of its missing parents.
    fn mkdir_all<P: AsRef<Path>>(&self, dir: P) -> IResult<()>;
}

pub trait File: Sync + Send {
    /// Acquires an exclusive advisory lock on the file. Fails immediately
    /// if the lock is held by this process or another.
    fn lock_file(&self) -> IResult<()>;

    /// Releases the lock taken by `lock_file`.
    fn unlock_file(&self) -> IResult<()>;

    /// Reads bytes starting at `offset` into `buf`, returning how many
    /// bytes were read. May return fewer bytes than requested at EOF.
    /// Safe to call concurrently.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> IResult<usize>;

    /// Reads the exact number of bytes required to fill `buf` from
    /// `offset`. Errors if EOF is encountered before the buffer is full.
    fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> IResult<()> {
        while !buf.is_empty() {
            match self.read_at(buf, offset) {
                Ok(0) => break,
                Ok(n) => {
                    let tmp = buf;
                    buf = &mut tmp[n..];
                    offset += n as u64;
                }
                Err(Error::IO(err)) => {
                    if err.kind() != std::io::ErrorKind::Interrupted {
                        return Err(Error::IO(err));
                    }
                }
                Err(e) => return Err(e),
            }
        }
        if !buf.is_empty() {
            return Err(Error::IO(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "failed to fill whole buffer",
            )));
        }
        Ok(())
    }

    /// Reads from the current position into `buf`, returning how many
    /// bytes were read. Returns fewer bytes than requested only at EOF.
    fn read(&mut self, buf: &mut [u8]) -> IResult<usize>;

    /// Reads everything from the current position into `buf`.
    fn read_all(&mut self, buf: &mut Vec<u8>) -> IResult<usize>;

    /// Appends `buf` at the current position, returning how many bytes
    /// were written.
    fn write(&mut self, buf: &[u8]) -> IResult<usize>;

    /// Flushes buffered bytes to the operating system.
    fn flush(&mut self) -> IResult<()>;

    /// Forces file contents to stable storage. For manifest files this
    /// additionally syncs the containing directory so a newly created
    /// manifest survives a crash.
    fn sync(&mut self) -> IResult<()>;

    fn seek(&mut self, pos: SeekFrom) -> IResult<u64>;

    fn len(&self) -> IResult<u64>;

    /// Closes the underlying handle.
    fn close(&mut self) -> IResult<()>;
}
