use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::storage::{File, Storage};
use crate::IResult;

/// An in-memory `Storage` for tests: files are shared byte vectors, so a
/// reader opened on a path observes everything a writer appends there.
#[derive(Clone, Default)]
pub struct MemStorage {
    files: Arc<Mutex<HashMap<PathBuf, Arc<FileNode>>>>,
}

#[derive(Default)]
struct FileNode {
    data: Mutex<Vec<u8>>,
    locked: AtomicBool,
}

pub struct MemFile {
    node: Arc<FileNode>,
    pos: usize,
}

fn not_found(name: &Path) -> Error {
    Error::IO(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("{} not found", name.display()),
    ))
}

impl Storage for MemStorage {
    type F = MemFile;

    fn create<P: AsRef<Path>>(&self, name: P) -> IResult<Self::F> {
        let mut files = self.files.lock().unwrap();
        let node = Arc::new(FileNode::default());
        files.insert(name.as_ref().to_path_buf(), node.clone());
        Ok(MemFile { node, pos: 0 })
    }

    fn open<P: AsRef<Path>>(&self, name: P) -> IResult<Self::F> {
        let files = self.files.lock().unwrap();
        match files.get(name.as_ref()) {
            Some(node) => Ok(MemFile {
                node: node.clone(),
                pos: 0,
            }),
            None => Err(not_found(name.as_ref())),
        }
    }

    fn remove<P: AsRef<Path>>(&self, name: P) -> IResult<()> {
        let mut files = self.files.lock().unwrap();
        files
            .remove(name.as_ref())
            .map(|_| ())
            .ok_or_else(|| not_found(name.as_ref()))
    }

    fn remove_dir<P: AsRef<Path>>(&self, dir: P, recursively: bool) -> IResult<()> {
        let mut files = self.files.lock().unwrap();
        if recursively {
            files.retain(|path, _| !path.starts_with(dir.as_ref()));
        }
        Ok(())
    }

    fn exists<P: AsRef<Path>>(&self, name: P) -> bool {
        self.files.lock().unwrap().contains_key(name.as_ref())
    }

    fn list<P: AsRef<Path>>(&self, dir: P) -> IResult<Vec<PathBuf>> {
        let files = self.files.lock().unwrap();
        Ok(files
            .keys()
            .filter(|path| path.starts_with(dir.as_ref()))
            .cloned()
            .collect())
    }

    fn rename<P: AsRef<Path>>(&self, src: P, target: P) -> IResult<()> {
        let mut files = self.files.lock().unwrap();
        match files.remove(src.as_ref()) {
            Some(node) => {
                files.insert(target.as_ref().to_path_buf(), node);
                Ok(())
            }
            None => Err(not_found(src.as_ref())),
        }
    }

    fn mkdir_all<P: AsRef<Path>>(&self, _dir: P) -> IResult<()> {
        Ok(())
    }
}

impl File for MemFile {
    fn lock_file(&self) -> IResult<()> {
        if self
            .node
            .locked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::IO(std::io::Error::new(
                std::io::ErrorKind::Other,
                "lock already held by process",
            )));
        }
        Ok(())
    }

    fn unlock_file(&self) -> IResult<()> {
        self.node.locked.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> IResult<usize> {
        let data = self.node.data.lock().unwrap();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = std::cmp::min(buf.len(), data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn read(&mut self, buf: &mut [u8]) -> IResult<usize> {
        let n = self.read_at(buf, self.pos as u64)?;
        self.pos += n;
        Ok(n)
    }

    fn read_all(&mut self, buf: &mut Vec<u8>) -> IResult<usize> {
        let data = self.node.data.lock().unwrap();
        let pos = self.pos.min(data.len());
        buf.extend_from_slice(&data[pos..]);
        let n = data.len() - pos;
        self.pos = data.len();
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> IResult<usize> {
        let mut data = self.node.data.lock().unwrap();
        data.extend_from_slice(buf);
        self.pos = data.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> IResult<()> {
        Ok(())
    }

    fn sync(&mut self) -> IResult<()> {
        Ok(())
    }

    fn seek(&mut self, pos: SeekFrom) -> IResult<u64> {
        let len = self.node.data.lock().unwrap().len() as i64;
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(delta) => self.pos as i64 + delta,
            SeekFrom::End(delta) => len + delta,
        };
        if target < 0 {
            return Err(Error::IO(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start of file",
            )));
        }
        self.pos = target as usize;
        Ok(target as u64)
    }

    fn len(&self) -> IResult<u64> {
        Ok(self.node.data.lock().unwrap().len() as u64)
    }

    fn close(&mut self) -> IResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_open_share_contents() {
        let storage = MemStorage::default();
        let mut w = storage.create("a/b").unwrap();
        w.write(b"abc").unwrap();

        let mut r = storage.open("a/b").unwrap();
        let mut buf = vec![];
        r.read_all(&mut buf).unwrap();
        assert_eq!(buf, b"abc");

        // A writer appending after the reader opened is still observed.
        w.write(b"def").unwrap();
        let mut rest = vec![];
        r.read_all(&mut rest).unwrap();
        assert_eq!(rest, b"def");
    }

    #[test]
    fn test_create_truncates() {
        let storage = MemStorage::default();
        let mut w = storage.create("f").unwrap();
        w.write(b"old contents").unwrap();
        let _ = storage.create("f").unwrap();
        let r = storage.open("f").unwrap();
        assert_eq!(r.len().unwrap(), 0);
    }

    #[test]
    fn test_open_missing_fails() {
        let storage = MemStorage::default();
        assert!(storage.open("nope").is_err());
        assert!(!storage.exists("nope"));
    }

    #[test]
    fn test_rename_and_list() {
        let storage = MemStorage::default();
        storage.create("dir/a").unwrap();
        storage.create("dir/b").unwrap();
        storage.rename("dir/a", "dir/c").unwrap();
        let mut names = storage.list("dir").unwrap();
        names.sort();
        assert_eq!(names, vec![PathBuf::from("dir/b"), PathBuf::from("dir/c")]);
    }

    #[test]
    fn test_lock_is_exclusive() {
        let storage = MemStorage::default();
        let f = storage.create("LOCK").unwrap();
        f.lock_file().unwrap();
        let g = storage.open("LOCK").unwrap();
        assert!(g.lock_file().is_err());
        f.unlock_file().unwrap();
        g.lock_file().unwrap();
    }
}
