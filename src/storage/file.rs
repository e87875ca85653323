use std::collections::HashSet;
use std::fs::{
    read_dir, remove_dir, remove_dir_all, remove_file, rename, File as StdFile, OpenOptions,
};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use memmap::Mmap;
use tracing::debug;

use crate::error::Error;
use crate::storage::{File, Storage};
use crate::IResult;

/// Process-wide set of locked files. fcntl locks do not guard against
/// re-locking from the same process, so both this set and the advisory
/// lock must be acquired.
fn lock_table() -> &'static Mutex<HashSet<PathBuf>> {
    static LOCK_TABLE: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    LOCK_TABLE.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Caps the number of concurrently mmapped files so large databases do
/// not exhaust virtual memory: up to 1000 maps on 64-bit hosts, none on
/// smaller pointer sizes.
pub struct MmapLimiter {
    allowed: AtomicIsize,
}

impl Default for MmapLimiter {
    fn default() -> Self {
        MmapLimiter {
            allowed: AtomicIsize::new(if std::mem::size_of::<usize>() >= 8 {
                1000
            } else {
                0
            }),
        }
    }
}

impl MmapLimiter {
    /// If another mmap slot is available, acquires it and returns true.
    pub fn acquire(&self) -> bool {
        let prev = self.allowed.fetch_sub(1, Ordering::SeqCst);
        if prev <= 0 {
            self.allowed.fetch_add(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Releases a slot acquired by a previous successful `acquire`.
    pub fn release(&self) {
        self.allowed.fetch_add(1, Ordering::SeqCst);
    }
}

fn fcntl_lock(fd: i32, lock: bool) -> IResult<()> {
    let mut f: libc::flock = unsafe { std::mem::zeroed() };
    f.l_type = (if lock { libc::F_WRLCK } else { libc::F_UNLCK }) as libc::c_short;
    f.l_whence = libc::SEEK_SET as libc::c_short;
    // l_start = 0 and l_len = 0 lock the entire file.
    if unsafe { libc::fcntl(fd, libc::F_SETLK, &f) } == -1 {
        return Err(Error::IO(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// `Storage` backed by the real filesystem. Files opened for reading are
/// memory mapped when a limiter slot is available; otherwise reads go
/// through `pread`.
#[derive(Clone, Default)]
pub struct FileStorage {
    mmap_limiter: Arc<MmapLimiter>,
}

impl Storage for FileStorage {
    type F = SysFile;

    fn create<P: AsRef<Path>>(&self, name: P) -> IResult<Self::F> {
        let file = OpenOptions::new()
            .write(true)
            .read(true)
            .create(true)
            .truncate(true)
            .open(name.as_ref())?;
        Ok(SysFile::Plain(PlainFile {
            file,
            path: name.as_ref().to_path_buf(),
        }))
    }

    fn open<P: AsRef<Path>>(&self, name: P) -> IResult<Self::F> {
        let file = OpenOptions::new().read(true).open(name.as_ref())?;
        let file_len = file.metadata()?.len();
        if file_len > 0 && self.mmap_limiter.acquire() {
            match unsafe { Mmap::map(&file) } {
                Ok(map) => {
                    return Ok(SysFile::Mmap(MmapFile {
                        map,
                        pos: 0,
                        limiter: self.mmap_limiter.clone(),
                    }))
                }
                Err(e) => {
                    self.mmap_limiter.release();
                    debug!(path = %name.as_ref().display(), error = %e, "mmap failed, falling back to pread");
                }
            }
        }
        Ok(SysFile::Plain(PlainFile {
            file,
            path: name.as_ref().to_path_buf(),
        }))
    }

    fn remove<P: AsRef<Path>>(&self, name: P) -> IResult<()> {
        remove_file(name).map_err(Error::IO)
    }

    fn remove_dir<P: AsRef<Path>>(&self, dir: P, recursively: bool) -> IResult<()> {
        if recursively {
            remove_dir_all(dir).map_err(Error::IO)
        } else {
            remove_dir(dir).map_err(Error::IO)
        }
    }

    fn exists<P: AsRef<Path>>(&self, name: P) -> bool {
        name.as_ref().exists()
    }

    fn list<P: AsRef<Path>>(&self, dir: P) -> IResult<Vec<PathBuf>> {
        if !dir.as_ref().is_dir() {
            return Ok(vec![]);
        }
        let mut v = vec![];
        for entry in read_dir(dir)? {
            v.push(entry?.path());
        }
        Ok(v)
    }

    fn rename<P: AsRef<Path>>(&self, src: P, target: P) -> IResult<()> {
        rename(src, target).map_err(Error::IO)
    }

    fn mkdir_all<P: AsRef<Path>>(&self, dir: P) -> IResult<()> {
        std::fs::create_dir_all(dir).map_err(Error::IO)
    }
}

pub enum SysFile {
    Plain(PlainFile),
    Mmap(MmapFile),
}

pub struct PlainFile {
    file: StdFile,
    path: PathBuf,
}

pub struct MmapFile {
    map: Mmap,
    pos: usize,
    limiter: Arc<MmapLimiter>,
}

impl Drop for MmapFile {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

impl PlainFile {
    fn sync_dir_if_manifest(&self) -> IResult<()> {
        let is_manifest = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("MANIFEST"))
            .unwrap_or(false);
        if is_manifest {
            if let Some(parent) = self.path.parent() {
                StdFile::open(parent)?.sync_all()?;
            }
        }
        Ok(())
    }
}

impl File for SysFile {
    fn lock_file(&self) -> IResult<()> {
        match self {
            SysFile::Plain(f) => {
                let mut table = lock_table().lock().unwrap();
                if !table.insert(f.path.clone()) {
                    return Err(Error::IO(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        format!("lock {}: already held by process", f.path.display()),
                    )));
                }
                if let Err(e) = fcntl_lock(f.file.as_raw_fd(), true) {
                    table.remove(&f.path);
                    return Err(e);
                }
                Ok(())
            }
            SysFile::Mmap(_) => Err(Error::NotSupported("lock_file on mmap file")),
        }
    }

    fn unlock_file(&self) -> IResult<()> {
        match self {
            SysFile::Plain(f) => {
                fcntl_lock(f.file.as_raw_fd(), false)?;
                lock_table().lock().unwrap().remove(&f.path);
                Ok(())
            }
            SysFile::Mmap(_) => Err(Error::NotSupported("unlock_file on mmap file")),
        }
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> IResult<usize> {
        match self {
            SysFile::Plain(f) => Ok(f.file.read_at(buf, offset)?),
            SysFile::Mmap(f) => {
                let offset = offset as usize;
                if offset >= f.map.len() {
                    return Ok(0);
                }
                let n = std::cmp::min(buf.len(), f.map.len() - offset);
                buf[..n].copy_from_slice(&f.map[offset..offset + n]);
                Ok(n)
            }
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> IResult<usize> {
        match self {
            SysFile::Plain(f) => {
                // Fill the buffer completely unless EOF intervenes, the way
                // the log reader expects block reads to behave.
                let mut read_total = 0;
                while read_total < buf.len() {
                    let n = f.file.read(&mut buf[read_total..])?;
                    if n == 0 {
                        break;
                    }
                    read_total += n;
                }
                Ok(read_total)
            }
            SysFile::Mmap(f) => {
                let n = {
                    let pos = f.pos.min(f.map.len());
                    let n = std::cmp::min(buf.len(), f.map.len() - pos);
                    buf[..n].copy_from_slice(&f.map[pos..pos + n]);
                    n
                };
                f.pos += n;
                Ok(n)
            }
        }
    }

    fn read_all(&mut self, buf: &mut Vec<u8>) -> IResult<usize> {
        match self {
            SysFile::Plain(f) => Ok(f.file.read_to_end(buf)?),
            SysFile::Mmap(f) => {
                let pos = f.pos.min(f.map.len());
                buf.extend_from_slice(&f.map[pos..]);
                let n = f.map.len() - pos;
                f.pos = f.map.len();
                Ok(n)
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> IResult<usize> {
        match self {
            SysFile::Plain(f) => {
                f.file.write_all(buf)?;
                Ok(buf.len())
            }
            SysFile::Mmap(_) => Err(Error::NotSupported("write on read-only mmap file")),
        }
    }

    fn flush(&mut self) -> IResult<()> {
        match self {
            SysFile::Plain(f) => Ok(f.file.flush()?),
            SysFile::Mmap(_) => Ok(()),
        }
    }

    fn sync(&mut self) -> IResult<()> {
        match self {
            SysFile::Plain(f) => {
                f.sync_dir_if_manifest()?;
                f.file.flush()?;
                f.file.sync_data()?;
                Ok(())
            }
            SysFile::Mmap(_) => Ok(()),
        }
    }

    fn seek(&mut self, pos: SeekFrom) -> IResult<u64> {
        match self {
            SysFile::Plain(f) => Ok(f.file.seek(pos)?),
            SysFile::Mmap(f) => {
                let len = f.map.len() as i64;
                let target = match pos {
                    SeekFrom::Start(offset) => offset as i64,
                    SeekFrom::Current(delta) => f.pos as i64 + delta,
                    SeekFrom::End(delta) => len + delta,
                };
                if target < 0 {
                    return Err(Error::IO(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "seek before start of file",
                    )));
                }
                f.pos = target as usize;
                Ok(target as u64)
            }
        }
    }

    fn len(&self) -> IResult<u64> {
        match self {
            SysFile::Plain(f) => Ok(f.file.metadata()?.len()),
            SysFile::Mmap(f) => Ok(f.map.len() as u64),
        }
    }

    fn close(&mut self) -> IResult<()> {
        self.flush()
    }
}
