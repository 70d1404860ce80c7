//! Directory streams and the descriptor-to-stream table
//!
//! Directory reads go through native `DIR*` streams. A stream opened from a
//! descriptor takes that descriptor over, so closing it later must close the
//! stream, not the raw descriptor: [`DirTable`] remembers which descriptors
//! have become streams and [`close`] routes accordingly.

use crate::error::{raw_errno, set_errno, OsError, Result};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::{CStr, CString, OsStr, OsString};
use std::fs::Metadata;
use std::os::fd::RawFd;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;

/// Directory entry type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Block device
    BlockDevice,
    /// Character device
    CharDevice,
    /// Directory
    Directory,
    /// Named pipe
    Fifo,
    /// Symbolic link
    Symlink,
    /// Regular file
    Regular,
    /// Socket
    Socket,
    /// The filesystem did not say
    Unknown,
}

impl EntryKind {
    /// Decode a `d_type` byte
    pub fn from_dtype(dtype: u8) -> Self {
        match dtype {
            libc::DT_BLK => EntryKind::BlockDevice,
            libc::DT_CHR => EntryKind::CharDevice,
            libc::DT_DIR => EntryKind::Directory,
            libc::DT_FIFO => EntryKind::Fifo,
            libc::DT_LNK => EntryKind::Symlink,
            libc::DT_REG => EntryKind::Regular,
            libc::DT_SOCK => EntryKind::Socket,
            _ => EntryKind::Unknown,
        }
    }
}

/// One directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// File name (never "." or "..")
    pub name: OsString,
    /// Type tag
    pub kind: EntryKind,
}

/// Result of reading one entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The next entry
    Entry(DirEntry),
    /// No more entries
    End,
}

fn is_dot(name: &[u8]) -> bool {
    name == b"." || name == b".."
}

/// An open native directory stream.
pub struct DirStream {
    dir: NonNull<libc::DIR>,
}

// SAFETY: a DIR* may move between threads; access is serialized by &mut
unsafe impl Send for DirStream {}

impl DirStream {
    /// Open `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let c_path = CString::new(path.as_ref().as_os_str().as_bytes())
            .map_err(|_| OsError::InteriorNul("directory path"))?;
        // SAFETY: c_path is NUL-terminated
        let dir = unsafe { libc::opendir(c_path.as_ptr()) };
        NonNull::new(dir)
            .map(|dir| DirStream { dir })
            .ok_or_else(|| OsError::last("opendir"))
    }

    /// Turn an open directory descriptor into a stream. The stream owns
    /// `fd` from here on.
    pub fn from_fd(fd: RawFd) -> Result<Self> {
        // SAFETY: fdopendir validates fd itself
        let dir = unsafe { libc::fdopendir(fd) };
        NonNull::new(dir)
            .map(|dir| DirStream { dir })
            .ok_or_else(|| OsError::last("fdopendir"))
    }

    /// Descriptor underlying the stream
    pub fn fd(&self) -> RawFd {
        // SAFETY: self.dir is an open stream
        unsafe { libc::dirfd(self.dir.as_ptr()) }
    }

    /// Read the next entry other than "." and "..".
    pub fn read_entry(&mut self) -> Result<ReadOutcome> {
        loop {
            set_errno(0);
            // SAFETY: self.dir is an open stream owned exclusively here
            let ent = unsafe { libc::readdir(self.dir.as_ptr()) };
            if ent.is_null() {
                let errno = raw_errno();
                if errno != 0 {
                    return Err(OsError::from_errno("readdir", errno));
                }
                return Ok(ReadOutcome::End);
            }
            // SAFETY: readdir returned a valid entry that stays valid until
            // the next call on this stream
            let (name, dtype) = unsafe {
                let ent = &*ent;
                (CStr::from_ptr(ent.d_name.as_ptr()).to_bytes(), ent.d_type)
            };
            if is_dot(name) {
                continue;
            }
            return Ok(ReadOutcome::Entry(DirEntry {
                name: OsString::from_vec(name.to_vec()),
                kind: EntryKind::from_dtype(dtype),
            }));
        }
    }
}

impl Iterator for DirStream {
    type Item = Result<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_entry() {
            Ok(ReadOutcome::Entry(e)) => Some(Ok(e)),
            Ok(ReadOutcome::End) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

impl Drop for DirStream {
    fn drop(&mut self) {
        // SAFETY: the stream is open and owned by us
        unsafe {
            libc::closedir(self.dir.as_ptr());
        }
    }
}

/// All entries of `path`
pub fn read_dir(path: impl AsRef<Path>) -> Result<Vec<DirEntry>> {
    DirStream::open(path)?.collect()
}

/// Entries of `path` paired with their `lstat` metadata. Entries removed
/// between the read and the stat are skipped.
pub fn entries_with_metadata(path: impl AsRef<Path>) -> Result<Vec<(DirEntry, Metadata)>> {
    let path = path.as_ref();
    let mut out = Vec::new();
    for entry in DirStream::open(path)? {
        let entry = entry?;
        match std::fs::symlink_metadata(path.join(&entry.name)) {
            Ok(meta) => out.push((entry, meta)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(out)
}

/// Descriptors that have been turned into directory streams.
///
/// The table lock covers lookup and insertion only; each stream has its
/// own lock for the actual read.
#[derive(Default)]
pub struct DirTable {
    streams: Mutex<HashMap<RawFd, Arc<Mutex<DirStream>>>>,
}

static DIR_TABLE: Lazy<DirTable> = Lazy::new(DirTable::default);

/// The process-wide table
pub fn dir_table() -> &'static DirTable {
    &DIR_TABLE
}

impl DirTable {
    fn stream(&self, fd: RawFd) -> Result<Arc<Mutex<DirStream>>> {
        let mut streams = self.streams.lock();
        if let Some(stream) = streams.get(&fd) {
            return Ok(stream.clone());
        }
        let stream = Arc::new(Mutex::new(DirStream::from_fd(fd)?));
        streams.insert(fd, stream.clone());
        Ok(stream)
    }

    /// True if `fd` is tracked as a directory stream
    pub fn contains(&self, fd: RawFd) -> bool {
        self.streams.lock().contains_key(&fd)
    }

    /// Close `fd`, closing its stream instead when it has one.
    pub fn close(&self, fd: RawFd) -> Result<()> {
        let stream = self.streams.lock().remove(&fd);
        match stream {
            // Dropping the last reference runs closedir
            Some(stream) => {
                drop(stream);
                Ok(())
            }
            None => {
                // SAFETY: closing a caller-owned descriptor
                if unsafe { libc::close(fd) } != 0 {
                    return Err(OsError::last("close"));
                }
                Ok(())
            }
        }
    }

    /// Copy the next entry name of directory `fd`, NUL-terminated and
    /// truncated to `buf`, into `buf`. Returns the bytes written, 0 at end.
    ///
    /// An empty `buf` fails with `EINVAL` and leaves the stream where it was.
    pub fn read_dirent(&self, fd: RawFd, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Err(OsError::from_errno("readdir", libc::EINVAL));
        }
        let stream = self.stream(fd)?;
        let outcome = stream.lock().read_entry()?;
        let ReadOutcome::Entry(entry) = outcome else {
            return Ok(0);
        };
        let name = entry.name.as_bytes();
        let n = (name.len() + 1).min(buf.len());
        let copied = n.min(name.len());
        buf[..copied].copy_from_slice(&name[..copied]);
        if n > copied {
            buf[copied] = 0;
        }
        Ok(n)
    }
}

/// Close `fd` through the process-wide table
pub fn close(fd: RawFd) -> Result<()> {
    dir_table().close(fd)
}

/// [`DirTable::read_dirent`] on the process-wide table
pub fn read_dirent(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    dir_table().read_dirent(fd, buf)
}

/// Parse one name written by [`read_dirent`], looking at no more than `max`
/// bytes when given. Returns `(consumed, count)`.
pub fn parse_dirent(buf: &[u8], max: Option<usize>, names: &mut Vec<OsString>) -> (usize, usize) {
    let limit = max.map_or(buf.len(), |m| m.min(buf.len()));
    if limit == 0 {
        return (0, 0);
    }
    let window = &buf[..limit];
    let (name, consumed) = match window.iter().position(|&c| c == 0) {
        Some(nul) => (&window[..nul], nul + 1),
        None => (window, limit),
    };
    if is_dot(name) {
        return (consumed, 0);
    }
    names.push(OsStr::from_bytes(name).to_os_string());
    (consumed, 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::os::fd::IntoRawFd;

    #[test]
    fn test_dtype_mapping() {
        assert_eq!(EntryKind::from_dtype(libc::DT_DIR), EntryKind::Directory);
        assert_eq!(EntryKind::from_dtype(libc::DT_REG), EntryKind::Regular);
        assert_eq!(EntryKind::from_dtype(libc::DT_UNKNOWN), EntryKind::Unknown);
    }

    #[test]
    fn test_read_dir_skips_dot_entries() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a"), b"").unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();

        let names: BTreeSet<_> = read_dir(tmp.path())
            .unwrap()
            .into_iter()
            .map(|e| e.name.into_string().unwrap())
            .collect();
        assert_eq!(names, BTreeSet::from(["a".to_string(), "sub".to_string()]));
    }

    #[test]
    fn test_missing_directory() {
        let err = read_dir("/nonexistent/raya-os-dir").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_parse_dirent() {
        let mut names = Vec::new();
        assert_eq!(parse_dirent(b"abc\0zz", None, &mut names), (4, 1));
        assert_eq!(parse_dirent(b"abc\0", Some(2), &mut names), (2, 1));
        assert_eq!(parse_dirent(b"", None, &mut names), (0, 0));
        assert_eq!(names, vec![OsString::from("abc"), OsString::from("ab")]);
    }

    #[test]
    fn test_read_dirent_through_table_and_close() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("only"), b"").unwrap();
        let fd = std::fs::File::open(tmp.path()).unwrap().into_raw_fd();

        let mut buf = [0u8; 64];
        let n = read_dirent(fd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"only\0");
        assert!(dir_table().contains(fd));
        assert_eq!(read_dirent(fd, &mut buf).unwrap(), 0);

        close(fd).unwrap();
        assert!(!dir_table().contains(fd));
    }

    #[test]
    fn test_read_dirent_truncates() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("longname"), b"").unwrap();
        let fd = std::fs::File::open(tmp.path()).unwrap().into_raw_fd();

        let mut buf = [0u8; 4];
        assert_eq!(read_dirent(fd, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"long");
        close(fd).unwrap();
    }

    #[test]
    fn test_read_dirent_empty_buffer_keeps_entry() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("only"), b"").unwrap();
        let fd = std::fs::File::open(tmp.path()).unwrap().into_raw_fd();

        let err = read_dirent(fd, &mut []).unwrap_err();
        assert_eq!(err.errno(), Some(libc::EINVAL));

        let mut buf = [0u8; 64];
        let n = read_dirent(fd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"only\0");
        close(fd).unwrap();
    }
}
