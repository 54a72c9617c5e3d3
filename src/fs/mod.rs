//! Flat filesystem: a single namespace of fixed-size byte files, loaded
//! from the boot disk image at startup and kept in memory. The core only
//! sees it through `FileSys` and `FileHandle`; syscalls serialize every
//! operation behind `FS_LOCK`.

pub mod file;

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
pub use file::{FileHandle, Inode};
use lazy_static::lazy_static;
use spin::Mutex;

use crate::threads::sync::Lock;

const FS_MAGIC: &[u8; 4] = b"FFS1";
const DIR_ENTRY_SIZE: usize = 32;
const NAME_LEN: usize = 24;
const SECTOR_SIZE: usize = 512;

pub struct FileSys {
    files: Mutex<BTreeMap<String, Arc<Inode>>>,
}

impl FileSys {
    pub fn new() -> FileSys {
        FileSys {
            files: Mutex::new(BTreeMap::new()),
        }
    }

    /// Create an empty file of `size` zero bytes. Empty names and
    /// duplicates fail.
    pub fn create(&self, name: &str, size: u64) -> bool {
        if name.is_empty() {
            return false;
        }
        let mut files = self.files.lock();
        if files.contains_key(name) {
            return false;
        }
        files.insert(String::from(name), Inode::with_data(vec![0u8; size as usize]));
        true
    }

    /// Drop a file from the namespace. Open handles keep the contents
    /// alive until they close.
    pub fn remove(&self, name: &str) -> bool {
        self.files.lock().remove(name).is_some()
    }

    pub fn open(&self, name: &str) -> Option<FileHandle> {
        let files = self.files.lock();
        files.get(name).map(|inode| FileHandle::new(inode.clone()))
    }

    fn install(&self, name: String, inode: Arc<Inode>) {
        self.files.lock().insert(name, inode);
    }
}

impl Default for FileSys {
    fn default() -> Self {
        FileSys::new()
    }
}

lazy_static! {
    pub static ref FILESYS: FileSys = FileSys::new();
    /// The single global filesystem lock. Every filesystem-touching
    /// syscall and the executable loader hold it across their I/O.
    pub static ref FS_LOCK: Lock<()> = Lock::new(());
}

/// Populate the filesystem from the boot disk, if one carries our flat
/// directory format: sector 0 holds the magic and entry count followed by
/// 32-byte entries (24-byte name, start sector, byte length).
pub fn init() {
    let mut sector = [0u8; SECTOR_SIZE];
    if !crate::drivers::ata::fs_read(0, &mut sector) {
        crate::log_warn!("fs: no boot disk, starting empty");
        return;
    }
    if &sector[0..4] != FS_MAGIC {
        crate::log_warn!("fs: boot disk has no filesystem, starting empty");
        return;
    }
    let count = u32::from_le_bytes(sector[4..8].try_into().unwrap()) as usize;
    let mut loaded = 0;
    for i in 0..count {
        let base = 8 + i * DIR_ENTRY_SIZE;
        if base + DIR_ENTRY_SIZE > SECTOR_SIZE {
            break;
        }
        let entry = &sector[base..base + DIR_ENTRY_SIZE];
        let name_end = entry[..NAME_LEN].iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        let Ok(name) = core::str::from_utf8(&entry[..name_end]) else {
            continue;
        };
        let start = u32::from_le_bytes(entry[24..28].try_into().unwrap()) as u64;
        let length = u32::from_le_bytes(entry[28..32].try_into().unwrap()) as usize;

        let mut data = vec![0u8; length.div_ceil(SECTOR_SIZE) * SECTOR_SIZE];
        if !crate::drivers::ata::fs_read(start, &mut data) {
            crate::log_warn!("fs: failed to read '{}'", name);
            continue;
        }
        data.truncate(length);
        FILESYS.install(String::from(name), Inode::with_data(data));
        loaded += 1;
    }
    crate::log_info!("fs: {} files loaded from boot disk", loaded);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_open_roundtrip() {
        let fs = FileSys::new();
        assert!(fs.create("alpha", 8));
        let mut f = fs.open("alpha").unwrap();
        assert_eq!(f.len(), 8);
        assert_eq!(f.write(b"12345678"), 8);
        let mut buf = [0u8; 8];
        assert_eq!(f.read_at(&mut buf, 0), 8);
        assert_eq!(&buf, b"12345678");
    }

    #[test]
    fn create_rejects_empty_and_duplicate_names() {
        let fs = FileSys::new();
        assert!(!fs.create("", 4));
        assert!(fs.create("x", 4));
        assert!(!fs.create("x", 4));
    }

    #[test]
    fn remove_keeps_open_handles_alive() {
        let fs = FileSys::new();
        fs.create("gone", 4);
        let mut f = fs.open("gone").unwrap();
        f.write(b"data");
        assert!(fs.remove("gone"));
        assert!(fs.open("gone").is_none());
        assert!(!fs.remove("gone"));

        let mut buf = [0u8; 4];
        assert_eq!(f.read_at(&mut buf, 0), 4);
        assert_eq!(&buf, b"data");
    }
}
