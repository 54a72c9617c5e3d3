use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

/// Flat-file contents plus the write-deny count shared by every handle.
/// Files never grow past their create-time size.
pub struct Inode {
    data: Mutex<Vec<u8>>,
    deny_write: AtomicUsize,
}

impl Inode {
    pub fn with_data(data: Vec<u8>) -> Arc<Inode> {
        Arc::new(Inode {
            data: Mutex::new(data),
            deny_write: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> u64 {
        self.data.lock().len() as u64
    }

    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        let data = self.data.lock();
        if offset >= data.len() as u64 {
            return 0;
        }
        let start = offset as usize;
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        n
    }

    pub fn write_at(&self, buf: &[u8], offset: u64) -> usize {
        if self.deny_write.load(Ordering::Acquire) > 0 {
            return 0;
        }
        let mut data = self.data.lock();
        if offset >= data.len() as u64 {
            return 0;
        }
        let start = offset as usize;
        let n = buf.len().min(data.len() - start);
        data[start..start + n].copy_from_slice(&buf[..n]);
        n
    }
}

/// An open file: shared inode plus a private position and deny-write
/// stake. Handles are never implicitly shared; `reopen` and `duplicate`
/// make new ones.
pub struct FileHandle {
    inode: Arc<Inode>,
    pos: u64,
    deny: bool,
}

impl FileHandle {
    pub fn new(inode: Arc<Inode>) -> FileHandle {
        FileHandle {
            inode,
            pos: 0,
            deny: false,
        }
    }

    pub fn len(&self) -> u64 {
        self.inode.len()
    }

    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = self.inode.read_at(buf, self.pos);
        self.pos += n as u64;
        n
    }

    pub fn write(&mut self, buf: &[u8]) -> usize {
        let n = self.inode.write_at(buf, self.pos);
        self.pos += n as u64;
        n
    }

    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        self.inode.read_at(buf, offset)
    }

    pub fn write_at(&self, buf: &[u8], offset: u64) -> usize {
        self.inode.write_at(buf, offset)
    }

    pub fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    pub fn tell(&self) -> u64 {
        self.pos
    }

    /// Fresh handle on the same inode, position zero. Used by mmap so the
    /// mapping survives the original fd being closed.
    pub fn reopen(&self) -> FileHandle {
        FileHandle::new(self.inode.clone())
    }

    /// Exact copy, position and deny stake included. Used by fork.
    pub fn duplicate(&self) -> FileHandle {
        let mut copy = FileHandle {
            inode: self.inode.clone(),
            pos: self.pos,
            deny: false,
        };
        if self.deny {
            copy.deny_write();
        }
        copy
    }

    /// Block writes to the underlying inode (from every handle) until
    /// this handle allows them again or is dropped.
    pub fn deny_write(&mut self) {
        if !self.deny {
            self.deny = true;
            self.inode.deny_write.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn allow_write(&mut self) {
        if self.deny {
            self.deny = false;
            self.inode.deny_write.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        self.allow_write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn read_write_advance_position() {
        let inode = Inode::with_data(vec![0u8; 16]);
        let mut f = FileHandle::new(inode);
        assert_eq!(f.write(b"hello"), 5);
        assert_eq!(f.tell(), 5);
        f.seek(0);
        let mut buf = [0u8; 5];
        assert_eq!(f.read(&mut buf), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn files_do_not_grow() {
        let inode = Inode::with_data(vec![0u8; 4]);
        let mut f = FileHandle::new(inode);
        assert_eq!(f.write(b"abcdef"), 4);
        assert_eq!(f.write(b"x"), 0);
        assert_eq!(f.len(), 4);
    }

    #[test]
    fn reads_past_eof_return_zero() {
        let inode = Inode::with_data(vec![7u8; 4]);
        let f = FileHandle::new(inode);
        let mut buf = [0u8; 8];
        assert_eq!(f.read_at(&mut buf, 4), 0);
        assert_eq!(f.read_at(&mut buf, 2), 2);
    }

    #[test]
    fn deny_write_blocks_every_handle_until_released() {
        let inode = Inode::with_data(vec![0u8; 8]);
        let mut exec_handle = FileHandle::new(inode.clone());
        let mut other = FileHandle::new(inode);

        exec_handle.deny_write();
        assert_eq!(other.write(b"hi"), 0);

        drop(exec_handle); // drop releases the stake
        assert_eq!(other.write(b"hi"), 2);
    }

    #[test]
    fn duplicate_carries_position_and_deny() {
        let inode = Inode::with_data(vec![0u8; 8]);
        let mut f = FileHandle::new(inode.clone());
        f.seek(3);
        f.deny_write();

        let dup = f.duplicate();
        assert_eq!(dup.tell(), 3);

        // Both handles hold a deny stake; dropping one is not enough.
        drop(f);
        let mut other = FileHandle::new(inode);
        assert_eq!(other.write(b"y"), 0);
        drop(dup);
        assert_eq!(other.write(b"y"), 1);
    }

    #[test]
    fn reopen_resets_position() {
        let inode = Inode::with_data(vec![1u8; 8]);
        let mut f = FileHandle::new(inode);
        f.seek(6);
        let r = f.reopen();
        assert_eq!(r.tell(), 0);
        assert_eq!(r.len(), 8);
    }
}
