pub mod pio;

use lazy_static::lazy_static;
use pio::AtaDevice;
use spin::Mutex;

lazy_static! {
    /// Primary master: the boot/filesystem disk.
    pub static ref FS_DISK: Mutex<AtaDevice> = Mutex::new(AtaDevice::new(0x1F0, 0x3F6, true));
    /// Secondary master: the swap disk.
    pub static ref SWAP_DISK: Mutex<AtaDevice> = Mutex::new(AtaDevice::new(0x170, 0x376, true));
}

pub fn init() {
    {
        let mut dev = FS_DISK.lock();
        match dev.identify() {
            Ok(()) => crate::log_info!("ata: filesystem disk, {} sectors", dev.sectors),
            Err(e) => crate::log_warn!("ata: no filesystem disk ({})", e),
        }
    }
    {
        let mut dev = SWAP_DISK.lock();
        match dev.identify() {
            Ok(()) => crate::log_info!("ata: swap disk, {} sectors", dev.sectors),
            Err(e) => crate::log_warn!("ata: no swap disk ({})", e),
        }
    }
}

/// Capacity of the swap disk, zero when absent.
pub fn swap_disk_sectors() -> u64 {
    let dev = SWAP_DISK.lock();
    if dev.detected {
        dev.sectors as u64
    } else {
        0
    }
}

pub fn swap_read(sector: u64, buf: &mut [u8]) {
    SWAP_DISK
        .lock()
        .read_sectors(sector as u32, buf)
        .expect("swap disk read failed");
}

pub fn swap_write(sector: u64, buf: &[u8]) {
    SWAP_DISK
        .lock()
        .write_sectors(sector as u32, buf)
        .expect("swap disk write failed");
}

/// Filesystem disk read; false when the disk is absent or errors.
pub fn fs_read(sector: u64, buf: &mut [u8]) -> bool {
    FS_DISK.lock().read_sectors(sector as u32, buf).is_ok()
}
