//! File-backed `ScsiBlockDevice` (SPEC_FULL §4.8).
//!
//! Uses `FileExt::read_at`/`write_at` rather than seek+read/seek+write so
//! concurrent I/O never races on a shared file cursor - the LU worker thread
//! is the only caller today, but the contract is written for a backend that
//! could be accessed from more than one place.

use crate::error::{IscsiError, ScsiResult};
use crate::scsi::ScsiBlockDevice;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;

/// A regular file (or block device node) used as iSCSI backing storage.
pub struct FileBackedDevice {
    file: File,
    capacity_blocks: u64,
    block_size: u32,
    read_only: bool,
}

impl FileBackedDevice {
    /// Open `path` as backing storage. `size_bytes` is the logical capacity
    /// to expose (truncating/extending the file to match, matching the
    /// config grammar's `LUN<N> <path> Size <bytes>` directive).
    pub fn open(path: &str, size_bytes: u64, block_size: u32, read_only: bool) -> ScsiResult<Self> {
        if block_size == 0 || size_bytes % block_size as u64 != 0 {
            return Err(IscsiError::Config(format!(
                "backing size {size_bytes} is not a multiple of block size {block_size}"
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .open(path)
            .map_err(IscsiError::Io)?;

        if !read_only {
            file.set_len(size_bytes).map_err(IscsiError::Io)?;
        } else {
            let actual_len = file.metadata().map_err(IscsiError::Io)?.len();
            if actual_len < size_bytes {
                return Err(IscsiError::Config(format!(
                    "read-only backing file {path} is smaller ({actual_len}) than configured size ({size_bytes})"
                )));
            }
        }

        Ok(FileBackedDevice {
            file,
            capacity_blocks: size_bytes / block_size as u64,
            block_size,
            read_only,
        })
    }
}

impl ScsiBlockDevice for FileBackedDevice {
    fn read(&self, lba: u64, blocks: u32, block_size: u32) -> ScsiResult<Vec<u8>> {
        let mut buf = vec![0u8; blocks as usize * block_size as usize];
        let offset = lba * block_size as u64;
        self.file
            .read_exact_at(&mut buf, offset)
            .map_err(|e| IscsiError::BackingStoreError(format!("read at lba {lba}: {e}")))?;
        Ok(buf)
    }

    fn write(&mut self, lba: u64, data: &[u8], block_size: u32) -> ScsiResult<()> {
        if self.read_only {
            return Err(IscsiError::BackingStoreError("device is read-only".into()));
        }
        let offset = lba * block_size as u64;
        self.file
            .write_all_at(data, offset)
            .map_err(|e| IscsiError::BackingStoreError(format!("write at lba {lba}: {e}")))
    }

    fn capacity(&self) -> u64 {
        self.capacity_blocks
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn flush(&mut self) -> ScsiResult<()> {
        self.file
            .sync_data()
            .map_err(|e| IscsiError::BackingStoreError(format!("sync: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn read_write_round_trip() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap();
        let mut dev = FileBackedDevice::open(path, 4096, 512, false).unwrap();
        assert_eq!(dev.capacity(), 8);

        let payload = vec![0x42u8; 512];
        dev.write(2, &payload, 512).unwrap();
        let read_back = dev.read(2, 1, 512).unwrap();
        assert_eq!(read_back, payload);
        dev.flush().unwrap();
    }

    #[test]
    fn rejects_size_not_multiple_of_block_size() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap();
        assert!(FileBackedDevice::open(path, 100, 512, false).is_err());
    }
}
