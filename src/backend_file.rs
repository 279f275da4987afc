//! `BlockBackend` implementation backed by a plain host file, opened
//! read-write and accessed by absolute offset so concurrent reads/writes
//! from different worker threads don't disturb a shared cursor.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::sync::Mutex;

use crate::virtio_blk::{BlockBackend, SECTOR_SIZE};

pub struct FileBlockBackend {
    file: Mutex<File>,
    sector_count: u64,
}

impl FileBlockBackend {
    pub fn open(path: &str) -> Result<FileBlockBackend, Box<dyn std::error::Error>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| format!("opening block image {}: {}", path, e))?;
        let len = file.metadata()?.len();
        Ok(FileBlockBackend {
            file: Mutex::new(file),
            sector_count: len / SECTOR_SIZE,
        })
    }
}

impl BlockBackend for FileBlockBackend {
    fn sector_count(&self) -> u64 {
        self.sector_count
    }

    fn read_sectors(&self, sector: u64, buf: &mut [u8]) -> bool {
        let file = self.file.lock().unwrap();
        file.read_exact_at(buf, sector * SECTOR_SIZE).is_ok()
    }

    fn write_sectors(&self, sector: u64, buf: &[u8]) -> bool {
        let file = self.file.lock().unwrap();
        file.write_all_at(buf, sector * SECTOR_SIZE).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_after_write_round_trips() {
        let path = format!("/tmp/microvmm-test-blk-{}", std::process::id());
        {
            let f = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
                .unwrap();
            f.set_len(SECTOR_SIZE * 4).unwrap();
        }

        let backend = FileBlockBackend::open(&path).unwrap();
        assert_eq!(backend.sector_count(), 4);

        let data = vec![0xAB; SECTOR_SIZE as usize];
        assert!(backend.write_sectors(1, &data));

        let mut out = vec![0u8; SECTOR_SIZE as usize];
        assert!(backend.read_sectors(1, &mut out));
        assert_eq!(out, data);

        let _ = std::fs::remove_file(&path);
    }
}
