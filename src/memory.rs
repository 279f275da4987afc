//! Guest physical memory: a single anonymous host mapping plus the small
//! bookkeeping needed to translate guest physical addresses into host
//! pointers and to copy across the 4 KiB boundaries VIRTIO's ring format
//! cares about.

use std::error::Error;
use std::ptr;

/// One contiguous guest-physical region backed by host memory.
///
/// Only a single region is ever created (see `GuestMemory::new`); the
/// region list exists because the transport's translation contract
/// (`translate`) is specified against an ordered, non-overlapping sequence
/// of regions rather than a single range, which is what a multi-region
/// memory map (e.g. MMIO holes) would need.
struct Region {
    guest_addr: u64,
    size: usize,
    host_base: *mut u8,
}

/// Guest RAM, mmap'd once at VM creation and released on drop.
pub struct GuestMemory {
    regions: Vec<Region>,
}

unsafe impl Send for GuestMemory {}
unsafe impl Sync for GuestMemory {}

const PAGE_SIZE: usize = 4096;

impl GuestMemory {
    /// Anonymously maps `size` bytes of guest RAM, matching the original
    /// hypervisor's `MAP_PRIVATE | MAP_ANONYMOUS | MAP_NORESERVE` mapping.
    pub fn new(size: usize) -> Result<GuestMemory, Box<dyn Error>> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(format!(
                "failed to mmap guest memory. Errno: {}",
                std::io::Error::last_os_error()
            )
            .into());
        }

        Ok(GuestMemory {
            regions: vec![Region {
                guest_addr: 0,
                size,
                host_base: ptr as *mut u8,
            }],
        })
    }

    pub fn size(&self) -> usize {
        self.regions.iter().map(|r| r.size).sum()
    }

    /// Host virtual address backing the guest's page-zero mapping; used by
    /// the boot loader to place the zeropage, cmdline, kernel and initrd
    /// directly without going through `translate` for every byte.
    pub fn host_base(&self) -> *mut u8 {
        self.regions[0].host_base
    }

    /// Translates `(gpa, len)` into a host pointer, failing if the range
    /// isn't entirely contained in one region.
    fn translate(&self, gpa: u64, len: usize) -> Option<*mut u8> {
        for region in &self.regions {
            if gpa >= region.guest_addr {
                let offset = gpa - region.guest_addr;
                if offset as usize + len <= region.size {
                    return Some(unsafe { region.host_base.add(offset as usize) });
                }
            }
        }
        None
    }

    /// Copies `buf.len()` bytes from guest memory starting at `gpa`,
    /// splitting the copy at 4 KiB boundaries the way a real MMU would.
    pub fn read(&self, gpa: u64, buf: &mut [u8]) -> Result<(), ()> {
        let mut off = 0usize;
        let mut addr = gpa;
        while off < buf.len() {
            let chunk = std::cmp::min(buf.len() - off, PAGE_SIZE - (addr as usize & (PAGE_SIZE - 1)));
            let ptr = self.translate(addr, chunk).ok_or(())?;
            unsafe { ptr::copy_nonoverlapping(ptr, buf[off..].as_mut_ptr(), chunk) };
            off += chunk;
            addr += chunk as u64;
        }
        Ok(())
    }

    /// Symmetric counterpart of `read`.
    pub fn write(&self, gpa: u64, buf: &[u8]) -> Result<(), ()> {
        let mut off = 0usize;
        let mut addr = gpa;
        while off < buf.len() {
            let chunk = std::cmp::min(buf.len() - off, PAGE_SIZE - (addr as usize & (PAGE_SIZE - 1)));
            let ptr = self.translate(addr, chunk).ok_or(())?;
            unsafe { ptr::copy_nonoverlapping(buf[off..].as_ptr(), ptr, chunk) };
            off += chunk;
            addr += chunk as u64;
        }
        Ok(())
    }

    /// Reads a little-endian `u16` at `gpa`. Out-of-range reads return 0,
    /// matching the transport's "no RAM at this address" behavior.
    pub fn read_u16(&self, gpa: u64) -> u16 {
        let mut buf = [0u8; 2];
        if self.read(gpa, &mut buf).is_ok() {
            u16::from_le_bytes(buf)
        } else {
            0
        }
    }

    pub fn write_u16(&self, gpa: u64, val: u16) {
        let _ = self.write(gpa, &val.to_le_bytes());
    }

    pub fn read_u32(&self, gpa: u64) -> u32 {
        let mut buf = [0u8; 4];
        if self.read(gpa, &mut buf).is_ok() {
            u32::from_le_bytes(buf)
        } else {
            0
        }
    }

    pub fn write_u32(&self, gpa: u64, val: u32) {
        let _ = self.write(gpa, &val.to_le_bytes());
    }

    /// Direct byte-slice view of guest memory, used by the boot loader to
    /// place the zeropage/cmdline/kernel/initrd in one shot. Panics like a
    /// host mmap write would if `gpa+len` runs past the mapping, since
    /// these call sites are all setup-time and a failure there is fatal
    /// anyway.
    pub fn slice_mut(&self, gpa: u64, len: usize) -> &mut [u8] {
        let ptr = self
            .translate(gpa, len)
            .expect("boot loader wrote past guest memory bounds");
        unsafe { std::slice::from_raw_parts_mut(ptr, len) }
    }
}

impl Drop for GuestMemory {
    fn drop(&mut self) {
        for region in &self.regions {
            unsafe {
                libc::munmap(region.host_base as *mut libc::c_void, region.size);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_round_trip() {
        let mem = GuestMemory::new(1 << 20).unwrap();
        mem.write_u32(0x1000, 0xdead_beef);
        assert_eq!(mem.read_u32(0x1000), 0xdead_beef);
    }

    #[test]
    fn out_of_range_read_is_zero() {
        let mem = GuestMemory::new(4096).unwrap();
        assert_eq!(mem.read_u32(1 << 30), 0);
    }

    #[test]
    fn copy_across_page_boundary() {
        let mem = GuestMemory::new(2 * PAGE_SIZE).unwrap();
        let data: Vec<u8> = (0..16u8).collect();
        let gpa = (PAGE_SIZE - 8) as u64;
        mem.write(gpa, &data).unwrap();
        let mut out = vec![0u8; 16];
        mem.read(gpa, &mut out).unwrap();
        assert_eq!(out, data);
    }
}
