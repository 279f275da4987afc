//! VIRTIO block device (DeviceID=2): request parsing, at-most-one-in-flight
//! dispatch onto the worker pool, and completion hand-off.
//!
//! Grounded in `original_source/blkdev.c`'s `block_io_worker_fn` and
//! `mvvm_init_virtio_blk`.

use std::convert::TryInto;
use std::sync::{Arc, Mutex};

use crate::irq::IrqLine;
use crate::memory::GuestMemory;
use crate::threadpool::WorkerPool;
use crate::virtio_mmio::{VirtioDevice, WriteEffect};
use crate::virtqueue::{self, memcpy_from_queue, memcpy_to_queue};

pub const SECTOR_SIZE: u64 = 512;

const REQ_TYPE_IN: u32 = 0;
const REQ_TYPE_OUT: u32 = 1;
const REQ_TYPE_FLUSH: u32 = 4;
const REQ_TYPE_FLUSH_OUT: u32 = 5;

const STATUS_OK: u8 = 0;
const STATUS_IOERR: u8 = 1;
const STATUS_UNSUPP: u8 = 2;

const HEADER_SIZE: u32 = 16;
const QUEUE_IDX: usize = 0;

/// The host-side storage contract. Implementations run synchronously on a
/// worker-pool thread; partial I/O is reported as failure rather than a
/// short count, per the "partial I/O counts as failure" rule.
pub trait BlockBackend: Send + Sync {
    fn sector_count(&self) -> u64;
    fn read_sectors(&self, sector: u64, buf: &mut [u8]) -> bool;
    fn write_sectors(&self, sector: u64, buf: &[u8]) -> bool;
}

pub struct BlockDevice {
    pub mmio: VirtioDevice,
    mem: Arc<GuestMemory>,
    backend: Arc<dyn BlockBackend>,
    pool: Arc<WorkerPool>,
    in_progress: Mutex<bool>,
}

impl BlockDevice {
    pub fn new(
        mem: Arc<GuestMemory>,
        backend: Arc<dyn BlockBackend>,
        pool: Arc<WorkerPool>,
        irq: IrqLine,
    ) -> BlockDevice {
        let mmio = VirtioDevice::new(2, 0, 8, irq);
        let sectors = backend.sector_count();
        mmio.set_config_u32(0, sectors as u32);
        mmio.set_config_u32(4, (sectors >> 32) as u32);
        BlockDevice {
            mmio,
            mem,
            backend,
            pool,
            in_progress: Mutex::new(false),
        }
    }

    pub fn mmio_read(&self, offset: u64, access_size: u32) -> u32 {
        self.mmio.mmio_read(offset, access_size)
    }

    pub fn mmio_write(self: &Arc<Self>, offset: u64, access_size: u32, val: u32) {
        if let WriteEffect::QueueNotify(idx) = self.mmio.mmio_write(offset, access_size, val) {
            if idx as usize == QUEUE_IDX {
                self.drain_queue();
            }
        }
    }

    fn drain_queue(self: &Arc<Self>) {
        let mem = Arc::clone(&self.mem);
        let mut qs = self.mmio.queue_state(QUEUE_IDX);
        let dev = Arc::clone(self);
        virtqueue::queue_notify(&mem, &mut qs, move |head, read_size, write_size| {
            dev.clone().dispatch(head, read_size, write_size)
        });
        self.mmio.set_queue_state(QUEUE_IDX, qs);
    }

    fn dispatch(self: Arc<Self>, head: u16, read_size: u32, write_size: u32) -> Result<(), ()> {
        {
            let mut busy = self.in_progress.lock().unwrap();
            if *busy {
                return Err(());
            }
            *busy = true;
        }

        let qs = self.mmio.queue_state(QUEUE_IDX);
        let mut hdr = [0u8; HEADER_SIZE as usize];
        if memcpy_from_queue(&self.mem, &qs, head, 0, &mut hdr).is_err() {
            *self.in_progress.lock().unwrap() = false;
            return Ok(());
        }
        let req_type = u32::from_le_bytes(hdr[0..4].try_into().unwrap());
        let sector_num = u64::from_le_bytes(hdr[8..16].try_into().unwrap());

        match req_type {
            REQ_TYPE_IN => {
                let buf_len = write_size as usize;
                let dev = Arc::clone(&self);
                let ok = self.pool.run(Box::new(move || {
                    let mut buf = vec![0u8; buf_len];
                    let ok = dev.backend.read_sectors(sector_num, &mut buf[..buf_len - 1]);
                    buf[buf_len - 1] = if ok { STATUS_OK } else { STATUS_IOERR };
                    dev.finish_request(head, &buf);
                }));
                if ok.is_err() {
                    self.finish_request(head, &[STATUS_IOERR]);
                }
            }
            REQ_TYPE_OUT => {
                let data_len = (read_size - HEADER_SIZE) as usize;
                let mut buf = vec![0u8; data_len];
                if memcpy_from_queue(&self.mem, &qs, head, HEADER_SIZE, &mut buf).is_err() {
                    self.finish_request(head, &[STATUS_IOERR]);
                } else {
                    let dev = Arc::clone(&self);
                    let ok = self.pool.run(Box::new(move || {
                        let ok = dev.backend.write_sectors(sector_num, &buf);
                        let status = if ok { STATUS_OK } else { STATUS_IOERR };
                        dev.finish_request(head, &[status]);
                    }));
                    if ok.is_err() {
                        self.finish_request(head, &[STATUS_IOERR]);
                    }
                }
            }
            REQ_TYPE_FLUSH | REQ_TYPE_FLUSH_OUT => {
                self.finish_request(head, &[STATUS_OK]);
            }
            _ => {
                self.finish_request(head, &[STATUS_UNSUPP]);
            }
        }
        Ok(())
    }

    /// Writes `result` into the chain's write phase, consumes the
    /// descriptor, raises the interrupt, clears the in-flight flag, and
    /// restarts draining in case more heads queued up while busy.
    fn finish_request(self: &Arc<Self>, head: u16, result: &[u8]) {
        let qs = self.mmio.queue_state(QUEUE_IDX);
        let _ = memcpy_to_queue(&self.mem, &qs, head, 0, result);
        virtqueue::consume_desc(&self.mem, &qs, head, result.len() as u32);
        self.mmio.raise_used_ring_irq();

        *self.in_progress.lock().unwrap() = false;
        self.drain_queue();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct MemBackend {
        data: StdMutex<Vec<u8>>,
    }

    impl BlockBackend for MemBackend {
        fn sector_count(&self) -> u64 {
            self.data.lock().unwrap().len() as u64 / SECTOR_SIZE
        }
        fn read_sectors(&self, sector: u64, buf: &mut [u8]) -> bool {
            let data = self.data.lock().unwrap();
            let off = (sector * SECTOR_SIZE) as usize;
            if off + buf.len() > data.len() {
                return false;
            }
            buf.copy_from_slice(&data[off..off + buf.len()]);
            true
        }
        fn write_sectors(&self, sector: u64, buf: &[u8]) -> bool {
            let mut data = self.data.lock().unwrap();
            let off = (sector * SECTOR_SIZE) as usize;
            if off + buf.len() > data.len() {
                return false;
            }
            data[off..off + buf.len()].copy_from_slice(buf);
            true
        }
    }

    fn wait_for_used(mem: &GuestMemory, used_addr: u64, want: u16) {
        for _ in 0..1000 {
            if mem.read_u16(used_addr + 2) >= want {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        panic!("timed out waiting for used-ring completion");
    }

    fn make_device() -> Arc<BlockDevice> {
        let mem = Arc::new(GuestMemory::new(1 << 20).unwrap());
        let backend: Arc<dyn BlockBackend> = Arc::new(MemBackend {
            data: StdMutex::new((0..512u32).map(|b| (b % 256) as u8).collect()),
        });
        let pool = Arc::new(WorkerPool::new(2));
        Arc::new(BlockDevice::new(mem, backend, pool, IrqLine::noop()))
    }

    fn write_desc(mem: &GuestMemory, base: u64, idx: u16, addr: u64, len: u32, flags: u16, next: u16) {
        let d = base + idx as u64 * 16;
        let _ = mem.write(d, &addr.to_le_bytes());
        mem.write_u32(d + 8, len);
        mem.write_u16(d + 12, flags);
        mem.write_u16(d + 14, next);
    }

    #[test]
    fn config_space_reports_sector_count() {
        let dev = make_device();
        assert_eq!(dev.mmio.config_u32(0), 1);
    }

    #[test]
    fn read_request_round_trips_and_sets_status_ok() {
        let dev = make_device();
        let mem = Arc::clone(&dev.mem);

        let desc_addr = 0x1000u64;
        let avail_addr = 0x2000u64;
        let used_addr = 0x3000u64;
        let mut qs = dev.mmio.queue_state(QUEUE_IDX);
        qs.ready = true;
        qs.num = 4;
        qs.desc_addr = desc_addr;
        qs.avail_addr = avail_addr;
        qs.used_addr = used_addr;
        dev.mmio.set_queue_state(QUEUE_IDX, qs);

        // header descriptor (read-only): type=IN(0), ioprio=0, sector_num=0
        write_desc(&mem, desc_addr, 0, 0x5000, HEADER_SIZE, 1 /* NEXT */, 1);
        let mut hdr = [0u8; HEADER_SIZE as usize];
        hdr[8..16].copy_from_slice(&0u64.to_le_bytes());
        let _ = mem.write(0x5000, &hdr);

        // write-phase descriptor: 512 data bytes + 1 status byte
        write_desc(&mem, desc_addr, 1, 0x6000, 513, 2 /* WRITE */, 0);

        mem.write_u16(avail_addr + 4, 0);
        mem.write_u16(avail_addr + 2, 1);

        dev.clone().drain_queue();
        wait_for_used(&mem, used_addr, 1);

        let mut out = [0u8; 513];
        let _ = mem.read(0x6000, &mut out);
        assert_eq!(&out[0..512], &(0..512u32).map(|b| (b % 256) as u8).collect::<Vec<u8>>()[..]);
        assert_eq!(out[512], STATUS_OK);
        assert_eq!(mem.read_u16(used_addr + 2), 1);
    }

    #[test]
    fn unsupported_request_type_returns_unsupp() {
        let dev = make_device();
        let mem = Arc::clone(&dev.mem);

        let desc_addr = 0x1000u64;
        let avail_addr = 0x2000u64;
        let used_addr = 0x3000u64;
        let mut qs = dev.mmio.queue_state(QUEUE_IDX);
        qs.ready = true;
        qs.num = 4;
        qs.desc_addr = desc_addr;
        qs.avail_addr = avail_addr;
        qs.used_addr = used_addr;
        dev.mmio.set_queue_state(QUEUE_IDX, qs);

        write_desc(&mem, desc_addr, 0, 0x5000, HEADER_SIZE, 1, 1);
        let mut hdr = [0u8; HEADER_SIZE as usize];
        hdr[0..4].copy_from_slice(&99u32.to_le_bytes());
        let _ = mem.write(0x5000, &hdr);
        write_desc(&mem, desc_addr, 1, 0x6000, 1, 2, 0);

        mem.write_u16(avail_addr + 4, 0);
        mem.write_u16(avail_addr + 2, 1);

        dev.clone().drain_queue();
        wait_for_used(&mem, used_addr, 1);

        let mut status = [0u8; 1];
        let _ = mem.read(0x6000, &mut status);
        assert_eq!(status[0], STATUS_UNSUPP);
    }
}
