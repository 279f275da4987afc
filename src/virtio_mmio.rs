//! VIRTIO-MMIO transport: the register file shared by every device, plus
//! the device-status state machine and bounds-checked config space.
//!
//! Grounded in `original_source/virtio.c`'s register switch
//! (`virtio_mmio_read`/`virtio_mmio_write`), expressed with the teacher's
//! `Mutex<Inner>`-guarded state pattern.

use std::sync::Mutex;

use crate::irq::IrqLine;
use crate::memory::GuestMemory;
use crate::virtqueue::{self, QueueState, MAX_QUEUE_NUM};

pub const MAGIC: u32 = 0x7472_6976;
pub const VERSION: u32 = 2;
pub const VENDOR_ID: u32 = 0xFFFF;
pub const MAX_QUEUE: usize = 8;

const STATUS_ACKNOWLEDGE: u32 = 1;
const STATUS_DRIVER: u32 = 2;
const STATUS_DRIVER_OK: u32 = 4;
const STATUS_FEATURES_OK: u32 = 8;
const STATUS_FAILED: u32 = 128;

const INT_USED_RING: u32 = 1;
const INT_CONFIG_CHANGE: u32 = 2;

pub const CONFIG_SPACE_SIZE: usize = 256;

/// What a register write asked the caller to do next, once the device
/// mutex has been released. Devices inspect this after calling
/// `mmio_write` and drive their own per-device logic (virtqueue draining,
/// config-change side effects) outside the lock.
pub enum WriteEffect {
    None,
    QueueNotify(u32),
    ConfigWrite,
}

/// State shared by every VIRTIO-MMIO device, guarded by a single mutex per
/// spec.md's concurrency model (one lock per device, held across a whole
/// register access).
struct Inner {
    device_id: u32,
    status: u32,
    int_status: u32,
    device_features: u64,
    device_features_sel: u32,
    driver_features_sel: u32,
    queue_sel: u32,
    queues: [QueueState; MAX_QUEUE],
    config_space: [u8; CONFIG_SPACE_SIZE],
    config_space_size: usize,
}

pub struct VirtioDevice {
    inner: Mutex<Inner>,
    irq: IrqLine,
}

impl VirtioDevice {
    pub fn new(device_id: u32, device_features: u64, config_space_size: usize, irq: IrqLine) -> VirtioDevice {
        VirtioDevice {
            inner: Mutex::new(Inner {
                device_id,
                status: 0,
                int_status: 0,
                device_features,
                device_features_sel: 0,
                driver_features_sel: 0,
                queue_sel: 0,
                queues: Default::default(),
                config_space: [0u8; CONFIG_SPACE_SIZE],
                config_space_size,
            }),
            irq,
        }
    }

    pub fn set_config_u32(&self, offset: usize, val: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.config_space[offset..offset + 4].copy_from_slice(&val.to_le_bytes());
    }

    pub fn config_u32(&self, offset: usize) -> u32 {
        let inner = self.inner.lock().unwrap();
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&inner.config_space[offset..offset + 4]);
        u32::from_le_bytes(buf)
    }

    fn reset(inner: &mut Inner) {
        inner.status = 0;
        inner.int_status = 0;
        inner.queue_sel = 0;
        for q in inner.queues.iter_mut() {
            *q = QueueState::default();
        }
    }

    pub fn status(&self) -> u32 {
        self.inner.lock().unwrap().status
    }

    pub fn is_driver_ok(&self) -> bool {
        self.inner.lock().unwrap().status & STATUS_DRIVER_OK != 0
    }

    /// Dispatches a register access at `offset` (bytes from the device's
    /// MMIO base). `offset + access_size > 4096` is rejected, per the
    /// redesign flag tightening the bound check.
    pub fn mmio_read(&self, offset: u64, access_size: u32) -> u32 {
        if offset + access_size as u64 > 4096 {
            return 0;
        }
        let mut inner = self.inner.lock().unwrap();
        match offset {
            0x000 => MAGIC,
            0x004 => VERSION,
            0x008 => inner.device_id,
            0x00C => VENDOR_ID,
            0x010 => {
                let sel = inner.device_features_sel;
                if sel == 0 {
                    inner.device_features as u32
                } else if sel == 1 {
                    1
                } else {
                    0
                }
            }
            0x034 => MAX_QUEUE_NUM as u32,
            0x044 => inner.queues[inner.queue_sel as usize].ready as u32,
            0x060 => inner.int_status,
            0x070 => inner.status,
            0x0FC => 0,
            off if off >= 0x100 => {
                let rel = (off - 0x100) as usize;
                if rel + access_size as usize > inner.config_space_size {
                    0
                } else {
                    let mut buf = [0u8; 4];
                    buf[..access_size as usize]
                        .copy_from_slice(&inner.config_space[rel..rel + access_size as usize]);
                    u32::from_le_bytes(buf)
                }
            }
            _ => 0,
        }
    }

    pub fn mmio_write(&self, offset: u64, access_size: u32, val: u32) -> WriteEffect {
        if offset + access_size as u64 > 4096 {
            return WriteEffect::None;
        }
        let mut inner = self.inner.lock().unwrap();
        match offset {
            0x014 => inner.device_features_sel = val,
            0x020 => {} // DriverFeatures accepted, otherwise ignored
            0x024 => inner.driver_features_sel = val,
            0x030 => {
                if val < MAX_QUEUE as u32 {
                    inner.queue_sel = val;
                }
            }
            0x038 => {
                let sel = inner.queue_sel as usize;
                if !inner.queues[sel].ready && val > 0 && val.is_power_of_two() {
                    inner.queues[sel].num = val;
                }
            }
            0x044 => {
                let sel = inner.queue_sel as usize;
                inner.queues[sel].ready = val & 1 != 0;
            }
            0x050 => {
                if val < MAX_QUEUE as u32 {
                    return WriteEffect::QueueNotify(val);
                }
            }
            0x064 => {
                inner.int_status &= !val;
                if inner.int_status == 0 {
                    self.irq.set_level(0);
                    return WriteEffect::None;
                }
            }
            0x070 => {
                if val == 0 {
                    Self::reset(&mut inner);
                    self.irq.set_level(0);
                    return WriteEffect::None;
                }
                inner.status = val;
            }
            0x080 => set_addr_lo(&mut inner.queues[inner.queue_sel as usize].desc_addr, val),
            0x084 => set_addr_hi(&mut inner.queues[inner.queue_sel as usize].desc_addr, val),
            0x090 => set_addr_lo(&mut inner.queues[inner.queue_sel as usize].avail_addr, val),
            0x094 => set_addr_hi(&mut inner.queues[inner.queue_sel as usize].avail_addr, val),
            0x0A0 => set_addr_lo(&mut inner.queues[inner.queue_sel as usize].used_addr, val),
            0x0A4 => set_addr_hi(&mut inner.queues[inner.queue_sel as usize].used_addr, val),
            off if off >= 0x100 => {
                let rel = (off - 0x100) as usize;
                if rel + access_size as usize <= inner.config_space_size {
                    inner.config_space[rel..rel + access_size as usize]
                        .copy_from_slice(&val.to_le_bytes()[..access_size as usize]);
                    return WriteEffect::ConfigWrite;
                }
            }
            _ => {}
        }
        WriteEffect::None
    }

    /// Raises InterruptStatus for the used ring (or config change) and
    /// asserts the IRQ. Idempotent at the guest-visible level: repeated
    /// calls while a bit is already set are harmless.
    pub fn raise_used_ring_irq(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.int_status |= INT_USED_RING;
        drop(inner);
        self.irq.set_level(1);
    }

    pub fn raise_config_irq(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.int_status |= INT_CONFIG_CHANGE;
        drop(inner);
        self.irq.set_level(1);
    }

    pub fn queue_state(&self, idx: usize) -> QueueState {
        self.inner.lock().unwrap().queues[idx].clone()
    }

    pub fn set_queue_state(&self, idx: usize, qs: QueueState) {
        self.inner.lock().unwrap().queues[idx] = qs;
    }

    pub fn notify(&self, mem: &GuestMemory, idx: usize, mut on_recv: impl FnMut(u16, u32, u32) -> Result<(), ()>) {
        let mut qs = self.queue_state(idx);
        virtqueue::queue_notify(mem, &mut qs, &mut on_recv);
        self.set_queue_state(idx, qs);
    }
}

fn set_addr_lo(addr: &mut u64, val: u32) {
    *addr = (*addr & 0xFFFF_FFFF_0000_0000) | val as u64;
}

fn set_addr_hi(addr: &mut u64, val: u32) {
    *addr = (*addr & 0x0000_0000_FFFF_FFFF) | ((val as u64) << 32);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev() -> VirtioDevice {
        VirtioDevice::new(2, 0, 8, IrqLine::noop())
    }

    #[test]
    fn magic_version_vendor_are_fixed() {
        let d = dev();
        assert_eq!(d.mmio_read(0x000, 4), MAGIC);
        assert_eq!(d.mmio_read(0x004, 4), VERSION);
        assert_eq!(d.mmio_read(0x00C, 4), VENDOR_ID);
        assert_eq!(d.mmio_read(0x008, 4), 2);
    }

    #[test]
    fn queue_num_rejects_non_power_of_two() {
        let d = dev();
        d.mmio_write(0x030, 4, 0);
        d.mmio_write(0x038, 4, 3);
        assert_eq!(d.queue_state(0).num, MAX_QUEUE_NUM as u32);
        d.mmio_write(0x038, 4, 8);
        assert_eq!(d.queue_state(0).num, 8);
    }

    #[test]
    fn queue_sel_ignored_when_out_of_range() {
        let d = dev();
        d.mmio_write(0x030, 4, 99);
        d.mmio_write(0x038, 4, 4);
        // queue_sel stayed at 0, so queue 0 should have changed instead
        assert_eq!(d.queue_state(0).num, 4);
    }

    #[test]
    fn status_zero_resets_queues_and_deasserts() {
        let d = dev();
        d.mmio_write(0x070, 4, STATUS_ACKNOWLEDGE | STATUS_DRIVER);
        d.mmio_write(0x044, 4, 1);
        assert!(d.queue_state(0).ready);

        d.mmio_write(0x070, 4, 0);
        assert_eq!(d.status(), 0);
        assert!(!d.queue_state(0).ready);
        assert_eq!(d.queue_state(0).num, MAX_QUEUE_NUM as u32);
    }

    #[test]
    fn offset_plus_width_crossing_4096_is_rejected() {
        let d = dev();
        assert_eq!(d.mmio_read(4094, 4), 0);
    }

    #[test]
    fn config_space_bounds_checked() {
        let d = dev();
        d.set_config_u32(0, 0xdead_beef);
        assert_eq!(d.mmio_read(0x100, 4), 0xdead_beef);
        assert_eq!(d.mmio_read(0x100 + 8, 4), 0); // past config_space_size=8
    }
}
