//! VCPU run loop and exit dispatcher: routes `KVM_EXIT_IO` to the UART and
//! power port, `KVM_EXIT_MMIO` to the block/net devices, and stops the
//! loop on `KVM_EXIT_SHUTDOWN` or a host-requested power-off.
//!
//! Grounded in `original_source/mvvm.c`'s `mvvm_run`/`handle_io`/`handle_mmio`.

use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::kvm::{VcpuFd, KVM_EXIT_IO, KVM_EXIT_MMIO, KVM_EXIT_SHUTDOWN};
use crate::power::PowerPort;
use crate::uart::Uart;
use crate::virtio_blk::BlockDevice;
use crate::virtio_net::NetDevice;

const UART_BASE: u16 = 0x3F8;
const UART_END: u16 = 0x3FF;
const POWER_PORT: u16 = 0x300;

/// MMIO window bases, expressed as the `phys_addr >> 30` bucket the VCPU
/// loop checks before computing an in-window offset.
const MMIO_BLOCK_BUCKET: u64 = 1024; // 1 TiB
const MMIO_NET_BUCKET: u64 = 1025; // 1 TiB + 4 GiB
const MMIO_BLOCK_BASE: u64 = 1024 << 30;
const MMIO_NET_BASE: u64 = 1025 << 30;

pub struct VcpuLoop {
    vcpu: VcpuFd,
    uart: Arc<Uart>,
    power: Arc<PowerPort>,
    block: Option<Arc<BlockDevice>>,
    net: Option<Arc<NetDevice>>,
    quit: Arc<AtomicBool>,
}

impl VcpuLoop {
    pub fn new(
        vcpu: VcpuFd,
        uart: Arc<Uart>,
        power: Arc<PowerPort>,
        block: Option<Arc<BlockDevice>>,
        net: Option<Arc<NetDevice>>,
        quit: Arc<AtomicBool>,
    ) -> VcpuLoop {
        VcpuLoop {
            vcpu,
            uart,
            power,
            block,
            net,
            quit,
        }
    }

    /// Runs until the guest shuts down, a power-off is requested, or
    /// `quit` is set by a signal handler. Returns the process exit code.
    ///
    /// SIGTERM stays blocked on this thread except while `KVM_RUN` is
    /// actually executing, so a host-requested shutdown can only land the
    /// thread inside the kernel, never mid-dispatch.
    pub fn run(&self) -> i32 {
        block_sigterm();
        loop {
            if self.quit.load(Ordering::SeqCst) {
                return 0;
            }

            let reason = match self.run_vcpu() {
                Ok(r) => r,
                Err(e) => {
                    if e.kind() == std::io::ErrorKind::Interrupted {
                        continue;
                    }
                    error!("KVM_RUN failed: {}", e);
                    return 1;
                }
            };

            match reason {
                KVM_EXIT_IO => {
                    if let Some(code) = self.handle_io() {
                        return code;
                    }
                }
                KVM_EXIT_MMIO => self.handle_mmio(),
                KVM_EXIT_SHUTDOWN => {
                    info!("guest requested shutdown (triple fault / reset)");
                    return 0;
                }
                other => {
                    warn!("unhandled KVM exit reason {}", other);
                    return 1;
                }
            }
        }
    }

    /// Unblocks SIGTERM for the duration of the `KVM_RUN` ioctl only, then
    /// re-blocks it before returning control to the dispatcher.
    fn run_vcpu(&self) -> Result<u32, std::io::Error> {
        unblock_sigterm();
        let result = self.vcpu.run();
        block_sigterm();
        result
    }

    fn handle_io(&self) -> Option<i32> {
        let (is_write, port, _count, data) = self.vcpu.io_exit();
        if is_write {
            let val = data[0];
            match port {
                UART_BASE..=UART_END => self.uart.write_reg(port - UART_BASE, val),
                POWER_PORT => {
                    let cmd = self.power.guest_write(val);
                    if cmd != 0 {
                        info!("guest requested power-off via power port (cmd={})", cmd);
                        return Some(0);
                    }
                }
                _ => {}
            }
            None
        } else {
            let out = self.vcpu.io_exit_mut();
            out[0] = match port {
                UART_BASE..=UART_END => self.uart.read_reg(port - UART_BASE),
                POWER_PORT => self.power.guest_read(),
                _ => 0xFF,
            };
            None
        }
    }

    fn handle_mmio(&self) {
        let (phys_addr, is_write, data) = self.vcpu.mmio_exit();
        let bucket = phys_addr >> 30;
        let access_size = data.len() as u32;

        if bucket == MMIO_BLOCK_BUCKET {
            let offset = phys_addr - MMIO_BLOCK_BASE;
            if offset > 4096 {
                return;
            }
            if let Some(block) = &self.block {
                if is_write {
                    let val = read_le(data);
                    block.mmio_write(offset, access_size, val);
                } else {
                    write_le(data, block.mmio_read(offset, access_size));
                }
            }
        } else if bucket == MMIO_NET_BUCKET {
            let offset = phys_addr - MMIO_NET_BASE;
            if offset > 4096 {
                return;
            }
            if let Some(net) = &self.net {
                if is_write {
                    let val = read_le(data);
                    net.mmio_write(offset, access_size, val);
                } else {
                    write_le(data, net.mmio_read(offset, access_size));
                }
            }
        }
    }
}

fn sigterm_set() -> libc::sigset_t {
    unsafe {
        let mut set = MaybeUninit::<libc::sigset_t>::uninit();
        libc::sigemptyset(set.as_mut_ptr());
        libc::sigaddset(set.as_mut_ptr(), libc::SIGTERM);
        set.assume_init()
    }
}

fn block_sigterm() {
    let set = sigterm_set();
    unsafe {
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
    }
}

fn unblock_sigterm() {
    let set = sigterm_set();
    unsafe {
        libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut());
    }
}

fn read_le(data: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf[..data.len()].copy_from_slice(data);
    u32::from_le_bytes(buf)
}

fn write_le(data: &mut [u8], val: u32) {
    let bytes = val.to_le_bytes();
    data.copy_from_slice(&bytes[..data.len()]);
}
