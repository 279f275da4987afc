#[macro_use]
extern crate log;
extern crate libc;

pub mod backend_file;
pub mod backend_tap;
pub mod boot;
pub mod config;
pub mod cpu;
pub mod irq;
pub mod kvm;
pub mod memory;
pub mod power;
pub mod threadpool;
pub mod uart;
pub mod virtio_blk;
pub mod virtio_mmio;
pub mod virtio_net;
pub mod virtqueue;

use std::error::Error;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use backend_file::FileBlockBackend;
use backend_tap::TapEndpoint;
use config::Config;
use cpu::VcpuLoop;
use irq::IrqLine;
use kvm::Kvm;
use memory::GuestMemory;
use power::PowerPort;
use threadpool::WorkerPool;
use uart::Uart;
use virtio_blk::{BlockBackend, BlockDevice};
use virtio_net::{NetDevice, TapBackend};

const UART_IRQ: u32 = 4;
const POWER_IRQ: u32 = 5;
const BLOCK_IRQ: u32 = 10;
const NET_IRQ: u32 = 11;
const BLOCK_WORKERS: usize = 4;

const BLOCK_MMIO_CMDLINE: &str = " virtio_mmio.device=4K@0x10000000000:10";
const NET_MMIO_CMDLINE: &str = " virtio_mmio.device=4K@0x10040000000:11";

/// Default guest-visible MAC when a TAP is attached. Locally administered
/// (bit 1 of the first octet set), in the range conventionally reserved
/// for software-defined NICs.
const DEFAULT_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];

/// Everything assembled at startup: the VCPU loop plus the pieces `main`
/// needs direct handles to (the UART, for host-input forwarding; the power
/// port, for requesting a graceful guest shutdown on SIGINT/SIGTERM; and the
/// quit flag, as the hard-kill fallback for signal handling).
pub struct Vmm {
    vcpu_loop: VcpuLoop,
    pub uart: Arc<Uart>,
    pub power: Arc<PowerPort>,
    pub quit: Arc<AtomicBool>,
}

impl Vmm {
    pub fn new(config: &Config) -> Result<Vmm, Box<dyn Error>> {
        let kvm = Kvm::open()?;
        let vm = kvm.create_vm()?;
        vm.create_irqchip()?;
        vm.create_pit2()?;

        let mem = Arc::new(GuestMemory::new(config.memory_size as usize)?);
        vm.set_user_memory_region(0, mem.size() as u64, mem.host_base() as u64)?;

        let cmdline = augmented_cmdline(config);
        let entry = boot::load_kernel(&mem, &config.kernel_path, config.initrd_path.as_deref(), &cmdline)?;

        let vcpu = vm.create_vcpu()?;
        vcpu.init_boot_state(entry.rip, entry.rsi)?;

        let uart = Arc::new(Uart::new(IrqLine::new(vm.clone(), UART_IRQ)));
        let power = Arc::new(PowerPort::new(IrqLine::new(vm.clone(), POWER_IRQ)));

        let block = match &config.disk_path {
            Some(path) => {
                let backend: Arc<dyn BlockBackend> = Arc::new(FileBlockBackend::open(path)?);
                let pool = Arc::new(WorkerPool::new(BLOCK_WORKERS));
                Some(Arc::new(BlockDevice::new(
                    Arc::clone(&mem),
                    backend,
                    pool,
                    IrqLine::new(vm.clone(), BLOCK_IRQ),
                )))
            }
            None => None,
        };

        let net = match &config.tap_name {
            Some(name) => {
                let tap: Arc<dyn TapBackend> = Arc::new(TapEndpoint::open(name)?);
                Some(NetDevice::new(
                    Arc::clone(&mem),
                    tap,
                    DEFAULT_MAC,
                    IrqLine::new(vm.clone(), NET_IRQ),
                ))
            }
            None => None,
        };

        let quit = Arc::new(AtomicBool::new(false));
        let vcpu_loop = VcpuLoop::new(vcpu, Arc::clone(&uart), Arc::clone(&power), block, net, Arc::clone(&quit));

        Ok(Vmm {
            vcpu_loop,
            uart,
            power,
            quit,
        })
    }

    pub fn run(&self) -> i32 {
        self.vcpu_loop.run()
    }
}

fn augmented_cmdline(config: &Config) -> String {
    let mut cmdline = config.cmdline.clone();
    if config.disk_path.is_some() {
        cmdline.push_str(BLOCK_MMIO_CMDLINE);
    }
    if config.tap_name.is_some() {
        cmdline.push_str(NET_MMIO_CMDLINE);
    }
    cmdline
}
