#![allow(dead_code)]

//! Raw KVM ioctl surface. Constants and `#[repr(C)]` structs are transcribed
//! from `linux/kvm.h`; this module does not try to be a general-purpose KVM
//! binding, only what the VCPU loop and boot loader need.

use std::error::Error;
use std::fs::{File, OpenOptions};
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

// ioctl numbers, grabbed from linux/kvm.h (the `_IO`/`_IOW`/`_IOWR` encodings
// are baked in here rather than recomputed, same as the VFIO constants in
// the codebase this module descends from).
const KVM_GET_API_VERSION: u64 = 0xAE00;
const KVM_CREATE_VM: u64 = 0xAE01;
const KVM_GET_VCPU_MMAP_SIZE: u64 = 0xAE04;
const KVM_CREATE_VCPU: u64 = 0xAE41;
const KVM_RUN: u64 = 0xAE80;
const KVM_GET_REGS: u64 = 0x8090_AE81;
const KVM_SET_REGS: u64 = 0x4090_AE82;
const KVM_GET_SREGS: u64 = 0x8138_AE83;
const KVM_SET_SREGS: u64 = 0x4138_AE84;
const KVM_GET_SUPPORTED_CPUID: u64 = 0xC008_AE05;
const KVM_SET_CPUID2: u64 = 0x4008_AE90;
const KVM_SET_USER_MEMORY_REGION: u64 = 0x4020_AE46;
const KVM_CREATE_IRQCHIP: u64 = 0xAE60;
const KVM_IRQ_LINE: u64 = 0x4008_AE61;
const KVM_CREATE_PIT2: u64 = 0x4040_AE77;

pub const KVM_EXIT_UNKNOWN: u32 = 0;
pub const KVM_EXIT_IO: u32 = 2;
pub const KVM_EXIT_SHUTDOWN: u32 = 8;
pub const KVM_EXIT_MMIO: u32 = 6;

const KVM_EXIT_IO_IN: u8 = 0;
const KVM_EXIT_IO_OUT: u8 = 1;

const CPUID_MAX_ENTRIES: usize = 100;

#[repr(C)]
#[derive(Default, Clone, Copy)]
struct KvmSegment {
    base: u64,
    limit: u32,
    selector: u16,
    ty: u8,
    present: u8,
    dpl: u8,
    db: u8,
    s: u8,
    l: u8,
    g: u8,
    avl: u8,
    unusable: u8,
    padding: u8,
}

impl KvmSegment {
    /// Flat 32-bit protected-mode segment: base 0, 4 GiB limit, granular,
    /// 32-bit default operand size. Mirrors `set_flat_mode` in the original
    /// CPU bring-up code.
    fn flat(selector: u16, ty: u8, s: u8) -> KvmSegment {
        KvmSegment {
            base: 0,
            limit: 0xffff_ffff,
            selector,
            ty,
            present: 1,
            dpl: 0,
            db: 1,
            s,
            l: 0,
            g: 1,
            avl: 0,
            unusable: 0,
            padding: 0,
        }
    }
}

#[repr(C)]
#[derive(Default, Clone, Copy)]
struct KvmDtable {
    base: u64,
    limit: u16,
    padding: [u16; 3],
}

#[repr(C)]
#[derive(Default, Clone, Copy)]
struct KvmSregs {
    cs: KvmSegment,
    ds: KvmSegment,
    es: KvmSegment,
    fs: KvmSegment,
    gs: KvmSegment,
    ss: KvmSegment,
    tr: KvmSegment,
    ldt: KvmSegment,
    gdt: KvmDtable,
    idt: KvmDtable,
    cr0: u64,
    cr2: u64,
    cr3: u64,
    cr4: u64,
    cr8: u64,
    efer: u64,
    apic_base: u64,
    interrupt_bitmap: [u64; 4],
}

#[repr(C)]
#[derive(Default, Clone, Copy)]
struct KvmRegs {
    rax: u64,
    rbx: u64,
    rcx: u64,
    rdx: u64,
    rsi: u64,
    rdi: u64,
    rsp: u64,
    rbp: u64,
    r8: u64,
    r9: u64,
    r10: u64,
    r11: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
    rip: u64,
    rflags: u64,
}

#[repr(C)]
#[derive(Default, Clone, Copy)]
struct KvmCpuidEntry2 {
    function: u32,
    index: u32,
    flags: u32,
    eax: u32,
    ebx: u32,
    ecx: u32,
    edx: u32,
    padding: [u32; 3],
}

#[repr(C)]
struct KvmCpuid2 {
    nent: u32,
    padding: u32,
    entries: [KvmCpuidEntry2; CPUID_MAX_ENTRIES],
}

#[repr(C)]
struct KvmUserspaceMemoryRegion {
    slot: u32,
    flags: u32,
    guest_phys_addr: u64,
    memory_size: u64,
    userspace_addr: u64,
}

#[repr(C)]
struct KvmIrqLevel {
    irq: u32,
    level: u32,
}

#[repr(C)]
struct KvmPitConfig {
    flags: u32,
    pad: [u32; 15],
}

/// Matches `struct kvm_run`'s IO-exit fields; the full struct is variable
/// length (trailing padding + per-exit union), so this mirrors only the
/// prefix the dispatcher reads, same approach as the upstream struct's
/// `data_offset`-relative access in the original C implementation.
#[repr(C)]
struct KvmRunIo {
    direction: u8,
    size: u8,
    port: u16,
    count: u32,
    data_offset: u64,
}

fn ioctl_err(what: &str) -> Box<dyn Error> {
    format!("{} failed. Errno: {}", what, std::io::Error::last_os_error()).into()
}

/// Handle to `/dev/kvm` itself, used only to query supported CPUID and to
/// create VMs.
pub struct Kvm {
    file: File,
}

impl Kvm {
    pub fn open() -> Result<Kvm, Box<dyn Error>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open("/dev/kvm")?;
        Ok(Kvm { file })
    }

    pub fn create_vm(&self) -> Result<VmFd, Box<dyn Error>> {
        let fd = unsafe { libc::ioctl(self.file.as_raw_fd(), KVM_CREATE_VM, 0) };
        if fd < 0 {
            return Err(ioctl_err("KVM_CREATE_VM"));
        }
        let vm_file = unsafe { <File as std::os::unix::io::FromRawFd>::from_raw_fd(fd) };
        Ok(VmFd {
            inner: Arc::new(vm_file),
            kvm_fd: self.file.as_raw_fd(),
        })
    }

    fn supported_cpuid(&self) -> Result<Box<KvmCpuid2>, Box<dyn Error>> {
        let mut cpuid = Box::new(KvmCpuid2 {
            nent: CPUID_MAX_ENTRIES as u32,
            padding: 0,
            entries: [KvmCpuidEntry2::default(); CPUID_MAX_ENTRIES],
        });
        if unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                KVM_GET_SUPPORTED_CPUID,
                cpuid.as_mut() as *mut KvmCpuid2,
            )
        } < 0
        {
            return Err(ioctl_err("KVM_GET_SUPPORTED_CPUID"));
        }
        Ok(cpuid)
    }
}

use std::os::unix::fs::OpenOptionsExt;

/// Shared handle to an open VM fd. Cloning it (via `Arc`) is how the
/// in-kernel irqchip handle reaches `IrqLine` without a raw back-pointer.
#[derive(Clone)]
pub struct VmFd {
    inner: Arc<File>,
    kvm_fd: RawFd,
}

impl VmFd {
    pub fn create_irqchip(&self) -> Result<(), Box<dyn Error>> {
        if unsafe { libc::ioctl(self.inner.as_raw_fd(), KVM_CREATE_IRQCHIP, 0) } < 0 {
            return Err(ioctl_err("KVM_CREATE_IRQCHIP"));
        }
        Ok(())
    }

    pub fn create_pit2(&self) -> Result<(), Box<dyn Error>> {
        let pit = KvmPitConfig {
            flags: 0,
            pad: [0; 15],
        };
        if unsafe { libc::ioctl(self.inner.as_raw_fd(), KVM_CREATE_PIT2, &pit) } < 0 {
            return Err(ioctl_err("KVM_CREATE_PIT2"));
        }
        Ok(())
    }

    pub fn set_user_memory_region(
        &self,
        guest_phys_addr: u64,
        memory_size: u64,
        userspace_addr: u64,
    ) -> Result<(), Box<dyn Error>> {
        let region = KvmUserspaceMemoryRegion {
            slot: 0,
            flags: 0,
            guest_phys_addr,
            memory_size,
            userspace_addr,
        };
        if unsafe {
            libc::ioctl(
                self.inner.as_raw_fd(),
                KVM_SET_USER_MEMORY_REGION,
                &region,
            )
        } < 0
        {
            return Err(ioctl_err("KVM_SET_USER_MEMORY_REGION"));
        }
        Ok(())
    }

    pub fn irq_line(&self, irq: u32, level: u32) -> Result<(), Box<dyn Error>> {
        let lvl = KvmIrqLevel { irq, level };
        if unsafe { libc::ioctl(self.inner.as_raw_fd(), KVM_IRQ_LINE, &lvl) } < 0 {
            return Err(ioctl_err("KVM_IRQ_LINE"));
        }
        Ok(())
    }

    pub fn create_vcpu(&self) -> Result<VcpuFd, Box<dyn Error>> {
        let fd = unsafe { libc::ioctl(self.inner.as_raw_fd(), KVM_CREATE_VCPU, 0) };
        if fd < 0 {
            return Err(ioctl_err("KVM_CREATE_VCPU"));
        }
        let cpu_file = unsafe { <File as std::os::unix::io::FromRawFd>::from_raw_fd(fd) };

        let mmap_size = unsafe { libc::ioctl(self.kvm_fd, KVM_GET_VCPU_MMAP_SIZE, 0) };
        if mmap_size < 0 {
            return Err(ioctl_err("KVM_GET_VCPU_MMAP_SIZE"));
        }

        let run_ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mmap_size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                cpu_file.as_raw_fd(),
                0,
            )
        };
        if run_ptr == libc::MAP_FAILED {
            return Err(ioctl_err("mmap kvm_run"));
        }

        Ok(VcpuFd {
            file: cpu_file,
            run: run_ptr as *mut u8,
            run_size: mmap_size as usize,
            kvm_fd: self.kvm_fd,
        })
    }
}

/// One VCPU. Only a single VCPU is ever created (SMP is out of scope), so
/// this holds the `kvm_run` mapping directly rather than through any pool.
pub struct VcpuFd {
    file: File,
    run: *mut u8,
    run_size: usize,
    kvm_fd: RawFd,
}

unsafe impl Send for VcpuFd {}

impl VcpuFd {
    /// Programs flat 32-bit segments, CR0.PE, RIP/RSI and the host's
    /// supported CPUID, matching `init_cpu` in the reference loader.
    pub fn init_boot_state(&self, rip: u64, rsi: u64) -> Result<(), Box<dyn Error>> {
        let mut sregs = self.get_sregs()?;
        sregs.cs = KvmSegment::flat(0x08, 0x0b, 1); // code, present, readable
        sregs.ds = KvmSegment::flat(0x10, 0x03, 1);
        sregs.es = KvmSegment::flat(0x10, 0x03, 1);
        sregs.fs = KvmSegment::flat(0x10, 0x03, 1);
        sregs.gs = KvmSegment::flat(0x10, 0x03, 1);
        sregs.ss = KvmSegment::flat(0x10, 0x03, 1);
        sregs.cr0 |= 0x1;
        self.set_sregs(&sregs)?;

        let mut regs = self.get_regs()?;
        regs.rip = rip;
        regs.rsi = rsi;
        self.set_regs(&regs)?;

        let cpuid = self.supported_cpuid()?;
        if unsafe { libc::ioctl(self.file.as_raw_fd(), KVM_SET_CPUID2, cpuid.as_ref() as *const KvmCpuid2) } < 0 {
            return Err(ioctl_err("KVM_SET_CPUID2"));
        }
        Ok(())
    }

    fn supported_cpuid(&self) -> Result<Box<KvmCpuid2>, Box<dyn Error>> {
        let mut cpuid = Box::new(KvmCpuid2 {
            nent: CPUID_MAX_ENTRIES as u32,
            padding: 0,
            entries: [KvmCpuidEntry2::default(); CPUID_MAX_ENTRIES],
        });
        if unsafe {
            libc::ioctl(
                self.kvm_fd,
                KVM_GET_SUPPORTED_CPUID,
                cpuid.as_mut() as *mut KvmCpuid2,
            )
        } < 0
        {
            return Err(ioctl_err("KVM_GET_SUPPORTED_CPUID"));
        }
        Ok(cpuid)
    }

    fn get_sregs(&self) -> Result<KvmSregs, Box<dyn Error>> {
        let mut sregs = KvmSregs::default();
        if unsafe { libc::ioctl(self.file.as_raw_fd(), KVM_GET_SREGS, &mut sregs) } < 0 {
            return Err(ioctl_err("KVM_GET_SREGS"));
        }
        Ok(sregs)
    }

    fn set_sregs(&self, sregs: &KvmSregs) -> Result<(), Box<dyn Error>> {
        if unsafe { libc::ioctl(self.file.as_raw_fd(), KVM_SET_SREGS, sregs) } < 0 {
            return Err(ioctl_err("KVM_SET_SREGS"));
        }
        Ok(())
    }

    fn get_regs(&self) -> Result<KvmRegs, Box<dyn Error>> {
        let mut regs = KvmRegs::default();
        if unsafe { libc::ioctl(self.file.as_raw_fd(), KVM_GET_REGS, &mut regs) } < 0 {
            return Err(ioctl_err("KVM_GET_REGS"));
        }
        Ok(regs)
    }

    fn set_regs(&self, regs: &KvmRegs) -> Result<(), Box<dyn Error>> {
        if unsafe { libc::ioctl(self.file.as_raw_fd(), KVM_SET_REGS, regs) } < 0 {
            return Err(ioctl_err("KVM_SET_REGS"));
        }
        Ok(())
    }

    /// Enters guest mode once. Returns the exit reason read out of
    /// `kvm_run`. `EINTR` (signal delivered during RUN) is surfaced as
    /// `Err` so the caller can retry without dispatching.
    pub fn run(&self) -> Result<u32, std::io::Error> {
        if unsafe { libc::ioctl(self.file.as_raw_fd(), KVM_RUN, 0) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(unsafe { *(self.run as *const u32) })
    }

    /// Reads the IO-exit fields out of `kvm_run` for the current exit.
    pub fn io_exit(&self) -> (bool, u16, u32, &[u8]) {
        let io = unsafe { &*(self.run.add(8) as *const KvmRunIo) };
        let is_write = io.direction == KVM_EXIT_IO_OUT;
        let data = unsafe {
            std::slice::from_raw_parts(
                self.run.add(io.data_offset as usize),
                io.size as usize * io.count as usize,
            )
        };
        (is_write, io.port, io.count, data)
    }

    pub fn io_exit_mut(&self) -> &mut [u8] {
        let io = unsafe { &*(self.run.add(8) as *const KvmRunIo) };
        unsafe {
            std::slice::from_raw_parts_mut(
                self.run.add(io.data_offset as usize),
                io.size as usize * io.count as usize,
            )
        }
    }

    /// Reads the MMIO-exit fields: `(phys_addr, is_write, data)`.
    pub fn mmio_exit(&self) -> (u64, bool, &mut [u8]) {
        // struct kvm_run's mmio union member layout: phys_addr(u64), data[8], len(u32), is_write(u8)
        const MMIO_OFFSET: usize = 8;
        let phys_addr = unsafe { *(self.run.add(MMIO_OFFSET) as *const u64) };
        let len = unsafe { *(self.run.add(MMIO_OFFSET + 8 + 8) as *const u32) };
        let is_write = unsafe { *(self.run.add(MMIO_OFFSET + 8 + 8 + 4) as *const u8) } != 0;
        let data = unsafe {
            std::slice::from_raw_parts_mut(self.run.add(MMIO_OFFSET + 8), len as usize)
        };
        (phys_addr, is_write, data)
    }

    pub fn exit_reason(&self) -> u32 {
        unsafe { *(self.run as *const u32) }
    }
}

impl Drop for VcpuFd {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.run as *mut libc::c_void, self.run_size);
        }
    }
}
