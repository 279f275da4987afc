//! Edge-triggered IRQ lines, asserted through the host's in-kernel irqchip.

use crate::kvm::VmFd;

/// A single named interrupt line. `assert` is idempotent at this layer:
/// the host irqchip deduplicates levels, so callers don't need to track
/// whether the line is already high.
pub struct IrqLine {
    vm: Option<VmFd>,
    line: u32,
}

impl IrqLine {
    pub fn new(vm: VmFd, line: u32) -> IrqLine {
        IrqLine { vm: Some(vm), line }
    }

    /// An IRQ line with no backing VM, for unit tests that exercise device
    /// register state machines without a real `/dev/kvm`.
    pub fn noop() -> IrqLine {
        IrqLine { vm: None, line: 0 }
    }

    pub fn set_level(&self, level: u32) {
        let vm = match &self.vm {
            Some(vm) => vm,
            None => return,
        };
        if let Err(e) = vm.irq_line(self.line, level) {
            warn!("KVM_IRQ_LINE {} level {} failed: {}", self.line, level, e);
        }
    }

    /// Pulse the line high then low, as used for the power-port shutdown
    /// request and the UART's edge-triggered interrupt.
    pub fn pulse(&self) {
        self.set_level(1);
        self.set_level(0);
    }
}
