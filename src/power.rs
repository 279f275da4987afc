//! Host-side power port (0x300): a one-byte command channel the guest-side
//! companion module uses to request orderly shutdown, and through which the
//! guest itself signals poweroff back to the host.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::irq::IrqLine;

const POWER_IRQ: u32 = 5;

pub struct PowerPort {
    pending: AtomicU8,
    irq: IrqLine,
}

impl PowerPort {
    pub fn new(irq: IrqLine) -> PowerPort {
        PowerPort {
            pending: AtomicU8::new(0),
            irq,
        }
    }

    /// Guest OUT: a non-zero write (HALT = 1) tells the VCPU loop to stop.
    /// Returns the written value so the dispatcher can use it as the exit
    /// code.
    pub fn guest_write(&self, val: u8) -> u8 {
        val
    }

    /// Guest IN: returns whatever command the host has queued.
    pub fn guest_read(&self) -> u8 {
        self.pending.load(Ordering::SeqCst)
    }

    /// Host-initiated shutdown request: queue command 1 and pulse IRQ 5,
    /// mirroring `mvvm_shutdown()`.
    pub fn request_shutdown(&self) {
        self.pending.store(1, Ordering::SeqCst);
        self.irq.pulse();
    }
}
