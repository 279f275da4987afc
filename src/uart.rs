//! 16550 UART emulation on ports 0x3F8..0x3FF, IRQ line 4.
//!
//! Host input (typed characters) and guest consumption (reads of RBR) are
//! serialized through a mutex; `rx_cond` provides the host-input thread's
//! back-pressure signal when the guest hasn't drained the one-byte RX slot.

use std::io::Write;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::irq::IrqLine;

const IER_RX_ENABLE: u8 = 0x01;
const IER_TX_ENABLE: u8 = 0x02;
const LCR_DLAB: u8 = 0x80;
const LSR_DATA_READY: u8 = 0x01;

const IIR_NONE: u8 = 0b0001;
const IIR_TX: u8 = 0b0010;
const IIR_RX: u8 = 0b0100;

/// How long the host-input producer waits for the guest to drain the RX
/// slot before giving up and dropping the byte.
const RX_TIMEOUT: Duration = Duration::from_secs(3);

struct Registers {
    /// regs[0] unused directly: THR/RBR go through `rx_byte`/stdout instead
    /// of being stored here, matching the special-cased offset-0 handling
    /// in the register contract.
    ier: u8,
    iir: u8,
    lcr: u8,
    mcr: u8,
    lsr: u8,
    msr: u8,
    scr: u8,
    dll: u8,
    dlh: u8,
    rx_byte: u8,
}

impl Default for Registers {
    fn default() -> Registers {
        Registers {
            ier: 0,
            iir: IIR_NONE,
            lcr: 0,
            mcr: 0,
            lsr: 0x60,
            msr: 0xB0,
            scr: 0,
            dll: 0,
            dlh: 0,
            rx_byte: 0,
        }
    }
}

pub struct Uart {
    regs: Mutex<Registers>,
    rx_cond: Condvar,
    irq: IrqLine,
}

impl Uart {
    pub fn new(irq: IrqLine) -> Uart {
        Uart {
            regs: Mutex::new(Registers::default()),
            rx_cond: Condvar::new(),
            irq,
        }
    }

    fn dlab_set(regs: &Registers) -> bool {
        regs.lcr & LCR_DLAB != 0
    }

    /// Guest OUT to one of ports 0x3F8..0x3FF.
    pub fn write_reg(&self, offset: u16, val: u8) {
        let mut regs = self.regs.lock().unwrap();
        match offset {
            0 if Self::dlab_set(&regs) => regs.dll = val,
            1 if Self::dlab_set(&regs) => regs.dlh = val,
            0 => {
                // THR: output byte, raise TX interrupt if enabled and RX
                // isn't already pending.
                print!("{}", val as char);
                let _ = std::io::stdout().flush();
                if regs.ier & IER_TX_ENABLE != 0 && regs.iir & IIR_RX == 0 {
                    regs.iir = IIR_TX;
                    drop(regs);
                    self.irq.pulse();
                }
            }
            1 => regs.ier = val,
            2 => {}
            3 => regs.lcr = val,
            4 => regs.mcr = val,
            5 => {}
            6 => {}
            7 => regs.scr = val,
            _ => {}
        }
    }

    /// Guest IN from one of ports 0x3F8..0x3FF.
    pub fn read_reg(&self, offset: u16) -> u8 {
        let mut regs = self.regs.lock().unwrap();
        match offset {
            0 if Self::dlab_set(&regs) => regs.dll,
            1 if Self::dlab_set(&regs) => regs.dlh,
            0 => {
                let byte = regs.rx_byte;
                regs.lsr &= !LSR_DATA_READY;
                drop(regs);
                self.rx_cond.notify_one();
                byte
            }
            1 => regs.ier,
            2 => {
                let iir = regs.iir;
                let rx_pending = iir & 0x0F == IIR_RX;
                let tx_enabled = regs.ier & IER_TX_ENABLE != 0;
                if rx_pending && tx_enabled {
                    regs.iir = IIR_TX;
                } else {
                    regs.iir = IIR_NONE;
                    drop(regs);
                    self.irq.set_level(0);
                }
                iir
            }
            3 => regs.lcr,
            4 => regs.mcr,
            5 => regs.lsr,
            6 => regs.msr,
            7 => regs.scr,
            _ => 0,
        }
    }

    /// Host-side producer: a byte typed on the terminal, or a guest
    /// virtual-console write forwarded from some other host source.
    /// Blocks up to 3 s if the RX slot is still full; drops the byte on
    /// timeout rather than growing an unbounded queue.
    pub fn write_to_serial(&self, c: u8) {
        let mut regs = self.regs.lock().unwrap();
        while regs.lsr & LSR_DATA_READY != 0 {
            let (g, timeout) = self
                .rx_cond
                .wait_timeout(regs, RX_TIMEOUT)
                .unwrap();
            regs = g;
            if timeout.timed_out() && regs.lsr & LSR_DATA_READY != 0 {
                debug!("uart: dropping host input byte, guest not draining RX");
                return;
            }
        }
        regs.rx_byte = c;
        regs.lsr |= LSR_DATA_READY;
        if regs.ier & IER_RX_ENABLE != 0 {
            regs.iir = IIR_RX;
            drop(regs);
            self.irq.set_level(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Building a real VmFd needs /dev/kvm, which isn't available in a test
    // sandbox; these tests exercise the register state machine directly
    // against a no-op IRQ line instead.
    fn test_uart() -> Uart {
        Uart {
            regs: Mutex::new(Registers::default()),
            rx_cond: Condvar::new(),
            irq: IrqLine::noop(),
        }
    }

    #[test]
    fn host_write_then_guest_read_round_trips() {
        let uart = test_uart();
        uart.write_to_serial(b'A');
        assert_eq!(uart.read_reg(5) & LSR_DATA_READY, LSR_DATA_READY);
        assert_eq!(uart.read_reg(0), b'A');
        assert_eq!(uart.read_reg(5) & LSR_DATA_READY, 0);
    }

    #[test]
    fn dlab_multiplexes_divisor_latch() {
        let uart = test_uart();
        uart.write_reg(3, 0x80);
        uart.write_reg(0, 0x0c);
        uart.write_reg(1, 0x00);
        assert_eq!(uart.read_reg(0), 0x0c);
        assert_eq!(uart.read_reg(1), 0x00);
    }
}
