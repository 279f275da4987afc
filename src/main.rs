//! Binary entry point: parses the CLI, boots the guest, forwards stdin to
//! the UART, and restores the host terminal on exit or SIGINT/SIGTERM.

use std::io::Read;
use std::mem::MaybeUninit;
use std::process;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use simple_logger::SimpleLogger;

use microvmm::config::Config;
use microvmm::power::PowerPort;
use microvmm::Vmm;

/// Puts stdin into raw mode for the VM's lifetime and restores the saved
/// termios on drop, so a panic or early return never leaves the host shell
/// in raw mode.
struct RawTerminalGuard {
    saved: libc::termios,
}

impl RawTerminalGuard {
    fn enable() -> Option<RawTerminalGuard> {
        if unsafe { libc::isatty(libc::STDIN_FILENO) } == 0 {
            return None;
        }
        let mut saved = MaybeUninit::<libc::termios>::uninit();
        if unsafe { libc::tcgetattr(libc::STDIN_FILENO, saved.as_mut_ptr()) } != 0 {
            return None;
        }
        let saved = unsafe { saved.assume_init() };

        let mut raw = saved;
        unsafe { libc::cfmakeraw(&mut raw) };
        unsafe { libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &raw) };

        Some(RawTerminalGuard { saved })
    }
}

impl Drop for RawTerminalGuard {
    fn drop(&mut self) {
        unsafe {
            libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &self.saved);
        }
    }
}

static mut QUIT_FLAG: Option<Arc<std::sync::atomic::AtomicBool>> = None;
static mut POWER_PORT: Option<Arc<PowerPort>> = None;

/// Requests a graceful guest shutdown via the power port (mirroring
/// `mvvm_shutdown()`) and sets the hard-kill `quit` flag as a fallback in
/// case the guest has no companion module listening for it.
extern "C" fn handle_shutdown_signal(_sig: libc::c_int) {
    unsafe {
        if let Some(power) = &POWER_PORT {
            power.request_shutdown();
        }
        if let Some(flag) = &QUIT_FLAG {
            flag.store(true, Ordering::SeqCst);
        }
    }
}

/// Installs a signal handler that requests a guest shutdown and sets `quit`,
/// relying on the VCPU thread's own SIGTERM-blocking discipline to make the
/// store visible promptly. Must run before any other thread reads
/// `QUIT_FLAG`/`POWER_PORT`.
fn install_shutdown_handler(quit: Arc<std::sync::atomic::AtomicBool>, power: Arc<PowerPort>) {
    unsafe {
        QUIT_FLAG = Some(quit);
        POWER_PORT = Some(power);
        libc::signal(libc::SIGINT, handle_shutdown_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_shutdown_signal as libc::sighandler_t);
    }
}

fn main() {
    SimpleLogger::new().init().unwrap();

    let config = Config::from_args();

    let vmm = Vmm::new(&config).unwrap_or_else(|e| {
        eprintln!("failed to start microvmm: {}", e);
        process::exit(1);
    });

    install_shutdown_handler(Arc::clone(&vmm.quit), Arc::clone(&vmm.power));
    let _raw_guard = RawTerminalGuard::enable();

    let uart = Arc::clone(&vmm.uart);
    thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut byte = [0u8; 1];
        while let Ok(n) = stdin.read(&mut byte) {
            if n == 0 {
                break;
            }
            uart.write_to_serial(byte[0]);
        }
    });

    let code = vmm.run();
    process::exit(code);
}
