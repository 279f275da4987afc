//! TAP device backend: opens `/dev/net/tun`, attaches it to a named
//! interface with `TUNSETIFF`, and exposes blocking-with-timeout receive
//! plus best-effort send.
//!
//! Grounded in `original_source/netdev.c`'s `tap_open`/`net_rx_thread` and
//! the teacher's raw-ioctl style in `vfio.rs`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::sync::Mutex;
use std::time::Duration;

use crate::virtio_net::TapBackend;

const TUNSETIFF: u64 = 0x4004_54CA;
const IFF_TAP: i16 = 0x0002;
const IFF_NO_PI: i16 = 0x1000;
const IFNAMSIZ: usize = 16;

#[repr(C)]
struct IfReq {
    name: [u8; IFNAMSIZ],
    flags: i16,
    _pad: [u8; 22],
}

pub struct TapEndpoint {
    file: Mutex<File>,
}

impl TapEndpoint {
    pub fn open(name: &str) -> Result<TapEndpoint, Box<dyn std::error::Error>> {
        if name.len() >= IFNAMSIZ {
            return Err(format!("tap device name {} too long", name).into());
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open("/dev/net/tun")
            .map_err(|e| format!("opening /dev/net/tun: {}", e))?;

        let mut req = IfReq {
            name: [0u8; IFNAMSIZ],
            flags: IFF_TAP | IFF_NO_PI,
            _pad: [0u8; 22],
        };
        req.name[..name.len()].copy_from_slice(name.as_bytes());

        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut req) };
        if ret < 0 {
            return Err(format!(
                "TUNSETIFF on {} failed. Errno: {}",
                name,
                std::io::Error::last_os_error()
            )
            .into());
        }

        Ok(TapEndpoint {
            file: Mutex::new(file),
        })
    }

    fn poll_readable(fd: i32, timeout: Duration) -> bool {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let ms = timeout.as_millis() as i32;
        let ret = unsafe { libc::poll(&mut pfd, 1, ms) };
        ret > 0 && pfd.revents & libc::POLLIN != 0
    }
}

impl TapBackend for TapEndpoint {
    fn send(&self, frame: &[u8]) -> bool {
        let mut file = self.file.lock().unwrap();
        file.write_all(frame).is_ok()
    }

    /// Polls the TAP fd once with `timeout`; if readable, reads frames
    /// until the kernel returns EAGAIN, invoking `on_frame` for each.
    fn poll_recv(&self, timeout: Duration, on_frame: &mut dyn FnMut(&[u8])) {
        let fd = { self.file.lock().unwrap().as_raw_fd() };
        if !Self::poll_readable(fd, timeout) {
            return;
        }
        let mut buf = [0u8; 65536];
        loop {
            let mut file = self.file.lock().unwrap();
            match file.read(&mut buf) {
                Ok(n) if n > 0 => {
                    drop(file);
                    on_frame(&buf[..n]);
                }
                _ => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_too_long_is_rejected() {
        let err = TapEndpoint::open("this-name-is-way-too-long-for-ifreq");
        assert!(err.is_err());
    }
}
