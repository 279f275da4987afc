//! Command-line parsing: `-k`/`-i`/`-m`/`-d`/`-t`/`-a`/`-h`, by hand, in the
//! teacher's `env::args()` style (`examples/echoer.rs`) rather than a
//! parsing crate.

use std::env;
use std::process;

use crate::boot::DEFAULT_CMDLINE;

pub struct Config {
    pub kernel_path: String,
    pub initrd_path: Option<String>,
    pub memory_size: u64,
    pub disk_path: Option<String>,
    pub tap_name: Option<String>,
    pub cmdline: String,
}

const USAGE: &str = "Usage: microvmm -k VMLINUZ [-i INITRD] [-m SIZE[K|M|G]] [-d DISK] [-t TAPNAME] [-a CMDLINE]";

fn usage_exit() -> ! {
    eprintln!("{}", USAGE);
    process::exit(2);
}

/// Parses `SIZE[K|M|G]` with base-0 numeric parsing (accepts `0x`/`0`
/// prefixes), matching the CLI's `-m` contract.
fn parse_memory_size(s: &str) -> Option<u64> {
    let (digits, mult) = match s.chars().last() {
        Some('K') | Some('k') => (&s[..s.len() - 1], 1024),
        Some('M') | Some('m') => (&s[..s.len() - 1], 1024 * 1024),
        Some('G') | Some('g') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    let value = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()?
    } else if digits.len() > 1 && digits.starts_with('0') {
        u64::from_str_radix(&digits[1..], 8).ok()?
    } else {
        digits.parse::<u64>().ok()?
    };
    Some(value * mult)
}

impl Config {
    pub fn from_args() -> Config {
        let mut kernel_path = None;
        let mut initrd_path = None;
        let mut memory_size: u64 = 1024 * 1024 * 1024;
        let mut disk_path = None;
        let mut tap_name = None;
        let mut cmdline = DEFAULT_CMDLINE.to_string();

        let mut args = env::args();
        args.next();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-k" => kernel_path = Some(next_value(&mut args)),
                "-i" => initrd_path = Some(next_value(&mut args)),
                "-m" => {
                    let raw = next_value(&mut args);
                    memory_size = parse_memory_size(&raw).unwrap_or_else(|| {
                        eprintln!("invalid memory size: {}", raw);
                        process::exit(2);
                    });
                }
                "-d" => disk_path = Some(next_value(&mut args)),
                "-t" => tap_name = Some(next_value(&mut args)),
                "-a" => cmdline = next_value(&mut args),
                "-h" => {
                    println!("{}", USAGE);
                    process::exit(0);
                }
                other => {
                    eprintln!("unknown option: {}", other);
                    usage_exit();
                }
            }
        }

        let kernel_path = kernel_path.unwrap_or_else(|| {
            eprintln!("-k VMLINUZ is required");
            usage_exit();
        });

        Config {
            kernel_path,
            initrd_path,
            memory_size,
            disk_path,
            tap_name,
            cmdline,
        }
    }
}

fn next_value(args: &mut env::Args) -> String {
    args.next().unwrap_or_else(|| usage_exit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_suffixed_sizes() {
        assert_eq!(parse_memory_size("256M"), Some(256 * 1024 * 1024));
        assert_eq!(parse_memory_size("1G"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_memory_size("512K"), Some(512 * 1024));
    }

    #[test]
    fn parses_hex_and_decimal() {
        assert_eq!(parse_memory_size("0x10000000"), Some(0x1000_0000));
        assert_eq!(parse_memory_size("1048576"), Some(1_048_576));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_memory_size("not-a-size"), None);
    }
}
