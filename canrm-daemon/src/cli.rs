//! Command-line surface for the daemon, parsed with `clap`'s derive API.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Userspace resource manager for an SJA1000 CAN controller.
#[derive(Parser, Debug)]
#[command(name = "canrm-daemon", version, about)]
pub struct Cli {
    /// Bus baud rate in kbit/s (one of the nine SJA1000 bit-timing presets).
    #[arg(short = 's', long = "baud", default_value_t = 125)]
    pub baud_kbps: u32,

    /// Device node name, registered under `/dev/<name>`.
    #[arg(short = 'd', long = "name", default_value = "can0")]
    pub name: String,

    /// Shared receive ring capacity, as the exponent `k` in `2^k` frames.
    #[arg(short = 'B', long = "ring-size", default_value_t = 8, value_parser = clap::value_parser!(u32).range(0..=24))]
    pub ring_k: u32,

    /// Run in the foreground instead of daemonizing.
    #[arg(short = 't', long = "test")]
    pub test_mode: bool,

    /// Attach after any resource manager already registered at this path.
    #[arg(short = 'a', conflicts_with = "before")]
    pub after: bool,

    /// Attach before any resource manager already registered at this path.
    #[arg(short = 'b', conflicts_with = "after")]
    pub before: bool,

    /// Change the working directory before attaching the device node.
    #[arg(short = 'r', long = "chdir")]
    pub chdir: Option<PathBuf>,

    /// Register-access backend.
    #[arg(short = 'm', long = "mode", default_value_t = RegisterMode::Mmap, value_enum)]
    pub mode: RegisterMode,

    /// UIO device node backing the interrupt source.
    #[arg(long = "uio", default_value = "/dev/uio0")]
    pub uio_path: PathBuf,

    /// PCI BAR resource file (or `/dev/mem`) to map in `mmap` mode.
    #[arg(long = "mmio-file", required_if_eq("mode", "mmap"))]
    pub mmio_file: Option<PathBuf>,

    /// Byte offset of the register file within `--mmio-file`.
    #[arg(long = "mmio-offset", default_value_t = 0)]
    pub mmio_offset: u64,

    /// Number of bytes to map starting at `--mmio-offset`.
    #[arg(long = "mmio-len", default_value_t = 256)]
    pub mmio_len: usize,

    /// Register address shift: register `offset` maps to byte
    /// `offset << shift` within the mapping.
    #[arg(long = "shift", default_value_t = 0)]
    pub shift: u8,

    /// I/O port base address to use in `port` mode (x86 only).
    #[arg(long = "port-base", required_if_eq("mode", "port"))]
    pub port_base: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RegisterMode {
    Mmap,
    Port,
}

impl std::fmt::Display for RegisterMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegisterMode::Mmap => write!(f, "mmap"),
            RegisterMode::Port => write!(f, "port"),
        }
    }
}

impl Cli {
    /// The path the device node is registered under, e.g. `/dev/can0`.
    pub fn device_path(&self) -> PathBuf {
        PathBuf::from("/dev").join(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_baseline() {
        let cli = Cli::parse_from(["canrm-daemon", "--mmio-file", "/sys/bus/pci/devices/0/resource0"]);
        assert_eq!(cli.baud_kbps, 125);
        assert_eq!(cli.name, "can0");
        assert_eq!(cli.ring_k, 8);
        assert_eq!(cli.mode, RegisterMode::Mmap);
        assert_eq!(cli.device_path(), PathBuf::from("/dev/can0"));
    }

    #[test]
    fn before_and_after_are_mutually_exclusive() {
        let result = Cli::try_parse_from([
            "canrm-daemon",
            "--mmio-file",
            "/sys/bus/pci/devices/0/resource0",
            "-a",
            "-b",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn port_mode_requires_a_port_base() {
        let result = Cli::try_parse_from(["canrm-daemon", "-m", "port"]);
        assert!(result.is_err());
    }
}
