//! Picks the concrete register backend the CLI selected. Kept as a small
//! enum rather than a trait object so `Sja1000Driver` stays generic over a
//! `Sized` type, matching how `canrm-core` exercises it in tests.

use canrm_core::RegisterAccess;

use crate::cli::{Cli, RegisterMode};

pub enum AnyRegisters {
    Mmio(canrm_core::MmioRegisters),
    #[cfg(target_arch = "x86_64")]
    Port(canrm_core::regs::PortRegisters),
}

impl RegisterAccess for AnyRegisters {
    fn put_byte(&self, offset: u8, value: u8) {
        match self {
            AnyRegisters::Mmio(regs) => regs.put_byte(offset, value),
            #[cfg(target_arch = "x86_64")]
            AnyRegisters::Port(regs) => regs.put_byte(offset, value),
        }
    }

    fn get_byte(&self, offset: u8) -> u8 {
        match self {
            AnyRegisters::Mmio(regs) => regs.get_byte(offset),
            #[cfg(target_arch = "x86_64")]
            AnyRegisters::Port(regs) => regs.get_byte(offset),
        }
    }
}

pub fn build(cli: &Cli) -> anyhow::Result<AnyRegisters> {
    match cli.mode {
        RegisterMode::Mmap => {
            let path = cli
                .mmio_file
                .as_ref()
                .expect("clap enforces --mmio-file when -m mmap is selected");
            let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
            let regs = canrm_core::MmioRegisters::map(&file, cli.mmio_offset, cli.mmio_len, cli.shift)?;
            Ok(AnyRegisters::Mmio(regs))
        }
        #[cfg(target_arch = "x86_64")]
        RegisterMode::Port => {
            let base = cli
                .port_base
                .expect("clap enforces --port-base when -m port is selected");
            // SAFETY: the operator is expected to run this daemon with the
            // I/O privilege the target board's port range requires (e.g.
            // via `setcap cap_sys_rawio` or running as root under `iopl`).
            let regs = unsafe { canrm_core::regs::PortRegisters::new(base) };
            Ok(AnyRegisters::Port(regs))
        }
        #[cfg(not(target_arch = "x86_64"))]
        RegisterMode::Port => {
            anyhow::bail!("port-mapped I/O is only available on x86_64 targets")
        }
    }
}
