//! The interrupt source collaborator and the internal pulse abstraction
//! used to hand work from the ISR to the deferred-processing thread.

use crossbeam_channel::{Receiver, Sender};

/// External collaborator that delivers hardware interrupts to the ISR
/// thread. PCI/MSI setup and region mapping stay outside the core; this
/// trait is the interrupt source's interface into it.
pub trait InterruptSource: Send {
    /// Blocks until a hardware interrupt has occurred or a shutdown was
    /// requested. Returns `false` on shutdown, in which case the ISR
    /// thread must exit without processing further interrupts.
    fn wait(&mut self) -> bool;

    /// Re-arms interrupt delivery after the ISR has drained the device.
    fn ack(&mut self);
}

/// Two pulses travel the channel: a hardware interrupt occurred, or a
/// graceful shutdown was requested. Used both for the UIO-backed external
/// interrupt source and for the driver's internal ISR -> deferred-thread
/// handoff between the ISR and the deferred-processing thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pulse {
    Interrupt,
    Terminate,
}

/// Creates the bounded pulse channel the deferred-processing thread waits
/// on. A small capacity is enough: pulses coalesce naturally (the deferred
/// thread drains everything pending each time it wakes).
pub fn pulse_channel() -> (Sender<Pulse>, Receiver<Pulse>) {
    crossbeam_channel::bounded(16)
}

/// Linux UIO-backed interrupt source: blocking `read()` on a UIO character
/// device delivers one `u32` interrupt count per hardware interrupt; a
/// `write()` of the same count re-enables delivery. This is the standard
/// way to hand a PCI interrupt to a userspace process without writing a
/// kernel driver.
pub struct UioInterruptSource {
    file: std::fs::File,
    shutdown: Receiver<Pulse>,
}

impl UioInterruptSource {
    pub fn open(path: &std::path::Path, shutdown: Receiver<Pulse>) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
        Ok(UioInterruptSource { file, shutdown })
    }
}

impl InterruptSource for UioInterruptSource {
    fn wait(&mut self) -> bool {
        use std::io::Read;

        if self.shutdown.try_recv().is_ok() {
            return false;
        }
        let mut count = [0u8; 4];
        match self.file.read_exact(&mut count) {
            Ok(()) => true,
            Err(err) => {
                log::warn!("uio interrupt read failed: {err}");
                false
            }
        }
    }

    fn ack(&mut self) {
        use std::io::Write;

        let count = [1u8, 0, 0, 0];
        if let Err(err) = self.file.write_all(&count) {
            log::warn!("uio interrupt re-arm failed: {err}");
        }
    }
}

/// Channel-backed interrupt source for tests: `notify()` simulates a
/// hardware interrupt, `shutdown()` simulates `Terminate`.
pub struct ChannelInterruptSource {
    rx: Receiver<Pulse>,
}

impl ChannelInterruptSource {
    pub fn new() -> (Self, Sender<Pulse>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (ChannelInterruptSource { rx }, tx)
    }
}

impl InterruptSource for ChannelInterruptSource {
    fn wait(&mut self) -> bool {
        matches!(self.rx.recv(), Ok(Pulse::Interrupt))
    }

    fn ack(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_source_stops_on_terminate() {
        let (mut source, tx) = ChannelInterruptSource::new();
        tx.send(Pulse::Terminate).unwrap();
        assert!(!source.wait());
    }

    #[test]
    fn channel_source_wakes_on_interrupt() {
        let (mut source, tx) = ChannelInterruptSource::new();
        tx.send(Pulse::Interrupt).unwrap();
        assert!(source.wait());
    }
}
