//! Block device interface driven by the FAT32 layer.

pub use cardfs_err::{BlockError, Result};

/// Logical block size in bytes; fixed for the whole stack.
pub const BLOCK_SIZE: usize = 512;

/// SD/MMC capacity addressing mode, determined during `init()`'s ACMD41 loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityClass {
    /// SDSC: byte-addressed, argument = `lba * 512`.
    StandardCapacity,
    /// SDHC/SDXC: block-addressed, argument = `lba`.
    HighCapacity,
}

/// A bounded busy-poll: replaces ad-hoc iteration-count loops with one
/// abstraction whose exhaustion uniformly surfaces as a timeout.
pub struct PollBudget {
    remaining: u32,
}

impl PollBudget {
    pub fn new(iterations: u32) -> Self {
        PollBudget {
            remaining: iterations,
        }
    }

    /// Consume one attempt. Returns `false` once the budget is exhausted.
    pub fn tick(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }

    /// Poll `condition` until it returns `true` or the budget runs out.
    /// Returns `Err(timeout)` on exhaustion.
    pub fn spin_until<F: FnMut() -> bool>(
        mut self,
        mut condition: F,
        timeout: BlockError,
    ) -> Result<()> {
        loop {
            if condition() {
                return Ok(());
            }
            if !self.tick() {
                return Err(timeout.into());
            }
        }
    }
}

/// Block-level interface the FAT32 layer consumes. Implementations drive a
/// specific MMC host controller; `init()` must be called once before any
/// other operation.
pub trait BlockDevice {
    fn init(&mut self) -> Result<()>;

    fn read_block(&mut self, lba: u32, buf: &mut [u8; BLOCK_SIZE]) -> Result<()>;
    fn read_blocks(&mut self, lba: u32, count: u32, buf: &mut [u8]) -> Result<()>;

    fn write_block(&mut self, lba: u32, buf: &[u8; BLOCK_SIZE]) -> Result<()>;
    fn write_blocks(&mut self, lba: u32, count: u32, buf: &[u8]) -> Result<()>;

    fn erase_blocks(&mut self, start_lba: u32, count: u32) -> Result<()>;

    fn status(&mut self) -> Result<u32>;
    fn wait_ready(&mut self) -> Result<()>;

    fn set_bus_width_4bit(&mut self) -> Result<()>;
    fn set_speed(&mut self, hz: u32) -> Result<()>;

    fn capacity_class(&self) -> CapacityClass;

    /// The argument a data command should carry for `lba`, per the
    /// addressing invariant: `lba` when high-capacity, `lba * 512`
    /// otherwise.
    fn command_argument(&self, lba: u32) -> u32 {
        match self.capacity_class() {
            CapacityClass::HighCapacity => lba,
            CapacityClass::StandardCapacity => lba.wrapping_mul(BLOCK_SIZE as u32),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_budget_exhausts_after_n_ticks() {
        let mut budget = PollBudget::new(3);
        assert!(budget.tick());
        assert!(budget.tick());
        assert!(budget.tick());
        assert!(!budget.tick());
    }

    #[test]
    fn spin_until_succeeds_before_exhaustion() {
        let mut count = 0;
        let budget = PollBudget::new(10);
        let result = budget.spin_until(
            || {
                count += 1;
                count >= 3
            },
            BlockError::CmdTimeout,
        );
        assert!(result.is_ok());
        assert_eq!(count, 3);
    }

    #[test]
    fn spin_until_times_out() {
        let budget = PollBudget::new(3);
        let result = budget.spin_until(|| false, BlockError::CmdTimeout);
        assert!(result.is_err());
    }

    #[test]
    fn command_argument_addressing() {
        struct Fake(CapacityClass);
        impl BlockDevice for Fake {
            fn init(&mut self) -> Result<()> {
                Ok(())
            }
            fn read_block(&mut self, _lba: u32, _buf: &mut [u8; BLOCK_SIZE]) -> Result<()> {
                Ok(())
            }
            fn read_blocks(&mut self, _lba: u32, _count: u32, _buf: &mut [u8]) -> Result<()> {
                Ok(())
            }
            fn write_block(&mut self, _lba: u32, _buf: &[u8; BLOCK_SIZE]) -> Result<()> {
                Ok(())
            }
            fn write_blocks(&mut self, _lba: u32, _count: u32, _buf: &[u8]) -> Result<()> {
                Ok(())
            }
            fn erase_blocks(&mut self, _start_lba: u32, _count: u32) -> Result<()> {
                Ok(())
            }
            fn status(&mut self) -> Result<u32> {
                Ok(0)
            }
            fn wait_ready(&mut self) -> Result<()> {
                Ok(())
            }
            fn set_bus_width_4bit(&mut self) -> Result<()> {
                Ok(())
            }
            fn set_speed(&mut self, _hz: u32) -> Result<()> {
                Ok(())
            }
            fn capacity_class(&self) -> CapacityClass {
                self.0
            }
        }

        let hc = Fake(CapacityClass::HighCapacity);
        assert_eq!(hc.command_argument(42), 42);

        let sc = Fake(CapacityClass::StandardCapacity);
        assert_eq!(sc.command_argument(42), 42 * 512);
    }
}
