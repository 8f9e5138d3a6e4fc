//! SPI host trait
//!
//! The SD-over-SPI transport only needs a half-duplex byte pipe with
//! explicit chip-select control and an exclusive lock, so the same protocol
//! logic runs over Linux spidev, a microcontroller SPI peripheral, or the
//! emulator in `c0flash-dummy`.

use crate::error::Result;
use core::ops::{Deref, DerefMut};

/// Half-duplex SPI host with chip-select and bus-lock primitives
pub trait SpiBus {
    /// Clock out `data`, discarding whatever the card sends back
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Fill `buf` with bytes from the card while clocking out `0xFF`
    fn read(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Drive chip-select active
    fn assert_cs(&mut self) -> Result<()>;

    /// Drive chip-select inactive
    fn release_cs(&mut self) -> Result<()>;

    /// Take exclusive ownership of the bus
    fn lock(&mut self) -> Result<()>;

    /// Give up exclusive ownership of the bus
    fn unlock(&mut self) -> Result<()>;

    /// Delay for the specified number of microseconds
    fn delay_us(&mut self, us: u32);
}

impl<T: SpiBus + ?Sized> SpiBus for &mut T {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        (**self).write(data)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        (**self).read(buf)
    }

    fn assert_cs(&mut self) -> Result<()> {
        (**self).assert_cs()
    }

    fn release_cs(&mut self) -> Result<()> {
        (**self).release_cs()
    }

    fn lock(&mut self) -> Result<()> {
        (**self).lock()
    }

    fn unlock(&mut self) -> Result<()> {
        (**self).unlock()
    }

    fn delay_us(&mut self, us: u32) {
        (**self).delay_us(us)
    }
}

// Blanket impl for boxed buses to allow trait objects
#[cfg(feature = "alloc")]
impl SpiBus for alloc::boxed::Box<dyn SpiBus + Send> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        (**self).write(data)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        (**self).read(buf)
    }

    fn assert_cs(&mut self) -> Result<()> {
        (**self).assert_cs()
    }

    fn release_cs(&mut self) -> Result<()> {
        (**self).release_cs()
    }

    fn lock(&mut self) -> Result<()> {
        (**self).lock()
    }

    fn unlock(&mut self) -> Result<()> {
        (**self).unlock()
    }

    fn delay_us(&mut self, us: u32) {
        (**self).delay_us(us)
    }
}

/// Exclusive, chip-selected ownership of a bus
///
/// [`BusGuard::acquire`] locks the bus and asserts chip-select; dropping
/// the guard releases chip-select and unlocks, whichever way the enclosing
/// transaction ends.
pub struct BusGuard<'a, B: SpiBus + ?Sized> {
    bus: &'a mut B,
}

impl<'a, B: SpiBus + ?Sized> BusGuard<'a, B> {
    /// Lock the bus and select the card
    pub fn acquire(bus: &'a mut B) -> Result<Self> {
        bus.lock()?;
        if let Err(e) = bus.assert_cs() {
            if let Err(unlock_err) = bus.unlock() {
                log::warn!("Failed to unlock SPI bus: {}", unlock_err);
            }
            return Err(e);
        }
        Ok(Self { bus })
    }
}

impl<B: SpiBus + ?Sized> Deref for BusGuard<'_, B> {
    type Target = B;

    fn deref(&self) -> &B {
        self.bus
    }
}

impl<B: SpiBus + ?Sized> DerefMut for BusGuard<'_, B> {
    fn deref_mut(&mut self) -> &mut B {
        self.bus
    }
}

impl<B: SpiBus + ?Sized> Drop for BusGuard<'_, B> {
    fn drop(&mut self) {
        if let Err(e) = self.bus.release_cs() {
            log::warn!("Failed to release chip select: {}", e);
        }
        if let Err(e) = self.bus.unlock() {
            log::warn!("Failed to unlock SPI bus: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[derive(Default)]
    struct Pins {
        locked: bool,
        selected: bool,
        fail_select: bool,
    }

    impl SpiBus for Pins {
        fn write(&mut self, _data: &[u8]) -> Result<()> {
            Ok(())
        }
        fn read(&mut self, buf: &mut [u8]) -> Result<()> {
            buf.fill(0xFF);
            Ok(())
        }
        fn assert_cs(&mut self) -> Result<()> {
            if self.fail_select {
                return Err(Error::BusError);
            }
            self.selected = true;
            Ok(())
        }
        fn release_cs(&mut self) -> Result<()> {
            self.selected = false;
            Ok(())
        }
        fn lock(&mut self) -> Result<()> {
            if self.locked {
                return Err(Error::BusBusy);
            }
            self.locked = true;
            Ok(())
        }
        fn unlock(&mut self) -> Result<()> {
            self.locked = false;
            Ok(())
        }
        fn delay_us(&mut self, _us: u32) {}
    }

    #[test]
    fn guard_releases_on_drop() {
        let mut pins = Pins::default();
        {
            let guard = BusGuard::acquire(&mut pins).unwrap();
            assert!(guard.locked);
            assert!(guard.selected);
        }
        assert!(!pins.locked);
        assert!(!pins.selected);
    }

    #[test]
    fn failed_select_unlocks() {
        let mut pins = Pins {
            fail_select: true,
            ..Default::default()
        };
        assert!(BusGuard::acquire(&mut pins).is_err());
        assert!(!pins.locked);
    }
}
