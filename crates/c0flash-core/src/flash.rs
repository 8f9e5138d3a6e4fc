//! Write-and-verify flashing
//!
//! The one place a failed operation is retried automatically: an image is
//! written, read back and compared, up to a fixed number of attempts.

use crate::adapter::DeviceIo;
use crate::error::Result;

/// Default number of write-verify attempts
pub const MAX_FLASH_ATTEMPTS: u32 = 5;

/// Progress callbacks for [`write_and_verify`]
pub trait FlashProgress {
    /// Called before each write attempt
    fn attempt(&mut self, attempt: u32, max_attempts: u32, bytes: usize);

    /// Called after the write, before reading back
    fn verifying(&mut self);

    /// Called with the outcome of the comparison
    fn verified(&mut self, matched: bool);
}

/// A no-op progress reporter
pub struct NoProgress;

impl FlashProgress for NoProgress {
    fn attempt(&mut self, _attempt: u32, _max_attempts: u32, _bytes: usize) {}
    fn verifying(&mut self) {}
    fn verified(&mut self, _matched: bool) {}
}

/// Write `data` at `offset` and read it back until it matches
///
/// Returns `Ok(false)` once `max_attempts` writes all failed to verify.
/// I/O and protocol errors abort immediately.
pub fn write_and_verify<D: DeviceIo + ?Sized, P: FlashProgress + ?Sized>(
    device: &mut D,
    data: &[u8],
    offset: u64,
    max_attempts: u32,
    progress: &mut P,
) -> Result<bool> {
    for attempt in 1..=max_attempts {
        log::debug!(
            "Attempt {} of {}: writing {} bytes at 0x{:08X}",
            attempt,
            max_attempts,
            data.len(),
            offset
        );
        progress.attempt(attempt, max_attempts, data.len());
        device.write(offset, data)?;

        progress.verifying();
        let readback = device.read(offset, data.len())?;
        let matched = readback == data;
        progress.verified(matched);
        if matched {
            log::info!("Verified {} bytes at 0x{:08X}", data.len(), offset);
            return Ok(true);
        }
        log::warn!("Attempt {} of {}: data mismatch", attempt, max_attempts);
    }
    Ok(false)
}
