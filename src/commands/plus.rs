//! C0-microSD+ commands

use super::{confirm_action, load_image, SpinnerProgress};
use crate::cli::{CoreAction, ImageArgs};
use crate::error::CliError;
use c0flash_core::adapter::DeviceIo;
use c0flash_core::compute::ComputeController;
use c0flash_core::flash::MAX_FLASH_ATTEMPTS;

type CmdResult = Result<(), Box<dyn std::error::Error>>;

/// Print the stored bitstream information and check its CRC
pub fn cmd_info<D: DeviceIo>(controller: &mut ComputeController<D>) -> CmdResult {
    println!("Reading bitstream:");
    let report = controller.verify_bitstream()?;
    println!("    Bitstream prefix section: {}", report.prefix.text);
    if report.crc_ok() {
        println!("    Bitstream CRC verification: PASS");
    } else {
        println!(
            "    Bitstream CRC verification: FAIL (expected 0x{:08X}, got 0x{:08X})",
            report.expected_crc, report.actual_crc
        );
    }
    println!("Done.");
    Ok(())
}

/// Start or stop the core
pub fn cmd_core<D: DeviceIo>(controller: &mut ComputeController<D>, action: CoreAction) -> CmdResult {
    match action {
        CoreAction::Start => {
            println!("Starting Signaloid SoC core");
            controller.start_core()?;
        }
        CoreAction::Stop => {
            println!("Stopping Signaloid SoC core");
            controller.stop_core()?;
        }
    }
    Ok(())
}

fn verified(progress: &mut SpinnerProgress, ok: bool, what: &str) -> CmdResult {
    if !ok {
        progress.finish("Verification failed");
        return Err(CliError::VerifyFailed {
            what: what.into(),
            attempts: MAX_FLASH_ATTEMPTS,
        }
        .into());
    }
    progress.finish("Flash verified");
    Ok(())
}

/// Flash the FPGA bitstream
pub fn cmd_flash_bitstream<D: DeviceIo>(
    controller: &mut ComputeController<D>,
    image: &ImageArgs,
    yes: bool,
) -> CmdResult {
    let data = load_image(image)?;
    confirm_action(yes)?;
    println!("Flashing bitstream...");
    let mut progress = SpinnerProgress::new("bitstream");
    let ok = controller.flash_bitstream(&data, MAX_FLASH_ATTEMPTS, &mut progress)?;
    verified(&mut progress, ok, "bitstream")
}

/// Flash the application binary
pub fn cmd_flash_application<D: DeviceIo>(
    controller: &mut ComputeController<D>,
    image: &ImageArgs,
) -> CmdResult {
    let data = load_image(image)?;
    println!("Flashing Signaloid SoC application...");
    let mut progress = SpinnerProgress::new("application");
    let ok = controller.flash_application(&data, MAX_FLASH_ATTEMPTS, &mut progress)?;
    verified(&mut progress, ok, "application")
}

/// Show, and optionally change, the configuration register
pub fn cmd_config<D: DeviceIo>(
    controller: &mut ComputeController<D>,
    set: Option<u32>,
    boot_address: Option<u32>,
) -> CmdResult {
    if let Some(value) = set {
        controller.write_config_register(value)?;
    }
    if let Some(address) = boot_address {
        controller.set_boot_address(address)?;
    }

    let raw = controller.read_config_register()?;
    let config = controller.config()?;
    println!("Configuration register: 0x{:08X}", raw);
    println!("  Core running:       {}", config.reset_n);
    println!("  Bitstream unlocked: {}", config.unlock_bitstream);
    println!("  LED override:       {}", config.led_enable);
    println!("  LED:                {}", config.led);
    println!("Boot address:           0x{:08X}", controller.boot_address()?);
    println!("Core status:            {}", controller.status()?);
    Ok(())
}

#[cfg(all(test, feature = "dummy"))]
mod tests {
    use super::*;
    use c0flash_core::memory_map::{C0_MICROSD_PLUS, PLUS_APPLICATION_OFFSET};
    use c0flash_device::{open_device, BoxedDevice};
    use std::io::Write;

    fn plus() -> ComputeController<BoxedDevice> {
        let device = open_device("dummy:model=plus").unwrap();
        ComputeController::new(device, &C0_MICROSD_PLUS, false).unwrap()
    }

    #[test]
    fn core_lifecycle_and_config() {
        let mut controller = plus();
        cmd_core(&mut controller, CoreAction::Start).unwrap();
        assert_eq!(controller.read_config_register().unwrap(), 1);
        cmd_config(&mut controller, None, Some(0x0018_0000)).unwrap();
        assert_eq!(controller.boot_address().unwrap(), 0x0018_0000);
        cmd_core(&mut controller, CoreAction::Stop).unwrap();
        assert_eq!(controller.read_config_register().unwrap(), 0);
    }

    #[test]
    fn flash_application_binary() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0x13, 0x00, 0x00, 0x00]).unwrap();
        let image = ImageArgs {
            file: file.path().to_path_buf(),
            pad: None,
        };

        let mut controller = plus();
        cmd_flash_application(&mut controller, &image).unwrap();
        let stored = controller
            .device_mut()
            .read(PLUS_APPLICATION_OFFSET, 4)
            .unwrap();
        assert_eq!(stored, [0x13, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn info_on_blank_card_has_no_prefix() {
        let mut controller = plus();
        let err = cmd_info(&mut controller).err().unwrap();
        assert_eq!(
            err.downcast_ref::<c0flash_core::Error>(),
            Some(&c0flash_core::Error::PrefixNotFound)
        );
    }
}
