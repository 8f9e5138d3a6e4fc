//! Bootloader commands

use super::{confirm_action, load_image, SpinnerProgress};
use crate::cli::{ImageArgs, SectionArg};
use crate::error::CliError;
use c0flash_core::adapter::DeviceIo;
use c0flash_core::bootloader::{Controller, Section};
use c0flash_core::flash::MAX_FLASH_ATTEMPTS;
use c0flash_core::status::{DeviceStatus, Mode};
use c0flash_core::Error as CoreError;

type CmdResult = Result<(), Box<dyn std::error::Error>>;

impl From<SectionArg> for Section {
    fn from(arg: SectionArg) -> Self {
        match arg {
            SectionArg::Bootloader => Section::Bootloader,
            SectionArg::Soc => Section::Soc,
            SectionArg::User => Section::UserBitstream,
            SectionArg::UserData => Section::UserData,
        }
    }
}

/// Fetch and print the status, refusing anything but bootloader mode
fn require_bootloader<D: DeviceIo>(controller: &mut Controller<D>) -> Result<DeviceStatus, CoreError> {
    let status = controller.get_status()?;
    println!("{}", status);
    if status.mode != Mode::Bootloader && !controller.force() {
        return Err(CoreError::WrongMode {
            required: Mode::Bootloader,
        });
    }
    Ok(status)
}

/// Print the status record
pub fn cmd_status<D: DeviceIo>(controller: &mut Controller<D>) -> CmdResult {
    let status = controller.get_status()?;
    println!("{}", status);
    log::debug!("Raw state word: 0x{:08X}", status.state);
    Ok(())
}

/// Toggle the boot configuration
pub fn cmd_switch<D: DeviceIo>(controller: &mut Controller<D>) -> CmdResult {
    let before = controller.get_status()?;
    println!("{}", before);
    let after = controller.switch_boot_config()?;
    println!("{}", after);
    println!("Done. Power cycle the device to load the new configuration.");
    Ok(())
}

/// Flash an image into a section
pub fn cmd_flash<D: DeviceIo>(
    controller: &mut Controller<D>,
    section: SectionArg,
    image: &ImageArgs,
    yes: bool,
) -> CmdResult {
    require_bootloader(controller)?;
    let section = Section::from(section);
    let data = load_image(image)?;

    if section.is_protected() {
        confirm_action(yes)?;
    }

    let mut progress = SpinnerProgress::new(section.to_string());
    let verified = controller.flash_section(section, &data, MAX_FLASH_ATTEMPTS, &mut progress)?;
    if !verified {
        progress.finish("Verification failed");
        return Err(CliError::VerifyFailed {
            what: section.to_string(),
            attempts: MAX_FLASH_ATTEMPTS,
        }
        .into());
    }
    progress.finish("Flash verified");
    println!("Done.");
    Ok(())
}

/// Check the warmboot section, rewriting it on request
pub fn cmd_warmboot<D: DeviceIo>(controller: &mut Controller<D>, repair: bool, yes: bool) -> CmdResult {
    require_bootloader(controller)?;

    if controller.verify_warmboot_section(None)? {
        println!("Warmboot section: PASS");
        return Ok(());
    }
    println!("Warmboot section: FAIL");

    if !repair {
        return Err(CliError::Check(
            "warmboot section does not match the expected template, use --repair to rewrite it"
                .into(),
        )
        .into());
    }

    confirm_action(yes)?;
    let mut progress = SpinnerProgress::new("warmboot section");
    if !controller.flash_warmboot_section(MAX_FLASH_ATTEMPTS, &mut progress)? {
        progress.finish("Verification failed");
        return Err(CliError::VerifyFailed {
            what: "warmboot section".into(),
            attempts: MAX_FLASH_ATTEMPTS,
        }
        .into());
    }
    progress.finish("Warmboot section rewritten");
    Ok(())
}

fn print_bitstream_information<D: DeviceIo>(controller: &mut Controller<D>, section: Section) {
    let offset = section.offset(controller.map());
    println!("{} at 0x{:08X}:", section, offset);
    match controller.get_bitstream_prefix(offset) {
        Ok(prefix) => println!("    Bitstream prefix section: {}", prefix.text),
        Err(e) => {
            println!("    Bitstream prefix section: {}", e);
            return;
        }
    }
    match controller.verify_bitstream(offset) {
        Ok(report) => {
            if let Some(kind) = &report.metadata.kind {
                println!("    Type: {}", kind);
            }
            if report.crc_ok() {
                println!("    Bitstream CRC verification: PASS");
            } else {
                println!(
                    "    Bitstream CRC verification: FAIL (expected 0x{:08X}, got 0x{:08X})",
                    report.expected_crc, report.actual_crc
                );
            }
        }
        Err(e) => println!("    Unable to parse prefix for CRC verification: {}", e),
    }
}

/// Print identity and stored bitstream information
pub fn cmd_info<D: DeviceIo>(controller: &mut Controller<D>) -> CmdResult {
    require_bootloader(controller)?;
    println!("Memory map:    v{}", controller.map().version);
    println!("Serial number: {}", controller.get_serial_number()?);
    println!("UUID:          {}", controller.get_uuid()?);
    println!();
    for section in [Section::Bootloader, Section::Soc, Section::UserBitstream] {
        print_bitstream_information(controller, section);
    }
    let warmboot = controller.verify_warmboot_section(None)?;
    println!();
    println!(
        "Warmboot section: {}",
        if warmboot { "PASS" } else { "FAIL" }
    );
    Ok(())
}

/// Print the serial number and UUID
pub fn cmd_serial<D: DeviceIo>(controller: &mut Controller<D>) -> CmdResult {
    require_bootloader(controller)?;
    println!("Serial number: {}", controller.get_serial_number()?);
    println!("UUID:          {}", controller.get_uuid()?);
    Ok(())
}

#[cfg(all(test, feature = "dummy"))]
mod tests {
    use super::*;
    use c0flash_device::open_device;

    fn dummy(target: &str) -> Controller<c0flash_device::BoxedDevice> {
        Controller::connect(open_device(target).unwrap(), false).unwrap()
    }

    #[test]
    fn status_and_info_on_dummy() {
        let mut controller = dummy("dummy");
        cmd_status(&mut controller).unwrap();
        cmd_serial(&mut controller).unwrap();
        cmd_info(&mut controller).unwrap();
    }

    #[test]
    fn flash_user_data() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"user data payload").unwrap();
        let image = ImageArgs {
            file: file.path().to_path_buf(),
            pad: Some(512),
        };

        let mut controller = dummy("dummy");
        cmd_flash(&mut controller, SectionArg::UserData, &image, false).unwrap();

        let offset = controller.map().user_data_offset;
        let stored = controller.device_mut().read(offset, 512).unwrap();
        assert_eq!(&stored[..17], b"user data payload");
        assert!(stored[17..].iter().all(|&b| b == 0));
    }

    #[test]
    fn soc_mode_is_refused() {
        let mut controller = dummy("dummy:mode=soc");
        let err = cmd_serial(&mut controller).err().unwrap();
        assert_eq!(
            err.downcast_ref::<CoreError>(),
            Some(&CoreError::WrongMode {
                required: Mode::Bootloader
            })
        );
    }

    #[test]
    fn warmboot_check_on_blank_card() {
        let mut controller = dummy("dummy");
        let err = cmd_warmboot(&mut controller, false, false).err().unwrap();
        assert!(err.downcast_ref::<CliError>().is_some());

        cmd_warmboot(&mut controller, true, true).unwrap();
        cmd_warmboot(&mut controller, false, false).unwrap();
    }
}
