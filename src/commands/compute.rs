//! Signaloid Core command execution

use super::{print_hex_dump, read_file, write_file};
use c0flash_core::adapter::DeviceIo;
use c0flash_core::compute::{CalculateOptions, ComputeController};
use std::path::PathBuf;

/// Arguments of the `compute` command
#[derive(Debug, Clone)]
pub struct ComputeArgs {
    pub command: u32,
    pub idle: u32,
    pub input: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub length: Option<usize>,
    pub no_result: bool,
    pub poll_us: u32,
}

/// Run one command on the core and report its result
pub fn cmd_compute<D: DeviceIo>(
    controller: &mut ComputeController<D>,
    args: &ComputeArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(path) = &args.input {
        let data = read_file(path)?;
        log::info!("Writing {} bytes to the input buffer", data.len());
        controller.write_input_buffer(&data)?;
    }

    let options = CalculateOptions {
        poll_interval_us: args.poll_us,
        skip_result_read: args.no_result,
        result_len: args.length,
    };
    log::info!(
        "Running command 0x{:08X} on {} (idle 0x{:08X})",
        args.command,
        controller.map().name,
        args.idle
    );
    let result = controller.calculate_command_with(args.command, args.idle, &options)?;

    match (result, &args.output) {
        (Some(data), Some(path)) => {
            write_file(path, &data)?;
            println!("Wrote {} result bytes to {}", data.len(), path.display());
        }
        (Some(data), None) => print_hex_dump(&data),
        (None, _) => println!("Done."),
    }
    Ok(())
}

#[cfg(all(test, feature = "dummy"))]
mod tests {
    use super::*;
    use c0flash_core::memory_map::C0_MICROSD_SOC;
    use c0flash_device::open_device;
    use c0flash_dummy::INVERT_COMMAND;
    use std::io::Write;

    #[test]
    fn invert_input_on_dummy_soc() {
        let mut input = tempfile::NamedTempFile::new().unwrap();
        input.write_all(&[0x00, 0x0F, 0xF0, 0xFF]).unwrap();
        let output = tempfile::NamedTempFile::new().unwrap();

        let device = open_device("dummy:mode=soc").unwrap();
        let mut controller = ComputeController::new(device, &C0_MICROSD_SOC, false).unwrap();
        let args = ComputeArgs {
            command: INVERT_COMMAND,
            idle: 0,
            input: Some(input.path().to_path_buf()),
            output: Some(output.path().to_path_buf()),
            length: Some(4),
            no_result: false,
            poll_us: 0,
        };
        cmd_compute(&mut controller, &args).unwrap();
        assert_eq!(
            std::fs::read(output.path()).unwrap(),
            vec![0xFF, 0xF0, 0x0F, 0x00]
        );
    }
}
