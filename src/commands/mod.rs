//! CLI command implementations
//!
//! Commands work on the [`BoxedDevice`] opened from the `--target` string,
//! so the same code drives a card in a host reader, a card on a spidev bus
//! and the in-memory emulator.
//!
//! ## Bootloader commands
//!
//! `status`, `switch`, `flash`, `warmboot`, `info` and `serial` go through
//! the bootloader [`Controller`](c0flash_core::bootloader::Controller).
//!
//! ## Compute commands
//!
//! `compute` and the `plus` family drive a running core through a
//! [`ComputeController`](c0flash_core::compute::ComputeController).

pub mod bootloader;
pub mod compute;
mod list;
pub mod plus;
mod progress;

pub use list::list_backends;
pub use progress::SpinnerProgress;

use crate::cli::ImageArgs;
use crate::error::CliError;
use c0flash_device::{open_device, BoxedDevice};
use std::io::{BufRead, Write};
use std::path::Path;

/// Open the device named by the global `--target`
pub fn open_target(target: Option<&str>) -> Result<BoxedDevice, Box<dyn std::error::Error>> {
    let target = target.ok_or(CliError::MissingTarget)?;
    open_device(target)
}

/// Read a whole input file
pub fn read_file(path: &Path) -> Result<Vec<u8>, CliError> {
    std::fs::read(path).map_err(|source| CliError::Input {
        path: path.to_path_buf(),
        source,
    })
}

/// Read an image and zero-pad it to the requested size
pub fn load_image(args: &ImageArgs) -> Result<Vec<u8>, CliError> {
    let data = read_file(&args.file)?;
    println!("Filename:  {}", args.file.display());
    println!("File size: {} bytes", data.len());
    Ok(pad_image(data, args.pad))
}

fn pad_image(mut data: Vec<u8>, pad: Option<usize>) -> Vec<u8> {
    match pad {
        Some(size) if size > data.len() => {
            data.resize(size, 0x00);
            println!("Input file padded to {} bytes", size);
        }
        Some(size) if size < data.len() => {
            log::warn!(
                "Padding size {} is smaller than the input file, no padding applied",
                size
            );
        }
        _ => {}
    }
    data
}

/// Ask before an operation that can leave the card unbootable
pub fn confirm_action(yes: bool) -> Result<(), CliError> {
    if yes {
        return Ok(());
    }
    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("WARNING: This action may render the device inoperable. Proceed? (y/n): ");
        // A prompt that cannot be shown is treated like any other answer
        let _ = std::io::stdout().flush();
        match lines.next() {
            Some(Ok(line)) => match line.trim().to_lowercase().as_str() {
                "y" => return Ok(()),
                "n" => break,
                _ => println!("Invalid input. Please enter 'y' for yes or 'n' for no."),
            },
            _ => break,
        }
    }
    println!("Aborting.");
    Err(CliError::Declined)
}

/// Write a result to a file
pub fn write_file(path: &Path, data: &[u8]) -> Result<(), CliError> {
    std::fs::write(path, data).map_err(|source| CliError::Output {
        path: path.to_path_buf(),
        source,
    })
}

/// Print a buffer as a hex dump, 16 bytes per line
pub fn print_hex_dump(data: &[u8]) {
    for (i, line) in data.chunks(16).enumerate() {
        let bytes: Vec<String> = line.iter().map(|b| format!("{:02x}", b)).collect();
        let ascii: String = line
            .iter()
            .map(|&b| if (32..=126).contains(&b) { b as char } else { '.' })
            .collect();
        println!("{:08x}  {:<47}  |{}|", i * 16, bytes.join(" "), ascii);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::path::PathBuf;

    #[test]
    fn padding() {
        assert_eq!(pad_image(vec![1, 2], Some(4)), vec![1, 2, 0, 0]);
        assert_eq!(pad_image(vec![1, 2, 3], Some(2)), vec![1, 2, 3]);
        assert_eq!(pad_image(vec![1, 2], None), vec![1, 2]);
    }

    #[test]
    fn load_image_pads_with_zeros() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0xAB; 10]).unwrap();
        let args = ImageArgs {
            file: file.path().to_path_buf(),
            pad: Some(16),
        };
        let data = load_image(&args).unwrap();
        assert_eq!(data.len(), 16);
        assert_eq!(&data[..10], &[0xAB; 10]);
        assert_eq!(&data[10..], &[0; 6]);
    }

    #[test]
    fn missing_input_file() {
        let args = ImageArgs {
            file: PathBuf::from("/nonexistent/bitstream.bin"),
            pad: None,
        };
        let err = load_image(&args).unwrap_err();
        assert!(matches!(err, CliError::Input { .. }));
    }

    #[test]
    fn target_is_required() {
        let err = open_target(None).err().unwrap();
        assert!(err.downcast_ref::<CliError>().is_some());
    }
}
