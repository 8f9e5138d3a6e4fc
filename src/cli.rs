//! CLI argument parsing

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Parse a string as a hex or decimal u32
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| format!("Invalid hex value: {}", e))
    } else {
        s.parse::<u32>().map_err(|e| format!("Invalid number: {}", e))
    }
}

/// Parse a size with an optional K, M or G suffix (powers of 1024)
pub fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    let (digits, shift) = match s.chars().last().map(|c| c.to_ascii_uppercase()) {
        Some('K') => (&s[..s.len() - 1], 10),
        Some('M') => (&s[..s.len() - 1], 20),
        Some('G') => (&s[..s.len() - 1], 30),
        _ => (s, 0),
    };
    let value: usize = digits.parse().map_err(|_| {
        format!(
            "Invalid padding size '{}'. Use a number or a number with suffix (K, M, G)",
            s
        )
    })?;
    value
        .checked_mul(1usize << shift)
        .ok_or_else(|| format!("Padding size '{}' is too large", s))
}

/// Generate dynamic help text for the target argument
fn target_help() -> String {
    format!(
        "Target device: a block device path or BACKEND[:key=value,...] [available: {}]",
        c0flash_device::backend_names_short()
    )
}

#[derive(Parser)]
#[command(name = "c0flash")]
#[command(author, version, about = "Signaloid C0-microSD bring-up and flashing tool", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[arg(short, long, global = true, help = target_help())]
    pub target: Option<String>,

    /// Skip device state checks (unknown configuration, wrong mode, image type)
    #[arg(short, long, global = true)]
    pub force: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Flashable sections of a bootloader-managed card
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SectionArg {
    /// Bootloader bitstream (protected)
    Bootloader,
    /// Signaloid Core bitstream (protected)
    Soc,
    /// User bitstream
    User,
    /// User data
    UserData,
}

/// Input file plus optional zero padding
#[derive(clap::Args, Debug, Clone)]
pub struct ImageArgs {
    /// Image file to flash
    pub file: PathBuf,

    /// Pad the image with zeros to this size (e.g. 512K, 1M)
    #[arg(short, long, value_parser = parse_size)]
    pub pad: Option<usize>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the loaded configuration, version and state
    Status,

    /// Toggle the boot configuration (takes effect after a power cycle)
    Switch,

    /// Flash an image into a section and verify it
    Flash {
        /// Section to flash
        #[arg(value_enum)]
        section: SectionArg,

        #[command(flatten)]
        image: ImageArgs,

        /// Do not ask for confirmation before flashing a protected section
        #[arg(short, long)]
        yes: bool,
    },

    /// Check or repair the warmboot section
    Warmboot {
        /// Rewrite the section from the template if it does not match
        #[arg(long)]
        repair: bool,

        /// Do not ask for confirmation before repairing
        #[arg(short, long)]
        yes: bool,
    },

    /// Show identity and verify the stored bitstreams
    Info,

    /// Print the serial number and UUID
    Serial,

    /// Run a command on the Signaloid Core and wait for its result
    Compute {
        /// Command word
        #[arg(value_parser = parse_hex_u32)]
        command: u32,

        /// Command word that returns the core to idle
        #[arg(long, default_value = "0", value_parser = parse_hex_u32)]
        idle: u32,

        /// File copied into the input buffer first
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Write the result buffer to this file instead of printing it
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Number of result bytes to read (defaults to the whole buffer)
        #[arg(short, long)]
        length: Option<usize>,

        /// Do not read the result buffer
        #[arg(long, conflicts_with_all = ["output", "length"])]
        no_result: bool,

        /// Status poll interval while calculating, in microseconds
        #[arg(long, default_value_t = c0flash_core::compute::DEFAULT_POLL_INTERVAL_US)]
        poll_us: u32,
    },

    /// C0-microSD+ operations
    #[command(subcommand)]
    Plus(PlusCommands),

    /// List available backends
    ListBackends,
}

/// Core actions on the C0-microSD+
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoreAction {
    /// Release the core from reset
    Start,
    /// Hold the core in reset
    Stop,
}

#[derive(Subcommand)]
pub enum PlusCommands {
    /// Print the bitstream information and check its CRC
    Info,

    /// Start or stop the Signaloid SoC core
    Core {
        #[arg(value_enum)]
        action: CoreAction,
    },

    /// Flash a bitstream file
    FlashBitstream {
        #[command(flatten)]
        image: ImageArgs,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Flash an application binary
    FlashApplication {
        #[command(flatten)]
        image: ImageArgs,
    },

    /// Show or change the configuration register
    Config {
        /// Write this raw value to the register
        #[arg(long, value_parser = parse_hex_u32)]
        set: Option<u32>,

        /// Set the core boot address
        #[arg(long, value_parser = parse_hex_u32)]
        boot_address: Option<u32>,
    },
}
