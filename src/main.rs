//! c0flash - bring-up and flashing tool for Signaloid C0-microSD cards
//!
//! # Architecture
//!
//! Every command starts from the `--target` string, which the backend
//! registry in `c0flash-device` turns into a boxed
//! [`DeviceIo`](c0flash_core::adapter::DeviceIo):
//! - **raw** - the card in a host card reader, accessed as a block device
//! - **spidev** - the card in SD-over-SPI mode on a Linux spidev bus
//! - **dummy** - an in-memory emulator of either card
//!
//! Bootloader commands then wrap the device in a
//! [`Controller`](c0flash_core::bootloader::Controller), compute and
//! C0-microSD+ commands in a
//! [`ComputeController`](c0flash_core::compute::ComputeController).

mod cli;
mod commands;
mod error;

use c0flash_core::bootloader::Controller;
use c0flash_core::compute::ComputeController;
use c0flash_core::memory_map::{C0_MICROSD_PLUS, C0_MICROSD_SOC};
use clap::Parser;
use cli::{Cli, Commands, PlusCommands};
use commands::compute::ComputeArgs;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();

    // Set log level based on verbosity
    match cli.verbose {
        0 => {} // default (info)
        1 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    }

    if let Err(e) = run(cli) {
        eprintln!("{}\nAn error occurred, aborting.", e);
        std::process::exit(error::exit_code(e.as_ref()));
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let target = cli.target.as_deref();
    let force = cli.force;

    let bootloader = || -> Result<_, Box<dyn std::error::Error>> {
        Ok(Controller::connect(commands::open_target(target)?, force)?)
    };
    let plus = || -> Result<_, Box<dyn std::error::Error>> {
        Ok(ComputeController::new(
            commands::open_target(target)?,
            &C0_MICROSD_PLUS,
            force,
        )?)
    };

    match cli.command {
        Commands::Status => commands::bootloader::cmd_status(&mut bootloader()?),
        Commands::Switch => commands::bootloader::cmd_switch(&mut bootloader()?),
        Commands::Flash {
            section,
            image,
            yes,
        } => commands::bootloader::cmd_flash(&mut bootloader()?, section, &image, yes),
        Commands::Warmboot { repair, yes } => {
            commands::bootloader::cmd_warmboot(&mut bootloader()?, repair, yes)
        }
        Commands::Info => commands::bootloader::cmd_info(&mut bootloader()?),
        Commands::Serial => commands::bootloader::cmd_serial(&mut bootloader()?),
        Commands::Compute {
            command,
            idle,
            input,
            output,
            length,
            no_result,
            poll_us,
        } => {
            let device = commands::open_target(target)?;
            let mut controller = ComputeController::new(device, &C0_MICROSD_SOC, force)?;
            let args = ComputeArgs {
                command,
                idle,
                input,
                output,
                length,
                no_result,
                poll_us,
            };
            commands::compute::cmd_compute(&mut controller, &args)
        }
        Commands::Plus(subcmd) => match subcmd {
            PlusCommands::Info => commands::plus::cmd_info(&mut plus()?),
            PlusCommands::Core { action } => commands::plus::cmd_core(&mut plus()?, action),
            PlusCommands::FlashBitstream { image, yes } => {
                commands::plus::cmd_flash_bitstream(&mut plus()?, &image, yes)
            }
            PlusCommands::FlashApplication { image } => {
                commands::plus::cmd_flash_application(&mut plus()?, &image)
            }
            PlusCommands::Config { set, boot_address } => {
                commands::plus::cmd_config(&mut plus()?, set, boot_address)
            }
        },
        Commands::ListBackends => {
            commands::list_backends();
            Ok(())
        }
    }
}
