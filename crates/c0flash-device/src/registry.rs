//! Backend registry
//!
//! This module opens backends by name and hands back a type-erased
//! [`DeviceIo`], so the CLI never deals with a concrete backend type.

use c0flash_core::adapter::DeviceIo;
use std::collections::HashMap;

/// A type-erased device
pub type BoxedDevice = Box<dyn DeviceIo + Send>;

/// Parsed target parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetParams {
    /// Backend name
    pub name: String,
    /// Key-value parameters
    pub params: HashMap<String, String>,
}

impl TargetParams {
    fn options(&self) -> Vec<(&str, &str)> {
        let mut options: Vec<_> = self
            .params
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .collect();
        options.sort_unstable();
        options
    }
}

/// Parse a target string into backend name and parameters
///
/// Format: "name", "name:key1=value1,key2=value2", or a bare device path,
/// which is shorthand for `raw:dev=PATH`.
///
/// # Example
/// ```
/// use c0flash_device::parse_target_params;
///
/// let params = parse_target_params("spidev:dev=/dev/spidev0.0,spispeed=4000").unwrap();
/// assert_eq!(params.name, "spidev");
/// assert_eq!(params.params.get("spispeed"), Some(&"4000".to_string()));
/// ```
pub fn parse_target_params(s: &str) -> Result<TargetParams, Box<dyn std::error::Error>> {
    if s.is_empty() {
        return Err("Empty target".into());
    }
    if s.starts_with('/') || s.starts_with('.') {
        return Ok(TargetParams {
            name: "raw".into(),
            params: HashMap::from([("dev".to_string(), s.to_string())]),
        });
    }

    let (name, rest) = match s.split_once(':') {
        Some((name, rest)) => (name, rest),
        None => (s, ""),
    };
    let params = rest
        .split(',')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            pair.split_once('=')
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .ok_or_else(|| format!("Target option '{}' is not key=value", pair))
        })
        .collect::<Result<HashMap<_, _>, _>>()?;

    Ok(TargetParams {
        name: name.into(),
        params,
    })
}

/// Open a device from a target string
///
/// # Example
/// ```ignore
/// let mut device = open_device("raw:dev=/dev/sdb")?;
/// let mut controller = Controller::connect(device, false)?;
/// ```
pub fn open_device(target: &str) -> Result<BoxedDevice, Box<dyn std::error::Error>> {
    let params = parse_target_params(target)?;

    match params.name.as_str() {
        #[cfg(feature = "raw")]
        "raw" | "host" => open_raw(&params),

        #[cfg(feature = "spidev")]
        "spidev" | "linux_spi" | "linux-spi" => open_spidev(&params),

        #[cfg(feature = "dummy")]
        "dummy" => open_dummy(&params),

        _ => Err(format!(
            "Unknown backend: {} (available: {})",
            params.name,
            backend_names_short()
        )
        .into()),
    }
}

#[cfg(feature = "raw")]
fn open_raw(params: &TargetParams) -> Result<BoxedDevice, Box<dyn std::error::Error>> {
    use c0flash_host::{parse_options, HostError, RawDevice};

    let config = parse_options(&params.options())?;
    log::info!("Opening raw device {}...", config.device.display());

    let device = RawDevice::open(&config).map_err(|e| -> Box<dyn std::error::Error> {
        match e {
            HostError::DeviceNotFound(_) | HostError::PermissionDenied(_) => {
                log::error!("{}", e);
                if matches!(e, HostError::PermissionDenied(_)) {
                    log::error!(
                        "Raw access to a block device usually needs root or membership of the disk group."
                    );
                }
                Box::new(e.to_core())
            }
            other => other.into(),
        }
    })?;
    Ok(Box::new(device))
}

#[cfg(feature = "spidev")]
fn open_spidev(params: &TargetParams) -> Result<BoxedDevice, Box<dyn std::error::Error>> {
    use c0flash_core::adapter::SdBlockDevice;
    use c0flash_core::sdspi::{SdSpi, SdSpiConfig};
    use c0flash_spidev::{parse_options, Spidev};

    log::info!("Opening spidev bus...");

    let mut sd_config = SdSpiConfig::default();
    if let Some(value) = params.params.get("timeout") {
        sd_config.timeout = value
            .parse()
            .map_err(|_| format!("Invalid timeout value: {}", value))?;
    }
    if let Some(value) = params.params.get("dummy_bytes") {
        sd_config.dummy_bytes = value
            .parse()
            .map_err(|_| format!("Invalid dummy_bytes value: {}", value))?;
    }

    let options: Vec<(&str, &str)> = params
        .options()
        .into_iter()
        .filter(|(k, _)| !matches!(*k, "timeout" | "dummy_bytes"))
        .collect();
    let config = parse_options(&options).map_err(|e| format!("Invalid spidev parameters: {}", e))?;

    let bus = Spidev::open(&config).map_err(|e| {
        log::error!("Failed to open spidev device: {}", e);
        log::error!("Make sure the device exists and you have read/write permissions.");
        log::error!("You may need to: sudo usermod -aG spi $USER");
        e.to_core()
    })?;

    let device = SdBlockDevice::init(SdSpi::with_config(bus, sd_config)).map_err(|e| {
        log::error!("SD card initialization failed");
        e
    })?;
    Ok(Box::new(device))
}

#[cfg(feature = "dummy")]
fn open_dummy(params: &TargetParams) -> Result<BoxedDevice, Box<dyn std::error::Error>> {
    use c0flash_core::adapter::SdBlockDevice;
    use c0flash_core::sdspi::SdSpi;
    use c0flash_core::status::Mode;
    use c0flash_dummy::{DummyCard, DummyConfig, Personality, SdCardEmulator};

    let mut config = DummyConfig::default();
    let mut over_spi = false;

    for (key, value) in &params.params {
        match key.as_str() {
            "model" => {
                config.personality = match value.as_str() {
                    "c0" | "c0-microsd" => Personality::C0MicroSd,
                    "plus" | "c0-microsd+" => Personality::C0MicroSdPlus,
                    _ => return Err(format!("Invalid dummy model: {}", value).into()),
                }
            }
            "mode" => {
                config.mode = match value.as_str() {
                    "bootloader" => Mode::Bootloader,
                    "soc" => Mode::Soc,
                    _ => return Err(format!("Invalid dummy mode: {}", value).into()),
                }
            }
            "version" => {
                config.version.major = value
                    .parse()
                    .map_err(|_| format!("Invalid dummy version: {}", value))?;
            }
            "bus" => over_spi = value == "spi",
            _ => log::warn!("Unknown dummy option: {}={}", key, value),
        }
    }

    log::info!("Opening dummy {:?} card", config.personality);
    let card = DummyCard::new(config);
    if over_spi {
        let device = SdBlockDevice::init(SdSpi::new(SdCardEmulator::new(card)))?;
        Ok(Box::new(device))
    } else {
        Ok(Box::new(card))
    }
}

/// Information about a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendInfo {
    /// Name used in target strings
    pub name: &'static str,
    /// Other accepted names
    pub aliases: &'static [&'static str],
    /// Short description
    pub description: &'static str,
}

/// Get information about all available backends (enabled at compile time)
#[allow(unused_mut)]
pub fn available_backends() -> Vec<BackendInfo> {
    let mut backends = Vec::new();

    #[cfg(feature = "raw")]
    backends.push(BackendInfo {
        name: "raw",
        aliases: &["host"],
        description: "Card in a host card reader, as a raw block device (dev=/dev/sdX)",
    });

    #[cfg(feature = "spidev")]
    backends.push(BackendInfo {
        name: "spidev",
        aliases: &["linux_spi", "linux-spi"],
        description: "Card in SD-over-SPI mode on Linux spidev (dev=/dev/spidevX.Y,spispeed=<kHz>)",
    });

    #[cfg(feature = "dummy")]
    backends.push(BackendInfo {
        name: "dummy",
        aliases: &[],
        description: "In-memory card emulator (model=c0|plus,mode=bootloader|soc,bus=spi)",
    });

    backends
}

/// Generate a short list of backend names for CLI help
pub fn backend_names_short() -> String {
    let backends = available_backends();
    if backends.is_empty() {
        return "none (built without backend features)".into();
    }
    let names: Vec<&str> = backends.iter().map(|b| b.name).collect();
    names.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_name_only() {
        let params = parse_target_params("dummy").unwrap();
        assert_eq!(params.name, "dummy");
        assert!(params.params.is_empty());
    }

    #[test]
    fn parse_bare_path() {
        let params = parse_target_params("/dev/sdb").unwrap();
        assert_eq!(params.name, "raw");
        assert_eq!(params.params.get("dev").map(String::as_str), Some("/dev/sdb"));
    }

    #[test]
    fn parse_rejects_malformed_option() {
        assert!(parse_target_params("spidev:dev").is_err());
        assert!(parse_target_params("").is_err());
    }

    #[test]
    fn unknown_backend() {
        let err = open_device("ch341a").err().unwrap();
        assert!(err.to_string().contains("Unknown backend"));
    }

    #[cfg(feature = "dummy")]
    #[test]
    fn dummy_status() {
        use c0flash_core::bootloader::Controller;
        use c0flash_core::status::Mode;

        for target in ["dummy", "dummy:bus=spi", "dummy:mode=soc,version=1"] {
            let device = open_device(target).unwrap();
            let mut controller = Controller::connect(device, false).unwrap();
            let status = controller.get_status().unwrap();
            if target.contains("soc") {
                assert_eq!(status.mode, Mode::Soc);
                assert_eq!(controller.map().version, 1);
            } else {
                assert_eq!(status.mode, Mode::Bootloader);
                assert_eq!(controller.map().version, 2);
            }
        }
    }

    #[cfg(feature = "dummy")]
    #[test]
    fn dummy_rejects_bad_model() {
        assert!(open_device("dummy:model=c1").is_err());
    }

    #[test]
    fn backend_listing() {
        let names: Vec<&str> = available_backends().iter().map(|b| b.name).collect();
        assert_eq!(names.join(", "), backend_names_short());
    }
}
