//! Per-version memory maps
//!
//! Bootloader-managed C0-microSD cards lay out their non-volatile memory
//! according to the bootloader major version. The maps here are fixed by
//! the hardware and must not change. Lookups for an unknown major version
//! fall back to version 1 with a warning.
//!
//! The compute register sets of the C0-microSD Signaloid SoC and of the
//! C0-microSD+ are described by [`ComputeMap`].

/// Offset and length of a fixed-size field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    /// Byte offset on the device
    pub offset: u64,
    /// Length in bytes
    pub len: usize,
}

/// Delimiters framing the metadata prefix of a bitstream image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixFraming {
    /// Sequence opening the prefix
    pub start: &'static [u8],
    /// Sequence closing the prefix
    pub end: &'static [u8],
    /// Whether the payload begins at the end sequence rather than after it
    pub payload_includes_end: bool,
}

/// Memory map of a bootloader major version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootloaderMap {
    /// Bootloader major version this map describes
    pub version: u16,
    /// Writing a zeroed block here toggles the boot configuration
    pub switch_config_offset: u64,
    /// Unlock word location for the protected sections
    pub unlock_offset: u64,
    /// Bootloader bitstream
    pub bootloader_offset: u64,
    /// Signaloid SoC bitstream
    pub soc_offset: u64,
    /// User bitstream
    pub user_bitstream_offset: u64,
    /// User data
    pub user_data_offset: u64,
    /// Serial number string
    pub serial_number: Field,
    /// UUID string
    pub uuid: Field,
    /// Word that unlocks the protected sections
    pub unlock_word: &'static [u8],
    /// Warmboot section location
    pub warmboot_offset: u64,
    /// Expected warmboot section, lowercase hex
    pub warmboot_template: &'static str,
    /// Bitstream prefix delimiters
    pub prefix: PrefixFraming,
}

/// Size of the warmboot section in bytes
pub const WARMBOOT_LEN: usize = 160;

/// Size of the block written to the switch-config offset
pub const SWITCH_CONFIG_LEN: usize = 512;

/// Size of the zeroed block written to lock the protected sections
pub const LOCK_LEN: usize = 32;

const WARMBOOT_V1: &str = concat!(
    "7eaa997e920000440308000082000001",
    "08000000000000000000000000000000",
    "7eaa997e920000440308000082000001",
    "08000000000000000000000000000000",
    "7eaa997e920000440310000082000001",
    "08000000000000000000000000000000",
    "7eaa997e920000440318000082000001",
    "08000000000000000000000000000000",
    "7eaa997e920000440308000082000001",
    "08000000000000000000000000000000",
);

const WARMBOOT_V2: &str = concat!(
    "7eaa997e920000440308000082000001",
    "08000000000000000000000000000000",
    "7eaa997e920000440308000082000001",
    "08000000000000000000000000000000",
    "7eaa997e920000440310000082000001",
    "08000000000000000000000000000000",
    "7eaa997e920000440318000082000001",
    "08000000000000000000000000000000",
    "7eaa997e920000440320000082000001",
    "08000000000000000000000000000000",
);

/// Bootloader version 1
pub static BOOTLOADER_V1: BootloaderMap = BootloaderMap {
    version: 1,
    switch_config_offset: 0x40000,
    unlock_offset: 0x60000,
    bootloader_offset: 0x80000,
    soc_offset: 0x100000,
    user_bitstream_offset: 0x180000,
    user_data_offset: 0x200000,
    serial_number: Field {
        offset: 0x22040,
        len: 0x40,
    },
    uuid: Field {
        offset: 0x22080,
        len: 0x40,
    },
    unlock_word: b"UBLD",
    warmboot_offset: 0,
    warmboot_template: WARMBOOT_V1,
    prefix: PrefixFraming {
        start: b"\xFF\x00",
        end: b"\x00\xFF",
        payload_includes_end: false,
    },
};

/// Bootloader version 2
pub static BOOTLOADER_V2: BootloaderMap = BootloaderMap {
    version: 2,
    switch_config_offset: 0xF80000,
    unlock_offset: 0x60000,
    bootloader_offset: 0x80000,
    soc_offset: 0x100000,
    user_bitstream_offset: 0x200000,
    user_data_offset: 0x280000,
    serial_number: Field {
        offset: 0x22040,
        len: 0x40,
    },
    uuid: Field {
        offset: 0x22080,
        len: 0x40,
    },
    unlock_word: b"UBLD",
    warmboot_offset: 0,
    warmboot_template: WARMBOOT_V2,
    prefix: PrefixFraming {
        start: b"\xFF\x00",
        end: b"\x7E\xAA\x99\x7E",
        payload_includes_end: true,
    },
};

static BOOTLOADER_MAPS: [&BootloaderMap; 2] = [&BOOTLOADER_V1, &BOOTLOADER_V2];

/// Exact lookup of a bootloader map
pub fn lookup(major: u16) -> Option<&'static BootloaderMap> {
    BOOTLOADER_MAPS.iter().copied().find(|map| map.version == major)
}

/// Resolve the map for `major`, falling back to version 1
pub fn bootloader_map(major: u16) -> &'static BootloaderMap {
    lookup(major).unwrap_or_else(|| {
        log::warn!(
            "Unknown bootloader version {}, assuming version 1 memory map",
            major
        );
        &BOOTLOADER_V1
    })
}

/// Register set of a compute core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputeMap {
    /// Human-readable device name
    pub name: &'static str,
    /// Command register
    pub command_offset: u64,
    /// Status register
    pub status_offset: u64,
    /// Buffer the host writes command arguments into
    pub input_buffer: Field,
    /// Buffer the core leaves its results in
    pub result_buffer: Field,
    /// SoC control register, read-only from the host
    pub control_offset: Option<u64>,
    /// Packed configuration register
    pub config_offset: Option<u64>,
    /// Core boot address register
    pub boot_address_offset: Option<u64>,
    /// Whether the bootloader status record must report SoC mode
    pub requires_soc_mode: bool,
}

/// Signaloid SoC on a bootloader-managed C0-microSD
pub static C0_MICROSD_SOC: ComputeMap = ComputeMap {
    name: "C0-microSD",
    command_offset: 0x10000,
    status_offset: 0x00000,
    input_buffer: Field {
        offset: 0x50000,
        len: 4096,
    },
    result_buffer: Field {
        offset: 0x60000,
        len: 4096,
    },
    control_offset: Some(0x00004),
    config_offset: None,
    boot_address_offset: None,
    requires_soc_mode: true,
};

/// C0-microSD+ with its shared MMIO buffer
pub static C0_MICROSD_PLUS: ComputeMap = ComputeMap {
    name: "C0-microSD+",
    command_offset: 0x0100_0000,
    status_offset: 0x0100_000C,
    input_buffer: Field {
        offset: 0x0100_4000,
        len: 8192,
    },
    result_buffer: Field {
        offset: 0x0100_4000,
        len: 8192,
    },
    control_offset: None,
    config_offset: Some(0x0100_0004),
    boot_address_offset: Some(0x0100_0008),
    requires_soc_mode: false,
};

/// C0-microSD+ bitstream
pub const PLUS_BITSTREAM_OFFSET: u64 = 0x0;
/// C0-microSD+ bootloader
pub const PLUS_BOOTLOADER_OFFSET: u64 = 0x0010_0000;
/// C0-microSD+ application binary
pub const PLUS_APPLICATION_OFFSET: u64 = 0x0018_0000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_versions() {
        assert_eq!(bootloader_map(1), &BOOTLOADER_V1);
        assert_eq!(bootloader_map(2), &BOOTLOADER_V2);
        assert_eq!(BOOTLOADER_V2.switch_config_offset, 0xF80000);
        assert_eq!(BOOTLOADER_V2.user_data_offset, 0x280000);
    }

    #[test]
    fn unknown_version_falls_back_to_v1() {
        assert!(lookup(99).is_none());
        let map = bootloader_map(99);
        assert_eq!(map.version, 1);
        assert_eq!(map.user_bitstream_offset, 0x180000);
        assert_eq!(map.switch_config_offset, 0x40000);
    }

    #[test]
    fn warmboot_templates_are_160_bytes() {
        for map in BOOTLOADER_MAPS {
            assert_eq!(map.warmboot_template.len(), WARMBOOT_LEN * 2);
            assert!(map
                .warmboot_template
                .bytes()
                .all(|c| c.is_ascii_digit() || (b'a'..=b'f').contains(&c)));
        }
    }

    #[test]
    fn v2_warmboot_boots_user_image_from_v2_offset() {
        // Frame 4 holds the image address as a 24-bit big-endian value
        let frame = &BOOTLOADER_V2.warmboot_template[256..288];
        assert_eq!(&frame[18..24], "200000");
        assert_eq!(BOOTLOADER_V2.user_bitstream_offset, 0x200000);
    }
}
