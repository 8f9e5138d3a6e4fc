//! Bitstream image metadata
//!
//! Images start with an FPGA comment section carrying an ASCII JSON object,
//! for example `{"v":"2.0","type":"soc","crc":..., "size":...}`. The format
//! version `v` selects the delimiters that frame the prefix and so decides
//! where the CRC-checked payload begins.

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::ops::Range;

use crc::{Crc, CRC_32_ISO_HDLC};
use serde::Deserialize;
use serde_json::Value;

use crate::adapter::DeviceIo;
use crate::error::{Error, Result};
use crate::memory_map::{self, PrefixFraming};

/// Bytes of an image searched for the metadata prefix
pub const PREFIX_SEARCH_LEN: usize = 4096;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Standard CRC-32 (as used by zlib and PNG)
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// A JSON object found in a byte buffer
#[derive(Debug, Clone, PartialEq)]
pub struct JsonPrefix {
    /// Byte range of the object text
    pub range: Range<usize>,
    /// Parsed object
    pub value: Value,
}

/// Find the first balanced `{...}` span that parses as JSON
///
/// Only the first [`PREFIX_SEARCH_LEN`] bytes are searched. Spans that
/// balance but fail to parse are skipped.
pub fn find_json_string(buffer: &[u8]) -> Option<JsonPrefix> {
    let buffer = &buffer[..buffer.len().min(PREFIX_SEARCH_LEN)];
    let mut depth = 0usize;
    let mut start = 0usize;

    for (i, &byte) in buffer.iter().enumerate() {
        match byte {
            b'{' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            b'}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &buffer[start..=i];
                    match serde_json::from_slice::<Value>(candidate) {
                        Ok(value) => {
                            return Some(JsonPrefix {
                                range: start..i + 1,
                                value,
                            })
                        }
                        Err(e) => log::trace!("Skipping non-JSON span at {}: {}", start, e),
                    }
                }
            }
            _ => {}
        }
    }
    None
}

/// Major format version of a metadata object
///
/// The integer before the first `.` of `v`; 1 when `v` is absent or
/// unparseable.
pub fn format_major_version(metadata: &Value) -> u16 {
    let text = match metadata.get("v") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return 1,
    };
    text.split('.')
        .next()
        .and_then(|major| major.trim().parse().ok())
        .unwrap_or(1)
}

/// Declared image type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageKind {
    /// Bootloader bitstream
    Bootloader,
    /// Signaloid SoC bitstream
    Soc,
    /// User bitstream
    User,
    /// Any other declared type
    Other(String),
}

impl ImageKind {
    fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "bootloader" => Self::Bootloader,
            "soc" => Self::Soc,
            "user" => Self::User,
            _ => Self::Other(name.to_string()),
        }
    }

    /// Declared type of the image in `buffer`, if it carries one
    pub fn classify(buffer: &[u8]) -> Option<Self> {
        let prefix = find_json_string(buffer)?;
        prefix.value.get("type")?.as_str().map(Self::from_name)
    }
}

impl core::fmt::Display for ImageKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Bootloader => write!(f, "bootloader"),
            Self::Soc => write!(f, "soc"),
            Self::User => write!(f, "user"),
            Self::Other(name) => write!(f, "{}", name),
        }
    }
}

#[derive(Deserialize)]
struct RawMetadata {
    #[serde(default)]
    v: Option<Value>,
    #[serde(default, rename = "type")]
    kind: Option<Value>,
    #[serde(default, alias = "bitstream_crc")]
    crc: Option<Value>,
    #[serde(default, alias = "bitstream_size")]
    size: Option<Value>,
}

/// Recognized metadata fields
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Metadata {
    /// Format version string
    pub version: Option<String>,
    /// Declared image type
    pub kind: Option<ImageKind>,
    /// Payload CRC-32
    pub crc: Option<u32>,
    /// Payload size in bytes
    pub size: Option<u32>,
}

/// Accepts integers and decimal or `0x`-prefixed hex strings
fn parse_u32(value: &Value, field: &'static str) -> Result<u32> {
    let parsed = match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => {
            let s = s.trim();
            match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some(hex) => u32::from_str_radix(hex, 16).ok(),
                None => s.parse().ok(),
            }
        }
        _ => None,
    };
    parsed.ok_or(Error::InvalidField(field))
}

impl Metadata {
    /// Extract the recognized fields from a metadata object
    pub fn from_json(value: &Value) -> Result<Self> {
        let raw: RawMetadata =
            RawMetadata::deserialize(value).map_err(|_| Error::InvalidField("metadata"))?;

        let version = match raw.v {
            Some(Value::String(s)) => Some(s),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(_) => return Err(Error::InvalidField("v")),
            None => None,
        };
        let kind = match raw.kind {
            Some(Value::String(s)) => Some(ImageKind::from_name(&s)),
            Some(_) => return Err(Error::InvalidField("type")),
            None => None,
        };
        Ok(Self {
            version,
            kind,
            crc: raw.crc.as_ref().map(|v| parse_u32(v, "crc")).transpose()?,
            size: raw.size.as_ref().map(|v| parse_u32(v, "size")).transpose()?,
        })
    }
}

/// Where the prefix sits inside an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixLayout {
    /// Bytes between the delimiters
    pub content: Range<usize>,
    /// Number of leading bytes excluded from the payload CRC
    pub payload_start: usize,
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Locate the prefix delimiters in the first chunk of an image
pub fn locate_prefix(chunk: &[u8], framing: &PrefixFraming) -> Option<PrefixLayout> {
    let start = find(chunk, framing.start)?;
    let content_start = start + framing.start.len();
    let end = content_start + find(&chunk[content_start..], framing.end)?;
    let payload_start = if framing.payload_includes_end {
        end
    } else {
        end + framing.end.len()
    };
    Some(PrefixLayout {
        content: content_start..end,
        payload_start,
    })
}

/// Parsed metadata prefix of an image
#[derive(Debug, Clone, PartialEq)]
pub struct BitstreamPrefix {
    /// Prefix position
    pub layout: PrefixLayout,
    /// Prefix content, lossily decoded
    pub text: String,
    /// JSON metadata object, if the prefix carries one
    pub json: Option<Value>,
    /// Major format version used to frame the prefix
    pub major_version: u16,
}

impl BitstreamPrefix {
    /// Parse the prefix from the first chunk of an image
    pub fn parse(chunk: &[u8]) -> Result<Self> {
        let chunk = &chunk[..chunk.len().min(PREFIX_SEARCH_LEN)];
        let json = find_json_string(chunk).map(|prefix| prefix.value);
        let major_version = json.as_ref().map(format_major_version).unwrap_or(1);
        let framing = &memory_map::bootloader_map(major_version).prefix;

        let layout = locate_prefix(chunk, framing).ok_or(Error::PrefixNotFound)?;
        let mut content = &chunk[layout.content.clone()];
        while let [rest @ .., 0x00 | 0xFF] = content {
            content = rest;
        }
        let text = String::from_utf8_lossy(content).to_string();
        Ok(Self {
            layout,
            text,
            json,
            major_version,
        })
    }

    /// Recognized metadata fields
    pub fn metadata(&self) -> Result<Metadata> {
        self.json
            .as_ref()
            .ok_or(Error::MetadataNotFound)
            .and_then(Metadata::from_json)
    }
}

/// Result of checking a stored bitstream against its own metadata
#[derive(Debug, Clone, PartialEq)]
pub struct BitstreamReport {
    /// Parsed prefix
    pub prefix: BitstreamPrefix,
    /// Recognized metadata fields
    pub metadata: Metadata,
    /// CRC-32 declared by the metadata
    pub expected_crc: u32,
    /// CRC-32 of the stored payload
    pub actual_crc: u32,
}

impl BitstreamReport {
    /// Whether the stored payload matches its declared CRC
    pub fn crc_ok(&self) -> bool {
        self.expected_crc == self.actual_crc
    }
}

/// Parse the prefix of the image stored at `offset`
pub fn read_prefix<D: DeviceIo + ?Sized>(device: &mut D, offset: u64) -> Result<BitstreamPrefix> {
    let chunk = device.read(offset, PREFIX_SEARCH_LEN)?;
    BitstreamPrefix::parse(&chunk)
}

/// CRC-32 of `payload_size` bytes following `prefix_size` bytes at `offset`
pub fn payload_crc<D: DeviceIo + ?Sized>(
    device: &mut D,
    offset: u64,
    prefix_size: usize,
    payload_size: usize,
) -> Result<u32> {
    let image = device.read_exact(offset, prefix_size + payload_size)?;
    Ok(crc32(&image[prefix_size..]))
}

/// Check the image stored at `offset` against its own metadata
pub fn inspect<D: DeviceIo + ?Sized>(device: &mut D, offset: u64) -> Result<BitstreamReport> {
    let prefix = read_prefix(device, offset)?;
    let metadata = prefix.metadata()?;
    let expected_crc = metadata.crc.ok_or(Error::MissingField("crc"))?;
    let size = metadata.size.ok_or(Error::MissingField("size"))?;
    let actual_crc = payload_crc(device, offset, prefix.layout.payload_start, size as usize)?;
    Ok(BitstreamReport {
        prefix,
        metadata,
        expected_crc,
        actual_crc,
    })
}

/// Assemble an image from metadata and payload, framed for `framing`
///
/// Used to build images for testing and emulation.
pub fn frame_image(metadata: &str, payload: &[u8], framing: &PrefixFraming) -> Vec<u8> {
    let mut image = Vec::with_capacity(metadata.len() + payload.len() + 8);
    image.extend_from_slice(framing.start);
    image.extend_from_slice(metadata.as_bytes());
    if framing.payload_includes_end {
        image.extend_from_slice(&[0x00, 0xFF]);
    } else {
        image.extend_from_slice(framing.end);
    }
    image.extend_from_slice(payload);
    image
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_map::{BOOTLOADER_V1, BOOTLOADER_V2};
    use alloc::format;
    use alloc::vec;

    #[test]
    fn finds_embedded_object() {
        let prefix = find_json_string(b"noise{\"v\":\"2.0\",\"type\":\"soc\"}moretrailing").unwrap();
        assert_eq!(prefix.range, 5..29);
        assert_eq!(prefix.value, serde_json::json!({"v": "2.0", "type": "soc"}));
    }

    #[test]
    fn unbalanced_or_missing_object() {
        assert_eq!(find_json_string(b"{\"v\":\"1.0\""), None);
        assert_eq!(find_json_string(b"no object here"), None);
        assert_eq!(find_json_string(b""), None);
    }

    #[test]
    fn skips_spans_that_do_not_parse() {
        let prefix = find_json_string(b"{not json}}{\"v\":\"1\"}").unwrap();
        assert_eq!(prefix.value, serde_json::json!({"v": "1"}));
    }

    #[test]
    fn nested_objects_are_one_span() {
        let prefix = find_json_string(b"\xFF\x00{\"a\":{\"b\":1}}\x00\xFF").unwrap();
        assert_eq!(prefix.value["a"]["b"], 1);
    }

    #[test]
    fn search_stops_after_4096_bytes() {
        let mut buffer = vec![b' '; PREFIX_SEARCH_LEN];
        buffer.extend_from_slice(b"{\"v\":\"1.0\"}");
        assert_eq!(find_json_string(&buffer), None);
    }

    #[test]
    fn major_version() {
        assert_eq!(format_major_version(&serde_json::json!({"v": "2.0"})), 2);
        assert_eq!(format_major_version(&serde_json::json!({"v": "3"})), 3);
        assert_eq!(format_major_version(&serde_json::json!({"v": 2})), 2);
        assert_eq!(format_major_version(&serde_json::json!({"v": "beta"})), 1);
        assert_eq!(format_major_version(&serde_json::json!({"type": "soc"})), 1);
    }

    #[test]
    fn classify_image() {
        assert_eq!(
            ImageKind::classify(b"\xFF\x00{\"v\":\"1.0\",\"type\":\"bootloader\"}\x00\xFF"),
            Some(ImageKind::Bootloader)
        );
        assert_eq!(
            ImageKind::classify(b"{\"type\":\"custom\"}"),
            Some(ImageKind::Other("custom".into()))
        );
        assert_eq!(ImageKind::classify(b"{\"v\":\"1.0\"}"), None);
    }

    #[test]
    fn crc32_of_zeros() {
        assert_eq!(crc32(&[0u8; 256]), 0x74f9_6db7);
    }

    #[test]
    fn metadata_fields_and_aliases() {
        let meta = Metadata::from_json(&serde_json::json!({
            "v": "1.0",
            "bitstream_crc": "0x74f96db7",
            "bitstream_size": 256,
        }))
        .unwrap();
        assert_eq!(meta.crc, Some(0x74f9_6db7));
        assert_eq!(meta.size, Some(256));
        assert_eq!(meta.kind, None);

        let meta = Metadata::from_json(&serde_json::json!({"crc": 1962503607u32, "size": "256"}))
            .unwrap();
        assert_eq!(meta.crc, Some(0x74f9_6db7));
        assert_eq!(meta.size, Some(256));
    }

    #[test]
    fn unparseable_crc_is_rejected() {
        assert_eq!(
            Metadata::from_json(&serde_json::json!({"crc": "zz"})),
            Err(Error::InvalidField("crc"))
        );
        assert_eq!(
            Metadata::from_json(&serde_json::json!({"size": -4})),
            Err(Error::InvalidField("size"))
        );
    }

    #[test]
    fn v1_payload_starts_after_end_marker() {
        let image = frame_image("{\"v\":\"1.0\"}", &[0x7E, 0xAA, 0x99, 0x7E], &BOOTLOADER_V1.prefix);
        let layout = locate_prefix(&image, &BOOTLOADER_V1.prefix).unwrap();
        assert_eq!(layout.content, 2..13);
        assert_eq!(layout.payload_start, 15);
    }

    #[test]
    fn v2_payload_starts_at_sync_word() {
        let image = frame_image("{\"v\":\"2.0\"}", &[0x7E, 0xAA, 0x99, 0x7E, 0x51], &BOOTLOADER_V2.prefix);
        let prefix = BitstreamPrefix::parse(&image).unwrap();
        assert_eq!(prefix.major_version, 2);
        assert_eq!(prefix.layout.payload_start, 15);
        assert_eq!(&image[prefix.layout.payload_start..][..4], &[0x7E, 0xAA, 0x99, 0x7E]);
    }

    #[test]
    fn prefix_with_metadata() {
        let payload = [0u8; 256];
        let json = format!("{{\"v\":\"1.0\",\"crc\":{},\"size\":256}}", crc32(&payload));
        let image = frame_image(&json, &payload, &BOOTLOADER_V1.prefix);
        let prefix = BitstreamPrefix::parse(&image).unwrap();
        assert_eq!(prefix.text, json);
        let meta = prefix.metadata().unwrap();
        assert_eq!(meta.crc, Some(0x74f9_6db7));
        assert_eq!(crc32(&image[prefix.layout.payload_start..]), 0x74f9_6db7);
    }

    #[test]
    fn missing_delimiters() {
        assert_eq!(
            BitstreamPrefix::parse(b"{\"v\":\"1.0\"}"),
            Err(Error::PrefixNotFound)
        );
    }
}
