//! Device capability metadata.
//!
//! After the metadata command the device streams typed key/value records
//! describing what the connected hardware can do. The interesting fields for
//! sizing a capture are the sample memory depth and the probe count; both are
//! looked up with a caller-supplied fallback because older firmware omits
//! them.

use std::collections::BTreeMap;
use std::fmt;

const KEY_DEVICE_NAME: u8 = 0x01;
const KEY_FPGA_VERSION: u8 = 0x02;
const KEY_ANCILLARY_VERSION: u8 = 0x03;
const KEY_PROBE_COUNT: u8 = 0x20;
const KEY_SAMPLE_MEMORY_DEPTH: u8 = 0x21;
const KEY_DYNAMIC_MEMORY_DEPTH: u8 = 0x22;
const KEY_MAX_SAMPLE_RATE: u8 = 0x23;
const KEY_PROTOCOL_VERSION: u8 = 0x24;
const KEY_PROBE_COUNT_SHORT: u8 = 0x40;
const KEY_PROTOCOL_VERSION_SHORT: u8 = 0x41;

/// A single typed metadata value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataValue {
    Text(String),
    Int(u32),
    Byte(u8),
}

impl MetadataValue {
    fn as_u32(&self) -> Option<u32> {
        match self {
            Self::Int(value) => Some(*value),
            Self::Byte(value) => Some(u32::from(*value)),
            Self::Text(_) => None,
        }
    }

    fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }
}

/// Immutable key/value map built once per session from the metadata stream.
#[derive(Debug, Clone, Default)]
pub struct DeviceMetadata {
    entries: BTreeMap<u8, MetadataValue>,
}

impl DeviceMetadata {
    pub(crate) fn insert(&mut self, key: u8, value: MetadataValue) {
        self.entries.insert(key, value);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn int(&self, key: u8) -> Option<u32> {
        self.entries.get(&key).and_then(MetadataValue::as_u32)
    }

    fn text(&self, key: u8) -> Option<&str> {
        self.entries.get(&key).and_then(MetadataValue::as_str)
    }

    /// Human-readable device name, if the firmware reports one.
    pub fn device_name(&self) -> Option<&str> {
        self.text(KEY_DEVICE_NAME)
    }

    /// FPGA bitstream version string.
    pub fn fpga_version(&self) -> Option<&str> {
        self.text(KEY_FPGA_VERSION)
    }

    /// Version of the ancillary (PIC) controller firmware.
    pub fn ancillary_version(&self) -> Option<&str> {
        self.text(KEY_ANCILLARY_VERSION)
    }

    /// Number of usable probe lines; `default` when the device does not say.
    /// Newer firmware reports this under the short (one-byte) key, older
    /// firmware under the 32-bit one, so both are consulted.
    pub fn probe_count(&self, default: usize) -> usize {
        self.int(KEY_PROBE_COUNT_SHORT)
            .or_else(|| self.int(KEY_PROBE_COUNT))
            .map_or(default, |v| v as usize)
    }

    /// Depth of the sample memory in samples; `default` when not reported.
    pub fn sample_memory_depth(&self, default: usize) -> usize {
        self.int(KEY_SAMPLE_MEMORY_DEPTH)
            .map_or(default, |v| v as usize)
    }

    /// Depth of the dynamic (RLE) memory in bytes, when reported.
    pub fn dynamic_memory_depth(&self) -> Option<u32> {
        self.int(KEY_DYNAMIC_MEMORY_DEPTH)
    }

    /// Highest sample rate the hardware claims to support, in Hz.
    pub fn max_sample_rate(&self) -> Option<u32> {
        self.int(KEY_MAX_SAMPLE_RATE)
    }

    /// Protocol version the device speaks.
    pub fn protocol_version(&self) -> Option<u32> {
        self.int(KEY_PROTOCOL_VERSION_SHORT)
            .or_else(|| self.int(KEY_PROTOCOL_VERSION))
    }
}

impl fmt::Display for DeviceMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.entries {
            match value {
                MetadataValue::Text(v) => writeln!(f, "  {key:#04x} = \"{v}\"")?,
                MetadataValue::Int(v) => writeln!(f, "  {key:#04x} = {v}")?,
                MetadataValue::Byte(v) => writeln!(f, "  {key:#04x} = {v}")?,
            }
        }
        Ok(())
    }
}
