//! Engine and per-channel configuration.
use serde::{Deserialize, Serialize};

use crate::error::DmaError;

/// Settings supplied by the platform once, when the engine is brought up.
#[derive(Copy, Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[non_exhaustive]
pub struct PlatformConfig {
    /// Number of channels the engine manages.
    #[serde(default = "PlatformConfig::default_channel_count")]
    pub channel_count: u8,
    /// Size of one channel's register block.
    #[serde(default = "PlatformConfig::default_channel_reg_size")]
    pub channel_reg_size: usize,
    /// Offset of hardware channel 0's register block from the controller base.
    #[serde(default = "PlatformConfig::default_channel_base_offset")]
    pub channel_base_offset: usize,
    /// First hardware channel (and interrupt line) owned by this engine.
    #[serde(default)]
    pub start_channel_index: u8,
    /// Memory stream identity programmed into every channel.
    #[serde(default = "PlatformConfig::default_stream_id")]
    pub stream_id: u8,
    /// Largest single segment, in bytes.
    #[serde(default = "PlatformConfig::default_max_transfer_count")]
    pub max_transfer_count: usize,
    /// Transfer descriptors to allocate per channel at bring-up.
    #[serde(default)]
    pub preallocated_transfers: usize,
    /// Segments to allocate per channel at bring-up.
    #[serde(default)]
    pub preallocated_segments: usize,
    /// Per-channel cap on transfer descriptors. `None` means unbounded.
    #[serde(default)]
    pub max_transfers: Option<usize>,
    /// Per-channel cap on segments. `None` means unbounded.
    #[serde(default)]
    pub max_segments: Option<usize>,
}

impl PlatformConfig {
    pub const DEFAULT_CHANNEL_COUNT: u8 = 32;
    pub const DEFAULT_CHANNEL_REG_SIZE: usize = 0x10000;
    pub const DEFAULT_CHANNEL_BASE_OFFSET: usize = 0x10000;
    pub const DEFAULT_STREAM_ID: u8 = 0x20;
    pub const DEFAULT_MAX_TRANSFER_COUNT: usize = 1024 * 1024 * 1024;

    /// The bitmap used to claim channels limits an engine to 64 of them.
    pub const MAX_CHANNELS: u8 = 64;
    /// Longest segment the word count register can describe, 16 GiB.
    pub const MAX_TRANSFER_COUNT: u64 = (u32::MAX as u64 + 1) * 4;

    const fn default_channel_count() -> u8 {
        Self::DEFAULT_CHANNEL_COUNT
    }
    const fn default_channel_reg_size() -> usize {
        Self::DEFAULT_CHANNEL_REG_SIZE
    }
    const fn default_channel_base_offset() -> usize {
        Self::DEFAULT_CHANNEL_BASE_OFFSET
    }
    const fn default_stream_id() -> u8 {
        Self::DEFAULT_STREAM_ID
    }
    const fn default_max_transfer_count() -> usize {
        Self::DEFAULT_MAX_TRANSFER_COUNT
    }

    pub const fn new() -> Self {
        Self {
            channel_count: Self::DEFAULT_CHANNEL_COUNT,
            channel_reg_size: Self::DEFAULT_CHANNEL_REG_SIZE,
            channel_base_offset: Self::DEFAULT_CHANNEL_BASE_OFFSET,
            start_channel_index: 0,
            stream_id: Self::DEFAULT_STREAM_ID,
            max_transfer_count: Self::DEFAULT_MAX_TRANSFER_COUNT,
            preallocated_transfers: 0,
            preallocated_segments: 0,
            max_transfers: None,
            max_segments: None,
        }
    }

    /// Returns the offset of channel `index`'s register block from the
    /// controller base.
    #[must_use]
    pub fn channel_offset(&self, index: u8) -> usize {
        let hw_index = usize::from(self.start_channel_index) + usize::from(index);
        self.channel_base_offset + hw_index * self.channel_reg_size
    }

    /// Returns the interrupt line wired to channel `index`.
    #[must_use]
    pub fn irq_line(&self, index: u8) -> u32 {
        u32::from(self.start_channel_index) + u32::from(index)
    }

    pub(crate) fn validate(&self) -> Result<(), DmaError> {
        if self.channel_count == 0 || self.channel_count > Self::MAX_CHANNELS {
            return Err(DmaError::Platform("channel count must be between 1 and 64"));
        }
        let max = self.max_transfer_count as u64;
        if !(4..=Self::MAX_TRANSFER_COUNT).contains(&max) {
            return Err(DmaError::Platform(
                "max transfer count must be between 4 bytes and 16 GiB",
            ));
        }
        Ok(())
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Which way a transfer moves data.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Direction {
    MemToDev,
    DevToMem,
    MemToMem,
}

/// Peripheral-side parameters for slave transfers.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct SlaveConfig {
    /// Peripheral request line. Ignored if the channel was claimed with one.
    #[serde(default)]
    pub peripheral_id: Option<u8>,
    /// Device register read by device-to-memory transfers.
    #[serde(default)]
    pub src_addr: u64,
    /// Device register written by memory-to-device transfers.
    #[serde(default)]
    pub dst_addr: u64,
    /// Width of `src_addr`, in bytes.
    #[serde(default)]
    pub src_addr_width: u8,
    /// Width of `dst_addr`, in bytes.
    #[serde(default)]
    pub dst_addr_width: u8,
    /// Device burst for reads, in units of `src_addr_width`.
    #[serde(default)]
    pub src_maxburst: u32,
    /// Device burst for writes, in units of `dst_addr_width`.
    #[serde(default)]
    pub dst_maxburst: u32,
}

impl SlaveConfig {
    /// Configuration for writing to the device register at `addr`.
    #[must_use]
    pub const fn to_device(addr: u64, width: u8, maxburst: u32) -> Self {
        Self {
            peripheral_id: None,
            src_addr: 0,
            dst_addr: addr,
            src_addr_width: 0,
            dst_addr_width: width,
            src_maxburst: 0,
            dst_maxburst: maxburst,
        }
    }

    /// Configuration for reading from the device register at `addr`.
    #[must_use]
    pub const fn from_device(addr: u64, width: u8, maxburst: u32) -> Self {
        Self {
            peripheral_id: None,
            src_addr: addr,
            src_addr_width: width,
            src_maxburst: maxburst,
            dst_addr: 0,
            dst_addr_width: 0,
            dst_maxburst: 0,
        }
    }

    #[must_use]
    pub const fn with_peripheral(self, peripheral_id: u8) -> Self {
        Self {
            peripheral_id: Some(peripheral_id),
            ..self
        }
    }
}
