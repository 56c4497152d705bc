//! Picks chunk size, buffer cap and concurrency from environment hints.
//!
//! The output is advisory: the protocol works for any value inside the
//! clamped ranges, including the extremes.

use crate::config::TransferConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use sysinfo::{MemoryRefreshKind, RefreshKind, System};

pub const MIN_CHUNK_SIZE: usize = 16 * 1024;
pub const MAX_CHUNK_SIZE: usize = 2 * 1024 * 1024;
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

pub const MIN_BUFFER_HIGH_WATER_MARK: u64 = 256 * 1024;
pub const MAX_BUFFER_HIGH_WATER_MARK: u64 = 64 * 1024 * 1024;
pub const DEFAULT_BUFFER_HIGH_WATER_MARK: u64 = 4 * 1024 * 1024;

pub const MIN_CONCURRENCY: usize = 1;
pub const MAX_CONCURRENCY: usize = 8;
pub const DEFAULT_CONCURRENCY: usize = 2;

/// Backpressure polling interval
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

const GIB: u64 = 1024 * 1024 * 1024;

/// Reported quality of the link to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkQuality {
    Poor,
    Fair,
    Good,
    Excellent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryClass {
    Low,
    Medium,
    High,
}

impl MemoryClass {
    pub fn from_total_bytes(total: u64) -> Self {
        if total < 4 * GIB {
            MemoryClass::Low
        } else if total < 16 * GIB {
            MemoryClass::Medium
        } else {
            MemoryClass::High
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigHints {
    pub link_quality: Option<LinkQuality>,
    pub memory: Option<MemoryClass>,
    pub cores: Option<usize>,
}

impl ConfigHints {
    /// Fill memory and core hints from the running machine. Link quality stays unknown.
    pub fn detect() -> Self {
        let system = System::new_with_specifics(
            RefreshKind::nothing().with_memory(MemoryRefreshKind::everything()),
        );
        let total = system.total_memory();
        let memory = (total > 0).then(|| MemoryClass::from_total_bytes(total));
        let cores = std::thread::available_parallelism().ok().map(|n| n.get());

        Self {
            link_quality: None,
            memory,
            cores,
        }
    }

    pub fn with_link_quality(mut self, quality: LinkQuality) -> Self {
        self.link_quality = Some(quality);
        self
    }
}

/// Map hints to a session configuration.
pub fn choose_config(hints: &ConfigHints) -> TransferConfig {
    let base_chunk = match hints.link_quality {
        Some(LinkQuality::Poor) => 32 * 1024,
        Some(LinkQuality::Fair) => 128 * 1024,
        Some(LinkQuality::Good) => 512 * 1024,
        Some(LinkQuality::Excellent) => 1024 * 1024,
        None => DEFAULT_CHUNK_SIZE,
    };

    let chunk_size = match hints.memory {
        Some(MemoryClass::Low) => base_chunk / 2,
        Some(MemoryClass::High) => base_chunk * 2,
        Some(MemoryClass::Medium) | None => base_chunk,
    };

    // Buffer cap is expressed in chunks so larger chunks keep the pipe equally full
    let buffer_high_water_mark = match hints.memory {
        Some(MemoryClass::Low) => chunk_size as u64 * 4,
        Some(MemoryClass::Medium) => chunk_size as u64 * 16,
        Some(MemoryClass::High) => chunk_size as u64 * 32,
        None if hints.link_quality.is_none() => DEFAULT_BUFFER_HIGH_WATER_MARK,
        None => chunk_size as u64 * 16,
    };

    let concurrency_hint = hints.cores.map_or(DEFAULT_CONCURRENCY, |cores| cores / 2);

    let use_compression =
        !matches!(hints.memory, Some(MemoryClass::Low)) && hints.cores.is_none_or(|c| c > 1);

    TransferConfig {
        chunk_size,
        buffer_high_water_mark,
        concurrency_hint,
        use_compression,
        poll_interval: DEFAULT_POLL_INTERVAL,
    }
    .clamped()
}
