//! Configuration for the engine and its command-line front end.
//!
//! Settings come from command-line arguments with environment fallbacks
//! (prefix `LARGE_IMAGE_`), and are read once when an
//! [`EngineContext`](crate::context::EngineContext) is built.
//!
//! # Environment Variables
//!
//! - `LARGE_IMAGE_CACHE_BACKEND` - `memory` or `memcached` (default: memory)
//! - `LARGE_IMAGE_CACHE_MEMORY_PORTION` - tile cache uses 1/N of system memory (default: 32)
//! - `LARGE_IMAGE_CACHE_MEMCACHED_URL` - comma-separated servers (default: 127.0.0.1:11211)
//! - `LARGE_IMAGE_CACHE_MEMCACHED_USERNAME` / `_PASSWORD` - memcached credentials
//! - `LARGE_IMAGE_CACHE_TILESOURCE_MAXIMUM` - open source handles, 0 for a memory heuristic (default: 0)
//! - `LARGE_IMAGE_CACHE_TILESOURCE_MEMORY_PORTION` - portion used by that heuristic (default: 8)
//! - `LARGE_IMAGE_MAX_SMALL_IMAGE_SIZE` - associated images are shrunk to fit this (default: 4096)

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use clap::{Args, Parser, Subcommand};
use sysinfo::System;
use tracing::debug;

use crate::cache::{MemcachedOptions, DEFAULT_TILE_CACHE_CAPACITY};
use crate::resample::ResampleMethod;
use crate::sink::CropRect;

// =============================================================================
// Default Values
// =============================================================================

/// Default portion of system memory given to the tile cache.
pub const DEFAULT_CACHE_MEMORY_PORTION: u64 = 32;

/// Default memcached server list.
pub const DEFAULT_MEMCACHED_URL: &str = "127.0.0.1:11211";

/// Default portion of system memory given to open source handles.
pub const DEFAULT_TILESOURCE_MEMORY_PORTION: u64 = 8;

/// Default bound on the side of associated images.
pub const DEFAULT_MAX_SMALL_IMAGE_SIZE: u32 = 4096;

/// Rough memory held by one open source, for the handle heuristic.
pub const ESTIMATED_SOURCE_BYTES: u64 = 64 * 1024 * 1024;

/// Fewest handles the heuristic will settle on.
pub const MIN_HANDLE_CAPACITY: usize = 3;

/// Smallest tile cache derived from system memory.
pub const MIN_TILE_CACHE_BYTES: usize = 16 * 1024 * 1024;

// =============================================================================
// Cache configuration
// =============================================================================

/// Tile cache backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheBackendKind {
    #[default]
    Memory,
    Memcached,
}

impl FromStr for CacheBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "python" => Ok(CacheBackendKind::Memory),
            "memcached" => Ok(CacheBackendKind::Memcached),
            other => Err(format!("unknown cache backend {other:?}, expected memory or memcached")),
        }
    }
}

impl fmt::Display for CacheBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CacheBackendKind::Memory => "memory",
            CacheBackendKind::Memcached => "memcached",
        })
    }
}

/// Cache sizing and backend selection.
#[derive(Args, Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Tile cache backend: memory or memcached.
    #[arg(long, default_value_t = CacheBackendKind::Memory, env = "LARGE_IMAGE_CACHE_BACKEND")]
    pub cache_backend: CacheBackendKind,

    /// The memory tile cache uses 1/N of system memory.
    #[arg(long, default_value_t = DEFAULT_CACHE_MEMORY_PORTION, env = "LARGE_IMAGE_CACHE_MEMORY_PORTION")]
    pub cache_memory_portion: u64,

    /// Memcached servers (comma-separated host:port).
    #[arg(long, default_value = DEFAULT_MEMCACHED_URL, env = "LARGE_IMAGE_CACHE_MEMCACHED_URL")]
    pub cache_memcached_url: String,

    #[arg(long, env = "LARGE_IMAGE_CACHE_MEMCACHED_USERNAME")]
    pub cache_memcached_username: Option<String>,

    #[arg(long, env = "LARGE_IMAGE_CACHE_MEMCACHED_PASSWORD")]
    pub cache_memcached_password: Option<String>,

    /// Maximum open source handles; 0 derives it from system memory.
    #[arg(long, default_value_t = 0, env = "LARGE_IMAGE_CACHE_TILESOURCE_MAXIMUM")]
    pub cache_tilesource_maximum: usize,

    /// Open source handles may use 1/N of system memory.
    #[arg(
        long,
        default_value_t = DEFAULT_TILESOURCE_MEMORY_PORTION,
        env = "LARGE_IMAGE_CACHE_TILESOURCE_MEMORY_PORTION"
    )]
    pub cache_tilesource_memory_portion: u64,

    /// Associated images larger than this on either side are shrunk to fit.
    #[arg(long, default_value_t = DEFAULT_MAX_SMALL_IMAGE_SIZE, env = "LARGE_IMAGE_MAX_SMALL_IMAGE_SIZE")]
    pub max_small_image_size: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_backend: CacheBackendKind::Memory,
            cache_memory_portion: DEFAULT_CACHE_MEMORY_PORTION,
            cache_memcached_url: DEFAULT_MEMCACHED_URL.to_string(),
            cache_memcached_username: None,
            cache_memcached_password: None,
            cache_tilesource_maximum: 0,
            cache_tilesource_memory_portion: DEFAULT_TILESOURCE_MEMORY_PORTION,
            max_small_image_size: DEFAULT_MAX_SMALL_IMAGE_SIZE,
        }
    }
}

impl CacheConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.cache_memory_portion == 0 {
            return Err("cache_memory_portion must be greater than 0".to_string());
        }
        if self.cache_tilesource_memory_portion == 0 {
            return Err("cache_tilesource_memory_portion must be greater than 0".to_string());
        }
        if self.max_small_image_size == 0 {
            return Err("max_small_image_size must be greater than 0".to_string());
        }

        if self.cache_backend == CacheBackendKind::Memcached {
            if self.memcached_options().servers.is_empty() {
                return Err(
                    "Memcached backend selected but no servers given. \
                     Set --cache-memcached-url or LARGE_IMAGE_CACHE_MEMCACHED_URL"
                        .to_string(),
                );
            }
            if self.cache_memcached_username.is_some() != self.cache_memcached_password.is_some() {
                return Err("Memcached username and password must be given together".to_string());
            }
        }

        Ok(())
    }

    /// Memcached connection settings.
    pub fn memcached_options(&self) -> MemcachedOptions {
        let mut options = MemcachedOptions::from_url_list(&self.cache_memcached_url);
        options.username = self.cache_memcached_username.clone();
        options.password = self.cache_memcached_password.clone();
        options
    }

    /// Byte budget of the memory tile cache for a machine with
    /// `total_memory` bytes (0 if unknown).
    pub fn tile_cache_bytes_for(&self, total_memory: u64) -> usize {
        if total_memory == 0 {
            return DEFAULT_TILE_CACHE_CAPACITY;
        }
        let portion = self.cache_memory_portion.max(1);
        usize::try_from(total_memory / portion)
            .unwrap_or(usize::MAX)
            .max(MIN_TILE_CACHE_BYTES)
    }

    /// Handle count for a machine with `total_memory` bytes (0 if unknown).
    pub fn handle_capacity_for(&self, total_memory: u64) -> usize {
        if self.cache_tilesource_maximum > 0 {
            return self.cache_tilesource_maximum;
        }
        if total_memory == 0 {
            return crate::cache::DEFAULT_HANDLE_CAPACITY;
        }
        let portion = self.cache_tilesource_memory_portion.max(1);
        let count = total_memory / portion / ESTIMATED_SOURCE_BYTES;
        usize::try_from(count)
            .unwrap_or(usize::MAX)
            .max(MIN_HANDLE_CAPACITY)
    }

    /// Tile cache budget on this machine.
    pub fn tile_cache_bytes(&self) -> usize {
        self.tile_cache_bytes_for(total_memory())
    }

    /// Handle count on this machine.
    pub fn handle_capacity(&self) -> usize {
        self.handle_capacity_for(total_memory())
    }
}

/// Physical memory in bytes, or 0 if it cannot be read.
pub fn total_memory() -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    let total = system.total_memory();
    debug!(total, "system memory");
    total
}

// =============================================================================
// CLI Arguments
// =============================================================================

/// Large Image - tile access and pyramid construction.
///
/// Reads multi-resolution images tile by tile and writes tiled pyramids.
#[derive(Parser, Debug, Clone)]
#[command(name = "large-image")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose logging (debug level).
    #[arg(short, long, global = true, default_value_t = false)]
    pub verbose: bool,

    #[command(flatten)]
    pub cache: CacheConfig,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print the metadata of an image as JSON.
    Info(InfoConfig),

    /// Copy an image into a new pyramid (.tif, .tiff, .pyr or .zip).
    Convert(ConvertConfig),
}

#[derive(Args, Debug, Clone)]
pub struct InfoConfig {
    /// Image path, or `synthetic:` followed by options.
    pub path: PathBuf,

    /// Also list per-level sizes.
    #[arg(long, default_value_t = false)]
    pub levels: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ConvertConfig {
    /// Source image.
    pub source: PathBuf,

    /// Destination; its extension picks the format.
    pub destination: PathBuf,

    /// Method used to derive reduced levels.
    #[arg(long, default_value_t = ResampleMethod::Mean)]
    pub resample: ResampleMethod,

    /// Crop the output to `left,top,width,height` in full-resolution pixels.
    #[arg(long, value_parser = parse_crop)]
    pub crop: Option<CropRect>,
}

impl ConvertConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if crate::format::encoder_for_path(&self.destination).is_none() {
            return Err(format!(
                "Unsupported destination {}: expected .tif, .tiff, .pyr or .zip",
                self.destination.display()
            ));
        }
        if self.source == self.destination {
            return Err("Source and destination must differ".to_string());
        }
        Ok(())
    }
}

/// Parse `left,top,width,height`.
pub fn parse_crop(s: &str) -> Result<CropRect, String> {
    let parts: Vec<u32> = s
        .split(',')
        .map(|p| p.trim().parse::<u32>())
        .collect::<Result<_, _>>()
        .map_err(|e| format!("invalid crop {s:?}: {e}"))?;
    let [left, top, width, height] = parts[..] else {
        return Err(format!("invalid crop {s:?}: expected left,top,width,height"));
    };
    if width == 0 || height == 0 {
        return Err(format!("invalid crop {s:?}: width and height must be positive"));
    }
    Ok(CropRect {
        left,
        top,
        width,
        height,
    })
}

// =============================================================================
// Tests
// =============================================================================
