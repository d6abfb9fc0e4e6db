//! Directory store of raw tiles, optionally packed in a zip archive.
//!
//! ```text
//! slide.pyr/
//! ├── manifest.json
//! └── f{frame}/l{level}/{row}_{col}.bin
//! ```
//!
//! Levels are numbered from full resolution (`l0`) down. Each `.bin` holds
//! the tile's samples little-endian, clipped at the level's right and bottom
//! edges. A tile without a file reads as zeros. A `.zip` archive holds the
//! same entries at its root.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rayon::prelude::*;
use tracing::debug;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::manifest::PyramidManifest;
use crate::array::PixelArray;
use crate::error::{FormatError, IoError, SinkError, TileError};
use crate::sink::{PyramidData, PyramidEncoder};
use crate::source::{OpenOptions, SourceFactory, SourceMetadata, TileSource};

pub const MANIFEST_FILE: &str = "manifest.json";

/// Relative path of a tile, using full-resolution-first level numbers.
pub fn tile_entry(frame: usize, level: u32, column: u32, row: u32) -> String {
    format!("f{frame}/l{level}/{row}_{column}.bin")
}

fn io_error(path: &Path, err: std::io::Error) -> IoError {
    IoError::from_std(path.display().to_string(), err)
}

// =============================================================================
// Writing
// =============================================================================

/// Every tile of a pyramid as `(entry, bytes)`.
fn tile_blobs(pyramid: &PyramidData) -> impl ParallelIterator<Item = (String, Vec<u8>)> + '_ {
    let tile = pyramid.tile_size.max(1) as usize;
    pyramid
        .levels
        .par_iter()
        .enumerate()
        .flat_map_iter(move |(level, frames)| {
            frames.iter().enumerate().flat_map(move |(frame, array)| {
                let columns = array.width().div_ceil(tile);
                let rows = array.height().div_ceil(tile);
                (0..rows).flat_map(move |row| {
                    (0..columns).map(move |column| {
                        let block = array.crop(column * tile, row * tile, tile, tile);
                        (
                            tile_entry(frame, level as u32, column as u32, row as u32),
                            block.to_bytes(),
                        )
                    })
                })
            })
        })
}

/// Refuse to clobber anything that is not a previous store.
fn prepare_directory(path: &Path) -> Result<(), SinkError> {
    if path.exists() {
        let is_store = path.is_dir() && path.join(MANIFEST_FILE).is_file();
        let is_empty = path.is_dir()
            && std::fs::read_dir(path)
                .map_err(|e| io_error(path, e))?
                .next()
                .is_none();
        if !is_store && !is_empty {
            return Err(SinkError::UnsupportedDestination(format!(
                "{} exists and is not a pyramid store",
                path.display()
            )));
        }
        if is_store {
            std::fs::remove_dir_all(path).map_err(|e| io_error(path, e))?;
        }
    }
    std::fs::create_dir_all(path).map_err(|e| io_error(path, e))?;
    Ok(())
}

fn write_directory_store(pyramid: &PyramidData, path: &Path) -> Result<(), SinkError> {
    prepare_directory(path)?;
    let manifest = PyramidManifest::from_pyramid(pyramid);

    tile_blobs(pyramid).try_for_each(|(entry, bytes)| -> Result<(), SinkError> {
        let file = path.join(entry);
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        }
        std::fs::write(&file, bytes).map_err(|e| io_error(&file, e))?;
        Ok(())
    })?;

    // The manifest goes last so an interrupted write is not mistaken for a store.
    let manifest_path = path.join(MANIFEST_FILE);
    std::fs::write(&manifest_path, manifest.to_json()?).map_err(|e| io_error(&manifest_path, e))?;
    Ok(())
}

fn write_zip_store(pyramid: &PyramidData, path: &Path) -> Result<(), SinkError> {
    let manifest = PyramidManifest::from_pyramid(pyramid);
    let file = File::create(path).map_err(|e| io_error(path, e))?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true);
    let zip_error = |e: ZipError| SinkError::Encode(format!("zip {}: {e}", path.display()));

    zip.start_file(MANIFEST_FILE, options).map_err(zip_error)?;
    zip.write_all(manifest.to_json()?.as_bytes())
        .map_err(|e| io_error(path, e))?;

    let blobs: Vec<(String, Vec<u8>)> = tile_blobs(pyramid).collect();
    for (entry, bytes) in blobs {
        zip.start_file(entry, options).map_err(zip_error)?;
        zip.write_all(&bytes).map_err(|e| io_error(path, e))?;
    }
    zip.finish().map_err(zip_error)?;
    Ok(())
}

/// Writes `.pyr` directories.
#[derive(Debug, Default, Clone, Copy)]
pub struct StoreEncoder;

#[async_trait]
impl PyramidEncoder for StoreEncoder {
    fn name(&self) -> &'static str {
        "store"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["pyr"]
    }

    async fn write(&self, pyramid: Arc<PyramidData>, destination: &Path) -> Result<(), SinkError> {
        let path = destination.to_path_buf();
        tokio::task::spawn_blocking(move || write_directory_store(&pyramid, &path))
            .await
            .map_err(|e| SinkError::Encode(format!("store writer task failed: {e}")))?
    }
}

/// Writes `.zip` archives of a store.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZipStoreEncoder;

#[async_trait]
impl PyramidEncoder for ZipStoreEncoder {
    fn name(&self) -> &'static str {
        "zip"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["zip"]
    }

    async fn write(&self, pyramid: Arc<PyramidData>, destination: &Path) -> Result<(), SinkError> {
        let path = destination.to_path_buf();
        tokio::task::spawn_blocking(move || write_zip_store(&pyramid, &path))
            .await
            .map_err(|e| SinkError::Encode(format!("zip writer task failed: {e}")))?
    }
}

// =============================================================================
// Reading
// =============================================================================

enum Backing {
    Directory(PathBuf),
    Zip {
        path: PathBuf,
        archive: Mutex<ZipArchive<File>>,
    },
}

impl Backing {
    /// Entry contents; `None` when the entry does not exist.
    fn read(&self, entry: &str) -> Result<Option<Vec<u8>>, IoError> {
        match self {
            Backing::Directory(root) => {
                let path = root.join(entry);
                match std::fs::read(&path) {
                    Ok(bytes) => Ok(Some(bytes)),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                    Err(e) => Err(io_error(&path, e)),
                }
            }
            Backing::Zip { path, archive } => {
                let mut archive = archive.lock().map_err(|_| IoError::Other {
                    path: path.display().to_string(),
                    message: "archive lock poisoned".into(),
                })?;
                let mut file = match archive.by_name(entry) {
                    Ok(file) => file,
                    Err(ZipError::FileNotFound) => return Ok(None),
                    Err(e) => {
                        return Err(IoError::Other {
                            path: format!("{}!{entry}", path.display()),
                            message: e.to_string(),
                        })
                    }
                };
                let mut bytes = Vec::with_capacity(file.size() as usize);
                file.read_to_end(&mut bytes).map_err(|e| io_error(path, e))?;
                Ok(Some(bytes))
            }
        }
    }

    fn open(path: &Path) -> Result<Self, FormatError> {
        if path.is_dir() {
            return Ok(Backing::Directory(path.to_path_buf()));
        }
        let file = File::open(path).map_err(|e| io_error(path, e))?;
        let archive = ZipArchive::new(file).map_err(|e| FormatError::Store(format!("{}: {e}", path.display())))?;
        Ok(Backing::Zip {
            path: path.to_path_buf(),
            archive: Mutex::new(archive),
        })
    }
}

/// An opened store or store archive.
pub struct StoreSource {
    backing: Arc<Backing>,
    manifest: PyramidManifest,
    metadata: SourceMetadata,
}

impl StoreSource {
    pub async fn open(path: &Path) -> Result<Self, FormatError> {
        let path = path.to_path_buf();
        let (backing, manifest) = tokio::task::spawn_blocking(move || -> Result<_, FormatError> {
            let backing = Backing::open(&path)?;
            let text = backing
                .read(MANIFEST_FILE)?
                .ok_or_else(|| FormatError::Store(format!("{} has no {MANIFEST_FILE}", path.display())))?;
            let manifest = PyramidManifest::from_json(&String::from_utf8_lossy(&text))?;
            Ok((backing, manifest))
        })
        .await
        .map_err(|e| FormatError::Store(format!("open task failed: {e}")))??;

        let metadata = manifest.metadata();
        debug!(
            width = metadata.size_x,
            height = metadata.size_y,
            levels = metadata.levels,
            frames = metadata.frame_count(),
            "opened pyramid store"
        );
        Ok(Self {
            backing: Arc::new(backing),
            manifest,
            metadata,
        })
    }

    pub fn manifest(&self) -> &PyramidManifest {
        &self.manifest
    }
}

#[async_trait]
impl TileSource for StoreSource {
    fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    async fn read_tile(&self, level: u32, x: u32, y: u32, frame: usize) -> Result<PixelArray, TileError> {
        let meta = &self.metadata;
        meta.check_address(level, x, y, frame)?;

        let (level_w, level_h) = meta.level_size(level);
        let width = meta.tile_width.min(level_w - x * meta.tile_width) as usize;
        let height = meta.tile_height.min(level_h - y * meta.tile_height) as usize;
        let (bands, dtype) = (meta.band_count, meta.dtype);

        let entry = tile_entry(frame, meta.max_level() - level, x, y);
        let backing = self.backing.clone();
        let bytes = tokio::task::spawn_blocking(move || backing.read(&entry))
            .await
            .map_err(|e| TileError::SourceDecode {
                message: format!("store read task failed: {e}"),
            })??;

        match bytes {
            None => Ok(PixelArray::new(width, height, bands, dtype)),
            Some(bytes) => PixelArray::from_bytes(width, height, bands, dtype, &bytes, true).ok_or_else(|| {
                TileError::SourceDecode {
                    message: format!("tile ({x}, {y}) of level {level} holds {} bytes", bytes.len()),
                }
            }),
        }
    }
}

/// Opens `.pyr` directories and `.zip` archives of them.
#[derive(Debug, Default)]
pub struct StoreFactory;

#[async_trait]
impl SourceFactory for StoreFactory {
    fn name(&self) -> &'static str {
        "store"
    }

    fn priority(&self) -> u8 {
        40
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["pyr", "zip"]
    }

    async fn can_read(&self, path: &Path) -> bool {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            if path.is_dir() {
                return path.join(MANIFEST_FILE).is_file();
            }
            let Ok(file) = File::open(&path) else {
                return false;
            };
            let Ok(mut archive) = ZipArchive::new(file) else {
                return false;
            };
            let found = archive.by_name(MANIFEST_FILE).is_ok();
            found
        })
        .await
        .unwrap_or(false)
    }

    async fn open(&self, path: &Path, _options: &OpenOptions) -> Result<Arc<dyn TileSource>, FormatError> {
        Ok(Arc::new(StoreSource::open(path).await?))
    }
}
