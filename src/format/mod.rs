//! Persisted formats and backend dispatch.
//!
//! Reading goes through a [`SourceRegistry`] of [`SourceFactory`] values.
//! For a path, factories claiming its extension are probed first, then the
//! rest; within each group lower priority values go first. The first factory
//! whose `can_read` accepts the path opens it.
//!
//! Writing picks a [`PyramidEncoder`] from the destination's extension:
//!
//! - **`.tif` / `.tiff`**: tiled pyramidal TIFF
//! - **`.pyr`**: directory store of raw tiles
//! - **`.zip`**: zip archive of a directory store

pub mod jpeg;
pub mod manifest;
pub mod store;
pub mod tiff;

use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::error::FormatError;
use crate::sink::PyramidEncoder;
use crate::source::synthetic::SyntheticFactory;
use crate::source::{OpenOptions, SourceFactory, TileSource};

pub use manifest::PyramidManifest;
pub use store::{StoreEncoder, StoreFactory, StoreSource, ZipStoreEncoder};
pub use tiff::{TiffEncoder, TiffFactory, TiffSource};

/// Lowercase extension of a path, if any.
fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

// =============================================================================
// Reading
// =============================================================================

/// Ordered set of source factories.
pub struct SourceRegistry {
    factories: Vec<Arc<dyn SourceFactory>>,
}

impl Default for SourceRegistry {
    /// Every built-in backend.
    fn default() -> Self {
        Self::empty()
            .with(Arc::new(SyntheticFactory))
            .with(Arc::new(StoreFactory))
            .with(Arc::new(TiffFactory))
    }
}

impl SourceRegistry {
    pub fn empty() -> Self {
        Self {
            factories: Vec::new(),
        }
    }

    pub fn with(mut self, factory: Arc<dyn SourceFactory>) -> Self {
        self.factories.push(factory);
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.factories.iter().map(|f| f.name()).collect()
    }

    /// Factories in probe order for a path.
    fn candidates(&self, path: &Path) -> Vec<&Arc<dyn SourceFactory>> {
        let ext = extension(path);
        let mut candidates: Vec<&Arc<dyn SourceFactory>> = self.factories.iter().collect();
        candidates.sort_by_key(|f| {
            let claims = ext
                .as_deref()
                .is_some_and(|e| f.extensions().contains(&e));
            (!claims, f.priority())
        });
        candidates
    }

    /// Open a path with the first factory that accepts it.
    pub async fn open(&self, path: &Path, options: &OpenOptions) -> Result<Arc<dyn TileSource>, FormatError> {
        for factory in self.candidates(path) {
            if factory.can_read(path).await {
                debug!(path = %path.display(), backend = factory.name(), "opening source");
                return factory.open(path, options).await;
            }
        }
        Err(FormatError::NoReader {
            path: path.display().to_string(),
        })
    }
}

// =============================================================================
// Writing
// =============================================================================

/// Encoder for a destination, chosen by extension.
pub fn encoder_for_path(path: &Path) -> Option<Box<dyn PyramidEncoder>> {
    let encoders: [Box<dyn PyramidEncoder>; 3] =
        [Box::new(TiffEncoder), Box::new(StoreEncoder), Box::new(ZipStoreEncoder)];
    let ext = extension(path)?;
    encoders
        .into_iter()
        .find(|encoder| encoder.extensions().contains(&ext.as_str()))
}
