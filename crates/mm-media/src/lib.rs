//! Artifact transforms and malware scanning.
//!
//! - [`transform`]: image normalisation, refinement and thumbnails
//! - [`scan`]: the [`ScanBackend`] seam with a ClamAV implementation

pub mod error;
pub mod scan;
pub mod transform;

pub use error::{MediaError, MediaResult};
pub use scan::{ClamAvScanner, ScanBackend, ScanConfig, StaticScanner};
pub use transform::{
    dimensions, normalize_image, refine_image, thumbnail_jpeg, ArtifactKind, DEFAULT_MAX_DIMENSION,
    THUMBNAIL_SIZE,
};
