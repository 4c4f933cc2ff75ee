//! Snapshot capture capability injected by the hosting application.
//!
//! The engine never touches a rendering surface. When a zone alert is about to
//! fire it asks the injected capability for an image of that zone; a failure
//! only means the alert goes out without a picture.

use crate::core_modules::zone_marker::ZoneMarker;
use crate::error::PipelineResult;
use std::fmt;
use std::sync::Arc;

/// An opaque image payload attached to an alert.
#[derive(Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Media type of `data`, e.g. `image/jpeg`.
    pub media_type: String,
    pub data: Arc<[u8]>,
}

impl Snapshot {
    pub fn new(media_type: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            media_type: media_type.into(),
            data: data.into(),
        }
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("media_type", &self.media_type)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Captures an image of the area around a zone marker.
pub trait SnapshotCapture: Send + Sync {
    /// Returns the image, or `PipelineError::SnapshotCaptureFailed`.
    fn capture(&self, marker: &ZoneMarker) -> PipelineResult<Snapshot>;
}

impl<F> SnapshotCapture for F
where
    F: Fn(&ZoneMarker) -> PipelineResult<Snapshot> + Send + Sync,
{
    fn capture(&self, marker: &ZoneMarker) -> PipelineResult<Snapshot> {
        self(marker)
    }
}
