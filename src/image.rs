//! Image payloads and crop geometry exchanged with the collaborator boundary.
//!
//! Images travel as self-describing data URIs (`data:<mime>;base64,<payload>`).
//! Detection boxes use a normalized 0..=1000 scale, `[ymin, xmin, ymax, xmax]`,
//! independent of the real pixel size.

use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};

use crate::error::{SheetError, SheetResult};

/// Upper bound of the normalized box coordinate space.
pub const BOX_SCALE: f64 = 1000.0;

/// Padding applied around a detected box before cropping.
pub const DEFAULT_PADDING_RATIO: f64 = 0.10;

// =============================================================================
// IMAGE DATA
// =============================================================================

/// An image carried by value as a data URI.
///
/// Cloning copies the string; two store slots never share an image by identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageData(String);

impl ImageData {
    /// Parses and validates a data URI.
    pub fn from_uri(uri: impl Into<String>) -> SheetResult<Self> {
        let uri = uri.into();
        split_data_uri(&uri)?;
        Ok(Self(uri))
    }

    /// Encodes raw bytes as a data URI with the given mime type.
    pub fn from_bytes(mime_type: &str, bytes: &[u8]) -> Self {
        Self(format!("data:{};base64,{}", mime_type, BASE64.encode(bytes)))
    }

    /// Returns the mime type declared by the URI.
    pub fn mime_type(&self) -> &str {
        split_data_uri(&self.0).map(|(mime, _)| mime).unwrap_or("")
    }

    /// Decodes the base64 payload.
    pub fn decode(&self) -> SheetResult<Vec<u8>> {
        let (_, payload) = split_data_uri(&self.0)?;
        BASE64
            .decode(payload)
            .map_err(|e| SheetError::invalid_data_uri(e.to_string()))
    }

    /// Gets the URI as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the wrapper and returns the URI.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ImageData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Payloads can be megabytes; show the header only.
        let head: String = self.0.chars().take(48).collect();
        if head.len() < self.0.len() {
            write!(f, "{}...", head)
        } else {
            f.write_str(&self.0)
        }
    }
}

fn split_data_uri(uri: &str) -> SheetResult<(&str, &str)> {
    let rest = uri
        .strip_prefix("data:")
        .ok_or_else(|| SheetError::invalid_data_uri("missing 'data:' prefix"))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| SheetError::invalid_data_uri("missing ',' separator"))?;
    let mime = header
        .strip_suffix(";base64")
        .ok_or_else(|| SheetError::invalid_data_uri("payload is not base64"))?;
    if mime.is_empty() {
        return Err(SheetError::invalid_data_uri("empty mime type"));
    }
    Ok((mime, payload))
}

// =============================================================================
// BOUNDING BOX
// =============================================================================

/// Detection box on the normalized 0..=1000 scale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub ymin: f64,
    pub xmin: f64,
    pub ymax: f64,
    pub xmax: f64,
}

impl BoundingBox {
    /// Creates a box from `[ymin, xmin, ymax, xmax]`.
    pub fn new(ymin: f64, xmin: f64, ymax: f64, xmax: f64) -> Self {
        Self {
            ymin,
            xmin,
            ymax,
            xmax,
        }
    }

    /// Creates a box from the collaborator's array form.
    pub fn from_array(values: [f64; 4]) -> Self {
        Self::new(values[0], values[1], values[2], values[3])
    }

    /// `[0,0,0,0]` (or any degenerate box) means the part is not present.
    pub fn is_empty(&self) -> bool {
        self.ymax <= self.ymin || self.xmax <= self.xmin
    }

    /// Expands the box by `ratio` of its size on each side and converts it to
    /// fractions of the image, clamped to the image bounds.
    pub fn padded(&self, ratio: f64) -> CropRegion {
        let pad_y = (self.ymax - self.ymin) * ratio;
        let pad_x = (self.xmax - self.xmin) * ratio;
        let norm = |v: f64| (v / BOX_SCALE).clamp(0.0, 1.0);
        CropRegion {
            top: norm(self.ymin - pad_y),
            left: norm(self.xmin - pad_x),
            bottom: norm(self.ymax + pad_y),
            right: norm(self.xmax + pad_x),
        }
    }
}

// =============================================================================
// CROP REGION
// =============================================================================

/// A crop rectangle expressed as fractions (0.0..=1.0) of the source image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CropRegion {
    pub top: f64,
    pub left: f64,
    pub bottom: f64,
    pub right: f64,
}

/// A crop rectangle in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRegion {
    /// Scales the region to a concrete image size. Never returns a zero-sized rect
    /// for a non-empty image.
    pub fn to_pixels(&self, image_width: u32, image_height: u32) -> PixelRect {
        let w = f64::from(image_width);
        let h = f64::from(image_height);
        let x = (self.left * w).floor() as u32;
        let y = (self.top * h).floor() as u32;
        let right = ((self.right * w).ceil() as u32).min(image_width);
        let bottom = ((self.bottom * h).ceil() as u32).min(image_height);
        PixelRect {
            x: x.min(image_width.saturating_sub(1)),
            y: y.min(image_height.saturating_sub(1)),
            width: right.saturating_sub(x).max(1).min(image_width),
            height: bottom.saturating_sub(y).max(1).min(image_height),
        }
    }
}

/// Pixel cropping routine.
///
/// Implementations scale the region to the real image size and render the crop
/// onto an opaque white canvas before re-encoding, so no transparency leaks into
/// generation inputs.
pub trait Cropper: Send + Sync {
    /// Crops `image` to `region`.
    fn crop(&self, image: &ImageData, region: &CropRegion) -> SheetResult<ImageData>;
}

// =============================================================================
// TESTS
// =============================================================================
