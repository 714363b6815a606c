//! Image task model

use idt_common::{Coordinate, ItemId, MetadataRecord};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Encoded image formats the vision providers accept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
    Webp,
    Bmp,
}

impl ImageFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_string_lossy().to_ascii_lowercase();
        match ext.as_str() {
            "jpg" | "jpeg" | "jpe" => Some(ImageFormat::Jpeg),
            "png" => Some(ImageFormat::Png),
            "gif" => Some(ImageFormat::Gif),
            "webp" => Some(ImageFormat::Webp),
            "bmp" => Some(ImageFormat::Bmp),
            _ => None,
        }
    }

    pub fn media_type(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
            ImageFormat::Gif => "image/gif",
            ImageFormat::Webp => "image/webp",
            ImageFormat::Bmp => "image/bmp",
        }
    }

    /// Check the leading bytes of a file against this format's signature
    pub fn matches_magic(&self, header: &[u8]) -> bool {
        match self {
            ImageFormat::Jpeg => header.starts_with(&[0xFF, 0xD8, 0xFF]),
            ImageFormat::Png => header.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]),
            ImageFormat::Gif => header.starts_with(b"GIF87a") || header.starts_with(b"GIF89a"),
            ImageFormat::Webp => {
                header.len() >= 12 && &header[..4] == b"RIFF" && &header[8..12] == b"WEBP"
            }
            ImageFormat::Bmp => header.starts_with(b"BM"),
        }
    }
}

/// One unit of work: an input image and its optional metadata
///
/// Per-stage outcomes are not stored here; the resume ledger is the single source
/// of truth for them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageTask {
    pub id: ItemId,
    pub path: PathBuf,
    #[serde(default)]
    pub metadata: Option<MetadataRecord>,
}

impl ImageTask {
    /// Build a task for a file on disk, deriving its id from the canonical path,
    /// size and modification time.
    pub fn from_path(
        path: impl AsRef<Path>,
        metadata: Option<MetadataRecord>,
    ) -> std::io::Result<Self> {
        let path = path.as_ref();
        let fs_meta = std::fs::metadata(path)?;
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let modified_nanos = fs_meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);

        Ok(Self {
            id: ItemId::derive(&canonical, fs_meta.len(), modified_nanos),
            path: canonical,
            metadata,
        })
    }

    /// Build a task with a caller-chosen id
    pub fn with_id(id: impl Into<ItemId>, path: impl Into<PathBuf>, metadata: Option<MetadataRecord>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            metadata,
        }
    }

    pub fn gps(&self) -> Option<Coordinate> {
        self.metadata.as_ref().and_then(|m| m.gps)
    }

    pub fn format(&self) -> Option<ImageFormat> {
        ImageFormat::from_path(&self.path)
    }
}
