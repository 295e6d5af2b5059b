//! Image file decoding and input discovery

use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use serde::Deserialize;
use thiserror::Error;

use crate::engine::preprocess::RawImage;

/// Extensions picked up when an input path is a directory
const IMAGE_EXTENSIONS: &[&str] = &["bmp", "png", "jpg", "jpeg", "gif", "tif", "tiff", "webp"];

#[derive(Error, Debug)]
pub enum DecodeError {
    /// The file is not a readable image; callers skip it
    #[error("image {} cannot be read: {reason}", .path.display())]
    Unreadable { path: PathBuf, reason: String },

    #[error("image decoding failed: {0}")]
    Fatal(String),
}

/// Order of the colour samples in decoded 3-channel images
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    #[default]
    Bgr,
    Rgb,
}

/// Turns a file into an HWC buffer of the requested geometry
pub trait ImageDecoder: Send + Sync {
    fn decode(
        &self,
        path: &Path,
        width: usize,
        height: usize,
        channels: usize,
    ) -> Result<RawImage, DecodeError>;
}

/// Decoder backed by the `image` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct FileDecoder {
    channel_order: ChannelOrder,
}

impl FileDecoder {
    pub fn new(channel_order: ChannelOrder) -> Self {
        Self { channel_order }
    }
}

impl ImageDecoder for FileDecoder {
    fn decode(
        &self,
        path: &Path,
        width: usize,
        height: usize,
        channels: usize,
    ) -> Result<RawImage, DecodeError> {
        let (w, h) = match (u32::try_from(width), u32::try_from(height)) {
            (Ok(w), Ok(h)) => (w, h),
            _ => {
                return Err(DecodeError::Fatal(format!(
                    "target size {}x{} out of range",
                    width, height
                )))
            }
        };

        let img = image::open(path).map_err(|e| DecodeError::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let resized = img.resize_exact(w, h, FilterType::Triangle);

        let data = match channels {
            1 => resized.to_luma8().into_raw(),
            3 => {
                let mut raw = resized.to_rgb8().into_raw();
                if self.channel_order == ChannelOrder::Bgr {
                    for px in raw.chunks_exact_mut(3) {
                        px.swap(0, 2);
                    }
                }
                raw
            }
            other => {
                return Err(DecodeError::Fatal(format!(
                    "unsupported channel count {}",
                    other
                )))
            }
        };

        RawImage::new(data, width, height, channels).map_err(|e| DecodeError::Fatal(e.to_string()))
    }
}

/// Expand inputs into image files; directories contribute their image
/// files sorted by name, plain files are kept as given.
pub fn expand_inputs(inputs: &[PathBuf]) -> std::io::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(input)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && has_image_extension(p))
                .collect();
            entries.sort();
            paths.extend(entries);
        } else {
            paths.push(input.clone());
        }
    }
    Ok(paths)
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_decode_swaps_to_bgr() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("red.png");
        RgbImage::from_pixel(2, 2, Rgb([200, 10, 30])).save(&path).unwrap();

        let bgr = FileDecoder::new(ChannelOrder::Bgr)
            .decode(&path, 2, 2, 3)
            .unwrap();
        assert_eq!(&bgr.as_bytes()[..3], &[30, 10, 200]);

        let rgb = FileDecoder::new(ChannelOrder::Rgb)
            .decode(&path, 2, 2, 3)
            .unwrap();
        assert_eq!(&rgb.as_bytes()[..3], &[200, 10, 30]);
        assert_eq!(rgb.as_bytes().len(), 12);
    }

    #[test]
    fn test_unreadable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"not an image").unwrap();

        let err = FileDecoder::default().decode(&path, 4, 4, 3).unwrap_err();
        assert!(matches!(err, DecodeError::Unreadable { .. }));
    }

    #[test]
    fn test_unsupported_channels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gray.png");
        RgbImage::from_pixel(2, 2, Rgb([1, 1, 1])).save(&path).unwrap();

        let err = FileDecoder::default().decode(&path, 2, 2, 5).unwrap_err();
        assert!(matches!(err, DecodeError::Fatal(_)));
    }

    #[test]
    fn test_expand_inputs() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.png", "a.bmp", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let single = PathBuf::from("elsewhere/c.jpg");

        let paths = expand_inputs(&[dir.path().to_path_buf(), single.clone()]).unwrap();
        assert_eq!(
            paths,
            vec![dir.path().join("a.bmp"), dir.path().join("b.png"), single]
        );
    }
}
