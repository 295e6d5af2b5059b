//! Pixel layout conversion for plane-major (CHW) model inputs

use ndarray::ArrayView3;

use crate::error::{PipelineError, Result};

/// Decoded image in interleaved HWC layout, one byte per channel sample
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawImage {
    data: Vec<u8>,
    width: usize,
    height: usize,
    channels: usize,
}

/// Samples in a `width × height × channels` image, rejecting overflow
pub fn sample_count(width: usize, height: usize, channels: usize) -> Result<usize> {
    width
        .checked_mul(height)
        .and_then(|n| n.checked_mul(channels))
        .ok_or_else(|| {
            PipelineError::configuration(format!(
                "image geometry {}x{}x{} overflows",
                width, height, channels
            ))
        })
}

impl RawImage {
    pub fn new(data: Vec<u8>, width: usize, height: usize, channels: usize) -> Result<Self> {
        let expected = sample_count(width, height, channels)?;
        if data.len() != expected {
            return Err(PipelineError::configuration(format!(
                "image buffer holds {} bytes, {}x{}x{} needs {}",
                data.len(),
                width,
                height,
                channels,
                expected
            )));
        }
        Ok(Self {
            data,
            width,
            height,
            channels,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn channels(&self) -> usize {
        self.channels
    }
}

/// Image bytes in CHW layout, ready for batch assembly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneMajorBuffer {
    data: Vec<u8>,
    width: usize,
    height: usize,
    channels: usize,
}

impl PlaneMajorBuffer {
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// `(channels, height, width)`
    pub fn dims(&self) -> (usize, usize, usize) {
        (self.channels, self.height, self.width)
    }
}

/// Convert an HWC image into CHW.
///
/// `out[c*H*W + h*W + w] == in[h*W*C + w*C + c]` for every sample. The image
/// must already be resized to the target geometry.
pub fn to_plane_major(
    image: &RawImage,
    target_width: usize,
    target_height: usize,
    channels: usize,
) -> Result<PlaneMajorBuffer> {
    if image.width != target_width || image.height != target_height || image.channels != channels
    {
        return Err(PipelineError::configuration(format!(
            "image is {}x{}x{}, model input expects {}x{}x{}",
            image.width, image.height, image.channels, target_width, target_height, channels
        )));
    }

    let hwc = ArrayView3::from_shape((target_height, target_width, channels), &image.data)
        .map_err(|e| PipelineError::configuration(format!("invalid image shape: {}", e)))?;

    // Logical iteration order of the permuted view is C, H, W
    let data: Vec<u8> = hwc.permuted_axes([2, 0, 1]).iter().copied().collect();

    Ok(PlaneMajorBuffer {
        data,
        width: target_width,
        height: target_height,
        channels,
    })
}

/// Inverse of [`to_plane_major`]
pub fn to_interleaved(buffer: &PlaneMajorBuffer) -> Result<RawImage> {
    let (channels, height, width) = buffer.dims();
    let chw = ArrayView3::from_shape((channels, height, width), &buffer.data)
        .map_err(|e| PipelineError::configuration(format!("invalid buffer shape: {}", e)))?;
    let data: Vec<u8> = chw.permuted_axes([1, 2, 0]).iter().copied().collect();

    RawImage::new(data, width, height, channels)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(width: usize, height: usize, channels: usize) -> RawImage {
        let data = (0..width * height * channels)
            .map(|i| (i * 13 % 251) as u8)
            .collect();
        RawImage::new(data, width, height, channels).unwrap()
    }

    #[test]
    fn test_plane_major_index_mapping() {
        let (w, h, c) = (5, 3, 3);
        let img = image(w, h, c);
        let planar = to_plane_major(&img, w, h, c).unwrap();

        for ch in 0..c {
            for y in 0..h {
                for x in 0..w {
                    assert_eq!(
                        planar.as_bytes()[ch * h * w + y * w + x],
                        img.as_bytes()[y * w * c + x * c + ch]
                    );
                }
            }
        }
    }

    #[test]
    fn test_small_rgb_example() {
        // 2x1 image: (r0 g0 b0) (r1 g1 b1)
        let img = RawImage::new(vec![1, 2, 3, 4, 5, 6], 2, 1, 3).unwrap();
        let planar = to_plane_major(&img, 2, 1, 3).unwrap();
        assert_eq!(planar.as_bytes(), &[1, 4, 2, 5, 3, 6]);
    }

    #[test]
    fn test_round_trip() {
        for (w, h, c) in [(1, 1, 1), (7, 4, 3), (16, 9, 4), (3, 8, 1)] {
            let img = image(w, h, c);
            let planar = to_plane_major(&img, w, h, c).unwrap();
            assert_eq!(planar.len(), img.as_bytes().len());
            assert_eq!(to_interleaved(&planar).unwrap(), img);
        }
    }

    #[test]
    fn test_zero_sized_image() {
        let img = RawImage::new(Vec::new(), 0, 4, 3).unwrap();
        let planar = to_plane_major(&img, 0, 4, 3).unwrap();
        assert!(planar.is_empty());
        assert_eq!(planar.dims(), (3, 4, 0));
    }

    #[test]
    fn test_geometry_mismatch_is_configuration_error() {
        let img = image(4, 4, 3);
        let err = to_plane_major(&img, 8, 8, 3).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn test_raw_image_rejects_short_buffer() {
        assert!(RawImage::new(vec![0; 5], 2, 1, 3).is_err());
    }

    #[test]
    fn test_oversized_geometry_is_configuration_error() {
        assert!(matches!(
            RawImage::new(Vec::new(), usize::MAX, 2, 3),
            Err(PipelineError::Configuration(_))
        ));
        assert!(sample_count(usize::MAX / 2, 1, 3).is_err());
        assert_eq!(sample_count(4, 3, 3).unwrap(), 36);
    }
}
