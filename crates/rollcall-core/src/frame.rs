//! Frame type and pixel-format conversion.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("buffer too short: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// A captured grayscale camera frame. Transient: discarded after processing.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Monotonic capture timestamp, used for stale-result rejection.
    pub timestamp: std::time::Instant,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
            timestamp: std::time::Instant::now(),
        }
    }

    /// Whether the buffer actually holds width*height pixels.
    pub fn is_well_formed(&self) -> bool {
        self.width > 0 && self.height > 0 && self.data.len() >= (self.width * self.height) as usize
    }
}

/// Convert packed YUYV (4:2:2) to grayscale by extracting the Y channel.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
/// Grayscale = every even-indexed byte.
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// Convert interleaved RGB24 to grayscale using BT.601 luma weights.
pub fn rgb_to_grayscale(rgb: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 3) as usize;
    if rgb.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: rgb.len(),
        });
    }
    Ok(rgb[..expected]
        .chunks_exact(3)
        .map(|p| {
            let y = 0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32;
            y.round().clamp(0.0, 255.0) as u8
        })
        .collect())
}

/// Check if a frame is dark: true if more than `threshold_pct` of pixels
/// fall in the darkest histogram bucket (0–31).
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_extracts_y_channel() {
        // Two pixels: [Y0=10, U=20, Y1=30, V=40]
        let yuyv = vec![10u8, 20, 30, 40];
        let gray = yuyv_to_grayscale(&yuyv, 2, 1).unwrap();
        assert_eq!(gray, vec![10, 30]);
    }

    #[test]
    fn test_yuyv_short_buffer() {
        let yuyv = vec![0u8; 4];
        assert!(yuyv_to_grayscale(&yuyv, 4, 4).is_err());
    }

    #[test]
    fn test_rgb_gray_weights() {
        // Pure white pixel → 255
        let rgb = vec![255u8, 255, 255];
        let gray = rgb_to_grayscale(&rgb, 1, 1).unwrap();
        assert_eq!(gray, vec![255]);
    }

    #[test]
    fn test_dark_frame() {
        let dark = vec![5u8; 100];
        let bright = vec![200u8; 100];
        assert!(is_dark_frame(&dark, 0.95));
        assert!(!is_dark_frame(&bright, 0.95));
        assert!(is_dark_frame(&[], 0.95));
    }

    #[test]
    fn test_well_formed() {
        let ok = Frame::new(vec![0u8; 16], 4, 4);
        assert!(ok.is_well_formed());
        let short = Frame::new(vec![0u8; 8], 4, 4);
        assert!(!short.is_well_formed());
        let zero = Frame::new(vec![], 0, 0);
        assert!(!zero.is_well_formed());
    }
}
