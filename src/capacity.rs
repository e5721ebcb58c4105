//! Output size estimation and target selection.
//!
//! The estimate uses a fixed linear bitrate model scaled from 10 Mbit/s at
//! 1280×720 by pixel count (the output has four times the input pixels), plus
//! 16 000 bytes per second for audio.

use std::time::Duration;

use crate::error::{Result, UpscaleError};
use crate::mux::MAX_DIMENSION;
use crate::upscale::SCALE_FACTOR;

/// Bitrate of the reference resolution, in bits per second.
pub const REFERENCE_BITRATE: f64 = 1e7;
/// Pixel count of the reference resolution (1280×720).
pub const REFERENCE_PIXELS: f64 = 1280.0 * 720.0;
/// Audio allowance in bytes per second.
pub const AUDIO_BYTES_PER_SECOND: f64 = 16_000.0;
/// Largest estimate that is still written to memory.
pub const IN_MEMORY_LIMIT: u64 = 100 * 1024 * 1024;
/// Output pixel count above which the higher-capability profile is used.
pub const HIGH_PROFILE_PIXELS: u64 = 921_600;

/// H.264 level 6.2 constrained baseline.
pub const HIGH_CAPABILITY_PROFILE: &str = "avc1.42003e";
/// H.264 level 3.1 constrained baseline.
pub const BASELINE_PROFILE: &str = "avc1.42001f";

/// Where the output container is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// A growable in-memory buffer handed to the caller at the end.
    Memory,
    /// A writable stream chosen by the caller before processing.
    Stream,
}

impl TargetKind {
    /// Target for an output of `estimated_bytes`.
    pub fn for_estimate(estimated_bytes: u64) -> Self {
        if estimated_bytes > IN_MEMORY_LIMIT {
            TargetKind::Stream
        } else {
            TargetKind::Memory
        }
    }
}

/// Everything decided about the output before processing starts.
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub struct CapacityPlan {
    /// Estimated output size in bytes.
    pub estimated_bytes: u64,
    /// Encoder bitrate in bits per second (unrounded).
    pub bitrate: f64,
    /// Encoder codec string.
    pub codec: &'static str,
    /// Output width.
    pub output_width: u32,
    /// Output height.
    pub output_height: u32,
    /// Output target.
    pub target: TargetKind,
}

/// Video bitrate for a source of `width`×`height`.
pub fn video_bitrate(width: u32, height: u32) -> f64 {
    REFERENCE_BITRATE * (f64::from(width) * f64::from(height) * 4.0) / REFERENCE_PIXELS
}

/// Estimated output size in bytes.
pub fn estimate_output_size(width: u32, height: u32, duration: Duration) -> u64 {
    let per_second = video_bitrate(width, height) / 8.0 + AUDIO_BYTES_PER_SECOND;
    (per_second * duration.as_secs_f64()).ceil() as u64
}

/// Encoder profile for a source of `width`×`height`.
pub fn codec_profile(width: u32, height: u32) -> &'static str {
    if u64::from(width) * u64::from(height) * 4 > HIGH_PROFILE_PIXELS {
        HIGH_CAPABILITY_PROFILE
    } else {
        BASELINE_PROFILE
    }
}

/// Plan the output for a source of `width`×`height` lasting `duration`.
///
/// # Errors
///
/// - [`UpscaleError::InvalidConfig`] if the upscaled frame is wider or taller
///   than an MP4 track header can describe.
/// - [`UpscaleError::QuotaExceeded`] if `quota` is smaller than the estimate.
///
/// ```
/// use std::time::Duration;
///
/// use upscaler::capacity::{TargetKind, plan};
///
/// let plan = plan(640, 360, Duration::from_secs(10), None).unwrap();
/// assert_eq!(plan.codec, "avc1.42003e");
/// assert_eq!((plan.output_width, plan.output_height), (1280, 720));
/// assert_eq!(plan.target, TargetKind::Memory);
/// ```
pub fn plan(width: u32, height: u32, duration: Duration, quota: Option<u64>) -> Result<CapacityPlan> {
    let output_width = width.checked_mul(SCALE_FACTOR).filter(|&w| w <= MAX_DIMENSION);
    let output_height = height.checked_mul(SCALE_FACTOR).filter(|&h| h <= MAX_DIMENSION);
    let (Some(output_width), Some(output_height)) = (output_width, output_height) else {
        return Err(UpscaleError::InvalidConfig(format!(
            "{width}x{height} upscales past {MAX_DIMENSION} pixels per side"
        )));
    };
    let estimated_bytes = estimate_output_size(width, height, duration);
    if let Some(quota) = quota.filter(|&quota| estimated_bytes > quota) {
        return Err(UpscaleError::QuotaExceeded {
            estimated: estimated_bytes,
            quota,
        });
    }
    Ok(CapacityPlan {
        estimated_bytes,
        bitrate: video_bitrate(width, height),
        codec: codec_profile(width, height),
        output_width,
        output_height,
        target: TargetKind::for_estimate(estimated_bytes),
    })
}

/// Format a byte count with binary units and one decimal.
///
/// ```
/// assert_eq!(upscaler::human_file_size(1536.0), "1.5 KiB");
/// ```
pub fn human_file_size(bytes: f64) -> String {
    const UNITS: [&str; 8] = ["KiB", "MiB", "GiB", "TiB", "PiB", "EiB", "ZiB", "YiB"];
    const THRESHOLD: f64 = 1024.0;

    if bytes.abs() < THRESHOLD {
        return format!("{bytes} B");
    }
    let mut value = bytes;
    let mut unit = 0;
    loop {
        value /= THRESHOLD;
        let shown = (value.abs() * 10.0).round() / 10.0;
        if shown < THRESHOLD || unit == UNITS.len() - 1 {
            break;
        }
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitrate_scales_with_pixels() {
        assert_eq!(video_bitrate(640, 360), 1e7);
        assert_eq!(video_bitrate(1280, 720), 4e7);
    }

    #[test]
    fn estimate_includes_audio_allowance() {
        // 1e7 / 8 + 16 000 bytes per second.
        assert_eq!(estimate_output_size(640, 360, Duration::from_secs(2)), 2_532_000);
    }

    #[test]
    fn one_byte_over_the_limit_streams() {
        assert_eq!(TargetKind::for_estimate(IN_MEMORY_LIMIT), TargetKind::Memory);
        assert_eq!(TargetKind::for_estimate(IN_MEMORY_LIMIT + 1), TargetKind::Stream);
        assert_eq!(codec_profile(1280, 720), HIGH_CAPABILITY_PROFILE);
    }

    #[test]
    fn profile_threshold_is_inclusive_for_baseline() {
        // 480×480×4 == 921 600
        assert_eq!(codec_profile(480, 480), BASELINE_PROFILE);
        assert_eq!(codec_profile(481, 480), HIGH_CAPABILITY_PROFILE);
    }

    #[test]
    fn oversized_output_is_rejected() {
        assert!(plan(32_767, 100, Duration::from_secs(1), None).is_ok());
        for (w, h) in [(32_768, 100), (100, 40_000), (u32::MAX, 1)] {
            assert!(matches!(
                plan(w, h, Duration::from_secs(1), None),
                Err(UpscaleError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn quota_is_checked() {
        let err = plan(1280, 720, Duration::from_secs(60), Some(1024)).unwrap_err();
        assert!(matches!(err, UpscaleError::QuotaExceeded { quota: 1024, .. }));
        assert!(err.to_string().contains("1.0 KiB"));

        let plan = plan(1280, 720, Duration::from_secs(60), None).unwrap();
        assert_eq!(plan.target, TargetKind::Stream);
    }

    #[test]
    fn human_sizes() {
        assert_eq!(human_file_size(512.0), "512 B");
        assert_eq!(human_file_size(1024.0 * 1024.0 * 100.0), "100.0 MiB");
        assert_eq!(human_file_size(1024.0 * 1023.99), "1.0 MiB");
    }
}
