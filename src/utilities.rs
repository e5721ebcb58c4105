//! Internal utility functions.
//!
//! Timestamp conversion between container timescales and microseconds,
//! output file naming, and (with the `ffmpeg` feature) pixel-data copying.

use std::path::Path;

const MICROS_PER_SECOND: i128 = 1_000_000;

/// Convert timescale ticks to microseconds, truncating toward zero.
pub(crate) fn ticks_to_micros(ticks: i64, timescale: u32) -> i64 {
    if timescale == 0 {
        return 0;
    }
    (i128::from(ticks) * MICROS_PER_SECOND / i128::from(timescale)) as i64
}

/// Convert microseconds to timescale ticks, rounding to nearest.
pub(crate) fn micros_to_ticks(micros: i64, timescale: u32) -> i64 {
    let scaled = i128::from(micros) * i128::from(timescale);
    let half = MICROS_PER_SECOND / 2;
    let rounded = if scaled >= 0 {
        (scaled + half) / MICROS_PER_SECOND
    } else {
        (scaled - half) / MICROS_PER_SECOND
    };
    rounded as i64
}

/// Default name for the output of a conversion: the input's name up to its
/// first dot, followed by `-upscaled.mp4`.
///
/// ```
/// assert_eq!(upscaler::upscaled_file_name("holiday.final.mov"), "holiday-upscaled.mp4");
/// ```
pub fn upscaled_file_name(input: impl AsRef<Path>) -> String {
    let name = input
        .as_ref()
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = name.split('.').next().unwrap_or_default();
    let stem = if stem.is_empty() { "video" } else { stem };
    format!("{stem}-upscaled.mp4")
}

/// Copy one plane of an FFmpeg video frame into a tightly packed buffer.
///
/// FFmpeg frames frequently carry per-row padding (stride > width × bpp).
/// This strips it so the result can be handed to [`image::RgbaImage::from_raw`].
#[cfg(feature = "ffmpeg")]
pub(crate) fn frame_to_packed_buffer(
    video_frame: &ffmpeg_next::frame::Video,
    width: u32,
    height: u32,
    bytes_per_pixel: usize,
) -> Vec<u8> {
    let stride = video_frame.stride(0);
    let row_len = (width as usize) * bytes_per_pixel;
    let data = video_frame.data(0);

    if stride == row_len {
        data[..row_len * (height as usize)].to_vec()
    } else {
        let mut buffer = Vec::with_capacity(row_len * (height as usize));
        for row in 0..(height as usize) {
            let row_start = row * stride;
            buffer.extend_from_slice(&data[row_start..row_start + row_len]);
        }
        buffer
    }
}

/// Copy a packed buffer into plane 0 of an FFmpeg frame, honouring its stride.
#[cfg(feature = "ffmpeg")]
pub(crate) fn packed_buffer_to_frame(
    buffer: &[u8],
    video_frame: &mut ffmpeg_next::frame::Video,
    width: u32,
    height: u32,
    bytes_per_pixel: usize,
) {
    let stride = video_frame.stride(0);
    let row_len = (width as usize) * bytes_per_pixel;
    let data = video_frame.data_mut(0);
    for row in 0..(height as usize) {
        let src = &buffer[row * row_len..(row + 1) * row_len];
        data[row * stride..row * stride + row_len].copy_from_slice(src);
    }
}
