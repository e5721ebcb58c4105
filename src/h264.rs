//! H.264 bitstream helpers.
//!
//! MP4 stores H.264 as length-prefixed NAL units (AVCC) with the parameter
//! sets in an `AVCDecoderConfigurationRecord`. Encoders usually produce
//! Annex B (start-code delimited) output. This module converts between the
//! two.
//!
//! | NAL type | Name |
//! |----------|------|
//! | 5 | IDR slice |
//! | 7 | SPS |
//! | 8 | PPS |

use bytes::{BufMut, Bytes};

/// H.264 NAL unit type constants.
pub mod nal_type {
    /// IDR coded slice (keyframe).
    pub const IDR_SLICE: u8 = 5;
    /// Sequence Parameter Set.
    pub const SPS: u8 = 7;
    /// Picture Parameter Set.
    pub const PPS: u8 = 8;
}

/// Baseline profile level 3.0 SPS for 640x480, usable as a stand-in
/// configuration.
pub const DEFAULT_SPS: [u8; 10] = [0x67, 0x42, 0x00, 0x1e, 0xda, 0x02, 0x80, 0x2d, 0x8b, 0x11];

/// PPS matching [`DEFAULT_SPS`].
pub const DEFAULT_PPS: [u8; 4] = [0x68, 0xce, 0x38, 0x80];

/// Iterator over NAL units in an Annex B bitstream, start codes removed.
pub struct AnnexBNalIter<'a> {
    data: &'a [u8],
    cursor: usize,
}

impl<'a> AnnexBNalIter<'a> {
    /// Iterate the NAL units of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, cursor: 0 }
    }
}

impl<'a> Iterator for AnnexBNalIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let (at, len) = find_start_code(self.data, self.cursor)?;
        let start = at + len;
        let end = find_start_code(self.data, start).map_or(self.data.len(), |(next, _)| next);
        self.cursor = end;
        Some(&self.data[start..end])
    }
}

/// Position and length of the next 3- or 4-byte start code at or after `from`.
pub fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if i + 4 <= data.len() && data[i..i + 4] == [0, 0, 0, 1] {
            return Some((i, 4));
        }
        if data[i..i + 3] == [0, 0, 1] {
            return Some((i, 3));
        }
        i += 1;
    }
    None
}

/// Whether `data` starts with an Annex B start code.
pub fn is_annexb(data: &[u8]) -> bool {
    data.starts_with(&[0, 0, 1]) || data.starts_with(&[0, 0, 0, 1])
}

/// Convert Annex B data to 4-byte length-prefixed AVCC.
///
/// Input without start codes is treated as a single NAL unit.
///
/// ```
/// use upscaler::h264::annexb_to_avcc;
///
/// let avcc = annexb_to_avcc(&[0, 0, 0, 1, 0x65, 0x88, 0x84]);
/// assert_eq!(avcc, vec![0, 0, 0, 3, 0x65, 0x88, 0x84]);
/// ```
pub fn annexb_to_avcc(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 4);
    for nal in AnnexBNalIter::new(data).filter(|nal| !nal.is_empty()) {
        out.put_u32(nal.len() as u32);
        out.put_slice(nal);
    }
    if out.is_empty() && !data.is_empty() {
        out.put_u32(data.len() as u32);
        out.put_slice(data);
    }
    out
}

/// Whether Annex B `data` contains an IDR slice.
pub fn is_keyframe(data: &[u8]) -> bool {
    AnnexBNalIter::new(data).any(|nal| nal.first().is_some_and(|b| b & 0x1F == nal_type::IDR_SLICE))
}

/// SPS and PPS of an H.264 stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvcConfig {
    /// Sequence Parameter Set NAL unit, without start code.
    pub sps: Vec<u8>,
    /// Picture Parameter Set NAL unit, without start code.
    pub pps: Vec<u8>,
}

impl AvcConfig {
    /// Configuration from raw parameter sets.
    pub fn new(sps: Vec<u8>, pps: Vec<u8>) -> Self {
        Self { sps, pps }
    }

    /// First SPS and PPS of an Annex B buffer.
    pub fn from_annexb(data: &[u8]) -> Option<Self> {
        let mut sps = None;
        let mut pps = None;
        for nal in AnnexBNalIter::new(data) {
            match nal.first().map(|b| b & 0x1F) {
                Some(nal_type::SPS) if sps.is_none() => sps = Some(nal.to_vec()),
                Some(nal_type::PPS) if pps.is_none() => pps = Some(nal.to_vec()),
                _ => {}
            }
            if sps.is_some() && pps.is_some() {
                break;
            }
        }
        Some(Self::new(sps?, pps?))
    }

    /// First SPS and PPS of an `AVCDecoderConfigurationRecord`.
    pub fn from_record(record: &[u8]) -> Option<Self> {
        if record.len() < 7 || record[0] != 1 {
            return None;
        }
        let mut pos = 5;
        let sps_count = usize::from(record[pos] & 0x1F);
        pos += 1;
        let mut sps = None;
        for _ in 0..sps_count {
            let (nal, next) = length_prefixed(record, pos)?;
            sps.get_or_insert_with(|| nal.to_vec());
            pos = next;
        }
        let pps_count = usize::from(*record.get(pos)?);
        pos += 1;
        let mut pps = None;
        for _ in 0..pps_count {
            let (nal, next) = length_prefixed(record, pos)?;
            pps.get_or_insert_with(|| nal.to_vec());
            pos = next;
        }
        Some(Self::new(sps?, pps?))
    }

    /// `profile_idc` (66 baseline, 77 main, 100 high).
    pub fn profile_idc(&self) -> u8 {
        self.sps.get(1).copied().unwrap_or(66)
    }

    /// Constraint flags byte.
    pub fn profile_compatibility(&self) -> u8 {
        self.sps.get(2).copied().unwrap_or(0)
    }

    /// `level_idc` (31 is level 3.1).
    pub fn level_idc(&self) -> u8 {
        self.sps.get(3).copied().unwrap_or(31)
    }

    /// Serialize as an `AVCDecoderConfigurationRecord` with 4-byte NAL
    /// lengths. This is the description blob decoders are configured with.
    pub fn to_record(&self) -> Bytes {
        let mut out = Vec::with_capacity(11 + self.sps.len() + self.pps.len());
        out.put_u8(1);
        out.put_u8(self.profile_idc());
        out.put_u8(self.profile_compatibility());
        out.put_u8(self.level_idc());
        out.put_u8(0xFF);
        out.put_u8(0xE1);
        out.put_u16(self.sps.len() as u16);
        out.put_slice(&self.sps);
        out.put_u8(1);
        out.put_u16(self.pps.len() as u16);
        out.put_slice(&self.pps);
        Bytes::from(out)
    }
}

fn length_prefixed(data: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let len = usize::from(u16::from_be_bytes([*data.get(pos)?, *data.get(pos + 1)?]));
    let start = pos + 2;
    let nal = data.get(start..start + len)?;
    Some((nal, start + len))
}
