//! Box (atom) primitives shared by the container reader and writer.
//!
//! Reading works on borrowed slices of the input buffer. Every [`Mp4Box`]
//! remembers the absolute offset of its payload so that callers can turn a
//! borrowed slice back into a zero-copy [`bytes::Bytes`] range.

use bytes::BufMut;

use crate::error::{Result, UpscaleError};

pub(crate) type FourCc = [u8; 4];

/// Render a four-character code for messages, replacing non-ASCII bytes.
pub(crate) fn fourcc_str(code: &FourCc) -> String {
    code.iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '?' })
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Mp4Box<'a> {
    pub kind: FourCc,
    pub payload: &'a [u8],
    /// Absolute offset of `payload` within the root buffer.
    pub start: usize,
}

impl<'a> Mp4Box<'a> {
    pub fn children(&self) -> BoxIter<'a> {
        BoxIter::new(self.payload, self.start)
    }

    /// First direct child of the given kind.
    pub fn child(&self, kind: &FourCc) -> Result<Option<Mp4Box<'a>>> {
        for child in self.children() {
            let child = child?;
            if &child.kind == kind {
                return Ok(Some(child));
            }
        }
        Ok(None)
    }

    /// Like [`child`](Self::child) but a missing box is a container error.
    pub fn require(&self, kind: &FourCc) -> Result<Mp4Box<'a>> {
        self.child(kind)?.ok_or_else(|| {
            UpscaleError::Container(format!(
                "'{}' box is missing its '{}' child",
                fourcc_str(&self.kind),
                fourcc_str(kind)
            ))
        })
    }

    pub fn reader(&self) -> ByteReader<'a> {
        ByteReader::new(self.payload, self.kind)
    }
}

/// Iterator over consecutive boxes in a byte range.
pub(crate) struct BoxIter<'a> {
    data: &'a [u8],
    pos: usize,
    base: usize,
}

impl<'a> BoxIter<'a> {
    pub fn new(data: &'a [u8], base: usize) -> Self {
        Self { data, pos: 0, base }
    }
}

impl<'a> Iterator for BoxIter<'a> {
    type Item = Result<Mp4Box<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.data.len().saturating_sub(self.pos);
        // Anything shorter than a header is trailing padding.
        if remaining < 8 {
            return None;
        }

        let at = self.pos;
        let raw = &self.data[at..];
        let size32 = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let kind: FourCc = [raw[4], raw[5], raw[6], raw[7]];

        let (mut header, size) = match size32 {
            0 => (8, remaining as u64),
            1 => {
                if remaining < 16 {
                    self.pos = self.data.len();
                    return Some(Err(UpscaleError::Container(format!(
                        "truncated 64-bit header for '{}' at offset {}",
                        fourcc_str(&kind),
                        self.base + at
                    ))));
                }
                let mut wide = [0u8; 8];
                wide.copy_from_slice(&raw[8..16]);
                (16, u64::from_be_bytes(wide))
            }
            n => (8, u64::from(n)),
        };
        if &kind == b"uuid" {
            header += 16;
        }

        if size < header as u64 || size > remaining as u64 {
            self.pos = self.data.len();
            return Some(Err(UpscaleError::Container(format!(
                "'{}' at offset {} claims {} bytes but {} remain",
                fourcc_str(&kind),
                self.base + at,
                size,
                remaining
            ))));
        }

        let size = size as usize;
        self.pos = at + size;
        Some(Ok(Mp4Box {
            kind,
            payload: &raw[header..size],
            start: self.base + at + header,
        }))
    }
}

/// Big-endian cursor over a box payload.
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
    kind: FourCc,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8], kind: FourCc) -> Self {
        Self { data, pos: 0, kind }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(UpscaleError::Container(format!(
                "unexpected end of '{}' (wanted {} bytes at {}, {} remain)",
                fourcc_str(&self.kind),
                n,
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.bytes(n).map(|_| ())
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u24(&mut self) -> Result<u32> {
        let b = self.bytes(3)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }

    pub fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn i32(&mut self) -> Result<i32> {
        self.u32().map(|v| v as i32)
    }

    pub fn u64(&mut self) -> Result<u64> {
        let b = self.bytes(8)?;
        let mut wide = [0u8; 8];
        wide.copy_from_slice(b);
        Ok(u64::from_be_bytes(wide))
    }

    pub fn f64(&mut self) -> Result<f64> {
        self.u64().map(f64::from_bits)
    }

    /// Version byte and 24-bit flags of a full box.
    pub fn full_header(&mut self) -> Result<(u8, u32)> {
        let version = self.u8()?;
        let flags = self.u24()?;
        Ok((version, flags))
    }
}

/// Serialize a box. Payloads larger than `u32` use the 64-bit size form.
pub(crate) fn build_box(kind: &FourCc, payload: &[u8]) -> Vec<u8> {
    let compact = 8 + payload.len();
    let mut out;
    if let Ok(size) = u32::try_from(compact) {
        out = Vec::with_capacity(compact);
        out.put_u32(size);
        out.put_slice(kind);
    } else {
        out = Vec::with_capacity(compact + 8);
        out.put_u32(1);
        out.put_slice(kind);
        out.put_u64(compact as u64 + 8);
    }
    out.put_slice(payload);
    out
}

pub(crate) fn build_full_box(kind: &FourCc, version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + payload.len());
    body.put_u8(version);
    body.put_uint(u64::from(flags & 0x00FF_FFFF), 3);
    body.put_slice(payload);
    build_box(kind, &body)
}

pub(crate) fn build_container(kind: &FourCc, children: &[Vec<u8>]) -> Vec<u8> {
    build_box(kind, &children.concat())
}
