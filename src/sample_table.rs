//! Sample table decoding.
//!
//! Turns the run-length tables of an `stbl` box into one [`SampleLocation`]
//! per sample, in decode order.

use crate::boxes::{ByteReader, Mp4Box};
use crate::error::{Result, UpscaleError};

/// Position, size and timing of one sample, in track timescale units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SampleLocation {
    pub offset: u64,
    pub size: u32,
    pub dts: u64,
    pub cts: i64,
    pub duration: u32,
    pub sync: bool,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct SampleTable {
    /// (sample_count, sample_delta)
    time_to_sample: Vec<(u32, u32)>,
    /// (sample_count, sample_offset)
    composition_offsets: Vec<(u32, i64)>,
    /// (first_chunk, samples_per_chunk)
    sample_to_chunk: Vec<(u32, u32)>,
    uniform_size: u32,
    sizes: Vec<u32>,
    sample_count: usize,
    chunk_offsets: Vec<u64>,
    /// 1-based sync sample numbers, sorted. `None` means every sample is sync.
    sync_samples: Option<Vec<u32>>,
}

impl SampleTable {
    /// Parse the tables of `stbl`. Counts are checked against what the
    /// payload and a `file_len`-byte file can actually hold.
    pub fn parse(stbl: &Mp4Box<'_>, file_len: u64) -> Result<Self> {
        let mut table = SampleTable::default();
        let mut have_sizes = false;
        let mut have_offsets = false;

        for child in stbl.children() {
            let child = child?;
            let mut r = child.reader();
            match &child.kind {
                b"stts" => {
                    r.full_header()?;
                    let count = r.u32()?;
                    for _ in 0..count {
                        table.time_to_sample.push((r.u32()?, r.u32()?));
                    }
                }
                b"ctts" => {
                    let (version, _) = r.full_header()?;
                    let count = r.u32()?;
                    for _ in 0..count {
                        let samples = r.u32()?;
                        let offset = if version == 0 {
                            i64::from(r.u32()?)
                        } else {
                            i64::from(r.i32()?)
                        };
                        table.composition_offsets.push((samples, offset));
                    }
                }
                b"stsc" => {
                    r.full_header()?;
                    let count = r.u32()?;
                    for _ in 0..count {
                        let first_chunk = r.u32()?;
                        let per_chunk = r.u32()?;
                        r.skip(4)?; // sample_description_index
                        table.sample_to_chunk.push((first_chunk, per_chunk));
                    }
                }
                b"stsz" => {
                    r.full_header()?;
                    table.uniform_size = r.u32()?;
                    table.sample_count = r.u32()? as usize;
                    if table.uniform_size == 0 {
                        table.sizes.reserve(table.sample_count.min(r.remaining() / 4));
                        for _ in 0..table.sample_count {
                            table.sizes.push(r.u32()?);
                        }
                    }
                    have_sizes = true;
                }
                b"stz2" => {
                    r.full_header()?;
                    r.skip(3)?;
                    let field_size = r.u8()?;
                    table.sample_count = r.u32()? as usize;
                    table.sizes = read_compact_sizes(&mut r, field_size, table.sample_count)?;
                    have_sizes = true;
                }
                b"stco" => {
                    r.full_header()?;
                    let count = r.u32()?;
                    for _ in 0..count {
                        table.chunk_offsets.push(u64::from(r.u32()?));
                    }
                    have_offsets = true;
                }
                b"co64" => {
                    r.full_header()?;
                    let count = r.u32()?;
                    for _ in 0..count {
                        table.chunk_offsets.push(r.u64()?);
                    }
                    have_offsets = true;
                }
                b"stss" => {
                    r.full_header()?;
                    let count = r.u32()?;
                    let mut sync = Vec::with_capacity((count as usize).min(r.remaining() / 4));
                    for _ in 0..count {
                        sync.push(r.u32()?);
                    }
                    table.sync_samples = Some(sync);
                }
                _ => {}
            }
        }

        let uniform_bytes = (table.sample_count as u64).saturating_mul(u64::from(table.uniform_size));
        if uniform_bytes > file_len {
            return Err(UpscaleError::Container(format!(
                "{} samples of {} bytes do not fit in a {file_len}-byte file",
                table.sample_count, table.uniform_size
            )));
        }
        if table.sample_count > 0 && !(have_sizes && have_offsets) {
            return Err(UpscaleError::Container(
                "sample table lacks sample sizes or chunk offsets".to_string(),
            ));
        }
        if let Some(sync) = table.sync_samples.as_mut() {
            sync.sort_unstable();
        }
        Ok(table)
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    fn size_of(&self, index: usize) -> u32 {
        if self.uniform_size != 0 {
            self.uniform_size
        } else {
            self.sizes[index]
        }
    }

    /// Walk every table once and resolve each sample.
    pub fn locate(&self) -> Result<Vec<SampleLocation>> {
        let count = self.sample_count;
        let mut out = Vec::with_capacity(count);

        // Offsets: expand stsc runs over the chunk list.
        let mut index = 0usize;
        'chunks: for (run, &(first_chunk, per_chunk)) in self.sample_to_chunk.iter().enumerate() {
            let first = first_chunk.max(1) as usize;
            let last = match self.sample_to_chunk.get(run + 1) {
                Some(&(next_first, _)) => next_first as usize,
                None => self.chunk_offsets.len() + 1,
            };
            for chunk in first..last {
                let Some(&chunk_offset) = self.chunk_offsets.get(chunk - 1) else {
                    break 'chunks;
                };
                let mut offset = chunk_offset;
                for _ in 0..per_chunk {
                    if index == count {
                        break 'chunks;
                    }
                    let size = self.size_of(index);
                    out.push(SampleLocation {
                        offset,
                        size,
                        dts: 0,
                        cts: 0,
                        duration: 0,
                        sync: true,
                    });
                    offset += u64::from(size);
                    index += 1;
                }
            }
        }
        if out.len() != count {
            return Err(UpscaleError::Container(format!(
                "chunk table covers {} of {} samples",
                out.len(),
                count
            )));
        }

        // Timing.
        let mut deltas = self
            .time_to_sample
            .iter()
            .flat_map(|&(n, delta)| std::iter::repeat_n(delta, n as usize));
        let mut offsets = self
            .composition_offsets
            .iter()
            .flat_map(|&(n, offset)| std::iter::repeat_n(offset, n as usize));
        let mut dts = 0u64;
        for (i, sample) in out.iter_mut().enumerate() {
            let delta = deltas.next().ok_or_else(|| {
                UpscaleError::Container(format!("time-to-sample table ends at sample {i} of {count}"))
            })?;
            sample.dts = dts;
            sample.cts = dts as i64 + offsets.next().unwrap_or(0);
            sample.duration = delta;
            dts += u64::from(delta);
        }

        if let Some(sync) = &self.sync_samples {
            for sample in out.iter_mut() {
                sample.sync = false;
            }
            for &number in sync {
                if let Some(sample) = (number as usize).checked_sub(1).and_then(|i| out.get_mut(i)) {
                    sample.sync = true;
                }
            }
        }

        Ok(out)
    }
}

fn read_compact_sizes(r: &mut ByteReader<'_>, field_size: u8, count: usize) -> Result<Vec<u32>> {
    let fits = r.remaining().saturating_mul(8) / usize::from(field_size.max(4));
    let mut sizes = Vec::with_capacity(count.min(fits));
    match field_size {
        4 => {
            while sizes.len() < count {
                let b = r.u8()?;
                sizes.push(u32::from(b >> 4));
                if sizes.len() < count {
                    sizes.push(u32::from(b & 0x0F));
                }
            }
        }
        8 => {
            for _ in 0..count {
                sizes.push(u32::from(r.u8()?));
            }
        }
        16 => {
            for _ in 0..count {
                sizes.push(u32::from(r.u16()?));
            }
        }
        other => {
            return Err(UpscaleError::Container(format!("invalid stz2 field size {other}")));
        }
    }
    Ok(sizes)
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;

    use super::*;
    use crate::boxes::{BoxIter, build_container, build_full_box};

    fn entries(count: u32, body: &[u32]) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_u32(count);
        for v in body {
            out.put_u32(*v);
        }
        out
    }

    fn stbl(children: &[Vec<u8>]) -> Vec<u8> {
        build_container(b"stbl", children)
    }

    fn parse(data: &[u8]) -> SampleTable {
        let stbl = BoxIter::new(data, 0).next().unwrap().unwrap();
        SampleTable::parse(&stbl, data.len() as u64).unwrap()
    }

    #[test]
    fn resolves_offsets_across_chunk_runs() {
        // 5 samples: chunks 1-2 hold 2 samples each, chunk 3 holds 1.
        let data = stbl(&[
            build_full_box(b"stts", 0, 0, &entries(1, &[5, 100])),
            build_full_box(b"stsc", 0, 0, &entries(2, &[1, 2, 1, 3, 1, 1])),
            build_full_box(b"stsz", 0, 0, &entries(0, &[5, 10, 20, 30, 40, 50])),
            build_full_box(b"stco", 0, 0, &entries(3, &[1000, 2000, 3000])),
            build_full_box(b"stss", 0, 0, &entries(2, &[1, 4])),
        ]);
        let samples = parse(&data).locate().unwrap();
        let offsets: Vec<u64> = samples.iter().map(|s| s.offset).collect();
        assert_eq!(offsets, vec![1000, 1010, 2000, 2020, 3000]);
        let dts: Vec<u64> = samples.iter().map(|s| s.dts).collect();
        assert_eq!(dts, vec![0, 100, 200, 300, 400]);
        let sync: Vec<bool> = samples.iter().map(|s| s.sync).collect();
        assert_eq!(sync, vec![true, false, false, true, false]);
    }

    #[test]
    fn applies_signed_composition_offsets() {
        let data = stbl(&[
            build_full_box(b"stts", 0, 0, &entries(1, &[3, 10])),
            build_full_box(b"ctts", 1, 0, &entries(2, &[1, 20, 2, (-10i32) as u32])),
            build_full_box(b"stsc", 0, 0, &entries(1, &[1, 3, 1])),
            build_full_box(b"stsz", 0, 0, &entries(4, &[3])),
            build_full_box(b"stco", 0, 0, &entries(1, &[64])),
        ]);
        let samples = parse(&data).locate().unwrap();
        let cts: Vec<i64> = samples.iter().map(|s| s.cts).collect();
        assert_eq!(cts, vec![20, 0, 10]);
        assert!(samples.iter().all(|s| s.sync && s.size == 4));
        assert_eq!(samples[2].offset, 72);
    }

    #[test]
    fn missing_timing_is_an_error() {
        let data = stbl(&[
            build_full_box(b"stts", 0, 0, &entries(1, &[1, 10])),
            build_full_box(b"stsc", 0, 0, &entries(1, &[1, 2, 1])),
            build_full_box(b"stsz", 0, 0, &entries(4, &[2])),
            build_full_box(b"stco", 0, 0, &entries(1, &[0])),
        ]);
        assert!(matches!(parse(&data).locate(), Err(UpscaleError::Container(_))));
    }

    #[test]
    fn compact_sample_sizes() {
        let mut body = Vec::new();
        body.put_uint(0, 3);
        body.put_u8(4);
        body.put_u32(3);
        body.put_slice(&[0x12, 0x30]);
        let data = stbl(&[
            build_full_box(b"stts", 0, 0, &entries(1, &[3, 1])),
            build_full_box(b"stsc", 0, 0, &entries(1, &[1, 3, 1])),
            build_full_box(b"stz2", 0, 0, &body),
            build_full_box(b"stco", 0, 0, &entries(1, &[0])),
        ]);
        let sizes: Vec<u32> = parse(&data).locate().unwrap().iter().map(|s| s.size).collect();
        assert_eq!(sizes, vec![1, 2, 3]);
    }

    #[test]
    fn uniform_count_larger_than_the_file_is_rejected() {
        let data = stbl(&[
            build_full_box(b"stts", 0, 0, &entries(1, &[1, 10])),
            build_full_box(b"stsc", 0, 0, &entries(1, &[1, u32::MAX, 1])),
            build_full_box(b"stsz", 0, 0, &entries(1, &[u32::MAX])),
            build_full_box(b"stco", 0, 0, &entries(1, &[0])),
        ]);
        let stbl = BoxIter::new(&data, 0).next().unwrap().unwrap();
        let result = SampleTable::parse(&stbl, data.len() as u64);
        assert!(matches!(result, Err(UpscaleError::Container(_))));
    }

    #[test]
    fn oversized_counts_fail_on_missing_entries() {
        for kind in [b"stsz", b"stss"] {
            let body = if kind == b"stsz" {
                entries(0, &[u32::MAX, 7])
            } else {
                entries(u32::MAX, &[1])
            };
            let data = stbl(&[
                build_full_box(b"stsc", 0, 0, &entries(1, &[1, 1, 1])),
                build_full_box(b"stco", 0, 0, &entries(1, &[0])),
                build_full_box(kind, 0, 0, &body),
            ]);
            let stbl = BoxIter::new(&data, 0).next().unwrap().unwrap();
            let result = SampleTable::parse(&stbl, data.len() as u64);
            assert!(matches!(result, Err(UpscaleError::Container(_))), "{kind:?}");
        }
    }
}
