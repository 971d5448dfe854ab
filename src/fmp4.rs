// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Fragmented MP4 box writing, shared by the recorder and the HLS writer.
//!
//! Only what an incremental writer needs: an init segment (`ftyp` + `moov`
//! with an empty sample table and an `mvex`), `moof`+`mdat` pairs per
//! fragment, and an `mfra` trailer for seekability of closed archive files.
//! Timescale is fixed at 90 kHz to match normalized timestamps.
//!
//! See ISO/IEC 14496-12:2015 for the box definitions.

use crate::stream::VideoSampleEntry;
use bytes::{BufMut, Bytes, BytesMut};
use db::recording::TIME_UNITS_PER_SEC;

pub const VIDEO_TRACK_ID: u32 = 1;

/// Sample flags with the 6 reserved MSBs set, as some players expect.
const fn with_reserved(bits: u32) -> u32 {
    (bits & 0x03FF_FFFF) | 0xFC00_0000
}

/// `sample_is_non_sync_sample = 1`.
const NON_SYNC: u32 = with_reserved(0x0001_0000);

/// `sample_depends_on = 2` (does not depend on others): a keyframe.
const RAP: u32 = with_reserved(0x0200_0000);

macro_rules! write_box {
    ($buf:expr, $fourcc:expr, $b:block) => {{
        let start = $buf.len();
        $buf.put_u32(0); // length placeholder, patched below
        $buf.extend_from_slice(&$fourcc[..]);
        $b;
        let len = ($buf.len() - start) as u32;
        $buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
    }};
}

/// Builds the init segment: `ftyp` plus a `moov` declaring one video track
/// whose samples all live in later fragments.
pub fn init_segment(e: &VideoSampleEntry) -> Bytes {
    let mut buf = BytesMut::with_capacity(1024 + e.data.len());
    write_box!(&mut buf, b"ftyp", {
        buf.extend_from_slice(b"isom"); // major_brand
        buf.put_u32(0x200); // minor_version
        buf.extend_from_slice(b"isom");
        buf.extend_from_slice(b"iso6");
        buf.extend_from_slice(b"avc1");
        buf.extend_from_slice(b"mp41");
    });
    write_box!(&mut buf, b"moov", {
        write_box!(buf, b"mvhd", {
            buf.put_u32(1 << 24); // version=1, flags=0
            buf.put_u64(0); // creation_time
            buf.put_u64(0); // modification_time
            buf.put_u32(TIME_UNITS_PER_SEC as u32); // timescale
            buf.put_u64(0); // duration: unknown, lives in fragments
            buf.put_u32(0x0001_0000); // rate
            buf.put_u16(0x0100); // volume
            buf.put_u16(0); // reserved
            buf.put_u64(0); // reserved
            for v in [0x0001_0000u32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
                buf.put_u32(v); // matrix
            }
            for _ in 0..6 {
                buf.put_u32(0); // pre_defined
            }
            buf.put_u32(VIDEO_TRACK_ID + 1); // next_track_id
        });
        write_box!(buf, b"trak", {
            write_box!(buf, b"tkhd", {
                buf.put_u32(7); // version=0, flags=enabled|in-movie|in-preview
                buf.put_u32(0); // creation_time
                buf.put_u32(0); // modification_time
                buf.put_u32(VIDEO_TRACK_ID);
                buf.put_u32(0); // reserved
                buf.put_u32(0); // duration
                buf.put_u64(0); // reserved
                buf.put_u16(0); // layer
                buf.put_u16(0); // alternate_group
                buf.put_u16(0); // volume
                buf.put_u16(0); // reserved
                for v in [0x0001_0000u32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
                    buf.put_u32(v); // matrix
                }
                buf.put_u32(u32::from(e.width) << 16);
                buf.put_u32(u32::from(e.height) << 16);
            });
            write_box!(buf, b"mdia", {
                write_box!(buf, b"mdhd", {
                    buf.put_u32(0); // version, flags
                    buf.put_u32(0); // creation_time
                    buf.put_u32(0); // modification_time
                    buf.put_u32(TIME_UNITS_PER_SEC as u32); // timescale
                    buf.put_u32(0); // duration
                    buf.put_u16(0x55c4); // language=und
                    buf.put_u16(0); // pre_defined
                });
                write_box!(buf, b"hdlr", {
                    buf.put_u32(0); // version, flags
                    buf.put_u32(0); // pre_defined
                    buf.extend_from_slice(b"vide");
                    for _ in 0..3 {
                        buf.put_u32(0); // reserved
                    }
                    buf.extend_from_slice(b"VideoHandler\0");
                });
                write_box!(buf, b"minf", {
                    write_box!(buf, b"vmhd", {
                        buf.put_u32(1); // version=0, flags=1
                        buf.put_u64(0); // graphicsmode, opcolor
                    });
                    write_box!(buf, b"dinf", {
                        write_box!(buf, b"dref", {
                            buf.put_u32(0); // version, flags
                            buf.put_u32(1); // entry_count
                            write_box!(buf, b"url ", {
                                buf.put_u32(1); // flags: self-contained
                            });
                        });
                    });
                    write_box!(buf, b"stbl", {
                        write_box!(buf, b"stsd", {
                            buf.put_u32(0); // version, flags
                            buf.put_u32(1); // entry_count
                            buf.extend_from_slice(&e.data);
                        });
                        write_box!(buf, b"stts", {
                            buf.put_u64(0); // version, flags, entry_count
                        });
                        write_box!(buf, b"stsc", {
                            buf.put_u64(0);
                        });
                        write_box!(buf, b"stsz", {
                            buf.put_u32(0); // version, flags
                            buf.put_u64(0); // sample_size, sample_count
                        });
                        write_box!(buf, b"stco", {
                            buf.put_u64(0);
                        });
                    });
                });
            });
        });
        write_box!(buf, b"mvex", {
            write_box!(buf, b"trex", {
                buf.put_u32(0); // version, flags
                buf.put_u32(VIDEO_TRACK_ID);
                buf.put_u32(1); // default_sample_description_index
                buf.put_u32(0); // default_sample_duration: use trun
                buf.put_u32(0); // default_sample_size: use trun
                buf.put_u32(NON_SYNC); // default_sample_flags
            });
        });
    });
    buf.freeze()
}

struct SampleMeta {
    duration: u32,
    size: u32,
    is_key: bool,
}

/// Accumulates one fragment (normally one GOP) and serializes it as
/// `moof` + `mdat`.
pub struct FragmentBuilder {
    /// `tfdt` base: the fragment's first decode timestamp, file-relative.
    base_dts: u64,
    samples: Vec<SampleMeta>,
    data: Vec<u8>,
}

impl FragmentBuilder {
    pub fn new(base_dts: u64) -> Self {
        FragmentBuilder {
            base_dts,
            samples: Vec::new(),
            data: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn base_dts(&self) -> u64 {
        self.base_dts
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    pub fn add_sample(&mut self, duration: u32, is_key: bool, data: &[u8]) {
        self.samples.push(SampleMeta {
            duration,
            size: data.len() as u32,
            is_key,
        });
        self.data.extend_from_slice(data);
    }

    /// Serializes the accumulated samples. The builder is spent afterwards.
    pub fn build(self, seq_no: u32) -> Bytes {
        let mut buf = BytesMut::with_capacity(256 + 8 * self.samples.len() + self.data.len());
        let data_offset_pos;
        write_box!(&mut buf, b"moof", {
            write_box!(buf, b"mfhd", {
                buf.put_u32(0); // version, flags
                buf.put_u32(seq_no);
            });
            write_box!(buf, b"traf", {
                write_box!(buf, b"tfhd", {
                    buf.put_u32(0x020000); // default-base-is-moof
                    buf.put_u32(VIDEO_TRACK_ID);
                });
                write_box!(buf, b"tfdt", {
                    buf.put_u32(1 << 24); // version=1, flags=0
                    buf.put_u64(self.base_dts);
                });
                write_box!(buf, b"trun", {
                    const DATA_OFFSET: u32 = 0x000001;
                    const FIRST_SAMPLE_FLAGS: u32 = 0x000004;
                    const SAMPLE_DURATION: u32 = 0x000100;
                    const SAMPLE_SIZE: u32 = 0x000200;
                    buf.put_u32(DATA_OFFSET | FIRST_SAMPLE_FLAGS | SAMPLE_DURATION | SAMPLE_SIZE);
                    buf.put_u32(self.samples.len() as u32);
                    data_offset_pos = buf.len();
                    buf.put_i32(0); // patched below
                    let first_flags = match self.samples.first() {
                        Some(s) if s.is_key => RAP,
                        _ => NON_SYNC,
                    };
                    buf.put_u32(first_flags);
                    for s in &self.samples {
                        buf.put_u32(s.duration);
                        buf.put_u32(s.size);
                    }
                });
            });
        });
        // Payload starts just past the mdat header, moof-relative.
        let data_offset = (buf.len() + 8) as i32;
        buf[data_offset_pos..data_offset_pos + 4].copy_from_slice(&data_offset.to_be_bytes());
        write_box!(&mut buf, b"mdat", {
            buf.extend_from_slice(&self.data);
        });
        buf.freeze()
    }
}

/// Builds the `mfra` trailer from `(presentation time, moof file offset)`
/// pairs, one per keyframe-led fragment.
pub fn mfra(entries: &[(u64, u64)]) -> Bytes {
    let mut buf = BytesMut::with_capacity(64 + 19 * entries.len());
    write_box!(&mut buf, b"mfra", {
        write_box!(buf, b"tfra", {
            buf.put_u32(1 << 24); // version=1, flags=0
            buf.put_u32(VIDEO_TRACK_ID);
            buf.put_u32(0); // traf/trun/sample number lengths: 1 byte each
            buf.put_u32(entries.len() as u32);
            for &(time, moof_offset) in entries {
                buf.put_u64(time);
                buf.put_u64(moof_offset);
                buf.put_u8(1); // traf_number
                buf.put_u8(1); // trun_number
                buf.put_u8(1); // sample_number
            }
        });
        write_box!(buf, b"mfro", {
            buf.put_u32(0); // version, flags
            // Size of the whole mfra, including this box: patched by hand
            // since write_box! only knows its own length.
            buf.put_u32(0);
        });
    });
    let total = buf.len() as u32;
    let mfro_size_pos = buf.len() - 4;
    buf[mfro_size_pos..].copy_from_slice(&total.to_be_bytes());
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::testutil::sample_entry;

    /// Walks sibling boxes in `data`, returning `(fourcc, body_range)`.
    fn boxes(data: &[u8]) -> Vec<([u8; 4], std::ops::Range<usize>)> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            let len = u32::from_be_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
            let fourcc: [u8; 4] = data[pos + 4..pos + 8].try_into().unwrap();
            assert!(len >= 8 && pos + len <= data.len(), "bad box at {pos}");
            out.push((fourcc, pos + 8..pos + len));
            pos += len;
        }
        out
    }

    fn find<'a>(
        data: &'a [u8],
        list: &[([u8; 4], std::ops::Range<usize>)],
        fourcc: &[u8; 4],
    ) -> &'a [u8] {
        let (_, r) = list
            .iter()
            .find(|(f, _)| f == fourcc)
            .unwrap_or_else(|| panic!("no {:?} box", std::str::from_utf8(fourcc).unwrap()));
        &data[r.clone()]
    }

    #[test]
    fn init_segment_structure() {
        let init = init_segment(&sample_entry());
        let top = boxes(&init);
        assert_eq!(
            top.iter().map(|(f, _)| *f).collect::<Vec<_>>(),
            vec![*b"ftyp", *b"moov"]
        );
        let moov = find(&init, &top, b"moov");
        let moov_children = boxes(moov);
        let names: Vec<[u8; 4]> = moov_children.iter().map(|(f, _)| *f).collect();
        assert_eq!(names, vec![*b"mvhd", *b"trak", *b"mvex"]);
        // The sample entry must appear verbatim inside the stsd.
        let entry = sample_entry().data;
        assert!(moov
            .windows(entry.len())
            .any(|w| w == entry.as_slice()));
    }

    #[test]
    fn fragment_structure_and_data_offset() {
        let mut b = FragmentBuilder::new(180_000);
        b.add_sample(3000, true, b"keyframe");
        b.add_sample(3000, false, b"delta");
        let frag = b.build(7);
        let top = boxes(&frag);
        assert_eq!(
            top.iter().map(|(f, _)| *f).collect::<Vec<_>>(),
            vec![*b"moof", *b"mdat"]
        );
        let (_, moof_range) = &top[0];
        let moof = &frag[moof_range.clone()];
        let moof_children = boxes(moof);
        let mfhd = find(moof, &moof_children, b"mfhd");
        assert_eq!(&mfhd[4..8], &7u32.to_be_bytes());
        let traf = find(moof, &moof_children, b"traf");
        let traf_children = boxes(traf);
        let tfdt = find(traf, &traf_children, b"tfdt");
        assert_eq!(&tfdt[4..12], &180_000u64.to_be_bytes());
        let trun = find(traf, &traf_children, b"trun");
        let sample_count = u32::from_be_bytes(trun[4..8].try_into().unwrap());
        assert_eq!(sample_count, 2);
        let data_offset = i32::from_be_bytes(trun[8..12].try_into().unwrap()) as usize;
        // data_offset is moof-relative and must land on the mdat payload.
        assert_eq!(&frag[data_offset..data_offset + 8], b"keyframe");
        // mdat payload is the concatenated samples.
        let mdat = find(&frag, &top, b"mdat");
        assert_eq!(mdat, b"keyframe".iter().chain(b"delta").copied().collect::<Vec<u8>>().as_slice());
    }

    #[test]
    fn mfra_trailer_sizes() {
        let trailer = mfra(&[(0, 40), (180_000, 10_000)]);
        let top = boxes(&trailer);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].0, *b"mfra");
        // mfro's final u32 holds the total mfra size.
        let total = u32::from_be_bytes(trailer[trailer.len() - 4..].try_into().unwrap());
        assert_eq!(total as usize, trailer.len());
    }
}
