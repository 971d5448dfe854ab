// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! RTSP stream opening and demuxing, via the Retina library.

use base::{bail, err, Error};
use bytes::Bytes;
use db::recording::TIME_UNITS_PER_SEC;
use futures::StreamExt;
use retina::client::Demuxed;
use retina::codec::CodecItem;
use std::pin::Pin;
use std::result::Result;
use tracing::Instrument;
use url::Url;

static RETINA_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Codec of a [`MediaPacket`]'s payload.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CodecKind {
    H264,
    H265,
    Jpeg,
    Aac,
}

impl CodecKind {
    pub fn is_video(self) -> bool {
        !matches!(self, CodecKind::Aac)
    }
}

/// One demuxed packet, as handed to the normalizer and then fanned out.
///
/// The payload is immutable after creation; consumers share it by reference
/// counting (`Bytes` internally, `Arc<MediaPacket>` across sinks).
#[derive(Clone, Debug)]
pub struct MediaPacket {
    pub codec: CodecKind,

    /// Stream-relative track index: 0 is video; additional tracks follow the
    /// source's declaration order.
    pub track: usize,

    pub data: Bytes,

    /// Source timestamps in 90 kHz units; may be absent, wrap, or reset.
    pub raw_pts: Option<i64>,
    pub raw_dts: Option<i64>,

    /// Normalized timestamps, monotonic per track within one discontinuity
    /// seq. Zero until the normalizer has run.
    pub pts: i64,
    pub dts: i64,

    /// Discontinuity sequence; bumped by the normalizer on a source reset.
    pub seq: u32,

    pub is_key: bool,

    /// Wall-clock capture time (local receipt time).
    pub capture_time: jiff::Timestamp,
}

/// An MP4 sample entry describing the video track's codec parameters.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VideoSampleEntry {
    /// The complete sample entry box (`avc1` etc), ready for an `stsd`.
    pub data: Vec<u8>,
    pub rfc6381_codec: String,
    pub width: u16,
    pub height: u16,
}

pub struct Options {
    pub session: retina::client::SessionOptions,
    pub setup: retina::client::SetupOptions,
}

/// Opens a RTSP stream. This is a trait for test injection.
pub trait Opener: Send + Sync {
    /// Opens the given RTSP URL.
    ///
    /// Note: despite the blocking interface, this expects to be called from
    /// the context of a multithreaded tokio runtime with IO and time enabled.
    fn open(&self, label: String, url: Url, options: Options) -> Result<Box<dyn Stream>, Error>;
}

pub trait Stream: Send {
    fn video_sample_entry(&self) -> &VideoSampleEntry;

    /// Blocks until the next packet, an error, or end of stream.
    fn next(&mut self) -> Result<MediaPacket, Error>;
}

pub struct RealOpener;

pub const OPENER: RealOpener = RealOpener;

impl Opener for RealOpener {
    fn open(
        &self,
        label: String,
        url: Url,
        mut options: Options,
    ) -> Result<Box<dyn Stream>, Error> {
        options.session = options
            .session
            .user_agent(format!("lightnvr {}", env!("CARGO_PKG_VERSION")));
        let rt_handle = tokio::runtime::Handle::current();
        let (inner, first_frame) = rt_handle
            .block_on(
                rt_handle.spawn(
                    tokio::time::timeout(
                        RETINA_TIMEOUT,
                        RetinaStreamInner::play(label, url, options),
                    )
                    .in_current_span(),
                ),
            )
            .expect("RetinaStream::play task panicked, see earlier error")
            .map_err(|e| {
                err!(
                    DeadlineExceeded,
                    msg("unable to play stream and get first frame within {RETINA_TIMEOUT:?}"),
                    source(e),
                )
            })??;
        Ok(Box::new(RetinaStream {
            inner: Some(inner),
            rt_handle,
            first_frame: Some(first_frame),
        }))
    }
}

/// Real stream, implemented with the Retina library.
///
/// Retina is asynchronous and tokio-based where the supervisor expects a
/// synchronous stream interface. This blocks on the tokio operations via a
/// thread hand-off per frame (`handle.block_on(handle.spawn(...))`).
struct RetinaStream {
    /// The actual stream details used from within the tokio reactor.
    ///
    /// Spawned tokio tasks must be `'static`, so ownership is passed to the
    /// task, and then returned when it completes.
    inner: Option<Box<RetinaStreamInner>>,

    rt_handle: tokio::runtime::Handle,

    /// The first frame, if not yet returned from `next`.
    ///
    /// This frame is special because it is fetched as part of getting the
    /// video parameters.
    first_frame: Option<retina::codec::VideoFrame>,
}

struct RetinaStreamInner {
    label: String,
    session: Demuxed,
    video_codec: CodecKind,
    video_sample_entry: VideoSampleEntry,
}

fn codec_kind(encoding_name: &str) -> Option<CodecKind> {
    Some(match encoding_name {
        "h264" => CodecKind::H264,
        "h265" => CodecKind::H265,
        "jpeg" => CodecKind::Jpeg,
        _ => return None,
    })
}

fn params_to_sample_entry(
    params: &retina::codec::VideoParameters,
) -> Result<VideoSampleEntry, Error> {
    let (width, height) = params.pixel_dimensions();
    let width = u16::try_from(width).map_err(|e| err!(Unknown, source(e)))?;
    let height = u16::try_from(height).map_err(|e| err!(Unknown, source(e)))?;
    Ok(VideoSampleEntry {
        data: params
            .mp4_sample_entry()
            .build()
            .map_err(|e| err!(Unknown, source(e)))?,
        rfc6381_codec: params.rfc6381_codec().to_owned(),
        width,
        height,
    })
}

/// Converts a Retina timestamp to 90 kHz units since session start.
fn elapsed_90k(ts: retina::Timestamp) -> i64 {
    let clock_rate = i64::from(ts.clock_rate().get());
    if clock_rate == TIME_UNITS_PER_SEC {
        ts.elapsed()
    } else {
        ts.elapsed() * TIME_UNITS_PER_SEC / clock_rate
    }
}

impl RetinaStreamInner {
    /// Plays to first frame. No timeout; that's the caller's responsibility.
    async fn play(
        label: String,
        url: Url,
        options: Options,
    ) -> Result<(Box<Self>, retina::codec::VideoFrame), Error> {
        let mut session = retina::client::Session::describe(url, options.session)
            .await
            .map_err(|e| err!(Unknown, source(e)))?;
        tracing::debug!("connected to {:?}, tool {:?}", &label, session.tool());
        let video_i = session
            .streams()
            .iter()
            .position(|s| s.media() == "video" && codec_kind(s.encoding_name()).is_some())
            .ok_or_else(|| {
                err!(
                    FailedPrecondition,
                    msg("couldn't find supported video stream")
                )
            })?;
        let video_codec = codec_kind(session.streams()[video_i].encoding_name())
            .expect("position() checked codec support");
        session
            .setup(video_i, options.setup)
            .await
            .map_err(|e| err!(Unknown, source(e)))?;
        let session = session
            .play(retina::client::PlayOptions::default())
            .await
            .map_err(|e| err!(Unknown, source(e)))?;
        let mut session = session.demuxed().map_err(|e| err!(Unknown, source(e)))?;

        // First frame.
        let first_frame = loop {
            match Pin::new(&mut session).next().await {
                None => bail!(Unavailable, msg("stream closed before first frame")),
                Some(Err(e)) => bail!(Unknown, msg("unable to get first frame"), source(e)),
                Some(Ok(CodecItem::VideoFrame(v))) => {
                    if v.is_random_access_point() {
                        break v;
                    }
                }
                Some(Ok(_)) => {}
            }
        };
        let video_params = match session.streams()[video_i].parameters() {
            Some(retina::codec::ParametersRef::Video(v)) => v.clone(),
            Some(_) => unreachable!(),
            None => bail!(Unknown, msg("couldn't find video parameters")),
        };
        let video_sample_entry = params_to_sample_entry(&video_params)?;
        let self_ = Box::new(Self {
            label,
            session,
            video_codec,
            video_sample_entry,
        });
        Ok((self_, first_frame))
    }

    /// Fetches a non-initial frame.
    async fn fetch_next_frame(
        mut self: Box<Self>,
    ) -> Result<
        (
            Box<Self>,
            retina::codec::VideoFrame,
            Option<retina::codec::VideoParameters>,
        ),
        Error,
    > {
        loop {
            match Pin::new(&mut self.session)
                .next()
                .await
                .transpose()
                .map_err(|e| err!(Unknown, source(e)))?
            {
                None => bail!(Unavailable, msg("end of stream")),
                Some(CodecItem::VideoFrame(v)) => {
                    if v.loss() > 0 {
                        tracing::warn!(
                            "{}: lost {} RTP packets @ {}",
                            &self.label,
                            v.loss(),
                            v.start_ctx()
                        );
                    }
                    let p = if v.has_new_parameters() {
                        Some(match self.session.streams()[v.stream_id()].parameters() {
                            Some(retina::codec::ParametersRef::Video(v)) => v.clone(),
                            _ => unreachable!(),
                        })
                    } else {
                        None
                    };
                    return Ok((self, v, p));
                }
                Some(_) => {}
            }
        }
    }
}

impl Stream for RetinaStream {
    fn video_sample_entry(&self) -> &VideoSampleEntry {
        &self.inner.as_ref().unwrap().video_sample_entry
    }

    fn next(&mut self) -> Result<MediaPacket, Error> {
        let frame = match self.first_frame.take() {
            Some(f) => Ok(f),
            None => {
                let inner = self.inner.take().unwrap();
                let rt_handle = self.rt_handle.clone();
                let (mut inner, frame, new_parameters) = rt_handle
                    .block_on(
                        rt_handle.spawn(
                            tokio::time::timeout(RETINA_TIMEOUT, inner.fetch_next_frame())
                                .in_current_span(),
                        ),
                    )
                    .expect("fetch_next_frame task panicked, see earlier error")
                    .map_err(|e| {
                        err!(
                            DeadlineExceeded,
                            msg("unable to get next frame within {RETINA_TIMEOUT:?}"),
                            source(e)
                        )
                    })??;
                if let Some(p) = new_parameters {
                    let video_sample_entry = params_to_sample_entry(&p)?;
                    if video_sample_entry != inner.video_sample_entry {
                        tracing::debug!(
                            "{}: parameter change:\nold: {:?}\nnew: {:?}",
                            &inner.label,
                            &inner.video_sample_entry,
                            &video_sample_entry
                        );
                        inner.video_sample_entry = video_sample_entry;
                    }
                };
                self.inner = Some(inner);
                Ok::<_, Error>(frame)
            }
        }?;
        let inner = self.inner.as_ref().unwrap();
        let pts = elapsed_90k(frame.timestamp());
        Ok(MediaPacket {
            codec: inner.video_codec,
            track: 0,
            raw_pts: Some(pts),
            raw_dts: Some(pts),
            pts: 0,
            dts: 0,
            seq: 0,
            is_key: frame.is_random_access_point(),
            data: frame.into_data().into(),
            capture_time: jiff::Timestamp::now(),
        })
    }
}

#[cfg(test)]
pub mod testutil {
    use super::*;

    /// A synthetic source yielding a fixed packet list, for supervisor and
    /// consumer tests.
    pub struct VecStream {
        video_sample_entry: VideoSampleEntry,
        packets: std::vec::IntoIter<MediaPacket>,
    }

    impl VecStream {
        pub fn new(packets: Vec<MediaPacket>) -> Self {
            VecStream {
                video_sample_entry: sample_entry(),
                packets: packets.into_iter(),
            }
        }
    }

    impl Stream for VecStream {
        fn video_sample_entry(&self) -> &VideoSampleEntry {
            &self.video_sample_entry
        }

        fn next(&mut self) -> Result<MediaPacket, Error> {
            self.packets
                .next()
                .ok_or_else(|| err!(Unavailable, msg("end of stream")))
        }
    }

    /// A plausible-enough avc1 sample entry for tests that never decode.
    pub fn sample_entry() -> VideoSampleEntry {
        VideoSampleEntry {
            data: b"\x00\x00\x00\x56avc1test-sample-entry-padding-to-a-plausible-length-xx".to_vec(),
            rfc6381_codec: "avc1.4d401e".to_owned(),
            width: 1280,
            height: 720,
        }
    }

    /// Makes a video packet with the given raw pts (90 kHz).
    pub fn pkt(raw_pts: i64, is_key: bool, len: usize) -> MediaPacket {
        MediaPacket {
            codec: CodecKind::H264,
            track: 0,
            data: bytes::Bytes::from(vec![0u8; len]),
            raw_pts: Some(raw_pts),
            raw_dts: Some(raw_pts),
            pts: 0,
            dts: 0,
            seq: 0,
            is_key,
            capture_time: "2026-04-26T00:00:00Z".parse().unwrap(),
        }
    }
}
