use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::{
    CaptureConstraints, LocalStream, MediaDevices, MediaError, MediaTrack, TrackKind, TrackSource,
};

const STREAM_ID: &str = "beach-call";

/// Capture devices backed by sample-fed webrtc-rs tracks.
///
/// Used by the CLI on machines without a camera. Tracks are negotiable and
/// carry the requested resolution hints in their ids, but no frames are
/// written unless a caller feeds them through `MediaTrack::write_sample`.
#[derive(Debug, Clone, Default)]
pub struct SyntheticDevices {
    deny_user_media: bool,
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Behaves like a browser whose camera prompt was dismissed.
    pub fn denying_user_media() -> Self {
        Self {
            deny_user_media: true,
        }
    }
}

fn sample_track(kind: TrackKind, track_id: &str) -> Arc<TrackLocalStaticSample> {
    let capability = match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
    };
    Arc::new(TrackLocalStaticSample::new(
        capability,
        track_id.to_owned(),
        STREAM_ID.to_owned(),
    ))
}

fn new_track(kind: TrackKind, source: TrackSource, label: &str) -> Arc<MediaTrack> {
    let id = format!("{label}-{}", Uuid::new_v4());
    let sampler = sample_track(kind, &id);
    Arc::new(MediaTrack::sampled(id, kind, source, sampler))
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn capture_user_media(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<LocalStream, MediaError> {
        if self.deny_user_media {
            return Err(MediaError::PermissionDenied(
                "user media request dismissed".into(),
            ));
        }
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(new_track(TrackKind::Audio, TrackSource::Microphone, "mic"));
        }
        if let Some(video) = constraints.video {
            let label = format!("cam{}x{}@{}", video.width, video.height, video.frame_rate);
            tracks.push(new_track(TrackKind::Video, TrackSource::Camera, &label));
        }
        if tracks.is_empty() {
            return Err(MediaError::DeviceUnavailable(
                "no audio or video requested".into(),
            ));
        }
        Ok(LocalStream::new(tracks))
    }

    async fn capture_display(&self) -> Result<Arc<MediaTrack>, MediaError> {
        Ok(new_track(TrackKind::Video, TrackSource::Display, "screen"))
    }
}
