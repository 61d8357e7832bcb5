//! Local capture and its attachment to the peer connection.
//!
//! Tracks already present on a sender are swapped in place; only a new track
//! kind adds a sender, which is the only case that needs renegotiation.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use webrtc::media::Sample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::peer::{PeerConnection, PeerError};

pub mod synthetic;

pub use synthetic::SyntheticDevices;

pub type RtpTrack = Arc<dyn TrackLocal + Send + Sync>;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("capture permission denied: {0}")]
    PermissionDenied(String),
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("capture failed: {0}")]
    Capture(String),
    #[error(transparent)]
    Peer(#[from] PeerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackSource {
    Microphone,
    Camera,
    Display,
}

/// Form factor of the local device; handhelds get lower capture resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceClass {
    #[default]
    Desktop,
    Handheld,
}

impl DeviceClass {
    pub fn video_constraints(self) -> VideoConstraints {
        match self {
            DeviceClass::Desktop => VideoConstraints {
                width: 1280,
                height: 720,
                frame_rate: 30,
            },
            DeviceClass::Handheld => VideoConstraints {
                width: 640,
                height: 360,
                frame_rate: 24,
            },
        }
    }
}

impl FromStr for DeviceClass {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "desktop" => Ok(DeviceClass::Desktop),
            "handheld" | "mobile" => Ok(DeviceClass::Handheld),
            other => Err(format!("unknown device class: {other}")),
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::Desktop => f.write_str("desktop"),
            DeviceClass::Handheld => f.write_str("handheld"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub audio: bool,
    pub video: Option<VideoConstraints>,
}

impl CaptureConstraints {
    pub fn for_device(class: DeviceClass) -> Self {
        Self {
            audio: true,
            video: Some(class.video_constraints()),
        }
    }
}

/// One local capture track.
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    source: TrackSource,
    enabled: AtomicBool,
    stopped: AtomicBool,
    stop_calls: AtomicUsize,
    ended: watch::Sender<bool>,
    rtp: Option<RtpTrack>,
    sampler: Option<Arc<TrackLocalStaticSample>>,
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("source", &self.source)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

impl MediaTrack {
    pub fn new(
        id: impl Into<String>,
        kind: TrackKind,
        source: TrackSource,
        rtp: Option<RtpTrack>,
    ) -> Self {
        let (ended, _) = watch::channel(false);
        Self {
            id: id.into(),
            kind,
            source,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            stop_calls: AtomicUsize::new(0),
            ended,
            rtp,
            sampler: None,
        }
    }

    /// A track fed through `write_sample`.
    pub fn sampled(
        id: impl Into<String>,
        kind: TrackKind,
        source: TrackSource,
        sampler: Arc<TrackLocalStaticSample>,
    ) -> Self {
        let rtp: RtpTrack = sampler.clone();
        Self {
            sampler: Some(sampler),
            ..Self::new(id, kind, source, Some(rtp))
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn source(&self) -> TrackSource {
        self.source
    }

    pub fn rtp(&self) -> Option<RtpTrack> {
        self.rtp.clone()
    }

    /// Whether samples should go out. A disabled track stays negotiated but
    /// anything feeding it must drop frames; `write_sample` does.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Hands one encoded frame to the sender. Returns false when the frame was
    /// dropped because the track is muted, stopped or not sample-fed.
    pub async fn write_sample(&self, sample: &Sample) -> Result<bool, MediaError> {
        let Some(sampler) = &self.sampler else {
            return Ok(false);
        };
        if !self.is_enabled() || self.stopped.load(Ordering::SeqCst) {
            return Ok(false);
        }
        sampler
            .write_sample(sample)
            .await
            .map_err(|err| MediaError::Capture(err.to_string()))?;
        Ok(true)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_ended(&self) -> bool {
        *self.ended.borrow()
    }

    /// How many times `stop` has been invoked, redundant calls included.
    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    /// Stops capture. Returns false if the track was already stopped.
    pub fn stop(&self) -> bool {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.ended.send_replace(true);
        true
    }

    /// The source went away on its own, e.g. the user stopped a screen share
    /// from the system picker.
    pub fn mark_ended(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.ended.send_replace(true);
    }

    pub async fn ended(&self) {
        let mut rx = self.ended.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }
}

/// The audio and camera tracks returned by one capture request.
#[derive(Debug, Clone, Default)]
pub struct LocalStream {
    tracks: Vec<Arc<MediaTrack>>,
}

impl LocalStream {
    pub fn new(tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    pub fn track(&self, kind: TrackKind) -> Option<&Arc<MediaTrack>> {
        self.tracks.iter().find(|track| track.kind() == kind)
    }
}

/// Platform capture. Real devices, or synthetic ones for headless runs.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn capture_user_media(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<LocalStream, MediaError>;
    async fn capture_display(&self) -> Result<Arc<MediaTrack>, MediaError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    AlreadyAttached,
    /// Swapped onto an existing sender; no renegotiation.
    Replaced,
    /// New sender; the connection must renegotiate.
    Added,
}

/// Owns the local stream and any screen capture for one call.
pub struct MediaPipeline {
    devices: Arc<dyn MediaDevices>,
    device_class: DeviceClass,
    local: Option<LocalStream>,
    screen: Option<Arc<MediaTrack>>,
    audio_enabled: bool,
    video_enabled: bool,
    attempted: bool,
    last_error: Option<String>,
}

impl MediaPipeline {
    pub fn new(devices: Arc<dyn MediaDevices>, device_class: DeviceClass) -> Self {
        Self {
            devices,
            device_class,
            local: None,
            screen: None,
            audio_enabled: true,
            video_enabled: true,
            attempted: false,
            last_error: None,
        }
    }

    /// Capture has been attempted, whether or not it produced tracks.
    pub fn is_ready(&self) -> bool {
        self.attempted
    }

    pub fn is_receive_only(&self) -> bool {
        self.attempted && self.local.is_none()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn local_stream(&self) -> Option<&LocalStream> {
        self.local.as_ref()
    }

    pub fn is_sharing_screen(&self) -> bool {
        self.screen.is_some()
    }

    pub fn local_track_count(&self) -> usize {
        let local = self
            .local
            .as_ref()
            .map(|stream| stream.tracks().iter().filter(|t| !t.is_ended()).count())
            .unwrap_or(0);
        let screen = self.screen.iter().filter(|t| !t.is_ended()).count();
        local + screen
    }

    /// Captures audio and camera. A failure is recorded and leaves the call in
    /// receive-only mode; it is not fatal.
    pub async fn acquire(&mut self) -> Result<(), MediaError> {
        if self.local.is_some() {
            return Ok(());
        }
        let constraints = CaptureConstraints::for_device(self.device_class);
        let result = self.devices.capture_user_media(&constraints).await;
        self.attempted = true;
        match result {
            Ok(stream) => {
                for track in stream.tracks() {
                    match track.kind() {
                        TrackKind::Audio => track.set_enabled(self.audio_enabled),
                        TrackKind::Video => track.set_enabled(self.video_enabled),
                    }
                }
                tracing::debug!(
                    target = "media",
                    tracks = stream.tracks().len(),
                    device_class = %self.device_class,
                    "local media acquired"
                );
                self.local = Some(stream);
                self.last_error = None;
                Ok(())
            }
            Err(err) => {
                tracing::warn!(
                    target = "media",
                    error = %err,
                    "local media unavailable; continuing receive-only"
                );
                self.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    /// Puts local media on `peer`, or receive-only transceivers when there is
    /// none. Returns true when a sender was added.
    pub async fn attach(&self, peer: &dyn PeerConnection) -> Result<bool, PeerError> {
        let Some(stream) = &self.local else {
            if self.attempted {
                peer.add_receive_only(TrackKind::Audio).await?;
                peer.add_receive_only(TrackKind::Video).await?;
            }
            return Ok(false);
        };
        let mut added = false;
        for track in stream.tracks() {
            let outgoing = match (track.kind(), &self.screen) {
                (TrackKind::Video, Some(screen)) => screen,
                _ => track,
            };
            if Self::ensure_attached(peer, outgoing).await? == AttachOutcome::Added {
                added = true;
            }
        }
        Ok(added)
    }

    pub async fn ensure_attached(
        peer: &dyn PeerConnection,
        track: &Arc<MediaTrack>,
    ) -> Result<AttachOutcome, PeerError> {
        let existing = peer
            .senders()
            .into_iter()
            .find(|sender| sender.kind == track.kind());
        match existing {
            Some(sender) if sender.track_id.as_deref() == Some(track.id()) => {
                Ok(AttachOutcome::AlreadyAttached)
            }
            Some(sender) => {
                peer.replace_track(&sender.id, Arc::clone(track)).await?;
                tracing::debug!(
                    target = "media",
                    kind = track.kind().as_str(),
                    track_id = track.id(),
                    "replaced outgoing track"
                );
                Ok(AttachOutcome::Replaced)
            }
            None => {
                peer.add_track(Arc::clone(track)).await?;
                tracing::debug!(
                    target = "media",
                    kind = track.kind().as_str(),
                    track_id = track.id(),
                    "added outgoing track"
                );
                Ok(AttachOutcome::Added)
            }
        }
    }

    /// Captures the display and sends it in place of the camera.
    pub async fn start_screen_share(
        &mut self,
        peer: &dyn PeerConnection,
    ) -> Result<(Arc<MediaTrack>, AttachOutcome), MediaError> {
        if let Some(screen) = &self.screen {
            return Ok((Arc::clone(screen), AttachOutcome::AlreadyAttached));
        }
        let screen = self.devices.capture_display().await?;
        let outcome = Self::ensure_attached(peer, &screen).await?;
        self.screen = Some(Arc::clone(&screen));
        tracing::info!(target = "media", track_id = screen.id(), "screen share started");
        Ok((screen, outcome))
    }

    /// Ends a screen share and puts the camera back. `track_id` guards against
    /// an end notice from an earlier share.
    pub async fn stop_screen_share(
        &mut self,
        peer: Option<&dyn PeerConnection>,
        track_id: Option<&str>,
    ) -> Result<bool, PeerError> {
        let matches = match (&self.screen, track_id) {
            (Some(screen), Some(id)) => screen.id() == id,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            return Ok(false);
        }
        let Some(screen) = self.screen.take() else {
            return Ok(false);
        };
        screen.stop();
        if let (Some(peer), Some(camera)) = (
            peer,
            self.local
                .as_ref()
                .and_then(|stream| stream.track(TrackKind::Video)),
        ) {
            Self::ensure_attached(peer, camera).await?;
        }
        tracing::info!(target = "media", "screen share ended; camera restored");
        Ok(true)
    }

    pub fn set_audio_enabled(&mut self, enabled: bool) {
        self.audio_enabled = enabled;
        self.apply_enabled(TrackKind::Audio, enabled);
    }

    pub fn set_video_enabled(&mut self, enabled: bool) {
        self.video_enabled = enabled;
        self.apply_enabled(TrackKind::Video, enabled);
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled
    }

    fn apply_enabled(&self, kind: TrackKind, enabled: bool) {
        if let Some(track) = self.local.as_ref().and_then(|stream| stream.track(kind)) {
            track.set_enabled(enabled);
        }
    }

    /// Stops every local track. Safe to call repeatedly; later calls find
    /// nothing left to stop. The next `acquire` captures afresh.
    pub fn stop_all(&mut self) -> usize {
        self.attempted = false;
        let mut stopped = 0;
        if let Some(screen) = self.screen.take() {
            screen.stop();
            stopped += 1;
        }
        if let Some(stream) = self.local.take() {
            for track in stream.tracks() {
                track.stop();
                stopped += 1;
            }
        }
        stopped
    }
}
