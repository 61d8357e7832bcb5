use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::media::{
    CaptureConstraints, LocalStream, MediaDevices, MediaError, MediaTrack, TrackKind, TrackSource,
};

#[derive(Default)]
struct Inner {
    counter: usize,
    last_constraints: Option<CaptureConstraints>,
    captured: Vec<Arc<MediaTrack>>,
}

/// Capture devices that hand out plain tracks and remember what they made.
#[derive(Clone, Default)]
pub struct FakeDevices {
    deny: bool,
    inner: Arc<Mutex<Inner>>,
}

impl FakeDevices {
    pub fn denied() -> Self {
        Self {
            deny: true,
            ..Self::default()
        }
    }

    pub fn last_constraints(&self) -> Option<CaptureConstraints> {
        self.inner.lock().last_constraints.clone()
    }

    pub fn captured(&self) -> Vec<Arc<MediaTrack>> {
        self.inner.lock().captured.clone()
    }

    fn track(&self, kind: TrackKind, source: TrackSource) -> Arc<MediaTrack> {
        let mut inner = self.inner.lock();
        inner.counter += 1;
        let id = format!("{}-{}", kind.as_str(), inner.counter);
        let track = Arc::new(MediaTrack::new(id, kind, source, None));
        inner.captured.push(Arc::clone(&track));
        track
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn capture_user_media(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<LocalStream, MediaError> {
        self.inner.lock().last_constraints = Some(constraints.clone());
        if self.deny {
            return Err(MediaError::PermissionDenied("camera access denied".into()));
        }
        Ok(LocalStream::new(vec![
            self.track(TrackKind::Audio, TrackSource::Microphone),
            self.track(TrackKind::Video, TrackSource::Camera),
        ]))
    }

    async fn capture_display(&self) -> Result<Arc<MediaTrack>, MediaError> {
        Ok(self.track(TrackKind::Video, TrackSource::Display))
    }
}
