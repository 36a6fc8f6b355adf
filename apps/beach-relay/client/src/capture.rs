use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use beach_relay_core::MediaKind;
use serde::{Deserialize, Serialize};

use crate::error::MediaAccessError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureSource {
    Camera,
    Screen,
}

impl CaptureSource {
    pub fn from_use_screen(use_screen: bool) -> Self {
        if use_screen {
            CaptureSource::Screen
        } else {
            CaptureSource::Camera
        }
    }
}

impl fmt::Display for CaptureSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureSource::Camera => f.write_str("camera"),
            CaptureSource::Screen => f.write_str("screen"),
        }
    }
}

/// Handle to a live media track. Clones share the ended flag, so stopping any
/// clone stops the track everywhere.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    id: String,
    kind: MediaKind,
    label: String,
    ended: Arc<AtomicBool>,
}

impl MediaTrack {
    pub fn new(kind: MediaKind, label: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            label: label.into(),
            ended: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn stop(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MediaStream {
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_track(&mut self, track: MediaTrack) {
        self.tracks.push(track);
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn video_track(&self) -> Option<&MediaTrack> {
        self.tracks.iter().find(|track| track.kind == MediaKind::Video)
    }

    pub fn is_active(&self) -> bool {
        self.tracks.iter().any(|track| !track.is_ended())
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Acquires local media. Implementations prompt for permission where the
/// platform requires it.
#[async_trait]
pub trait MediaCapture: Send + Sync {
    async fn capture(&self, source: CaptureSource) -> Result<MediaTrack, MediaAccessError>;
}
