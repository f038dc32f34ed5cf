/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Contract with the media capture layer. The call core never captures or
//! renders anything; it only decides which tracks go on which connection.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use careline_protocol::CallKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Opaque object owned by the media or peer layer (a sample track, a renderer sink).
pub type MediaHandle = Arc<dyn Any + Send + Sync>;

#[derive(Clone)]
pub struct LocalTrack {
    pub id: String,
    pub kind: TrackKind,
    enabled: Arc<AtomicBool>,
    pub handle: Option<MediaHandle>,
}

impl LocalTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
            handle: None,
        }
    }

    pub fn with_handle(mut self, handle: MediaHandle) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Shared with every clone; the capture side stops feeding samples while false.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("handle", &self.handle.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct LocalStream {
    pub id: String,
    pub tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(move |t| t.kind == kind)
    }

    /// Returns how many tracks were touched.
    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) -> usize {
        let mut n = 0;
        for t in self.tracks_of(kind) {
            t.set_enabled(enabled);
            n += 1;
        }
        n
    }
}

#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub handle: Option<MediaHandle>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("handle", &self.handle.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("media unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait MediaProvider: Send + Sync {
    async fn get_local_media(&self, kind: CallKind) -> Result<LocalStream, MediaError>;
    async fn release_media(&self, stream: &LocalStream);
}

/// Hands out handle-less tracks; the peer layer allocates its own sample tracks for them.
#[derive(Debug, Clone, Default)]
pub struct DetachedMedia;

#[async_trait]
impl MediaProvider for DetachedMedia {
    async fn get_local_media(&self, kind: CallKind) -> Result<LocalStream, MediaError> {
        let mut tracks = vec![LocalTrack::new("audio", TrackKind::Audio)];
        if kind == CallKind::Video {
            tracks.push(LocalTrack::new("video", TrackKind::Video));
        }
        Ok(LocalStream {
            id: "careline".to_string(),
            tracks,
        })
    }

    async fn release_media(&self, stream: &LocalStream) {
        for t in &stream.tracks {
            t.set_enabled(false);
        }
    }
}
