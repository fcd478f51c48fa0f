use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use log::debug;

use crate::call::CallType;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Device behind one or more track handles, released when the last handle stops.
#[derive(Debug)]
struct TrackSource {
    id: String,
    kind: TrackKind,
    handles: AtomicUsize,
    live_sources: Arc<AtomicUsize>,
}

impl TrackSource {
    fn release(&self) {
        if self.handles.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.live_sources.fetch_sub(1, Ordering::AcqRel);
            debug!("released {:?} device {}", self.kind, self.id);
        }
    }
}

/// Handle on a captured audio or video track.
///
/// Every peer link holds its own handle; the device is freed once all handles
/// are stopped or dropped.
#[derive(Debug)]
pub struct MediaTrack {
    source: Arc<TrackSource>,
    stopped: bool,
}

impl MediaTrack {
    fn new(source: Arc<TrackSource>) -> Self {
        Self {
            source,
            stopped: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.source.id
    }

    #[must_use]
    pub fn kind(&self) -> TrackKind {
        self.source.kind
    }

    #[must_use]
    pub const fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// New handle on the same device. Cloning a stopped handle yields a stopped handle.
    #[must_use]
    pub fn clone_handle(&self) -> Self {
        let mut handle = Self::new(Arc::clone(&self.source));
        if self.stopped {
            handle.stopped = true;
        } else {
            self.source.handles.fetch_add(1, Ordering::AcqRel);
        }
        handle
    }

    /// Stops this handle, repeated calls are no-ops.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.source.release();
    }
}

impl Drop for MediaTrack {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Local capture for one call.
#[derive(Debug, Default)]
pub struct LocalStream {
    tracks: Vec<MediaTrack>,
}

impl LocalStream {
    #[must_use]
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self { tracks }
    }

    #[must_use]
    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn has_video(&self) -> bool {
        self.tracks
            .iter()
            .any(|track| track.kind() == TrackKind::Video)
    }

    pub fn stop(&mut self) {
        for track in &mut self.tracks {
            track.stop();
        }
    }
}

/// Access to capture devices.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Microphone for audio calls, microphone and camera for video and group calls.
    async fn acquire(&self, call_type: CallType) -> anyhow::Result<LocalStream>;
}

/// Devices that hand out synthetic tracks and count how many are still held.
#[derive(Debug, Default)]
pub struct SyntheticDevices {
    live: Arc<AtomicUsize>,
    next_id: AtomicU64,
    latency: Duration,
    unavailable: AtomicBool,
}

impl SyntheticDevices {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Devices that take `latency` to open, like a permission prompt would.
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Devices currently held by at least one track handle.
    #[must_use]
    pub fn live_tracks(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn open(&self, kind: TrackKind) -> MediaTrack {
        let id = format!("{kind:?}-{}", self.next_id.fetch_add(1, Ordering::Relaxed)).to_lowercase();
        self.live.fetch_add(1, Ordering::AcqRel);
        MediaTrack::new(Arc::new(TrackSource {
            id,
            kind,
            handles: AtomicUsize::new(1),
            live_sources: Arc::clone(&self.live),
        }))
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn acquire(&self, call_type: CallType) -> anyhow::Result<LocalStream> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(anyhow!("capture devices are unavailable"));
        }
        let mut tracks = vec![self.open(TrackKind::Audio)];
        if call_type != CallType::Audio {
            tracks.push(self.open(TrackKind::Video));
        }
        Ok(LocalStream::new(tracks))
    }
}
