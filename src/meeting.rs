//! Abstract surface of the conferencing client library.
//!
//! The concrete client (joining meetings, caption pads, WebRTC audio
//! subscriptions) lives outside this crate; the engine consumes it through
//! the object-safe traits below, which also keeps every agent test runnable
//! against in-process fakes.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// Errors surfaced by the conferencing client.
#[derive(Debug, Error)]
pub enum MeetingError {
    #[error("Join failed: {0}")]
    Join(String),

    #[error("Pad operation failed: {0}")]
    Pad(String),

    #[error("Audio channel failed: {0}")]
    Audio(String),

    #[error("Track read failed: {0}")]
    TrackRead(String),

    #[error("Frame exceeds the read buffer")]
    OversizedFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionStatus {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

/// Lock-free status cell shared between the meeting client and the audio
/// pump. The pump polls it between track reads to notice meeting-side death
/// without holding any lock.
pub struct StatusCell(AtomicU8);

impl StatusCell {
    pub fn new(status: ConnectionStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    pub fn get(&self) -> ConnectionStatus {
        match self.0.load(Ordering::Acquire) {
            1 => ConnectionStatus::Connecting,
            2 => ConnectionStatus::Connected,
            _ => ConnectionStatus::Disconnected,
        }
    }

    pub fn set(&self, status: ConnectionStatus) {
        self.0.store(status as u8, Ordering::Release);
    }
}

/// Callback invoked when a pad's backing connection is lost.
pub type DisconnectHandler = Box<dyn Fn() + Send + Sync>;

/// Callback invoked for every new remote track on an audio channel.
pub type TrackHandler = Box<dyn Fn(Arc<dyn AudioTrack>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Factory for meeting memberships. One `join` call produces one session.
#[async_trait]
pub trait MeetingClient: Send + Sync {
    async fn join(
        &self,
        meeting_id: &str,
        display_name: &str,
        moderator: bool,
    ) -> Result<Arc<dyn MeetingSession>, MeetingError>;
}

/// One meeting membership. The primary session owns the English pad and the
/// audio subscription; secondary sessions own exactly one pad each.
#[async_trait]
pub trait MeetingSession: Send + Sync {
    /// Create the shared caption pad for `language` (short language name).
    async fn create_pad(&self, language: &str) -> Result<Arc<dyn CaptionPad>, MeetingError>;

    /// Snapshot of the pads this session currently owns.
    fn pads(&self) -> Vec<Arc<dyn CaptionPad>>;

    /// Open the meeting's mixed-audio channel.
    async fn open_audio(&self) -> Result<Arc<dyn AudioChannel>, MeetingError>;

    async fn leave(&self);
}

#[async_trait]
pub trait CaptionPad: Send + Sync {
    /// Short language name the pad was created for (e.g. `en`, `de`).
    fn language(&self) -> String;

    async fn set_text(&self, text: &str) -> Result<(), MeetingError>;

    fn on_disconnected(&self, handler: DisconnectHandler);
}

#[async_trait]
pub trait AudioChannel: Send + Sync {
    /// Start receiving remote tracks.
    async fn listen(&self) -> Result<(), MeetingError>;

    fn on_track(&self, handler: TrackHandler);

    /// Connection status cell, read-shared with the audio pump.
    fn status(&self) -> Arc<StatusCell>;

    async fn close(&self);
}

/// A remote track delivering raw RTP packets, one per read.
#[async_trait]
pub trait AudioTrack: Send + Sync {
    fn kind(&self) -> TrackKind;

    /// Read one RTP packet into `buf`, returning its length.
    /// Returns [`MeetingError::OversizedFrame`] for packets larger than
    /// `buf`; the packet is consumed and the caller may continue reading.
    async fn read(&self, buf: &mut [u8]) -> Result<usize, MeetingError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_cell_transitions() {
        let cell = StatusCell::new(ConnectionStatus::Connecting);
        assert_eq!(cell.get(), ConnectionStatus::Connecting);
        cell.set(ConnectionStatus::Connected);
        assert_eq!(cell.get(), ConnectionStatus::Connected);
        cell.set(ConnectionStatus::Disconnected);
        assert_eq!(cell.get(), ConnectionStatus::Disconnected);
    }
}
