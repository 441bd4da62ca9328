//! Audio pump: one task per remote audio track.
//!
//! Reads raw RTP packets off the meeting's audio track and repackages them
//! through the shared Ogg writer into the stream client's UDP sink. The
//! pump never restarts; on audio failure the owning agent is expected to be
//! disposed.

use std::io::Write;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use util::marshal::Unmarshal;

use crate::meeting::{AudioTrack, ConnectionStatus, MeetingError, StatusCell};
use crate::ogg::OggWriter;
use crate::stream::StreamClient;

/// Large enough for every RTP packet the upstream codecs produce.
pub const READ_BUFFER_SIZE: usize = 1024;

pub struct AudioPump;

impl AudioPump {
    /// Spawn the pump loop for one track. The loop ends when the track's
    /// status cell reports `Disconnected` (this also closes the stream
    /// client, the uplink being useless without meeting audio), on any read
    /// or write failure, or when `shutdown` fires.
    pub fn spawn<W>(
        track: Arc<dyn AudioTrack>,
        status: Arc<StatusCell>,
        writer: Arc<Mutex<OggWriter<W>>>,
        stream: Arc<StreamClient>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()>
    where
        W: Write + Send + 'static,
    {
        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            loop {
                if *shutdown.borrow() {
                    break;
                }

                let read = tokio::select! {
                    _ = shutdown.changed() => break,
                    result = track.read(&mut buf) => result,
                };

                if status.get() == ConnectionStatus::Disconnected {
                    stream.close().await;
                    break;
                }

                let n = match read {
                    Ok(n) => n,
                    Err(MeetingError::OversizedFrame) => {
                        tracing::warn!("Discarding oversized RTP frame");
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!("Audio track read failed: {e}");
                        break;
                    }
                };
                if n == 0 {
                    continue;
                }

                let mut raw = &buf[..n];
                let packet = match rtp::packet::Packet::unmarshal(&mut raw) {
                    Ok(packet) => packet,
                    Err(e) => {
                        tracing::warn!("RTP unmarshal failed: {e}");
                        break;
                    }
                };

                let written = writer.lock().unwrap().write_rtp(&packet);
                if let Err(e) = written {
                    tracing::warn!("Ogg write failed: {e}");
                    break;
                }
            }
            tracing::debug!("Audio pump stopped");
        })
    }
}
