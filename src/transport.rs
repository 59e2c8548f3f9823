//! Voice transport collaborator — the group voice channel the bridge joins.
//!
//! The bridge never speaks a voice platform's protocol itself.  A platform
//! integration implements [`VoiceTransport`] / [`VoiceConnection`] and
//! delivers connection state and speaking changes as [`TransportEvent`]s over
//! a channel; the session consumes them on its event loop.
//!
//! ```text
//! VoiceTransport::join ──▶ JoinedConnection
//!                            ├─ connection: Arc<dyn VoiceConnection>
//!                            │     ├─ subscribe_to_speaker(id) → PacketStream
//!                            │     ├─ attach_output_player(frames) → finished
//!                            │     └─ destroy()
//!                            └─ events: Receiver<TransportEvent>
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

// ---------------------------------------------------------------------------
// SpeakerId
// ---------------------------------------------------------------------------

/// Platform identity of a channel participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpeakerId(String);

impl SpeakerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpeakerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SpeakerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SpeakerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// ---------------------------------------------------------------------------
// TransportTarget / TransportEvent
// ---------------------------------------------------------------------------

/// Which voice channel to join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportTarget {
    /// Server / guild / workspace the channel belongs to.
    pub server_id: String,
    pub channel_id: String,
}

impl TransportTarget {
    pub fn new(server_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            channel_id: channel_id.into(),
        }
    }
}

impl fmt::Display for TransportTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.server_id, self.channel_id)
    }
}

/// Connection state and speaking changes reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection is established and audio may flow.
    Ready,
    Disconnected,
    Destroyed,
    Error(String),
    SpeakingStart(SpeakerId),
    SpeakingEnd(SpeakerId),
}

// ---------------------------------------------------------------------------
// TransportError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("failed to join voice channel {target}: {reason}")]
    Join { target: String, reason: String },

    #[error("cannot subscribe to speaker {speaker}: {reason}")]
    Subscribe { speaker: SpeakerId, reason: String },

    #[error("output player rejected: {0}")]
    Player(String),

    #[error("voice stream error: {0}")]
    Stream(String),
}

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// Compressed packets from one speaker, in arrival order.  The stream ends
/// when the transport closes the subscription.
pub type PacketStream = mpsc::Receiver<Result<Vec<u8>, TransportError>>;

/// Encoded outbound frames for the connection's player.
///
/// Players pull with [`PlayerSource::next_frame`] until it yields `None`,
/// which happens when the producer finishes or playback is stopped.  A stop
/// takes effect immediately; frames still queued are discarded.
pub struct PlayerSource {
    frames: mpsc::Receiver<Vec<u8>>,
    stopped: watch::Receiver<bool>,
}

impl PlayerSource {
    pub fn new(frames: mpsc::Receiver<Vec<u8>>, stopped: watch::Receiver<bool>) -> Self {
        Self { frames, stopped }
    }

    pub async fn next_frame(&mut self) -> Option<Vec<u8>> {
        if *self.stopped.borrow() {
            return None;
        }
        tokio::select! {
            biased;
            _ = stop_signalled(&mut self.stopped) => None,
            frame = self.frames.recv() => frame,
        }
    }
}

/// A dropped stop handle counts as a stop.
async fn stop_signalled(stopped: &mut watch::Receiver<bool>) {
    let _ = stopped.wait_for(|stop| *stop).await;
}

/// Result of a successful [`VoiceTransport::join`].
pub struct JoinedConnection {
    pub connection: Arc<dyn VoiceConnection>,
    pub events: mpsc::Receiver<TransportEvent>,
}

#[async_trait]
pub trait VoiceTransport: Send + Sync {
    async fn join(&self, target: &TransportTarget) -> Result<JoinedConnection, TransportError>;
}

/// A live voice-channel connection.
pub trait VoiceConnection: Send + Sync {
    /// Open the capture stream for one speaker.
    fn subscribe_to_speaker(&self, speaker: &SpeakerId) -> Result<PacketStream, TransportError>;

    /// Play frames from `source` until it is exhausted or dropped.
    ///
    /// The returned receiver resolves once the player has gone idle.
    fn attach_output_player(
        &self,
        source: PlayerSource,
    ) -> Result<oneshot::Receiver<()>, TransportError>;

    /// Human-readable name for transcripts.
    fn display_name(&self, speaker: &SpeakerId) -> Option<String> {
        let _ = speaker;
        None
    }

    /// Leave the channel and release the connection.
    fn destroy(&self);
}
