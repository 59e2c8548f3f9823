//! Real-time voice conversation bridge.
//!
//! A bot joins a voice channel, mixes what participants say into one
//! transcription stream, decides when to answer, and speaks the answer back
//! into the channel through a streaming synthesis pipeline.
//!
//! # Layout
//!
//! ```text
//! transport ─▶ session::speaking ─▶ audio::mixer ─▶ transcription link
//!                                                        │
//!            synthesis::player ◀─ turn::machine ◀─ inference
//! ```
//!
//! [`start_session`] wires one session together from the collaborators in
//! [`SessionDeps`]; everything platform-specific sits behind the traits in
//! [`transport`].

pub mod audio;
pub mod config;
pub mod inference;
pub mod session;
pub mod synthesis;
pub mod transcription;
pub mod transport;
pub mod turn;

#[cfg(test)]
pub(crate) mod testing;

pub use session::{start_session, SessionDeps, SessionError, SessionHandle, SessionOptions};
