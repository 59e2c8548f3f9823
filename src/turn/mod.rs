//! Conversational turn taking.
//!
//! * [`TurnMachine`] — decides when to think, speak, stop and leave.
//! * [`ConversationMode`] — trigger predicate plus inference failure policy.
//! * [`TranscriptHistory`] — bounded per-session transcript log.

pub mod history;
pub mod machine;
pub mod mode;

pub use history::TranscriptHistory;
pub use machine::{TurnAction, TurnId, TurnMachine, TurnPhase, TurnSettings, TurnState};
pub use mode::{mode_from_config, AlwaysRespond, ConversationMode, FailurePolicy, WakePhrase};
