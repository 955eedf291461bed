//! Shared domain types for the condense pipeline.
//!
//! These are plain data records exchanged between the compaction orchestrator,
//! the overview generator and the persistence adapters. Behaviour that only
//! concerns the shape of the data (state transitions, progress clamping,
//! compression arithmetic) lives here too so every store sees the same rules.

pub mod conversation;
pub mod outline;
pub mod result;
pub mod session;

pub use conversation::{Chunk, ConversationInput, Role, Turn};
pub use outline::{
    Citation, Diagram, GeneratedSection, Importance, Outline, OutlineSection, Overview,
};
pub use result::{CompactionResult, ResultMetadata, ResultStatus, Strategy, compression_ratio};
pub use session::{
    CompactSession, CompactionStep, LogEntry, LogLevel, SessionKind, SessionStatus, TransitionError,
    is_cancellable, is_valid_transition,
};
