//! Output events emitted by agent processes and the heuristics that decide how
//! a terminal renders them.

pub mod classify;
pub mod event;
pub mod normalize;
pub mod pyliteral;

pub use classify::{classify, AgentResponse, Classification, PlainOutput};
pub use event::{OutputEvent, OutputKind, CONNECTION_ESTABLISHED};
pub use pyliteral::DebugBlock;
