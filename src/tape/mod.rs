//! Tape recording and replay (spec.md §4.1, §6).

pub mod reader;
pub mod recorder;
pub mod schema;

pub use reader::{TapeReader, TapeSource};
pub use recorder::Recorder;
pub use schema::{ControlSubkind, Event, EventKind, Payload, PriceChangeEntry, PriceLevel, Side, TapeMeta};
