//! Turn execution: state machine, tool coordination, widgets, events.

pub mod coordinator;
pub mod engine;
pub mod events;
pub mod widgets;
