//! Mock collectors for testing.
//!
//! `MockFs` with pre-built scenarios exercises the procfs collectors without
//! a Linux `/proc`; `ScriptedSource` and `StaticInspector` feed the meter
//! exact values.

mod filesystem;
mod scenarios;
mod scripted;

pub use filesystem::MockFs;
pub use scenarios::DAEMON_PID;
pub use scripted::{ScriptedSource, StaticInspector};
