//! Supervise a child process that streams one growing JSON document on
//! stdout, and deliver decoded progress and a final result to observers.
//!
//! Built around iperf3's `-J` output, but any producer works.

pub mod command;
pub mod config;
pub mod decode;
pub mod dispatch;
pub mod monitor;
pub mod render;
pub mod report;

pub use command::{CommandLine, IperfArgs, IperfMode};
pub use dispatch::{
    Dispatcher, ProgressSnapshot, SessionId, SessionObserver, SessionOutcome, SessionResult,
};
pub use monitor::{ProcessStreamMonitor, SessionHandle, SessionState};
