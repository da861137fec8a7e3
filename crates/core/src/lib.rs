//! Device connect core: the scrcpy Source lifecycle, fan-out Pipeline,
//! WebRTC Sessions, Control Handler, and ADB-Expose Multiplexer described
//! by this daemon's design. The transport layer (HTTP/WS) that consumes
//! this crate is treated as external and lives in the daemon binary crate.

pub mod adb;
pub mod control;
pub mod error;
pub mod mux;
pub mod pipeline;
pub mod registry;
pub mod session;
pub mod source;

pub use error::{AdbError, CoreError};
pub use mux::Multiplexer;
pub use pipeline::Pipeline;
pub use registry::Registry;
pub use session::{Session, SessionManager};
pub use source::{Source, SourceState};
