//! Error taxonomy (§7). Each variant is a *kind*, not a transport detail —
//! callers match on the variant to decide retry/teardown/surface, per §7's
//! propagation policy.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdbError {
    #[error("adb command failed: {0}")]
    ExecutionFailed(String),
    #[error("adb command timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("device {0} not found")]
    DeviceNotFound(String),
    #[error("device {0} is offline or unauthorized")]
    DeviceOffline(String),
}

#[derive(Debug, Error)]
pub enum CoreError {
    /// ADB cannot find or talk to the serial. Fatal for the Source;
    /// surfaced to the caller of `Source::start`.
    #[error("device {serial} unreachable: {source}")]
    DeviceUnreachable {
        serial: String,
        #[source]
        source: AdbError,
    },

    /// Malformed frame on a device socket. Fatal for the Source; the
    /// Registry removes it; Sessions observe subscription-closed.
    #[error("protocol decode error on device {serial}: {source}")]
    ProtocolDecodeError {
        serial: String,
        #[source]
        source: scrcpy_protocol::CodecError,
    },

    /// A subscriber's bounded channel overflowed. Not surfaced to the
    /// device side; tracked via a local drop counter only.
    #[error("subscriber {subscriber_id} lagged on device {serial}")]
    SubscriberLag { serial: String, subscriber_id: u64 },

    /// Malformed SDP/ICE or a negotiation-state-machine violation.
    /// Fatal for one Session; other Sessions are unaffected.
    #[error("signalling error for session {session_id}: {message}")]
    SignallingError {
        session_id: uuid::Uuid,
        message: String,
    },

    /// Peer connection transitioned to a terminal failure state.
    #[error("peer connection closed for session {session_id}")]
    PeerConnectionClosed { session_id: uuid::Uuid },

    /// ADB-expose: WebSocket dropped or remote sent ERROR for this stream.
    /// Fatal for the one stream; siblings and the listener are unaffected.
    #[error("stream {stream_id} aborted: {message}")]
    StreamAborted { stream_id: u32, message: String },

    /// Invalid mode, unknown codec, port conflict. Surfaced to the caller;
    /// no side effects occur.
    #[error("config error: {0}")]
    ConfigError(String),
}
