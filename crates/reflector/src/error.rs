//! Top-level error type for the reflector service.

use reflector_proto::ProtoError;

/// Errors surfaced by the reflector itself.
///
/// Per-client failures (malformed frames, auth failures, policy
/// violations) never appear here; they are confined to the offending
/// client's session. This type covers what can stop the service:
/// initialization problems and fatal runtime faults.
#[derive(Debug, thiserror::Error)]
pub enum ReflectorError {
    /// The configuration is unusable (e.g. no auth key set).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Reading or parsing a configuration file failed.
    #[error("configuration file: {0}")]
    ConfigFile(String),

    /// A socket could not be bound or another I/O fault occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A wire-protocol error escaped the per-client containment.
    #[error(transparent)]
    Proto(#[from] ProtoError),
}
