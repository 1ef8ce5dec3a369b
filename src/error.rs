//! Error types for iSCSI target operations

use thiserror::Error;

/// iSCSI target errors
///
/// Variants correspond to the error kinds in the target's error handling
/// design: each carries a distinct propagation policy (fatal to the
/// connection, surfaced as a login rejection, returned as SCSI sense, or
/// terminal to the process).
#[derive(Debug, Error)]
pub enum IscsiError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed PDU, digest mismatch, reserved-bit violation, illegal phase
    /// transition. Fatal to the connection.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("SCSI error: {0}")]
    Scsi(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Invalid PDU: {0}")]
    InvalidPdu(String),

    /// Init-time only; aborts startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Surfaced as Login Response status class 2 and connection close.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Same transport surface as `Auth`, reason "authorization failure".
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Too many sessions/connections. Login Response 0x03/0x04 or dropped accept.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Returned as a SCSI Response with sense data; non-fatal at transport level.
    #[error("SCSI check condition: {0}")]
    ScsiCheckCondition(String),

    /// Maps to CHECK CONDITION / MEDIUM ERROR (reads) or HARDWARE ERROR
    /// (writes); the connection remains healthy.
    #[error("Backing store error: {0}")]
    BackingStoreError(String),

    /// An invariant the codec/session/LU layer assumes was violated.
    /// Terminates the process.
    #[error("Internal assertion failure: {0}")]
    InternalAssertionFailure(String),

    /// Header or data digest verification failed for a received PDU. Carries
    /// the `pdu::reject_reason` code and the BHS bytes of the rejected PDU,
    /// both needed to build the Reject PDU RFC 3720 requires before the
    /// connection is closed (ERL 0: fatal to the connection).
    #[error("Digest mismatch: reject reason 0x{reason:02x}")]
    DigestMismatch { reason: u8, header_bytes: Vec<u8> },
}

/// Result type for SCSI operations
pub type ScsiResult<T> = Result<T, IscsiError>;

/// Human-readable explanation of a Login Response status class/detail pair,
/// for logs and CLI diagnostics. Codes follow `pdu::login_status`.
pub fn decode_login_status(status_class: u8, status_detail: u8) -> String {
    match (status_class, status_detail) {
        (0x00, _) => "Success: login completed successfully".to_string(),
        (0x01, 0x01) => {
            "Target moved temporarily: retry the login against the portal given in the \
             TargetAddress text key"
                .to_string()
        }
        (0x01, 0x02) => {
            "Target moved permanently: update the initiator's configuration to use the new \
             TargetAddress"
                .to_string()
        }
        (0x01, _) => "Redirection: target address has changed".to_string(),
        (0x02, 0x01) => {
            "Authentication failed: check the configured CHAP username/password".to_string()
        }
        (0x02, 0x02) => {
            "Authorization failure: initiator is not present in the target's ACL (e.g. \
             tgtadm --op bind --mode target --initiator-address)"
                .to_string()
        }
        (0x02, 0x03) => {
            "Target not found: the requested TargetName doesn't exist on this portal, run \
             SendTargets discovery to list what is available"
                .to_string()
        }
        (0x02, 0x04) => "Target removed: the requested TargetName has been removed".to_string(),
        (0x02, 0x05) => {
            "Unsupported version: initiator and target could not agree on an iSCSI version"
                .to_string()
        }
        (0x02, 0x06) => {
            "Too many connections: the session has reached its MaxConnections limit".to_string()
        }
        (0x02, 0x07) => {
            "Missing parameter: a required login key (InitiatorName, TargetName) was not sent"
                .to_string()
        }
        (0x02, 0x08) => {
            "Cannot include in session: this connection cannot be added to the session".to_string()
        }
        (0x02, 0x09) => {
            "Session type not supported: target does not support the requested SessionType, \
             use a Discovery session with SendTargets or check TargetName"
                .to_string()
        }
        (0x02, 0x0A) => "Session does not exist: the referenced TSIH does not exist".to_string(),
        (0x02, 0x0B) => "Invalid request during login: unexpected PDU for the login state".to_string(),
        (0x02, _) => "Authentication failure: initiator error during login".to_string(),
        (0x03, 0x00) => "Target error: an unspecified target-side failure occurred".to_string(),
        (0x03, 0x01) => "Service unavailable: target is temporarily overloaded, Wait and retry".to_string(),
        (0x03, 0x02) => "Out of resources: target could not allocate resources for the login".to_string(),
        (0x03, _) => "Target error: login failed on the target side".to_string(),
        (class, detail) => format!(
            "Unknown or unrecognized login status 0x{class:02x}{detail:02x} (not defined by RFC 3720)"
        ),
    }
}
