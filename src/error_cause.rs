use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// errorCauseCode is a cause code that appears in either a ERROR or ABORT chunk
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct ErrorCauseCode(pub u16);

pub const INVALID_STREAM_IDENTIFIER: ErrorCauseCode = ErrorCauseCode(1);
pub const MISSING_MANDATORY_PARAMETER: ErrorCauseCode = ErrorCauseCode(2);
pub const STALE_COOKIE_ERROR: ErrorCauseCode = ErrorCauseCode(3);
pub const OUT_OF_RESOURCE: ErrorCauseCode = ErrorCauseCode(4);
pub const UNRESOLVABLE_ADDRESS: ErrorCauseCode = ErrorCauseCode(5);
pub const UNRECOGNIZED_CHUNK_TYPE: ErrorCauseCode = ErrorCauseCode(6);
pub const INVALID_MANDATORY_PARAMETER: ErrorCauseCode = ErrorCauseCode(7);
pub const UNRECOGNIZED_PARAMETERS: ErrorCauseCode = ErrorCauseCode(8);
pub const NO_USER_DATA: ErrorCauseCode = ErrorCauseCode(9);
pub const COOKIE_RECEIVED_WHILE_SHUTTING_DOWN: ErrorCauseCode = ErrorCauseCode(10);
pub const RESTART_OF_AN_ASSOCIATION_WITH_NEW_ADDRESSES: ErrorCauseCode = ErrorCauseCode(11);
pub const USER_INITIATED_ABORT: ErrorCauseCode = ErrorCauseCode(12);
pub const PROTOCOL_VIOLATION: ErrorCauseCode = ErrorCauseCode(13);

/// State Cookie parameter type, reported in a Missing Mandatory Parameter cause
pub(crate) const PARAM_STATE_COOKIE: u16 = 7;

impl fmt::Display for ErrorCauseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let others = format!("Unknown CauseCode: {}", self.0);
        let s = match *self {
            INVALID_STREAM_IDENTIFIER => "Invalid Stream Identifier",
            MISSING_MANDATORY_PARAMETER => "Missing Mandatory Parameter",
            STALE_COOKIE_ERROR => "Stale Cookie Error",
            OUT_OF_RESOURCE => "Out Of Resource",
            UNRESOLVABLE_ADDRESS => "Unresolvable IP",
            UNRECOGNIZED_CHUNK_TYPE => "Unrecognized Chunk Type",
            INVALID_MANDATORY_PARAMETER => "Invalid Mandatory Parameter",
            UNRECOGNIZED_PARAMETERS => "Unrecognized Parameters",
            NO_USER_DATA => "No User Data",
            COOKIE_RECEIVED_WHILE_SHUTTING_DOWN => "Cookie Received While Shutting Down",
            RESTART_OF_AN_ASSOCIATION_WITH_NEW_ADDRESSES => {
                "Restart Of An Association With New Addresses"
            }
            USER_INITIATED_ABORT => "User Initiated Abort",
            PROTOCOL_VIOLATION => "Protocol Violation",
            _ => others.as_str(),
        };
        write!(f, "{s}")
    }
}

/// ErrorCause carried by ERROR and ABORT chunks: a cause code and its cause-specific
/// information, kept opaque except for the few causes the engine produces or reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorCause {
    pub code: ErrorCauseCode,
    pub raw: Bytes,
}

pub(crate) const ERROR_CAUSE_HEADER_LENGTH: usize = 4;

/// makes ErrorCauseHeader printable
impl fmt::Display for ErrorCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)
    }
}

impl ErrorCause {
    pub fn new(code: ErrorCauseCode) -> Self {
        ErrorCause {
            code,
            raw: Bytes::new(),
        }
    }

    ///
    ///  0                   1                   2                   3
    ///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |     Cause Code=3              |       Cause Length=8          |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |                 Measure of Staleness (usec.)                  |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    ///
    pub(crate) fn stale_cookie(staleness_usec: u32) -> Self {
        let mut raw = BytesMut::with_capacity(4);
        raw.put_u32(staleness_usec);
        ErrorCause {
            code: STALE_COOKIE_ERROR,
            raw: raw.freeze(),
        }
    }

    ///
    ///  0                   1                   2                   3
    ///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |     Cause Code=2              |      Cause Length=8+N*2       |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |                   Number of missing params=N                  |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |   Missing Param Type #1       |   Missing Param Type #2       |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    ///
    pub(crate) fn missing_mandatory_parameter(param_type: u16) -> Self {
        let mut raw = BytesMut::with_capacity(6);
        raw.put_u32(1);
        raw.put_u16(param_type);
        ErrorCause {
            code: MISSING_MANDATORY_PARAMETER,
            raw: raw.freeze(),
        }
    }

    pub(crate) fn invalid_stream_identifier(stream_identifier: u16) -> Self {
        let mut raw = BytesMut::with_capacity(4);
        raw.put_u16(stream_identifier);
        raw.put_u16(0);
        ErrorCause {
            code: INVALID_STREAM_IDENTIFIER,
            raw: raw.freeze(),
        }
    }

    /// The cause carries the header of the unrecognized chunk; the chunk value is not
    /// retained by the decoded representation.
    pub(crate) fn unrecognized_chunk_type(typ: u8, flags: u8) -> Self {
        let mut raw = BytesMut::with_capacity(4);
        raw.put_u8(typ);
        raw.put_u8(flags);
        raw.put_u16(4);
        ErrorCause {
            code: UNRECOGNIZED_CHUNK_TYPE,
            raw: raw.freeze(),
        }
    }

    /// Measure of staleness in microseconds, for a Stale Cookie Error cause
    pub fn staleness(&self) -> Option<u32> {
        if self.code != STALE_COOKIE_ERROR || self.raw.len() < 4 {
            return None;
        }
        Some(self.raw.clone().get_u32())
    }

    pub(crate) fn length(&self) -> usize {
        self.raw.len() + ERROR_CAUSE_HEADER_LENGTH
    }
}
