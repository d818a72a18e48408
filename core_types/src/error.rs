//! Error codes
//!
//! Every failure in the substrate is one of these codes. The numeric values
//! are part of the wire contract: replies start with the raw code, and zero
//! means success.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used throughout the substrate
pub type Result<T> = core::result::Result<T, Code>;

/// Error codes surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
#[repr(u64)]
pub enum Code {
    #[error("no credits left on send endpoint")]
    MissCredits = 1,

    #[error("no free slot in receive buffer")]
    NoRingSpace = 2,

    #[error("target VPE is gone")]
    VpeGone = 3,

    #[error("no mapping")]
    NoMapping = 4,

    #[error("invalid arguments")]
    InvArgs = 5,

    #[error("out of memory")]
    OutOfMem = 6,

    #[error("permission denied")]
    NoPerm = 8,

    #[error("operation not supported")]
    NotSup = 9,

    #[error("no free processing element")]
    NoFreeCore = 10,

    #[error("no space left")]
    NoSpace = 12,

    #[error("object already exists")]
    Exists = 13,

    #[error("endpoint is invalid")]
    EpInvalid = 18,

    #[error("receive endpoint is gone")]
    RecvGone = 19,

    #[error("end of file")]
    EndOfFile = 20,

    #[error("messages are waiting to be handled")]
    MsgsWaiting = 21,
}

impl Code {
    /// Raw wire value of a successful reply
    pub const NO_ERROR: u64 = 0;

    /// Returns the raw wire value
    pub fn raw(self) -> u64 {
        self as u64
    }

    /// Decodes a raw wire value
    ///
    /// Returns `Ok(())` for `NO_ERROR` and the matching code otherwise.
    /// Unknown values decode to [`Code::InvArgs`].
    pub fn from_raw(raw: u64) -> Result<()> {
        let code = match raw {
            Self::NO_ERROR => return Ok(()),
            1 => Code::MissCredits,
            2 => Code::NoRingSpace,
            3 => Code::VpeGone,
            4 => Code::NoMapping,
            5 => Code::InvArgs,
            6 => Code::OutOfMem,
            8 => Code::NoPerm,
            9 => Code::NotSup,
            10 => Code::NoFreeCore,
            12 => Code::NoSpace,
            13 => Code::Exists,
            18 => Code::EpInvalid,
            19 => Code::RecvGone,
            20 => Code::EndOfFile,
            21 => Code::MsgsWaiting,
            _ => Code::InvArgs,
        };
        Err(code)
    }

    /// Encodes a result as a raw wire value
    pub fn to_raw<T>(res: &Result<T>) -> u64 {
        match res {
            Ok(_) => Self::NO_ERROR,
            Err(code) => code.raw(),
        }
    }

    /// Transport/flow-control error; the caller backs off, never retried
    pub fn is_flow_control(self) -> bool {
        matches!(self, Code::MissCredits | Code::NoRingSpace)
    }

    /// Peer-lifetime error; recovered once by reactivating the endpoint
    pub fn is_peer_lifetime(self) -> bool {
        matches!(self, Code::VpeGone | Code::RecvGone | Code::EpInvalid)
    }

    /// Protocol violation; always surfaced
    pub fn is_protocol_violation(self) -> bool {
        matches!(self, Code::InvArgs | Code::NotSup)
    }

    /// Resource exhaustion; surfaced without implicit retry
    pub fn is_resource_exhaustion(self) -> bool {
        matches!(self, Code::OutOfMem | Code::NoFreeCore | Code::NoSpace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_values_are_stable() {
        assert_eq!(Code::MissCredits.raw(), 1);
        assert_eq!(Code::InvArgs.raw(), 5);
        assert_eq!(Code::EpInvalid.raw(), 18);
        assert_eq!(Code::MsgsWaiting.raw(), 21);
    }

    #[test]
    fn test_from_raw() {
        assert_eq!(Code::from_raw(0), Ok(()));
        assert_eq!(Code::from_raw(3), Err(Code::VpeGone));
        assert_eq!(Code::from_raw(13), Err(Code::Exists));
        assert_eq!(Code::from_raw(999), Err(Code::InvArgs));
    }

    #[test]
    fn test_to_raw() {
        assert_eq!(Code::to_raw::<()>(&Ok(())), 0);
        assert_eq!(Code::to_raw::<u32>(&Err(Code::RecvGone)), 19);
    }

    #[test]
    fn test_taxonomy_is_disjoint() {
        let all = [
            Code::MissCredits,
            Code::NoRingSpace,
            Code::VpeGone,
            Code::RecvGone,
            Code::EpInvalid,
            Code::InvArgs,
            Code::NotSup,
            Code::OutOfMem,
            Code::NoFreeCore,
        ];
        for code in all {
            let classes = [
                code.is_flow_control(),
                code.is_peer_lifetime(),
                code.is_protocol_violation(),
                code.is_resource_exhaustion(),
            ];
            assert_eq!(classes.iter().filter(|c| **c).count(), 1, "{code:?}");
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(Code::MissCredits.to_string(), "no credits left on send endpoint");
    }
}
