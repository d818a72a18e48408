//! Kernel → service control protocol
//!
//! The kernel brokers every session. It talks to a service through the
//! service's control gate:
//!
//! | Request | Reply |
//! |---|---|
//! | `[Open, args]` | `[code, ident]` |
//! | `[Obtain, ident, count, args]` | `[code, range, args]` |
//! | `[Delegate, ident, count, args]` | `[code, range, args]` |
//! | `[Close, ident]` | `[code]` |
//! | `[Shutdown]` | `[code]` |

use core_types::{Code, Result};
use ipc::{IStream, OStream};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Control operation tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u64)]
pub enum ServiceCmd {
    Open = 0,
    Obtain = 1,
    Delegate = 2,
    Close = 3,
    Shutdown = 4,
}

impl TryFrom<u64> for ServiceCmd {
    type Error = Code;

    fn try_from(raw: u64) -> Result<Self> {
        match raw {
            0 => Ok(ServiceCmd::Open),
            1 => Ok(ServiceCmd::Obtain),
            2 => Ok(ServiceCmd::Delegate),
            3 => Ok(ServiceCmd::Close),
            4 => Ok(ServiceCmd::Shutdown),
            _ => Err(Code::InvArgs),
        }
    }
}

/// A decoded control request
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceRequest {
    Open {
        args: Vec<Value>,
    },
    Obtain {
        ident: u64,
        count: u32,
        args: Vec<Value>,
    },
    Delegate {
        ident: u64,
        count: u32,
        args: Vec<Value>,
    },
    Close {
        ident: u64,
    },
    Shutdown,
}

impl ServiceRequest {
    /// Tag of this request
    pub fn cmd(&self) -> ServiceCmd {
        match self {
            ServiceRequest::Open { .. } => ServiceCmd::Open,
            ServiceRequest::Obtain { .. } => ServiceCmd::Obtain,
            ServiceRequest::Delegate { .. } => ServiceCmd::Delegate,
            ServiceRequest::Close { .. } => ServiceCmd::Close,
            ServiceRequest::Shutdown => ServiceCmd::Shutdown,
        }
    }

    /// Encodes the request into message payload bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        let os = OStream::new().push(&(self.cmd() as u64));
        let os = match self {
            ServiceRequest::Open { args } => os.push(args),
            ServiceRequest::Obtain { ident, count, args }
            | ServiceRequest::Delegate { ident, count, args } => {
                os.push(ident).push(count).push(args)
            }
            ServiceRequest::Close { ident } => os.push(ident),
            ServiceRequest::Shutdown => os,
        };
        os.into_bytes()
    }

    /// Decodes a request from a stream positioned at the tag
    pub fn decode(is: &mut IStream) -> Result<Self> {
        let cmd = ServiceCmd::try_from(is.pop::<u64>()?)?;
        Ok(match cmd {
            ServiceCmd::Open => ServiceRequest::Open { args: is.pop()? },
            ServiceCmd::Obtain => ServiceRequest::Obtain {
                ident: is.pop()?,
                count: is.pop()?,
                args: is.pop()?,
            },
            ServiceCmd::Delegate => ServiceRequest::Delegate {
                ident: is.pop()?,
                count: is.pop()?,
                args: is.pop()?,
            },
            ServiceCmd::Close => ServiceRequest::Close { ident: is.pop()? },
            ServiceCmd::Shutdown => ServiceRequest::Shutdown,
        })
    }
}
