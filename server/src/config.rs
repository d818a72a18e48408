//! Server buffer configuration

use core_types::{Code, Result};
use dtu::RecvConfig;
use serde::{Deserialize, Serialize};

/// Most receive buffers one server may spread its sessions over
pub const MAX_RECVBUFS: usize = 9;

/// Sizes of a server's receive buffers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Buffer size, as a power of two
    pub buf_order: u8,
    /// Slot size, as a power of two
    pub msg_order: u8,
    /// Number of receive buffers
    pub recv_bufs: usize,
}

impl ServerConfig {
    /// Checks the buffer geometry before any endpoint is touched
    pub fn validate(&self) -> Result<()> {
        if self.recv_bufs == 0 || self.recv_bufs > MAX_RECVBUFS {
            return Err(Code::InvArgs);
        }
        self.recv_config().validate()?;
        // buffer 0 keeps a slot for the kernel
        if self.recv_config().slots() < 2 {
            return Err(Code::InvArgs);
        }
        Ok(())
    }

    pub(crate) fn recv_config(&self) -> RecvConfig {
        RecvConfig {
            order: self.buf_order,
            msg_order: self.msg_order,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            buf_order: 15,
            msg_order: 10,
            recv_bufs: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.recv_config().slots(), 32);
    }

    #[test]
    fn test_buffer_count_is_bounded() {
        let mut config = ServerConfig::default();
        config.recv_bufs = 0;
        assert_eq!(config.validate(), Err(Code::InvArgs));
        config.recv_bufs = MAX_RECVBUFS + 1;
        assert_eq!(config.validate(), Err(Code::InvArgs));
        config.recv_bufs = MAX_RECVBUFS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_single_slot_buffer_is_rejected() {
        let config = ServerConfig {
            buf_order: 10,
            msg_order: 10,
            recv_bufs: 1,
        };
        assert_eq!(config.validate(), Err(Code::InvArgs));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: ServerConfig = serde_json::from_str(r#"{"recv_bufs": 3}"#).unwrap();
        assert_eq!(config.recv_bufs, 3);
        assert_eq!(config.msg_order, 10);
    }
}
