//! Kernel configuration

use crate::error::PlatformError;
use dtu::{DtuConfig, RecvConfig};
use kernel_api::{DEF_RBUF_MSG_ORDER, DEF_RBUF_ORDER, SYSC_MSG_ORDER};
use serde::{Deserialize, Serialize};

/// Everything the platform can be tuned with
///
/// Missing fields take their defaults, so a config file only has to name
/// what it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// The emulated hardware
    pub dtu: DtuConfig,
    /// Kernel buffer for syscalls, as a power of two
    pub sysc_buf_order: u8,
    /// Kernel buffer for replies of services, as a power of two
    pub srv_buf_order: u8,
    /// Default receive buffer of every VPE
    pub def_buf_order: u8,
    pub def_msg_order: u8,
    /// Bytes of global memory each VPE gets at `SEL_MEM`
    pub vpe_mem_size: u64,
    /// Control requests a service may have queued
    pub service_queue_len: usize,
    /// Tell all services to shut down once only services are left
    pub auto_shutdown: bool,
}

impl KernelConfig {
    /// Parses a JSON config
    pub fn from_json(json: &str) -> Result<Self, PlatformError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| PlatformError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the buffer layouts and limits
    pub fn validate(&self) -> Result<(), PlatformError> {
        let bufs = [
            ("sysc_buf_order", self.sysc_buf_order, SYSC_MSG_ORDER),
            ("srv_buf_order", self.srv_buf_order, SYSC_MSG_ORDER),
            ("def_buf_order", self.def_buf_order, self.def_msg_order),
        ];
        for (name, order, msg_order) in bufs {
            if (RecvConfig { order, msg_order }).validate().is_err() {
                return Err(PlatformError::Config(format!(
                    "{name}: {order}/{msg_order} is no valid buffer layout"
                )));
            }
        }
        // the kernel's buffers hold one message per VPE
        let sysc = RecvConfig {
            order: self.sysc_buf_order,
            msg_order: SYSC_MSG_ORDER,
        };
        if sysc.slots() + 1 < self.dtu.max_pes {
            return Err(PlatformError::Config(format!(
                "sysc_buf_order: {} slots for {} PEs",
                sysc.slots(),
                self.dtu.max_pes
            )));
        }
        if self.dtu.max_pes < 2 {
            return Err(PlatformError::Config("max_pes: need the kernel and one VPE".into()));
        }
        if self.service_queue_len == 0 {
            return Err(PlatformError::Config("service_queue_len: must not be 0".into()));
        }
        Ok(())
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            dtu: DtuConfig::default(),
            sysc_buf_order: 16,
            srv_buf_order: 16,
            def_buf_order: DEF_RBUF_ORDER,
            def_msg_order: DEF_RBUF_MSG_ORDER,
            vpe_mem_size: 4096,
            service_queue_len: 32,
            auto_shutdown: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(KernelConfig::default().validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let config = KernelConfig::from_json(r#"{"auto_shutdown": true, "dtu": {"max_pes": 8}}"#)
            .unwrap();
        assert!(config.auto_shutdown);
        assert_eq!(config.dtu.max_pes, 8);
        assert_eq!(config.sysc_buf_order, 16);
    }

    #[test]
    fn test_rejects_small_syscall_buffer() {
        let err = KernelConfig::from_json(r#"{"sysc_buf_order": 13}"#).unwrap_err();
        assert!(matches!(err, PlatformError::Config(_)));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            KernelConfig::from_json("{"),
            Err(PlatformError::Config(_))
        ));
    }
}
