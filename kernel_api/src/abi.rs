//! Reserved resources every VPE starts with

use core_types::{CapSel, EpId};

/// Send endpoint of the syscall gate
pub const SYSC_SEP: EpId = 0;
/// Receive endpoint for syscall replies
pub const SYSC_REP: EpId = 1;
/// Default receive endpoint for replies of user gates
pub const DEF_REP: EpId = 2;
/// First endpoint handed out to gates
pub const FIRST_FREE_EP: EpId = 3;

/// Selector of the VPE's own capability
pub const SEL_VPE: CapSel = 0;
/// Selector reserved for the VPE's memory
pub const SEL_MEM: CapSel = 1;
/// First selector handed out by the selector allocator
pub const FIRST_FREE_SEL: CapSel = 2;

/// Largest syscall message, as a power of two
pub const SYSC_MSG_ORDER: u8 = 11;
/// Syscall reply buffer: one slot
pub const SYSC_RBUF_ORDER: u8 = SYSC_MSG_ORDER;
/// Default receive buffer size, as a power of two
pub const DEF_RBUF_ORDER: u8 = 13;
/// Default receive buffer slot size, as a power of two
pub const DEF_RBUF_MSG_ORDER: u8 = 11;

/// Label of a service's control gate
pub const CTRL_LABEL: u64 = 0;
