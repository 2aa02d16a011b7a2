#![forbid(unsafe_code)]

//! OSDP (Open Supervised Device Protocol) stack: a control panel (CP) that
//! polls peripherals over a shared multidrop bus, and a peripheral device
//! (PD) that answers a single CP — with optional AES-128 secure channel.
//!
//! The library does no I/O of its own. It drives a byte-oriented,
//! non-blocking [`Channel`] the host supplies and advances only inside
//! `refresh()` calls; there are no internal threads.

pub mod channel;
pub mod cmd;
pub mod cp;
pub mod error;
pub mod event;
pub mod pd;
mod phy;
mod queue;
mod sc;
pub mod types;

pub use channel::{Channel, MemoryChannel};
pub use cmd::{
    OsdpCommand, OsdpCommandBuzzer, OsdpCommandComset, OsdpCommandKeyset, OsdpCommandLed,
    OsdpCommandMfg, OsdpCommandOutput, OsdpCommandText, OsdpLedParams,
};
pub use cp::ControlPanel;
pub use error::{OsdpError, Result};
pub use event::{
    OsdpCardFormat, OsdpEvent, OsdpEventCardRead, OsdpEventKeyPress, OsdpEventMfgReply,
};
pub use pd::{CommandOutcome, PeripheralDevice};
pub use types::{
    CapFunction, NakReason, PdCapability, PdFlags, PdId, PdInfo, OSDP_CMD_MFG_MAX_DATALEN,
    OSDP_CMD_TEXT_MAX_LEN, OSDP_CP_CMD_POOL_SIZE, OSDP_EVENT_MAX_DATALEN, OSDP_PACKET_BUF_SIZE,
    OSDP_PD_MAX_ADDR,
};
