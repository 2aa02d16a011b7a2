use std::sync::Arc;

use crate::channel::Channel;

/// Size of the per-PD packet buffer. Bounds every frame on the wire,
/// including header, secure control block, MAC and frame check.
pub const OSDP_PACKET_BUF_SIZE: usize = 256;

/// Maximum number of characters in a TEXT command.
pub const OSDP_CMD_TEXT_MAX_LEN: usize = 32;

/// Maximum manufacturer-specific payload in an MFG command or reply.
pub const OSDP_CMD_MFG_MAX_DATALEN: usize = 64;

/// Maximum data bytes carried by a card-read or keypress event.
pub const OSDP_EVENT_MAX_DATALEN: usize = 64;

/// Capacity of each command/event queue, fixed at setup.
pub const OSDP_CP_CMD_POOL_SIZE: usize = 16;

/// Time budget to assemble a full frame after its first byte, and for the
/// CP to see a reply after sending a command.
pub(crate) const OSDP_RESP_TOUT_MS: u64 = 200;

/// Poll cadence per PD once it is online.
pub(crate) const OSDP_PD_POLL_TIMEOUT_MS: u64 = 50;

/// How long an offline PD rests before the CP retries from INIT.
pub(crate) const OSDP_ONLINE_RETRY_WAIT_MS: u64 = 1000;

/// Consecutive NAKs tolerated while online before the PD is taken offline.
pub(crate) const OSDP_NAK_FLOOD_LIMIT: u32 = 3;

/// Highest valid (non-broadcast) PD address.
pub const OSDP_PD_MAX_ADDR: u8 = 126;

pub(crate) fn baud_rate_supported(baud: u32) -> bool {
    matches!(baud, 9600 | 38400 | 115200)
}

/// PD identity block, reported in response to an ID request.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PdId {
    pub version: u8,
    pub model: u8,
    /// IEEE-assigned vendor code, 24 bits used.
    pub vendor_code: u32,
    pub serial_number: u32,
    /// Firmware version, 24 bits used (sent big-endian on the wire).
    pub firmware_version: u32,
}

/// Capability function codes from the PD capability table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CapFunction {
    ContactStatusMonitoring = 1,
    OutputControl = 2,
    CardDataFormat = 3,
    ReaderLedControl = 4,
    ReaderAudibleOutput = 5,
    ReaderTextOutput = 6,
    TimeKeeping = 7,
    CheckCharacterSupport = 8,
    CommunicationSecurity = 9,
    ReceiveBufferSize = 10,
    LargestCombinedMessageSize = 11,
    SmartCardSupport = 12,
    Readers = 13,
    Biometrics = 14,
}

/// One past the highest capability function code; sizes the per-PD table.
pub(crate) const OSDP_PD_CAP_SENTINEL: usize = 15;

impl CapFunction {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => Self::ContactStatusMonitoring,
            2 => Self::OutputControl,
            3 => Self::CardDataFormat,
            4 => Self::ReaderLedControl,
            5 => Self::ReaderAudibleOutput,
            6 => Self::ReaderTextOutput,
            7 => Self::TimeKeeping,
            8 => Self::CheckCharacterSupport,
            9 => Self::CommunicationSecurity,
            10 => Self::ReceiveBufferSize,
            11 => Self::LargestCombinedMessageSize,
            12 => Self::SmartCardSupport,
            13 => Self::Readers,
            14 => Self::Biometrics,
            _ => return None,
        })
    }
}

/// One entry of the PD capability table.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PdCapability {
    pub function_code: u8,
    pub compliance_level: u8,
    pub num_items: u8,
}

impl PdCapability {
    pub fn new(function: CapFunction, compliance_level: u8, num_items: u8) -> Self {
        Self {
            function_code: function as u8,
            compliance_level,
            num_items,
        }
    }
}

/// Behavioral flags for a PD session.
#[derive(Debug, Default, Clone, Copy)]
pub struct PdFlags {
    /// Accept the default secure-channel base key (SCBK-D) until a KEYSET
    /// provisions a real one.
    pub install_mode: bool,
    /// Disable inbound sequence-number validation. Test rigs only.
    pub skip_seq_check: bool,
}

/// Reasons carried in a NAK reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NakReason {
    /// Message check (checksum/CRC) failed.
    MsgCheck = 0x01,
    /// Command payload length is wrong for the command code.
    CmdLen = 0x02,
    /// Unknown command code.
    CmdUnknown = 0x03,
    /// Unexpected sequence number.
    SeqNum = 0x04,
    /// Secure channel is not supported by this PD.
    ScUnsupported = 0x05,
    /// Secure channel conditions not met (e.g. KEYSET while SC inactive).
    ScConditions = 0x06,
    BioType = 0x07,
    BioFormat = 0x08,
    /// The command was understood but could not be processed.
    Record = 0x09,
}

impl NakReason {
    pub(crate) fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x01 => Self::MsgCheck,
            0x02 => Self::CmdLen,
            0x03 => Self::CmdUnknown,
            0x04 => Self::SeqNum,
            0x05 => Self::ScUnsupported,
            0x06 => Self::ScConditions,
            0x07 => Self::BioType,
            0x08 => Self::BioFormat,
            0x09 => Self::Record,
            _ => return None,
        })
    }
}

/// Everything the library needs to know about one PD at setup time.
///
/// On the CP side one `PdInfo` describes each peripheral on the bus; on the
/// PD side a single `PdInfo` describes the device itself. The channel is
/// reference-counted so several PDs on a multidrop bus can share one
/// physical adapter.
#[derive(Clone)]
pub struct PdInfo {
    /// 7-bit device address, 0..=126.
    pub address: u8,
    /// Line speed; one of 9600, 38400 or 115200.
    pub baud_rate: u32,
    pub flags: PdFlags,
    pub id: PdId,
    /// Capability entries beyond the implicit ones (check-character and
    /// communication-security entries are merged in at setup).
    pub cap: Vec<PdCapability>,
    pub channel: Arc<dyn Channel>,
    /// Per-PD secure channel base key. On the CP side this is used when no
    /// master key was given at setup.
    pub scbk: Option<[u8; 16]>,
}

impl PdInfo {
    pub fn new(address: u8, baud_rate: u32, channel: Arc<dyn Channel>) -> Self {
        Self {
            address,
            baud_rate,
            flags: PdFlags::default(),
            id: PdId::default(),
            cap: Vec::new(),
            channel,
            scbk: None,
        }
    }
}
