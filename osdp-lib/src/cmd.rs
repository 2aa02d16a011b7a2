//! Application-visible commands and their wire encodings.

use crate::error::{OsdpError, Result};
use crate::types::{OSDP_CMD_MFG_MAX_DATALEN, OSDP_CMD_TEXT_MAX_LEN};

/// Command codes as they appear on the wire (CP → PD).
pub(crate) mod ids {
    pub const POLL: u8 = 0x60;
    pub const ID: u8 = 0x61;
    pub const CAP: u8 = 0x62;
    pub const LSTAT: u8 = 0x64;
    pub const ISTAT: u8 = 0x65;
    pub const OSTAT: u8 = 0x66;
    pub const RSTAT: u8 = 0x67;
    pub const OUT: u8 = 0x68;
    pub const LED: u8 = 0x69;
    pub const BUZ: u8 = 0x6A;
    pub const TEXT: u8 = 0x6B;
    pub const COMSET: u8 = 0x6E;
    pub const KEYSET: u8 = 0x75;
    pub const CHLNG: u8 = 0x76;
    pub const SCRYPT: u8 = 0x77;
    pub const MFG: u8 = 0x80;
}

/// Reply codes as they appear on the wire (PD → CP).
pub(crate) mod reply_ids {
    pub const ACK: u8 = 0x40;
    pub const NAK: u8 = 0x41;
    pub const PDID: u8 = 0x45;
    pub const PDCAP: u8 = 0x46;
    pub const LSTATR: u8 = 0x48;
    pub const ISTATR: u8 = 0x49;
    pub const OSTATR: u8 = 0x4A;
    pub const RSTATR: u8 = 0x4B;
    pub const RAW: u8 = 0x50;
    pub const FMT: u8 = 0x51;
    pub const KEYPAD: u8 = 0x53;
    pub const COM: u8 = 0x54;
    pub const CCRYPT: u8 = 0x76;
    pub const RMAC_I: u8 = 0x78;
    pub const MFGREP: u8 = 0x90;
}

/// Energize or de-energize an output point.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OsdpCommandOutput {
    pub output_no: u8,
    pub control_code: u8,
    /// Time in units of 100 ms for temporary control codes.
    pub timer_count: u16,
}

/// One half (temporary or permanent) of an LED command.
///
/// `timer_count` only goes on the wire for the temporary settings.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OsdpLedParams {
    pub control_code: u8,
    pub on_count: u8,
    pub off_count: u8,
    pub on_color: u8,
    pub off_color: u8,
    pub timer_count: u16,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OsdpCommandLed {
    pub reader: u8,
    pub led_number: u8,
    pub temporary: OsdpLedParams,
    pub permanent: OsdpLedParams,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OsdpCommandBuzzer {
    pub reader: u8,
    pub control_code: u8,
    pub on_count: u8,
    pub off_count: u8,
    pub rep_count: u8,
}

/// Show text on the reader display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsdpCommandText {
    pub reader: u8,
    pub control_code: u8,
    pub temp_time: u8,
    pub offset_row: u8,
    pub offset_col: u8,
    length: u8,
    data: [u8; OSDP_CMD_TEXT_MAX_LEN],
}

impl OsdpCommandText {
    pub fn new(reader: u8, control_code: u8, text: &[u8]) -> Result<Self> {
        if text.len() > OSDP_CMD_TEXT_MAX_LEN {
            return Err(OsdpError::PayloadTooLong {
                len: text.len(),
                max: OSDP_CMD_TEXT_MAX_LEN,
            });
        }
        let mut data = [0u8; OSDP_CMD_TEXT_MAX_LEN];
        data[..text.len()].copy_from_slice(text);
        Ok(Self {
            reader,
            control_code,
            temp_time: 0,
            offset_row: 0,
            offset_col: 0,
            length: text.len() as u8,
            data,
        })
    }

    pub fn text(&self) -> &[u8] {
        &self.data[..self.length as usize]
    }
}

/// Change the PD's address and/or baud rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsdpCommandComset {
    pub address: u8,
    pub baud_rate: u32,
}

/// Vendor-defined passthrough command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsdpCommandMfg {
    /// IEEE vendor code, 24 bits used.
    pub vendor_code: u32,
    pub command: u8,
    length: u8,
    data: [u8; OSDP_CMD_MFG_MAX_DATALEN],
}

impl OsdpCommandMfg {
    pub fn new(vendor_code: u32, command: u8, payload: &[u8]) -> Result<Self> {
        if payload.len() > OSDP_CMD_MFG_MAX_DATALEN {
            return Err(OsdpError::PayloadTooLong {
                len: payload.len(),
                max: OSDP_CMD_MFG_MAX_DATALEN,
            });
        }
        let mut data = [0u8; OSDP_CMD_MFG_MAX_DATALEN];
        data[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            vendor_code,
            command,
            length: payload.len() as u8,
            data,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.length as usize]
    }
}

/// Provision a new secure channel base key. Only key type 1 (SCBK) with a
/// 16-byte key is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsdpCommandKeyset {
    key: [u8; 16],
}

impl OsdpCommandKeyset {
    pub fn new(scbk: [u8; 16]) -> Self {
        Self { key: scbk }
    }

    pub fn key(&self) -> &[u8; 16] {
        &self.key
    }
}

/// A command a CP application can address to one PD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OsdpCommand {
    Output(OsdpCommandOutput),
    Led(OsdpCommandLed),
    Buzzer(OsdpCommandBuzzer),
    Text(OsdpCommandText),
    Comset(OsdpCommandComset),
    Mfg(OsdpCommandMfg),
    Keyset(OsdpCommandKeyset),
}

impl OsdpCommand {
    pub(crate) fn id(&self) -> u8 {
        match self {
            OsdpCommand::Output(_) => ids::OUT,
            OsdpCommand::Led(_) => ids::LED,
            OsdpCommand::Buzzer(_) => ids::BUZ,
            OsdpCommand::Text(_) => ids::TEXT,
            OsdpCommand::Comset(_) => ids::COMSET,
            OsdpCommand::Mfg(_) => ids::MFG,
            OsdpCommand::Keyset(_) => ids::KEYSET,
        }
    }

    /// Serialize the command payload (everything after the command code).
    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        match self {
            OsdpCommand::Output(c) => {
                out.push(c.output_no);
                out.push(c.control_code);
                out.extend_from_slice(&c.timer_count.to_le_bytes());
            }
            OsdpCommand::Led(c) => {
                out.push(c.reader);
                out.push(c.led_number);
                out.push(c.temporary.control_code);
                out.push(c.temporary.on_count);
                out.push(c.temporary.off_count);
                out.push(c.temporary.on_color);
                out.push(c.temporary.off_color);
                out.extend_from_slice(&c.temporary.timer_count.to_le_bytes());
                out.push(c.permanent.control_code);
                out.push(c.permanent.on_count);
                out.push(c.permanent.off_count);
                out.push(c.permanent.on_color);
                out.push(c.permanent.off_color);
            }
            OsdpCommand::Buzzer(c) => {
                out.push(c.reader);
                out.push(c.control_code);
                out.push(c.on_count);
                out.push(c.off_count);
                out.push(c.rep_count);
            }
            OsdpCommand::Text(c) => {
                out.push(c.reader);
                out.push(c.control_code);
                out.push(c.temp_time);
                out.push(c.offset_row);
                out.push(c.offset_col);
                out.push(c.length);
                out.extend_from_slice(c.text());
            }
            OsdpCommand::Comset(c) => {
                out.push(c.address);
                out.extend_from_slice(&c.baud_rate.to_le_bytes());
            }
            OsdpCommand::Mfg(c) => {
                out.extend_from_slice(&c.vendor_code.to_le_bytes()[..3]);
                out.push(c.command);
                out.extend_from_slice(c.data());
            }
            OsdpCommand::Keyset(c) => {
                out.push(1); // key type: SCBK
                out.push(16);
                out.extend_from_slice(c.key());
            }
        }
    }
}
