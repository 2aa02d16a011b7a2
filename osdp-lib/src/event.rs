//! Events a PD application reports and a CP application consumes.

use crate::error::{OsdpError, Result};
use crate::types::{OSDP_CMD_MFG_MAX_DATALEN, OSDP_EVENT_MAX_DATALEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OsdpCardFormat {
    RawUnspecified = 0,
    RawWiegand = 1,
    Ascii = 2,
}

/// A card presented at a reader.
///
/// For the raw formats `length` counts bits and `data` holds the packed
/// bitstream; for ASCII it counts bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsdpEventCardRead {
    pub reader_no: u8,
    pub format: OsdpCardFormat,
    pub direction: u8,
    length: u16,
    data: [u8; OSDP_EVENT_MAX_DATALEN],
}

impl OsdpEventCardRead {
    /// Card data in one of the raw formats; `nr_bits` counts valid bits in
    /// `bits`, which must hold exactly the packed `(nr_bits + 7) / 8` bytes.
    pub fn new_raw(
        reader_no: u8,
        format: OsdpCardFormat,
        nr_bits: u16,
        bits: &[u8],
    ) -> Result<Self> {
        let nr_bytes = (nr_bits as usize + 7) / 8;
        if nr_bytes > OSDP_EVENT_MAX_DATALEN || bits.len() != nr_bytes {
            return Err(OsdpError::PayloadTooLong {
                len: bits.len(),
                max: OSDP_EVENT_MAX_DATALEN,
            });
        }
        if format == OsdpCardFormat::Ascii {
            return Err(OsdpError::Setup("raw constructor with ASCII format".into()));
        }
        let mut data = [0u8; OSDP_EVENT_MAX_DATALEN];
        data[..bits.len()].copy_from_slice(bits);
        Ok(Self {
            reader_no,
            format,
            direction: 0,
            length: nr_bits,
            data,
        })
    }

    /// Card data already decoded to ASCII.
    pub fn new_ascii(reader_no: u8, direction: u8, text: &[u8]) -> Result<Self> {
        if text.len() > OSDP_EVENT_MAX_DATALEN {
            return Err(OsdpError::PayloadTooLong {
                len: text.len(),
                max: OSDP_EVENT_MAX_DATALEN,
            });
        }
        let mut data = [0u8; OSDP_EVENT_MAX_DATALEN];
        data[..text.len()].copy_from_slice(text);
        Ok(Self {
            reader_no,
            format: OsdpCardFormat::Ascii,
            direction,
            length: text.len() as u16,
            data,
        })
    }

    /// Bits for the raw formats, bytes for ASCII.
    pub fn length(&self) -> u16 {
        self.length
    }

    /// The card data bytes (packed bitstream for raw formats).
    pub fn data(&self) -> &[u8] {
        let nr_bytes = match self.format {
            OsdpCardFormat::Ascii => self.length as usize,
            _ => (self.length as usize + 7) / 8,
        };
        &self.data[..nr_bytes]
    }
}

/// Keys pressed on a reader keypad.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsdpEventKeyPress {
    pub reader_no: u8,
    length: u8,
    data: [u8; OSDP_EVENT_MAX_DATALEN],
}

impl OsdpEventKeyPress {
    pub fn new(reader_no: u8, digits: &[u8]) -> Result<Self> {
        if digits.len() > OSDP_EVENT_MAX_DATALEN {
            return Err(OsdpError::PayloadTooLong {
                len: digits.len(),
                max: OSDP_EVENT_MAX_DATALEN,
            });
        }
        let mut data = [0u8; OSDP_EVENT_MAX_DATALEN];
        data[..digits.len()].copy_from_slice(digits);
        Ok(Self {
            reader_no,
            length: digits.len() as u8,
            data,
        })
    }

    pub fn digits(&self) -> &[u8] {
        &self.data[..self.length as usize]
    }
}

/// Manufacturer-specific reply forwarded to the CP application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsdpEventMfgReply {
    pub vendor_code: u32,
    pub command: u8,
    length: u8,
    data: [u8; OSDP_CMD_MFG_MAX_DATALEN],
}

impl OsdpEventMfgReply {
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

/// Something that happened at a PD, delivered to the CP's event callback or
/// queued on the PD for the next POLL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OsdpEvent {
    CardRead(OsdpEventCardRead),
    KeyPress(OsdpEventKeyPress),
    MfgReply(OsdpEventMfgReply),
}
