//! Packet assembly and disassembly.
//!
//! Wire layout:
//!
//! ```text
//! MARK(0xFF) SOM(0x53) ADDR LEN_LSB LEN_MSB CTRL [SCB] DATA.. [MAC4] FCS
//! ```
//!
//! `LEN` counts from SOM through the frame check, excluding the mark byte.
//! `ADDR` carries the 7-bit device address; bit 7 is set on PD→CP replies.
//! `CTRL` packs the sequence number (bits 0-1), the frame-check type
//! (bit 2: CRC-16, else 8-bit checksum) and the SCB-present bit (bit 3).

use std::io;
use std::time::{Duration, Instant};

use crate::channel::Channel;
use crate::error::OsdpError;
use crate::sc::SecureChannel;
use crate::types::{OSDP_PACKET_BUF_SIZE, OSDP_RESP_TOUT_MS};

pub(crate) const PKT_MARK: u8 = 0xFF;
pub(crate) const PKT_SOM: u8 = 0x53;
pub(crate) const PKT_BROADCAST_ADDR: u8 = 0x7F;

const PKT_CONTROL_SQN: u8 = 0x03;
const PKT_CONTROL_CRC: u8 = 0x04;
const PKT_CONTROL_SCB: u8 = 0x08;
const PKT_REPLY_ADDR_BIT: u8 = 0x80;

/// Bytes from mark through control.
const PKT_HEADER_LEN: usize = 6;
const PKT_MAC_LEN: usize = 4;

/// CRC-16 with polynomial 0x1021 and seed 0x1D0F over SOM..end of data/MAC.
pub(crate) fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0x1D0F;
    for byte in data {
        crc = (crc >> 8) | (crc << 8);
        crc ^= u16::from(*byte);
        crc ^= (crc & 0xFF) >> 4;
        crc ^= crc << 12;
        crc ^= (crc & 0xFF) << 5;
    }
    crc
}

/// Two's complement of the 8-bit sum over the same region as the CRC.
pub(crate) fn checksum8(data: &[u8]) -> u8 {
    let sum = data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    sum.wrapping_neg()
}

pub(crate) fn hex(buf: &[u8]) -> String {
    buf.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Secure control block to place in an outgoing frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScbKind {
    None,
    /// SCS_11; the extra byte tells the PD whether the CP keys off SCBK-D.
    Chlng { scbk_d: bool },
    /// SCS_12; the extra byte is 0 when the PD derived keys from SCBK-D.
    Ccrypt { scbk_ok: bool },
    /// SCS_13.
    Scrypt { scbk_d: bool },
    /// SCS_14; the extra byte reports whether the CP cryptogram verified.
    RmacI { verified: bool },
    /// SCS_15..18, picked from direction and payload size at build time.
    Data,
}

/// Sequence mismatch handling: the PD answers NAK(SEQ_NUM) and resets its
/// secure channel; the CP tears the session down and re-initializes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameError {
    /// Bad SOM, length or frame check.
    Check,
    /// Sequence number out of order.
    Seq,
    /// Secure channel rules violated (missing/unexpected SCB, MAC or
    /// decrypt failure).
    ScCond,
}

pub(crate) enum DecodeStatus {
    Frame(DecodedFrame),
    /// Not enough bytes yet.
    Wait,
    /// Bytes were discarded (noise, or a frame addressed to another PD).
    Skip,
}

pub(crate) struct DecodedFrame {
    /// Decrypted data payload: reply/command code plus its arguments.
    pub(crate) data: Vec<u8>,
    pub(crate) scs: Option<u8>,
    /// Third SCB byte, present for SCS_11..14.
    pub(crate) scb_data: Option<u8>,
}

fn seq_next(seq: i8) -> i8 {
    if seq >= 3 {
        1
    } else {
        seq + 1
    }
}

/// Per-PD physical layer state. The CP holds one per peripheral; the PD
/// holds a single one for its bus.
pub(crate) struct Phy {
    pub(crate) address: u8,
    is_pd: bool,
    /// -1 means "reset": the next CP transmission uses sequence 0.
    seq: i8,
    pub(crate) skip_seq_check: bool,
    rx_buf: [u8; OSDP_PACKET_BUF_SIZE],
    rx_len: usize,
    /// Arrival time of the first byte of the frame being assembled.
    tstamp: Option<Instant>,
}

impl Phy {
    pub(crate) fn new(address: u8, is_pd: bool) -> Self {
        Self {
            address,
            is_pd,
            seq: -1,
            skip_seq_check: false,
            rx_buf: [0; OSDP_PACKET_BUF_SIZE],
            rx_len: 0,
            tstamp: None,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.seq = -1;
        self.rx_clear();
    }

    /// Pull whatever the channel has into the reassembly buffer.
    pub(crate) fn rx_feed(&mut self, channel: &dyn Channel) -> io::Result<usize> {
        if self.rx_len >= self.rx_buf.len() {
            return Ok(0);
        }
        let was_empty = self.rx_len == 0;
        let n = channel.recv(&mut self.rx_buf[self.rx_len..])?;
        if n > 0 {
            if was_empty {
                self.tstamp = Some(Instant::now());
            }
            self.rx_len += n;
        }
        Ok(n)
    }

    pub(crate) fn rx_pending(&self) -> bool {
        self.rx_len > 0
    }

    pub(crate) fn rx_clear(&mut self) {
        self.rx_len = 0;
        self.tstamp = None;
    }

    /// A partial frame has been sitting here longer than the response
    /// timeout.
    pub(crate) fn rx_stale(&self) -> bool {
        self.rx_len > 0
            && self
                .tstamp
                .map(|t| t.elapsed() >= Duration::from_millis(OSDP_RESP_TOUT_MS))
                .unwrap_or(false)
    }

    fn consume(&mut self, n: usize) {
        self.rx_buf.copy_within(n..self.rx_len, 0);
        self.rx_len -= n;
        if self.rx_len == 0 {
            self.tstamp = None;
        } else {
            self.tstamp = Some(Instant::now());
        }
    }

    fn check_cmd_seq(&mut self, cur: u8) -> Result<(), FrameError> {
        if self.skip_seq_check {
            self.seq = cur as i8;
            return Ok(());
        }
        if cur == 0 {
            // CP restarted its sequence.
            self.seq = 0;
            return Ok(());
        }
        let expect = seq_next(self.seq) as u8 & PKT_CONTROL_SQN;
        // Adopt the CP's number either way so the reply (NAK included)
        // echoes it and the link can resynchronize.
        self.seq = cur as i8;
        if cur != expect {
            return Err(FrameError::Seq);
        }
        Ok(())
    }

    fn check_reply_seq(&self, cur: u8) -> Result<(), FrameError> {
        if self.skip_seq_check {
            return Ok(());
        }
        if cur != self.seq.max(0) as u8 {
            return Err(FrameError::Seq);
        }
        Ok(())
    }

    /// Assemble a complete frame around `payload` (command/reply code plus
    /// arguments) into `out`, returning the wire length.
    pub(crate) fn build_frame(
        &mut self,
        sc: &mut SecureChannel,
        scb: ScbKind,
        payload: &[u8],
        out: &mut [u8],
    ) -> Result<usize, OsdpError> {
        let seq = if self.is_pd {
            // Replies echo the sequence of the command they answer.
            self.seq.max(0) as u8
        } else {
            self.seq = seq_next(self.seq);
            self.seq as u8
        };

        let (scb_bytes, encrypt, with_mac): (Vec<u8>, bool, bool) = match scb {
            ScbKind::None => (Vec::new(), false, false),
            ScbKind::Chlng { scbk_d } => (vec![3, 0x11, u8::from(!scbk_d)], false, false),
            ScbKind::Ccrypt { scbk_ok } => (vec![3, 0x12, u8::from(scbk_ok)], false, false),
            ScbKind::Scrypt { scbk_d } => (vec![3, 0x13, u8::from(!scbk_d)], false, false),
            ScbKind::RmacI { verified } => (vec![3, 0x14, u8::from(verified)], false, false),
            ScbKind::Data => {
                let encrypt = payload.len() > 1;
                let scs = match (encrypt, self.is_pd) {
                    (false, false) => 0x15,
                    (false, true) => 0x16,
                    (true, false) => 0x17,
                    (true, true) => 0x18,
                };
                (vec![2, scs], encrypt, true)
            }
        };

        let is_cmd = !self.is_pd;
        let data = if encrypt {
            sc.encrypt_payload(is_cmd, payload)?
        } else {
            payload.to_vec()
        };

        let mac_len = if with_mac { PKT_MAC_LEN } else { 0 };
        let pkt_len = 5 + scb_bytes.len() + data.len() + mac_len + 2;
        let total = pkt_len + 1;
        if total > out.len() {
            return Err(OsdpError::PacketOverflow);
        }

        out[0] = PKT_MARK;
        out[1] = PKT_SOM;
        out[2] = (self.address & 0x7F) | if self.is_pd { PKT_REPLY_ADDR_BIT } else { 0 };
        out[3..5].copy_from_slice(&(pkt_len as u16).to_le_bytes());
        out[5] = seq
            | PKT_CONTROL_CRC
            | if scb_bytes.is_empty() {
                0
            } else {
                PKT_CONTROL_SCB
            };

        let mut pos = PKT_HEADER_LEN;
        out[pos..pos + scb_bytes.len()].copy_from_slice(&scb_bytes);
        pos += scb_bytes.len();
        out[pos..pos + data.len()].copy_from_slice(&data);
        pos += data.len();

        if with_mac {
            let mac = sc.compute_mac(is_cmd, &out[1..pos])?;
            out[pos..pos + PKT_MAC_LEN].copy_from_slice(&mac[..PKT_MAC_LEN]);
            pos += PKT_MAC_LEN;
        }

        let crc = crc16(&out[1..pos]);
        out[pos..pos + 2].copy_from_slice(&crc.to_le_bytes());
        pos += 2;

        Ok(pos)
    }

    /// Try to extract one frame from the reassembly buffer.
    ///
    /// Leading noise is dropped up to the next MARK+SOM pair; bytes beyond a
    /// complete frame are kept for the next call.
    pub(crate) fn decode(&mut self, sc: &mut SecureChannel) -> Result<DecodeStatus, FrameError> {
        if self.rx_len == 0 {
            return Ok(DecodeStatus::Wait);
        }

        // Resynchronize to a mark/SOM pair.
        let start = (0..self.rx_len.saturating_sub(1))
            .find(|&i| self.rx_buf[i] == PKT_MARK && self.rx_buf[i + 1] == PKT_SOM);
        match start {
            Some(0) => {}
            Some(i) => {
                self.consume(i);
            }
            None => {
                if self.rx_buf[self.rx_len - 1] == PKT_MARK {
                    self.rx_buf[0] = PKT_MARK;
                    self.rx_len = 1;
                    return Ok(DecodeStatus::Wait);
                }
                self.rx_clear();
                return Ok(DecodeStatus::Skip);
            }
        }

        if self.rx_len < PKT_HEADER_LEN {
            return Ok(DecodeStatus::Wait);
        }

        let addr_byte = self.rx_buf[2];
        let pkt_len = u16::from_le_bytes([self.rx_buf[3], self.rx_buf[4]]) as usize;
        let total = pkt_len + 1;
        if total < PKT_HEADER_LEN + 2 || total > OSDP_PACKET_BUF_SIZE {
            self.rx_clear();
            return Err(FrameError::Check);
        }
        if self.rx_len < total {
            return Ok(DecodeStatus::Wait);
        }

        let for_us = if self.is_pd {
            let addr = addr_byte & 0x7F;
            addr_byte & PKT_REPLY_ADDR_BIT == 0
                && (addr == self.address || addr == PKT_BROADCAST_ADDR)
        } else {
            addr_byte & PKT_REPLY_ADDR_BIT != 0 && addr_byte & 0x7F == self.address
        };
        if !for_us {
            // Another PD's traffic on a multidrop bus.
            self.consume(total);
            return Ok(DecodeStatus::Skip);
        }

        let ctrl = self.rx_buf[5];
        let fcs_len = if ctrl & PKT_CONTROL_CRC != 0 { 2 } else { 1 };
        let body_end = total - fcs_len;
        let fcs_ok = if fcs_len == 2 {
            let got = u16::from_le_bytes([self.rx_buf[body_end], self.rx_buf[body_end + 1]]);
            crc16(&self.rx_buf[1..body_end]) == got
        } else {
            checksum8(&self.rx_buf[1..body_end]) == self.rx_buf[body_end]
        };
        if !fcs_ok {
            self.consume(total);
            return Err(FrameError::Check);
        }

        let cur = ctrl & PKT_CONTROL_SQN;
        let seq_result = if self.is_pd {
            self.check_cmd_seq(cur)
        } else {
            self.check_reply_seq(cur)
        };
        if let Err(e) = seq_result {
            self.consume(total);
            return Err(e);
        }
        if self.is_pd && cur == 0 {
            // Sequence 0 is a CP restart; any established secure channel
            // is void from here on.
            sc.deactivate();
        }

        let mut data_start = PKT_HEADER_LEN;
        let mut scs = None;
        let mut scb_data = None;
        let mut mac_len = 0;
        if ctrl & PKT_CONTROL_SCB != 0 {
            let scb_len = self.rx_buf[6] as usize;
            let scs_ty = self.rx_buf[7];
            if !(0x11..=0x18).contains(&scs_ty)
                || !matches!(scb_len, 2 | 3)
                || PKT_HEADER_LEN + scb_len > body_end
            {
                self.consume(total);
                return Err(FrameError::Check);
            }
            if scs_ty >= 0x15 {
                if !sc.active {
                    self.consume(total);
                    return Err(FrameError::ScCond);
                }
                mac_len = PKT_MAC_LEN;
            }
            scs = Some(scs_ty);
            if scb_len == 3 {
                scb_data = Some(self.rx_buf[8]);
            }
            data_start = PKT_HEADER_LEN + scb_len;
        } else if sc.active {
            // Peer fell back to plaintext without renegotiating.
            self.consume(total);
            return Err(FrameError::ScCond);
        }

        if body_end < data_start + mac_len {
            self.consume(total);
            return Err(FrameError::Check);
        }
        let data_end = body_end - mac_len;
        let is_cmd = self.is_pd;

        if mac_len > 0 {
            let mac = match sc.compute_mac(is_cmd, &self.rx_buf[1..data_end]) {
                Ok(mac) => mac,
                Err(_) => {
                    self.consume(total);
                    return Err(FrameError::ScCond);
                }
            };
            if mac[..PKT_MAC_LEN] != self.rx_buf[data_end..data_end + PKT_MAC_LEN] {
                self.consume(total);
                return Err(FrameError::ScCond);
            }
        }

        let mut data = self.rx_buf[data_start..data_end].to_vec();
        if matches!(scs, Some(0x17) | Some(0x18)) && !data.is_empty() {
            match sc.decrypt_payload(is_cmd, &mut data) {
                Ok(n) => data.truncate(n),
                Err(_) => {
                    self.consume(total);
                    return Err(FrameError::ScCond);
                }
            }
        }

        self.consume(total);
        Ok(DecodeStatus::Frame(DecodedFrame {
            data,
            scs,
            scb_data,
        }))
    }
}
