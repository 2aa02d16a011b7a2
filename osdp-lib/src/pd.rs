//! Peripheral-device side of the protocol: command decode, reply
//! construction and the IDLE/reply/error state machine.

use std::sync::Arc;

use tracing::{debug, error, info, trace, warn};

use crate::channel::Channel;
use crate::cmd::{ids, reply_ids, OsdpCommand, OsdpCommandBuzzer, OsdpCommandComset, OsdpCommandLed, OsdpCommandMfg, OsdpCommandOutput, OsdpCommandText, OsdpLedParams};
use crate::error::{OsdpError, Result};
use crate::event::{OsdpCardFormat, OsdpEvent};
use crate::phy::{self, DecodeStatus, FrameError, Phy, ScbKind};
use crate::queue::BoundedQueue;
use crate::sc::{self, SecureChannel};
use crate::types::{
    baud_rate_supported, CapFunction, NakReason, PdCapability, PdId, PdInfo,
    OSDP_CMD_TEXT_MAX_LEN, OSDP_CP_CMD_POOL_SIZE, OSDP_PACKET_BUF_SIZE,
    OSDP_PD_CAP_SENTINEL, OSDP_PD_MAX_ADDR,
};

/// What the application's command callback decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Command applied; the PD replies ACK (or COM for COMSET).
    Accepted,
    /// Only meaningful for MFG commands: send this manufacturer reply.
    MfgReply(OsdpCommandMfg),
    /// Command refused; the PD replies NAK with reason RECORD.
    Refused,
}

pub type CommandCallback = Box<dyn FnMut(u8, &OsdpCommand) -> CommandOutcome + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PdState {
    Idle,
    Err,
}

/// Reply selected by command decode, carried until the frame is built.
enum PendingReply {
    None,
    Ack,
    Nak(NakReason),
    IdReport,
    CapReport,
    LocalStatus,
    InputStatus,
    OutputStatus,
    ReaderStatus,
    /// REPLY_COM answers with the *current* settings; the new ones stored
    /// here are applied once the reply is on the wire.
    Com { address: u8, baud_rate: u32 },
    Event(OsdpEvent),
    MfgRep(OsdpCommandMfg),
    Ccrypt,
    RmacI,
}

enum Recv {
    Pending,
    IoError,
    Frame(Vec<u8>),
    Error(NakReason),
}

/// One OSDP peripheral on one bus.
pub struct PeripheralDevice {
    channel: Arc<dyn Channel>,
    phy: Phy,
    sc: SecureChannel,
    state: PdState,
    baud_rate: u32,
    id: PdId,
    caps: [PdCapability; OSDP_PD_CAP_SENTINEL],
    install_mode: bool,
    tamper: bool,
    power_failure: bool,
    events: BoundedQueue<OsdpEvent>,
    command_cb: Option<CommandCallback>,
    pending: PendingReply,
    cmd_id: u8,
}

impl PeripheralDevice {
    /// Bring up a PD session. With no `scbk` the device starts in install
    /// mode and accepts secure channels keyed off SCBK-D until a KEYSET
    /// provisions a real key.
    pub fn setup(info: PdInfo, scbk: Option<[u8; 16]>) -> Result<Self> {
        if info.address > OSDP_PD_MAX_ADDR {
            return Err(OsdpError::Setup(format!(
                "PD address {} out of range",
                info.address
            )));
        }
        if !baud_rate_supported(info.baud_rate) {
            return Err(OsdpError::Setup(format!(
                "unsupported baud rate {}",
                info.baud_rate
            )));
        }

        let mut caps = [PdCapability::default(); OSDP_PD_CAP_SENTINEL];
        for cap in &info.cap {
            let fc = cap.function_code as usize;
            if (1..OSDP_PD_CAP_SENTINEL).contains(&fc) {
                caps[fc] = *cap;
            }
        }
        // Implicit capabilities of this stack: CRC-16 check characters and
        // AES-128 secure channel with a default key.
        caps[CapFunction::CheckCharacterSupport as usize] =
            PdCapability::new(CapFunction::CheckCharacterSupport, 1, 0);
        caps[CapFunction::CommunicationSecurity as usize] =
            PdCapability::new(CapFunction::CommunicationSecurity, 1, 1);

        let install_mode = info.flags.install_mode || scbk.is_none();
        if scbk.is_none() {
            warn!(pd = info.address, "no SCBK provisioned; starting in install mode");
        }

        let mut phy = Phy::new(info.address, true);
        phy.skip_seq_check = info.flags.skip_seq_check;

        info!(pd = info.address, baud = info.baud_rate, "PD setup complete");
        Ok(Self {
            channel: info.channel,
            phy,
            sc: SecureChannel::new(scbk),
            state: PdState::Idle,
            baud_rate: info.baud_rate,
            id: info.id,
            caps,
            install_mode,
            tamper: false,
            power_failure: false,
            events: BoundedQueue::with_capacity(OSDP_CP_CMD_POOL_SIZE),
            command_cb: None,
            pending: PendingReply::None,
            cmd_id: 0,
        })
    }

    /// Install the handler invoked for every actionable command from the CP.
    pub fn set_command_callback(
        &mut self,
        cb: impl FnMut(u8, &OsdpCommand) -> CommandOutcome + Send + 'static,
    ) {
        self.command_cb = Some(Box::new(cb));
    }

    /// Queue an event for the CP to collect with its next POLL.
    pub fn notify_event(&mut self, event: OsdpEvent) -> Result<()> {
        self.events
            .push(event)
            .map_err(|_| OsdpError::QueueFull)
    }

    /// One scheduling tick: receive at most one command and answer it.
    pub fn refresh(&mut self) {
        match self.state {
            PdState::Err => {
                // Momentary state: drop any secure channel and start clean.
                self.sc.deactivate();
                self.phy.rx_clear();
                self.channel.flush();
                self.state = PdState::Idle;
            }
            PdState::Idle => match self.receive() {
                Recv::Pending => {
                    if self.phy.rx_stale() {
                        warn!(pd = self.phy.address, "receive timeout; dropping partial frame");
                        self.state = PdState::Err;
                    }
                }
                Recv::IoError => self.state = PdState::Err,
                Recv::Frame(data) => {
                    self.decode_command(&data);
                    self.reply();
                }
                Recv::Error(reason) => {
                    if reason == NakReason::SeqNum {
                        // A sequence break invalidates any secure session.
                        self.sc.deactivate();
                    }
                    self.pending = PendingReply::Nak(reason);
                    self.reply();
                }
            },
        }
    }

    pub fn address(&self) -> u8 {
        self.phy.address
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    pub fn is_sc_active(&self) -> bool {
        self.sc.active
    }

    fn receive(&mut self) -> Recv {
        if let Err(err) = self.phy.rx_feed(self.channel.as_ref()) {
            warn!(pd = self.phy.address, %err, "channel receive failed");
            return Recv::IoError;
        }
        match self.phy.decode(&mut self.sc) {
            Ok(DecodeStatus::Wait) | Ok(DecodeStatus::Skip) => Recv::Pending,
            Ok(DecodeStatus::Frame(frame)) => Recv::Frame(frame.data),
            Err(FrameError::Check) => Recv::Error(NakReason::MsgCheck),
            Err(FrameError::Seq) => Recv::Error(NakReason::SeqNum),
            Err(FrameError::ScCond) => Recv::Error(NakReason::ScConditions),
        }
    }

    fn dispatch(&mut self, cmd: &OsdpCommand) -> CommandOutcome {
        match self.command_cb.as_mut() {
            Some(cb) => cb(self.phy.address, cmd),
            None => CommandOutcome::Refused,
        }
    }

    fn client_uid(&self) -> [u8; 8] {
        let vendor = self.id.vendor_code.to_le_bytes();
        let serial = self.id.serial_number.to_le_bytes();
        [
            vendor[0], vendor[1], self.id.model, self.id.version, serial[0], serial[1], serial[2],
            serial[3],
        ]
    }

    fn decode_command(&mut self, data: &[u8]) {
        let Some(&cmd_id) = data.first() else {
            self.pending = PendingReply::Nak(NakReason::CmdLen);
            return;
        };
        self.cmd_id = cmd_id;
        let args = &data[1..];

        self.pending = match cmd_id {
            ids::POLL if args.is_empty() => match self.events.pop() {
                Some(event) => PendingReply::Event(event),
                None => PendingReply::Ack,
            },
            ids::LSTAT if args.is_empty() => PendingReply::LocalStatus,
            ids::ISTAT if args.is_empty() => PendingReply::InputStatus,
            ids::OSTAT if args.is_empty() => PendingReply::OutputStatus,
            ids::RSTAT if args.is_empty() => PendingReply::ReaderStatus,
            ids::ID if args.len() == 1 => PendingReply::IdReport,
            ids::CAP if args.len() == 1 => PendingReply::CapReport,
            ids::OUT if args.len() == 4 => {
                let cmd = OsdpCommand::Output(OsdpCommandOutput {
                    output_no: args[0],
                    control_code: args[1],
                    timer_count: u16::from_le_bytes([args[2], args[3]]),
                });
                self.simple_dispatch(&cmd)
            }
            ids::LED if args.len() == 14 => {
                let cmd = OsdpCommand::Led(OsdpCommandLed {
                    reader: args[0],
                    led_number: args[1],
                    temporary: OsdpLedParams {
                        control_code: args[2],
                        on_count: args[3],
                        off_count: args[4],
                        on_color: args[5],
                        off_color: args[6],
                        timer_count: u16::from_le_bytes([args[7], args[8]]),
                    },
                    permanent: OsdpLedParams {
                        control_code: args[9],
                        on_count: args[10],
                        off_count: args[11],
                        on_color: args[12],
                        off_color: args[13],
                        timer_count: 0,
                    },
                });
                self.simple_dispatch(&cmd)
            }
            ids::BUZ if args.len() == 5 => {
                let cmd = OsdpCommand::Buzzer(OsdpCommandBuzzer {
                    reader: args[0],
                    control_code: args[1],
                    on_count: args[2],
                    off_count: args[3],
                    rep_count: args[4],
                });
                self.simple_dispatch(&cmd)
            }
            ids::TEXT if args.len() >= 6 => {
                let length = args[5] as usize;
                if length > OSDP_CMD_TEXT_MAX_LEN || args.len() - 6 < length {
                    PendingReply::Nak(NakReason::CmdLen)
                } else {
                    match OsdpCommandText::new(args[0], args[1], &args[6..6 + length]) {
                        Ok(mut text) => {
                            text.temp_time = args[2];
                            text.offset_row = args[3];
                            text.offset_col = args[4];
                            self.simple_dispatch(&OsdpCommand::Text(text))
                        }
                        Err(_) => PendingReply::Nak(NakReason::CmdLen),
                    }
                }
            }
            ids::COMSET if args.len() == 5 => {
                let address = args[0];
                let baud_rate = u32::from_le_bytes([args[1], args[2], args[3], args[4]]);
                if address > OSDP_PD_MAX_ADDR || !baud_rate_supported(baud_rate) {
                    warn!(pd = self.phy.address, address, baud_rate, "COMSET rejected");
                    PendingReply::Nak(NakReason::Record)
                } else {
                    let cmd = OsdpCommand::Comset(OsdpCommandComset { address, baud_rate });
                    match self.dispatch(&cmd) {
                        CommandOutcome::Accepted | CommandOutcome::MfgReply(_) => {
                            PendingReply::Com { address, baud_rate }
                        }
                        CommandOutcome::Refused => PendingReply::Nak(NakReason::Record),
                    }
                }
            }
            ids::MFG if args.len() >= 4 => {
                let vendor_code =
                    u32::from_le_bytes([args[0], args[1], args[2], 0]);
                match OsdpCommandMfg::new(vendor_code, args[3], &args[4..]) {
                    Ok(mfg) => match self.dispatch(&OsdpCommand::Mfg(mfg)) {
                        CommandOutcome::MfgReply(reply) => PendingReply::MfgRep(reply),
                        CommandOutcome::Accepted => PendingReply::Ack,
                        CommandOutcome::Refused => PendingReply::Nak(NakReason::Record),
                    },
                    Err(_) => PendingReply::Nak(NakReason::CmdLen),
                }
            }
            ids::KEYSET if args.len() == 18 => self.decode_keyset(args),
            ids::CHLNG => {
                let sc_cap =
                    self.caps[CapFunction::CommunicationSecurity as usize].compliance_level;
                if sc_cap == 0 {
                    PendingReply::Nak(NakReason::ScUnsupported)
                } else if args.len() != 8 {
                    warn!(pd = self.phy.address, len = args.len(), "CHLNG length mismatch");
                    PendingReply::Nak(NakReason::CmdLen)
                } else {
                    let uid = self.client_uid();
                    self.sc.init_session(uid);
                    self.sc.use_scbk_d = self.install_mode;
                    self.sc.cp_random.copy_from_slice(args);
                    PendingReply::Ccrypt
                }
            }
            ids::SCRYPT if args.len() == 16 => {
                self.sc.cp_cryptogram.copy_from_slice(args);
                PendingReply::RmacI
            }
            ids::POLL | ids::LSTAT | ids::ISTAT | ids::OSTAT | ids::RSTAT | ids::ID
            | ids::CAP | ids::OUT | ids::LED | ids::BUZ | ids::TEXT | ids::COMSET
            | ids::MFG | ids::KEYSET | ids::SCRYPT => {
                warn!(pd = self.phy.address, cmd = cmd_id, len = args.len(), "command length mismatch");
                PendingReply::Nak(NakReason::CmdLen)
            }
            _ => {
                warn!(pd = self.phy.address, cmd = cmd_id, "unknown command");
                PendingReply::Nak(NakReason::CmdUnknown)
            }
        };

        if cmd_id != ids::POLL {
            debug!(pd = self.phy.address, cmd = format_args!("{cmd_id:02X}"), "command decoded");
        }
    }

    fn simple_dispatch(&mut self, cmd: &OsdpCommand) -> PendingReply {
        match self.dispatch(cmd) {
            CommandOutcome::Accepted | CommandOutcome::MfgReply(_) => PendingReply::Ack,
            CommandOutcome::Refused => PendingReply::Nak(NakReason::Record),
        }
    }

    fn decode_keyset(&mut self, args: &[u8]) -> PendingReply {
        if !self.sc.active {
            warn!(pd = self.phy.address, "KEYSET with secure channel inactive");
            return PendingReply::Nak(NakReason::ScConditions);
        }
        // Only key type 1 (SCBK) with a 16-byte key is defined.
        if args[0] != 1 || args[1] != 16 {
            warn!(pd = self.phy.address, key_type = args[0], key_len = args[1], "KEYSET invalid type/length");
            return PendingReply::Nak(NakReason::CmdLen);
        }
        let mut key = [0u8; 16];
        key.copy_from_slice(&args[2..18]);
        self.sc.scbk = Some(key);

        let cmd = OsdpCommand::Keyset(crate::cmd::OsdpCommandKeyset::new(key));
        let outcome = match self.command_cb.as_mut() {
            Some(cb) => cb(self.phy.address, &cmd),
            None => {
                warn!(pd = self.phy.address, "KEYSET without a command callback");
                CommandOutcome::Accepted
            }
        };
        if matches!(outcome, CommandOutcome::Refused) {
            return PendingReply::Nak(NakReason::Record);
        }
        self.sc.use_scbk_d = false;
        self.install_mode = false;
        PendingReply::Ack
    }

    /// Serialize the pending reply; returns the payload and the secure
    /// control block to wrap it in.
    fn build_reply(&mut self) -> Result<(Vec<u8>, ScbKind)> {
        let mut scb = if self.sc.active {
            ScbKind::Data
        } else {
            ScbKind::None
        };
        let mut buf = Vec::with_capacity(64);

        match std::mem::replace(&mut self.pending, PendingReply::None) {
            PendingReply::None => {
                return Err(OsdpError::Setup("no reply pending".into()));
            }
            PendingReply::Ack => buf.push(reply_ids::ACK),
            PendingReply::Nak(reason) => {
                buf.push(reply_ids::NAK);
                buf.push(reason as u8);
            }
            PendingReply::IdReport => {
                buf.push(reply_ids::PDID);
                buf.extend_from_slice(&self.id.vendor_code.to_le_bytes()[..3]);
                buf.push(self.id.model);
                buf.push(self.id.version);
                buf.extend_from_slice(&self.id.serial_number.to_le_bytes());
                // Firmware travels big-endian, unlike everything else.
                let fw = self.id.firmware_version.to_be_bytes();
                buf.extend_from_slice(&fw[1..4]);
            }
            PendingReply::CapReport => {
                buf.push(reply_ids::PDCAP);
                for (fc, cap) in self.caps.iter().enumerate().skip(1) {
                    if cap.function_code as usize != fc {
                        continue;
                    }
                    buf.push(cap.function_code);
                    buf.push(cap.compliance_level);
                    buf.push(cap.num_items);
                }
            }
            PendingReply::LocalStatus => {
                buf.push(reply_ids::LSTATR);
                buf.push(u8::from(self.tamper));
                buf.push(u8::from(self.power_failure));
            }
            PendingReply::InputStatus => {
                buf.push(reply_ids::ISTATR);
                let n = self.caps[CapFunction::ContactStatusMonitoring as usize].num_items;
                buf.resize(buf.len() + n as usize, 0);
            }
            PendingReply::OutputStatus => {
                buf.push(reply_ids::OSTATR);
                let n = self.caps[CapFunction::OutputControl as usize].num_items;
                buf.resize(buf.len() + n as usize, 0);
            }
            PendingReply::ReaderStatus => {
                buf.push(reply_ids::RSTATR);
                buf.push(0);
            }
            PendingReply::Com { address, baud_rate } => {
                buf.push(reply_ids::COM);
                buf.push(self.phy.address);
                buf.extend_from_slice(&self.baud_rate.to_le_bytes());
                // Applied only after the reply is on the wire.
                self.pending = PendingReply::Com { address, baud_rate };
            }
            PendingReply::Event(event) => self.build_event_reply(&event, &mut buf),
            PendingReply::MfgRep(mfg) => {
                buf.push(reply_ids::MFGREP);
                buf.extend_from_slice(&mfg.vendor_code.to_le_bytes()[..3]);
                buf.push(mfg.command);
                buf.extend_from_slice(mfg.data());
            }
            PendingReply::Ccrypt => {
                sc::fill_random(&mut self.sc.pd_random);
                self.sc.compute_session_keys()?;
                self.sc.pd_cryptogram = self.sc.compute_pd_cryptogram();
                buf.push(reply_ids::CCRYPT);
                buf.extend_from_slice(&self.sc.client_uid);
                buf.extend_from_slice(&self.sc.pd_random);
                buf.extend_from_slice(&self.sc.pd_cryptogram);
                scb = ScbKind::Ccrypt {
                    scbk_ok: !self.sc.use_scbk_d,
                };
            }
            PendingReply::RmacI => {
                let verified = self.sc.cp_cryptogram == self.sc.compute_cp_cryptogram();
                self.sc.r_mac = self.sc.compute_rmac_i();
                buf.push(reply_ids::RMAC_I);
                buf.extend_from_slice(&self.sc.r_mac);
                if verified {
                    self.sc.active = true;
                    if self.sc.use_scbk_d {
                        warn!(pd = self.phy.address, "secure channel active with SCBK-D");
                    } else {
                        info!(pd = self.phy.address, "secure channel active");
                    }
                } else {
                    warn!(pd = self.phy.address, "CP cryptogram verification failed");
                }
                scb = ScbKind::RmacI { verified };
            }
        }

        Ok((buf, scb))
    }

    fn build_event_reply(&self, event: &OsdpEvent, buf: &mut Vec<u8>) {
        match event {
            OsdpEvent::CardRead(card) => match card.format {
                OsdpCardFormat::RawUnspecified | OsdpCardFormat::RawWiegand => {
                    buf.push(reply_ids::RAW);
                    buf.push(card.reader_no);
                    buf.push(card.format as u8);
                    buf.extend_from_slice(&card.length().to_le_bytes());
                    buf.extend_from_slice(card.data());
                }
                OsdpCardFormat::Ascii => {
                    buf.push(reply_ids::FMT);
                    buf.push(card.reader_no);
                    buf.push(card.direction);
                    buf.push(card.length() as u8);
                    buf.extend_from_slice(card.data());
                }
            },
            OsdpEvent::KeyPress(keys) => {
                buf.push(reply_ids::KEYPAD);
                buf.push(keys.reader_no);
                buf.push(keys.digits().len() as u8);
                buf.extend_from_slice(keys.digits());
            }
            OsdpEvent::MfgReply(mfg) => {
                buf.push(reply_ids::MFGREP);
                buf.extend_from_slice(&mfg.vendor_code.to_le_bytes()[..3]);
                buf.push(mfg.command);
                buf.extend_from_slice(mfg.data());
            }
        }
    }

    fn reply(&mut self) {
        if let Err(err) = self.send_reply() {
            error!(pd = self.phy.address, %err, "failed to send reply");
            self.state = PdState::Err;
        }
    }

    fn send_reply(&mut self) -> Result<()> {
        let (payload, scb) = self.build_reply()?;
        let mut out = [0u8; OSDP_PACKET_BUF_SIZE];
        let n = self.phy.build_frame(&mut self.sc, scb, &payload, &mut out)?;
        let sent = self.channel.send(&out[..n])?;
        if sent != n {
            return Err(OsdpError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "short channel write",
            )));
        }
        if self.cmd_id != ids::POLL {
            trace!(pd = self.phy.address, frame = %phy::hex(&out[..n]), "PD sent");
        }

        // COMSET: switch to the commanded settings now that the reply
        // carrying the old ones is out.
        if let PendingReply::Com { address, baud_rate } =
            std::mem::replace(&mut self.pending, PendingReply::None)
        {
            self.phy.address = address;
            self.baud_rate = baud_rate;
            info!(pd = address, baud = baud_rate, "COMSET applied");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use crate::event::OsdpEventCardRead;

    const PD_ADDR: u8 = 65;

    /// A PD wired to a loopback channel plus a CP-side phy to hand-build
    /// command frames with.
    fn rig() -> (PeripheralDevice, MemoryChannel, Phy, SecureChannel) {
        let (cp_end, pd_end) = MemoryChannel::pair();
        let mut info = PdInfo::new(PD_ADDR, 9600, Arc::new(pd_end));
        info.id = PdId {
            version: 1,
            model: 2,
            vendor_code: 0x00A3A2A1,
            serial_number: 0xD4D3D2D1,
            firmware_version: 0x00E1E2E3,
        };
        let pd = PeripheralDevice::setup(info, Some([0x42; 16])).unwrap();
        let cp_phy = Phy::new(PD_ADDR, false);
        (pd, cp_end, cp_phy, SecureChannel::new(None))
    }

    fn send_cmd(cp_end: &MemoryChannel, cp_phy: &mut Phy, sc: &mut SecureChannel, payload: &[u8]) {
        let mut buf = [0u8; OSDP_PACKET_BUF_SIZE];
        let n = cp_phy.build_frame(sc, ScbKind::None, payload, &mut buf).unwrap();
        cp_end.send(&buf[..n]).unwrap();
    }

    fn read_reply(cp_end: &MemoryChannel) -> Vec<u8> {
        let mut buf = [0u8; OSDP_PACKET_BUF_SIZE];
        let n = cp_end.recv(&mut buf).unwrap();
        assert!(n > 0, "no reply on the wire");
        buf[..n].to_vec()
    }

    #[test]
    fn poll_drains_queued_card_read() {
        let (mut pd, cp_end, mut cp_phy, mut sc) = rig();
        let card = OsdpEventCardRead::new_raw(
            0,
            OsdpCardFormat::RawWiegand,
            26,
            &[0xCA, 0xFE, 0xBA, 0x80],
        )
        .unwrap();
        pd.notify_event(OsdpEvent::CardRead(card)).unwrap();

        send_cmd(&cp_end, &mut cp_phy, &mut sc, &[ids::POLL]);
        pd.refresh();

        let reply = read_reply(&cp_end);
        // header(6) | RAW reader format len_lsb len_msb data[4] | crc(2)
        assert_eq!(reply[6], reply_ids::RAW);
        assert_eq!(reply[7], 0); // reader
        assert_eq!(reply[8], OsdpCardFormat::RawWiegand as u8);
        assert_eq!(reply[9], 26); // bit count, low byte
        assert_eq!(reply[10], 0); // bit count, high byte
        assert_eq!(&reply[11..15], &[0xCA, 0xFE, 0xBA, 0x80]);

        // Queue is drained: the next POLL gets a bare ACK.
        send_cmd(&cp_end, &mut cp_phy, &mut sc, &[ids::POLL]);
        pd.refresh();
        assert_eq!(read_reply(&cp_end)[6], reply_ids::ACK);
    }

    #[test]
    fn text_at_limit_accepted_over_limit_nakked() {
        let (mut pd, cp_end, mut cp_phy, mut sc) = rig();
        let seen = std::sync::Arc::new(std::sync::Mutex::new(0usize));
        let seen_in_cb = seen.clone();
        pd.set_command_callback(move |_, cmd| {
            if let OsdpCommand::Text(text) = cmd {
                *seen_in_cb.lock().unwrap() = text.text().len();
            }
            CommandOutcome::Accepted
        });

        let mut payload = vec![ids::TEXT, 0, 1, 0, 0, 0, OSDP_CMD_TEXT_MAX_LEN as u8];
        payload.extend(std::iter::repeat(b'A').take(OSDP_CMD_TEXT_MAX_LEN));
        send_cmd(&cp_end, &mut cp_phy, &mut sc, &payload);
        pd.refresh();
        assert_eq!(read_reply(&cp_end)[6], reply_ids::ACK);
        assert_eq!(*seen.lock().unwrap(), OSDP_CMD_TEXT_MAX_LEN);

        let mut payload = vec![ids::TEXT, 0, 1, 0, 0, 0, (OSDP_CMD_TEXT_MAX_LEN + 1) as u8];
        payload.extend(std::iter::repeat(b'B').take(OSDP_CMD_TEXT_MAX_LEN + 1));
        send_cmd(&cp_end, &mut cp_phy, &mut sc, &payload);
        pd.refresh();
        let reply = read_reply(&cp_end);
        assert_eq!(reply[6], reply_ids::NAK);
        assert_eq!(reply[7], NakReason::CmdLen as u8);
    }

    #[test]
    fn comset_bad_baud_rejected_before_callback() {
        let (mut pd, cp_end, mut cp_phy, mut sc) = rig();
        let called = std::sync::Arc::new(std::sync::Mutex::new(false));
        let called_in_cb = called.clone();
        pd.set_command_callback(move |_, _| {
            *called_in_cb.lock().unwrap() = true;
            CommandOutcome::Accepted
        });

        let mut payload = vec![ids::COMSET, 33];
        payload.extend_from_slice(&19200u32.to_le_bytes());
        send_cmd(&cp_end, &mut cp_phy, &mut sc, &payload);
        pd.refresh();

        let reply = read_reply(&cp_end);
        assert_eq!(reply[6], reply_ids::NAK);
        assert_eq!(reply[7], NakReason::Record as u8);
        assert!(!*called.lock().unwrap());
        assert_eq!(pd.address(), PD_ADDR);
        assert_eq!(pd.baud_rate(), 9600);
    }

    #[test]
    fn comset_replies_old_settings_then_switches() {
        let (mut pd, cp_end, mut cp_phy, mut sc) = rig();
        pd.set_command_callback(|_, _| CommandOutcome::Accepted);

        let mut payload = vec![ids::COMSET, 102];
        payload.extend_from_slice(&38400u32.to_le_bytes());
        send_cmd(&cp_end, &mut cp_phy, &mut sc, &payload);
        pd.refresh();

        let reply = read_reply(&cp_end);
        assert_eq!(reply[6], reply_ids::COM);
        assert_eq!(reply[7], PD_ADDR); // old address
        assert_eq!(u32::from_le_bytes([reply[8], reply[9], reply[10], reply[11]]), 9600);
        assert_eq!(pd.address(), 102);
        assert_eq!(pd.baud_rate(), 38400);
    }

    #[test]
    fn keyset_while_sc_inactive_is_nakked_and_key_kept() {
        let (mut pd, cp_end, mut cp_phy, mut sc) = rig();
        let mut payload = vec![ids::KEYSET, 1, 16];
        payload.extend_from_slice(&[0xEE; 16]);
        send_cmd(&cp_end, &mut cp_phy, &mut sc, &payload);
        pd.refresh();

        let reply = read_reply(&cp_end);
        assert_eq!(reply[6], reply_ids::NAK);
        assert_eq!(reply[7], NakReason::ScConditions as u8);
        assert_eq!(pd.sc.scbk, Some([0x42; 16]));
    }

    #[test]
    fn unknown_command_is_nakked() {
        let (mut pd, cp_end, mut cp_phy, mut sc) = rig();
        send_cmd(&cp_end, &mut cp_phy, &mut sc, &[0x5E]);
        pd.refresh();
        let reply = read_reply(&cp_end);
        assert_eq!(reply[6], reply_ids::NAK);
        assert_eq!(reply[7], NakReason::CmdUnknown as u8);
    }

    #[test]
    fn chlng_without_sc_capability_is_nakked() {
        let (mut pd, cp_end, mut cp_phy, mut sc) = rig();
        pd.caps[CapFunction::CommunicationSecurity as usize].compliance_level = 0;
        send_cmd(&cp_end, &mut cp_phy, &mut sc, &[ids::CHLNG, 1, 2, 3, 4, 5, 6, 7, 8]);
        pd.refresh();
        let reply = read_reply(&cp_end);
        assert_eq!(reply[6], reply_ids::NAK);
        assert_eq!(reply[7], NakReason::ScUnsupported as u8);
    }
}
