//! Control-panel side: per-PD online state machine, multidrop scheduling
//! and reply dispatch.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::channel::Channel;
use crate::cmd::{ids, reply_ids, OsdpCommand};
use crate::error::{OsdpError, Result};
use crate::event::{
    OsdpCardFormat, OsdpEvent, OsdpEventCardRead, OsdpEventKeyPress, OsdpEventMfgReply,
};
use crate::phy::{self, DecodeStatus, DecodedFrame, Phy, ScbKind};
use crate::queue::BoundedQueue;
use crate::sc::{derive_scbk, fill_random, SecureChannel};
use crate::types::{
    baud_rate_supported, CapFunction, NakReason, PdCapability, PdId, PdInfo,
    OSDP_CP_CMD_POOL_SIZE, OSDP_NAK_FLOOD_LIMIT, OSDP_ONLINE_RETRY_WAIT_MS,
    OSDP_PACKET_BUF_SIZE, OSDP_PD_CAP_SENTINEL, OSDP_PD_MAX_ADDR, OSDP_PD_POLL_TIMEOUT_MS,
    OSDP_RESP_TOUT_MS,
};

pub type EventCallback = Box<dyn FnMut(usize, &OsdpEvent) + Send>;

/// Per-PD progress through the online handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CpState {
    Init,
    IdReq,
    CapReq,
    ScChlng,
    ScScrypt,
    Online,
    Offline,
}

struct InFlight {
    id: u8,
    sent_at: Instant,
    /// The application command this transmission carries, when any; used to
    /// commit KEYSET/COMSET side effects once the PD confirms.
    cmd: Option<OsdpCommand>,
}

struct CpPd {
    channel: Arc<dyn Channel>,
    phy: Phy,
    sc: SecureChannel,
    state: CpState,
    baud_rate: u32,
    id: PdId,
    caps: [PdCapability; OSDP_PD_CAP_SENTINEL],
    cmd_queue: BoundedQueue<OsdpCommand>,
    in_flight: Option<InFlight>,
    last_poll: Option<Instant>,
    offline_since: Option<Instant>,
    nak_count: u32,
    /// A master key or per-PD SCBK was configured, so the handshake should
    /// attempt a secure channel.
    sc_configured: bool,
    scbk_d_tried: bool,
}

impl CpPd {
    fn poll_due(&self) -> bool {
        self.last_poll
            .map(|t| t.elapsed() >= Duration::from_millis(OSDP_PD_POLL_TIMEOUT_MS))
            .unwrap_or(true)
    }
}

/// One OSDP bus master driving `num_pd` peripherals.
///
/// Single-threaded by design: all protocol work happens inside
/// [`ControlPanel::refresh`], which the application calls on a tick.
/// Teardown is `Drop`.
pub struct ControlPanel {
    pds: Vec<CpPd>,
    cursor: usize,
    master_key: Option<[u8; 16]>,
    event_cb: Option<EventCallback>,
}

impl ControlPanel {
    /// Bring up a CP context for the given PDs. When `master_key` is set,
    /// per-PD base keys are derived from it during the secure channel
    /// handshake; otherwise each PD's `scbk` from its `PdInfo` is used.
    pub fn setup(infos: Vec<PdInfo>, master_key: Option<[u8; 16]>) -> Result<Self> {
        if infos.is_empty() {
            return Err(OsdpError::Setup("at least one PD is required".into()));
        }
        let mut seen = Vec::with_capacity(infos.len());
        for info in &infos {
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
            if seen.contains(&info.address) {
                return Err(OsdpError::Setup(format!(
                    "duplicate PD address {}",
                    info.address
                )));
            }
            seen.push(info.address);
        }

        let pds = infos
            .into_iter()
            .map(|info| {
                let mut phy = Phy::new(info.address, false);
                phy.skip_seq_check = info.flags.skip_seq_check;
                let sc_configured = master_key.is_some() || info.scbk.is_some();
                CpPd {
                    channel: info.channel,
                    phy,
                    sc: SecureChannel::new(info.scbk),
                    state: CpState::Init,
                    baud_rate: info.baud_rate,
                    id: info.id,
                    caps: [PdCapability::default(); OSDP_PD_CAP_SENTINEL],
                    cmd_queue: BoundedQueue::with_capacity(OSDP_CP_CMD_POOL_SIZE),
                    in_flight: None,
                    last_poll: None,
                    offline_since: None,
                    nak_count: 0,
                    sc_configured,
                    scbk_d_tried: false,
                }
            })
            .collect::<Vec<_>>();

        info!(num_pd = pds.len(), "CP setup complete");
        Ok(Self {
            pds,
            cursor: 0,
            master_key,
            event_cb: None,
        })
    }

    /// Install the handler invoked for events collected from any PD. The
    /// first argument is the PD's index (the bit position in the status
    /// masks), not its bus address.
    pub fn set_event_callback(&mut self, cb: impl FnMut(usize, &OsdpEvent) + Send + 'static) {
        self.event_cb = Some(Box::new(cb));
    }

    /// One scheduling tick: walk the PDs round-robin, doing at most one
    /// command/reply step for each.
    pub fn refresh(&mut self) {
        let n = self.pds.len();
        for k in 0..n {
            let idx = (self.cursor + k) % n;
            self.service(idx);
        }
        self.cursor = (self.cursor + 1) % n;
    }

    /// Queue a command for one PD. Fails fast when the queue is full, when
    /// the index is bad, or when a KEYSET is requested without an active
    /// secure channel.
    pub fn send_command(&mut self, pd_index: usize, cmd: OsdpCommand) -> Result<()> {
        let pd = self
            .pds
            .get_mut(pd_index)
            .ok_or(OsdpError::PdIndex(pd_index))?;
        match &cmd {
            OsdpCommand::Keyset(_) if !pd.sc.active => {
                return Err(OsdpError::SecureChannelRequired);
            }
            OsdpCommand::Comset(c) => {
                if c.address > OSDP_PD_MAX_ADDR || !baud_rate_supported(c.baud_rate) {
                    return Err(OsdpError::Setup(format!(
                        "COMSET to address {} baud {} is invalid",
                        c.address, c.baud_rate
                    )));
                }
            }
            _ => {}
        }
        pd.cmd_queue.push(cmd).map_err(|_| OsdpError::QueueFull)
    }

    /// Bit *i* set iff PD *i* is online.
    pub fn status_mask(&self) -> u32 {
        let mut mask = 0;
        for (i, pd) in self.pds.iter().enumerate().take(32) {
            if pd.state == CpState::Online {
                mask |= 1 << i;
            }
        }
        mask
    }

    /// Bit *i* set iff PD *i* is online with an active secure channel.
    pub fn sc_status_mask(&self) -> u32 {
        let mut mask = 0;
        for (i, pd) in self.pds.iter().enumerate().take(32) {
            if pd.state == CpState::Online && pd.sc.active {
                mask |= 1 << i;
            }
        }
        mask
    }

    /// Identity block learned from the PD's ID report.
    pub fn pd_identity(&self, pd_index: usize) -> Result<PdId> {
        self.pds
            .get(pd_index)
            .map(|pd| pd.id)
            .ok_or(OsdpError::PdIndex(pd_index))
    }

    /// Current bus address and baud rate for one PD; COMSET updates both.
    pub fn pd_comms(&self, pd_index: usize) -> Result<(u8, u32)> {
        self.pds
            .get(pd_index)
            .map(|pd| (pd.phy.address, pd.baud_rate))
            .ok_or(OsdpError::PdIndex(pd_index))
    }

    /// Capability entries learned from the PD's CAP report.
    pub fn pd_capabilities(&self, pd_index: usize) -> Result<Vec<PdCapability>> {
        let pd = self
            .pds
            .get(pd_index)
            .ok_or(OsdpError::PdIndex(pd_index))?;
        Ok(pd
            .caps
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(fc, cap)| cap.function_code as usize == *fc)
            .map(|(_, cap)| *cap)
            .collect())
    }

    fn service(&mut self, idx: usize) {
        if self.pds[idx].in_flight.is_some() {
            self.poll_response(idx);
        }
        if self.pds[idx].in_flight.is_some() {
            return; // still waiting for a reply
        }

        if self.pds[idx].state == CpState::Offline {
            let rested = self.pds[idx]
                .offline_since
                .map(|t| t.elapsed() >= Duration::from_millis(OSDP_ONLINE_RETRY_WAIT_MS))
                .unwrap_or(true);
            if !rested {
                return;
            }
            let pd = &mut self.pds[idx];
            pd.phy.reset();
            pd.sc.deactivate();
            pd.nak_count = 0;
            pd.scbk_d_tried = false;
            pd.state = CpState::Init;
        }

        if self.channel_busy(idx) {
            return; // half-duplex bus: one transaction at a time
        }

        match self.pds[idx].state {
            CpState::Init => {
                // Drop anything a half-dead PD may have left on the wire.
                // Safe on a shared bus: channel_busy() above guarantees no
                // other PD has a transaction in flight here.
                self.pds[idx].channel.flush();
                self.pds[idx].phy.reset();
                self.pds[idx].state = CpState::IdReq;
                self.send_frame(idx, ids::ID, &[0], None, None);
            }
            CpState::Online => {
                if let Some(cmd) = self.pds[idx].cmd_queue.pop() {
                    let id = cmd.id();
                    let mut data = Vec::with_capacity(32);
                    cmd.encode(&mut data);
                    self.send_frame(idx, id, &data, None, Some(cmd));
                } else if self.pds[idx].poll_due() {
                    self.pds[idx].last_poll = Some(Instant::now());
                    self.send_frame(idx, ids::POLL, &[], None, None);
                }
            }
            // Handshake states transmit from reply handling; reaching here
            // without an in-flight command means the exchange was lost.
            _ => self.go_offline(idx),
        }
    }

    fn channel_busy(&self, idx: usize) -> bool {
        let ch = &self.pds[idx].channel;
        self.pds
            .iter()
            .enumerate()
            .any(|(j, pd)| j != idx && pd.in_flight.is_some() && Arc::ptr_eq(ch, &pd.channel))
    }

    fn poll_response(&mut self, idx: usize) {
        let pd = &mut self.pds[idx];
        if let Err(err) = pd.phy.rx_feed(pd.channel.as_ref()) {
            warn!(pd = idx, %err, "channel receive failed");
            self.go_offline(idx);
            return;
        }
        match pd.phy.decode(&mut pd.sc) {
            Ok(DecodeStatus::Wait) | Ok(DecodeStatus::Skip) => {
                let timed_out = pd
                    .in_flight
                    .as_ref()
                    .map(|f| f.sent_at.elapsed() >= Duration::from_millis(OSDP_RESP_TOUT_MS))
                    .unwrap_or(false);
                if timed_out {
                    warn!(pd = idx, "response timeout");
                    self.go_offline(idx);
                }
            }
            Ok(DecodeStatus::Frame(frame)) => {
                if let Some(sent) = self.pds[idx].in_flight.take() {
                    self.handle_reply(idx, sent, frame);
                }
            }
            Err(err) => {
                warn!(pd = idx, ?err, "bad reply frame");
                self.go_offline(idx);
            }
        }
    }

    fn go_offline(&mut self, idx: usize) {
        let pd = &mut self.pds[idx];
        pd.state = CpState::Offline;
        pd.sc.deactivate();
        pd.in_flight = None;
        pd.phy.rx_clear();
        pd.offline_since = Some(Instant::now());
        warn!(pd = idx, "PD offline");
    }

    fn go_online(&mut self, idx: usize) {
        let pd = &mut self.pds[idx];
        pd.state = CpState::Online;
        pd.last_poll = None;
        pd.nak_count = 0;
        info!(pd = idx, sc = pd.sc.active, "PD online");
    }

    fn send_frame(
        &mut self,
        idx: usize,
        id: u8,
        data: &[u8],
        scb: Option<ScbKind>,
        cmd: Option<OsdpCommand>,
    ) {
        let pd = &mut self.pds[idx];
        let mut payload = Vec::with_capacity(1 + data.len());
        payload.push(id);
        payload.extend_from_slice(data);
        let scb = scb.unwrap_or(if pd.sc.active {
            ScbKind::Data
        } else {
            ScbKind::None
        });

        let mut out = [0u8; OSDP_PACKET_BUF_SIZE];
        let sent = pd
            .phy
            .build_frame(&mut pd.sc, scb, &payload, &mut out)
            .and_then(|n| {
                let written = pd.channel.send(&out[..n])?;
                if written != n {
                    return Err(OsdpError::Io(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "short channel write",
                    )));
                }
                if id != ids::POLL {
                    trace!(pd = idx, frame = %phy::hex(&out[..n]), "CP sent");
                }
                Ok(())
            });
        match sent {
            Ok(()) => {
                self.pds[idx].in_flight = Some(InFlight {
                    id,
                    sent_at: Instant::now(),
                    cmd,
                });
            }
            Err(err) => {
                warn!(pd = idx, %err, "transmit failed");
                self.go_offline(idx);
            }
        }
    }

    fn start_chlng(&mut self, idx: usize) {
        let pd = &mut self.pds[idx];
        pd.sc.init_session([0; 8]);
        fill_random(&mut pd.sc.cp_random);
        let cp_random = pd.sc.cp_random;
        let scbk_d = pd.sc.use_scbk_d;
        pd.state = CpState::ScChlng;
        self.send_frame(
            idx,
            ids::CHLNG,
            &cp_random,
            Some(ScbKind::Chlng { scbk_d }),
            None,
        );
    }

    fn handle_reply(&mut self, idx: usize, sent: InFlight, frame: DecodedFrame) {
        let Some(&reply_id) = frame.data.first() else {
            self.go_offline(idx);
            return;
        };
        let args = &frame.data[1..];
        let state = self.pds[idx].state;

        if sent.id != ids::POLL {
            debug!(
                pd = idx,
                cmd = format_args!("{:02X}", sent.id),
                reply = format_args!("{reply_id:02X}"),
                "reply"
            );
        }

        match reply_id {
            reply_ids::ACK if state == CpState::Online => {
                if let Some(OsdpCommand::Keyset(keyset)) = &sent.cmd {
                    // The PD accepted the new base key; mirror it.
                    let pd = &mut self.pds[idx];
                    pd.sc.scbk = Some(*keyset.key());
                    pd.sc.use_scbk_d = false;
                    info!(pd = idx, "SCBK updated");
                }
                self.pds[idx].nak_count = 0;
            }
            reply_ids::NAK => {
                let reason = args.first().copied().and_then(NakReason::from_code);
                warn!(pd = idx, ?reason, "PD NAK");
                if state != CpState::Online {
                    self.go_offline(idx);
                    return;
                }
                let pd = &mut self.pds[idx];
                pd.nak_count += 1;
                if reason == Some(NakReason::SeqNum) {
                    // Restart the sequence; the PD accepts 0 any time.
                    pd.phy.reset();
                    pd.sc.deactivate();
                }
                if pd.nak_count >= OSDP_NAK_FLOOD_LIMIT {
                    self.go_offline(idx);
                }
            }
            reply_ids::PDID if state == CpState::IdReq && args.len() == 12 => {
                let pd = &mut self.pds[idx];
                pd.id = PdId {
                    vendor_code: u32::from_le_bytes([args[0], args[1], args[2], 0]),
                    model: args[3],
                    version: args[4],
                    serial_number: u32::from_le_bytes([args[5], args[6], args[7], args[8]]),
                    firmware_version: u32::from_be_bytes([0, args[9], args[10], args[11]]),
                };
                pd.state = CpState::CapReq;
                self.send_frame(idx, ids::CAP, &[0], None, None);
            }
            reply_ids::PDCAP if state == CpState::CapReq && args.len() % 3 == 0 => {
                {
                    let pd = &mut self.pds[idx];
                    for entry in args.chunks_exact(3) {
                        let fc = entry[0] as usize;
                        if (1..OSDP_PD_CAP_SENTINEL).contains(&fc) {
                            pd.caps[fc] = PdCapability {
                                function_code: entry[0],
                                compliance_level: entry[1],
                                num_items: entry[2],
                            };
                        }
                    }
                }
                let pd = &self.pds[idx];
                let sc_capable =
                    pd.caps[CapFunction::CommunicationSecurity as usize].compliance_level != 0;
                if pd.sc_configured && sc_capable {
                    self.start_chlng(idx);
                } else {
                    if pd.sc_configured {
                        warn!(pd = idx, "PD lacks secure channel capability");
                    }
                    self.go_online(idx);
                }
            }
            reply_ids::CCRYPT
                if state == CpState::ScChlng && args.len() == 32 && frame.scs == Some(0x12) =>
            {
                self.handle_ccrypt(idx, args, frame.scb_data);
            }
            reply_ids::RMAC_I
                if state == CpState::ScScrypt && args.len() == 16 && frame.scs == Some(0x14) =>
            {
                self.handle_rmac_i(idx, args, frame.scb_data);
            }
            reply_ids::RAW if state == CpState::Online && args.len() >= 4 => {
                let nr_bits = u16::from_le_bytes([args[2], args[3]]);
                let nr_bytes = (nr_bits as usize + 7) / 8;
                let format = match args[1] {
                    0 => OsdpCardFormat::RawUnspecified,
                    1 => OsdpCardFormat::RawWiegand,
                    _ => {
                        warn!(pd = idx, format = args[1], "unknown card format");
                        return;
                    }
                };
                if args.len() < 4 + nr_bytes {
                    warn!(pd = idx, "short RAW reply");
                    return;
                }
                match OsdpEventCardRead::new_raw(args[0], format, nr_bits, &args[4..4 + nr_bytes])
                {
                    Ok(card) => self.emit_event(idx, OsdpEvent::CardRead(card)),
                    Err(err) => warn!(pd = idx, %err, "RAW reply rejected"),
                }
            }
            reply_ids::FMT if state == CpState::Online && args.len() >= 3 => {
                let len = args[2] as usize;
                if args.len() < 3 + len {
                    warn!(pd = idx, "short FMT reply");
                    return;
                }
                match OsdpEventCardRead::new_ascii(args[0], args[1], &args[3..3 + len]) {
                    Ok(card) => self.emit_event(idx, OsdpEvent::CardRead(card)),
                    Err(err) => warn!(pd = idx, %err, "FMT reply rejected"),
                }
            }
            reply_ids::KEYPAD if state == CpState::Online && args.len() >= 2 => {
                let len = args[1] as usize;
                if args.len() < 2 + len {
                    warn!(pd = idx, "short KEYPAD reply");
                    return;
                }
                match OsdpEventKeyPress::new(args[0], &args[2..2 + len]) {
                    Ok(keys) => self.emit_event(idx, OsdpEvent::KeyPress(keys)),
                    Err(err) => warn!(pd = idx, %err, "KEYPAD reply rejected"),
                }
            }
            reply_ids::MFGREP if state == CpState::Online && args.len() >= 4 => {
                let vendor_code = u32::from_le_bytes([args[0], args[1], args[2], 0]);
                match OsdpEventMfgReply::new(vendor_code, args[3], &args[4..]) {
                    Ok(mfg) => self.emit_event(idx, OsdpEvent::MfgReply(mfg)),
                    Err(err) => warn!(pd = idx, %err, "MFGREP reply rejected"),
                }
            }
            reply_ids::COM if args.len() == 5 => {
                let old_address = args[0];
                let old_baud = u32::from_le_bytes([args[1], args[2], args[3], args[4]]);
                if let Some(OsdpCommand::Comset(comset)) = &sent.cmd {
                    let (address, baud_rate) = (comset.address, comset.baud_rate);
                    let pd = &mut self.pds[idx];
                    pd.phy.address = address;
                    pd.baud_rate = baud_rate;
                    info!(
                        pd = idx,
                        old_address, old_baud, address, baud = baud_rate, "COMSET applied"
                    );
                }
                self.pds[idx].nak_count = 0;
            }
            reply_ids::LSTATR | reply_ids::ISTATR | reply_ids::OSTATR | reply_ids::RSTATR
                if state == CpState::Online =>
            {
                debug!(pd = idx, reply = format_args!("{reply_id:02X}"), "status report");
                self.pds[idx].nak_count = 0;
            }
            _ => {
                warn!(
                    pd = idx,
                    reply = format_args!("{reply_id:02X}"),
                    ?state,
                    "unexpected reply"
                );
                self.go_offline(idx);
            }
        }
    }

    fn handle_ccrypt(&mut self, idx: usize, args: &[u8], scb_data: Option<u8>) {
        let master_key = self.master_key;
        {
            let pd = &mut self.pds[idx];
            pd.sc.client_uid.copy_from_slice(&args[..8]);
            pd.sc.pd_random.copy_from_slice(&args[8..16]);
            pd.sc.pd_cryptogram.copy_from_slice(&args[16..32]);

            if scb_data == Some(0) && !pd.sc.use_scbk_d {
                warn!(pd = idx, "PD is in install mode; falling back to SCBK-D");
                pd.sc.use_scbk_d = true;
            }
            if !pd.sc.use_scbk_d {
                if let Some(mk) = master_key {
                    pd.sc.scbk = Some(derive_scbk(&mk, &pd.sc.client_uid));
                }
            }
            if pd.sc.compute_session_keys().is_err() {
                warn!(pd = idx, "no usable SCBK; continuing without secure channel");
                self.go_online(idx);
                return;
            }
        }

        let verified = {
            let pd = &self.pds[idx];
            pd.sc.compute_pd_cryptogram() == pd.sc.pd_cryptogram
        };
        if !verified {
            warn!(pd = idx, "PD cryptogram verification failed");
            self.retry_or_go_online(idx);
            return;
        }

        let (cp_cryptogram, scbk_d) = {
            let pd = &mut self.pds[idx];
            pd.sc.cp_cryptogram = pd.sc.compute_cp_cryptogram();
            (pd.sc.cp_cryptogram, pd.sc.use_scbk_d)
        };
        self.pds[idx].state = CpState::ScScrypt;
        self.send_frame(
            idx,
            ids::SCRYPT,
            &cp_cryptogram,
            Some(ScbKind::Scrypt { scbk_d }),
            None,
        );
    }

    fn handle_rmac_i(&mut self, idx: usize, args: &[u8], scb_data: Option<u8>) {
        if scb_data == Some(1) {
            let pd = &mut self.pds[idx];
            pd.sc.r_mac.copy_from_slice(args);
            pd.sc.active = true;
            if pd.sc.use_scbk_d {
                warn!(pd = idx, "secure channel active with SCBK-D");
            }
            self.go_online(idx);
        } else {
            warn!(pd = idx, "PD rejected the CP cryptogram");
            self.retry_or_go_online(idx);
        }
    }

    /// One shot at SCBK-D for PDs still in install mode; otherwise come up
    /// without a secure channel rather than flap forever.
    fn retry_or_go_online(&mut self, idx: usize) {
        let retry = {
            let pd = &mut self.pds[idx];
            if !pd.scbk_d_tried {
                pd.scbk_d_tried = true;
                pd.sc.use_scbk_d = true;
                true
            } else {
                pd.sc.active = false;
                false
            }
        };
        if retry {
            self.start_chlng(idx);
        } else {
            warn!(pd = idx, "secure channel could not be established");
            self.go_online(idx);
        }
    }

    fn emit_event(&mut self, idx: usize, event: OsdpEvent) {
        self.pds[idx].nak_count = 0;
        if let Some(cb) = self.event_cb.as_mut() {
            cb(idx, &event);
        }
    }
}
