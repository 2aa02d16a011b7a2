//! Secure channel handshake and encrypted traffic, end to end.

use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use osdp_lib::{
    Channel, CommandOutcome, ControlPanel, MemoryChannel, OsdpCommand, OsdpCommandKeyset,
    OsdpCommandText, PdInfo, PeripheralDevice,
};

/// Wraps a channel end and records every frame the CP puts on the wire.
struct Recording {
    inner: MemoryChannel,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl Recording {
    fn new(inner: MemoryChannel) -> Self {
        Self {
            inner,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Command code of each recorded frame (skipping over any SCB).
    fn command_ids(&self) -> Vec<u8> {
        self.sent
            .lock()
            .expect("sent")
            .iter()
            .map(|frame| {
                let data_off = if frame[5] & 0x08 != 0 {
                    6 + frame[6] as usize
                } else {
                    6
                };
                frame[data_off]
            })
            .collect()
    }
}

impl Channel for Recording {
    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.sent.lock().expect("sent").push(buf.to_vec());
        self.inner.send(buf)
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.recv(buf)
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

fn step_until(
    cp: &mut ControlPanel,
    pd: &mut PeripheralDevice,
    timeout: Duration,
    mut pred: impl FnMut(&ControlPanel, &PeripheralDevice) -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        cp.refresh();
        pd.refresh();
        if pred(cp, pd) {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

#[test]
fn shared_scbk_brings_up_a_secure_channel() {
    let scbk = [0x13u8; 16];
    let (cp_end, pd_end) = MemoryChannel::pair();
    let recorder = Arc::new(Recording::new(cp_end));

    let mut cp_info = PdInfo::new(44, 9600, recorder.clone());
    cp_info.scbk = Some(scbk);
    let pd_info = PdInfo::new(44, 9600, Arc::new(pd_end));

    let mut cp = ControlPanel::setup(vec![cp_info], None).expect("cp setup");
    let mut pd = PeripheralDevice::setup(pd_info, Some(scbk)).expect("pd setup");

    assert!(
        step_until(&mut cp, &mut pd, Duration::from_secs(1), |cp, pd| {
            cp.sc_status_mask() == 1 && pd.is_sc_active()
        }),
        "secure channel never came up"
    );
    assert_eq!(cp.status_mask(), 1);

    // The handshake runs ID, CAP, CHLNG, SCRYPT in that order.
    let ids = recorder.command_ids();
    assert_eq!(&ids[..4], &[0x61, 0x62, 0x76, 0x77]);

    // Everything after the handshake carries an SCB (SCS_15 polls or
    // SCS_17 commands).
    let _ = step_until(&mut cp, &mut pd, Duration::from_millis(200), |_, _| false);
    let frames = recorder.sent.lock().expect("sent");
    let post_handshake = &frames[4..];
    assert!(!post_handshake.is_empty());
    for frame in post_handshake {
        assert_eq!(frame[5] & 0x08, 0x08, "frame without SCB after handshake");
        assert!(matches!(frame[7], 0x15 | 0x17));
    }
}

#[test]
fn commands_flow_encrypted_once_sc_is_active() {
    let scbk = [0x77u8; 16];
    let (cp_end, pd_end) = MemoryChannel::pair();
    let mut cp_info = PdInfo::new(3, 9600, Arc::new(cp_end));
    cp_info.scbk = Some(scbk);
    let pd_info = PdInfo::new(3, 9600, Arc::new(pd_end));

    let mut cp = ControlPanel::setup(vec![cp_info], None).expect("cp setup");
    let mut pd = PeripheralDevice::setup(pd_info, Some(scbk)).expect("pd setup");

    let texts: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = texts.clone();
    pd.set_command_callback(move |_, cmd| {
        if let OsdpCommand::Text(text) = cmd {
            sink.lock().expect("texts").push(text.text().to_vec());
        }
        CommandOutcome::Accepted
    });

    assert!(step_until(&mut cp, &mut pd, Duration::from_secs(1), |cp, _| {
        cp.sc_status_mask() == 1
    }));

    let text = OsdpCommandText::new(0, 1, b"OPEN DOOR 3").expect("text");
    cp.send_command(0, OsdpCommand::Text(text)).expect("queue");

    assert!(
        step_until(&mut cp, &mut pd, Duration::from_secs(1), |_, _| {
            !texts.lock().expect("texts").is_empty()
        }),
        "text never arrived through the secure channel"
    );
    assert_eq!(texts.lock().expect("texts")[0], b"OPEN DOOR 3");
}

#[test]
fn install_mode_pd_pairs_with_master_keyed_cp() {
    // PD has no SCBK yet; CP holds a master key. The handshake falls back
    // to SCBK-D and still comes up.
    let (cp_end, pd_end) = MemoryChannel::pair();
    let cp_info = PdInfo::new(17, 9600, Arc::new(cp_end));
    let pd_info = PdInfo::new(17, 9600, Arc::new(pd_end));

    let mut cp = ControlPanel::setup(vec![cp_info], Some([0xAB; 16])).expect("cp setup");
    let mut pd = PeripheralDevice::setup(pd_info, None).expect("pd setup");

    assert!(
        step_until(&mut cp, &mut pd, Duration::from_secs(1), |cp, _| {
            cp.sc_status_mask() == 1
        }),
        "install-mode pairing failed"
    );
}

#[test]
fn keyset_provisions_a_new_key_that_survives_rehandshake() {
    let (cp_end, pd_end) = MemoryChannel::pair();
    let cp_info = PdInfo::new(17, 9600, Arc::new(cp_end));
    let pd_info = PdInfo::new(17, 9600, Arc::new(pd_end));

    let mut cp = ControlPanel::setup(vec![cp_info], Some([0xAB; 16])).expect("cp setup");
    let mut pd = PeripheralDevice::setup(pd_info, None).expect("pd setup");
    assert!(step_until(&mut cp, &mut pd, Duration::from_secs(1), |cp, _| {
        cp.sc_status_mask() == 1
    }));

    cp.send_command(0, OsdpCommand::Keyset(OsdpCommandKeyset::new([0xC4; 16])))
        .expect("keyset");
    let _ = step_until(&mut cp, &mut pd, Duration::from_millis(200), |_, _| false);
    assert_eq!(cp.sc_status_mask(), 1, "keyset broke the session");

    // Starve the CP until it drops the PD, then let them re-pair: both
    // sides must now hold the provisioned key.
    let deadline = Instant::now() + Duration::from_secs(2);
    while cp.status_mask() != 0 && Instant::now() < deadline {
        cp.refresh();
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(cp.status_mask(), 0);

    assert!(
        step_until(&mut cp, &mut pd, Duration::from_secs(3), |cp, pd| {
            cp.sc_status_mask() == 1 && pd.is_sc_active()
        }),
        "re-handshake with the provisioned key failed"
    );
}

#[test]
fn keyset_requires_an_active_secure_channel() {
    let (cp_end, _pd_end) = MemoryChannel::pair();
    let cp_info = PdInfo::new(2, 9600, Arc::new(cp_end));
    let mut cp = ControlPanel::setup(vec![cp_info], None).expect("cp setup");
    let err = cp.send_command(0, OsdpCommand::Keyset(OsdpCommandKeyset::new([0; 16])));
    assert!(matches!(err, Err(osdp_lib::OsdpError::SecureChannelRequired)));
}

#[test]
fn key_mismatch_degrades_to_plaintext_polling() {
    let (cp_end, pd_end) = MemoryChannel::pair();
    let mut cp_info = PdInfo::new(29, 9600, Arc::new(cp_end));
    cp_info.scbk = Some([0x01; 16]);
    let pd_info = PdInfo::new(29, 9600, Arc::new(pd_end));

    let mut cp = ControlPanel::setup(vec![cp_info], None).expect("cp setup");
    // The PD holds a different key; cryptogram verification must fail.
    let mut pd = PeripheralDevice::setup(pd_info, Some([0x02; 16])).expect("pd setup");

    assert!(
        step_until(&mut cp, &mut pd, Duration::from_secs(2), |cp, _| {
            cp.status_mask() == 1
        }),
        "PD never came online"
    );
    assert_eq!(cp.sc_status_mask(), 0, "mismatched keys must not activate SC");
}
