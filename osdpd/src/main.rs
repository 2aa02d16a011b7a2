#![forbid(unsafe_code)]

mod config;
mod unix_channel;

use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use osdp_lib::{
    CommandOutcome, ControlPanel, OsdpEvent, PdId, PdInfo, PeripheralDevice,
};

use crate::config::{load_from_path, Config, Mode, PdConfig};
use crate::unix_channel::UnixChannel;

const TICK: Duration = Duration::from_millis(10);

#[derive(Parser, Debug)]
#[command(author, version, about = "OSDP bridge daemon (CP or PD over a UNIX socket)")]
struct Cli {
    /// Path to configuration TOML file
    #[arg(short, long, value_name = "FILE", default_value = "osdpd.toml")]
    config: PathBuf,
}

fn main() {
    init_tracing();

    let cli = Cli::parse();
    let cfg = match load_from_path(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(%err, "failed to load configuration");
            std::process::exit(1);
        }
    };
    info!(mode = ?cfg.mode, device = %cfg.device.display(), pds = cfg.pds.len(), "configuration loaded");

    let result = match cfg.mode {
        Mode::Cp => run_cp(&cfg),
        Mode::Pd => run_pd(&cfg),
    };
    if let Err(err) = result {
        error!(%err, "daemon exited with error");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

fn pd_info(pd: &PdConfig, channel: Arc<UnixChannel>) -> Result<PdInfo, Box<dyn std::error::Error>> {
    let mut info = PdInfo::new(pd.address, pd.baud_rate, channel);
    info.id = PdId {
        version: 1,
        model: pd.model,
        vendor_code: pd.vendor_code,
        serial_number: pd.serial_number,
        firmware_version: 0x000100,
    };
    if let Some(scbk) = &pd.scbk {
        info.scbk = Some(config::parse_key(scbk)?);
    }
    Ok(info)
}

fn run_cp(cfg: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let stream = UnixStream::connect(&cfg.device)?;
    let channel = Arc::new(UnixChannel::new(stream)?);

    let master_key = cfg
        .master_key
        .as_deref()
        .map(config::parse_key)
        .transpose()?;
    let infos = cfg
        .pds
        .iter()
        .map(|pd| pd_info(pd, channel.clone()))
        .collect::<Result<Vec<_>, _>>()?;

    let mut cp = ControlPanel::setup(infos, master_key)?;
    cp.set_event_callback(|pd, event| match event {
        OsdpEvent::CardRead(card) => {
            info!(pd, reader = card.reader_no, bits = card.length(), "card read")
        }
        OsdpEvent::KeyPress(keys) => {
            info!(pd, reader = keys.reader_no, digits = keys.digits().len(), "keypress")
        }
        OsdpEvent::MfgReply(mfg) => {
            info!(pd, vendor = mfg.vendor_code, "manufacturer reply")
        }
    });

    let mut last_mask = 0u32;
    loop {
        cp.refresh();
        let mask = cp.status_mask();
        if mask != last_mask {
            info!(
                online = format_args!("{mask:#010b}"),
                sc = format_args!("{:#010b}", cp.sc_status_mask()),
                "status changed"
            );
            last_mask = mask;
        }
        thread::sleep(TICK);
    }
}

fn run_pd(cfg: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let _ = std::fs::remove_file(&cfg.device);
    let listener = UnixListener::bind(&cfg.device)?;
    info!(device = %cfg.device.display(), "listening for CP");

    let (stream, _) = listener.accept()?;
    info!("CP connected");
    let channel = Arc::new(UnixChannel::new(stream)?);

    let pd_cfg = &cfg.pds[0];
    let scbk = pd_cfg.scbk.as_deref().map(config::parse_key).transpose()?;
    let info = pd_info(pd_cfg, channel)?;

    let mut pd = PeripheralDevice::setup(info, scbk)?;
    pd.set_command_callback(|address, cmd| {
        info!(pd = address, ?cmd, "command");
        CommandOutcome::Accepted
    });

    loop {
        pd.refresh();
        thread::sleep(TICK);
    }
}
