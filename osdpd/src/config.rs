use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config error: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Bus master: connects to the socket and drives the configured PDs.
    Cp,
    /// Peripheral: listens on the socket and serves one CP.
    Pd,
}

/// One peripheral on the bus (all of them in CP mode, exactly one in PD
/// mode).
#[derive(Debug, Deserialize, Clone)]
pub struct PdConfig {
    /// 7-bit device address, 0..=126.
    pub address: u8,
    #[serde(default = "default_baud")]
    pub baud_rate: u32,
    /// 32 hex chars; the PD runs in install mode without one.
    pub scbk: Option<String>,
    #[serde(default)]
    pub vendor_code: u32,
    #[serde(default)]
    pub model: u8,
    #[serde(default)]
    pub serial_number: u32,
}

fn default_baud() -> u32 {
    9600
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub mode: Mode,
    /// UNIX socket standing in for the serial line.
    pub device: PathBuf,
    /// 32 hex chars; CP mode only. Per-PD base keys derive from it.
    pub master_key: Option<String>,
    #[serde(rename = "pd", default)]
    pub pds: Vec<PdConfig>,
}

pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
    let txt = fs::read_to_string(path)?;
    let cfg: Config = toml::from_str(&txt)?;
    validate_config(&cfg)?;
    Ok(cfg)
}

fn validate_config(cfg: &Config) -> Result<()> {
    if cfg.pds.is_empty() {
        return Err(ConfigError::Invalid("no PDs configured".into()));
    }
    if cfg.mode == Mode::Pd && cfg.pds.len() != 1 {
        return Err(ConfigError::Invalid(
            "PD mode takes exactly one [[pd]] entry".into(),
        ));
    }
    if cfg.mode == Mode::Pd && cfg.master_key.is_some() {
        return Err(ConfigError::Invalid(
            "master_key is only meaningful in CP mode".into(),
        ));
    }
    if let Some(key) = &cfg.master_key {
        parse_key(key)?;
    }
    let mut seen = Vec::new();
    for pd in &cfg.pds {
        if pd.address > 126 {
            return Err(ConfigError::Invalid(format!(
                "PD address {} out of range",
                pd.address
            )));
        }
        if seen.contains(&pd.address) {
            return Err(ConfigError::Invalid(format!(
                "duplicate PD address {}",
                pd.address
            )));
        }
        seen.push(pd.address);
        if let Some(scbk) = &pd.scbk {
            parse_key(scbk)?;
        }
    }
    Ok(())
}

/// Decode a 16-byte key from 32 hex characters.
pub fn parse_key(hex: &str) -> Result<[u8; 16]> {
    if hex.len() != 32 {
        return Err(ConfigError::Invalid(format!(
            "key must be 32 hex chars, got {}",
            hex.len()
        )));
    }
    let mut key = [0u8; 16];
    for (i, slot) in key.iter_mut().enumerate() {
        let pair = &hex[2 * i..2 * i + 2];
        *slot = u8::from_str_radix(pair, 16)
            .map_err(|_| ConfigError::Invalid(format!("bad hex in key: {pair:?}")))?;
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(toml: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().expect("tempfile");
        f.write_all(toml.as_bytes()).expect("write config");
        f
    }

    #[test]
    fn loads_minimal_cp_config() {
        let f = write_config(
            r#"
mode = "cp"
device = "/tmp/osdp-bus.sock"

[[pd]]
address = 101
"#,
        );
        let cfg = load_from_path(f.path()).unwrap();
        assert_eq!(cfg.mode, Mode::Cp);
        assert_eq!(cfg.pds.len(), 1);
        assert_eq!(cfg.pds[0].address, 101);
        assert_eq!(cfg.pds[0].baud_rate, 9600);
        assert!(cfg.master_key.is_none());
    }

    #[test]
    fn rejects_bad_master_key() {
        let f = write_config(
            r#"
mode = "cp"
device = "/tmp/osdp-bus.sock"
master_key = "zz"

[[pd]]
address = 1
"#,
        );
        assert!(load_from_path(f.path()).is_err());
    }

    #[test]
    fn rejects_duplicate_addresses() {
        let f = write_config(
            r#"
mode = "cp"
device = "/tmp/osdp-bus.sock"

[[pd]]
address = 5
[[pd]]
address = 5
"#,
        );
        assert!(load_from_path(f.path()).is_err());
    }

    #[test]
    fn parses_keys() {
        let key = parse_key("000102030405060708090a0b0c0d0e0f").unwrap();
        assert_eq!(key[0], 0x00);
        assert_eq!(key[15], 0x0F);
        assert!(parse_key("0001").is_err());
    }
}
