//! Gateway configuration.
//!
//! An INI-style file with one section per subsystem. Unknown keys are
//! ignored so configs survive version skew; missing required settings
//! and unparseable numbers abort startup.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    // [General]
    pub callsign: String,
    pub suffix: String,
    pub timeout_minutes: u64,
    pub beacon_minutes: u64,
    pub beacon_file: PathBuf,
    pub save_ambe: bool,
    pub daemon: bool,

    // [Info]
    pub rx_frequency: u32,
    pub tx_frequency: u32,
    pub power: u32,
    pub latitude: f32,
    pub longitude: f32,
    pub height: i32,
    pub location: String,
    pub description: String,
    pub url: String,

    // [YSF Network]
    pub ysf_local_address: String,
    pub ysf_local_port: u16,
    pub ysf_dst_address: String,
    pub ysf_dst_port: u16,
    pub enable_wiresx: bool,
    pub wiresx_make_upper: bool,
    pub remote_gateway: bool,
    pub hang_time: u64,
    pub ysf_debug: bool,

    // [DMR Network]
    pub dmr_id: u32,
    pub dmr_dst_id: u32,
    pub dmr_pc: bool,
    pub dmr_address: String,
    pub dmr_port: u16,
    pub dmr_local_port: u16,
    pub dmr_password: String,
    pub dmr_debug: bool,
    pub color_code: u8,
    pub enable_unlink: bool,
    pub id_unlink: u32,
    pub pc_unlink: bool,
    pub tg_list_file: PathBuf,
    pub tg_list_reload_minutes: u64,
    pub ambe_comp_a: u32,
    pub ambe_comp_b: u32,
    pub xlx_file: PathBuf,
    pub xlx_reflector: u32,
    pub xlx_module: String,

    // [DMR Id Lookup]
    pub lookup_file: PathBuf,
    pub lookup_reload_minutes: u64,

    // [aprs.fi]
    pub aprs_enabled: bool,
    pub aprs_callsign: String,
    pub aprs_server: String,
    pub aprs_port: u16,
    pub aprs_password: String,
    pub aprs_api_key: String,
    pub aprs_refresh_minutes: u64,
    pub aprs_icon: String,
    pub aprs_beacon_text: String,
    pub aprs_beacon_minutes: u64,

    // [Storage]
    pub news_path: PathBuf,
    pub talky_key: String,

    // [Log]
    pub log_display_level: u8,
    pub log_file_level: u8,
    pub log_file_path: PathBuf,
    pub log_file_root: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            callsign: String::new(),
            suffix: String::new(),
            timeout_minutes: 0,
            beacon_minutes: 0,
            beacon_file: PathBuf::from("/usr/local/etc/beacon.amb"),
            save_ambe: false,
            daemon: false,
            rx_frequency: 0,
            tx_frequency: 0,
            power: 1,
            latitude: 0.0,
            longitude: 0.0,
            height: 0,
            location: String::new(),
            description: String::new(),
            url: String::new(),
            ysf_local_address: "0.0.0.0".to_string(),
            ysf_local_port: 42013,
            ysf_dst_address: "127.0.0.1".to_string(),
            ysf_dst_port: 42014,
            enable_wiresx: true,
            wiresx_make_upper: true,
            remote_gateway: false,
            hang_time: 1000,
            ysf_debug: false,
            dmr_id: 0,
            dmr_dst_id: 9,
            dmr_pc: false,
            dmr_address: String::new(),
            dmr_port: 62031,
            dmr_local_port: 0,
            dmr_password: "passw0rd".to_string(),
            dmr_debug: false,
            color_code: 1,
            enable_unlink: false,
            id_unlink: 4000,
            pc_unlink: false,
            tg_list_file: PathBuf::from("TGList.txt"),
            tg_list_reload_minutes: 0,
            ambe_comp_a: 0,
            ambe_comp_b: 0,
            xlx_file: PathBuf::new(),
            xlx_reflector: 0,
            xlx_module: String::new(),
            lookup_file: PathBuf::from("DMRIds.dat"),
            lookup_reload_minutes: 0,
            aprs_enabled: false,
            aprs_callsign: String::new(),
            aprs_server: "euro.aprs2.net".to_string(),
            aprs_port: 14580,
            aprs_password: String::new(),
            aprs_api_key: String::new(),
            aprs_refresh_minutes: 30,
            aprs_icon: String::new(),
            aprs_beacon_text: String::new(),
            aprs_beacon_minutes: 20,
            news_path: PathBuf::from("/tmp/news"),
            talky_key: "HE5Gbv".to_string(),
            log_display_level: 2,
            log_file_level: 2,
            log_file_path: PathBuf::from("."),
            log_file_root: "ysf2dmr".to_string(),
        }
    }
}

impl Config {
    /// Read and validate a configuration file.
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::default();
        let mut section = String::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                section = line[1..line.len() - 1].to_string();
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            config.apply(&section, key, value)?;
        }

        if config.callsign.is_empty() {
            return Err(ConfigError::Missing("General/Callsign"));
        }
        if config.dmr_id == 0 {
            return Err(ConfigError::Missing("DMR Network/Id"));
        }
        if config.dmr_address.is_empty() {
            return Err(ConfigError::Missing("DMR Network/Address"));
        }
        Ok(config)
    }

    fn apply(&mut self, section: &str, key: &str, value: &str) -> Result<(), ConfigError> {
        match (section, key) {
            ("General", "Callsign") => self.callsign = value.to_uppercase(),
            ("General", "Suffix") => self.suffix = value.to_uppercase(),
            ("General", "TimeoutTime") => self.timeout_minutes = number(key, value)?,
            ("General", "BeaconTime") => self.beacon_minutes = number(key, value)?,
            ("General", "BeaconFile") => self.beacon_file = value.into(),
            ("General", "SaveAMBE") => self.save_ambe = flag(value),
            ("General", "Daemon") => self.daemon = flag(value),

            ("Info", "RXFrequency") => self.rx_frequency = number(key, value)?,
            ("Info", "TXFrequency") => self.tx_frequency = number(key, value)?,
            ("Info", "Power") => self.power = number(key, value)?,
            ("Info", "Latitude") => self.latitude = float(key, value)?,
            ("Info", "Longitude") => self.longitude = float(key, value)?,
            ("Info", "Height") => self.height = number(key, value)?,
            ("Info", "Location") => self.location = value.to_string(),
            ("Info", "Description") => self.description = value.to_string(),
            ("Info", "URL") => self.url = value.to_string(),

            ("YSF Network", "LocalAddress") => self.ysf_local_address = value.to_string(),
            ("YSF Network", "LocalPort") => self.ysf_local_port = number(key, value)?,
            ("YSF Network", "DstAddress") => self.ysf_dst_address = value.to_string(),
            ("YSF Network", "DstPort") => self.ysf_dst_port = number(key, value)?,
            ("YSF Network", "EnableWiresX") => self.enable_wiresx = flag(value),
            ("YSF Network", "WiresXMakeUpper") => self.wiresx_make_upper = flag(value),
            ("YSF Network", "RemoteGateway") => self.remote_gateway = flag(value),
            ("YSF Network", "HangTime") => self.hang_time = number(key, value)?,
            ("YSF Network", "Debug") => self.ysf_debug = flag(value),

            ("DMR Network", "Id") => self.dmr_id = number(key, value)?,
            ("DMR Network", "StartupDstId") => self.dmr_dst_id = number(key, value)?,
            ("DMR Network", "StartupPC") => self.dmr_pc = flag(value),
            ("DMR Network", "Address") => self.dmr_address = value.to_string(),
            ("DMR Network", "Port") => self.dmr_port = number(key, value)?,
            ("DMR Network", "Local") => self.dmr_local_port = number(key, value)?,
            ("DMR Network", "Password") => self.dmr_password = value.to_string(),
            ("DMR Network", "Debug") => self.dmr_debug = flag(value),
            ("DMR Network", "ColorCode") => self.color_code = number(key, value)?,
            ("DMR Network", "EnableUnlink") => self.enable_unlink = flag(value),
            ("DMR Network", "TGListIdUnlink") => self.id_unlink = number(key, value)?,
            ("DMR Network", "PCUnlink") => self.pc_unlink = flag(value),
            ("DMR Network", "TGListFile") => self.tg_list_file = value.into(),
            ("DMR Network", "TGListReload") => self.tg_list_reload_minutes = number(key, value)?,
            ("DMR Network", "AMBECompA") => self.ambe_comp_a = number(key, value)?,
            ("DMR Network", "AMBECompB") => self.ambe_comp_b = number(key, value)?,
            ("DMR Network", "XLXFile") => self.xlx_file = value.into(),
            ("DMR Network", "XLXReflector") => self.xlx_reflector = number(key, value)?,
            ("DMR Network", "XLXModule") => self.xlx_module = value.to_uppercase(),

            ("DMR Id Lookup", "File") => self.lookup_file = value.into(),
            ("DMR Id Lookup", "Time") => self.lookup_reload_minutes = number(key, value)?,

            ("aprs.fi", "Enable") => self.aprs_enabled = flag(value),
            ("aprs.fi", "AprsCallsign") => self.aprs_callsign = value.to_uppercase(),
            ("aprs.fi", "Server") => self.aprs_server = value.to_string(),
            ("aprs.fi", "Port") => self.aprs_port = number(key, value)?,
            ("aprs.fi", "Password") => self.aprs_password = value.to_string(),
            ("aprs.fi", "APIKey") => self.aprs_api_key = value.to_string(),
            ("aprs.fi", "Refresh") => self.aprs_refresh_minutes = number(key, value)?,
            ("aprs.fi", "Icon") => self.aprs_icon = value.to_string(),
            ("aprs.fi", "BeaconText") => self.aprs_beacon_text = value.to_string(),
            ("aprs.fi", "BeaconTime") => self.aprs_beacon_minutes = number(key, value)?,

            ("Storage", "NewsPath") => self.news_path = value.into(),
            ("Storage", "TalkyKey") => self.talky_key = value.to_string(),

            ("Log", "DisplayLevel") => self.log_display_level = number(key, value)?,
            ("Log", "FileLevel") => self.log_file_level = number(key, value)?,
            ("Log", "FilePath") => self.log_file_path = value.into(),
            ("Log", "FileRoot") => self.log_file_root = value.to_string(),

            _ => {}
        }
        Ok(())
    }
}

fn flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "yes")
}

fn number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn float(key: &str, value: &str) -> Result<f32, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
[General]
Callsign=ea7ee
Suffix=nd
TimeoutTime=5
BeaconTime=1
SaveAMBE=1

[Info]
RXFrequency=434000000
TXFrequency=434000000
Latitude=37.2583
Longitude=-6.9494
Description=Huelva

[YSF Network]
LocalAddress=127.0.0.1
LocalPort=42013
DstAddress=127.0.0.1
DstPort=42014
EnableWiresX=1

[DMR Network]
Id=2147001
StartupDstId=214
Address=master.example.net
Port=62031
Password=secret
EnableUnlink=1
TGListIdUnlink=4000
TGListFile=/etc/TGList.txt
TGListReload=60
AMBECompA=3
AMBECompB=5

[DMR Id Lookup]
File=/etc/DMRIds.dat
Time=24

[aprs.fi]
Enable=1
APIKey=abc123

[Storage]
NewsPath=/var/news
TalkyKey=AB12cd

[Log]
DisplayLevel=1
";

    fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ysf2dmr.ini");
        fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_full_config() {
        let (_dir, path) = write_config(SAMPLE);
        let config = Config::read(&path).unwrap();
        assert_eq!(config.callsign, "EA7EE");
        assert_eq!(config.suffix, "ND");
        assert_eq!(config.timeout_minutes, 5);
        assert!(config.save_ambe);
        assert_eq!(config.dmr_id, 2147001);
        assert_eq!(config.dmr_dst_id, 214);
        assert!(config.enable_unlink);
        assert_eq!(config.tg_list_file, PathBuf::from("/etc/TGList.txt"));
        assert_eq!(config.tg_list_reload_minutes, 60);
        assert_eq!(config.ambe_comp_a, 3);
        assert_eq!(config.ambe_comp_b, 5);
        assert_eq!(config.news_path, PathBuf::from("/var/news"));
        assert_eq!(config.talky_key, "AB12cd");
        assert!((config.latitude - 37.2583).abs() < 1e-4);
        assert_eq!(config.log_display_level, 1);
        // Untouched keys keep their defaults
        assert_eq!(config.hang_time, 1000);
        assert_eq!(config.id_unlink, 4000);
    }

    #[test]
    fn test_missing_required() {
        let (_dir, path) = write_config("[General]\nCallsign=EA7EE\n");
        match Config::read(&path) {
            Err(ConfigError::Missing(key)) => assert_eq!(key, "DMR Network/Id"),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_invalid_number() {
        let (_dir, path) = write_config(
            "[General]\nCallsign=EA7EE\n[DMR Network]\nId=notanumber\nAddress=x\n",
        );
        assert!(matches!(
            Config::read(&path),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let (_dir, path) = write_config(
            "[General]\nCallsign=EA7EE\nFutureKey=1\n[DMR Network]\nId=1\nAddress=x\n",
        );
        assert!(Config::read(&path).is_ok());
    }
}
