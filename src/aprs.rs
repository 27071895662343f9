//! APRS plumbing: the APRS-IS uplink, the aprs.fi position cache, and
//! the 20-byte DT1/DT2 position blob carried in V/D mode 2 frames.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc::{self, Sender};
use std::thread;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::timers::Timer;
use crate::VERSION;

// DT1/DT2 template bytes for a position-bearing mode 2 frame.
const DT1_TEMPLATE: [u8; 10] = [0x31, 0x22, 0x62, 0x5F, 0x29, 0x00, 0x00, 0x00, 0x00, 0x00];
const DT2_TEMPLATE: [u8; 10] = [0x00, 0x00, 0x00, 0x00, 0x6C, 0x20, 0x1C, 0x20, 0x03, 0x08];

/// Fill the 20-byte GPS blob with a position in millidegrees.
pub fn format_gps(buffer: &mut [u8], lat_milli: i32, lon_milli: i32) {
    buffer[..10].copy_from_slice(&DT1_TEMPLATE);
    buffer[10..20].copy_from_slice(&DT2_TEMPLATE);
    buffer[5..9].copy_from_slice(&lat_milli.to_be_bytes());
    buffer[10..14].copy_from_slice(&lon_milli.to_be_bytes());
}

/// Fill the 20-byte GPS blob with the no-position template.
pub fn blank_gps(buffer: &mut [u8]) {
    buffer[..10].copy_from_slice(&DT1_TEMPLATE);
    buffer[10..20].copy_from_slice(&DT2_TEMPLATE);
}

/// Recover a position from a received GPS blob, if one is present.
pub fn parse_gps(buffer: &[u8]) -> Option<(i32, i32)> {
    if buffer.len() < 20 || buffer[..5] != DT1_TEMPLATE[..5] {
        return None;
    }
    let lat = i32::from_be_bytes([buffer[5], buffer[6], buffer[7], buffer[8]]);
    let lon = i32::from_be_bytes([buffer[10], buffer[11], buffer[12], buffer[13]]);
    if lat == 0 && lon == 0 {
        return None;
    }
    Some((lat, lon))
}

/// Degrees to the APRS ddmm.mm representation.
fn to_aprs_coord(value: f64) -> f64 {
    let abs = value.abs();
    let whole = abs.floor();
    (abs - whole) * 60.0 + whole * 100.0
}

/// APRS symbol and SSID suffix for a radio type byte.
fn symbol_for_radio(radio: u8) -> (char, &'static str) {
    match radio {
        0x24 | 0x28 => ('[', "-7"),
        0x25 | 0x29 => ('>', "-9"),
        0x26 => ('r', "-1"),
        _ => ('-', "-2"),
    }
}

/// Outbound APRS-IS connection with a timed ID beacon.
///
/// The TCP session lives on its own thread fed through a channel, so a
/// stalled server never blocks the bridge loop.
pub struct AprsWriter {
    sender: Sender<String>,
    id_timer: Timer,
    callsign: String,
    node_callsign: String,
    latitude: f32,
    longitude: f32,
    follow_latitude: f32,
    follow_longitude: f32,
    icon: String,
    beacon_text: String,
}

impl AprsWriter {
    pub fn new(callsign: &str, suffix: &str, password: &str, server: &str, port: u16) -> Self {
        let callsign = match suffix.chars().next() {
            Some(c) => format!("{}-{}", callsign, c),
            None => callsign.to_string(),
        };

        let (sender, receiver) = mpsc::channel::<String>();
        let login = format!(
            "user {} pass {} vers ysf2dmr {}\r\n",
            callsign, password, VERSION
        );
        let address = format!("{}:{}", server, port);
        thread::Builder::new()
            .name("aprs-is".into())
            .spawn(move || {
                let mut stream: Option<TcpStream> = None;
                for line in receiver.iter() {
                    if stream.is_none() {
                        stream = match TcpStream::connect(&address) {
                            Ok(mut s) => {
                                let _ = s.set_write_timeout(Some(Duration::from_secs(5)));
                                if s.write_all(login.as_bytes()).is_ok() {
                                    info!(server = %address, "connected to APRS-IS");
                                    Some(s)
                                } else {
                                    None
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "APRS-IS connection failed");
                                None
                            }
                        };
                    }
                    if let Some(s) = stream.as_mut() {
                        if s.write_all(format!("{}\r\n", line).as_bytes()).is_err() {
                            warn!("APRS-IS write failed, dropping connection");
                            stream = None;
                        }
                    }
                }
            })
            .expect("spawning the APRS-IS thread");

        Self {
            sender,
            id_timer: Timer::new(20 * 60 * 1000),
            callsign,
            node_callsign: String::new(),
            latitude: 0.0,
            longitude: 0.0,
            follow_latitude: 0.0,
            follow_longitude: 0.0,
            icon: "YY".to_string(),
            beacon_text: "YSF2DMR gateway".to_string(),
        }
    }

    pub fn set_info(
        &mut self,
        node_callsign: &str,
        latitude: f32,
        longitude: f32,
        icon: &str,
        beacon_text: &str,
        beacon_minutes: u64,
    ) {
        self.node_callsign = node_callsign.to_string();
        self.latitude = latitude;
        self.longitude = longitude;
        if !icon.is_empty() {
            self.icon = icon.to_string();
        }
        if !beacon_text.is_empty() {
            self.beacon_text = beacon_text.to_string();
        }
        if beacon_minutes > 0 {
            self.id_timer = Timer::new(beacon_minutes * 60 * 1000);
        }
        self.id_timer.start();
        self.send_id_frame();
    }

    /// Report a heard station's position.
    pub fn write_position(&mut self, source: &str, radio: u8, latitude: f32, longitude: f32, tg: u32) {
        let callsign: String = source
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect();
        if callsign.is_empty() {
            return;
        }
        if callsign == self.node_callsign {
            debug!(%callsign, "caught own node position");
            self.follow_latitude = latitude;
            self.follow_longitude = longitude;
        }

        let (symbol, suffix) = symbol_for_radio(radio);
        let line = format!(
            "{}{}>APDPRS,C4FM*,qAR,{}:!{:07.2}{}/{:08.2}{}{} YSF QRV TG {} via MMDVM",
            callsign,
            suffix,
            self.callsign,
            to_aprs_coord(latitude as f64),
            if latitude < 0.0 { 'S' } else { 'N' },
            to_aprs_coord(longitude as f64),
            if longitude < 0.0 { 'W' } else { 'E' },
            symbol,
            tg
        );
        let _ = self.sender.send(line);
    }

    pub fn clock(&mut self, ms: u64) {
        self.id_timer.clock(ms);
        if self.id_timer.has_expired() {
            self.send_id_frame();
            self.id_timer.start();
        }
    }

    fn send_id_frame(&mut self) {
        // Unconfigured coordinates are not beaconed
        if self.latitude == 0.0 && self.longitude == 0.0 && self.follow_latitude == 0.0 {
            return;
        }
        let (latitude, longitude, mobile) = if self.follow_latitude != 0.0 {
            (self.follow_latitude, self.follow_longitude, " /mobile")
        } else {
            (self.latitude, self.longitude, "")
        };
        let icon: Vec<char> = self.icon.chars().chain("YY".chars()).take(2).collect();
        let line = format!(
            "{}>APDG03,TCPIP*,qAC,{}:!{:07.2}{}{}{:08.2}{}{}{}{}",
            self.node_callsign,
            self.node_callsign,
            to_aprs_coord(latitude as f64),
            if latitude < 0.0 { 'S' } else { 'N' },
            icon[0],
            to_aprs_coord(longitude as f64),
            if longitude < 0.0 { 'W' } else { 'E' },
            icon[1],
            self.beacon_text,
            mobile
        );
        let _ = self.sender.send(line);
    }
}

#[derive(Debug, Deserialize)]
struct AprsFiResponse {
    #[serde(default)]
    entries: Vec<AprsFiEntry>,
}

#[derive(Debug, Deserialize)]
struct AprsFiEntry {
    lat: String,
    lng: String,
}

struct CachedPosition {
    position: Option<(i32, i32)>,
    fetched: Instant,
}

/// Callsign → coordinates cache backed by the aprs.fi API.
pub struct AprsReader {
    api_key: String,
    refresh: Duration,
    cache: HashMap<String, CachedPosition>,
}

impl AprsReader {
    pub fn new(api_key: &str, refresh_minutes: u64) -> Self {
        Self {
            api_key: api_key.to_string(),
            refresh: Duration::from_secs(refresh_minutes.max(1) * 60),
            cache: HashMap::new(),
        }
    }

    /// Last known position of a callsign, in millidegrees.
    pub fn find_call(&mut self, callsign: &str) -> Option<(i32, i32)> {
        let key = callsign.trim().to_uppercase();
        if let Some(cached) = self.cache.get(&key) {
            if cached.fetched.elapsed() < self.refresh {
                return cached.position;
            }
        }
        let position = self.query(&key);
        self.cache.insert(
            key,
            CachedPosition { position, fetched: Instant::now() },
        );
        position
    }

    fn query(&self, callsign: &str) -> Option<(i32, i32)> {
        if self.api_key.is_empty() {
            return None;
        }
        let request = format!(
            "GET /api/get?name={}&what=loc&apikey={}&format=json HTTP/1.1\r\n\
             Host: api.aprs.fi\r\nUser-Agent: ysf2dmr/{}\r\nConnection: close\r\n\r\n",
            callsign, self.api_key, VERSION
        );
        let mut stream = match TcpStream::connect(("api.aprs.fi", 80)) {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, "aprs.fi connection failed");
                return None;
            }
        };
        let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
        let _ = stream.set_write_timeout(Some(Duration::from_secs(5)));
        stream.write_all(request.as_bytes()).ok()?;
        let mut response = String::new();
        stream.read_to_string(&mut response).ok()?;
        let body = response.split("\r\n\r\n").nth(1)?;
        Self::parse_response(body)
    }

    fn parse_response(body: &str) -> Option<(i32, i32)> {
        // Chunked responses leave framing lines around the JSON object
        let json = &body[body.find('{')?..=body.rfind('}')?];
        let parsed: AprsFiResponse = serde_json::from_str(json).ok()?;
        let entry = parsed.entries.first()?;
        let lat: f64 = entry.lat.parse().ok()?;
        let lng: f64 = entry.lng.parse().ok()?;
        Some(((lat * 1000.0) as i32, (lng * 1000.0) as i32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gps_blob_roundtrip() {
        let mut buffer = [0u8; 20];
        format_gps(&mut buffer, 37_123, -6_456);
        assert_eq!(parse_gps(&buffer), Some((37_123, -6_456)));
    }

    #[test]
    fn test_blank_blob_has_no_position() {
        let mut buffer = [0u8; 20];
        blank_gps(&mut buffer);
        assert_eq!(parse_gps(&buffer), None);
        assert_eq!(buffer[..10], DT1_TEMPLATE);
        assert_eq!(buffer[10..20], DT2_TEMPLATE);
    }

    #[test]
    fn test_aprs_coordinate_format() {
        // 37.5 degrees -> 37 degrees 30 minutes -> 3730.00
        assert!((to_aprs_coord(37.5) - 3730.0).abs() < 0.001);
        assert!((to_aprs_coord(-6.25) - 615.0).abs() < 0.001);
    }

    #[test]
    fn test_aprs_fi_parse() {
        let body = r#"{"command":"get","result":"ok","found":1,
            "entries":[{"name":"EA7EE","lat":"37.2583","lng":"-6.9494"}]}"#;
        assert_eq!(AprsReader::parse_response(body), Some((37_258, -6_949)));
        assert_eq!(AprsReader::parse_response(r#"{"entries":[]}"#), None);
    }

    #[test]
    fn test_symbol_table() {
        assert_eq!(symbol_for_radio(0x24), ('[', "-7"));
        assert_eq!(symbol_for_radio(0x26), ('r', "-1"));
        assert_eq!(symbol_for_radio(0xFF), ('-', "-2"));
    }
}
