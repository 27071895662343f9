//! DMR master network client.
//!
//! Speaks the homebrew repeater protocol: salted SHA-256 login, a
//! fixed-width config record, keep-alive pings and 55-byte `DMRD` voice
//! datagrams. The gateway behaves as a hotspot on slot 2 only.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};

use sha2::{Digest, Sha256};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use crate::dmr::{DmrData, Flco, DT_VOICE, DT_VOICE_SYNC, FRAME_LENGTH_BYTES};
use crate::timers::Timer;
use crate::VERSION;

const DMRD_LENGTH: usize = 55;
const RETRY_MS: u64 = 10_000;
const PING_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    WaitingLogin,
    WaitingAuthorisation,
    WaitingConfig,
    Running,
    Failed,
}

/// Station details sent to the master in the config record.
#[derive(Debug, Clone, Default)]
pub struct StationInfo {
    pub callsign: String,
    pub rx_frequency: u32,
    pub tx_frequency: u32,
    pub power: u32,
    pub color_code: u8,
    pub latitude: f32,
    pub longitude: f32,
    pub height: i32,
    pub location: String,
    pub description: String,
    pub url: String,
}

/// Client session towards one DMR master.
pub struct DmrNetwork {
    socket: UdpSocket,
    master: SocketAddr,
    id: u32,
    password: String,
    info: StationInfo,
    status: Status,
    retry_timer: Timer,
    ping_timer: Timer,
    queue: VecDeque<DmrData>,
    enabled: bool,
    debug: bool,
}

impl DmrNetwork {
    pub fn new(
        master: SocketAddr,
        local_port: u16,
        id: u32,
        password: &str,
        debug: bool,
    ) -> std::io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        let local = SocketAddr::from(([0, 0, 0, 0], local_port));
        socket.bind(&local.into())?;
        socket.set_nonblocking(true)?;
        let _ = socket.set_recv_buffer_size(1024 * 1024);
        let _ = socket.set_send_buffer_size(1024 * 1024);
        Ok(Self {
            socket: socket.into(),
            master,
            id,
            password: password.to_string(),
            info: StationInfo::default(),
            status: Status::WaitingLogin,
            retry_timer: Timer::new(RETRY_MS),
            ping_timer: Timer::new(PING_MS),
            queue: VecDeque::new(),
            enabled: true,
            debug,
        })
    }

    pub fn set_info(&mut self, info: StationInfo) {
        self.info = info;
    }

    /// Start the login handshake.
    pub fn open(&mut self) -> bool {
        info!(master = %self.master, id = self.id, "opening DMR master connection");
        self.status = Status::WaitingLogin;
        self.retry_timer.start();
        self.write_login()
    }

    pub fn is_connected(&self) -> bool {
        self.status == Status::Running
    }

    /// Login permanently rejected; the supervisor should restart us.
    pub fn has_failed(&self) -> bool {
        self.status == Status::Failed
    }

    /// Gate inbound traffic (used while a picture download owns the radio).
    pub fn enable(&mut self, enabled: bool) {
        if !enabled {
            self.queue.clear();
        }
        self.enabled = enabled;
    }

    /// Drop any queued inbound frames.
    pub fn reset(&mut self) {
        self.queue.clear();
    }

    /// Pop the next inbound voice data unit, if any.
    pub fn read(&mut self) -> Option<DmrData> {
        self.queue.pop_front()
    }

    /// Send one voice data unit to the master.
    pub fn write(&self, data: &DmrData) -> bool {
        if self.status != Status::Running {
            return false;
        }
        let mut buffer = [0u8; DMRD_LENGTH];
        buffer[0..4].copy_from_slice(b"DMRD");
        buffer[4] = data.seq_no;
        buffer[5..8].copy_from_slice(&data.src_id.to_be_bytes()[1..4]);
        buffer[8..11].copy_from_slice(&data.dst_id.to_be_bytes()[1..4]);
        buffer[11..15].copy_from_slice(&self.id.to_be_bytes());

        let mut control = 0x80u8; // slot 2
        if data.flco == Flco::UserUser {
            control |= 0x40;
        }
        match data.data_type {
            DT_VOICE => control |= data.n & 0x0F,
            DT_VOICE_SYNC => control |= 0x10,
            dt => control |= 0x20 | (dt & 0x0F),
        }
        buffer[15] = control;
        buffer[16..20].copy_from_slice(&data.stream_id.to_be_bytes());
        buffer[20..53].copy_from_slice(&data.data);
        buffer[53] = data.ber;
        buffer[54] = data.rssi;

        match self.socket.send_to(&buffer, self.master) {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "DMR socket write error");
                false
            }
        }
    }

    /// Advance timers and drain the socket. Call once per loop iteration.
    pub fn clock(&mut self, ms: u64) {
        self.retry_timer.clock(ms);
        if self.retry_timer.has_expired() {
            match self.status {
                Status::Running | Status::Failed => {}
                _ => {
                    debug!("DMR master handshake retry");
                    self.write_login();
                }
            }
            self.retry_timer.start();
        }

        self.ping_timer.clock(ms);
        if self.ping_timer.has_expired() {
            self.write_tagged(b"RPTPING");
            self.ping_timer.start();
        }

        let mut buffer = [0u8; 512];
        loop {
            let (len, addr) = match self.socket.recv_from(&mut buffer) {
                Ok(r) => r,
                Err(ref e)
                    if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
                {
                    break;
                }
                Err(e) => {
                    debug!(error = %e, "DMR socket read error");
                    break;
                }
            };
            if addr != self.master {
                continue;
            }
            self.process(&buffer[..len]);
        }
    }

    /// Announce closure to the master.
    pub fn close(&mut self) {
        self.write_tagged(b"RPTCL");
        self.status = Status::WaitingLogin;
    }

    fn process(&mut self, packet: &[u8]) {
        if packet.starts_with(b"DMRD") {
            if packet.len() >= 53 {
                if let Some(data) = parse_dmrd(packet) {
                    if self.enabled {
                        if self.debug {
                            debug!(
                                src = data.src_id,
                                dst = data.dst_id,
                                dt = data.data_type,
                                "DMR data received"
                            );
                        }
                        self.queue.push_back(data);
                    }
                }
            }
        } else if packet.starts_with(b"RPTACK") {
            match self.status {
                Status::WaitingLogin if packet.len() >= 10 => {
                    let mut salt = [0u8; 4];
                    salt.copy_from_slice(&packet[6..10]);
                    self.write_authorisation(&salt);
                    self.status = Status::WaitingAuthorisation;
                }
                Status::WaitingAuthorisation => {
                    self.write_config();
                    self.status = Status::WaitingConfig;
                }
                Status::WaitingConfig => {
                    info!("logged into the DMR master");
                    self.status = Status::Running;
                    self.ping_timer.start();
                }
                _ => {}
            }
        } else if packet.starts_with(b"MSTNAK") {
            warn!("DMR master refused the session");
            self.status = Status::Failed;
        } else if packet.starts_with(b"MSTCL") {
            warn!("DMR master closed the session");
            self.status = Status::Failed;
        } else if packet.starts_with(b"MSTPONG") {
            // keep-alive answered
        } else {
            debug!(len = packet.len(), "unknown packet from DMR master");
        }
    }

    fn write_login(&self) -> bool {
        self.write_tagged(b"RPTL")
    }

    fn write_tagged(&self, tag: &[u8]) -> bool {
        let mut packet = Vec::with_capacity(tag.len() + 4);
        packet.extend_from_slice(tag);
        packet.extend_from_slice(&self.id.to_be_bytes());
        self.socket.send_to(&packet, self.master).is_ok()
    }

    fn write_authorisation(&self, salt: &[u8; 4]) {
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(self.password.as_bytes());
        let digest = hasher.finalize();

        let mut packet = Vec::with_capacity(40);
        packet.extend_from_slice(b"RPTK");
        packet.extend_from_slice(&self.id.to_be_bytes());
        packet.extend_from_slice(&digest);
        let _ = self.socket.send_to(&packet, self.master);
    }

    fn write_config(&self) {
        let i = &self.info;
        let record = format!(
            "{:<8.8}{:0>9}{:0>9}{:0>2}{:0>2}{:+08.4}{:+09.4}{:0>3}{:<20.20}{:<19.19}2{:<124.124}{:<40.40}{:<40.40}",
            i.callsign,
            i.rx_frequency,
            i.tx_frequency,
            i.power.min(99),
            i.color_code,
            i.latitude,
            i.longitude,
            i.height.clamp(0, 999),
            i.location,
            i.description,
            i.url,
            format!("ysf2dmr-{}", VERSION),
            "MMDVM_YSF2DMR",
        );
        let mut packet = Vec::with_capacity(302);
        packet.extend_from_slice(b"RPTC");
        packet.extend_from_slice(&self.id.to_be_bytes());
        packet.extend_from_slice(record.as_bytes());
        let _ = self.socket.send_to(&packet, self.master);
    }

    #[cfg(test)]
    fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }
}

fn parse_dmrd(packet: &[u8]) -> Option<DmrData> {
    let control = packet[15];
    if control & 0x80 == 0 {
        // slot 1 is not bridged
        return None;
    }
    let mut data = DmrData {
        seq_no: packet[4],
        src_id: u32::from_be_bytes([0, packet[5], packet[6], packet[7]]),
        dst_id: u32::from_be_bytes([0, packet[8], packet[9], packet[10]]),
        flco: if control & 0x40 != 0 { Flco::UserUser } else { Flco::Group },
        stream_id: u32::from_be_bytes([packet[16], packet[17], packet[18], packet[19]]),
        ..DmrData::default()
    };
    match control & 0x30 {
        0x20 => {
            data.data_type = control & 0x0F;
            data.n = 0;
        }
        0x10 => {
            data.data_type = DT_VOICE_SYNC;
            data.n = 0;
        }
        _ => {
            data.data_type = DT_VOICE;
            data.n = control & 0x0F;
        }
    }
    data.data.copy_from_slice(&packet[20..20 + FRAME_LENGTH_BYTES]);
    if packet.len() >= DMRD_LENGTH {
        data.ber = packet[53];
        data.rssi = packet[54];
    }
    Some(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dmr::DT_VOICE_LC_HEADER;

    fn fake_master() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    #[test]
    fn test_login_handshake() {
        let (master, master_addr) = fake_master();
        let mut network = DmrNetwork::new(master_addr, 0, 2147001, "passw0rd", false).unwrap();
        network.set_info(StationInfo {
            callsign: "EA7EE".into(),
            rx_frequency: 438_000_000,
            tx_frequency: 430_400_000,
            power: 1,
            color_code: 1,
            ..StationInfo::default()
        });
        assert!(network.open());

        let mut buf = [0u8; 512];
        let (len, client) = master.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..4], b"RPTL");
        assert_eq!(len, 8);

        // Salted challenge
        let mut ack = b"RPTACK".to_vec();
        ack.extend_from_slice(&[1, 2, 3, 4]);
        master.send_to(&ack, client).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        network.clock(0);

        let (len, _) = master.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..4], b"RPTK");
        assert_eq!(len, 40);
        let mut hasher = Sha256::new();
        hasher.update([1u8, 2, 3, 4]);
        hasher.update(b"passw0rd");
        assert_eq!(&buf[8..40], hasher.finalize().as_slice());

        master.send_to(b"RPTACK", client).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        network.clock(0);

        let (len, _) = master.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..4], b"RPTC");
        assert_eq!(len, 302);

        master.send_to(b"RPTACK", client).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        network.clock(0);
        assert!(network.is_connected());
    }

    #[test]
    fn test_dmrd_roundtrip() {
        let (master, master_addr) = fake_master();
        let mut network = DmrNetwork::new(master_addr, 0, 2147001, "x", false).unwrap();
        network.status = Status::Running;

        let mut out = DmrData {
            seq_no: 7,
            src_id: 2147001,
            dst_id: 214,
            data_type: DT_VOICE_LC_HEADER,
            stream_id: 0xDEADBEEF,
            ..DmrData::default()
        };
        out.data[0] = 0x55;
        assert!(network.write(&out));

        let mut buf = [0u8; 512];
        let (len, _) = master.recv_from(&mut buf).unwrap();
        assert_eq!(len, DMRD_LENGTH);

        // Feed it back through the parser
        let parsed = parse_dmrd(&buf[..len]).unwrap();
        assert_eq!(parsed.src_id, 2147001);
        assert_eq!(parsed.dst_id, 214);
        assert_eq!(parsed.data_type, DT_VOICE_LC_HEADER);
        assert_eq!(parsed.stream_id, 0xDEADBEEF);
        assert_eq!(parsed.data[0], 0x55);
    }

    #[test]
    fn test_nak_marks_failure() {
        let (master, master_addr) = fake_master();
        let mut network = DmrNetwork::new(master_addr, 0, 1, "x", false).unwrap();
        network.open();
        let (_, client) = master.recv_from(&mut [0u8; 64]).unwrap();
        master.send_to(b"MSTNAK", client).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        network.clock(0);
        assert!(network.has_failed());
    }

    #[test]
    fn test_disable_gates_inbound() {
        let (master, master_addr) = fake_master();
        let mut network = DmrNetwork::new(master_addr, 0, 1, "x", false).unwrap();
        network.status = Status::Running;
        let client = network.local_addr();
        network.enable(false);

        let mut packet = [0u8; DMRD_LENGTH];
        packet[..4].copy_from_slice(b"DMRD");
        packet[15] = 0x80 | 0x20 | DT_VOICE_LC_HEADER;
        master.send_to(&packet, client).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        network.clock(0);
        assert!(network.read().is_none());

        network.enable(true);
        master.send_to(&packet, client).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        network.clock(0);
        assert!(network.read().is_some());
    }
}
