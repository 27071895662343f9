//! YSF UDP endpoint.
//!
//! Carries 155-byte `YSFD` voice/data packets plus the `YSFP` poll and
//! `YSFU` unlink control datagrams, all addressed to a single peer
//! (typically MMDVMHost or a YSF reflector).

use std::io::{self, ErrorKind};
use std::net::{SocketAddr, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace};

use crate::ysf::{pad_callsign, CALLSIGN_LENGTH, FRAME_LENGTH};

/// Anything that can emit a complete YSF network packet.
///
/// The WIRES-X engine writes its reply chains through this so it never
/// holds the endpoint itself.
pub trait PacketSink {
    fn write_packet(&self, data: &[u8]) -> io::Result<()>;
}

/// UDP endpoint for the YSF side of the bridge.
pub struct YsfNetwork {
    socket: UdpSocket,
    destination: SocketAddr,
    callsign: [u8; CALLSIGN_LENGTH],
    debug: bool,
}

impl YsfNetwork {
    /// Bind the local endpoint and aim it at the YSF peer.
    pub fn new(
        local: SocketAddr,
        destination: SocketAddr,
        callsign: &str,
        debug: bool,
    ) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&local.into())?;
        socket.set_nonblocking(true)?;
        let _ = socket.set_recv_buffer_size(1024 * 1024);
        let _ = socket.set_send_buffer_size(1024 * 1024);
        let socket: UdpSocket = socket.into();
        Ok(Self {
            socket,
            destination,
            callsign: pad_callsign(callsign),
            debug,
        })
    }

    /// The padded node callsign used in poll packets and frame envelopes.
    pub fn callsign(&self) -> &[u8; CALLSIGN_LENGTH] {
        &self.callsign
    }

    /// Receive one YSFD packet into `buffer`, returning its length.
    ///
    /// Returns 0 when nothing (or nothing usable) is pending this tick.
    pub fn read(&self, buffer: &mut [u8]) -> usize {
        loop {
            match self.socket.recv_from(buffer) {
                Ok((len, addr)) => {
                    if addr != self.destination {
                        continue;
                    }
                    if len == FRAME_LENGTH && &buffer[..4] == b"YSFD" {
                        if self.debug {
                            trace!(len, "YSF network data received");
                        }
                        return len;
                    }
                    // Poll replies and status packets are not interesting
                    debug!(len, "ignoring non-data YSF packet");
                    continue;
                }
                Err(ref e)
                    if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
                {
                    return 0;
                }
                Err(e) => {
                    debug!(error = %e, "YSF socket read error");
                    return 0;
                }
            }
        }
    }

    /// Send a 155-byte YSFD packet to the peer.
    pub fn write(&self, frame: &[u8]) -> bool {
        debug_assert_eq!(frame.len(), FRAME_LENGTH);
        match self.socket.send_to(frame, self.destination) {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "YSF socket write error");
                false
            }
        }
    }

    /// Send the keep-alive poll.
    pub fn write_poll(&self) {
        let mut packet = [0u8; 4 + CALLSIGN_LENGTH];
        packet[..4].copy_from_slice(b"YSFP");
        packet[4..].copy_from_slice(&self.callsign);
        let _ = self.socket.send_to(&packet, self.destination);
    }

    /// Send the unlink notification.
    pub fn write_unlink(&self) {
        let mut packet = [0u8; 4 + CALLSIGN_LENGTH];
        packet[..4].copy_from_slice(b"YSFU");
        packet[4..].copy_from_slice(&self.callsign);
        let _ = self.socket.send_to(&packet, self.destination);
    }
}

impl PacketSink for YsfNetwork {
    fn write_packet(&self, data: &[u8]) -> io::Result<()> {
        self.socket.send_to(data, self.destination).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn local(port: u16) -> SocketAddr {
        SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port)
    }

    #[test]
    fn test_poll_and_frame_exchange() {
        let peer = UdpSocket::bind(local(0)).unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let network = YsfNetwork::new(local(0), peer_addr, "EA7EE", false).unwrap();

        network.write_poll();
        let mut buf = [0u8; 64];
        let (len, _) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(len, 14);
        assert_eq!(&buf[..4], b"YSFP");
        assert_eq!(&buf[4..14], b"EA7EE     ");

        let mut frame = [0u8; FRAME_LENGTH];
        frame[..4].copy_from_slice(b"YSFD");
        assert!(network.write(&frame));
        let (len, _) = peer.recv_from(&mut [0u8; 200]).unwrap();
        assert_eq!(len, FRAME_LENGTH);
    }

    #[test]
    fn test_read_filters_short_packets() {
        let peer = UdpSocket::bind(local(0)).unwrap();
        let network = YsfNetwork::new(local(0), peer.local_addr().unwrap(), "EA7EE", false).unwrap();
        let our_addr = network.socket.local_addr().unwrap();

        peer.send_to(b"YSFPshort", our_addr).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        let mut buf = [0u8; 512];
        assert_eq!(network.read(&mut buf), 0);

        let mut frame = [0u8; FRAME_LENGTH];
        frame[..4].copy_from_slice(b"YSFD");
        peer.send_to(&frame, our_addr).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(network.read(&mut buf), FRAME_LENGTH);
    }
}
