use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use super::{PingError, Pinger};

const ECHO_REQUEST: u8 = 8;
const ECHO_REPLY: u8 = 0;
const ICMP_HEADER: usize = 8;
const IPV4_MIN_HEADER: usize = 20;

/// Shortest read timeout handed to the socket. A zero timeval means block
/// forever.
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// Privileged pinger on a raw ICMPv4 socket.
#[derive(Debug)]
pub struct IcmpPinger {
    socket: Socket,
    identifier: u16,
    sequence: u16,
    payload: usize,
    buffer: Vec<u8>,
}

impl IcmpPinger {
    /// Open the raw socket.
    ///
    /// # Errors
    ///
    /// Returns [`PingError::RawSocket`] without `CAP_NET_RAW`.
    pub fn new(payload: u16) -> Result<Self, PingError> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))
            .map_err(PingError::RawSocket)?;
        let payload = usize::from(payload);
        #[allow(clippy::cast_possible_truncation)]
        let identifier = (std::process::id() & 0xFFFF) as u16;
        Ok(Self {
            socket,
            identifier,
            sequence: 0,
            payload,
            buffer: vec![0; IPV4_MIN_HEADER * 3 + ICMP_HEADER + payload],
        })
    }
}

impl Pinger for IcmpPinger {
    fn probe(&mut self, address: IpAddr, timeout: Duration) -> io::Result<bool> {
        let IpAddr::V4(target) = address else {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "raw ICMP pinger is IPv4 only",
            ));
        };

        self.sequence = self.sequence.wrapping_add(1);
        let request = echo_request(self.identifier, self.sequence, self.payload);
        let destination = SockAddr::from(SocketAddr::new(address, 0));
        self.socket.send_to(&request, &destination)?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            self.socket.set_read_timeout(Some(read_timeout(remaining)))?;
            match (&self.socket).read(&mut self.buffer) {
                Ok(length) => {
                    if is_reply(&self.buffer[..length], target, self.identifier, self.sequence) {
                        return Ok(true);
                    }
                }
                Err(err)
                    if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    return Ok(false);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }
}

fn read_timeout(remaining: Duration) -> Duration {
    remaining.max(MIN_READ_TIMEOUT)
}

fn echo_request(identifier: u16, sequence: u16, payload: usize) -> Vec<u8> {
    let mut packet = Vec::with_capacity(ICMP_HEADER + payload);
    packet.extend_from_slice(&[ECHO_REQUEST, 0, 0, 0]);
    packet.extend_from_slice(&identifier.to_be_bytes());
    packet.extend_from_slice(&sequence.to_be_bytes());
    #[allow(clippy::cast_possible_truncation)]
    packet.extend((0..payload).map(|i| i as u8));
    let sum = checksum(&packet);
    packet[2..4].copy_from_slice(&sum.to_be_bytes());
    packet
}

fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| u32::from(u16::from_be_bytes([pair[0], pair.get(1).copied().unwrap_or(0)])))
        .fold(0, u32::wrapping_add);
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    #[allow(clippy::cast_possible_truncation)]
    let folded = sum as u16;
    !folded
}

/// Match an IPv4 datagram against the outstanding echo request.
fn is_reply(datagram: &[u8], from: Ipv4Addr, identifier: u16, sequence: u16) -> bool {
    if datagram.len() < IPV4_MIN_HEADER {
        return false;
    }
    let header = usize::from(datagram[0] & 0x0F) * 4;
    let source = Ipv4Addr::new(datagram[12], datagram[13], datagram[14], datagram[15]);
    let Some(icmp) = datagram.get(header..) else {
        return false;
    };
    icmp.len() >= ICMP_HEADER
        && icmp[0] == ECHO_REPLY
        && u16::from_be_bytes([icmp[4], icmp[5]]) == identifier
        && u16::from_be_bytes([icmp[6], icmp[7]]) == sequence
        && source == from
}
