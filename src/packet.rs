use smoltcp::wire::{
    Icmpv4Packet, Icmpv6Packet, IpAddress, IpProtocol, Ipv4Packet, Ipv6Packet, TcpPacket,
    UdpPacket,
};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

/// Transport-layer protocol names the diverter understands
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Proto {
    Tcp,
    Udp,
    Icmp,
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Proto::Tcp => "TCP",
            Proto::Udp => "UDP",
            Proto::Icmp => "ICMP",
        })
    }
}

#[derive(Debug, Error)]
#[error("Invalid protocol: {0}")]
pub struct ProtoFromStrError(String);

impl FromStr for Proto {
    type Err = ProtoFromStrError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "TCP" => Ok(Proto::Tcp),
            "UDP" => Ok(Proto::Udp),
            "ICMP" => Ok(Proto::Icmp),
            _other => Err(ProtoFromStrError(s.to_owned())),
        }
    }
}

/// Canonical `(proto, ip, port)` identity of one side of a conversation.
///
/// Used as the key into the flow tables. Port is zero for ICMP.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct EndpointKey {
    pub proto: Proto,
    pub ip: IpAddr,
    pub port: u16,
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}:{}", self.proto, self.ip, self.port)
    }
}

/// Network-layer metadata cached at parse time
#[derive(Clone, Debug)]
struct IpMeta {
    /// 4 or 6
    version: u8,
    /// Offset of the transport header within the buffer
    header_len: usize,
    /// End of the transport segment (excludes link-layer padding)
    l4_end: usize,
    src: IpAddr,
    dst: IpAddr,
}

/// 5-tuple as it looked when the packet entered the diverter
#[derive(Clone, Debug)]
struct Pristine {
    src_ip: IpAddr,
    dst_ip: IpAddr,
    sport: u16,
    dport: u16,
}

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("Packet headers were not parsed")]
    NotParsed,
    #[error("Address {addr} does not match the IPv{ipver} header")]
    AddressFamily { addr: IpAddr, ipver: u8 },
    #[error("Packet has no TCP/UDP header to rewrite")]
    NoTransport,
}

/// Mutable view over one captured datagram.
///
/// Owns the raw octets handed over by the capture backend. Header fields of
/// interest are parsed once at construction; rewrites serialize back into the
/// octets, keep the IP and transport checksums consistent, and flip the
/// `mangled` flag so the pipeline knows to re-capture and re-inject.
///
/// If the octets do not parse as IPv4/IPv6, the view is degraded:
/// `is_parsed()` is false, `proto()` is `None` and the packet traverses the
/// pipeline untouched.
pub struct PacketView {
    buf: Vec<u8>,
    label: &'static str,
    ip: Option<IpMeta>,
    proto: Option<Proto>,
    sport: u16,
    dport: u16,
    icmp: Option<(u8, u8)>,
    pristine: Option<Pristine>,
    mangled: bool,
}

impl PacketView {
    /// Parse a raw IP datagram. Never fails; malformed input yields a
    /// degraded view that the pipeline logs and passes through.
    pub fn parse(octets: Vec<u8>, label: &'static str) -> Self {
        let (ip, proto, sport, dport, icmp) = match parse_headers(&octets) {
            Some(parsed) => parsed,
            None => (None, None, 0, 0, None),
        };
        let pristine = ip.as_ref().map(|meta| Pristine {
            src_ip: meta.src,
            dst_ip: meta.dst,
            sport,
            dport,
        });
        PacketView {
            buf: octets,
            label,
            ip,
            proto,
            sport,
            dport,
            icmp,
            pristine,
            mangled: false,
        }
    }

    pub fn is_parsed(&self) -> bool {
        self.ip.is_some()
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn mangled(&self) -> bool {
        self.mangled
    }

    pub fn octets(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_octets(self) -> Vec<u8> {
        self.buf
    }

    pub fn ipver(&self) -> Option<u8> {
        self.ip.as_ref().map(|ip| ip.version)
    }

    pub fn proto(&self) -> Option<Proto> {
        self.proto
    }

    pub fn is_icmp(&self) -> bool {
        self.icmp.is_some()
    }

    pub fn icmp_type(&self) -> Option<u8> {
        self.icmp.map(|(ty, _)| ty)
    }

    pub fn icmp_code(&self) -> Option<u8> {
        self.icmp.map(|(_, code)| code)
    }

    pub fn src_ip(&self) -> Option<IpAddr> {
        self.ip.as_ref().map(|ip| ip.src)
    }

    pub fn dst_ip(&self) -> Option<IpAddr> {
        self.ip.as_ref().map(|ip| ip.dst)
    }

    /// Source port; zero when there is no TCP/UDP header
    pub fn sport(&self) -> u16 {
        self.sport
    }

    pub fn dport(&self) -> u16 {
        self.dport
    }

    pub fn src_ip0(&self) -> Option<IpAddr> {
        self.pristine.as_ref().map(|p| p.src_ip)
    }

    pub fn dst_ip0(&self) -> Option<IpAddr> {
        self.pristine.as_ref().map(|p| p.dst_ip)
    }

    pub fn sport0(&self) -> u16 {
        self.pristine.as_ref().map(|p| p.sport).unwrap_or(0)
    }

    pub fn dport0(&self) -> u16 {
        self.pristine.as_ref().map(|p| p.dport).unwrap_or(0)
    }

    /// Key of the source endpoint, derived from the *current* fields
    pub fn skey(&self) -> Option<EndpointKey> {
        let ip = self.ip.as_ref()?;
        let proto = self.proto?;
        Some(EndpointKey {
            proto,
            ip: ip.src,
            port: self.sport,
        })
    }

    /// Key of the destination endpoint, derived from the *current* fields
    pub fn dkey(&self) -> Option<EndpointKey> {
        let ip = self.ip.as_ref()?;
        let proto = self.proto?;
        Some(EndpointKey {
            proto,
            ip: ip.dst,
            port: self.dport,
        })
    }

    pub fn set_src_ip(&mut self, addr: IpAddr) -> Result<(), RewriteError> {
        self.set_ip_field(addr, true)
    }

    pub fn set_dst_ip(&mut self, addr: IpAddr) -> Result<(), RewriteError> {
        self.set_ip_field(addr, false)
    }

    fn set_ip_field(&mut self, addr: IpAddr, src: bool) -> Result<(), RewriteError> {
        let (version, header_len) = {
            let ip = self.ip.as_ref().ok_or(RewriteError::NotParsed)?;
            (ip.version, ip.header_len)
        };
        match (version, addr) {
            (4, IpAddr::V4(v4)) => {
                let mut pkt = Ipv4Packet::new_unchecked(&mut self.buf[..header_len]);
                if src {
                    pkt.set_src_addr(v4);
                } else {
                    pkt.set_dst_addr(v4);
                }
                pkt.fill_checksum();
            }
            (6, IpAddr::V6(v6)) => {
                let mut pkt = Ipv6Packet::new_unchecked(&mut self.buf[..]);
                if src {
                    pkt.set_src_addr(v6);
                } else {
                    pkt.set_dst_addr(v6);
                }
            }
            (ipver, addr) => return Err(RewriteError::AddressFamily { addr, ipver }),
        }
        if let Some(ip) = self.ip.as_mut() {
            if src {
                ip.src = addr;
            } else {
                ip.dst = addr;
            }
        }
        self.fill_transport_checksum();
        self.mangled = true;
        Ok(())
    }

    pub fn set_sport(&mut self, port: u16) -> Result<(), RewriteError> {
        self.set_port_field(port, true)
    }

    pub fn set_dport(&mut self, port: u16) -> Result<(), RewriteError> {
        self.set_port_field(port, false)
    }

    fn set_port_field(&mut self, port: u16, src: bool) -> Result<(), RewriteError> {
        let (header_len, l4_end) = {
            let ip = self.ip.as_ref().ok_or(RewriteError::NotParsed)?;
            (ip.header_len, ip.l4_end)
        };
        let l4 = &mut self.buf[header_len..l4_end];
        match self.proto {
            Some(Proto::Tcp) => {
                let mut tcp = TcpPacket::new_unchecked(l4);
                if src {
                    tcp.set_src_port(port);
                } else {
                    tcp.set_dst_port(port);
                }
            }
            Some(Proto::Udp) => {
                let mut udp = UdpPacket::new_unchecked(l4);
                if src {
                    udp.set_src_port(port);
                } else {
                    udp.set_dst_port(port);
                }
            }
            _ => return Err(RewriteError::NoTransport),
        }
        if src {
            self.sport = port;
        } else {
            self.dport = port;
        }
        self.fill_transport_checksum();
        self.mangled = true;
        Ok(())
    }

    /// Recompute the transport checksum against the current addresses.
    /// TCP/UDP checksums cover a pseudo-header, as does ICMPv6.
    fn fill_transport_checksum(&mut self) {
        let (version, header_len, l4_end, src, dst) = match self.ip.as_ref() {
            Some(ip) => (ip.version, ip.header_len, ip.l4_end, ip.src, ip.dst),
            None => return,
        };
        let src = smol_addr(src);
        let dst = smol_addr(dst);
        let l4 = &mut self.buf[header_len..l4_end];
        match self.proto {
            Some(Proto::Tcp) => {
                let mut tcp = TcpPacket::new_unchecked(l4);
                tcp.fill_checksum(&src, &dst);
            }
            Some(Proto::Udp) => {
                let mut udp = UdpPacket::new_unchecked(l4);
                // A zero checksum on IPv4 UDP means "not computed"; keep it
                if !(version == 4 && udp.checksum() == 0) {
                    udp.fill_checksum(&src, &dst);
                }
            }
            Some(Proto::Icmp) if version == 6 => {
                if let (IpAddress::Ipv6(src6), IpAddress::Ipv6(dst6)) = (src, dst) {
                    let mut icmp = Icmpv6Packet::new_unchecked(l4);
                    icmp.fill_checksum(&src6, &dst6);
                }
            }
            _ => {}
        }
    }

    /// One-line rendering of the current header fields for log output
    pub fn hdr_to_str(&self) -> String {
        match (self.ip.as_ref(), self.proto) {
            (Some(ip), Some(proto @ (Proto::Tcp | Proto::Udp))) => format!(
                "{proto} {}:{} -> {}:{}",
                ip.src, self.sport, ip.dst, self.dport
            ),
            (Some(ip), Some(Proto::Icmp)) => format!("ICMP {} -> {}", ip.src, ip.dst),
            (Some(ip), None) => format!("IP {} -> {}", ip.src, ip.dst),
            _ => String::from("unparsed packet"),
        }
    }

    /// TCP flag list and seq/ack pair for the verbose packet log line
    pub(crate) fn tcp_flags_seqack(&self) -> Option<(String, String)> {
        let ip = self.ip.as_ref()?;
        if self.proto != Some(Proto::Tcp) {
            return None;
        }
        let tcp = TcpPacket::new_checked(&self.buf[ip.header_len..ip.l4_end]).ok()?;
        let mut flags = Vec::new();
        if tcp.rst() {
            flags.push("RST");
        }
        if tcp.syn() {
            flags.push("SYN");
        }
        if tcp.ack() {
            flags.push("ACK");
        }
        if tcp.fin() {
            flags.push("FIN");
        }
        if tcp.psh() {
            flags.push("PSH");
        }
        let seqack = format!(
            "Seq={}, Ack={}",
            tcp.seq_number().0,
            tcp.ack_number().0
        );
        Some((flags.join(","), seqack))
    }
}

impl fmt::Debug for PacketView {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PacketView")
            .field("label", &self.label)
            .field("hdr", &self.hdr_to_str())
            .field("mangled", &self.mangled)
            .finish()
    }
}

fn smol_addr(ip: IpAddr) -> IpAddress {
    match ip {
        IpAddr::V4(v4) => IpAddress::Ipv4(v4),
        IpAddr::V6(v6) => IpAddress::Ipv6(v6),
    }
}

type ParsedHeaders = (
    Option<IpMeta>,
    Option<Proto>,
    u16,
    u16,
    Option<(u8, u8)>,
);

fn parse_headers(buf: &[u8]) -> Option<ParsedHeaders> {
    let first = buf.first()?;
    match first >> 4 {
        4 => {
            let pkt = Ipv4Packet::new_checked(buf).ok()?;
            let header_len = usize::from(pkt.header_len());
            let l4_end = usize::from(pkt.total_len()).min(buf.len());
            let meta = IpMeta {
                version: 4,
                header_len,
                l4_end,
                src: IpAddr::V4(pkt.src_addr()),
                dst: IpAddr::V4(pkt.dst_addr()),
            };
            let next = pkt.next_header();
            let (proto, sport, dport, icmp) = parse_l4(next, &buf[header_len..l4_end]);
            Some((Some(meta), proto, sport, dport, icmp))
        }
        6 => {
            let pkt = Ipv6Packet::new_checked(buf).ok()?;
            let header_len = pkt.header_len();
            let l4_end = (header_len + usize::from(pkt.payload_len())).min(buf.len());
            let meta = IpMeta {
                version: 6,
                header_len,
                l4_end,
                src: IpAddr::V6(pkt.src_addr()),
                dst: IpAddr::V6(pkt.dst_addr()),
            };
            let next = pkt.next_header();
            let (proto, sport, dport, icmp) = parse_l4(next, &buf[header_len..l4_end]);
            Some((Some(meta), proto, sport, dport, icmp))
        }
        _ => None,
    }
}

fn parse_l4(next: IpProtocol, payload: &[u8]) -> (Option<Proto>, u16, u16, Option<(u8, u8)>) {
    match next {
        IpProtocol::Tcp => match TcpPacket::new_checked(payload) {
            Ok(tcp) => (Some(Proto::Tcp), tcp.src_port(), tcp.dst_port(), None),
            Err(_) => (None, 0, 0, None),
        },
        IpProtocol::Udp => match UdpPacket::new_checked(payload) {
            Ok(udp) => (Some(Proto::Udp), udp.src_port(), udp.dst_port(), None),
            Err(_) => (None, 0, 0, None),
        },
        IpProtocol::Icmp => match Icmpv4Packet::new_checked(payload) {
            Ok(icmp) => (
                Some(Proto::Icmp),
                0,
                0,
                Some((u8::from(icmp.msg_type()), icmp.msg_code())),
            ),
            Err(_) => (None, 0, 0, None),
        },
        IpProtocol::Icmpv6 => match Icmpv6Packet::new_checked(payload) {
            Ok(icmp) => (
                Some(Proto::Icmp),
                0,
                0,
                Some((u8::from(icmp.msg_type()), icmp.msg_code())),
            ),
            Err(_) => (None, 0, 0, None),
        },
        _other => (None, 0, 0, None),
    }
}
