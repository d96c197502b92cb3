//! Address classification for outbound requests
//!
//! Classifies IP addresses and hostnames from a fixed CIDR table:
//! - Loopback: 127.0.0.0/8, ::1
//! - Private: 10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16, 100.64.0.0/10 (CGNAT), fc00::/7
//! - Link-local: 169.254.0.0/16, fe80::/10
//! - Cloud metadata: 169.254.169.254, 100.100.100.200, fd00:ec2::254
//! - Reserved: current network, TEST-NETs, benchmarking, multicast, class E, documentation
//!
//! Alternate spellings of an address (decimal/octal/hex IPv4 literals,
//! IPv4-mapped/compatible/NAT64/6to4 IPv6) are folded to their canonical
//! IPv4 form before the table is consulted.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::Serialize;

/// Coarse class of a destination address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressClass {
    Loopback,
    Private,
    LinkLocal,
    Metadata,
    Reserved,
    Public,
}

impl AddressClass {
    pub fn as_str(self) -> &'static str {
        match self {
            AddressClass::Loopback => "loopback",
            AddressClass::Private => "private",
            AddressClass::LinkLocal => "link-local",
            AddressClass::Metadata => "cloud metadata",
            AddressClass::Reserved => "reserved",
            AddressClass::Public => "public",
        }
    }
}

impl fmt::Display for AddressClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
struct Ipv4Cidr {
    network: u32,
    prefix: u8,
}

impl Ipv4Cidr {
    const fn new(octets: [u8; 4], prefix: u8) -> Self {
        Ipv4Cidr {
            network: u32::from_be_bytes(octets),
            prefix,
        }
    }

    fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.prefix))
        };
        (u32::from(ip) & mask) == (self.network & mask)
    }
}

#[derive(Debug, Clone, Copy)]
struct Ipv6Cidr {
    network: u128,
    prefix: u8,
}

impl Ipv6Cidr {
    const fn new(segments: [u16; 8], prefix: u8) -> Self {
        let mut network: u128 = 0;
        let mut i = 0;
        while i < 8 {
            network = (network << 16) | segments[i] as u128;
            i += 1;
        }
        Ipv6Cidr { network, prefix }
    }

    fn contains(&self, ip: Ipv6Addr) -> bool {
        let mask = if self.prefix == 0 {
            0
        } else {
            u128::MAX << (128 - u32::from(self.prefix))
        };
        (u128::from(ip) & mask) == (self.network & mask)
    }
}

/// First match wins, so narrow entries precede the ranges that contain them.
const IPV4_RULES: &[(Ipv4Cidr, AddressClass)] = &[
    (Ipv4Cidr::new([169, 254, 169, 254], 32), AddressClass::Metadata),
    (Ipv4Cidr::new([100, 100, 100, 200], 32), AddressClass::Metadata),
    (Ipv4Cidr::new([127, 0, 0, 0], 8), AddressClass::Loopback),
    (Ipv4Cidr::new([10, 0, 0, 0], 8), AddressClass::Private),
    (Ipv4Cidr::new([172, 16, 0, 0], 12), AddressClass::Private),
    (Ipv4Cidr::new([192, 168, 0, 0], 16), AddressClass::Private),
    (Ipv4Cidr::new([100, 64, 0, 0], 10), AddressClass::Private),
    (Ipv4Cidr::new([169, 254, 0, 0], 16), AddressClass::LinkLocal),
    (Ipv4Cidr::new([0, 0, 0, 0], 8), AddressClass::Reserved),
    (Ipv4Cidr::new([192, 0, 0, 0], 24), AddressClass::Reserved),
    (Ipv4Cidr::new([192, 0, 2, 0], 24), AddressClass::Reserved),
    (Ipv4Cidr::new([198, 18, 0, 0], 15), AddressClass::Reserved),
    (Ipv4Cidr::new([198, 51, 100, 0], 24), AddressClass::Reserved),
    (Ipv4Cidr::new([203, 0, 113, 0], 24), AddressClass::Reserved),
    (Ipv4Cidr::new([224, 0, 0, 0], 4), AddressClass::Reserved),
    (Ipv4Cidr::new([240, 0, 0, 0], 4), AddressClass::Reserved),
];

const IPV6_RULES: &[(Ipv6Cidr, AddressClass)] = &[
    (
        Ipv6Cidr::new([0xfd00, 0x0ec2, 0, 0, 0, 0, 0, 0x0254], 128),
        AddressClass::Metadata,
    ),
    (Ipv6Cidr::new([0, 0, 0, 0, 0, 0, 0, 1], 128), AddressClass::Loopback),
    (Ipv6Cidr::new([0, 0, 0, 0, 0, 0, 0, 0], 128), AddressClass::Reserved),
    (Ipv6Cidr::new([0xfc00, 0, 0, 0, 0, 0, 0, 0], 7), AddressClass::Private),
    (Ipv6Cidr::new([0xfec0, 0, 0, 0, 0, 0, 0, 0], 10), AddressClass::Private),
    (Ipv6Cidr::new([0xfe80, 0, 0, 0, 0, 0, 0, 0], 10), AddressClass::LinkLocal),
    (Ipv6Cidr::new([0xff00, 0, 0, 0, 0, 0, 0, 0], 8), AddressClass::Reserved),
    (Ipv6Cidr::new([0x2001, 0x0db8, 0, 0, 0, 0, 0, 0], 32), AddressClass::Reserved),
    // Teredo hides an obfuscated IPv4 endpoint
    (Ipv6Cidr::new([0x2001, 0, 0, 0, 0, 0, 0, 0], 32), AddressClass::Reserved),
    (Ipv6Cidr::new([0x0100, 0, 0, 0, 0, 0, 0, 0], 64), AddressClass::Reserved),
];

/// Extract an IPv4 address embedded in an IPv6 address.
///
/// Covers IPv4-mapped (`::ffff:a.b.c.d`), IPv4-compatible (`::a.b.c.d`),
/// NAT64 (`64:ff9b::a.b.c.d`) and 6to4 (`2002:aabb:ccdd::/48`).
fn embedded_ipv4(ip: &Ipv6Addr) -> Option<Ipv4Addr> {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return Some(v4);
    }

    let s = ip.segments();
    let tail = Ipv4Addr::new(
        (s[6] >> 8) as u8,
        (s[6] & 0xff) as u8,
        (s[7] >> 8) as u8,
        (s[7] & 0xff) as u8,
    );

    // `::` and `::1` are not IPv4-compatible addresses
    if s[..6] == [0; 6] && s[6] != 0 {
        return Some(tail);
    }

    if s[0] == 0x0064 && s[1] == 0xff9b && s[2..6] == [0; 4] {
        return Some(tail);
    }

    if s[0] == 0x2002 {
        return Some(Ipv4Addr::new(
            (s[1] >> 8) as u8,
            (s[1] & 0xff) as u8,
            (s[2] >> 8) as u8,
            (s[2] & 0xff) as u8,
        ));
    }

    None
}

/// Fold IPv4-embedding IPv6 addresses to the IPv4 address they carry.
pub fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match embedded_ipv4(&v6) {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// Classify an address against the CIDR table.
pub fn classify(ip: IpAddr) -> AddressClass {
    match canonical_ip(ip) {
        IpAddr::V4(v4) => IPV4_RULES
            .iter()
            .find(|(cidr, _)| cidr.contains(v4))
            .map(|(_, class)| *class)
            .unwrap_or(AddressClass::Public),
        IpAddr::V6(v6) => IPV6_RULES
            .iter()
            .find(|(cidr, _)| cidr.contains(v6))
            .map(|(_, class)| *class)
            .unwrap_or(AddressClass::Public),
    }
}

/// Classify a hostname that is known to be special without a DNS lookup.
///
/// Returns `None` for ordinary names; those must be resolved and their
/// addresses classified.
pub fn classify_hostname(host: &str) -> Option<AddressClass> {
    let host = host.trim_end_matches('.').to_ascii_lowercase();

    if host == "localhost" || host == "localhost.localdomain" || host.ends_with(".localhost") {
        return Some(AddressClass::Loopback);
    }

    if host == "metadata.google.internal" || host == "metadata" || host == "instance-data" {
        return Some(AddressClass::Metadata);
    }

    if host.ends_with(".internal") {
        return Some(AddressClass::Private);
    }

    None
}

/// Parse a textual IP address, including the legacy `inet_aton` spellings.
///
/// Accepts dotted quads, bracketed or bare IPv6, a single 32-bit number
/// (`2130706433`), hex (`0x7f.1`, `0x7f000001`), leading-zero octal
/// (`0177.0.0.1`) and the 2- and 3-part short forms. IPv6 zone identifiers
/// are not accepted. The result is canonicalised with [`canonical_ip`].
pub fn parse_ip_literal(text: &str) -> Option<IpAddr> {
    let text = text.trim();
    let inner = text
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(text);

    if inner.contains('%') {
        return None;
    }

    if let Ok(ip) = inner.parse::<IpAddr>() {
        return Some(canonical_ip(ip));
    }

    parse_legacy_ipv4(inner).map(IpAddr::V4)
}

fn parse_legacy_ipv4(text: &str) -> Option<Ipv4Addr> {
    let text = text.strip_suffix('.').unwrap_or(text);
    if text.is_empty() {
        return None;
    }

    let parts: Vec<&str> = text.split('.').collect();
    if parts.len() > 4 {
        return None;
    }

    let mut numbers = Vec::with_capacity(parts.len());
    for part in &parts {
        numbers.push(parse_ipv4_number(part)?);
    }

    let (last, leading) = numbers.split_last()?;
    if leading.iter().any(|n| *n > 255) {
        return None;
    }

    let remaining_bytes = 5 - numbers.len() as u32;
    let limit: u64 = 1u64 << (8 * remaining_bytes);
    if *last >= limit {
        return None;
    }

    let mut value: u64 = 0;
    for (i, n) in leading.iter().enumerate() {
        value |= n << (8 * (3 - i as u32));
    }
    value |= last;

    u32::try_from(value).ok().map(Ipv4Addr::from)
}

fn parse_ipv4_number(part: &str) -> Option<u64> {
    if part.is_empty() {
        return None;
    }

    let (digits, radix) = if let Some(hex) = part
        .strip_prefix("0x")
        .or_else(|| part.strip_prefix("0X"))
    {
        (hex, 16)
    } else if part.len() > 1 && part.starts_with('0') {
        (&part[1..], 8)
    } else {
        (part, 10)
    };

    if digits.is_empty() {
        // "0x" alone is zero
        return Some(0);
    }

    if !digits.chars().all(|c| c.is_digit(radix)) {
        return None;
    }

    u64::from_str_radix(digits, radix)
        .ok()
        .filter(|n| *n <= u64::from(u32::MAX))
}

/// Whether a rate-limiter key (an IP literal, optionally with a port) is a
/// loopback address.
pub fn is_loopback_key(key: &str) -> bool {
    let ip = parse_ip_literal(key).or_else(|| {
        key.trim()
            .parse::<SocketAddr>()
            .ok()
            .map(|addr| addr.ip())
    });
    matches!(ip.map(classify), Some(AddressClass::Loopback))
}
