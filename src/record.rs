//! Ban-record binary codec.
//!
//! A ban record is a self-describing sequence of typed fields describing a
//! firewall match target with an absolute expiration time. The first field
//! is always the expiration (tag byte + signed 64-bit tick count, network
//! byte order); every following field is a one-byte type tag followed by a
//! fixed-size payload. The record's content hash is an MD5 digest over all
//! bytes after the expiration field, so renewing a ban for the same target
//! never changes its hash.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::SystemTime;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::error::{Error, Result};

/// 100ns ticks per second.
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// Tick count of the Unix epoch (1970-01-01) relative to the tick epoch
/// (0001-01-01 UTC).
pub const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;

/// Prefix of the textual rule-name encoding.
pub const NAME_PREFIX: &str = "F2B B64 ";

/// Current rule-name encoding version.
pub const NAME_VERSION: u8 = 1;

/// Size of the leading expiration field (tag + i64).
pub const EXPIRATION_SIZE: usize = 1 + 8;

/// MD5 digest identifying a record's match target across renewals.
pub type ContentHash = [u8; 16];

/// Current time in 100ns ticks since the tick epoch.
pub fn ticks_now() -> i64 {
    let unix = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    UNIX_EPOCH_TICKS + unix.as_nanos() as i64 / 100
}

/// Field type tags of the record wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldTag {
    Expiration = 0,
    Ipv4 = 1,
    Ipv4Prefix = 2,
    Ipv4Range = 3,
    Ipv6 = 4,
    Ipv6Prefix = 5,
    Ipv6Range = 6,
    Port = 7,
    PortRange = 8,
    Protocol = 9,
}

impl FieldTag {
    /// Decode a wire tag byte.
    pub fn from_u8(tag: u8) -> Option<FieldTag> {
        match tag {
            0 => Some(FieldTag::Expiration),
            1 => Some(FieldTag::Ipv4),
            2 => Some(FieldTag::Ipv4Prefix),
            3 => Some(FieldTag::Ipv4Range),
            4 => Some(FieldTag::Ipv6),
            5 => Some(FieldTag::Ipv6Prefix),
            6 => Some(FieldTag::Ipv6Range),
            7 => Some(FieldTag::Port),
            8 => Some(FieldTag::PortRange),
            9 => Some(FieldTag::Protocol),
            _ => None,
        }
    }

    /// Encoded size of this field including the tag byte.
    pub fn encoded_size(self) -> usize {
        match self {
            FieldTag::Expiration => 1 + 8,
            FieldTag::Ipv4 => 1 + 4,
            FieldTag::Ipv4Prefix => 1 + 4 + 1,
            FieldTag::Ipv4Range => 1 + 4 + 4,
            FieldTag::Ipv6 => 1 + 16,
            FieldTag::Ipv6Prefix => 1 + 16 + 1,
            FieldTag::Ipv6Range => 1 + 16 + 16,
            FieldTag::Port => 1 + 2,
            FieldTag::PortRange => 1 + 2 + 2,
            FieldTag::Protocol => 1 + 1,
        }
    }
}

/// A decoded match-target field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Ipv4(Ipv4Addr),
    Ipv4Prefix(Ipv4Addr, u8),
    Ipv4Range(Ipv4Addr, Ipv4Addr),
    Ipv6(Ipv6Addr),
    Ipv6Prefix(Ipv6Addr, u8),
    Ipv6Range(Ipv6Addr, Ipv6Addr),
    Port(u16),
    PortRange(u16, u16),
    Protocol(u8),
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Ipv4(a) => write!(f, "address={}", a),
            Field::Ipv4Prefix(a, p) => write!(f, "address={}/{}", a, p),
            Field::Ipv4Range(lo, hi) => write!(f, "address={}-{}", lo, hi),
            Field::Ipv6(a) => write!(f, "address={}", a),
            Field::Ipv6Prefix(a, p) => write!(f, "address={}/{}", a, p),
            Field::Ipv6Range(lo, hi) => write!(f, "address={}-{}", lo, hi),
            Field::Port(p) => write!(f, "port={}", p),
            Field::PortRange(lo, hi) => write!(f, "port={}-{}", lo, hi),
            Field::Protocol(p) => write!(f, "protocol={}", p),
        }
    }
}

/// A validated ban record.
///
/// Holds the exact wire bytes; encoding is never canonicalized or
/// reordered so identical field sequences hash identically across
/// producers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanRecord {
    bytes: Vec<u8>,
}

impl BanRecord {
    /// Validate wire bytes and take ownership of them.
    ///
    /// Fails closed: an unknown tag or a field that does not fit in the
    /// remaining buffer rejects the whole record.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<BanRecord> {
        Self::validate(&bytes)?;
        Ok(BanRecord { bytes })
    }

    fn validate(bytes: &[u8]) -> Result<()> {
        peek_expiration(bytes)?;

        let mut pos = EXPIRATION_SIZE;
        while pos < bytes.len() {
            let tag = FieldTag::from_u8(bytes[pos]).ok_or_else(|| {
                Error::MalformedRecord(format!("unknown field tag {}", bytes[pos]))
            })?;
            if tag == FieldTag::Expiration {
                return Err(Error::MalformedRecord(
                    "duplicate expiration field".to_string(),
                ));
            }
            if bytes.len() < pos + tag.encoded_size() {
                return Err(Error::MalformedRecord(format!(
                    "truncated field with tag {}",
                    bytes[pos]
                )));
            }
            pos += tag.encoded_size();
        }

        Ok(())
    }

    /// Absolute expiration in ticks.
    pub fn expiration(&self) -> i64 {
        i64::from_be_bytes(self.bytes[1..9].try_into().unwrap())
    }

    /// MD5 digest over everything after the expiration field.
    pub fn content_hash(&self) -> ContentHash {
        md5::compute(&self.bytes[EXPIRATION_SIZE..]).0
    }

    /// External rule name for this record.
    pub fn rule_name(&self) -> String {
        encode_name(self.expiration(), &self.content_hash())
    }

    /// Raw wire bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume the record and return its wire bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Iterate the match-target fields (expiration excluded).
    pub fn fields(&self) -> Fields<'_> {
        Fields {
            bytes: &self.bytes,
            pos: EXPIRATION_SIZE,
        }
    }
}

impl fmt::Display for BanRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BanRecord[expiration={},md5={}](",
            self.expiration(),
            hex_colon(&self.content_hash())
        )?;
        for (i, field) in self.fields().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", field)?;
        }
        write!(f, ")")
    }
}

/// Iterator over a record's decoded fields.
pub struct Fields<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Iterator for Fields<'_> {
    type Item = Field;

    fn next(&mut self) -> Option<Field> {
        if self.pos >= self.bytes.len() {
            return None;
        }
        // validated on construction, so tag and size always hold
        let tag = FieldTag::from_u8(self.bytes[self.pos])?;
        let p = &self.bytes[self.pos + 1..self.pos + tag.encoded_size()];
        self.pos += tag.encoded_size();

        let v4 = |b: &[u8]| Ipv4Addr::new(b[0], b[1], b[2], b[3]);
        let v6 = |b: &[u8]| Ipv6Addr::from(<[u8; 16]>::try_from(b).unwrap());

        Some(match tag {
            FieldTag::Expiration => return None,
            FieldTag::Ipv4 => Field::Ipv4(v4(p)),
            FieldTag::Ipv4Prefix => Field::Ipv4Prefix(v4(&p[..4]), p[4]),
            FieldTag::Ipv4Range => Field::Ipv4Range(v4(&p[..4]), v4(&p[4..])),
            FieldTag::Ipv6 => Field::Ipv6(v6(p)),
            FieldTag::Ipv6Prefix => Field::Ipv6Prefix(v6(&p[..16]), p[16]),
            FieldTag::Ipv6Range => Field::Ipv6Range(v6(&p[..16]), v6(&p[16..])),
            FieldTag::Port => Field::Port(u16::from_be_bytes([p[0], p[1]])),
            FieldTag::PortRange => Field::PortRange(
                u16::from_be_bytes([p[0], p[1]]),
                u16::from_be_bytes([p[2], p[3]]),
            ),
            FieldTag::Protocol => Field::Protocol(p[0]),
        })
    }
}

/// Incremental ban-record encoder.
///
/// Fields are written in the order they are added; callers that need hash
/// stability across producers must add them in a consistent order.
pub struct RecordBuilder {
    buf: Vec<u8>,
}

impl RecordBuilder {
    /// Start a record expiring at the given tick count.
    pub fn new(expiration: i64) -> RecordBuilder {
        let mut buf = Vec::with_capacity(EXPIRATION_SIZE + 17);
        buf.push(FieldTag::Expiration as u8);
        buf.extend_from_slice(&expiration.to_be_bytes());
        RecordBuilder { buf }
    }

    /// Add a single address. IPv4-mapped IPv6 addresses are stored as IPv4.
    pub fn add_addr(&mut self, addr: IpAddr) {
        match normalize(addr) {
            IpAddr::V4(a) => {
                self.buf.push(FieldTag::Ipv4 as u8);
                self.buf.extend_from_slice(&a.octets());
            }
            IpAddr::V6(a) => {
                self.buf.push(FieldTag::Ipv6 as u8);
                self.buf.extend_from_slice(&a.octets());
            }
        }
    }

    /// Add an address with a prefix length.
    ///
    /// A v4-mapped address has its prefix reduced by the 96 bits of the
    /// mapping, mirroring the address normalization.
    pub fn add_addr_prefix(&mut self, addr: IpAddr, mut prefix: u8) {
        let mapped = matches!(addr, IpAddr::V6(a) if a.to_ipv4_mapped().is_some());
        match normalize(addr) {
            IpAddr::V4(a) => {
                if mapped && prefix >= 96 {
                    prefix -= 96;
                }
                self.buf.push(FieldTag::Ipv4Prefix as u8);
                self.buf.extend_from_slice(&a.octets());
                self.buf.push(prefix);
            }
            IpAddr::V6(a) => {
                self.buf.push(FieldTag::Ipv6Prefix as u8);
                self.buf.extend_from_slice(&a.octets());
                self.buf.push(prefix);
            }
        }
    }

    /// Add an inclusive address range. Both ends must share a family.
    pub fn add_addr_range(&mut self, low: IpAddr, high: IpAddr) -> Result<()> {
        match (normalize(low), normalize(high)) {
            (IpAddr::V4(lo), IpAddr::V4(hi)) => {
                self.buf.push(FieldTag::Ipv4Range as u8);
                self.buf.extend_from_slice(&lo.octets());
                self.buf.extend_from_slice(&hi.octets());
                Ok(())
            }
            (IpAddr::V6(lo), IpAddr::V6(hi)) => {
                self.buf.push(FieldTag::Ipv6Range as u8);
                self.buf.extend_from_slice(&lo.octets());
                self.buf.extend_from_slice(&hi.octets());
                Ok(())
            }
            _ => Err(Error::MalformedRecord(
                "mixed IPv4 and IPv6 range".to_string(),
            )),
        }
    }

    /// Add a single port.
    pub fn add_port(&mut self, port: u16) {
        self.buf.push(FieldTag::Port as u8);
        self.buf.extend_from_slice(&port.to_be_bytes());
    }

    /// Add an inclusive port range.
    pub fn add_port_range(&mut self, low: u16, high: u16) {
        self.buf.push(FieldTag::PortRange as u8);
        self.buf.extend_from_slice(&low.to_be_bytes());
        self.buf.extend_from_slice(&high.to_be_bytes());
    }

    /// Add an IP protocol number.
    pub fn add_protocol(&mut self, protocol: u8) {
        self.buf.push(FieldTag::Protocol as u8);
        self.buf.push(protocol);
    }

    /// Finish encoding.
    pub fn build(self) -> BanRecord {
        BanRecord { bytes: self.buf }
    }
}

fn normalize(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(a) => match a.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => addr,
        },
        v4 => v4,
    }
}

/// Read the expiration from raw record bytes without full validation.
pub fn peek_expiration(bytes: &[u8]) -> Result<i64> {
    if bytes.len() < EXPIRATION_SIZE {
        return Err(Error::MalformedRecord(
            "truncated record (no expiration field)".to_string(),
        ));
    }
    if bytes[0] != FieldTag::Expiration as u8 {
        return Err(Error::MalformedRecord(
            "record does not start with an expiration field".to_string(),
        ));
    }
    Ok(i64::from_be_bytes(bytes[1..9].try_into().unwrap()))
}

/// Encode (expiration, hash) into a self-identifying rule name.
///
/// The name carries enough to rebuild an index entry from the external
/// rule table alone. The embedded expiration is little-endian, matching
/// names already present on enforcement hosts; record bodies stay in
/// network byte order.
pub fn encode_name(expiration: i64, hash: &ContentHash) -> String {
    let mut raw = Vec::with_capacity(4 + 8 + hash.len());
    raw.extend_from_slice(b"F2B");
    raw.push(NAME_VERSION);
    raw.extend_from_slice(&expiration.to_le_bytes());
    raw.extend_from_slice(hash);

    format!("{}{}", NAME_PREFIX, BASE64.encode(raw))
}

/// Decode a rule name back into (expiration, hash).
pub fn decode_name(name: &str) -> Result<(i64, ContentHash)> {
    let b64 = name
        .strip_prefix(NAME_PREFIX)
        .ok_or_else(|| Error::InvalidRuleName(format!("missing prefix: {}", name)))?;

    let raw = BASE64
        .decode(b64)
        .map_err(|e| Error::InvalidRuleName(format!("bad base64 ({}): {}", e, name)))?;

    if raw.len() < 4 || &raw[..3] != b"F2B" {
        return Err(Error::InvalidRuleName(format!("bad header: {}", name)));
    }
    if raw[3] != NAME_VERSION {
        return Err(Error::InvalidRuleName(format!(
            "unknown version {}: {}",
            raw[3], name
        )));
    }
    if raw.len() != 4 + 8 + 16 {
        return Err(Error::InvalidRuleName(format!("bad length: {}", name)));
    }

    let expiration = i64::from_le_bytes(raw[4..12].try_into().unwrap());
    let hash: ContentHash = raw[12..28].try_into().unwrap();
    Ok((expiration, hash))
}

/// Format a hash as colon-separated hex for logs.
pub fn hex_colon(hash: &ContentHash) -> String {
    hash.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(expiration: i64) -> BanRecord {
        let mut b = RecordBuilder::new(expiration);
        b.add_addr("192.0.2.7".parse().unwrap());
        b.add_port(22);
        b.build()
    }

    #[test]
    fn test_roundtrip() {
        let rec = sample(1234);
        let parsed = BanRecord::from_bytes(rec.as_bytes().to_vec()).unwrap();
        assert_eq!(parsed.expiration(), 1234);
        let fields: Vec<_> = parsed.fields().collect();
        assert_eq!(
            fields,
            vec![
                Field::Ipv4("192.0.2.7".parse().unwrap()),
                Field::Port(22),
            ]
        );
    }

    #[test]
    fn test_hash_ignores_expiration() {
        let a = sample(1000);
        let b = sample(2000);
        assert_eq!(a.content_hash(), b.content_hash());
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_hash_reencoding_stable() {
        let a = sample(1000);
        let b = sample(1000);
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_hash_differs_per_target() {
        let a = sample(1000);
        let mut b = RecordBuilder::new(1000);
        b.add_addr("192.0.2.8".parse().unwrap());
        b.add_port(22);
        assert_ne!(a.content_hash(), b.build().content_hash());
    }

    #[test]
    fn test_reject_unknown_tag() {
        let mut bytes = sample(1000).into_bytes();
        bytes.push(200);
        assert!(BanRecord::from_bytes(bytes).is_err());
    }

    #[test]
    fn test_reject_truncated_field() {
        let mut bytes = sample(1000).into_bytes();
        bytes.push(FieldTag::Ipv6 as u8);
        bytes.extend_from_slice(&[0u8; 4]); // needs 16
        assert!(BanRecord::from_bytes(bytes).is_err());
    }

    #[test]
    fn test_reject_missing_expiration() {
        assert!(BanRecord::from_bytes(vec![FieldTag::Ipv4 as u8, 1, 2, 3, 4]).is_err());
        assert!(BanRecord::from_bytes(vec![]).is_err());
    }

    #[test]
    fn test_reject_duplicate_expiration() {
        let mut bytes = sample(1000).into_bytes();
        bytes.push(FieldTag::Expiration as u8);
        bytes.extend_from_slice(&2000i64.to_be_bytes());
        assert!(BanRecord::from_bytes(bytes).is_err());
    }

    #[test]
    fn test_v4_mapped_normalization() {
        let mut a = RecordBuilder::new(1);
        a.add_addr("::ffff:10.0.0.1".parse().unwrap());
        let mut b = RecordBuilder::new(1);
        b.add_addr("10.0.0.1".parse().unwrap());
        assert_eq!(a.build().as_bytes(), b.build().as_bytes());

        let mut c = RecordBuilder::new(1);
        c.add_addr_prefix("::ffff:10.0.0.0".parse().unwrap(), 120);
        let mut d = RecordBuilder::new(1);
        d.add_addr_prefix("10.0.0.0".parse().unwrap(), 24);
        assert_eq!(c.build().as_bytes(), d.build().as_bytes());
    }

    #[test]
    fn test_mixed_range_rejected() {
        let mut b = RecordBuilder::new(1);
        let res = b.add_addr_range(
            "10.0.0.1".parse().unwrap(),
            "2001:db8::1".parse().unwrap(),
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_name_roundtrip() {
        let hash: ContentHash = [7; 16];
        for exp in [0i64, 1, -1, i64::MAX, i64::MIN, 636_000_000_000_000_000] {
            let name = encode_name(exp, &hash);
            assert!(name.starts_with(NAME_PREFIX));
            assert_eq!(decode_name(&name).unwrap(), (exp, hash));
        }
    }

    #[test]
    fn test_name_rejects_garbage() {
        assert!(decode_name("no prefix").is_err());
        assert!(decode_name("F2B B64 !!!not-base64!!!").is_err());
        // valid base64, wrong header
        let bogus = format!("{}{}", NAME_PREFIX, BASE64.encode(b"XYZ\x01aaaaaaaaaaaaaaaaaaaaaaaa"));
        assert!(decode_name(&bogus).is_err());
        // unknown version
        let mut raw = b"F2B".to_vec();
        raw.push(9);
        raw.extend_from_slice(&[0u8; 24]);
        assert!(decode_name(&format!("{}{}", NAME_PREFIX, BASE64.encode(raw))).is_err());
    }

    #[test]
    fn test_display() {
        let mut b = RecordBuilder::new(42);
        b.add_addr("192.0.2.1".parse().unwrap());
        b.add_port_range(1000, 2000);
        b.add_protocol(6);
        let s = b.build().to_string();
        assert!(s.contains("expiration=42"));
        assert!(s.contains("address=192.0.2.1"));
        assert!(s.contains("port=1000-2000"));
        assert!(s.contains("protocol=6"));
    }

    #[test]
    fn test_ticks_now_is_past_unix_epoch() {
        assert!(ticks_now() > UNIX_EPOCH_TICKS);
    }
}
