//! Accounting event decoding for raw perf ring buffer samples.
//!
//! The kernel probe emits a fixed-width, packed record per conntrack flow
//! update or teardown. The length check happens once per sample, then
//! fixed-offset reads decode the record in native endianness (the record
//! never crosses a machine boundary).

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::Serialize;
use thiserror::Error;

/// Size in bytes of the packed kernel accounting record.
///
/// Must match the probe's emitted struct exactly; also used by the pipeline
/// for byte-throughput accounting.
pub const EVENT_LENGTH: usize = 92;

/// Kind of accounting event.
///
/// The wire record carries no kind field; the kind derives from which kernel
/// hook emitted the sample (flow refresh vs. flow destroy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum EventKind {
    Update = 1,
    Destroy = 2,
}

impl EventKind {
    /// Returns the canonical log/label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Destroy => "destroy",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key uniquely identifying a tracked flow within this system.
///
/// `connection_id` is the kernel's conntrack entry handle, which is only
/// unique within a network namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub net_ns: u32,
    pub connection_id: u32,
}

/// A decoded flow accounting record.
///
/// Events are value types: copied into channels, never shared by reference.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Monotonic kernel nanoseconds since boot.
    pub timestamp_ns: u64,
    /// Opaque kernel handle for the conntrack entry.
    pub connection_id: u32,
    /// 32-bit connection mark.
    pub connmark: u32,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    /// Zero for non-L4 protocols.
    pub src_port: u16,
    pub dst_port: u16,
    pub packets_orig: u64,
    pub bytes_orig: u64,
    pub packets_ret: u64,
    pub bytes_ret: u64,
    /// Network namespace inode.
    pub net_ns: u32,
    /// L4 protocol number.
    pub proto: u8,
    pub kind: EventKind,
}

/// Errors that can occur while decoding a sample.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("event too short: {size} bytes, need {EVENT_LENGTH}")]
    Truncated { size: usize },
}

impl Event {
    /// Decode a raw ring buffer sample into an [`Event`].
    ///
    /// `kind` is supplied by the reader based on the hook the sample arrived
    /// from. Trailing bytes beyond [`EVENT_LENGTH`] are ignored.
    pub fn decode(data: &[u8], kind: EventKind) -> Result<Self, DecodeError> {
        if data.len() < EVENT_LENGTH {
            return Err(DecodeError::Truncated { size: data.len() });
        }

        Ok(Self {
            timestamp_ns: read_u64_ne(data, 0),
            connection_id: read_u32_ne(data, 8),
            connmark: read_u32_ne(data, 12),
            src_addr: read_addr(data, 16),
            dst_addr: read_addr(data, 32),
            src_port: read_u16_ne(data, 48),
            dst_port: read_u16_ne(data, 50),
            packets_orig: read_u64_ne(data, 52),
            bytes_orig: read_u64_ne(data, 60),
            packets_ret: read_u64_ne(data, 68),
            bytes_ret: read_u64_ne(data, 76),
            net_ns: read_u32_ne(data, 84),
            proto: data[88],
            kind,
        })
    }

    /// Returns the flow key for this event.
    pub fn flow_key(&self) -> FlowKey {
        FlowKey {
            net_ns: self.net_ns,
            connection_id: self.connection_id,
        }
    }

    /// Returns true when the flow's addresses are IPv6.
    pub fn is_ipv6(&self) -> bool {
        self.src_addr.is_ipv6()
    }

    /// Canonical protocol label: well-known L4 names, decimal otherwise.
    pub fn proto_label(&self) -> String {
        match self.proto {
            1 => "icmp".to_string(),
            6 => "tcp".to_string(),
            17 => "udp".to_string(),
            58 => "icmpv6".to_string(),
            132 => "sctp".to_string(),
            other => other.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Fixed-width read helpers
// ---------------------------------------------------------------------------

#[inline(always)]
fn read_u16_ne(data: &[u8], offset: usize) -> u16 {
    u16::from_ne_bytes(read_fixed::<2>(data, offset))
}

#[inline(always)]
fn read_u32_ne(data: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes(read_fixed::<4>(data, offset))
}

#[inline(always)]
fn read_u64_ne(data: &[u8], offset: usize) -> u64 {
    u64::from_ne_bytes(read_fixed::<8>(data, offset))
}

#[inline(always)]
fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    debug_assert!(offset + N <= data.len());
    // Safety: `Event::decode` verifies `data.len() >= EVENT_LENGTH` before
    // any fixed-offset read.
    unsafe { (data.as_ptr().add(offset) as *const [u8; N]).read_unaligned() }
}

/// Decode a 16-byte address field. An IPv4 address occupies the low 4 bytes
/// with the remainder zeroed; anything else is IPv6.
fn read_addr(data: &[u8], offset: usize) -> IpAddr {
    let raw = read_fixed::<16>(data, offset);
    if raw[4..].iter().all(|&b| b == 0) {
        IpAddr::V4(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]))
    } else {
        IpAddr::V6(Ipv6Addr::from(raw))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a full 92-byte accounting record.
    #[allow(clippy::too_many_arguments)]
    fn record(
        ts: u64,
        conn_id: u32,
        connmark: u32,
        src: [u8; 16],
        dst: [u8; 16],
        src_port: u16,
        dst_port: u16,
        counters: [u64; 4],
        net_ns: u32,
        proto: u8,
    ) -> Vec<u8> {
        let mut buf = Vec::with_capacity(EVENT_LENGTH);
        buf.extend_from_slice(&ts.to_ne_bytes());
        buf.extend_from_slice(&conn_id.to_ne_bytes());
        buf.extend_from_slice(&connmark.to_ne_bytes());
        buf.extend_from_slice(&src);
        buf.extend_from_slice(&dst);
        buf.extend_from_slice(&src_port.to_ne_bytes());
        buf.extend_from_slice(&dst_port.to_ne_bytes());
        for c in counters {
            buf.extend_from_slice(&c.to_ne_bytes());
        }
        buf.extend_from_slice(&net_ns.to_ne_bytes());
        buf.push(proto);
        buf.extend_from_slice(&[0u8; 3]); // pad
        buf
    }

    fn v4(a: u8, b: u8, c: u8, d: u8) -> [u8; 16] {
        let mut addr = [0u8; 16];
        addr[..4].copy_from_slice(&[a, b, c, d]);
        addr
    }

    #[test]
    fn test_record_length() {
        let data = record(
            1,
            2,
            3,
            v4(10, 0, 0, 1),
            v4(10, 0, 0, 2),
            4,
            5,
            [6, 7, 8, 9],
            10,
            6,
        );
        assert_eq!(data.len(), EVENT_LENGTH);
    }

    #[test]
    fn test_decode_update() {
        let data = record(
            123_456_789,
            42,
            0xdead,
            v4(192, 168, 0, 1),
            v4(10, 0, 0, 7),
            49152,
            443,
            [100, 64_000, 90, 1_200_000],
            4_026_531_840,
            6,
        );

        let event = Event::decode(&data, EventKind::Update).expect("decodes");
        assert_eq!(event.timestamp_ns, 123_456_789);
        assert_eq!(event.connection_id, 42);
        assert_eq!(event.connmark, 0xdead);
        assert_eq!(event.src_addr, IpAddr::V4(Ipv4Addr::new(192, 168, 0, 1)));
        assert_eq!(event.dst_addr, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)));
        assert_eq!(event.src_port, 49152);
        assert_eq!(event.dst_port, 443);
        assert_eq!(event.packets_orig, 100);
        assert_eq!(event.bytes_orig, 64_000);
        assert_eq!(event.packets_ret, 90);
        assert_eq!(event.bytes_ret, 1_200_000);
        assert_eq!(event.net_ns, 4_026_531_840);
        assert_eq!(event.proto, 6);
        assert_eq!(event.kind, EventKind::Update);
        assert!(!event.is_ipv6());
    }

    #[test]
    fn test_decode_ipv6_addresses() {
        let mut src = [0u8; 16];
        src[0] = 0x20;
        src[1] = 0x01;
        src[15] = 0x01;
        let mut dst = [0u8; 16];
        dst[0] = 0xfe;
        dst[1] = 0x80;
        dst[15] = 0x02;

        let data = record(1, 2, 0, src, dst, 0, 0, [0; 4], 1, 58);
        let event = Event::decode(&data, EventKind::Destroy).expect("decodes");

        assert!(event.is_ipv6());
        assert_eq!(event.src_addr, IpAddr::V6(Ipv6Addr::from(src)));
        assert_eq!(event.dst_addr, IpAddr::V6(Ipv6Addr::from(dst)));
        assert_eq!(event.kind, EventKind::Destroy);
    }

    #[test]
    fn test_decode_truncated() {
        let err = Event::decode(&[0u8; 20], EventKind::Update).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { size: 20 }));
        assert_eq!(err.to_string(), "event too short: 20 bytes, need 92");
    }

    #[test]
    fn test_decode_empty() {
        assert!(matches!(
            Event::decode(&[], EventKind::Destroy).unwrap_err(),
            DecodeError::Truncated { size: 0 }
        ));
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let mut data = record(1, 2, 3, v4(1, 2, 3, 4), v4(5, 6, 7, 8), 9, 10, [0; 4], 11, 17);
        data.extend_from_slice(&[0xff; 32]);
        assert!(Event::decode(&data, EventKind::Update).is_ok());
    }

    #[test]
    fn test_flow_key() {
        let data = record(1, 7, 0, v4(1, 1, 1, 1), v4(2, 2, 2, 2), 0, 0, [0; 4], 3, 17);
        let event = Event::decode(&data, EventKind::Update).expect("decodes");
        assert_eq!(
            event.flow_key(),
            FlowKey {
                net_ns: 3,
                connection_id: 7
            }
        );
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(EventKind::Update.to_string(), "update");
        assert_eq!(EventKind::Destroy.to_string(), "destroy");
    }

    #[test]
    fn test_proto_labels() {
        let mut data = record(1, 2, 0, v4(1, 1, 1, 1), v4(2, 2, 2, 2), 0, 0, [0; 4], 3, 6);
        let event = Event::decode(&data, EventKind::Update).expect("decodes");
        assert_eq!(event.proto_label(), "tcp");

        data[88] = 17;
        let event = Event::decode(&data, EventKind::Update).expect("decodes");
        assert_eq!(event.proto_label(), "udp");

        data[88] = 47;
        let event = Event::decode(&data, EventKind::Update).expect("decodes");
        assert_eq!(event.proto_label(), "47");
    }
}
