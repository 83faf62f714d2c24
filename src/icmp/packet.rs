use crate::icmp::{
    ICMP_HEADER_SIZE, IP6_HEADER_SIZE, IcmpHeaderMode, MAX_IP4_HEADER_SIZE, MAX_PACKET_SIZE, MIN_IP4_HEADER_SIZE,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

pub const ICMP_ECHO_REQUEST: u8 = 8;
pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMPV6_ECHO_REQUEST: u8 = 128;
pub const ICMPV6_ECHO_REPLY: u8 = 129;

#[derive(Debug, Clone)]
pub struct IcmpPacket {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
    pub identifier: u16,
    pub sequence: u16,
    pub payload: Vec<u8>,
}

impl IcmpPacket {
    /// Echo request carrying `payload`.
    ///
    /// IPv4 packets get their checksum here. ICMPv6 checksums cover a pseudo
    /// header with the source address, so they are left at zero for the
    /// kernel to fill in.
    pub fn new_echo_request(identifier: u16, sequence: u16, payload: Vec<u8>, is_ipv6: bool) -> Self {
        let icmp_type = if is_ipv6 { ICMPV6_ECHO_REQUEST } else { ICMP_ECHO_REQUEST };

        let mut packet = Self {
            icmp_type,
            code: 0,
            checksum: 0,
            identifier,
            sequence,
            payload,
        };

        if !is_ipv6 {
            packet.calculate_checksum();
        }
        packet
    }

    pub fn from_bytes(data: &[u8]) -> anyhow::Result<Self> {
        if data.len() < ICMP_HEADER_SIZE {
            return Err(anyhow::anyhow!("ICMP packet too short"));
        }

        let mut cursor = Cursor::new(data);
        let icmp_type = cursor.read_u8()?;
        let code = cursor.read_u8()?;
        let checksum = cursor.read_u16::<BigEndian>()?;
        let identifier = cursor.read_u16::<BigEndian>()?;
        let sequence = cursor.read_u16::<BigEndian>()?;

        let mut payload = Vec::new();
        cursor.read_to_end(&mut payload)?;

        Ok(Self {
            icmp_type,
            code,
            checksum,
            identifier,
            sequence,
            payload,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(ICMP_HEADER_SIZE + self.payload.len());
        // Writes into a Vec cannot fail.
        let _ = bytes.write_u8(self.icmp_type);
        let _ = bytes.write_u8(self.code);
        let _ = bytes.write_u16::<BigEndian>(self.checksum);
        let _ = bytes.write_u16::<BigEndian>(self.identifier);
        let _ = bytes.write_u16::<BigEndian>(self.sequence);
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    pub fn calculate_checksum(&mut self) {
        self.checksum = 0;
        let bytes = self.to_bytes();
        self.checksum = internet_checksum(&bytes);
    }

    pub fn is_echo_reply(&self, is_ipv6: bool) -> bool {
        let expected_type = if is_ipv6 { ICMPV6_ECHO_REPLY } else { ICMP_ECHO_REPLY };
        self.icmp_type == expected_type
    }

    pub fn verify_checksum(&self) -> bool {
        internet_checksum(&self.to_bytes()) == 0
    }
}

/// 16-bit one's-complement sum (RFC 1071).
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut i = 0;

    while i + 1 < data.len() {
        let word = ((data[i] as u16) << 8) | (data[i + 1] as u16);
        sum += word as u32;
        i += 2;
    }

    // Odd trailing byte
    if i < data.len() {
        sum += (data[i] as u32) << 8;
    }

    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

/// An ICMP step resolved to concrete numbers and payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpStep {
    pub size: usize,
    pub count: usize,
    pub content: Vec<u8>,
}

/// Serialized echo requests for one ICMP step.
#[derive(Debug, Clone)]
pub struct IcmpEchoBurst {
    pub packets: Vec<Vec<u8>>,
    pub payload_len: usize,
    /// Sequence number the next burst of the same run should start from.
    pub next_sequence: u16,
    /// ICMPv6: the checksum field is zero and must be filled by the socket layer.
    pub checksum_by_transport: bool,
}

/// Builds echo request bursts for one address family.
#[derive(Debug, Clone, Copy)]
pub struct EchoBurstBuilder {
    mode: IcmpHeaderMode,
    ip_header_size: usize,
    identifier: u16,
    is_ipv6: bool,
}

impl EchoBurstBuilder {
    /// `ip4_header_size` is only used for IPv4 and is clamped to 20..=60;
    /// IPv6 always counts a fixed 40-byte header in
    /// [`IcmpHeaderMode::FullPacket`] mode.
    pub fn new(mode: IcmpHeaderMode, ip4_header_size: usize, identifier: u16, is_ipv6: bool) -> Self {
        let ip_header_size = if is_ipv6 {
            IP6_HEADER_SIZE
        } else {
            ip4_header_size.clamp(MIN_IP4_HEADER_SIZE, MAX_IP4_HEADER_SIZE)
        };
        Self {
            mode,
            ip_header_size,
            identifier,
            is_ipv6,
        }
    }

    pub fn max_payload_len(&self) -> usize {
        MAX_PACKET_SIZE.saturating_sub(self.ip_header_size + ICMP_HEADER_SIZE)
    }

    pub fn payload_len(&self, size: usize) -> usize {
        self.mode
            .payload_len(size, self.ip_header_size)
            .min(self.max_payload_len())
    }

    /// Builds `step.count` packets numbered from `first_sequence`.
    ///
    /// Never fails: sizes out of range are clamped.
    pub fn build(&self, step: &IcmpStep, first_sequence: u16) -> IcmpEchoBurst {
        let payload_len = self.payload_len(step.size);
        let payload = fill_payload(&step.content, payload_len);
        let count = step.count.max(1);

        let packets = (0..count)
            .map(|i| {
                let sequence = first_sequence.wrapping_add(i as u16);
                IcmpPacket::new_echo_request(self.identifier, sequence, payload.clone(), self.is_ipv6)
                    .to_bytes()
            })
            .collect();

        IcmpEchoBurst {
            packets,
            payload_len,
            next_sequence: first_sequence.wrapping_add(count as u16),
            checksum_by_transport: self.is_ipv6,
        }
    }
}

/// One-shot form of [`EchoBurstBuilder::build`].
pub fn build_echo_burst(
    step: &IcmpStep,
    mode: IcmpHeaderMode,
    ip4_header_size: usize,
    identifier: u16,
    first_sequence: u16,
    is_ipv6: bool,
) -> IcmpEchoBurst {
    EchoBurstBuilder::new(mode, ip4_header_size, identifier, is_ipv6).build(step, first_sequence)
}

/// Content first, then a repeating counter pattern up to `len` bytes.
fn fill_payload(content: &[u8], len: usize) -> Vec<u8> {
    let mut payload: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
    let n = content.len().min(len);
    payload[..n].copy_from_slice(&content[..n]);
    payload
}
