//! Byte offsets of the headers we build and take apart.
//!
//! Every IPv4 header here is assumed to be option-less (IHL = 5). Headers that
//! carry options are rejected by the parsers instead of being misread.

pub const IPV4_HEADER_LEN: usize = 20;
pub const ICMP_HEADER_LEN: usize = 8;
pub const UDP_HEADER_LEN: usize = 8;
pub const PSEUDO_HEADER_LEN: usize = 12;

/// Version 4, IHL 5 words.
pub const IPV4_VHL: u8 = 0x45;

// IPv4 header fields
pub const IP_VHL: usize = 0;
pub const IP_TOTAL_LEN: usize = 2;
pub const IP_ID: usize = 4;
pub const IP_TTL: usize = 8;
pub const IP_PROTO: usize = 9;
pub const IP_CHECKSUM: usize = 10;
pub const IP_SRC: usize = 12;
pub const IP_DST: usize = 16;

// ICMP header fields
pub const ICMP_TYPE: usize = 0;
pub const ICMP_CHECKSUM: usize = 2;
pub const ICMP_ID: usize = 4;
pub const ICMP_SEQ: usize = 6;

// UDP header fields
pub const UDP_SRC_PORT: usize = 0;
pub const UDP_DST_PORT: usize = 2;
pub const UDP_CHECKSUM: usize = 6;

pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_DEST_UNREACHABLE: u8 = 3;
pub const ICMP_ECHO_REQUEST: u8 = 8;
pub const ICMP_TIME_EXCEEDED: u8 = 11;

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_UDP: u8 = 17;

// Positions inside a received datagram: outer IPv4, ICMP, then for error
// messages the quoted original IPv4 header and the first 8 bytes of its payload.
pub const OUTER_ICMP: usize = IPV4_HEADER_LEN;
pub const EMBEDDED_IP: usize = OUTER_ICMP + ICMP_HEADER_LEN;
pub const EMBEDDED_L4: usize = EMBEDDED_IP + IPV4_HEADER_LEN;

pub const MIN_MESSAGE_LEN: usize = EMBEDDED_IP;
pub const MIN_EMBEDDED_MESSAGE_LEN: usize = EMBEDDED_L4 + 8;

/// Largest padding that still fits a probe into the 16-bit IPv4 total length.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize
    - IPV4_HEADER_LEN
    - if ICMP_HEADER_LEN > UDP_HEADER_LEN {
        ICMP_HEADER_LEN
    } else {
        UDP_HEADER_LEN
    };

/// Header length in bytes from the IHL field, counted in 32-bit words.
pub fn header_len(ihl: u8) -> usize {
    usize::from(ihl) * 4
}
