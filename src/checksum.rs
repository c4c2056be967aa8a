//! Internet checksums, computed by pnet.
//!
//! A computed value of zero is transmitted as `0xFFFF` (RFC 768), which pnet leaves to its callers.

use std::net::Ipv4Addr;

use pnet::packet::udp::{self, UdpPacket};
use pnet::util;

/// Index of the checksum word in an IPv4 header.
pub const IPV4_CHECKSUM_WORD: usize = 5;
/// Index of the checksum word in an ICMP header.
pub const ICMP_CHECKSUM_WORD: usize = 1;
/// Sums every word.
pub const NO_SKIP: usize = usize::MAX;

/// One's complement checksum over `buf`, leaving out the 16-bit word at index `skip_word`.
pub fn checksum(buf: &[u8], skip_word: usize) -> u16 {
    nonzero(util::checksum(buf, skip_word))
}

/// UDP checksum including the IPv4 pseudo-header. The length in the pseudo-header is the
/// length of the packet's buffer.
pub fn udp_ipv4_checksum(packet: &UdpPacket<'_>, src: Ipv4Addr, dst: Ipv4Addr) -> u16 {
    nonzero(udp::ipv4_checksum(packet, &src, &dst))
}

/// Returns true if `buf` (with its checksum field filled in) sums to all ones.
pub fn verify(buf: &[u8]) -> bool {
    !buf.is_empty() && util::checksum(buf, NO_SKIP) == 0
}

fn nonzero(sum: u16) -> u16 {
    match sum {
        0 => 0xFFFF,
        c => c,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet::packet::udp::MutableUdpPacket;

    #[test]
    fn test_empty_is_all_ones() {
        assert_eq!(checksum(&[], NO_SKIP), 0xFFFF);
    }

    #[test]
    fn test_rfc1071_example() {
        // Sum of these words is 0x2ddf0, folded 0xddf2, complement 0x220d
        let buf = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(checksum(&buf, NO_SKIP), 0x220d);
    }

    #[test]
    fn test_skipped_word_is_left_out() {
        let buf = [0x00, 0x01, 0xaa, 0xbb, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(checksum(&buf, 1), 0x220d);
    }

    #[test]
    fn test_odd_trailing_byte_is_high_byte() {
        assert_eq!(checksum(&[0x12], NO_SKIP), !0x1200);
        assert_eq!(checksum(&[0x12, 0x34, 0x56], NO_SKIP), !(0x1234u16 + 0x5600));
    }

    #[test]
    fn test_zero_result_maps_to_all_ones() {
        // Words sum to 0xFFFF, whose complement is zero
        assert_eq!(checksum(&[0xFF, 0xFF], NO_SKIP), 0xFFFF);
    }

    #[test]
    fn test_verify_after_insertion() {
        let mut header = [
            0x45, 0x00, 0x00, 0x1c, 0x12, 0x34, 0x00, 0x00, 0x05, 0x01, 0x00, 0x00, 0xc0, 0xa8,
            0x01, 0x0a, 0x08, 0x08, 0x08, 0x08,
        ];
        let sum = checksum(&header, IPV4_CHECKSUM_WORD);
        header[10..12].copy_from_slice(&sum.to_be_bytes());
        assert!(verify(&header));
        header[8] = 6;
        assert!(!verify(&header));
    }

    #[test]
    fn test_udp_checksum_covers_pseudo_header() {
        let src = Ipv4Addr::new(10, 23, 228, 78);
        let dst = Ipv4Addr::new(172, 16, 57, 12);
        let mut buf = [0u8; 9];
        let mut packet = MutableUdpPacket::new(&mut buf).unwrap();
        packet.set_source(65232);
        packet.set_destination(33434);
        packet.set_length(9);
        packet.set_payload(b"a");
        let sum = udp_ipv4_checksum(&packet.to_immutable(), src, dst);
        packet.set_checksum(sum);

        // Pseudo-header: src, dst, zero, protocol 17, UDP length
        let mut summed = Vec::new();
        summed.extend_from_slice(&src.octets());
        summed.extend_from_slice(&dst.octets());
        summed.extend_from_slice(&[0, 17, 0, 9]);
        summed.extend_from_slice(&buf);
        assert!(verify(&summed));
    }
}
