use pnet::packet::MutablePacket;
use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{IcmpCode, IcmpPacket, IcmpType, checksum};
use pnet::packet::ipv4::Ipv4Packet;

/// ICMP header size (fixed)
pub const ICMP_HEADER_SIZE: usize = 8;
/// ICMP echo reply type, used when the client requested no specific type.
pub const ICMP_ECHO_REPLY: u8 = 0;

/// Map the envelope's reply protocol to a concrete ICMP type.
///
/// Negative means "default": a plain echo reply. Some filtered paths only
/// pass specific types, so clients may request any value.
pub fn reply_icmp_type(reply_protocol: i16) -> u8 {
    if reply_protocol < 0 {
        ICMP_ECHO_REPLY
    } else {
        reply_protocol as u8
    }
}

/// Build an ICMP echo frame carrying an encoded envelope.
///
/// The echo identifier and sequence correlate request/reply pairs at the
/// network level; the envelope rides in the echo payload.
pub fn build_echo_frame(icmp_type: u8, echo_id: u16, echo_seq: u16, body: &[u8]) -> Vec<u8> {
    let mut buffer = vec![0u8; ICMP_HEADER_SIZE + body.len()];

    let mut packet = MutableEchoRequestPacket::new(&mut buffer).unwrap();
    packet.set_icmp_type(IcmpType::new(icmp_type));
    packet.set_icmp_code(IcmpCode::new(0));
    packet.set_identifier(echo_id);
    packet.set_sequence_number(echo_seq);
    packet.payload_mut().copy_from_slice(body);

    let cksum = checksum(&IcmpPacket::new(&buffer).unwrap());
    let mut packet = MutableEchoRequestPacket::new(&mut buffer).unwrap();
    packet.set_checksum(cksum);

    buffer
}

/// Extract echo identifier and sequence from an ICMP message.
pub fn parse_echo_header(icmp: &[u8]) -> Option<(u16, u16)> {
    if icmp.len() < ICMP_HEADER_SIZE {
        return None;
    }
    let id = u16::from_be_bytes([icmp[4], icmp[5]]);
    let seq = u16::from_be_bytes([icmp[6], icmp[7]]);
    Some((id, seq))
}

/// Strip the IPv4 header from a raw-socket read, yielding the ICMP message.
///
/// Raw IPv4 sockets deliver the full IP datagram; the header length field
/// gives the offset in 32-bit words.
pub fn strip_ipv4_header(data: &[u8]) -> Option<&[u8]> {
    let ip_packet = Ipv4Packet::new(data)?;
    let ip_header_len = (ip_packet.get_header_length() as usize) * 4;
    if ip_header_len < 20 || data.len() < ip_header_len + ICMP_HEADER_SIZE {
        return None;
    }
    Some(&data[ip_header_len..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_echo_frame() {
        let frame = build_echo_frame(ICMP_ECHO_REPLY, 1234, 5678, b"hello");
        assert_eq!(frame.len(), ICMP_HEADER_SIZE + 5);
        assert_eq!(frame[0], 0); // Echo Reply type
        assert_eq!(frame[1], 0); // Code
        assert_eq!(&frame[ICMP_HEADER_SIZE..], b"hello");
        assert_eq!(parse_echo_header(&frame), Some((1234, 5678)));
    }

    #[test]
    fn test_build_echo_frame_custom_type() {
        let frame = build_echo_frame(8, 1, 2, &[]);
        assert_eq!(frame[0], 8); // Echo Request type
        assert_eq!(frame.len(), ICMP_HEADER_SIZE);
    }

    #[test]
    fn test_reply_icmp_type_mapping() {
        assert_eq!(reply_icmp_type(-1), ICMP_ECHO_REPLY);
        assert_eq!(reply_icmp_type(0), 0);
        assert_eq!(reply_icmp_type(8), 8);
    }

    #[test]
    fn test_parse_echo_header_short() {
        assert_eq!(parse_echo_header(&[0u8; 7]), None);
    }

    #[test]
    fn test_strip_ipv4_header() {
        // Minimal IPv4 header (IHL=5) followed by an 8-byte ICMP header
        let mut packet = vec![0u8; 28];
        packet[0] = 0x45; // version 4, IHL 5
        packet[20] = 0; // echo reply
        packet[24] = 0x12;
        packet[25] = 0x34;
        let icmp = strip_ipv4_header(&packet).unwrap();
        assert_eq!(icmp.len(), 8);
        assert_eq!(parse_echo_header(icmp), Some((0x1234, 0)));
    }

    #[test]
    fn test_strip_ipv4_header_truncated() {
        let mut packet = vec![0u8; 24];
        packet[0] = 0x45;
        assert!(strip_ipv4_header(&packet).is_none());
        assert!(strip_ipv4_header(&[]).is_none());
    }
}
