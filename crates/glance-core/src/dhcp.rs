//! Minimal DHCP responder for the provisioning access point.
//!
//! Clients joining the portal AP need an address and, critically, our
//! DNS server, or the captive redirect never fires. A full server is far
//! out of scope; this answers DISCOVER with an OFFER and REQUEST with an
//! ACK from a tiny hash-assigned pool and ignores everything else.

const BOOTREQUEST: u8 = 1;
const BOOTREPLY: u8 = 2;
const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

const OPT_SUBNET_MASK: u8 = 1;
const OPT_ROUTER: u8 = 3;
const OPT_DNS: u8 = 6;
const OPT_LEASE_TIME: u8 = 51;
const OPT_MESSAGE_TYPE: u8 = 53;
const OPT_SERVER_ID: u8 = 54;
const OPT_END: u8 = 255;

const DISCOVER: u8 = 1;
const OFFER: u8 = 2;
const REQUEST: u8 = 3;
const ACK: u8 = 5;

const LEASE_SECS: u32 = 3600;

/// Fixed-layout BOOTP fields before the options.
const OPTIONS_AT: usize = 240;

/// Minimum size we are willing to parse: BOOTP header + cookie.
pub const MIN_MESSAGE: usize = OPTIONS_AT;
/// Response buffer size callers should provide.
pub const REPLY_LEN: usize = OPTIONS_AT + 48;

/// Handles one inbound DHCP message. Returns the reply length written to
/// `out`, or `None` when the message needs no reply.
pub fn handle_message(msg: &[u8], server_ip: [u8; 4], out: &mut [u8]) -> Option<usize> {
    if msg.len() < MIN_MESSAGE || out.len() < REPLY_LEN {
        return None;
    }
    if msg[0] != BOOTREQUEST || msg[236..240] != MAGIC_COOKIE {
        return None;
    }

    let message_type = find_option(&msg[OPTIONS_AT..], OPT_MESSAGE_TYPE)?;
    let reply_type = match message_type.first()? {
        &DISCOVER => OFFER,
        &REQUEST => ACK,
        _ => return None,
    };

    let chaddr: [u8; 6] = msg[28..34].try_into().ok()?;
    let offered = offered_address(server_ip, &chaddr);

    out[..REPLY_LEN].fill(0);
    out[0] = BOOTREPLY;
    out[1] = msg[1]; // htype
    out[2] = msg[2]; // hlen
    out[4..8].copy_from_slice(&msg[4..8]); // xid
    out[10..12].copy_from_slice(&msg[10..12]); // flags (keep broadcast bit)
    out[16..20].copy_from_slice(&offered); // yiaddr
    out[20..24].copy_from_slice(&server_ip); // siaddr
    out[28..44].copy_from_slice(&msg[28..44]); // chaddr + padding
    out[236..240].copy_from_slice(&MAGIC_COOKIE);

    let mut at = OPTIONS_AT;
    let mut put = |bytes: &[u8]| {
        out[at..at + bytes.len()].copy_from_slice(bytes);
        at += bytes.len();
    };
    put(&[OPT_MESSAGE_TYPE, 1, reply_type]);
    put(&[OPT_SERVER_ID, 4]);
    put(&server_ip);
    put(&[OPT_LEASE_TIME, 4]);
    put(&LEASE_SECS.to_be_bytes());
    put(&[OPT_SUBNET_MASK, 4, 255, 255, 255, 0]);
    put(&[OPT_ROUTER, 4]);
    put(&server_ip);
    put(&[OPT_DNS, 4]);
    put(&server_ip);
    put(&[OPT_END]);

    Some(at)
}

/// One address per client, derived from the hardware address so repeat
/// requests stay stable without lease bookkeeping.
fn offered_address(server_ip: [u8; 4], chaddr: &[u8; 6]) -> [u8; 4] {
    let mut hash = 0u8;
    for &b in chaddr {
        hash = hash.wrapping_mul(31).wrapping_add(b);
    }
    let host = 100 + (hash % 100);
    [server_ip[0], server_ip[1], server_ip[2], host]
}

fn find_option(options: &[u8], wanted: u8) -> Option<&[u8]> {
    let mut at = 0;
    while at < options.len() {
        let code = options[at];
        if code == OPT_END {
            return None;
        }
        if code == 0 {
            at += 1;
            continue;
        }
        let len = *options.get(at + 1)? as usize;
        let value = options.get(at + 2..at + 2 + len)?;
        if code == wanted {
            return Some(value);
        }
        at += 2 + len;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER: [u8; 4] = [192, 168, 4, 1];

    fn request(message_type: u8, chaddr: [u8; 6]) -> Vec<u8> {
        let mut msg = vec![0u8; MIN_MESSAGE];
        msg[0] = BOOTREQUEST;
        msg[1] = 1; // ethernet
        msg[2] = 6;
        msg[4..8].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        msg[28..34].copy_from_slice(&chaddr);
        msg[236..240].copy_from_slice(&MAGIC_COOKIE);
        msg.extend_from_slice(&[OPT_MESSAGE_TYPE, 1, message_type, OPT_END]);
        msg
    }

    fn option_value(reply: &[u8], code: u8) -> Option<Vec<u8>> {
        find_option(&reply[OPTIONS_AT..], code).map(|v| v.to_vec())
    }

    #[test]
    fn discover_gets_an_offer_with_address_and_dns() {
        let chaddr = [0xA1, 0xB2, 0xC3, 0xD4, 0xE5, 0xF6];
        let msg = request(DISCOVER, chaddr);
        let mut out = [0u8; REPLY_LEN];
        let len = handle_message(&msg, SERVER, &mut out).unwrap();
        let reply = &out[..len];

        assert_eq!(reply[0], BOOTREPLY);
        assert_eq!(&reply[4..8], &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(option_value(reply, OPT_MESSAGE_TYPE).unwrap(), vec![OFFER]);
        assert_eq!(option_value(reply, OPT_DNS).unwrap(), SERVER.to_vec());
        assert_eq!(option_value(reply, OPT_ROUTER).unwrap(), SERVER.to_vec());

        let yiaddr = &reply[16..20];
        assert_eq!(&yiaddr[..3], &SERVER[..3]);
        assert!((100..200).contains(&yiaddr[3]));
    }

    #[test]
    fn request_is_acked_with_the_same_address() {
        let chaddr = [2, 4, 6, 8, 10, 12];
        let mut out = [0u8; REPLY_LEN];

        let len = handle_message(&request(DISCOVER, chaddr), SERVER, &mut out).unwrap();
        let offered = out[..len][16..20].to_vec();

        let len = handle_message(&request(REQUEST, chaddr), SERVER, &mut out).unwrap();
        let reply = &out[..len];
        assert_eq!(option_value(reply, OPT_MESSAGE_TYPE).unwrap(), vec![ACK]);
        assert_eq!(&reply[16..20], offered.as_slice());
    }

    #[test]
    fn non_requests_and_unknown_types_are_ignored() {
        let chaddr = [1; 6];
        let mut out = [0u8; REPLY_LEN];

        let mut reply_msg = request(DISCOVER, chaddr);
        reply_msg[0] = BOOTREPLY;
        assert!(handle_message(&reply_msg, SERVER, &mut out).is_none());

        // DHCPDECLINE and friends need no answer from us.
        assert!(handle_message(&request(4, chaddr), SERVER, &mut out).is_none());

        let mut bad_cookie = request(DISCOVER, chaddr);
        bad_cookie[236] = 0;
        assert!(handle_message(&bad_cookie, SERVER, &mut out).is_none());

        assert!(handle_message(&[0u8; 10], SERVER, &mut out).is_none());
    }
}
