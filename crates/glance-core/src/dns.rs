//! Captive-portal DNS responder.
//!
//! Every query gets an A record pointing at the portal address; that is
//! the whole point of the redirector. Only the packet transform lives
//! here; the UDP socket loop is in the firmware binary.

const HEADER_LEN: usize = 12;
const ANSWER_TTL_SECS: u32 = 60;

/// Builds a response to `query` answering with `ip`.
///
/// Returns the response length, or `None` for packets that are not plain
/// questions (responses, zero-question packets, truncated names).
pub fn answer_query(query: &[u8], ip: [u8; 4], out: &mut [u8]) -> Option<usize> {
    if query.len() < HEADER_LEN {
        return None;
    }

    // QR bit set means this is already a response.
    if query[2] & 0x80 != 0 {
        return None;
    }

    let qdcount = u16::from_be_bytes([query[4], query[5]]);
    if qdcount == 0 {
        return None;
    }

    // Walk the first question name to find the end of the question
    // section (labels, then a zero byte, then QTYPE/QCLASS).
    let mut at = HEADER_LEN;
    loop {
        let len = *query.get(at)? as usize;
        at += 1;
        if len == 0 {
            break;
        }
        if len > 63 {
            return None;
        }
        at += len;
    }
    let question_end = at + 4;
    if question_end > query.len() {
        return None;
    }

    let answer = [
        0xC0, HEADER_LEN as u8, // name: pointer to the question
        0x00, 0x01, // type A
        0x00, 0x01, // class IN
        (ANSWER_TTL_SECS >> 24) as u8,
        (ANSWER_TTL_SECS >> 16) as u8,
        (ANSWER_TTL_SECS >> 8) as u8,
        ANSWER_TTL_SECS as u8,
        0x00, 0x04, // rdlength
        ip[0], ip[1], ip[2], ip[3],
    ];

    let total = question_end + answer.len();
    if out.len() < total {
        return None;
    }

    // Header: echo the ID, flag as an authoritative response, one
    // question, one answer.
    out[0] = query[0];
    out[1] = query[1];
    out[2] = 0x85;
    out[3] = 0x80;
    out[4..6].copy_from_slice(&1u16.to_be_bytes());
    out[6..8].copy_from_slice(&1u16.to_be_bytes());
    out[8..12].fill(0);
    out[HEADER_LEN..question_end].copy_from_slice(&query[HEADER_LEN..question_end]);
    out[question_end..total].copy_from_slice(&answer);

    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_for(name: &[&str]) -> Vec<u8> {
        let mut q = vec![
            0x1A, 0x2B, // id
            0x01, 0x00, // standard query, recursion desired
            0x00, 0x01, // one question
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        for label in name {
            q.push(label.len() as u8);
            q.extend_from_slice(label.as_bytes());
        }
        q.push(0);
        q.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]); // A, IN
        q
    }

    #[test]
    fn every_name_resolves_to_the_portal_address() {
        let query = query_for(&["connectivitycheck", "gstatic", "com"]);
        let mut out = [0u8; 128];
        let len = answer_query(&query, [192, 168, 4, 1], &mut out).unwrap();
        let resp = &out[..len];

        // Echoed ID, response flags, one answer.
        assert_eq!(&resp[..2], &[0x1A, 0x2B]);
        assert_eq!(resp[2] & 0x80, 0x80);
        assert_eq!(&resp[6..8], &[0x00, 0x01]);
        // Question copied verbatim.
        assert_eq!(&resp[12..query.len()], &query[12..]);
        // Answer carries the portal address.
        assert_eq!(&resp[len - 4..], &[192, 168, 4, 1]);
        assert_eq!(&resp[len - 6..len - 4], &[0x00, 0x04]);
    }

    #[test]
    fn responses_and_empty_questions_are_ignored() {
        let mut response = query_for(&["x"]);
        response[2] |= 0x80;
        let mut out = [0u8; 128];
        assert!(answer_query(&response, [192, 168, 4, 1], &mut out).is_none());

        let mut no_questions = query_for(&["x"]);
        no_questions[5] = 0;
        assert!(answer_query(&no_questions, [192, 168, 4, 1], &mut out).is_none());

        assert!(answer_query(&[0u8; 5], [192, 168, 4, 1], &mut out).is_none());
    }

    #[test]
    fn truncated_names_are_rejected() {
        let mut query = query_for(&["example", "com"]);
        query.truncate(16);
        let mut out = [0u8; 128];
        assert!(answer_query(&query, [192, 168, 4, 1], &mut out).is_none());
    }
}
