//! Ack/reply subject protocol.
//!
//! Every delivery carries a reply subject encoding the delivery state, so
//! ack routing is stateless at the transport layer:
//!
//! ```text
//! $JS.A.<msgset>.<observable>.<deliver_count>.<store_seq>.<deliver_seq>
//! ```
//!
//! Tokens are ASCII decimal with no leading zeros. Malformed subjects are
//! rejected; unknown ack payloads are dropped by the observable.

use bytes::Bytes;

/// Prefix for ack reply subjects.
pub const ACK_PREFIX: &str = "$JS.A";

/// Well-known probe subject; enabled accounts answer `+OK`.
pub const ENABLED_SUBJECT: &str = "$JS.ENABLED";

/// Prefix for observable pull endpoints.
pub const REQUEST_NEXT_PREFIX: &str = "$JS.RN";

/// Positive pub-ack payload.
pub const OK_ACK: &str = "+OK";

/// Ack payload sentinels.
pub const ACK_NAK: &str = "-NAK";
/// Working-indicator payload; extends the ack wait without acking.
pub const ACK_PROGRESS: &str = "+WPI";
/// Ack-and-next payload; acks and requests the next message.
pub const ACK_NEXT: &str = "+NXT";

/// Parsed ack kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    /// Positive ack (empty payload).
    Ack,
    /// Negative ack; redeliver as soon as possible.
    Nak,
    /// Work in progress; restart the ack wait clock.
    Progress,
    /// Positive ack plus a request for the next message.
    Next,
}

impl AckKind {
    /// Classify an ack payload. Unknown payloads return `None` and are
    /// ignored by the caller.
    pub fn from_payload(payload: &Bytes) -> Option<Self> {
        if payload.is_empty() {
            return Some(Self::Ack);
        }
        match payload.as_ref() {
            b"-NAK" => Some(Self::Nak),
            b"+WPI" => Some(Self::Progress),
            b"+NXT" => Some(Self::Next),
            _ => None,
        }
    }
}

/// The numeric fields carried by an ack reply subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyInfo {
    /// Store sequence of the delivered message.
    pub store_seq: u64,
    /// Deliver sequence of this delivery.
    pub deliver_seq: u64,
    /// How many times the message has been delivered, starting at 1.
    pub deliver_count: u64,
}

/// Build the ack reply subject for one delivery.
pub fn ack_reply_subject(
    msg_set: &str,
    observable: &str,
    deliver_count: u64,
    store_seq: u64,
    deliver_seq: u64,
) -> String {
    format!("{ACK_PREFIX}.{msg_set}.{observable}.{deliver_count}.{store_seq}.{deliver_seq}")
}

/// Wildcard pattern covering every ack reply for one observable.
pub fn ack_reply_pattern(msg_set: &str, observable: &str) -> String {
    format!("{ACK_PREFIX}.{msg_set}.{observable}.>")
}

/// The pull endpoint for an observable.
pub fn request_next_subject(msg_set: &str, observable: &str) -> String {
    format!("{REQUEST_NEXT_PREFIX}.{msg_set}.{observable}")
}

fn parse_seq_token(token: &str) -> Option<u64> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    // No leading zeros; "0" itself never appears in a valid reply.
    if token.starts_with('0') {
        return None;
    }
    token.parse().ok()
}

/// Decode the three numeric fields from an ack reply subject.
pub fn reply_info(reply: &str) -> Option<ReplyInfo> {
    let tokens: Vec<&str> = reply.split('.').collect();
    if tokens.len() != 7 || tokens[0] != "$JS" || tokens[1] != "A" {
        return None;
    }
    let deliver_count = parse_seq_token(tokens[4])?;
    let store_seq = parse_seq_token(tokens[5])?;
    let deliver_seq = parse_seq_token(tokens[6])?;
    Some(ReplyInfo {
        store_seq,
        deliver_seq,
        deliver_count,
    })
}

/// Extract the deliver sequence from an ack reply subject.
pub fn seq_from_reply(reply: &str) -> Option<u64> {
    reply_info(reply).map(|info| info.deliver_seq)
}
