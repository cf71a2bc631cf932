//! Session-message data model and codec.
//!
//! Session messages (OFFER/RESULT/ACCEPT/TERMINATE) are exchanged with the
//! console through the signaling service to negotiate UDP reachability. The
//! official client does not always emit valid JSON (the `localPeerAddr`
//! field is sometimes a colon immediately followed by a comma), so outbound
//! messages are assembled from string templates emulating its output and
//! inbound payloads are repaired before being handed to a JSON parser.

use crate::error::{HolepunchError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;

/// One reachability path advertised for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    /// Internet-visible address (UPnP- or STUN-derived).
    Static,
    /// Address on the local network.
    Local,
}

impl CandidateType {
    /// Wire name of the candidate type.
    pub const fn as_str(self) -> &'static str {
        match self {
            CandidateType::Static => "STATIC",
            CandidateType::Local => "LOCAL",
        }
    }
}

/// A single (address, port, mapped address, mapped port) reachability tuple.
///
/// Addresses are textual IPv4; candidates are immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub kind: CandidateType,
    pub addr: String,
    pub mapped_addr: String,
    pub port: u16,
    pub mapped_port: u16,
}

/// Connection request carried inside OFFER and ACCEPT messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub sid: u32,
    pub peer_sid: u32,
    pub skey: [u8; 16],
    pub nat_type: u8,
    pub candidates: Vec<Candidate>,
    pub default_route_mac_addr: [u8; 6],
    pub local_hashed_id: [u8; 20],
}

/// Action of a session message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMessageAction {
    Offer,
    Result,
    Accept,
    Terminate,
    Unknown,
}

impl SessionMessageAction {
    /// Wire name of the action.
    pub const fn as_str(self) -> &'static str {
        match self {
            SessionMessageAction::Offer => "OFFER",
            SessionMessageAction::Result => "RESULT",
            SessionMessageAction::Accept => "ACCEPT",
            SessionMessageAction::Terminate => "TERMINATE",
            SessionMessageAction::Unknown => "UNKNOWN",
        }
    }

    fn from_wire(action: &str) -> Self {
        match action {
            "OFFER" => SessionMessageAction::Offer,
            "RESULT" => SessionMessageAction::Result,
            "ACCEPT" => SessionMessageAction::Accept,
            "TERMINATE" => SessionMessageAction::Terminate,
            _ => SessionMessageAction::Unknown,
        }
    }

    /// Bit used when filtering awaited messages by action.
    pub(crate) const fn mask(self) -> u8 {
        match self {
            SessionMessageAction::Offer => 1,
            SessionMessageAction::Result => 1 << 1,
            SessionMessageAction::Accept => 1 << 2,
            SessionMessageAction::Terminate => 1 << 3,
            SessionMessageAction::Unknown => 0,
        }
    }
}

/// A structured signaling payload negotiating UDP reachability.
///
/// A RESULT acknowledgement carries no connection request
/// (`conn_request` is `None`, serialized as an empty object).
#[derive(Debug, Clone, PartialEq)]
pub struct SessionMessage {
    pub action: SessionMessageAction,
    pub req_id: u16,
    pub error: u16,
    pub conn_request: Option<ConnectionRequest>,
}

impl SessionMessage {
    /// Serialize into the JSON carried after `body=` in the outer envelope.
    ///
    /// `account_id` is embedded in the `localPeerAddr` object the official
    /// client sends for the `REMOTE_PLAY` platform.
    pub fn serialize(&self, account_id: u64) -> String {
        let conn_request = match &self.conn_request {
            Some(req) => serialize_conn_request(req, account_id),
            None => "{}".to_string(),
        };
        format!(
            "{{\"action\":\"{}\",\"reqId\":{},\"error\":{},\"connRequest\":{}}}",
            self.action.as_str(),
            self.req_id,
            self.error,
            conn_request
        )
    }

    /// Parse a session message from its JSON payload.
    pub fn parse(payload: &Value) -> Result<SessionMessage> {
        let action = payload
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| HolepunchError::Schema("session message has no action".into()))?;
        let req_id = payload
            .get("reqId")
            .and_then(Value::as_u64)
            .and_then(|v| u16::try_from(v).ok())
            .ok_or_else(|| HolepunchError::Schema("session message has no reqId".into()))?;
        let error = payload
            .get("error")
            .and_then(Value::as_u64)
            .and_then(|v| u16::try_from(v).ok())
            .ok_or_else(|| HolepunchError::Schema("session message has no error".into()))?;
        let conn_request_json = payload
            .get("connRequest")
            .filter(|v| v.is_object())
            .ok_or_else(|| HolepunchError::Schema("session message has no connRequest".into()))?;
        let conn_request = match conn_request_json.as_object() {
            Some(fields) if fields.is_empty() => None,
            _ => Some(parse_conn_request(conn_request_json)?),
        };

        Ok(SessionMessage {
            action: SessionMessageAction::from_wire(action),
            req_id,
            error,
            conn_request,
        })
    }
}

fn serialize_conn_request(req: &ConnectionRequest, account_id: u64) -> String {
    let candidates = req
        .candidates
        .iter()
        .map(serialize_candidate)
        .collect::<Vec<_>>()
        .join(",");
    format!(
        "{{\"sid\":{},\"peerSid\":{},\"skey\":\"{}\",\"natType\":{},\
         \"candidate\":[{}],\"defaultRouteMacAddr\":\"{}\",\
         \"localPeerAddr\":{{\"accountId\":\"{}\",\"platform\":\"REMOTE_PLAY\"}},\
         \"localHashedId\":\"{}\"}}",
        req.sid,
        req.peer_sid,
        BASE64.encode(req.skey),
        req.nat_type,
        candidates,
        format_mac(&req.default_route_mac_addr),
        account_id,
        BASE64.encode(req.local_hashed_id)
    )
}

fn serialize_candidate(candidate: &Candidate) -> String {
    format!(
        "{{\"type\":\"{}\",\"addr\":\"{}\",\"mappedAddr\":\"{}\",\"port\":{},\"mappedPort\":{}}}",
        candidate.kind.as_str(),
        candidate.addr,
        candidate.mapped_addr,
        candidate.port,
        candidate.mapped_port
    )
}

fn parse_conn_request(json: &Value) -> Result<ConnectionRequest> {
    let sid = json
        .get("sid")
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| HolepunchError::Schema("connRequest has no sid".into()))?;
    let peer_sid = json
        .get("peerSid")
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| HolepunchError::Schema("connRequest has no peerSid".into()))?;

    let skey_str = json
        .get("skey")
        .and_then(Value::as_str)
        .ok_or_else(|| HolepunchError::Schema("connRequest has no skey".into()))?;
    let skey_bytes = BASE64.decode(skey_str)?;
    if skey_bytes.len() > 16 {
        return Err(HolepunchError::Schema(format!(
            "skey decoded to {} bytes, expected at most 16",
            skey_bytes.len()
        )));
    }
    let mut skey = [0u8; 16];
    skey[..skey_bytes.len()].copy_from_slice(&skey_bytes);

    let nat_type = json
        .get("natType")
        .and_then(Value::as_u64)
        .and_then(|v| u8::try_from(v).ok())
        .ok_or_else(|| HolepunchError::Schema("connRequest has no natType".into()))?;

    let mac_str = json
        .get("defaultRouteMacAddr")
        .and_then(Value::as_str)
        .ok_or_else(|| HolepunchError::Schema("connRequest has no defaultRouteMacAddr".into()))?;
    // The console occasionally sends an empty string here; only the
    // canonical 17-char form is parsed, anything else stays zeroed.
    let default_route_mac_addr = if mac_str.len() == 17 {
        parse_mac(mac_str)?
    } else {
        [0u8; 6]
    };

    let hashed_id_str = json
        .get("localHashedId")
        .and_then(Value::as_str)
        .ok_or_else(|| HolepunchError::Schema("connRequest has no localHashedId".into()))?;
    let hashed_id_bytes = BASE64.decode(hashed_id_str)?;
    let local_hashed_id: [u8; 20] = hashed_id_bytes.as_slice().try_into().map_err(|_| {
        HolepunchError::Schema(format!(
            "localHashedId decoded to {} bytes, expected 20",
            hashed_id_bytes.len()
        ))
    })?;

    let candidates = json
        .get("candidate")
        .and_then(Value::as_array)
        .ok_or_else(|| HolepunchError::Schema("connRequest has no candidate array".into()))?
        .iter()
        .map(parse_candidate)
        .collect::<Result<Vec<_>>>()?;

    Ok(ConnectionRequest {
        sid,
        peer_sid,
        skey,
        nat_type,
        candidates,
        default_route_mac_addr,
        local_hashed_id,
    })
}

fn parse_candidate(json: &Value) -> Result<Candidate> {
    let kind = match json.get("type").and_then(Value::as_str) {
        Some("LOCAL") => CandidateType::Local,
        Some("STATIC") => CandidateType::Static,
        Some(other) => {
            return Err(HolepunchError::Schema(format!(
                "unknown candidate type \"{}\"",
                other
            )))
        }
        None => return Err(HolepunchError::Schema("candidate has no type".into())),
    };
    let addr = json
        .get("addr")
        .and_then(Value::as_str)
        .ok_or_else(|| HolepunchError::Schema("candidate has no addr".into()))?;
    let mapped_addr = json
        .get("mappedAddr")
        .and_then(Value::as_str)
        .ok_or_else(|| HolepunchError::Schema("candidate has no mappedAddr".into()))?;
    let port = json
        .get("port")
        .and_then(Value::as_u64)
        .and_then(|v| u16::try_from(v).ok())
        .ok_or_else(|| HolepunchError::Schema("candidate has no port".into()))?;
    let mapped_port = json
        .get("mappedPort")
        .and_then(Value::as_u64)
        .and_then(|v| u16::try_from(v).ok())
        .ok_or_else(|| HolepunchError::Schema("candidate has no mappedPort".into()))?;

    Ok(Candidate {
        kind,
        addr: addr.to_string(),
        mapped_addr: mapped_addr.to_string(),
        port,
        mapped_port,
    })
}

/// Extract the message JSON from a notification payload string.
///
/// The payload has the form `ver=1.0, type=text, body={json}`. When the
/// console omits the `localPeerAddr` value entirely (colon followed by
/// comma), an empty object is inserted so the result parses as JSON.
pub fn extract_message_body(payload: &str) -> Result<String> {
    let body = payload
        .split_once("body=")
        .map(|(_, body)| body)
        .ok_or_else(|| HolepunchError::Schema("session message payload has no body".into()))?;

    const PEERADDR_KEY: &str = "\"localPeerAddr\":";
    let Some(key_start) = body.find(PEERADDR_KEY) else {
        // No localPeerAddr, nothing to fix
        return Ok(body.to_string());
    };
    let value_start = key_start + PEERADDR_KEY.len();
    if body[value_start..].starts_with('{') {
        Ok(body.to_string())
    } else {
        let mut fixed = String::with_capacity(body.len() + 2);
        fixed.push_str(&body[..value_start]);
        fixed.push_str("{}");
        fixed.push_str(&body[value_start..]);
        Ok(fixed)
    }
}

/// Pull the session-message payload out of a `SessionMessageCreated`
/// notification and parse it into a JSON value.
pub fn payload_from_notification(notification: &Value) -> Result<Value> {
    let payload = notification
        .pointer("/body/data/sessionMessage/payload")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            HolepunchError::Schema("notification has no sessionMessage payload".into())
        })?;
    let body = extract_message_body(payload)?;
    Ok(serde_json::from_str(&body)?)
}

/// Decode the doubly base64-encoded 16-byte `customData1` value.
pub fn decode_custom_data1(encoded: &str) -> Result<[u8; 16]> {
    let round1 = BASE64.decode(encoded)?;
    let round2 = BASE64.decode(&round1)?;
    round2.as_slice().try_into().map_err(|_| {
        HolepunchError::Unknown(format!(
            "customData1 decoded to {} bytes, expected 16",
            round2.len()
        ))
    })
}

/// Render a MAC address as six colon-separated lowercase hex bytes.
pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

fn parse_mac(mac: &str) -> Result<[u8; 6]> {
    let mut out = [0u8; 6];
    let mut parts = mac.split(':');
    for byte in out.iter_mut() {
        let part = parts
            .next()
            .ok_or_else(|| HolepunchError::Schema(format!("malformed MAC address \"{}\"", mac)))?;
        *byte = u8::from_str_radix(part, 16)
            .map_err(|_| HolepunchError::Schema(format!("malformed MAC address \"{}\"", mac)))?;
    }
    Ok(out)
}

/// Render bytes as lowercase hex.
pub(crate) fn bytes_to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Parse a 64-char lowercase hex device id into its 32-byte form.
pub(crate) fn parse_hex_duid(hex: &str) -> Result<[u8; 32]> {
    if hex.len() != 64 || !hex.is_ascii() {
        return Err(HolepunchError::Schema(format!(
            "device id has unexpected length {}",
            hex.len()
        )));
    }
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[2 * i..2 * i + 2], 16)
            .map_err(|_| HolepunchError::Schema(format!("device id is not hex: \"{}\"", hex)))?;
    }
    Ok(out)
}
