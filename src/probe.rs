//! Candidate reachability probing.
//!
//! Every peer candidate gets a fresh UDP socket and an 88-byte challenge;
//! whichever candidate echoes a valid response becomes the punched socket.
//! All integers on the probe wire are big-endian.

use crate::error::{HolepunchError, Result};
use crate::message::{Candidate, CandidateType};
use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, warn};
use rand::rngs::OsRng;
use rand::RngCore;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};

pub(crate) const MSG_TYPE_REQ: u32 = 6;
pub(crate) const MSG_TYPE_RESP: u32 = 7;

/// Size of both the challenge and the response frame.
pub(crate) const PROBE_FRAME_SIZE: usize = 88;

const REQUEST_ID_OFFSET: usize = 0x48;

/// Session identity baked into every probe frame.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ProbeIdentity {
    pub local_hashed_id: [u8; 20],
    pub peer_hashed_id: [u8; 20],
    pub sid_local: u16,
    pub sid_peer: u16,
}

/// Build the challenge frame. Hashed ids are zero-padded to 32 bytes, the
/// tail past 0x4C is reserved and stays zero.
fn build_request(identity: &ProbeIdentity, request_id: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(PROBE_FRAME_SIZE);
    buf.put_u32(MSG_TYPE_REQ);
    buf.put_slice(&identity.local_hashed_id);
    buf.put_bytes(0, 12);
    buf.put_slice(&identity.peer_hashed_id);
    buf.put_bytes(0, 12);
    buf.put_u16(identity.sid_local);
    buf.put_u16(identity.sid_peer);
    buf.put_u32(request_id);
    buf.put_bytes(0, PROBE_FRAME_SIZE - REQUEST_ID_OFFSET - 4);
    buf.freeze()
}

fn validate_response(buf: &[u8], request_id: u32) -> Result<()> {
    if buf.len() != PROBE_FRAME_SIZE {
        return Err(HolepunchError::Unknown(format!(
            "probe response of unexpected size {}",
            buf.len()
        )));
    }
    let msg_type = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if msg_type != MSG_TYPE_RESP {
        return Err(HolepunchError::Unknown(format!(
            "probe response of unexpected type {}",
            msg_type
        )));
    }
    let response_id = u32::from_be_bytes([
        buf[REQUEST_ID_OFFSET],
        buf[REQUEST_ID_OFFSET + 1],
        buf[REQUEST_ID_OFFSET + 2],
        buf[REQUEST_ID_OFFSET + 3],
    ]);
    if response_id != request_id {
        return Err(HolepunchError::Unknown(format!(
            "probe response with unexpected request id {}",
            response_id
        )));
    }
    Ok(())
}

/// Probe all peer candidates concurrently and pick a reachable one.
///
/// A validated LOCAL candidate wins immediately; otherwise the first
/// validated STATIC candidate is returned once the deadline passes or no
/// probe can still answer. Returns the selected socket (all others are
/// closed) together with its local port and candidate.
pub(crate) async fn check_candidates(
    identity: &ProbeIdentity,
    candidates: &[Candidate],
    timeout: Duration,
) -> Result<(UdpSocket, u16, Candidate)> {
    if candidates.is_empty() {
        return Err(HolepunchError::Unknown("peer offered no candidates".into()));
    }

    let mut request_id_bytes = [0u8; 4];
    OsRng
        .try_fill_bytes(&mut request_id_bytes)
        .map_err(|e| HolepunchError::crypto_with_source("failed to draw request id", e))?;
    let request_id = u32::from_ne_bytes(request_id_bytes);
    let request = build_request(identity, request_id);

    let mut probes: JoinSet<Result<Option<(usize, UdpSocket)>>> = JoinSet::new();
    for (index, candidate) in candidates.iter().enumerate() {
        let request = request.clone();
        let addr = candidate.addr.clone();
        let port = candidate.port;
        probes.spawn(async move {
            match probe_candidate(&addr, port, &request, request_id).await {
                Ok(socket) => Ok(Some((index, socket))),
                // An unreachable candidate only takes itself out of the race
                Err(HolepunchError::Network(e)) => {
                    warn!("probe for candidate {}:{} failed: {}", addr, port, e);
                    Ok(None)
                }
                Err(e) => Err(e),
            }
        });
    }

    let deadline = Instant::now() + timeout;
    let mut fallback: Option<(usize, UdpSocket)> = None;
    loop {
        let joined = match timeout_at(deadline, probes.join_next()).await {
            Ok(Some(joined)) => joined,
            // All probes resolved; nothing further can validate
            Ok(None) => break,
            Err(_) => break,
        };
        let resolved = match joined {
            Ok(result) => result?,
            Err(e) => return Err(HolepunchError::Unknown(format!("probe task failed: {}", e))),
        };
        let Some((index, socket)) = resolved else {
            continue;
        };
        let candidate = &candidates[index];
        debug!(
            "candidate {}:{} ({}) answered probe",
            candidate.addr,
            candidate.port,
            candidate.kind.as_str()
        );
        if candidate.kind == CandidateType::Local {
            // A responsive local candidate is the lowest-latency path
            probes.abort_all();
            return selected(socket, candidate.clone());
        }
        // Keep waiting for a local candidate until the deadline
        if fallback.is_none() {
            fallback = Some((index, socket));
        }
    }
    probes.abort_all();

    match fallback {
        Some((index, socket)) => selected(socket, candidates[index].clone()),
        None => Err(HolepunchError::Timeout("candidate probe responses")),
    }
}

fn selected(socket: UdpSocket, candidate: Candidate) -> Result<(UdpSocket, u16, Candidate)> {
    let local_port = socket.local_addr()?.port();
    Ok((socket, local_port, candidate))
}

async fn probe_candidate(
    addr: &str,
    port: u16,
    request: &Bytes,
    request_id: u32,
) -> Result<UdpSocket> {
    let target = lookup_candidate(addr, port).await?;
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(target).await?;
    socket.send(request).await?;

    // One extra byte so an oversized datagram shows up as a size mismatch
    let mut buf = [0u8; PROBE_FRAME_SIZE + 1];
    let len = socket.recv(&mut buf).await?;
    validate_response(&buf[..len], request_id)?;
    Ok(socket)
}

async fn lookup_candidate(addr: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((addr, port))
        .await?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| HolepunchError::network(format!("no IPv4 address for candidate {}", addr)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn identity() -> ProbeIdentity {
        ProbeIdentity {
            local_hashed_id: [1u8; 20],
            peer_hashed_id: [2u8; 20],
            sid_local: 0x0102,
            sid_peer: 0x0304,
        }
    }

    fn candidate(kind: CandidateType, addr: &str, port: u16) -> Candidate {
        Candidate {
            kind,
            addr: addr.to_string(),
            mapped_addr: "0.0.0.0".to_string(),
            port,
            mapped_port: 0,
        }
    }

    /// Bind a responder on localhost that answers every valid challenge,
    /// optionally mangling the echoed request id.
    async fn spawn_responder(mangle_request_id: bool) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind responder");
        let addr = socket.local_addr().expect("responder addr");
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            while let Ok((len, from)) = socket.recv_from(&mut buf).await {
                if len != PROBE_FRAME_SIZE {
                    continue;
                }
                let mut response = [0u8; PROBE_FRAME_SIZE];
                response.copy_from_slice(&buf[..PROBE_FRAME_SIZE]);
                response[0..4].copy_from_slice(&MSG_TYPE_RESP.to_be_bytes());
                if mangle_request_id {
                    response[REQUEST_ID_OFFSET] ^= 0xff;
                }
                let _ = socket.send_to(&response, from).await;
            }
        });
        addr
    }

    /// Bind a socket that swallows challenges without answering.
    async fn spawn_black_hole() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind black hole");
        let addr = socket.local_addr().expect("black hole addr");
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            while socket.recv_from(&mut buf).await.is_ok() {}
        });
        addr
    }

    #[test]
    fn test_request_frame_layout() {
        let request = build_request(&identity(), 0xdead_beef);
        assert_eq!(request.len(), PROBE_FRAME_SIZE);
        assert_eq!(&request[0x00..0x04], &6u32.to_be_bytes());
        assert_eq!(&request[0x04..0x18], &[1u8; 20]);
        assert_eq!(&request[0x18..0x24], &[0u8; 12]);
        assert_eq!(&request[0x24..0x38], &[2u8; 20]);
        assert_eq!(&request[0x38..0x44], &[0u8; 12]);
        assert_eq!(&request[0x44..0x46], &0x0102u16.to_be_bytes());
        assert_eq!(&request[0x46..0x48], &0x0304u16.to_be_bytes());
        assert_eq!(&request[0x48..0x4c], &0xdead_beefu32.to_be_bytes());
        assert_eq!(&request[0x4c..], &[0u8; PROBE_FRAME_SIZE - 0x4c]);
    }

    #[test]
    fn test_validate_response() {
        let mut response = [0u8; PROBE_FRAME_SIZE];
        response[0..4].copy_from_slice(&MSG_TYPE_RESP.to_be_bytes());
        response[0x48..0x4c].copy_from_slice(&7u32.to_be_bytes());
        assert!(validate_response(&response, 7).is_ok());
        assert!(validate_response(&response, 8).is_err());
        assert!(validate_response(&response[..80], 7).is_err());

        response[0..4].copy_from_slice(&MSG_TYPE_REQ.to_be_bytes());
        assert!(validate_response(&response, 7).is_err());
    }

    #[tokio::test]
    async fn test_local_candidate_is_selected() {
        init_logging();
        let responder = spawn_responder(false).await;
        let candidates = [candidate(CandidateType::Local, "127.0.0.1", responder.port())];

        let (socket, local_port, selected) =
            check_candidates(&identity(), &candidates, Duration::from_secs(2))
                .await
                .expect("local candidate responds");
        assert_eq!(selected.kind, CandidateType::Local);
        assert_ne!(local_port, 0);
        assert_eq!(socket.local_addr().expect("local addr").port(), local_port);
    }

    #[tokio::test]
    async fn test_static_candidate_wins_when_local_is_silent() {
        init_logging();
        let silent = spawn_black_hole().await;
        let responder = spawn_responder(false).await;
        let candidates = [
            candidate(CandidateType::Local, "127.0.0.1", silent.port()),
            candidate(CandidateType::Static, "127.0.0.1", responder.port()),
        ];

        let (_, _, selected) =
            check_candidates(&identity(), &candidates, Duration::from_millis(500))
                .await
                .expect("static candidate responds");
        assert_eq!(selected.kind, CandidateType::Static);
    }

    #[tokio::test]
    async fn test_probe_times_out_without_responses() {
        let silent = spawn_black_hole().await;
        let candidates = [candidate(CandidateType::Local, "127.0.0.1", silent.port())];

        let started = std::time::Instant::now();
        let err = check_candidates(&identity(), &candidates, Duration::from_millis(200))
            .await
            .expect_err("no responses");
        assert!(matches!(err, HolepunchError::Timeout(_)));
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_mismatched_request_id_is_fatal() {
        let responder = spawn_responder(true).await;
        let candidates = [candidate(CandidateType::Local, "127.0.0.1", responder.port())];

        let err = check_candidates(&identity(), &candidates, Duration::from_secs(2))
            .await
            .expect_err("mangled request id");
        assert!(matches!(err, HolepunchError::Unknown(_)));
    }
}
