//! UDP hole punching for PS4/PS5 Remote Play.
//!
//! "Remote Play over Internet" runs a custom UDP protocol between the
//! console and the client. Both ends usually sit behind NATs and cannot
//! reach each other directly, so connectivity is established by UDP hole
//! punching through the PSN signaling service: the peers exchange
//! connection candidates over an authenticated push channel and REST
//! endpoints, then probe candidate pairs until a socket works.
//!
//! This crate implements that hole-punching core: the session state
//! machine, the push notification stream, address discovery via UPnP and
//! STUN, the session-message codec, and the candidate prober. The embedder
//! supplies an OAuth2 bearer token; the encrypted protocol that runs over
//! the punched sockets is out of scope.
//!
//! Typical flow:
//!
//! ```no_run
//! use punch_rs::{Channel, ConsoleFamily, Session};
//!
//! # async fn run(token: &str, console_uid: [u8; 32]) -> punch_rs::Result<()> {
//! let mut session = Session::new(token);
//! session.create().await?;
//! session.start(console_uid, ConsoleFamily::Ps5).await?;
//! let ctrl_sock = session.punch_hole(Channel::Ctrl).await?;
//! let data_sock = session.punch_hole(Channel::Data).await?;
//! // hand ctrl_sock/data_sock to the streaming protocol
//! session.fini().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod message;
pub mod session;

mod discovery;
mod probe;
mod psn;
mod push;

pub use config::HolepunchConfig;
pub use error::{HolepunchError, Result};
pub use message::{
    Candidate, CandidateType, ConnectionRequest, SessionMessage, SessionMessageAction,
};
pub use psn::{list_devices, ConsoleFamily, DeviceInfo};
pub use push::{Notification, NotificationKind};
pub use session::{
    generate_client_device_uid, Channel, Session, SessionState, DUID_PREFIX, DUID_STR_SIZE,
};
