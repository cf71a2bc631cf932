//! HTTP transport for the PSN signaling endpoints.
//!
//! All requests of a session go through one shared connection pool and are
//! authorized with the embedder-supplied OAuth2 bearer token. The request
//! bodies are built from string templates emulating the official client
//! (see `message` for why a generic JSON encoder is not used), responses are
//! read into memory and picked apart field by field. No retries happen at
//! this layer.

use crate::error::{HolepunchError, Result};
use crate::message::parse_hex_duid;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::{debug, error};
use serde::Deserialize;
use serde_json::Value;

const DEVICE_LIST_URL: &str =
    "https://web.np.playstation.com/api/cloudAssistedNavigation/v2/users/me/clients";
const WS_FQDN_URL: &str = "https://mobile-pushcl.np.communication.playstation.net/np/serveraddr?version=2.1&fields=keepAliveStatus&keepAliveStatusType=3";
const SESSION_CREATE_URL: &str =
    "https://web.np.playstation.com/api/sessionManager/v1/remotePlaySessions";
const SESSION_COMMAND_URL: &str =
    "https://web.np.playstation.com/api/cloudAssistedNavigation/v2/users/me/commands";

/// Console family a session talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleFamily {
    Ps4,
    Ps5,
}

impl ConsoleFamily {
    /// Platform tag used by the signaling endpoints.
    pub const fn platform(self) -> &'static str {
        match self {
            ConsoleFamily::Ps4 => "PS4",
            ConsoleFamily::Ps5 => "PS5",
        }
    }
}

/// A console registered to the user's account.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub family: ConsoleFamily,
    pub device_uid: [u8; 32],
    pub name: String,
    pub remoteplay_enabled: bool,
}

#[derive(Deserialize)]
struct DeviceListResponse {
    clients: Vec<ClientEntry>,
}

#[derive(Deserialize)]
struct ClientEntry {
    duid: String,
    device: ClientDevice,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientDevice {
    name: String,
    enabled_features: Vec<String>,
}

#[derive(Deserialize)]
struct ServerAddrResponse {
    fqdn: String,
}

/// List the consoles of the given family registered to the account.
pub async fn list_devices(token: &str, family: ConsoleFamily) -> Result<Vec<DeviceInfo>> {
    PsnClient::new(token).list_devices(family).await
}

/// Client for the PSN signaling REST endpoints.
#[derive(Clone)]
pub(crate) struct PsnClient {
    http: reqwest::Client,
    token: String,
}

impl PsnClient {
    pub fn new(token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            token: token.to_string(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub async fn list_devices(&self, family: ConsoleFamily) -> Result<Vec<DeviceInfo>> {
        let url = format!(
            "{}?platform={}&includeFields=device&limit=10&offset=0",
            DEVICE_LIST_URL,
            family.platform()
        );
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .header("Accept-Language", "jp")
            .send()
            .await?;
        let body = read_ok(response, "fetching device list").await?;

        let parsed: DeviceListResponse = serde_json::from_str(&body)?;
        parsed
            .clients
            .into_iter()
            .map(|client| {
                Ok(DeviceInfo {
                    family,
                    device_uid: parse_hex_duid(&client.duid)?,
                    name: client.device.name,
                    remoteplay_enabled: client
                        .device
                        .enabled_features
                        .iter()
                        .any(|feature| feature == "remotePlay"),
                })
            })
            .collect()
    }

    /// Fetch the FQDN of the push notification websocket server.
    pub async fn get_websocket_fqdn(&self) -> Result<String> {
        let response = self
            .http
            .get(WS_FQDN_URL)
            .bearer_auth(&self.token)
            .send()
            .await?;
        let body = read_ok(response, "fetching websocket FQDN").await?;
        let parsed: ServerAddrResponse = serde_json::from_str(&body)?;
        Ok(parsed.fqdn)
    }

    /// Create a remote play session, returning its id and our account id.
    pub async fn create_session(&self, pushctx_id: &str) -> Result<(String, u64)> {
        let body = format!(
            "{{\"remotePlaySessions\":[\
               {{\"members\":[\
                 {{\"accountId\":\"me\",\
                  \"deviceUniqueId\":\"me\",\
                  \"platform\":\"me\",\
                  \"pushContexts\":[{{\"pushContextId\":\"{}\"}}]}}]}}]}}",
            pushctx_id
        );
        debug!("create_session request: {}", body);

        let body = self.post_json(SESSION_CREATE_URL, body, "creating session").await?;
        let json: Value = serde_json::from_str(&body)?;

        let session_id = json
            .pointer("/remotePlaySessions/0/sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| HolepunchError::Schema("response has no sessionId".into()))?;
        if session_id.len() != 36 {
            return Err(HolepunchError::Schema(format!(
                "sessionId is not a UUIDv4: \"{}\"",
                session_id
            )));
        }

        // accountId shows up as an integer or as a numeric string
        let account_id = match json.pointer("/remotePlaySessions/0/members/0/accountId") {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        }
        .ok_or_else(|| HolepunchError::Schema("response has no usable accountId".into()))?;

        Ok((session_id.to_string(), account_id))
    }

    /// Ask the signaling service to start the session on the console.
    pub async fn start_session(
        &self,
        account_id: u64,
        session_id: &str,
        data1: &[u8; 16],
        data2: &[u8; 16],
        console_uid_hex: &str,
        family: ConsoleFamily,
    ) -> Result<()> {
        let initial_params = format!(
            "{{\"accountId\":{},\"roomId\":0,\"sessionId\":\"{}\",\"clientType\":\"Windows\",\
             \"data1\":\"{}\",\"data2\":\"{}\"}}",
            account_id,
            session_id,
            BASE64.encode(data1),
            BASE64.encode(data2)
        );
        let envelope = format!(
            "{{\"commandDetail\":\
               {{\"commandType\":\"remotePlay\",\
                \"duid\":\"{}\",\
                \"messageDestination\":\"SQS\",\
                \"parameters\":{{\"initialParams\":\"{}\"}},\
                \"platform\":\"{}\"}}}}",
            console_uid_hex,
            escape_json_string(&initial_params),
            family.platform()
        );
        debug!("start_session request: {}", envelope);

        let response = self
            .http
            .post(SESSION_COMMAND_URL)
            .bearer_auth(&self.token)
            .header("Content-Type", "application/json; charset=utf-8")
            .header("User-Agent", "RpNetHttpUtilImpl")
            .body(envelope)
            .send()
            .await?;
        read_ok(response, "starting session").await?;
        Ok(())
    }

    /// POST a serialized session message addressed to the console.
    pub async fn send_session_message(
        &self,
        session_id: &str,
        account_id: u64,
        console_uid_hex: &str,
        family: ConsoleFamily,
        serialized_message: &str,
    ) -> Result<()> {
        let url = format!("{}/{}/sessionMessage", SESSION_CREATE_URL, session_id);
        let payload = format!("ver=1.0, type=text, body={}", serialized_message);
        let envelope = format!(
            "{{\"channel\":\"remote_play:1\",\
              \"payload\":\"{}\",\
              \"to\":[\
                {{\"accountId\":\"{}\",\
                 \"deviceUniqueId\":\"{}\",\
                 \"platform\":\"{}\"}}]}}",
            escape_json_string(&payload),
            account_id,
            console_uid_hex,
            family.platform()
        );
        debug!("sending session message: {}", envelope);

        self.post_json(&url, envelope, "sending session message")
            .await?;
        Ok(())
    }

    async fn post_json(&self, url: &str, body: String, what: &'static str) -> Result<String> {
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .header("Content-Type", "application/json; charset=utf-8")
            .body(body)
            .send()
            .await?;
        read_ok(response, what).await
    }
}

/// Read a response body, surfacing non-2xx statuses as `HttpNonOk`.
async fn read_ok(response: reqwest::Response, what: &'static str) -> Result<String> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        error!("{} failed with HTTP {}", what, status.as_u16());
        debug!("response body: {}", body);
        return Err(HolepunchError::HttpNonOk(status.as_u16()));
    }
    Ok(body)
}

/// Escape a string for embedding inside a JSON string literal.
///
/// Only quotes and backslashes occur in the strings built here; control
/// characters never do.
fn escape_json_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_tags() {
        assert_eq!(ConsoleFamily::Ps4.platform(), "PS4");
        assert_eq!(ConsoleFamily::Ps5.platform(), "PS5");
    }

    #[test]
    fn test_escape_json_string() {
        assert_eq!(
            escape_json_string("ver=1.0, type=text, body={\"a\":1}"),
            "ver=1.0, type=text, body={\\\"a\\\":1}"
        );
        assert_eq!(escape_json_string("back\\slash"), "back\\\\slash");
    }

    #[test]
    fn test_device_list_parsing() {
        let body = format!(
            "{{\"clients\":[{{\"duid\":\"{}\",\"device\":{{\"name\":\"PS5-393\",\
             \"enabledFeatures\":[\"remotePlay\"]}}}}]}}",
            "ab".repeat(32)
        );
        let parsed: DeviceListResponse = serde_json::from_str(&body).expect("parse device list");
        assert_eq!(parsed.clients.len(), 1);
        assert_eq!(parsed.clients[0].device.name, "PS5-393");
        assert_eq!(parsed.clients[0].device.enabled_features, ["remotePlay"]);
    }

    #[test]
    fn test_device_list_missing_field_is_rejected() {
        let body = "{\"clients\":[{\"duid\":\"abcd\"}]}";
        assert!(serde_json::from_str::<DeviceListResponse>(body).is_err());
    }

    #[test]
    fn test_start_session_envelope_shape() {
        let initial_params = "{\"accountId\":1,\"roomId\":0}";
        let escaped = escape_json_string(initial_params);
        let envelope = format!(
            "{{\"commandDetail\":{{\"parameters\":{{\"initialParams\":\"{}\"}}}}}}",
            escaped
        );
        let json: Value = serde_json::from_str(&envelope).expect("envelope parses");
        let embedded = json
            .pointer("/commandDetail/parameters/initialParams")
            .and_then(Value::as_str)
            .expect("initialParams is a string");
        assert_eq!(embedded, initial_params);
    }
}
