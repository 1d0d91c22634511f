//! DRM - license acquisition for protected sources
//!
//! Supports:
//! - Widevine (Chromecast, Chrome, Android)
//! - PlayReady (Smart TVs, Edge)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  KeySystemConfig                     │
//! ├─────────────────────────────────────────────────────┤
//! │                                                     │
//! │   ┌──────────┐          ┌───────────┐               │
//! │   │ Widevine │          │ PlayReady │   adapters    │
//! │   └────┬─────┘          └─────┬─────┘               │
//! │        └──────────┬───────────┘                     │
//! │            ┌──────┴───────┐                         │
//! │            │ LicenseBroker│  pending set + retry    │
//! │            └──────┬───────┘                         │
//! │            ┌──────┴───────┐                         │
//! │            │  Transport   │  POST, bearer ticket    │
//! │            └──────────────┘                         │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod broker;
pub mod transport;

pub use broker::{BrokerStats, LicenseBroker, PendingExchanges, PendingLicenseRequest, DEFAULT_LICENSE_TIMEOUT};
pub use transport::{HttpLicenseTransport, LicenseReply, LicenseRequest, LicenseTransport, OCTET_STREAM};

use crate::{types::redact, Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use quick_xml::events::Event;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Content type of a plaintext PlayReady SOAP challenge
pub const PLAYREADY_CONTENT_TYPE: &str = "text/xml; charset=utf-8";

/// Supported key systems
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeySystem {
    Widevine,
    PlayReady,
}

impl std::fmt::Display for KeySystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySystem::Widevine => write!(f, "widevine"),
            KeySystem::PlayReady => write!(f, "playready"),
        }
    }
}

/// Decoder robustness requested from the CDM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Robustness {
    pub video: String,
    pub audio: String,
}

impl Robustness {
    /// Software decode, the level available on Chromecast-class devices
    pub fn software() -> Self {
        Self {
            video: "SW_SECURE_DECODE".to_string(),
            audio: "SW_SECURE_CRYPTO".to_string(),
        }
    }
}

/// Body and headers to send for one key message
#[derive(Debug, Clone, PartialEq)]
pub struct LicenseChallenge {
    pub body: Bytes,
    pub content_type: String,
    pub headers: Vec<(String, String)>,
}

/// Per key system transform between CDM messages and the license server
pub trait KeySystemAdapter: Send + Sync + std::fmt::Debug {
    fn key_system(&self) -> KeySystem;

    /// Turn a CDM key message into a license server request
    fn build_license_request(&self, key_message: &[u8]) -> Result<LicenseChallenge>;

    /// Turn a license server reply into CDM license material
    fn parse_license_response(&self, license: Bytes) -> Result<Bytes> {
        Ok(license)
    }

    /// Robustness to request, if the key system has the notion
    fn robustness(&self) -> Option<Robustness> {
        None
    }
}

/// Widevine: the key message is the request body, the reply is the license
#[derive(Debug, Clone, Copy, Default)]
pub struct Widevine;

impl KeySystemAdapter for Widevine {
    fn key_system(&self) -> KeySystem {
        KeySystem::Widevine
    }

    fn build_license_request(&self, key_message: &[u8]) -> Result<LicenseChallenge> {
        Ok(LicenseChallenge {
            body: Bytes::copy_from_slice(key_message),
            content_type: OCTET_STREAM.to_string(),
            headers: Vec::new(),
        })
    }

    fn robustness(&self) -> Option<Robustness> {
        Some(Robustness::software())
    }
}

/// PlayReady: unwraps the `PlayReadyKeyMessage` envelope when present
#[derive(Debug, Clone, Copy, Default)]
pub struct PlayReady;

impl KeySystemAdapter for PlayReady {
    fn key_system(&self) -> KeySystem {
        KeySystem::PlayReady
    }

    fn build_license_request(&self, key_message: &[u8]) -> Result<LicenseChallenge> {
        let text = decode_key_message_text(key_message);
        let Some(envelope) = parse_key_message_envelope(&text)? else {
            return Ok(LicenseChallenge {
                body: Bytes::copy_from_slice(key_message),
                content_type: PLAYREADY_CONTENT_TYPE.to_string(),
                headers: Vec::new(),
            });
        };

        let encoded = envelope
            .challenge
            .ok_or_else(|| Error::KeyMessage("PlayReady envelope has no Challenge".into()))?;
        let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
        let challenge = STANDARD
            .decode(compact.as_bytes())
            .map_err(|e| Error::KeyMessage(format!("Challenge is not base64: {}", e)))?;

        let mut content_type = PLAYREADY_CONTENT_TYPE.to_string();
        let mut headers = Vec::new();
        for (name, value) in envelope.headers {
            if name.eq_ignore_ascii_case("content-type") {
                content_type = value;
            } else {
                headers.push((name, value));
            }
        }

        debug!(bytes = challenge.len(), headers = headers.len(), "Unwrapped PlayReady challenge");
        Ok(LicenseChallenge {
            body: Bytes::from(challenge),
            content_type,
            headers,
        })
    }
}

/// Key messages arrive as UTF-16LE on most PlayReady CDMs, UTF-8 on some
fn decode_key_message_text(message: &[u8]) -> String {
    let utf16 = message.starts_with(&[0xff, 0xfe]) || (message.len() >= 2 && message[0] != 0 && message[1] == 0);
    if utf16 && message.len() % 2 == 0 {
        let units: Vec<u16> = message
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units).trim_start_matches('\u{feff}').to_string()
    } else {
        String::from_utf8_lossy(message).into_owned()
    }
}

/// Root element of a wrapped PlayReady key message
const ENVELOPE_ROOT: &str = "PlayReadyKeyMessage";

/// Fields lifted from a `PlayReadyKeyMessage` envelope
#[derive(Debug, Default)]
struct KeyMessageEnvelope {
    challenge: Option<String>,
    headers: Vec<(String, String)>,
}

/// Parse the `PlayReadyKeyMessage` envelope. `None` when the message is
/// something else (a bare SOAP challenge, or not XML at all).
///
/// Element names are matched on their local part, so prefixed documents
/// parse the same way.
fn parse_key_message_envelope(xml: &str) -> Result<Option<KeyMessageEnvelope>> {
    let mut reader = quick_xml::Reader::from_str(xml);
    let mut envelope = KeyMessageEnvelope::default();
    let mut in_envelope = false;
    let mut path: Vec<String> = Vec::new();
    let mut header = (String::new(), String::new());

    loop {
        let event = match reader.read_event() {
            Ok(event) => event,
            Err(_) if !in_envelope => return Ok(None),
            Err(e) => return Err(Error::KeyMessage(format!("invalid PlayReady envelope: {}", e))),
        };

        match event {
            Event::Start(ref e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if path.is_empty() {
                    if in_envelope || name != ENVELOPE_ROOT {
                        break;
                    }
                    in_envelope = true;
                }
                match name.as_str() {
                    "Challenge" => envelope.challenge = Some(String::new()),
                    "HttpHeader" => header = (String::new(), String::new()),
                    _ => {}
                }
                path.push(name);
            }
            Event::Empty(ref e) => {
                if path.is_empty() {
                    in_envelope = e.local_name().as_ref() == ENVELOPE_ROOT.as_bytes();
                    break;
                }
                if e.local_name().as_ref() == b"Challenge" {
                    envelope.challenge = Some(String::new());
                }
            }
            Event::End(_) => {
                if path.pop().as_deref() == Some("HttpHeader") {
                    let (name, value) = std::mem::take(&mut header);
                    let name = name.trim();
                    if !name.is_empty() {
                        envelope.headers.push((name.to_string(), value.trim().to_string()));
                    }
                }
                if path.is_empty() {
                    break;
                }
            }
            Event::Text(ref e) => {
                let text = e
                    .unescape()
                    .map_err(|e| Error::KeyMessage(format!("invalid PlayReady envelope: {}", e)))?;
                collect_text(&path, &text, &mut envelope, &mut header);
            }
            Event::CData(e) => {
                let raw = e.into_inner();
                collect_text(&path, &String::from_utf8_lossy(&raw), &mut envelope, &mut header);
            }
            Event::Eof => {
                if !path.is_empty() {
                    return Err(Error::KeyMessage(format!("PlayReady envelope ends inside <{}>", path.join("/"))));
                }
                break;
            }
            _ => {}
        }
    }

    Ok(in_envelope.then_some(envelope))
}

/// Route character data to the field of the enclosing element
fn collect_text(path: &[String], text: &str, envelope: &mut KeyMessageEnvelope, header: &mut (String, String)) {
    let in_header = path.len() >= 2 && path[path.len() - 2] == "HttpHeader";
    match path.last().map(String::as_str) {
        Some("Challenge") => {
            if let Some(challenge) = envelope.challenge.as_mut() {
                challenge.push_str(text);
            }
        }
        Some("name") if in_header => header.0.push_str(text),
        Some("value") if in_header => header.1.push_str(text),
        _ => {}
    }
}

/// License URL for a media item: the server URL plus a `contentId` parameter
pub fn license_endpoint(license_server_url: &str, media_id: &str) -> Result<Url> {
    let mut url = Url::parse(license_server_url).map_err(|source| Error::InvalidLicenseUrl {
        url: license_server_url.to_string(),
        source,
    })?;
    url.query_pairs_mut().append_pair("contentId", media_id);
    Ok(url)
}

/// A key system wired to the license broker of one load
#[derive(Clone)]
pub struct KeySystemConfig {
    adapter: Arc<dyn KeySystemAdapter>,
    license_url: Url,
    ticket: String,
    broker: Arc<LicenseBroker>,
    timeout: Duration,
}

impl KeySystemConfig {
    pub fn new(
        adapter: Arc<dyn KeySystemAdapter>,
        license_url: Url,
        ticket: impl Into<String>,
        broker: Arc<LicenseBroker>,
        timeout: Duration,
    ) -> Self {
        Self {
            adapter,
            license_url,
            ticket: ticket.into(),
            broker,
            timeout,
        }
    }

    pub fn system(&self) -> KeySystem {
        self.adapter.key_system()
    }

    pub fn license_url(&self) -> &Url {
        &self.license_url
    }

    pub fn robustness(&self) -> Option<Robustness> {
        self.adapter.robustness()
    }

    pub fn broker(&self) -> &Arc<LicenseBroker> {
        &self.broker
    }

    /// License callback: key message in, license bytes out
    pub async fn request_license(&self, key_message: &[u8]) -> Result<Bytes> {
        let challenge = self.adapter.build_license_request(key_message)?;
        let mut request = LicenseRequest::new(self.license_url.clone(), self.ticket.clone(), challenge.body)
            .with_content_type(challenge.content_type);
        for (name, value) in challenge.headers {
            request = request.with_header(name, value);
        }
        let license = self.broker.acquire_license(request, self.timeout).await?;
        self.adapter.parse_license_response(license)
    }
}

impl std::fmt::Debug for KeySystemConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySystemConfig")
            .field("system", &self.system())
            .field("license_url", &self.license_url.as_str())
            .field("ticket", &redact(&self.ticket))
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::broker::test_support::{ScriptedTransport, Step};
    use super::*;

    fn utf16le(text: &str) -> Vec<u8> {
        text.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
    }

    fn playready_envelope(challenge: &str) -> String {
        format!(
            "<PlayReadyKeyMessage type=\"LicenseAcquisition\"><LicenseAcquisition Version=\"1\">\
             <Challenge encoding=\"base64encoded\">{}</Challenge>\
             <HttpHeaders>\
             <HttpHeader><name>Content-Type</name><value>text/xml; charset=utf-8</value></HttpHeader>\
             <HttpHeader><name>SOAPAction</name><value>http://schemas.microsoft.com/DRM/2007/03/protocols/AcquireLicense</value></HttpHeader>\
             </HttpHeaders></LicenseAcquisition></PlayReadyKeyMessage>",
            STANDARD.encode(challenge)
        )
    }

    #[test]
    fn test_license_endpoint_appends_content_id() {
        let url = license_endpoint("https://lic.example/v1", "m1").unwrap();
        assert_eq!(url.as_str(), "https://lic.example/v1?contentId=m1");

        let url = license_endpoint("https://lic.example/v1?tenant=a", "m 2").unwrap();
        assert_eq!(url.as_str(), "https://lic.example/v1?tenant=a&contentId=m+2");
    }

    #[test]
    fn test_license_endpoint_rejects_garbage() {
        let err = license_endpoint("not a url", "m1").unwrap_err();
        assert!(matches!(err, Error::InvalidLicenseUrl { .. }));
    }

    #[test]
    fn test_widevine_passes_message_through() {
        let challenge = Widevine.build_license_request(&[0x08, 0x01, 0x12]).unwrap();
        assert_eq!(challenge.body.as_ref(), &[0x08, 0x01, 0x12]);
        assert_eq!(challenge.content_type, OCTET_STREAM);
        assert_eq!(Widevine.robustness().unwrap().video, "SW_SECURE_DECODE");
    }

    #[test]
    fn test_playready_unwraps_utf16_envelope() {
        let message = utf16le(&playready_envelope("<soap:Envelope>challenge</soap:Envelope>"));
        let challenge = PlayReady.build_license_request(&message).unwrap();

        assert_eq!(challenge.body.as_ref(), b"<soap:Envelope>challenge</soap:Envelope>");
        assert_eq!(challenge.content_type, "text/xml; charset=utf-8");
        assert_eq!(challenge.headers.len(), 1);
        assert_eq!(challenge.headers[0].0, "SOAPAction");
    }

    #[test]
    fn test_playready_unwraps_utf8_envelope() {
        let message = playready_envelope("<soap/>");
        let challenge = PlayReady.build_license_request(message.as_bytes()).unwrap();
        assert_eq!(challenge.body.as_ref(), b"<soap/>");
    }

    #[test]
    fn test_playready_plain_challenge_passes_through() {
        let challenge = PlayReady.build_license_request(b"<soap:Envelope/>").unwrap();
        assert_eq!(challenge.body.as_ref(), b"<soap:Envelope/>");
        assert_eq!(challenge.content_type, PLAYREADY_CONTENT_TYPE);
        assert!(challenge.headers.is_empty());
    }

    #[test]
    fn test_playready_prefixed_envelope_with_cdata() {
        let message = format!(
            "<pr:PlayReadyKeyMessage xmlns:pr=\"urn:playready\"><pr:LicenseAcquisition>\
             <pr:Challenge><![CDATA[{}]]></pr:Challenge>\
             <pr:HttpHeaders><pr:HttpHeader><pr:name>X-Session</pr:name><pr:value>a=1&amp;b=2</pr:value></pr:HttpHeader>\
             </pr:HttpHeaders></pr:LicenseAcquisition></pr:PlayReadyKeyMessage>",
            STANDARD.encode("<soap/>")
        );
        let challenge = PlayReady.build_license_request(&utf16le(&message)).unwrap();

        assert_eq!(challenge.body.as_ref(), b"<soap/>");
        assert_eq!(challenge.content_type, PLAYREADY_CONTENT_TYPE);
        assert_eq!(challenge.headers, vec![("X-Session".to_string(), "a=1&b=2".to_string())]);
    }

    #[test]
    fn test_playready_envelope_without_challenge_is_error() {
        let err = PlayReady
            .build_license_request(b"<PlayReadyKeyMessage><LicenseAcquisition/></PlayReadyKeyMessage>")
            .unwrap_err();
        assert!(matches!(err, Error::KeyMessage(_)));

        let err = PlayReady
            .build_license_request(b"<PlayReadyKeyMessage><Challenge>AAAA</Challenge>")
            .unwrap_err();
        assert!(matches!(err, Error::KeyMessage(_)));
    }

    #[test]
    fn test_playready_bad_base64_is_error() {
        let message = "<PlayReadyKeyMessage><Challenge>***</Challenge></PlayReadyKeyMessage>";
        let err = PlayReady.build_license_request(message.as_bytes()).unwrap_err();
        assert!(matches!(err, Error::KeyMessage(_)));
    }

    #[tokio::test]
    async fn test_key_system_config_delegates_to_broker() {
        let transport = ScriptedTransport::new(vec![Step::ok(0, b"license")]);
        let broker = Arc::new(LicenseBroker::new(transport.clone()));
        let config = KeySystemConfig::new(
            Arc::new(Widevine),
            license_endpoint("https://lic.example/v1", "m1").unwrap(),
            "t1",
            broker,
            DEFAULT_LICENSE_TIMEOUT,
        );

        let license = config.request_license(&[1, 2, 3]).await.unwrap();

        assert_eq!(license.as_ref(), b"license");
        let sent = transport.requests.lock().unwrap();
        assert_eq!(sent[0].endpoint.as_str(), "https://lic.example/v1?contentId=m1");
        assert_eq!(sent[0].ticket, "t1");
        assert_eq!(sent[0].body.as_ref(), &[1, 2, 3]);
        assert!(!format!("{:?}", config).contains("t1\""));
    }
}
