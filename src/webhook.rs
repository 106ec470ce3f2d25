//! Webhook helpers for a transport that receives provider deliveries
//!
//! [`WebhookHandler::handle`] authenticates a delivery against the shared
//! secret, demultiplexes `ping` and `push` events and hands pushes to the
//! [`TriggerDispatcher`]. It never waits for synchronization; the response
//! classification maps onto an HTTP status with [`WebhookResponse::status_code`].

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha1::Sha1;
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dispatcher::{RejectReason, SyncTicket, TriggerDispatcher, TriggerResponse};
use crate::error::WebhookError;

/// Header carrying the HMAC-SHA1 signature
pub const SIGNATURE_HEADER: &str = "X-Hub-Signature";
/// Header carrying the HMAC-SHA256 signature
pub const SIGNATURE_256_HEADER: &str = "X-Hub-Signature-256";
/// Header naming the event type
pub const EVENT_HEADER: &str = "X-GitHub-Event";

#[derive(Debug, Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    repository: RepositoryPayload,
}

#[derive(Debug, Deserialize)]
struct RepositoryPayload {
    name: String,
}

#[derive(Debug, Deserialize)]
struct PingPayload {
    #[serde(default)]
    zen: Option<String>,
}

/// A decoded delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEvent {
    Ping,
    Push { repository: String, git_ref: String },
}

/// Verify a `sha1=<hex>` or `sha256=<hex>` signature over `body` in constant time
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> Result<(), WebhookError> {
    let (scheme, digest) = signature
        .trim()
        .split_once('=')
        .ok_or(WebhookError::MalformedSignature)?;
    let expected = hex::decode(digest).map_err(|_| WebhookError::MalformedSignature)?;

    match scheme {
        "sha1" => verify_mac::<Hmac<Sha1>>(secret, body, &expected),
        "sha256" => verify_mac::<Hmac<Sha256>>(secret, body, &expected),
        other => Err(WebhookError::UnsupportedScheme(other.to_string())),
    }
}

fn verify_mac<M: Mac + hmac::digest::KeyInit>(
    secret: &str,
    body: &[u8],
    expected: &[u8],
) -> Result<(), WebhookError> {
    // HMAC accepts keys of any length
    let mut mac = <M as Mac>::new_from_slice(secret.as_bytes())
        .map_err(|_| WebhookError::SignatureMismatch)?;
    mac.update(body);
    mac.verify_slice(expected)
        .map_err(|_| WebhookError::SignatureMismatch)
}

/// Decode a delivery. `Ok(None)` for event types other than ping and push.
pub fn parse_event(event_type: &str, body: &[u8]) -> Result<Option<WebhookEvent>, WebhookError> {
    match event_type.to_ascii_lowercase().as_str() {
        "ping" => {
            let ping: PingPayload = serde_json::from_slice(body)?;
            debug!("Ping received: {}", ping.zen.unwrap_or_default());
            Ok(Some(WebhookEvent::Ping))
        }
        "push" => {
            let push: PushPayload = serde_json::from_slice(body)?;
            Ok(Some(WebhookEvent::Push {
                repository: push.repository.name,
                git_ref: push.git_ref,
            }))
        }
        _ => Ok(None),
    }
}

/// What a delivery resulted in
#[derive(Debug)]
pub enum WebhookResponse {
    Pong,
    Accepted(SyncTicket),
    Rejected(RejectReason),
    Unauthorized(WebhookError),
    Unsupported(String),
    Malformed(WebhookError),
}

impl WebhookResponse {
    pub fn status_code(&self) -> u16 {
        match self {
            WebhookResponse::Pong => 200,
            WebhookResponse::Accepted(_) => 202,
            WebhookResponse::Rejected(RejectReason::WrongBranch { .. }) => 200,
            WebhookResponse::Rejected(RejectReason::NotRegistered) => 404,
            WebhookResponse::Unauthorized(_) => 401,
            WebhookResponse::Unsupported(_) | WebhookResponse::Malformed(_) => 400,
        }
    }
}

impl std::fmt::Display for WebhookResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WebhookResponse::Pong => write!(f, "pong"),
            WebhookResponse::Accepted(ticket) => write!(f, "accepted: syncing {}", ticket.repository()),
            WebhookResponse::Rejected(reason) => write!(f, "ignored: {}", reason),
            WebhookResponse::Unauthorized(e) => write!(f, "unauthorized: {}", e),
            WebhookResponse::Unsupported(event) => write!(f, "unsupported event '{}'", event),
            WebhookResponse::Malformed(e) => write!(f, "malformed: {}", e),
        }
    }
}

/// Verify, decode and dispatch webhook deliveries
pub struct WebhookHandler {
    dispatcher: TriggerDispatcher,
    secret: Option<String>,
    skip_verification: bool,
}

impl WebhookHandler {
    pub fn new(dispatcher: TriggerDispatcher, secret: Option<String>, skip_verification: bool) -> Self {
        if skip_verification {
            warn!("Webhook signature verification is disabled");
        }
        Self {
            dispatcher,
            secret,
            skip_verification,
        }
    }

    pub fn from_config(config: &Config, dispatcher: TriggerDispatcher) -> Self {
        Self::new(
            dispatcher,
            config.webhook.secret.clone(),
            config.webhook.skip_verification,
        )
    }

    /// Handle one delivery. `signature` is the raw signature header value.
    pub fn handle(&self, event_type: &str, signature: Option<&str>, body: &[u8]) -> WebhookResponse {
        if let Err(e) = self.authenticate(signature, body) {
            warn!("Rejected {} delivery: {}", event_type, e);
            return WebhookResponse::Unauthorized(e);
        }

        let event = match parse_event(event_type, body) {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!("Ignoring unsupported event '{}'", event_type);
                return WebhookResponse::Unsupported(event_type.to_string());
            }
            Err(e) => {
                warn!("Malformed {} delivery: {}", event_type, e);
                return WebhookResponse::Malformed(e);
            }
        };

        match event {
            WebhookEvent::Ping => {
                info!("Webhook ping received");
                WebhookResponse::Pong
            }
            WebhookEvent::Push { repository, git_ref } => {
                match self.dispatcher.on_push_event(&repository, &git_ref) {
                    TriggerResponse::Accepted(ticket) => WebhookResponse::Accepted(ticket),
                    TriggerResponse::Rejected(reason) => WebhookResponse::Rejected(reason),
                }
            }
        }
    }

    fn authenticate(&self, signature: Option<&str>, body: &[u8]) -> Result<(), WebhookError> {
        if self.skip_verification {
            warn!("Accepting delivery without signature verification");
            return Ok(());
        }

        let signature = signature.ok_or(WebhookError::MissingSignature)?;
        let Some(secret) = self.secret.as_deref() else {
            warn!("No webhook secret configured; every signed delivery is rejected");
            return Err(WebhookError::SignatureMismatch);
        };

        verify_signature(secret, body, signature)
    }
}
