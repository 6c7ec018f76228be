use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

const SEEN_MID_CAPACITY: usize = 4_096;

#[derive(Debug, Clone)]
pub struct MessengerConfig {
    pub verify_token: String,
    pub app_secret: Option<String>,
    pub page_access_token: Option<String>,
    pub graph_base: String,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            verify_token: "dev-verify-token".to_string(),
            app_secret: None,
            page_access_token: None,
            graph_base: "https://graph.facebook.com/v19.0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifyQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

pub fn verify_subscription(query: &VerifyQuery, expected_token: &str) -> Option<String> {
    let mode = query.mode.as_deref()?;
    let token = query.verify_token.as_deref()?;
    if mode != "subscribe" || !constant_time_eq(token.as_bytes(), expected_token.as_bytes()) {
        return None;
    }
    query.challenge.clone()
}

pub fn verify_signature(header: &str, payload: &[u8], app_secret: &str) -> bool {
    let Some(expected) = header.trim().strip_prefix("sha256=") else {
        return false;
    };
    let mut mac = match Hmac::<Sha256>::new_from_slice(app_secret.as_bytes()) {
        Ok(value) => value,
        Err(_) => return false,
    };
    mac.update(payload);
    let computed = hex_encode(mac.finalize().into_bytes().as_slice());
    constant_time_eq(
        computed.as_bytes(),
        expected.to_ascii_lowercase().as_bytes(),
    )
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    pub object: String,
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEntry {
    #[serde(default)]
    pub messaging: Vec<MessagingEvent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagingEvent {
    pub sender: Participant,
    pub message: Option<InboundMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    pub mid: Option<String>,
    pub text: Option<String>,
    #[serde(default)]
    pub is_echo: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundText {
    pub sender_id: String,
    pub mid: Option<String>,
    pub text: String,
}

impl WebhookPayload {
    pub fn inbound_texts(&self) -> Vec<InboundText> {
        self.entry
            .iter()
            .flat_map(|entry| entry.messaging.iter())
            .filter_map(|event| {
                let message = event.message.as_ref()?;
                if message.is_echo {
                    return None;
                }
                let text = message.text.as_deref()?;
                if text.trim().is_empty() {
                    return None;
                }
                Some(InboundText {
                    sender_id: event.sender.id.clone(),
                    mid: message.mid.clone(),
                    text: text.to_string(),
                })
            })
            .collect()
    }
}

// Messenger redelivers events it considers unacknowledged, keyed by the same `mid`.
#[derive(Debug, Clone, Default)]
pub struct SeenMids {
    inner: Arc<Mutex<SeenMidsInner>>,
}

#[derive(Debug, Default)]
struct SeenMidsInner {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl SeenMids {
    pub fn first_delivery(&self, mid: &str) -> bool {
        let mut guard = self.inner.lock();
        if guard.ids.contains(mid) {
            return false;
        }

        if guard.order.len() >= SEEN_MID_CAPACITY {
            if let Some(oldest) = guard.order.pop_front() {
                guard.ids.remove(&oldest);
            }
        }
        guard.ids.insert(mid.to_string());
        guard.order.push_back(mid.to_string());
        true
    }
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    recipient: Participant,
    messaging_type: &'static str,
    message: OutboundText<'a>,
}

#[derive(Debug, Serialize)]
struct OutboundText<'a> {
    text: &'a str,
}

#[derive(Debug, Clone)]
pub struct MessengerClient {
    http: Client,
    graph_base: String,
    page_access_token: String,
}

impl MessengerClient {
    pub fn from_config(http: Client, config: &MessengerConfig) -> Option<Self> {
        let token = config.page_access_token.clone()?;
        Some(Self {
            http,
            graph_base: config.graph_base.trim_end_matches('/').to_string(),
            page_access_token: token,
        })
    }

    pub async fn send_text(&self, recipient_id: &str, text: &str) -> Result<()> {
        let url = format!("{}/me/messages", self.graph_base);
        let body = SendRequest {
            recipient: Participant {
                id: recipient_id.to_string(),
            },
            messaging_type: "RESPONSE",
            message: OutboundText { text },
        };

        self.http
            .post(url)
            .query(&[("access_token", self.page_access_token.as_str())])
            .json(&body)
            .send()
            .await
            .context("messenger send request failed")?
            .error_for_status()
            .context("messenger send api rejected message")?;

        Ok(())
    }
}

fn constant_time_eq(lhs: &[u8], rhs: &[u8]) -> bool {
    if lhs.len() != rhs.len() {
        return false;
    }
    let mut diff = 0_u8;
    for (a, b) in lhs.iter().zip(rhs.iter()) {
        diff |= a ^ b;
    }
    diff == 0
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(format!("{:02x}", byte).as_str());
    }
    out
}

#[cfg(test)]
pub(crate) fn sign_payload(payload: &[u8], app_secret: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(payload);
    format!("sha256={}", hex_encode(mac.finalize().into_bytes().as_slice()))
}
