//! `WhatsApp` Cloud API sender
//!
//! POSTs to the graph `/{phone_number_id}/messages` endpoint and returns the
//! provider message id from the response.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;

use super::OutboundPayload;
use crate::{Error, Result};

const SEND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    messages: Vec<SentMessage>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    id: String,
}

/// Cloud API client
#[derive(Clone)]
pub struct CloudClient {
    client: Client,
    graph_base: String,
    api_version: String,
}

impl CloudClient {
    /// Create a client against a graph API base
    #[must_use]
    pub fn new(graph_base: String, api_version: String) -> Self {
        Self {
            client: Client::new(),
            graph_base,
            api_version,
        }
    }

    /// Send a payload, returning the provider message id
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the API rejects the payload;
    /// the API's error text is surfaced in the message.
    pub async fn send(
        &self,
        phone_number_id: &str,
        token: &str,
        to: &str,
        payload: &OutboundPayload,
    ) -> Result<String> {
        let url = format!(
            "{}/{}/{phone_number_id}/messages",
            self.graph_base, self.api_version
        );

        let body = build_body(to, payload);

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .timeout(SEND_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Channel(format!("cloud send failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Channel(format!("cloud API error: {status} - {text}")));
        }

        let parsed: SendResponse = response.json().await?;
        parsed
            .messages
            .into_iter()
            .next()
            .map(|m| m.id)
            .ok_or_else(|| Error::Channel("cloud API returned no message id".to_string()))
    }

    /// Mark an inbound message read (sends the read receipt)
    ///
    /// # Errors
    ///
    /// Returns error if the request fails
    pub async fn mark_read(
        &self,
        phone_number_id: &str,
        token: &str,
        provider_message_id: &str,
    ) -> Result<()> {
        let url = format!(
            "{}/{}/{phone_number_id}/messages",
            self.graph_base, self.api_version
        );

        let body = serde_json::json!({
            "messaging_product": "whatsapp",
            "status": "read",
            "message_id": provider_message_id,
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .timeout(SEND_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Channel(format!("mark read failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Channel(format!(
                "mark read rejected: {}",
                response.status()
            )));
        }

        Ok(())
    }
}

fn build_body(to: &str, payload: &OutboundPayload) -> serde_json::Value {
    match payload {
        OutboundPayload::Text { body } => serde_json::json!({
            "messaging_product": "whatsapp",
            "to": to,
            "type": "text",
            "text": { "body": body },
        }),
        OutboundPayload::Media {
            kind,
            url,
            caption,
            filename,
        } => {
            let mut media = serde_json::json!({ "link": url });
            if let Some(caption) = caption {
                media["caption"] = serde_json::Value::String(caption.clone());
            }
            if kind == "document" {
                if let Some(filename) = filename {
                    media["filename"] = serde_json::Value::String(filename.clone());
                }
            }
            let mut body = serde_json::json!({
                "messaging_product": "whatsapp",
                "to": to,
                "type": kind,
            });
            body[kind.as_str()] = media;
            body
        }
        OutboundPayload::Location {
            latitude,
            longitude,
            name,
        } => serde_json::json!({
            "messaging_product": "whatsapp",
            "to": to,
            "type": "location",
            "location": {
                "latitude": latitude,
                "longitude": longitude,
                "name": name,
            },
        }),
        OutboundPayload::Buttons { body, buttons } => {
            let rendered: Vec<serde_json::Value> = buttons
                .iter()
                .map(|b| {
                    serde_json::json!({
                        "type": "reply",
                        "reply": { "id": b.id, "title": b.title },
                    })
                })
                .collect();
            serde_json::json!({
                "messaging_product": "whatsapp",
                "to": to,
                "type": "interactive",
                "interactive": {
                    "type": "button",
                    "body": { "text": body },
                    "action": { "buttons": rendered },
                },
            })
        }
    }
}
