//! Outbound rendering of listings and banners as chat messages.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::model::{Banner, Event, MediaKind};

/// One inline keyboard button: label shown to the user, data echoed back
/// in the callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    pub data: String,
}

impl Button {
    pub fn new(label: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            data: data.into(),
        }
    }
}

/// Inline keyboard as rows of buttons.
pub type Keyboard = Vec<Vec<Button>>;

/// Output surface the engine and schedulers talk to.
#[async_trait]
pub trait Presenter: Send + Sync {
    async fn send_text(&self, target: i64, text: &str, keyboard: Option<Keyboard>) -> Result<()>;

    /// Render a listing with its media: an album for several items, a
    /// captioned single message for one, plain text otherwise.
    async fn send_listing(&self, target: i64, event: &Event) -> Result<()>;

    async fn send_banner(&self, target: i64, banner: &Banner) -> Result<()>;
}

/// Listing body shared by every rendering shape.
pub fn listing_text(event: &Event) -> String {
    let mut text = format!(
        "#{} {}\n[{}] {}\n\n{}",
        event.id,
        event.title,
        event.category.label(),
        format_schedule(event.occurs_at),
        event.description,
    );
    if let Some(contact) = &event.contact {
        text.push_str(&format!("\nContact: {contact}"));
    }
    text.push_str(&format!("\nMap: {}", map_link(event.lat, event.lon)));
    text
}

fn format_schedule(at: DateTime<Utc>) -> String {
    at.format("%d.%m.%Y %H:%M UTC").to_string()
}

fn map_link(lat: f64, lon: f64) -> String {
    format!("https://www.openstreetmap.org/?mlat={lat}&mlon={lon}#map=14/{lat}/{lon}")
}

/// HTTP adapter for a Telegram-style bot API.
pub struct ChatApi {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl ChatApi {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("building chat client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            token: token.into(),
        })
    }

    async fn call(&self, method: &str, payload: Value) -> Result<()> {
        let url = format!("{}/bot{}/{}", self.base_url, self.token, method);
        self.client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("chat call {method} failed"))?
            .error_for_status()
            .with_context(|| format!("chat call {method} rejected"))?;
        Ok(())
    }
}

fn keyboard_json(keyboard: Keyboard) -> Value {
    let rows: Vec<Value> = keyboard
        .into_iter()
        .map(|row| {
            row.into_iter()
                .map(|b| json!({ "text": b.label, "callback_data": b.data }))
                .collect()
        })
        .collect();
    json!({ "inline_keyboard": rows })
}

#[async_trait]
impl Presenter for ChatApi {
    async fn send_text(&self, target: i64, text: &str, keyboard: Option<Keyboard>) -> Result<()> {
        let mut payload = json!({ "chat_id": target, "text": text });
        if let Some(kb) = keyboard {
            payload["reply_markup"] = keyboard_json(kb);
        }
        self.call("sendMessage", payload).await
    }

    async fn send_listing(&self, target: i64, event: &Event) -> Result<()> {
        let text = listing_text(event);
        match event.media.len() {
            0 => self.call("sendMessage", json!({ "chat_id": target, "text": text })).await,
            1 => {
                let item = &event.media[0];
                let (method, field) = match item.kind {
                    MediaKind::Photo => ("sendPhoto", "photo"),
                    MediaKind::Video => ("sendVideo", "video"),
                };
                self.call(
                    method,
                    json!({ "chat_id": target, field: item.file_ref, "caption": text }),
                )
                .await
            }
            _ => {
                // Albums carry the caption on the first item only.
                let media: Vec<Value> = event
                    .media
                    .iter()
                    .enumerate()
                    .map(|(i, item)| {
                        let kind = match item.kind {
                            MediaKind::Photo => "photo",
                            MediaKind::Video => "video",
                        };
                        let mut entry = json!({ "type": kind, "media": item.file_ref });
                        if i == 0 {
                            entry["caption"] = Value::String(text.clone());
                        }
                        entry
                    })
                    .collect();
                self.call("sendMediaGroup", json!({ "chat_id": target, "media": media }))
                    .await
            }
        }
    }

    async fn send_banner(&self, target: i64, banner: &Banner) -> Result<()> {
        let caption = banner.url.clone().unwrap_or_default();
        let (method, field) = match banner.media.kind {
            MediaKind::Photo => ("sendPhoto", "photo"),
            MediaKind::Video => ("sendVideo", "video"),
        };
        self.call(
            method,
            json!({ "chat_id": target, field: banner.media.file_ref, "caption": caption }),
        )
        .await
    }
}
