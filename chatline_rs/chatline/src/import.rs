//! Readers for exported chat histories.
//!
//! Archives are expected to be unpacked already: the Facebook reader takes a
//! single thread JSON file and the Twitter reader takes `direct-messages.js`.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::chat::{Chat, Message, Provider};
use crate::CurveError;

pub const MIN_CHAT_MESSAGES: usize = 10;

const WHATSAPP_HEADER: &str = r"(\d{2}/\d{2}/\d{4}, \d{2}:\d{2}) - ([\w ]+): ";
const WHATSAPP_DATETIME: &str = "%d/%m/%Y, %H:%M";

pub trait NameResolver {
    fn resolve(&self, id: &str) -> Option<String>;
}

impl NameResolver for HashMap<String, String> {
    fn resolve(&self, id: &str) -> Option<String> {
        self.get(id).cloned()
    }
}

pub struct NoResolver;

impl NameResolver for NoResolver {
    fn resolve(&self, _id: &str) -> Option<String> {
        None
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    WhatsAppText,
    FacebookJson,
    TwitterJs,
}

pub fn detect_format(name: &str, input: &[u8]) -> Result<Format, CurveError> {
    let name_lc = name.to_ascii_lowercase();
    if name_lc.ends_with(".txt") {
        Ok(Format::WhatsAppText)
    } else if name_lc.ends_with(".json") {
        Ok(Format::FacebookJson)
    } else if name_lc.ends_with(".js") {
        let head = String::from_utf8_lossy(&input[..input.len().min(256)]);
        if name_lc.contains("direct-messages") || head.contains("direct_messages") {
            Ok(Format::TwitterJs)
        } else {
            Err(CurveError::UnsupportedFormat(name.to_string()))
        }
    } else {
        Err(CurveError::UnsupportedFormat(name.to_string()))
    }
}

pub fn parse_chats(
    input: &[u8],
    name: &str,
    resolver: &dyn NameResolver,
) -> Result<Vec<Chat>, CurveError> {
    let format = detect_format(name, input)?;
    let text = std::str::from_utf8(input).map_err(|e| CurveError::Import(e.to_string()))?;
    let (provider, conversations) = match format {
        Format::WhatsAppText => (Provider::WhatsApp, vec![parse_whatsapp(text)?]),
        Format::FacebookJson => (Provider::Facebook, parse_facebook(text)?),
        Format::TwitterJs => (Provider::Twitter, parse_twitter(text, resolver)?),
    };
    let total = conversations.len();
    let chats: Vec<Chat> = conversations
        .into_iter()
        .filter_map(|messages| match Chat::from_messages(messages, provider) {
            Ok(chat) => Some(chat),
            Err(err) => {
                warn!("skipping conversation in {}: {}", name, err);
                None
            }
        })
        .collect();
    debug!(file = name, total, kept = chats.len(), "parsed chats");
    Ok(chats)
}

/// Plain-text export: `dd/mm/yyyy, HH:MM - Sender: text`, one header per message.
pub fn parse_whatsapp(text: &str) -> Result<Vec<Message>, CurveError> {
    let header = Regex::new(WHATSAPP_HEADER).map_err(|e| CurveError::Import(e.to_string()))?;
    let headers: Vec<_> = header.captures_iter(text).collect();
    if headers.is_empty() {
        return Err(CurveError::Import("no message headers found".into()));
    }
    let mut messages = Vec::with_capacity(headers.len());
    for (i, caps) in headers.iter().enumerate() {
        let (Some(whole), Some(stamp), Some(sender)) = (caps.get(0), caps.get(1), caps.get(2))
        else {
            continue;
        };
        let body_end = headers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map(|m| m.start())
            .unwrap_or(text.len());
        let datetime = match NaiveDateTime::parse_from_str(stamp.as_str(), WHATSAPP_DATETIME) {
            Ok(naive) => Utc.from_utc_datetime(&naive),
            Err(_) => continue,
        };
        messages.push(Message::new(
            sender.as_str(),
            datetime,
            &text[whole.end()..body_end],
        ));
    }
    Ok(messages)
}

#[derive(Deserialize)]
struct FacebookThread {
    #[serde(default)]
    thread_type: String,
    #[serde(default)]
    messages: Vec<FacebookMessage>,
}

#[derive(Deserialize)]
struct FacebookMessage {
    #[serde(default)]
    sender_name: String,
    timestamp_ms: i64,
    #[serde(default)]
    content: Option<String>,
}

pub fn parse_facebook(text: &str) -> Result<Vec<Vec<Message>>, CurveError> {
    let thread: FacebookThread =
        serde_json::from_str(text).map_err(|e| CurveError::Import(e.to_string()))?;
    if thread.thread_type != "Regular" || thread.messages.len() < MIN_CHAT_MESSAGES {
        return Ok(Vec::new());
    }
    let messages: Vec<Message> = thread
        .messages
        .into_iter()
        .filter_map(|m| {
            let datetime = DateTime::<Utc>::from_timestamp_millis(m.timestamp_ms)?;
            Some(Message::new(m.sender_name, datetime, m.content.unwrap_or_default()))
        })
        .collect();
    Ok(vec![messages])
}

#[derive(Deserialize)]
struct TwitterEntry {
    #[serde(rename = "dmConversation")]
    conversation: TwitterConversation,
}

#[derive(Deserialize)]
struct TwitterConversation {
    #[serde(default)]
    messages: Vec<TwitterEvent>,
}

#[derive(Deserialize)]
struct TwitterEvent {
    #[serde(rename = "messageCreate")]
    create: Option<TwitterMessage>,
}

#[derive(Deserialize)]
struct TwitterMessage {
    #[serde(rename = "senderId")]
    sender_id: String,
    #[serde(rename = "createdAt")]
    created_at: String,
    #[serde(default)]
    text: String,
}

/// Twitter `direct-messages.js`: a JS assignment wrapping a JSON array.
pub fn parse_twitter(
    text: &str,
    resolver: &dyn NameResolver,
) -> Result<Vec<Vec<Message>>, CurveError> {
    let start = text
        .find('[')
        .ok_or_else(|| CurveError::Import("no conversation array found".into()))?;
    let entries: Vec<TwitterEntry> =
        serde_json::from_str(&text[start..]).map_err(|e| CurveError::Import(e.to_string()))?;
    let conversations: Vec<Vec<Message>> = entries
        .into_iter()
        .map(|entry| {
            entry
                .conversation
                .messages
                .into_iter()
                .filter_map(|event| {
                    let m = event.create?;
                    let datetime = DateTime::parse_from_rfc3339(&m.created_at)
                        .ok()?
                        .with_timezone(&Utc);
                    let sender = resolver.resolve(&m.sender_id).unwrap_or(m.sender_id);
                    Some(Message::new(sender, datetime, m.text))
                })
                .collect::<Vec<_>>()
        })
        .collect();
    Ok(conversations)
}

/// Drop repeated chats, keeping the first occurrence of each key.
pub fn unique_chats(chats: Vec<Chat>) -> Vec<Chat> {
    let mut seen = HashSet::new();
    let total = chats.len();
    let unique: Vec<Chat> = chats
        .into_iter()
        .filter(|chat| seen.insert(chat.key().to_string()))
        .collect();
    if unique.len() < total {
        debug!(dropped = total - unique.len(), "dropped duplicate chats");
    }
    unique
}

/// Order a batch of chats for display.
pub fn tidy_chats(chats: Vec<Chat>) -> Vec<Chat> {
    let mut appearances: HashMap<String, usize> = HashMap::new();
    for chat in &chats {
        for participant in chat.participants() {
            *appearances.entry(participant.clone()).or_insert(0) += 1;
        }
    }
    let rank = |name: &str| appearances.get(name).copied().unwrap_or(0);

    let mut chats: Vec<Chat> = chats
        .into_iter()
        .filter(|chat| chat.len() >= MIN_CHAT_MESSAGES)
        .map(|chat| {
            let [a, b] = chat.participants();
            if rank(b) > rank(a) {
                chat.swapped()
            } else {
                chat
            }
        })
        .collect();
    chats.sort_by(|a, b| b.len().cmp(&a.len()));
    chats
}
