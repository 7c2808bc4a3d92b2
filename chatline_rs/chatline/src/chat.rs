use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::search::nearest_floor;
use crate::CurveError;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    WhatsApp,
    Facebook,
    Twitter,
    #[default]
    Manual,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::WhatsApp => "whatsapp",
            Provider::Facebook => "facebook",
            Provider::Twitter => "twitter",
            Provider::Manual => "manual",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Weighting {
    #[default]
    Count,
    Length,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub sender: String,
    pub datetime: DateTime<Utc>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
}

impl Message {
    pub fn new(sender: impl Into<String>, datetime: DateTime<Utc>, text: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            datetime,
            text: text.into(),
            weight: None,
        }
    }

    pub fn timestamp_ms(&self) -> f64 {
        self.datetime.timestamp_millis() as f64
    }

    pub fn effective_weight(&self, weighting: Weighting) -> f64 {
        match weighting {
            Weighting::Count => self.weight.unwrap_or(1.0),
            Weighting::Length => (self.text.chars().count() as f64).max(1.0),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Chat {
    participants: [String; 2],
    messages: Vec<Message>,
    provider: Provider,
    key: String,
}

impl Chat {
    pub fn new(
        participants: [String; 2],
        messages: Vec<Message>,
        provider: Provider,
    ) -> Result<Self, CurveError> {
        if participants[0] == participants[1] {
            return Err(CurveError::InvalidParameter(format!(
                "participants must differ (both are '{}')",
                participants[0]
            )));
        }
        let mut seen = [false, false];
        for message in &messages {
            match participants.iter().position(|p| *p == message.sender) {
                Some(idx) => seen[idx] = true,
                None => return Err(CurveError::UnknownParticipant(message.sender.clone())),
            }
        }
        if messages
            .windows(2)
            .any(|pair| pair[1].datetime < pair[0].datetime)
        {
            return Err(CurveError::UnsortedMessages);
        }
        if !seen[0] || !seen[1] {
            return Err(CurveError::InsufficientData);
        }
        let key = format!("{}-{}-{}", participants[0], participants[1], messages.len());
        Ok(Self {
            participants,
            messages,
            provider,
            key,
        })
    }

    /// Keeps the two most prolific senders. Ties go to whoever spoke first.
    pub fn from_messages(messages: Vec<Message>, provider: Provider) -> Result<Self, CurveError> {
        let mut messages: Vec<Message> = messages
            .into_iter()
            .filter(|m| !m.sender.is_empty() && !m.text.is_empty())
            .collect();

        let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
        for (order, m) in messages.iter().enumerate() {
            counts.entry(m.sender.as_str()).or_insert((0, order)).0 += 1;
        }
        let mut ranked: Vec<(&str, (usize, usize))> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(a.1 .1.cmp(&b.1 .1)));
        let (a, b) = match ranked.as_slice() {
            [first, second, ..] => (first.0.to_string(), second.0.to_string()),
            _ => return Err(CurveError::InsufficientData),
        };

        messages.retain(|m| m.sender == a || m.sender == b);
        messages.sort_by_key(|m| m.datetime);
        Self::new([a, b], messages, provider)
    }

    pub fn participants(&self) -> &[String; 2] {
        &self.participants
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn swapped(&self) -> Self {
        let [a, b] = self.participants.clone();
        let key = format!("{}-{}-{}", b, a, self.messages.len());
        Self {
            participants: [b, a],
            messages: self.messages.clone(),
            provider: self.provider,
            key,
        }
    }

    pub fn events_for(&self, participant: &str, weighting: Weighting) -> Vec<(f64, f64)> {
        self.messages
            .iter()
            .filter(|m| m.sender == participant)
            .map(|m| (m.timestamp_ms(), m.effective_weight(weighting)))
            .collect()
    }

    pub fn time_span(&self) -> (f64, f64) {
        let first = self.messages.first().map(Message::timestamp_ms).unwrap_or(0.0);
        let last = self.messages.last().map(Message::timestamp_ms).unwrap_or(first);
        (first, last)
    }

    /// Index of the latest message at or before `at`, or the first message if
    /// `at` precedes the chat.
    pub fn nearest_message(&self, at: DateTime<Utc>) -> Option<usize> {
        let times: Vec<f64> = self.messages.iter().map(Message::timestamp_ms).collect();
        nearest_floor(&times, at.timestamp_millis() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    fn msg(sender: &str, secs: i64) -> Message {
        Message::new(sender, at(secs), "hi")
    }

    fn pair() -> [String; 2] {
        ["ann".to_string(), "bob".to_string()]
    }

    #[test]
    fn rejects_unsorted_messages() {
        let err = Chat::new(pair(), vec![msg("ann", 10), msg("bob", 5)], Provider::Manual).unwrap_err();
        assert!(matches!(err, CurveError::UnsortedMessages));
    }

    #[test]
    fn rejects_strangers_and_silent_participants() {
        let err = Chat::new(pair(), vec![msg("ann", 1), msg("cat", 2)], Provider::Manual).unwrap_err();
        assert!(matches!(err, CurveError::UnknownParticipant(ref who) if who == "cat"));

        let err = Chat::new(pair(), vec![msg("ann", 1), msg("ann", 2)], Provider::Manual).unwrap_err();
        assert!(matches!(err, CurveError::InsufficientData));
    }

    #[test]
    fn builds_key_from_participants_and_size() {
        let chat = Chat::new(pair(), vec![msg("ann", 1), msg("bob", 2)], Provider::Manual).unwrap();
        assert_eq!(chat.key(), "ann-bob-2");
        assert_eq!(chat.swapped().key(), "bob-ann-2");
    }

    #[test]
    fn from_messages_keeps_two_most_prolific_senders() {
        let messages = vec![
            msg("cat", 9),
            msg("bob", 3),
            msg("ann", 1),
            msg("bob", 2),
            msg("ann", 4),
            msg("ann", 5),
            Message::new("bob", at(6), ""),
        ];
        let chat = Chat::from_messages(messages, Provider::WhatsApp).unwrap();
        assert_eq!(chat.participants(), &pair());
        assert_eq!(chat.len(), 5);
        let times: Vec<i64> = chat.messages().iter().map(|m| m.datetime.timestamp()).collect();
        assert_eq!(times, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn from_messages_needs_two_senders() {
        let err = Chat::from_messages(vec![msg("ann", 1)], Provider::Manual).unwrap_err();
        assert!(matches!(err, CurveError::InsufficientData));
    }

    #[test]
    fn length_weighting_counts_characters() {
        let mut m = Message::new("ann", at(0), "héllo");
        assert_eq!(m.effective_weight(Weighting::Length), 5.0);
        assert_eq!(m.effective_weight(Weighting::Count), 1.0);
        m.weight = Some(2.5);
        assert_eq!(m.effective_weight(Weighting::Count), 2.5);
    }

    #[test]
    fn nearest_message_tracks_hover_time() {
        let chat = Chat::new(
            pair(),
            vec![msg("ann", 100), msg("bob", 200), msg("ann", 300)],
            Provider::Manual,
        )
        .unwrap();
        assert_eq!(chat.nearest_message(at(0)), Some(0));
        assert_eq!(chat.nearest_message(at(250)), Some(1));
        assert_eq!(chat.nearest_message(at(300)), Some(2));
        assert_eq!(chat.nearest_message(at(9_000)), Some(2));
    }
}
