//! Normalization of raw chat-platform events into [`QuestionEvent`]s.

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::orchestrator::QuestionEvent;

/// A message event as delivered by the chat platform.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChatEvent {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub channel_type: Option<String>,
    #[serde(default)]
    pub ts: Option<String>,
    #[serde(default)]
    pub thread_ts: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub bot_id: Option<String>,
    #[serde(default)]
    pub subtype: Option<String>,
}

impl ChatEvent {
    pub fn is_direct_message(&self) -> bool {
        self.channel_type.as_deref() == Some("im")
            || self.channel.as_deref().is_some_and(|c| c.starts_with('D'))
    }
}

/// A question ready for the orchestrator, plus where the answer goes.
#[derive(Clone, Debug)]
pub struct InboundQuestion {
    pub event: QuestionEvent,
    /// Thread to reply in; `None` replies at the top of the conversation.
    pub reply_thread: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// Remove `<@BOT>` and `<@BOT|name>` markup for the given bot user.
pub fn strip_mentions(text: &str, bot_user_id: &str) -> String {
    let pattern = format!(r"<@{}(\|[^>]*)?>", regex::escape(bot_user_id));
    match Regex::new(&pattern) {
        Ok(re) => re.replace_all(text, "").trim().to_string(),
        Err(_) => text.trim().to_string(),
    }
}

/// Turn a chat event into a question, or `None` if it should be ignored.
///
/// Bot messages, edits and other subtypes, and the bot's own messages are
/// dropped. Direct messages are always questions. In channels only
/// `app_mention` events are: the platform also delivers the same mention as
/// a plain `message`, which is ignored so it is answered once.
pub fn normalize(event: &ChatEvent, bot_user_id: Option<&str>) -> Option<InboundQuestion> {
    if event.bot_id.is_some() || event.subtype.is_some() {
        debug!(kind = %event.kind, "ignoring bot or subtype event");
        return None;
    }
    let user = non_empty(&event.user)?;
    let channel = non_empty(&event.channel)?;
    if bot_user_id == Some(user) {
        return None;
    }

    let text = match bot_user_id {
        Some(bot) => strip_mentions(&event.text, bot),
        None => event.text.trim().to_string(),
    };

    if event.is_direct_message() {
        let thread = non_empty(&event.thread_ts).map(str::to_string);
        return Some(InboundQuestion {
            event: QuestionEvent {
                actor_id: user.to_string(),
                channel_id: channel.to_string(),
                thread_id: thread.clone(),
                text,
            },
            reply_thread: thread,
        });
    }

    if event.kind != "app_mention" {
        return None;
    }

    let thread = non_empty(&event.thread_ts)
        .or_else(|| non_empty(&event.ts))
        .map(str::to_string);
    Some(InboundQuestion {
        event: QuestionEvent {
            actor_id: user.to_string(),
            channel_id: channel.to_string(),
            thread_id: thread.clone(),
            text,
        },
        reply_thread: thread,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOT: &str = "UBOT";

    fn message(channel: &str, text: &str) -> ChatEvent {
        ChatEvent {
            kind: "message".into(),
            user: Some("U1".into()),
            channel: Some(channel.into()),
            ts: Some("1700000000.000100".into()),
            text: text.into(),
            ..ChatEvent::default()
        }
    }

    #[test]
    fn strips_plain_and_labelled_mentions() {
        assert_eq!(strip_mentions("<@UBOT> where is auth?", BOT), "where is auth?");
        assert_eq!(strip_mentions("hey <@UBOT|askrepo> hi", BOT), "hey  hi");
        assert_eq!(strip_mentions("<@UOTHER> stays", BOT), "<@UOTHER> stays");
    }

    #[test]
    fn direct_message_accepted_without_mention() {
        let mut ev = message("D123", "  how does caching work? ");
        ev.channel_type = Some("im".into());
        let q = normalize(&ev, Some(BOT)).unwrap();
        assert_eq!(q.event.text, "how does caching work?");
        assert_eq!(q.event.thread_id, None);
        assert_eq!(q.reply_thread, None);
    }

    #[test]
    fn direct_message_detected_by_channel_prefix() {
        let ev = message("D999", "q");
        assert!(ev.is_direct_message());
        assert!(normalize(&ev, None).is_some());
    }

    #[test]
    fn direct_message_in_thread_keeps_thread() {
        let mut ev = message("D123", "follow-up");
        ev.thread_ts = Some("1699999999.000001".into());
        let q = normalize(&ev, Some(BOT)).unwrap();
        assert_eq!(q.event.thread_id.as_deref(), Some("1699999999.000001"));
    }

    #[test]
    fn channel_messages_are_not_questions() {
        assert!(normalize(&message("C1", "just chatting"), Some(BOT)).is_none());
        assert!(normalize(&message("C1", "<@UBOT> what is X?"), Some(BOT)).is_none());
    }

    #[test]
    fn mention_delivered_twice_is_answered_once() {
        let plain = message("C1", "<@UBOT> what is X?");
        let mut mention = plain.clone();
        mention.kind = "app_mention".into();

        let questions: Vec<_> = [plain, mention]
            .iter()
            .filter_map(|ev| normalize(ev, Some(BOT)))
            .collect();
        assert_eq!(questions.len(), 1);
        assert_eq!(questions[0].event.text, "what is X?");
        assert_eq!(questions[0].reply_thread.as_deref(), Some("1700000000.000100"));
    }

    #[test]
    fn app_mention_threads_on_parent() {
        let mut ev = message("C1", "<@UBOT> and how is it tested?");
        ev.kind = "app_mention".into();
        ev.thread_ts = Some("1690000000.000001".into());
        let q = normalize(&ev, Some(BOT)).unwrap();
        assert_eq!(q.event.thread_id.as_deref(), Some("1690000000.000001"));
        assert_eq!(q.reply_thread.as_deref(), Some("1690000000.000001"));
    }

    #[test]
    fn bare_mention_yields_empty_question() {
        let mut ev = message("C1", "<@UBOT>");
        ev.kind = "app_mention".into();
        let q = normalize(&ev, Some(BOT)).unwrap();
        assert!(q.event.text.is_empty());
    }

    #[test]
    fn ignores_bots_subtypes_and_self() {
        let mut bot = message("D1", "hi");
        bot.bot_id = Some("B1".into());
        assert!(normalize(&bot, Some(BOT)).is_none());

        let mut edited = message("D1", "hi");
        edited.subtype = Some("message_changed".into());
        assert!(normalize(&edited, Some(BOT)).is_none());

        let mut own = message("D1", "hi");
        own.user = Some(BOT.into());
        assert!(normalize(&own, Some(BOT)).is_none());
    }

    #[test]
    fn ignores_events_without_user_or_channel() {
        let mut ev = message("D1", "hi");
        ev.user = None;
        assert!(normalize(&ev, None).is_none());

        let mut ev = message("D1", "hi");
        ev.channel = Some(String::new());
        assert!(normalize(&ev, None).is_none());
    }

    #[test]
    fn deserializes_platform_payload() {
        let ev: ChatEvent = serde_json::from_value(serde_json::json!({
            "type": "app_mention",
            "user": "U1",
            "channel": "C1",
            "ts": "1.2",
            "text": "<@UBOT> hello",
            "event_ts": "1.2"
        }))
        .unwrap();
        assert_eq!(ev.kind, "app_mention");
        assert!(ev.bot_id.is_none());
    }
}
