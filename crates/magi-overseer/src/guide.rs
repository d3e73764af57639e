//! Prompt-guiding heuristics for the monologue loop.
//!
//! Before each turn the overseer inspects recent history: an unanswered
//! human turn forces the talk tool; having just spoken inserts a
//! don't-pester nudge; otherwise there is a small chance of a
//! mind-wandering nudge.

use magi_core::{categorize, MessageCategory};
use magi_model::Message;

/// How recent (in messages) a talk call must be to count as "just spoke".
const JUST_SPOKE_WINDOW: usize = 5;

/// Probability of the mind-wandering nudge when nothing else applies.
const MIND_WANDER_PROBABILITY: f64 = 0.10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptGuide {
    /// Force the talk tool: the human's last turn has no reply yet.
    AnswerUser,
    DontPester,
    MindWander,
    None,
}

pub fn choose_guide(messages: &[Message], mind_wandering: bool) -> PromptGuide {
    choose_guide_with(messages, mind_wandering, rand::random::<f64>())
}

/// Deterministic core: `roll` replaces the random draw in tests.
pub fn choose_guide_with(messages: &[Message], mind_wandering: bool, roll: f64) -> PromptGuide {
    let last_user = messages
        .iter()
        .rposition(|m| categorize(m) == MessageCategory::UserSaid);
    let last_talk = messages
        .iter()
        .rposition(|m| categorize(m) == MessageCategory::TalkToUserToolCall);

    if let Some(user_idx) = last_user {
        if last_talk.map_or(true, |talk_idx| talk_idx < user_idx) {
            return PromptGuide::AnswerUser;
        }
    }
    if let Some(talk_idx) = last_talk {
        if messages.len() - talk_idx <= JUST_SPOKE_WINDOW {
            return PromptGuide::DontPester;
        }
    }
    if mind_wandering && roll < MIND_WANDER_PROBABILITY {
        return PromptGuide::MindWander;
    }
    PromptGuide::None
}

/// The temporary developer nudge injected for this turn only.
pub fn nudge_text(guide: PromptGuide, talk_tool_name: &str) -> Option<String> {
    match guide {
        PromptGuide::AnswerUser => Some(format!(
            "The user is waiting for a reply. Respond with the {talk_tool_name} tool \
             before doing anything else."
        )),
        PromptGuide::DontPester => Some(
            "You just replied to the user. Do not message them again unless something \
             material changed; keep working quietly."
                .into(),
        ),
        PromptGuide::MindWander => Some(
            "Nothing is pressing right now. Let your mind wander: revisit goals, \
             memories, or running tasks and note anything worth acting on."
                .into(),
        ),
        PromptGuide::None => None,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use magi_model::ToolCallData;

    fn user_said() -> Message {
        Message::user("Alice said: how is the research going?")
    }

    fn talk_call() -> Message {
        Message::function_call(&ToolCallData::function(
            "c1",
            "talk_to_alice",
            r#"{"message":"going well"}"#,
        ))
    }

    #[test]
    fn unanswered_user_forces_talk_tool() {
        let messages = vec![Message::assistant("working"), user_said()];
        assert_eq!(
            choose_guide_with(&messages, true, 0.99),
            PromptGuide::AnswerUser
        );
    }

    #[test]
    fn talk_before_user_still_counts_as_unanswered() {
        let messages = vec![talk_call(), user_said()];
        assert_eq!(
            choose_guide_with(&messages, true, 0.99),
            PromptGuide::AnswerUser
        );
    }

    #[test]
    fn recent_talk_after_user_means_dont_pester() {
        let messages = vec![user_said(), talk_call(), Message::assistant("back to it")];
        assert_eq!(
            choose_guide_with(&messages, true, 0.99),
            PromptGuide::DontPester
        );
    }

    #[test]
    fn old_talk_no_longer_suppresses() {
        let mut messages = vec![user_said(), talk_call()];
        for i in 0..10 {
            messages.push(Message::assistant(format!("thought {i}")));
        }
        assert_eq!(choose_guide_with(&messages, true, 0.99), PromptGuide::None);
    }

    #[test]
    fn mind_wander_fires_on_low_roll() {
        let messages = vec![Message::assistant("idle")];
        assert_eq!(
            choose_guide_with(&messages, true, 0.05),
            PromptGuide::MindWander
        );
        assert_eq!(choose_guide_with(&messages, true, 0.5), PromptGuide::None);
        assert_eq!(choose_guide_with(&messages, false, 0.05), PromptGuide::None);
    }

    #[test]
    fn nudges_name_the_talk_tool() {
        let text = nudge_text(PromptGuide::AnswerUser, "talk_to_alice").unwrap();
        assert!(text.contains("talk_to_alice"));
        assert!(nudge_text(PromptGuide::None, "talk_to_alice").is_none());
    }
}
