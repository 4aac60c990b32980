//! Dialogue-form preference records
//!
//! A record holds `chosen` and `rejected` conversations and optionally an
//! explicit `prompt`. Without one, every turn but the last of `chosen` is the
//! prompt and the final turns are the two responses.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{DataError, PreferenceExample};

/// Speaker of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// System instructions
    System,
    /// Human turn
    User,
    /// Model turn
    Assistant,
}

impl FromStr for Role {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(DataError::UnknownRole { role: other.to_string() }),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        f.write_str(name)
    }
}

/// One chat message. The role is kept as a string so records with unknown
/// roles still deserialize and are rejected with a precise error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// `system`, `user` or `assistant`
    pub role: String,
    /// Message text
    pub content: String,
}

impl Message {
    /// Create a message
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }

    /// Parsed role
    pub fn role(&self) -> Result<Role, DataError> {
        self.role.parse()
    }
}

/// A preference record in dialogue form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferenceDialogue {
    /// Explicit prompt turns
    #[serde(default)]
    pub prompt: Option<Vec<Message>>,
    /// Preferred conversation or final turn
    pub chosen: Vec<Message>,
    /// Dispreferred conversation or final turn
    pub rejected: Vec<Message>,
}

/// Prompt and response turns after splitting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedDialogue {
    /// Prompt turns
    pub prompt: Vec<Message>,
    /// Chosen response turns
    pub chosen: Vec<Message>,
    /// Rejected response turns
    pub rejected: Vec<Message>,
}

impl PreferenceDialogue {
    /// Split into prompt and response turns.
    ///
    /// Every message must carry a known role. With
    /// `auto_insert_empty_system_msg`, an empty system message is prepended to
    /// the prompt when it does not already start with one.
    pub fn split(&self, auto_insert_empty_system_msg: bool) -> Result<TokenizedDialogue, DataError> {
        let all = self
            .prompt
            .iter()
            .flatten()
            .chain(&self.chosen)
            .chain(&self.rejected);
        for message in all {
            message.role()?;
        }

        let (mut prompt, chosen, rejected) = match &self.prompt {
            Some(prompt) => (prompt.clone(), self.chosen.clone(), self.rejected.clone()),
            None => {
                let (chosen_last, chosen_head) = self.chosen.split_last().ok_or_else(|| {
                    DataError::InvalidDialogue { reason: "chosen conversation is empty".to_string() }
                })?;
                let rejected_last = self.rejected.last().ok_or_else(|| DataError::InvalidDialogue {
                    reason: "rejected conversation is empty".to_string(),
                })?;
                (chosen_head.to_vec(), vec![chosen_last.clone()], vec![rejected_last.clone()])
            }
        };

        if chosen.is_empty() || rejected.is_empty() {
            return Err(DataError::InvalidDialogue {
                reason: "chosen and rejected need at least one response turn".to_string(),
            });
        }

        if auto_insert_empty_system_msg {
            let has_system = matches!(prompt.first().map(Message::role), Some(Ok(Role::System)));
            if !has_system {
                prompt.insert(0, Message::new(Role::System, ""));
            }
        }

        Ok(TokenizedDialogue { prompt, chosen, rejected })
    }

    /// Split and tokenize into a [`PreferenceExample`].
    ///
    /// `tokenize` renders and encodes a list of turns; chat templating is the
    /// caller's concern. A leading `bos_token_id` is stripped from the encoded
    /// responses since the prompt already carries it.
    pub fn tokenize<F>(
        &self,
        auto_insert_empty_system_msg: bool,
        bos_token_id: Option<u32>,
        mut tokenize: F,
    ) -> Result<PreferenceExample, DataError>
    where
        F: FnMut(&[Message]) -> Result<Vec<u32>, DataError>,
    {
        let split = self.split(auto_insert_empty_system_msg)?;
        let prompt_ids = tokenize(&split.prompt)?;
        let chosen_ids = strip_bos(tokenize(&split.chosen)?, bos_token_id);
        let rejected_ids = strip_bos(tokenize(&split.rejected)?, bos_token_id);
        Ok(PreferenceExample::new(prompt_ids, chosen_ids, rejected_ids))
    }
}

fn strip_bos(mut ids: Vec<u32>, bos_token_id: Option<u32>) -> Vec<u32> {
    if let Some(bos) = bos_token_id {
        if ids.first() == Some(&bos) {
            ids.remove(0);
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation(final_turn: &str) -> Vec<Message> {
        vec![
            Message::new(Role::User, "hi"),
            Message::new(Role::Assistant, "hello"),
            Message::new(Role::User, "tell me a joke"),
            Message::new(Role::Assistant, final_turn),
        ]
    }

    #[test]
    fn test_split_uses_all_but_last_turn_as_prompt() {
        let dialogue = PreferenceDialogue {
            prompt: None,
            chosen: conversation("a good joke"),
            rejected: conversation("no"),
        };
        let split = dialogue.split(false).unwrap();
        assert_eq!(split.prompt.len(), 3);
        assert_eq!(split.chosen[0].content, "a good joke");
        assert_eq!(split.rejected[0].content, "no");
    }

    #[test]
    fn test_empty_system_message_inserted_once() {
        let dialogue = PreferenceDialogue {
            prompt: Some(vec![Message::new(Role::User, "q")]),
            chosen: vec![Message::new(Role::Assistant, "a")],
            rejected: vec![Message::new(Role::Assistant, "b")],
        };
        let split = dialogue.split(true).unwrap();
        assert_eq!(split.prompt[0], Message::new(Role::System, ""));
        assert_eq!(split.prompt.len(), 2);

        let with_system = PreferenceDialogue {
            prompt: Some(split.prompt.clone()),
            ..dialogue
        };
        assert_eq!(with_system.split(true).unwrap().prompt.len(), 2);
    }

    #[test]
    fn test_unknown_role_rejected() {
        let dialogue = PreferenceDialogue {
            prompt: None,
            chosen: vec![Message { role: "tool".into(), content: "x".into() }],
            rejected: vec![Message::new(Role::Assistant, "b")],
        };
        assert!(matches!(dialogue.split(false), Err(DataError::UnknownRole { .. })));
    }

    #[test]
    fn test_tokenize_strips_bos_from_responses() {
        let dialogue = PreferenceDialogue {
            prompt: Some(vec![Message::new(Role::User, "q")]),
            chosen: vec![Message::new(Role::Assistant, "yes")],
            rejected: vec![Message::new(Role::Assistant, "no")],
        };
        let example = dialogue
            .tokenize(false, Some(1), |turns| {
                let mut ids = vec![1];
                ids.extend(turns.iter().map(|m| m.content.len() as u32 + 10));
                Ok(ids)
            })
            .unwrap();
        assert_eq!(example.prompt_ids, vec![1, 11]);
        assert_eq!(example.chosen_ids, vec![13]);
        assert_eq!(example.rejected_ids, vec![12]);
    }
}
