use std::fmt;

use serde::{Deserialize, Serialize};

/// Conversation speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => formatter.write_str("user"),
            Self::Assistant => formatter.write_str("assistant"),
        }
    }
}

/// One conversation entry.
///
/// `answer_index` is a byte offset into `content` where the reasoning phase ends
/// and the final answer begins. It always falls on a char boundary because it is
/// recorded as the length of previously concatenated chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_index: Option<usize>,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            answer_index: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Creates the empty assistant placeholder appended on stream start.
    pub fn assistant_placeholder() -> Self {
        Self::new(Role::Assistant, String::new())
    }

    pub fn is_assistant(&self) -> bool {
        matches!(self.role, Role::Assistant)
    }

    /// Text produced before the answer boundary; empty until a boundary is recorded.
    pub fn reasoning(&self) -> &str {
        match self.answer_index {
            Some(index) => self.content.get(..index).unwrap_or_default(),
            None => "",
        }
    }

    /// Text from the answer boundary onward, or the whole content when no boundary exists.
    pub fn answer(&self) -> &str {
        match self.answer_index {
            Some(index) => self.content.get(index..).unwrap_or_default(),
            None => &self.content,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_serializes_answer_index_in_camel_case() {
        let mut turn = Turn::assistant_placeholder();
        turn.content.push_str("hmm...4");
        turn.answer_index = Some(6);

        let json = serde_json::to_value(&turn).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"role": "assistant", "content": "hmm...4", "answerIndex": 6})
        );
    }

    #[test]
    fn turn_without_boundary_omits_answer_index() {
        let json = serde_json::to_string(&Turn::user("2+2=?")).unwrap();
        assert_eq!(json, r#"{"role":"user","content":"2+2=?"}"#);
    }

    #[test]
    fn answer_split_respects_boundary() {
        let turn = Turn {
            role: Role::Assistant,
            content: "thinking about it. 4".to_string(),
            answer_index: Some(19),
        };
        assert_eq!(turn.reasoning(), "thinking about it. ");
        assert_eq!(turn.answer(), "4");

        let unbounded = Turn::new(Role::Assistant, "4");
        assert_eq!(unbounded.reasoning(), "");
        assert_eq!(unbounded.answer(), "4");
    }
}
