//! Dataset preparation: raw records → canonical conversations → formatted,
//! tokenized, loss-masked examples.

mod load;
mod normalize;
mod prepare;

pub use load::{load_records, Split};
pub use normalize::normalize;
pub use prepare::{format_example, prepare_dataset, DatasetReport, Examples, FormattedExample, PreparedDataset, RecordFailure};

use crate::error::DatasetResult;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Stable identifier for a prepared dataset (content hash).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetId(pub String);

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One raw row of the source file, with its position in that file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub index: usize,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "system" => Some(Self::System),
            "user" | "human" => Some(Self::User),
            "assistant" | "gpt" => Some(Self::Assistant),
            "tool" | "ipython" => Some(Self::Tool),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

/// Canonical `{messages: [...]}` shape every record is normalized into.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Conversation {
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn has_assistant_content(&self) -> bool {
        self.messages.iter().any(|m| m.role == Role::Assistant && !m.content.trim().is_empty())
    }
}

pub fn compute_dataset_id<'a>(
    conversations: impl IntoIterator<Item = &'a Conversation>,
    template: &str,
    tokenizer: &str,
) -> DatasetResult<DatasetId> {
    let mut hasher = Sha256::new();
    hasher.update(template.as_bytes());
    hasher.update(b"\n");
    hasher.update(tokenizer.as_bytes());
    hasher.update(b"\n");

    for conversation in conversations {
        let bytes = serde_json::to_vec(conversation)?;
        hasher.update(bytes);
        hasher.update(b"\n");
    }

    Ok(DatasetId(hex::encode(hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convo(text: &str) -> Conversation {
        Conversation {
            messages: vec![
                Message { role: Role::User, content: text.to_string() },
                Message { role: Role::Assistant, content: "ok".to_string() },
            ],
        }
    }

    #[test]
    fn test_compute_dataset_id_stable_for_same_content() {
        let items = vec![convo("a"), convo("b")];
        let id1 = compute_dataset_id(&items, "chatml", "bytes").unwrap();
        let id2 = compute_dataset_id(&items, "chatml", "bytes").unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn test_compute_dataset_id_depends_on_template() {
        let items = vec![convo("a")];
        let a = compute_dataset_id(&items, "chatml", "bytes").unwrap();
        let b = compute_dataset_id(&items, "llama-3.1", "bytes").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_role_parse_aliases() {
        assert_eq!(Role::parse("Human"), Some(Role::User));
        assert_eq!(Role::parse("assistant"), Some(Role::Assistant));
        assert_eq!(Role::parse("narrator"), None);
    }
}
