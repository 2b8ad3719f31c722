//! Tokenizer seam.
//!
//! Engines ship their own [`Tokenizer`]. [`ChatTokenizer`] wraps it with the chat
//! template binding: the template and its special tokens are attached exactly once
//! and every later encode goes through them.

use crate::template::ChatTemplate;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub trait Tokenizer: Send + Sync {
    /// Stable identifier, part of the dataset cache key.
    fn id(&self) -> &str;

    fn vocab_size(&self) -> usize;

    /// Encode plain text (no special-token handling).
    fn encode(&self, text: &str) -> Vec<u32>;

    fn decode(&self, ids: &[u32]) -> String;

    /// Id of a token the tokenizer already knows as a single unit, if any.
    fn token_id(&self, token: &str) -> Option<u32>;
}

/// The template and special-token table attached to a tokenizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateBinding {
    pub template: ChatTemplate,
    pub add_generation_prompt: bool,
    pub special_tokens: BTreeMap<String, u32>,
    pub bos_token: Option<String>,
    pub eos_token: String,
}

#[derive(Clone)]
pub struct ChatTokenizer {
    inner: Arc<dyn Tokenizer>,
    binding: Arc<OnceCell<TemplateBinding>>,
}

impl fmt::Debug for ChatTokenizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatTokenizer")
            .field("tokenizer", &self.inner.id())
            .field("binding", &self.binding.get())
            .finish()
    }
}

impl ChatTokenizer {
    pub fn new(inner: Arc<dyn Tokenizer>) -> Self {
        Self { inner, binding: Arc::new(OnceCell::new()) }
    }

    pub fn id(&self) -> &str {
        self.inner.id()
    }

    pub fn binding(&self) -> Option<&TemplateBinding> {
        self.binding.get()
    }

    pub fn inner(&self) -> &Arc<dyn Tokenizer> {
        &self.inner
    }

    /// Attach `template`. Returns the binding in effect, which is the existing one
    /// if the tokenizer was already bound (callers compare to detect conflicts).
    pub(crate) fn bind(&self, template: ChatTemplate, add_generation_prompt: bool) -> &TemplateBinding {
        self.binding.get_or_init(|| {
            let mut next_id = self.inner.vocab_size() as u32;
            let mut special_tokens = BTreeMap::new();
            for token in template.special_tokens() {
                let id = self.inner.token_id(token).unwrap_or_else(|| {
                    let id = next_id;
                    next_id += 1;
                    id
                });
                special_tokens.insert((*token).to_string(), id);
            }
            TemplateBinding {
                template,
                add_generation_prompt,
                special_tokens,
                bos_token: template.bos_token().map(ToString::to_string),
                eos_token: template.eos_token().to_string(),
            }
        })
    }

    /// Vocabulary size including special tokens added by the binding.
    pub fn vocab_size(&self) -> usize {
        let base = self.inner.vocab_size();
        self.binding
            .get()
            .and_then(|b| b.special_tokens.values().max())
            .map_or(base, |max| base.max(*max as usize + 1))
    }

    /// Encode text, mapping the bound template's special tokens atomically.
    pub fn encode(&self, text: &str) -> Vec<u32> {
        let Some(binding) = self.binding.get() else {
            return self.inner.encode(text);
        };

        let mut specials: Vec<(&str, u32)> = binding.special_tokens.iter().map(|(t, id)| (t.as_str(), *id)).collect();
        specials.sort_by_key(|(t, _)| std::cmp::Reverse(t.len()));

        let mut ids = Vec::new();
        let mut plain_start = 0;
        let mut i = 0;
        while i < text.len() {
            let rest = &text[i..];
            if let Some((token, id)) = specials.iter().find(|(t, _)| rest.starts_with(t)) {
                if plain_start < i {
                    ids.extend(self.inner.encode(&text[plain_start..i]));
                }
                ids.push(*id);
                i += token.len();
                plain_start = i;
            } else {
                i += rest.chars().next().map_or(1, char::len_utf8);
            }
        }
        if plain_start < text.len() {
            ids.extend(self.inner.encode(&text[plain_start..]));
        }
        ids
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Tokenizer;

    /// Byte-per-token tokenizer used by unit tests.
    #[derive(Debug, Default)]
    pub struct BytesTokenizer;

    impl Tokenizer for BytesTokenizer {
        fn id(&self) -> &str {
            "test-bytes"
        }

        fn vocab_size(&self) -> usize {
            256
        }

        fn encode(&self, text: &str) -> Vec<u32> {
            text.bytes().map(u32::from).collect()
        }

        fn decode(&self, ids: &[u32]) -> String {
            let bytes: Vec<u8> = ids.iter().filter_map(|id| u8::try_from(*id).ok()).collect();
            String::from_utf8_lossy(&bytes).into_owned()
        }

        fn token_id(&self, _token: &str) -> Option<u32> {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::BytesTokenizer;
    use super::*;

    #[test]
    fn test_bind_assigns_special_ids_after_vocab() {
        let tokenizer = ChatTokenizer::new(Arc::new(BytesTokenizer));
        let binding = tokenizer.bind(ChatTemplate::ChatMl, false).clone();

        assert!(binding.special_tokens.values().all(|id| *id >= 256));
        assert_eq!(tokenizer.vocab_size(), 256 + ChatTemplate::ChatMl.special_tokens().len());
    }

    #[test]
    fn test_bind_is_first_writer_wins() {
        let tokenizer = ChatTokenizer::new(Arc::new(BytesTokenizer));
        tokenizer.bind(ChatTemplate::ChatMl, false);
        let second = tokenizer.bind(ChatTemplate::Llama31, false);
        assert_eq!(second.template, ChatTemplate::ChatMl);
    }

    #[test]
    fn test_encode_maps_special_tokens_atomically() {
        let tokenizer = ChatTokenizer::new(Arc::new(BytesTokenizer));
        let im_start = tokenizer.bind(ChatTemplate::ChatMl, false).special_tokens["<|im_start|>"];

        let ids = tokenizer.encode("<|im_start|>hi");
        assert_eq!(ids, vec![im_start, u32::from(b'h'), u32::from(b'i')]);
    }

    #[test]
    fn test_encode_without_binding_is_plain() {
        let tokenizer = ChatTokenizer::new(Arc::new(BytesTokenizer));
        assert_eq!(tokenizer.encode("<|"), vec![60, 124]);
    }
}
