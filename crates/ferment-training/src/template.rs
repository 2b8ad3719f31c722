//! Chat templates.
//!
//! A template renders a [`Conversation`] into a single text sequence made of
//! segments. Every segment knows the role it belongs to and whether it is part of
//! an assistant response, which is what lets the loss mask be recovered later.

use crate::dataset::{Conversation, Role};
use serde::{Deserialize, Serialize};
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChatTemplate {
    /// `<|start_header_id|>role<|end_header_id|>` headers closed by `<|eot_id|>`.
    Llama31,
    /// `<|im_start|>role` headers closed by `<|im_end|>`.
    ChatMl,
    /// ChatML with the empty reasoning block Qwen 3 emits before answers.
    Qwen3,
    /// `role: content` lines, for tokenizers without special tokens.
    Plain,
}

/// What part of a rendered message a segment is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Prefix,
    Header,
    Content,
    EndOfTurn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub role: Option<Role>,
    pub kind: SegmentKind,
    pub text: String,
}

impl Segment {
    /// Segments the model is trained to produce.
    pub fn is_trainable(&self) -> bool {
        self.role == Some(Role::Assistant) && matches!(self.kind, SegmentKind::Content | SegmentKind::EndOfTurn)
    }
}

/// Byte range of one message's body (content + end-of-turn marker) in the rendered text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSpan {
    pub role: Role,
    pub start: usize,
    pub end: usize,
}

impl RoleSpan {
    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConversation {
    pub segments: Vec<Segment>,
    pub text: String,
    pub spans: Vec<RoleSpan>,
}

impl RenderedConversation {
    pub fn assistant_spans(&self) -> impl Iterator<Item = &RoleSpan> {
        self.spans.iter().filter(|s| s.role == Role::Assistant)
    }
}

impl ChatTemplate {
    pub const NAMES: &'static [&'static str] = &["llama-3.1", "chatml", "qwen-3", "plain"];

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "llama-3.1" | "llama-3" | "llama3" => Some(Self::Llama31),
            "chatml" => Some(Self::ChatMl),
            "qwen-3" | "qwen3" | "qwen-2.5" | "qwen2.5" => Some(Self::Qwen3),
            "plain" => Some(Self::Plain),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Llama31 => "llama-3.1",
            Self::ChatMl => "chatml",
            Self::Qwen3 => "qwen-3",
            Self::Plain => "plain",
        }
    }

    /// Special tokens the tokenizer must treat atomically for this template.
    pub fn special_tokens(self) -> &'static [&'static str] {
        match self {
            Self::Llama31 => &["<|begin_of_text|>", "<|start_header_id|>", "<|end_header_id|>", "<|eot_id|>"],
            Self::ChatMl | Self::Qwen3 => &["<|im_start|>", "<|im_end|>", "<|endoftext|>"],
            Self::Plain => &[],
        }
    }

    pub fn bos_token(self) -> Option<&'static str> {
        match self {
            Self::Llama31 => Some("<|begin_of_text|>"),
            _ => None,
        }
    }

    pub fn eos_token(self) -> &'static str {
        match self {
            Self::Llama31 => "<|eot_id|>",
            Self::ChatMl | Self::Qwen3 => "<|im_end|>",
            Self::Plain => "\n",
        }
    }

    /// The text that opens a turn of `role`.
    pub fn header(self, role: Role) -> String {
        let role = role.as_str();
        match self {
            Self::Llama31 => format!("<|start_header_id|>{role}<|end_header_id|>\n\n"),
            Self::ChatMl => format!("<|im_start|>{role}\n"),
            Self::Qwen3 if role == "assistant" => format!("<|im_start|>{role}\n<think>\n\n</think>\n\n"),
            Self::Qwen3 => format!("<|im_start|>{role}\n"),
            Self::Plain => format!("{role}: "),
        }
    }

    fn end_of_turn(self) -> &'static str {
        match self {
            Self::Llama31 => "<|eot_id|>",
            Self::ChatMl | Self::Qwen3 => "<|im_end|>\n",
            Self::Plain => "\n",
        }
    }

    /// Render a conversation. Fails on an empty conversation or one with no content.
    pub fn render(self, conversation: &Conversation, add_generation_prompt: bool) -> Result<RenderedConversation, String> {
        if conversation.messages.is_empty() {
            return Err("conversation has no messages".to_string());
        }
        if conversation.messages.iter().all(|m| m.content.trim().is_empty()) {
            return Err("every message in the conversation is empty".to_string());
        }

        let mut segments = Vec::with_capacity(conversation.messages.len() * 3 + 2);
        if let Some(bos) = self.bos_token() {
            segments.push(Segment { role: None, kind: SegmentKind::Prefix, text: bos.to_string() });
        }
        for message in &conversation.messages {
            segments.push(Segment { role: Some(message.role), kind: SegmentKind::Header, text: self.header(message.role) });
            segments.push(Segment { role: Some(message.role), kind: SegmentKind::Content, text: message.content.clone() });
            segments.push(Segment {
                role: Some(message.role),
                kind: SegmentKind::EndOfTurn,
                text: self.end_of_turn().to_string(),
            });
        }
        if add_generation_prompt {
            segments.push(Segment { role: None, kind: SegmentKind::Header, text: self.header(Role::Assistant) });
        }

        Ok(assemble(segments))
    }
}

fn assemble(segments: Vec<Segment>) -> RenderedConversation {
    let mut text = String::new();
    let mut spans: Vec<RoleSpan> = Vec::new();

    for segment in &segments {
        let start = text.len();
        text.push_str(&segment.text);
        let end = text.len();

        let Some(role) = segment.role else { continue };
        match segment.kind {
            SegmentKind::Content => spans.push(RoleSpan { role, start, end }),
            SegmentKind::EndOfTurn => {
                if let Some(last) = spans.last_mut() {
                    last.end = end;
                }
            }
            SegmentKind::Prefix | SegmentKind::Header => {}
        }
    }

    RenderedConversation { segments, text, spans }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Message;

    fn convo() -> Conversation {
        Conversation {
            messages: vec![
                Message { role: Role::User, content: "Xin chào".to_string() },
                Message { role: Role::Assistant, content: "Chào bạn".to_string() },
            ],
        }
    }

    #[test]
    fn test_llama_render_keeps_turn_order_and_assistant_span() {
        let rendered = ChatTemplate::Llama31.render(&convo(), false).unwrap();

        assert!(rendered.text.starts_with("<|begin_of_text|>"));
        let user_at = rendered.text.find("Xin chào").unwrap();
        let assistant_at = rendered.text.find("Chào bạn").unwrap();
        assert!(user_at < assistant_at);

        let spans: Vec<_> = rendered.assistant_spans().collect();
        assert_eq!(spans.len(), 1);
        assert_eq!(&rendered.text[spans[0].range()], "Chào bạn<|eot_id|>");
    }

    #[test]
    fn test_render_is_deterministic() {
        for template in [ChatTemplate::Llama31, ChatTemplate::ChatMl, ChatTemplate::Qwen3, ChatTemplate::Plain] {
            assert_eq!(template.render(&convo(), false), template.render(&convo(), false));
        }
    }

    #[test]
    fn test_qwen_reasoning_block_is_not_trainable() {
        let rendered = ChatTemplate::Qwen3.render(&convo(), false).unwrap();
        let header = rendered
            .segments
            .iter()
            .find(|s| s.role == Some(Role::Assistant) && s.kind == SegmentKind::Header)
            .unwrap();
        assert!(header.text.contains("<think>"));
        assert!(!header.is_trainable());
    }

    #[test]
    fn test_generation_prompt_is_appended_untrained() {
        let rendered = ChatTemplate::ChatMl.render(&convo(), true).unwrap();
        assert!(rendered.text.ends_with("<|im_start|>assistant\n"));
        assert!(!rendered.segments.last().unwrap().is_trainable());
    }

    #[test]
    fn test_render_rejects_empty_conversation() {
        assert!(ChatTemplate::Plain.render(&Conversation { messages: vec![] }, false).is_err());

        let blank = Conversation { messages: vec![Message { role: Role::User, content: "  ".to_string() }] };
        assert!(ChatTemplate::Plain.render(&blank, false).is_err());
    }

    #[test]
    fn test_template_names_round_trip() {
        for name in ChatTemplate::NAMES {
            assert_eq!(ChatTemplate::from_name(name).unwrap().name(), *name);
        }
        assert!(ChatTemplate::from_name("zephyr").is_none());
    }
}
