use super::{Conversation, DatasetRecord, Message, Role};
use crate::error::{DatasetError, DatasetResult};
use serde_json::{Map, Value};

const INSTRUCTION_KEYS: &[&str] = &["instruction", "prompt", "question"];
const INPUT_KEYS: &[&str] = &["input", "context"];
const RESPONSE_KEYS: &[&str] = &["response", "output", "answer"];

/// Map a raw record onto the canonical message list.
///
/// Accepts either a list of `{role, content}` messages under `message_field`, or a
/// flat instruction/response pair (with optional `input` and `system`).
pub fn normalize(record: &DatasetRecord, message_field: &str) -> DatasetResult<Conversation> {
    let schema_error = |message: String| DatasetError::Schema { record: record.index, message };

    let Value::Object(object) = &record.value else {
        return Err(schema_error("record is not an object".to_string()));
    };

    if let Some(messages) = object.get(message_field) {
        return from_messages(messages, message_field).map_err(schema_error);
    }
    if let Some(conversation) = from_instruction(object).map_err(schema_error)? {
        return Ok(conversation);
    }

    Err(schema_error(format!(
        "expected `{message_field}` or an instruction/response pair, found keys [{}]",
        object.keys().cloned().collect::<Vec<_>>().join(", ")
    )))
}

fn from_messages(messages: &Value, field: &str) -> Result<Conversation, String> {
    let Value::Array(items) = messages else {
        return Err(format!("`{field}` must be a list"));
    };

    let mut out = Vec::with_capacity(items.len());
    for (pos, item) in items.iter().enumerate() {
        let role = item
            .get("role")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("{field}[{pos}] has no string `role`"))?;
        let role = Role::parse(role).ok_or_else(|| format!("{field}[{pos}] has unknown role `{role}`"))?;
        let content = content_text(item.get("content")).ok_or_else(|| format!("{field}[{pos}] has invalid `content`"))?;
        out.push(Message { role, content });
    }

    Ok(Conversation { messages: out })
}

/// Message content as plain text: a string, `null`, or a list of text parts.
fn content_text(content: Option<&Value>) -> Option<String> {
    match content {
        None | Some(Value::Null) => Some(String::new()),
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Array(parts)) => parts
            .iter()
            .map(|part| match part {
                Value::String(s) => Some(s.as_str()),
                Value::Object(o) => o.get("text").and_then(Value::as_str),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()
            .map(|parts| parts.concat()),
        Some(_) => None,
    }
}

fn first_string<'a>(object: &'a Map<String, Value>, keys: &[&str]) -> Result<Option<&'a str>, String> {
    for key in keys {
        match object.get(*key) {
            None | Some(Value::Null) => {}
            Some(Value::String(s)) => return Ok(Some(s.as_str())),
            Some(_) => return Err(format!("`{key}` must be a string")),
        }
    }
    Ok(None)
}

fn from_instruction(object: &Map<String, Value>) -> Result<Option<Conversation>, String> {
    let instruction = first_string(object, INSTRUCTION_KEYS)?;
    let response = first_string(object, RESPONSE_KEYS)?;

    let (instruction, response) = match (instruction, response) {
        (Some(i), Some(r)) => (i, r),
        (None, None) => return Ok(None),
        (Some(_), None) => return Err(format!("instruction without a response (one of {})", RESPONSE_KEYS.join(", "))),
        (None, Some(_)) => return Err(format!("response without an instruction (one of {})", INSTRUCTION_KEYS.join(", "))),
    };

    let mut messages = Vec::with_capacity(3);
    if let Some(system) = first_string(object, &["system"])? {
        messages.push(Message { role: Role::System, content: system.to_string() });
    }

    let user = match first_string(object, INPUT_KEYS)? {
        Some(input) if !input.trim().is_empty() => format!("{instruction}\n\n{input}"),
        _ => instruction.to_string(),
    };
    messages.push(Message { role: Role::User, content: user });
    messages.push(Message { role: Role::Assistant, content: response.to_string() });

    Ok(Some(Conversation { messages }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> DatasetRecord {
        DatasetRecord { index: 7, value }
    }

    #[test]
    fn test_messages_and_pairs_normalize_to_same_shape() {
        let from_messages = normalize(
            &record(json!({"messages": [
                {"role": "user", "content": "Xin chào"},
                {"role": "assistant", "content": "Chào bạn"}
            ]})),
            "messages",
        )
        .unwrap();
        let from_pair = normalize(&record(json!({"instruction": "Xin chào", "response": "Chào bạn"})), "messages").unwrap();

        assert_eq!(from_messages, from_pair);
    }

    #[test]
    fn test_pair_with_input_and_system() {
        let convo = normalize(
            &record(json!({"system": "Be brief", "prompt": "Translate", "input": "hello", "output": "xin chào"})),
            "messages",
        )
        .unwrap();

        assert_eq!(convo.messages.len(), 3);
        assert_eq!(convo.messages[0].role, Role::System);
        assert_eq!(convo.messages[1].content, "Translate\n\nhello");
    }

    #[test]
    fn test_custom_message_field_and_content_parts() {
        let convo = normalize(
            &record(json!({"conversation": [
                {"role": "user", "content": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}]},
                {"role": "assistant", "content": null}
            ]})),
            "conversation",
        )
        .unwrap();

        assert_eq!(convo.messages[0].content, "ab");
        assert_eq!(convo.messages[1].content, "");
    }

    #[test]
    fn test_schema_errors_carry_record_index() {
        let cases = [
            json!("just text"),
            json!({"title": "no usable fields"}),
            json!({"messages": "not a list"}),
            json!({"messages": [{"role": "narrator", "content": "x"}]}),
            json!({"instruction": "only half"}),
            json!({"instruction": 3, "response": "x"}),
        ];

        for value in cases {
            let err = normalize(&record(value.clone()), "messages").unwrap_err();
            assert_eq!(err.record(), Some(7), "{value}");
        }
    }
}
