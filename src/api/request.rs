//! Decoding and field validation for the chat stream endpoint.

use std::fmt::Write as _;

use serde::Deserialize;

use crate::error::RequestError;
use crate::protocol::chat::{ChatMessage, CompletionRequest, Role};

/// Wire shape of the inbound body. Required fields decode as absent so that
/// validation, not decoding, reports them.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct WireRequest {
    #[serde(default)]
    messages: Option<Vec<WireMessage>>,
    #[serde(default)]
    stream: bool,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct WireMessage {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

/// Decode and validate a request body.
///
/// The returned request keeps the caller's `stream` flag; forcing streaming
/// mode is the relay's job.
///
/// # Errors
///
/// [`RequestError::InvalidJson`] for undecodable bodies, unknown fields or
/// trailing data; [`RequestError::Validation`] when field rules fail.
pub fn decode_chat_request(body: &[u8]) -> Result<CompletionRequest, RequestError> {
    let mut de = serde_json::Deserializer::from_slice(body);
    let wire = WireRequest::deserialize(&mut de)
        .map_err(|err| RequestError::InvalidJson(err.to_string()))?;
    de.end().map_err(|_| {
        RequestError::InvalidJson("Request body must contain a single JSON object.".to_string())
    })?;
    validate(wire)
}

fn validate(wire: WireRequest) -> Result<CompletionRequest, RequestError> {
    let wire_messages = wire.messages.unwrap_or_default();
    if wire_messages.is_empty() {
        return Err(RequestError::Validation(
            "messages: messages is required and must be a non-empty array.\n".to_string(),
        ));
    }

    let mut details = String::new();
    let mut messages = Vec::with_capacity(wire_messages.len());
    for (index, message) in wire_messages.into_iter().enumerate() {
        let content = message.content.unwrap_or_default();
        if content.trim().is_empty() {
            let _ = writeln!(details, "messages[{index}].content: content is required.");
        }
        let role = message.role.as_deref().and_then(Role::from_wire);
        if role.is_none() {
            let _ = writeln!(
                details,
                "messages[{index}].role: role must specify one of 'user', 'assistant', or 'system'."
            );
        }
        if let Some(role) = role {
            messages.push(ChatMessage { role, content });
        }
    }

    if !details.is_empty() {
        return Err(RequestError::Validation(details));
    }
    Ok(CompletionRequest {
        messages,
        stream: wire.stream,
    })
}
