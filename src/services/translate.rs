//! Pure translation between the OpenAI chat schema and the Gemini native
//! schema: requests, buffered responses, and streaming chunks.

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use crate::config::Config;
use crate::error::GatewayError;
use crate::models::gemini::{
    Content, FunctionCall, FunctionCallingConfig, FunctionDeclaration, FunctionResponse,
    GenerateContentRequest, GenerateContentResponse, GenerationConfig, Part, Tool, ToolConfig,
};
use crate::models::openai::{
    self, AssistantMessage, ChatCompletion, ChatCompletionChunk, ChatCompletionRequest,
    ChatMessage, Choice, ChunkChoice, Delta, FunctionCallDelta, MessageContent, Role,
    StopSequences, ToolCallDelta, ToolChoice, ToolChoiceMode, Usage,
};

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn completion_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4().simple())
}

fn call_id() -> String {
    format!("call_{}", Uuid::new_v4().simple())
}

/// Resolve a requested model name to an upstream model: mapped OpenAI-style
/// names use the table, native names pass through, anything else falls back
/// to the configured default.
pub fn resolve_model(config: &Config, requested: &str) -> String {
    if let Some(mapped) = config.model_mapping.get(requested) {
        return mapped.clone();
    }
    if requested.starts_with("gemini") {
        return requested.to_string();
    }
    config.default_upstream_model.clone()
}

// ── OpenAI request → native request ───────────────────────────────────

fn plain_text(content: &Option<MessageContent>) -> Option<String> {
    match content {
        Some(MessageContent::Text(text)) => Some(text.clone()),
        Some(MessageContent::Parts(parts)) => {
            let joined: Vec<&str> = parts
                .iter()
                .filter(|p| p.kind == "text")
                .filter_map(|p| p.text.as_deref())
                .collect();
            if joined.is_empty() {
                None
            } else {
                Some(joined.join(""))
            }
        }
        None => None,
    }
}

/// Tool-call arguments arrive as a JSON-encoded string. Invalid payloads are
/// forwarded as a plain string value rather than dropped.
fn parse_arguments(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => value,
        Err(e) => {
            warn!("tool call arguments are not valid JSON, passing through as string: {e}");
            Value::String(raw.to_string())
        }
    }
}

fn tool_result_value(content: &Option<MessageContent>) -> Value {
    let text = plain_text(content).unwrap_or_default();
    match serde_json::from_str::<Value>(&text) {
        Ok(value @ Value::Object(_)) => value,
        _ => json!({ "content": text }),
    }
}

fn message_parts(msg: &ChatMessage) -> Vec<Part> {
    let mut parts = Vec::new();

    match &msg.content {
        Some(MessageContent::Text(text)) if !text.is_empty() => {
            parts.push(Part::Text { text: text.clone() });
        }
        Some(MessageContent::Parts(content_parts)) => {
            for part in content_parts {
                if part.kind == "text" {
                    if let Some(text) = &part.text {
                        if !text.is_empty() {
                            parts.push(Part::Text { text: text.clone() });
                        }
                    }
                }
            }
        }
        _ => {}
    }

    if msg.role == Role::Assistant {
        for call in msg.tool_calls.iter().flatten() {
            parts.push(Part::FunctionCall {
                function_call: FunctionCall {
                    name: call.function.name.clone(),
                    args: parse_arguments(&call.function.arguments),
                },
            });
        }
    }

    if msg.role == Role::Tool {
        parts.push(Part::FunctionResponse {
            function_response: FunctionResponse {
                name: msg
                    .name
                    .clone()
                    .unwrap_or_else(|| "unknown_function".to_string()),
                response: tool_result_value(&msg.content),
            },
        });
    }

    parts
}

/// Recursively convert an OpenAI JSON Schema into the Gemini variant:
/// type names are uppercased, description/enum/required carried over,
/// properties and items recursed. Unknown types collapse to an empty schema.
pub fn convert_tool_schema(schema: &Value) -> Value {
    let Some(obj) = schema.as_object() else {
        return json!({});
    };

    let kind = obj.get("type").and_then(|t| t.as_str()).unwrap_or("");
    let mapped = match kind {
        "string" => "STRING",
        "number" => "NUMBER",
        "integer" => "INTEGER",
        "boolean" => "BOOLEAN",
        "object" => "OBJECT",
        "array" => "ARRAY",
        other => {
            warn!("unsupported schema type \"{other}\" in tool parameters");
            return json!({});
        }
    };

    let mut out = serde_json::Map::new();
    out.insert("type".to_string(), Value::String(mapped.to_string()));
    for key in ["description", "enum"] {
        if let Some(value) = obj.get(key) {
            out.insert(key.to_string(), value.clone());
        }
    }

    if mapped == "OBJECT" {
        if let Some(props) = obj.get("properties").and_then(|p| p.as_object()) {
            let converted: serde_json::Map<String, Value> = props
                .iter()
                .map(|(name, sub)| (name.clone(), convert_tool_schema(sub)))
                .collect();
            out.insert("properties".to_string(), Value::Object(converted));
        }
        if let Some(required) = obj.get("required") {
            out.insert("required".to_string(), required.clone());
        }
    }

    if mapped == "ARRAY" {
        if let Some(items) = obj.get("items") {
            out.insert("items".to_string(), convert_tool_schema(items));
        }
    }

    Value::Object(out)
}

fn convert_tools(tools: &[openai::ToolDef]) -> Option<Vec<Tool>> {
    let declarations: Vec<FunctionDeclaration> = tools
        .iter()
        .filter(|t| t.kind == "function")
        .filter(|t| {
            if t.function.name.is_empty() {
                warn!("skipping tool definition without a name");
                false
            } else {
                true
            }
        })
        .map(|t| FunctionDeclaration {
            name: t.function.name.clone(),
            description: t.function.description.clone(),
            parameters: Some(
                t.function
                    .parameters
                    .as_ref()
                    .map(convert_tool_schema)
                    .unwrap_or_else(|| json!({ "type": "OBJECT", "properties": {} })),
            ),
        })
        .collect();

    if declarations.is_empty() {
        None
    } else {
        Some(vec![Tool {
            function_declarations: Some(declarations),
        }])
    }
}

fn convert_tool_choice(choice: &ToolChoice) -> ToolConfig {
    let config = match choice {
        ToolChoice::Mode(ToolChoiceMode::Auto) => FunctionCallingConfig {
            mode: "AUTO".to_string(),
            allowed_function_names: None,
        },
        ToolChoice::Mode(ToolChoiceMode::None) => FunctionCallingConfig {
            mode: "NONE".to_string(),
            allowed_function_names: None,
        },
        ToolChoice::Mode(ToolChoiceMode::Required) => FunctionCallingConfig {
            mode: "ANY".to_string(),
            allowed_function_names: None,
        },
        ToolChoice::Named(named) => FunctionCallingConfig {
            mode: "ANY".to_string(),
            allowed_function_names: Some(vec![named.function.name.clone()]),
        },
    };
    ToolConfig {
        function_calling_config: config,
    }
}

fn convert_generation(req: &ChatCompletionRequest) -> Option<GenerationConfig> {
    let config = GenerationConfig {
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: req.top_k,
        candidate_count: None,
        max_output_tokens: req.max_tokens,
        stop_sequences: req.stop.as_ref().map(|stop| match stop {
            StopSequences::One(s) => vec![s.clone()],
            StopSequences::Many(list) => list.clone(),
        }),
        response_mime_type: req
            .response_format
            .as_ref()
            .filter(|f| f.kind == "json_object")
            .map(|_| "application/json".to_string()),
    };
    if config.is_empty() {
        None
    } else {
        Some(config)
    }
}

/// Fold an OpenAI chat request into a native `generateContent` request.
///
/// System messages are lifted into `systemInstruction`, assistant messages
/// map to role `model`, user and tool messages to role `user`, and runs of
/// the same role merge into a single content entry, parts in order.
pub fn openai_to_native(
    req: &ChatCompletionRequest,
) -> Result<GenerateContentRequest, GatewayError> {
    let mut system_texts: Vec<String> = Vec::new();
    let mut contents: Vec<Content> = Vec::new();

    for msg in &req.messages {
        if msg.role == Role::System {
            if let Some(text) = plain_text(&msg.content) {
                system_texts.push(text);
            }
            continue;
        }

        let role = match msg.role {
            Role::Assistant => "model",
            _ => "user",
        };
        let parts = message_parts(msg);
        if parts.is_empty() {
            continue;
        }

        match contents.last_mut() {
            Some(last) if last.role.as_deref() == Some(role) => last.parts.extend(parts),
            _ => contents.push(Content {
                role: Some(role.to_string()),
                parts,
            }),
        }
    }

    if contents.is_empty() {
        return Err(GatewayError::Validation(
            "messages must contain at least one non-system message with content".to_string(),
        ));
    }

    Ok(GenerateContentRequest {
        contents,
        system_instruction: if system_texts.is_empty() {
            None
        } else {
            Some(Content {
                role: None,
                parts: vec![Part::Text {
                    text: system_texts.join("\n"),
                }],
            })
        },
        tools: req.tools.as_deref().and_then(convert_tools),
        tool_config: req.tool_choice.as_ref().map(convert_tool_choice),
        generation_config: convert_generation(req),
        safety_settings: None,
    })
}

// ── Native response → OpenAI response ─────────────────────────────────

fn map_finish_reason(reason: Option<&str>) -> &'static str {
    let Some(reason) = reason else { return "stop" };
    let upper = reason.to_uppercase();
    if upper.contains("MAX_TOKENS") {
        "length"
    } else if upper.contains("SAFETY")
        || upper.contains("RECITATION")
        || upper.contains("BLOCKLIST")
    {
        "content_filter"
    } else {
        "stop"
    }
}

pub fn native_to_openai(resp: &GenerateContentResponse, model: &str) -> ChatCompletion {
    let mut choices: Vec<Choice> = Vec::new();

    for (index, candidate) in resp.candidates.iter().enumerate() {
        let mut text = String::new();
        let mut tool_calls: Vec<openai::ToolCall> = Vec::new();

        if let Some(content) = &candidate.content {
            for part in &content.parts {
                match part {
                    Part::Text { text: t } => text.push_str(t),
                    Part::FunctionCall { function_call } => tool_calls.push(openai::ToolCall {
                        id: call_id(),
                        kind: "function".to_string(),
                        function: openai::FunctionCall {
                            name: function_call.name.clone(),
                            arguments: function_call.args.to_string(),
                        },
                    }),
                    Part::FunctionResponse { .. } | Part::Other(_) => {}
                }
            }
        }

        // A function call always wins the finish reason.
        let finish_reason = if tool_calls.is_empty() {
            map_finish_reason(candidate.finish_reason.as_deref())
        } else {
            "tool_calls"
        };

        choices.push(Choice {
            index: index as u32,
            message: AssistantMessage {
                role: "assistant".to_string(),
                content: if text.is_empty() { None } else { Some(text) },
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
            },
            finish_reason: finish_reason.to_string(),
        });
    }

    if choices.is_empty() {
        // Blocked prompts come back with no candidates; surface as a normal
        // completion flagged as filtered.
        let blocked = resp
            .prompt_feedback
            .as_ref()
            .and_then(|f| f.block_reason.as_deref())
            .is_some();
        choices.push(Choice {
            index: 0,
            message: AssistantMessage {
                role: "assistant".to_string(),
                content: None,
                tool_calls: None,
            },
            finish_reason: if blocked { "content_filter" } else { "stop" }.to_string(),
        });
    }

    let usage = resp
        .usage_metadata
        .map(|u| Usage {
            prompt_tokens: u.prompt_token_count,
            completion_tokens: u.candidates_token_count,
            total_tokens: u.prompt_token_count + u.candidates_token_count,
        })
        .unwrap_or_default();

    ChatCompletion {
        id: completion_id(),
        object: "chat.completion".to_string(),
        created: unix_now(),
        model: model.to_string(),
        choices,
        usage,
    }
}

// ── Streaming ─────────────────────────────────────────────────────────

/// Per-stream translation state. Emits the assistant role marker exactly
/// once, then content and tool-call deltas, then a single finish chunk.
pub struct StreamTranslator {
    id: String,
    created: u64,
    model: String,
    role_sent: bool,
    tool_call_count: u32,
    finished: bool,
}

impl StreamTranslator {
    pub fn new(model: &str) -> Self {
        Self {
            id: completion_id(),
            created: unix_now(),
            model: model.to_string(),
            role_sent: false,
            tool_call_count: 0,
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn chunk(&self, delta: Delta, finish_reason: Option<String>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }

    pub fn on_chunk(&mut self, native: &GenerateContentResponse) -> Vec<ChatCompletionChunk> {
        let mut out = Vec::new();
        let Some(candidate) = native.candidates.first() else {
            return out;
        };

        if !self.role_sent {
            self.role_sent = true;
            out.push(self.chunk(
                Delta {
                    role: Some("assistant".to_string()),
                    ..Delta::default()
                },
                None,
            ));
        }

        let mut delta = Delta::default();
        let mut tool_deltas: Vec<ToolCallDelta> = Vec::new();

        if let Some(content) = &candidate.content {
            for part in &content.parts {
                match part {
                    Part::Text { text } => {
                        let buffer = delta.content.get_or_insert_with(String::new);
                        buffer.push_str(text);
                    }
                    Part::FunctionCall { function_call } => {
                        // Gemini delivers each call's arguments whole, so one
                        // fragment per index concatenates to valid JSON.
                        let index = self.tool_call_count;
                        self.tool_call_count += 1;
                        tool_deltas.push(ToolCallDelta {
                            index,
                            id: Some(call_id()),
                            kind: Some("function".to_string()),
                            function: FunctionCallDelta {
                                name: Some(function_call.name.clone()),
                                arguments: Some(function_call.args.to_string()),
                            },
                        });
                    }
                    Part::FunctionResponse { .. } | Part::Other(_) => {}
                }
            }
        }

        if !tool_deltas.is_empty() {
            delta.tool_calls = Some(tool_deltas);
        }
        if !delta.is_empty() {
            out.push(self.chunk(delta, None));
        }

        if let Some(reason) = candidate
            .finish_reason
            .as_deref()
            .filter(|r| *r != "FINISH_REASON_UNSPECIFIED")
        {
            let mapped = if self.tool_call_count > 0 {
                "tool_calls"
            } else {
                map_finish_reason(Some(reason))
            };
            out.push(self.chunk(Delta::default(), Some(mapped.to_string())));
            self.finished = true;
        }

        out
    }

    /// Fallback finish chunk for upstreams that close without a finish reason.
    pub fn finish(&mut self) -> Option<ChatCompletionChunk> {
        if self.finished {
            return None;
        }
        self.finished = true;
        let reason = if self.tool_call_count > 0 {
            "tool_calls"
        } else {
            "stop"
        };
        Some(self.chunk(Delta::default(), Some(reason.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::openai::{ContentPart, FunctionDef, NamedToolChoice, ToolDef};

    fn user_msg(text: &str) -> ChatMessage {
        ChatMessage {
            role: Role::User,
            content: Some(MessageContent::Text(text.to_string())),
            name: None,
            tool_call_id: None,
            tool_calls: None,
        }
    }

    fn request(messages: Vec<ChatMessage>) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "gpt-3.5-turbo".to_string(),
            messages,
            max_tokens: None,
            stream: false,
            temperature: None,
            top_p: None,
            top_k: None,
            stop: None,
            response_format: None,
            tools: None,
            tool_choice: None,
        }
    }

    fn text_of(part: &Part) -> &str {
        match part {
            Part::Text { text } => text,
            other => panic!("expected text part, got {other:?}"),
        }
    }

    #[test]
    fn system_messages_become_system_instruction() {
        let mut messages = vec![user_msg("hi")];
        messages.insert(
            0,
            ChatMessage {
                role: Role::System,
                content: Some(MessageContent::Text("first rule".into())),
                name: None,
                tool_call_id: None,
                tool_calls: None,
            },
        );
        messages.push(ChatMessage {
            role: Role::System,
            content: Some(MessageContent::Text("second rule".into())),
            name: None,
            tool_call_id: None,
            tool_calls: None,
        });

        let native = openai_to_native(&request(messages)).unwrap();
        let system = native.system_instruction.unwrap();
        assert_eq!(text_of(&system.parts[0]), "first rule\nsecond rule");
        assert_eq!(native.contents.len(), 1);
        assert_eq!(native.contents[0].role.as_deref(), Some("user"));
    }

    #[test]
    fn consecutive_same_role_messages_merge() {
        let messages = vec![
            user_msg("one"),
            user_msg("two"),
            ChatMessage {
                role: Role::Assistant,
                content: Some(MessageContent::Text("reply".into())),
                name: None,
                tool_call_id: None,
                tool_calls: None,
            },
            user_msg("three"),
        ];

        let native = openai_to_native(&request(messages)).unwrap();
        assert_eq!(native.contents.len(), 3);
        assert_eq!(native.contents[0].parts.len(), 2);
        assert_eq!(text_of(&native.contents[0].parts[0]), "one");
        assert_eq!(text_of(&native.contents[0].parts[1]), "two");
        assert_eq!(native.contents[1].role.as_deref(), Some("model"));
    }

    #[test]
    fn array_content_keeps_text_parts_only() {
        let messages = vec![ChatMessage {
            role: Role::User,
            content: Some(MessageContent::Parts(vec![
                ContentPart {
                    kind: "text".into(),
                    text: Some("hello".into()),
                },
                ContentPart {
                    kind: "image_url".into(),
                    text: None,
                },
            ])),
            name: None,
            tool_call_id: None,
            tool_calls: None,
        }];

        let native = openai_to_native(&request(messages)).unwrap();
        assert_eq!(native.contents[0].parts.len(), 1);
        assert_eq!(text_of(&native.contents[0].parts[0]), "hello");
    }

    #[test]
    fn assistant_tool_calls_become_function_call_parts() {
        let messages = vec![
            user_msg("weather?"),
            ChatMessage {
                role: Role::Assistant,
                content: None,
                name: None,
                tool_call_id: None,
                tool_calls: Some(vec![openai::ToolCall {
                    id: "call_1".into(),
                    kind: "function".into(),
                    function: openai::FunctionCall {
                        name: "get_weather".into(),
                        arguments: "{\"city\":\"SF\"}".into(),
                    },
                }]),
            },
        ];

        let native = openai_to_native(&request(messages)).unwrap();
        match &native.contents[1].parts[0] {
            Part::FunctionCall { function_call } => {
                assert_eq!(function_call.name, "get_weather");
                assert_eq!(function_call.args, json!({"city": "SF"}));
            }
            other => panic!("expected function call part, got {other:?}"),
        }
    }

    #[test]
    fn invalid_tool_call_arguments_pass_through_as_string() {
        let messages = vec![ChatMessage {
            role: Role::Assistant,
            content: None,
            name: None,
            tool_call_id: None,
            tool_calls: Some(vec![openai::ToolCall {
                id: "call_1".into(),
                kind: "function".into(),
                function: openai::FunctionCall {
                    name: "broken".into(),
                    arguments: "{not json".into(),
                },
            }]),
        }];

        let native = openai_to_native(&request(messages)).unwrap();
        match &native.contents[0].parts[0] {
            Part::FunctionCall { function_call } => {
                assert_eq!(function_call.args, Value::String("{not json".into()));
            }
            other => panic!("expected function call part, got {other:?}"),
        }
    }

    #[test]
    fn tool_messages_become_function_responses_with_user_role() {
        let messages = vec![
            user_msg("go"),
            ChatMessage {
                role: Role::Tool,
                content: Some(MessageContent::Text("{\"temp\": 18}".into())),
                name: Some("get_weather".into()),
                tool_call_id: Some("call_1".into()),
                tool_calls: None,
            },
        ];

        let native = openai_to_native(&request(messages)).unwrap();
        // user text and tool result fold into one user content entry
        assert_eq!(native.contents.len(), 1);
        match &native.contents[0].parts[1] {
            Part::FunctionResponse { function_response } => {
                assert_eq!(function_response.name, "get_weather");
                assert_eq!(function_response.response, json!({"temp": 18}));
            }
            other => panic!("expected function response part, got {other:?}"),
        }
    }

    #[test]
    fn non_json_tool_results_are_wrapped() {
        let messages = vec![ChatMessage {
            role: Role::Tool,
            content: Some(MessageContent::Text("sunny".into())),
            name: Some("get_weather".into()),
            tool_call_id: None,
            tool_calls: None,
        }];

        let native = openai_to_native(&request(messages)).unwrap();
        match &native.contents[0].parts[0] {
            Part::FunctionResponse { function_response } => {
                assert_eq!(function_response.response, json!({"content": "sunny"}));
            }
            other => panic!("expected function response part, got {other:?}"),
        }
    }

    #[test]
    fn tool_choice_mapping_table() {
        let mode = |m: ToolChoiceMode| {
            convert_tool_choice(&ToolChoice::Mode(m)).function_calling_config
        };
        assert_eq!(mode(ToolChoiceMode::Auto).mode, "AUTO");
        assert_eq!(mode(ToolChoiceMode::None).mode, "NONE");
        assert_eq!(mode(ToolChoiceMode::Required).mode, "ANY");

        let named = convert_tool_choice(&ToolChoice::Named(NamedToolChoice {
            kind: "function".into(),
            function: openai::FunctionName {
                name: "get_weather".into(),
            },
        }))
        .function_calling_config;
        assert_eq!(named.mode, "ANY");
        assert_eq!(named.allowed_function_names.unwrap(), vec!["get_weather"]);
    }

    #[test]
    fn generation_parameters_map_field_for_field() {
        let mut req = request(vec![user_msg("hi")]);
        req.temperature = Some(0.2);
        req.top_p = Some(0.9);
        req.top_k = Some(40);
        req.max_tokens = Some(128);
        req.stop = Some(StopSequences::One("END".into()));
        req.response_format = Some(openai::ResponseFormat {
            kind: "json_object".into(),
        });

        let native = openai_to_native(&req).unwrap();
        let config = native.generation_config.unwrap();
        assert_eq!(config.temperature, Some(0.2));
        assert_eq!(config.top_p, Some(0.9));
        assert_eq!(config.top_k, Some(40));
        assert_eq!(config.max_output_tokens, Some(128));
        assert_eq!(config.stop_sequences.unwrap(), vec!["END"]);
        assert_eq!(config.response_mime_type.as_deref(), Some("application/json"));
    }

    #[test]
    fn schema_conversion_uppercases_types_recursively() {
        let schema = json!({
            "type": "object",
            "properties": {
                "city": { "type": "string", "description": "city name" },
                "days": { "type": "array", "items": { "type": "integer" } }
            },
            "required": ["city"]
        });

        let converted = convert_tool_schema(&schema);
        assert_eq!(converted["type"], "OBJECT");
        assert_eq!(converted["properties"]["city"]["type"], "STRING");
        assert_eq!(converted["properties"]["city"]["description"], "city name");
        assert_eq!(converted["properties"]["days"]["items"]["type"], "INTEGER");
        assert_eq!(converted["required"], json!(["city"]));
    }

    #[test]
    fn tools_without_names_are_skipped() {
        let mut req = request(vec![user_msg("hi")]);
        req.tools = Some(vec![ToolDef {
            kind: "function".into(),
            function: FunctionDef {
                name: String::new(),
                description: None,
                parameters: None,
            },
        }]);

        let native = openai_to_native(&req).unwrap();
        assert!(native.tools.is_none());
    }

    #[test]
    fn model_resolution_uses_table_then_passthrough_then_default() {
        let mut config = test_config();
        config
            .model_mapping
            .insert("gpt-4o".into(), "gemini-1.5-pro-latest".into());

        assert_eq!(resolve_model(&config, "gpt-4o"), "gemini-1.5-pro-latest");
        assert_eq!(resolve_model(&config, "gemini-exp-1206"), "gemini-exp-1206");
        assert_eq!(
            resolve_model(&config, "some-unknown-model"),
            config.default_upstream_model
        );
    }

    fn test_config() -> Config {
        Config {
            listen_addr: String::new(),
            cors_origin: "*".into(),
            gemini_api_keys: vec!["k".into()],
            client_api_keys: vec![],
            admin_api_keys: vec![],
            upstream_base_url: String::new(),
            outbound_proxy_url: None,
            max_attempts: 3,
            per_attempt_timeout: std::time::Duration::from_secs(45),
            overall_deadline: std::time::Duration::from_secs(120),
            max_failures_before_cool: 3,
            cooling_auth: std::time::Duration::from_secs(3600),
            cooling_quota: std::time::Duration::from_secs(300),
            cooling_transient: std::time::Duration::from_secs(30),
            cache_enabled: true,
            cache_max_size: 16,
            cache_ttl: std::time::Duration::from_secs(300),
            default_upstream_model: "gemini-1.5-pro-latest".into(),
            model_mapping: std::collections::HashMap::new(),
        }
    }

    fn native_text_response(text: &str, finish: &str) -> GenerateContentResponse {
        serde_json::from_value(json!({
            "candidates": [{
                "content": { "role": "model", "parts": [{ "text": text }] },
                "finishReason": finish,
                "index": 0
            }],
            "usageMetadata": {
                "promptTokenCount": 7,
                "candidatesTokenCount": 5,
                "totalTokenCount": 12
            }
        }))
        .unwrap()
    }

    #[test]
    fn native_response_maps_to_completion() {
        let completion = native_to_openai(&native_text_response("hello there", "STOP"), "gpt-4o");

        assert!(completion.id.starts_with("chatcmpl-"));
        assert_eq!(completion.model, "gpt-4o");
        assert_eq!(completion.choices.len(), 1);
        assert_eq!(
            completion.choices[0].message.content.as_deref(),
            Some("hello there")
        );
        assert_eq!(completion.choices[0].finish_reason, "stop");
        assert_eq!(completion.usage.prompt_tokens, 7);
        assert_eq!(completion.usage.completion_tokens, 5);
        assert_eq!(completion.usage.total_tokens, 12);
    }

    #[test]
    fn finish_reason_mapping() {
        assert_eq!(map_finish_reason(Some("STOP")), "stop");
        assert_eq!(map_finish_reason(Some("MAX_TOKENS")), "length");
        assert_eq!(map_finish_reason(Some("SAFETY")), "content_filter");
        assert_eq!(map_finish_reason(Some("RECITATION")), "content_filter");
        assert_eq!(map_finish_reason(Some("BLOCKLIST")), "content_filter");
        assert_eq!(map_finish_reason(Some("OTHER")), "stop");
        assert_eq!(map_finish_reason(None), "stop");
    }

    #[test]
    fn function_call_overrides_finish_reason() {
        let native: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [{ "functionCall": { "name": "get_weather", "args": {"city": "SF"} } }]
                },
                "finishReason": "STOP"
            }]
        }))
        .unwrap();

        let completion = native_to_openai(&native, "gpt-4o");
        let choice = &completion.choices[0];
        assert_eq!(choice.finish_reason, "tool_calls");
        let calls = choice.message.tool_calls.as_ref().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(!calls[0].id.is_empty());
        assert_eq!(calls[0].kind, "function");
        assert_eq!(calls[0].function.name, "get_weather");
        assert_eq!(calls[0].function.arguments, "{\"city\":\"SF\"}");
    }

    #[test]
    fn blocked_prompt_becomes_content_filter_completion() {
        let native: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [],
            "promptFeedback": { "blockReason": "SAFETY" }
        }))
        .unwrap();

        let completion = native_to_openai(&native, "gpt-4o");
        assert_eq!(completion.choices[0].finish_reason, "content_filter");
        assert!(completion.choices[0].message.content.is_none());
    }

    #[test]
    fn missing_usage_defaults_to_zero() {
        let native: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": { "role": "model", "parts": [{ "text": "ok" }] },
                "finishReason": "STOP"
            }]
        }))
        .unwrap();

        let completion = native_to_openai(&native, "gpt-4o");
        assert_eq!(completion.usage, Usage::default());
    }

    #[test]
    fn round_trip_preserves_text_content() {
        let req = request(vec![user_msg("echo this")]);
        let native_req = openai_to_native(&req).unwrap();
        assert_eq!(text_of(&native_req.contents[0].parts[0]), "echo this");

        // Simulate the upstream echoing the text back.
        let completion = native_to_openai(&native_text_response("echo this", "STOP"), &req.model);
        assert_eq!(
            completion.choices[0].message.content.as_deref(),
            Some("echo this")
        );
    }

    #[test]
    fn stream_emits_role_first_then_content_then_finish() {
        let mut translator = StreamTranslator::new("gpt-4o");

        let first = translator.on_chunk(&native_chunk(json!([{ "text": "Hel" }]), None));
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].choices[0].delta.role.as_deref(), Some("assistant"));
        assert!(first[0].choices[0].delta.content.is_none());
        assert_eq!(first[1].choices[0].delta.content.as_deref(), Some("Hel"));

        let middle = translator.on_chunk(&native_chunk(json!([{ "text": "lo" }]), None));
        assert_eq!(middle.len(), 1);
        assert_eq!(middle[0].choices[0].delta.content.as_deref(), Some("lo"));

        let last = translator.on_chunk(&native_chunk(json!([{ "text": "!" }]), Some("STOP")));
        assert_eq!(last.len(), 2);
        assert_eq!(last[0].choices[0].delta.content.as_deref(), Some("!"));
        assert!(last[1].choices[0].delta.is_empty());
        assert_eq!(last[1].choices[0].finish_reason.as_deref(), Some("stop"));

        assert!(translator.is_finished());
        assert!(translator.finish().is_none());
    }

    #[test]
    fn stream_concatenation_matches_buffered_content() {
        let mut translator = StreamTranslator::new("gpt-4o");
        let fragments = ["The ", "quick ", "brown ", "fox"];
        let mut collected = String::new();

        for (i, frag) in fragments.iter().enumerate() {
            let finish = (i == fragments.len() - 1).then_some("STOP");
            for chunk in translator.on_chunk(&native_chunk(json!([{ "text": frag }]), finish)) {
                if let Some(content) = &chunk.choices[0].delta.content {
                    collected.push_str(content);
                }
            }
        }

        assert_eq!(collected, "The quick brown fox");
    }

    #[test]
    fn stream_tool_call_deltas_carry_id_and_name_once() {
        let mut translator = StreamTranslator::new("gpt-4o");
        let chunks = translator.on_chunk(&native_chunk(
            json!([{ "functionCall": { "name": "get_weather", "args": { "city": "SF" } } }]),
            Some("STOP"),
        ));

        // role marker, tool-call delta, finish
        assert_eq!(chunks.len(), 3);
        let calls = chunks[1].choices[0].delta.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].index, 0);
        assert!(calls[0].id.is_some());
        assert_eq!(calls[0].kind.as_deref(), Some("function"));
        assert_eq!(calls[0].function.name.as_deref(), Some("get_weather"));

        // The argument fragments concatenate to a valid JSON object.
        let args: Value =
            serde_json::from_str(calls[0].function.arguments.as_ref().unwrap()).unwrap();
        assert_eq!(args, json!({ "city": "SF" }));

        assert_eq!(
            chunks[2].choices[0].finish_reason.as_deref(),
            Some("tool_calls")
        );
    }

    #[test]
    fn stream_finish_fallback_when_upstream_omits_reason() {
        let mut translator = StreamTranslator::new("gpt-4o");
        translator.on_chunk(&native_chunk(json!([{ "text": "hi" }]), None));

        let fin = translator.finish().unwrap();
        assert_eq!(fin.choices[0].finish_reason.as_deref(), Some("stop"));
        assert!(translator.finish().is_none());
    }

    fn native_chunk(parts: Value, finish: Option<&str>) -> GenerateContentResponse {
        let mut candidate = json!({
            "content": { "role": "model", "parts": parts },
            "index": 0
        });
        if let Some(reason) = finish {
            candidate["finishReason"] = json!(reason);
        }
        serde_json::from_value(json!({ "candidates": [candidate] })).unwrap()
    }
}
