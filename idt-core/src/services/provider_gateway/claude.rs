//! Anthropic messages API backend

use super::http::{build_client, check_status, decode_json, transport_error};
use super::{BackendReply, ProviderError, ProviderErrorKind, VisionBackend, VisionRequest};
use async_trait::async_trait;
use idt_common::{ConfigError, ProviderConfig, TokenUsage};
use serde::Deserialize;
use serde_json::json;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 1024;

pub struct ClaudeBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

impl ClaudeBackend {
    pub fn new(config: &ProviderConfig) -> Result<Self, ConfigError> {
        let api_key = config
            .resolved_api_key()
            .ok_or_else(|| ConfigError::missing("provider.api_key (or ANTHROPIC_API_KEY)"))?;
        Ok(Self {
            client: build_client(config)?,
            endpoint: config.endpoint().to_string(),
            api_key,
        })
    }
}

fn supports(media_type: &str) -> bool {
    matches!(media_type, "image/jpeg" | "image/png" | "image/gif" | "image/webp")
}

fn collect_text(blocks: Vec<ContentBlock>) -> String {
    blocks
        .into_iter()
        .filter(|b| b.kind == "text")
        .filter_map(|b| b.text)
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl VisionBackend for ClaudeBackend {
    fn name(&self) -> &'static str {
        "claude"
    }

    async fn describe(&self, request: &VisionRequest) -> Result<BackendReply, ProviderError> {
        if !supports(request.media_type) {
            return Err(ProviderError::new(
                ProviderErrorKind::InvalidInput,
                format!("Claude does not accept {}", request.media_type),
            ));
        }

        let url = format!("{}/v1/messages", self.endpoint);
        let body = json!({
            "model": request.model,
            "max_tokens": MAX_TOKENS,
            "messages": [{
                "role": "user",
                "content": [
                    {
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": request.media_type,
                            "data": request.image_base64
                        }
                    },
                    { "type": "text", "text": request.prompt }
                ]
            }]
        });

        tracing::debug!(url = %url, model = %request.model, "Calling Claude");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let reply: MessagesResponse = decode_json(check_status(response).await?).await?;

        if reply.stop_reason.as_deref() == Some("refusal") {
            return Err(ProviderError::new(
                ProviderErrorKind::InvalidInput,
                "model refused to describe the image",
            ));
        }

        Ok(BackendReply {
            text: collect_text(reply.content),
            usage: reply
                .usage
                .map(|u| TokenUsage {
                    input_tokens: u.input_tokens,
                    output_tokens: u.output_tokens,
                })
                .unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_blocks_joined() {
        let reply: MessagesResponse = serde_json::from_str(
            r#"{"content":[{"type":"text","text":"A harbor."},{"type":"text","text":"Boats."}],
                "stop_reason":"end_turn","usage":{"input_tokens":1500,"output_tokens":12}}"#,
        )
        .unwrap();
        assert_eq!(reply.usage.as_ref().unwrap().output_tokens, Some(12));
        assert_eq!(collect_text(reply.content), "A harbor.\nBoats.");
    }
}
