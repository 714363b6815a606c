//! OpenAI chat completions backend

use super::http::{build_client, check_status, decode_json, transport_error};
use super::{BackendReply, ProviderError, ProviderErrorKind, VisionBackend, VisionRequest};
use async_trait::async_trait;
use idt_common::{ConfigError, ProviderConfig, TokenUsage};
use serde::Deserialize;
use serde_json::json;

const MAX_TOKENS: u32 = 1024;

pub struct OpenAiBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct Message {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

impl OpenAiBackend {
    pub fn new(config: &ProviderConfig) -> Result<Self, ConfigError> {
        let api_key = config
            .resolved_api_key()
            .ok_or_else(|| ConfigError::missing("provider.api_key (or OPENAI_API_KEY)"))?;
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

#[async_trait]
impl VisionBackend for OpenAiBackend {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn describe(&self, request: &VisionRequest) -> Result<BackendReply, ProviderError> {
        if !supports(request.media_type) {
            return Err(ProviderError::new(
                ProviderErrorKind::InvalidInput,
                format!("OpenAI does not accept {}", request.media_type),
            ));
        }

        let url = format!("{}/v1/chat/completions", self.endpoint);
        let data_url = format!("data:{};base64,{}", request.media_type, request.image_base64);
        let body = json!({
            "model": request.model,
            "max_tokens": MAX_TOKENS,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": request.prompt },
                    { "type": "image_url", "image_url": { "url": data_url } }
                ]
            }]
        });

        tracing::debug!(url = %url, model = %request.model, "Calling OpenAI");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let reply: ChatResponse = decode_json(check_status(response).await?).await?;

        let message = reply
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| {
                ProviderError::new(ProviderErrorKind::UnknownError, "response carried no choices")
            })?;

        if let Some(refusal) = message.refusal {
            return Err(ProviderError::new(ProviderErrorKind::InvalidInput, refusal));
        }

        Ok(BackendReply {
            text: message.content.unwrap_or_default(),
            usage: reply
                .usage
                .map(|u| TokenUsage {
                    input_tokens: u.prompt_tokens,
                    output_tokens: u.completion_tokens,
                })
                .unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_decodes_usage() {
        let reply: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"A bridge at dusk."}}],
                "usage":{"prompt_tokens":812,"completion_tokens":9,"total_tokens":821}}"#,
        )
        .unwrap();
        assert_eq!(
            reply.choices[0].message.content.as_deref(),
            Some("A bridge at dusk.")
        );
        assert_eq!(reply.usage.unwrap().prompt_tokens, Some(812));
    }

    #[test]
    fn test_bmp_not_supported() {
        assert!(supports("image/png"));
        assert!(!supports("image/bmp"));
    }
}
