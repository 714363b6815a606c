//! Ollama backend (local HTTP service)

use super::http::{build_client, check_status, decode_json, transport_error};
use super::{BackendReply, ProviderError, ProviderErrorKind, VisionBackend, VisionRequest};
use async_trait::async_trait;
use idt_common::{ConfigError, ProviderConfig, TokenUsage};
use serde::{Deserialize, Serialize};

pub struct OllamaBackend {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    images: [&'a str; 1],
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    error: Option<String>,
    prompt_eval_count: Option<u64>,
    eval_count: Option<u64>,
}

impl OllamaBackend {
    pub fn new(config: &ProviderConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            client: build_client(config)?,
            endpoint: config.endpoint().to_string(),
        })
    }
}

#[async_trait]
impl VisionBackend for OllamaBackend {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn describe(&self, request: &VisionRequest) -> Result<BackendReply, ProviderError> {
        let url = format!("{}/api/generate", self.endpoint);
        let body = GenerateRequest {
            model: &request.model,
            prompt: request.prompt,
            images: [&request.image_base64],
            stream: false,
        };

        tracing::debug!(url = %url, model = %request.model, "Calling Ollama");

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let reply: GenerateResponse = decode_json(check_status(response).await?).await?;

        // Ollama reports some failures (e.g. model still loading) with 200 + error field
        if let Some(error) = reply.error {
            return Err(ProviderError::new(ProviderErrorKind::ProviderUnavailable, error));
        }

        Ok(BackendReply {
            text: reply.response,
            usage: TokenUsage {
                input_tokens: reply.prompt_eval_count,
                output_tokens: reply.eval_count,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_without_counts_decodes() {
        let reply: GenerateResponse =
            serde_json::from_str(r#"{"model":"llava","response":"A cat.","done":true}"#).unwrap();
        assert_eq!(reply.response, "A cat.");
        assert_eq!(reply.eval_count, None);
    }

    #[test]
    fn test_request_shape() {
        let body = GenerateRequest {
            model: "llava",
            prompt: "What is in this image?",
            images: ["aGVsbG8="],
            stream: false,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["images"][0], "aGVsbG8=");
        assert_eq!(json["stream"], false);
    }
}
