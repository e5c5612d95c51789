use crate::config::LlmConfig;
use crate::llm::{ChatCompletion, ChatMessage, LlmError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Local Ollama provider. Ollama's generate endpoint takes a single prompt
/// string, so the chat messages are flattened before sending.
pub struct OllamaProvider {
    client: reqwest::Client,
    api_url: String,
    model: String,
}

#[derive(Serialize, Debug)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize, Debug)]
struct OllamaOptions {
    temperature: f32,
    num_predict: usize,
}

#[derive(Deserialize, Debug)]
struct OllamaResponse {
    response: String,
}

impl OllamaProvider {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_url = config
            .api_url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434/api/generate".to_string());

        let client = reqwest::Client::new();

        Ok(Self {
            client,
            api_url,
            model: config.model.clone(),
        })
    }

    fn flatten_messages(messages: &[ChatMessage]) -> String {
        let mut prompt = String::new();
        for message in messages {
            if !prompt.is_empty() {
                prompt.push_str("\n\n");
            }
            prompt.push_str(&message.content);
        }
        prompt
    }
}

#[async_trait]
impl ChatCompletion for OllamaProvider {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        max_tokens: usize,
        temperature: f32,
    ) -> Result<String, LlmError> {
        let request = OllamaRequest {
            model: &self.model,
            prompt: Self::flatten_messages(messages),
            stream: false,
            options: OllamaOptions {
                temperature,
                num_predict: max_tokens,
            },
        };

        debug!(model = %self.model, "sending request to Ollama");

        let response = self
            .client
            .post(&self.api_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::Connection(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(LlmError::Http {
                status: status.as_u16(),
                detail,
            });
        }

        let parsed: OllamaResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Response(e.to_string()))?;

        if parsed.response.trim().is_empty() {
            return Err(LlmError::Response("empty response from Ollama".to_string()));
        }

        Ok(parsed.response)
    }
}
