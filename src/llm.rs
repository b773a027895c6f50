use std::env;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use crate::error::LlmError;

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;
}

/// Runs one completion under a deadline.
pub async fn complete_within(
    llm: &dyn LanguageModel,
    prompt: &str,
    timeout: Duration,
) -> Result<String, LlmError> {
    match tokio::time::timeout(timeout, llm.complete(prompt)).await {
        Ok(res) => res,
        Err(_) => Err(LlmError::Timeout(timeout.as_millis() as u64)),
    }
}

#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    pub api_base: String,      // e.g. "https://api.openai.com/v1"
    pub api_key: String,       // env OPENAI_API_KEY
    pub model: String,         // env GLASS_SCOUT_MODEL
    pub temperature: f32,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
            model: env::var("GLASS_SCOUT_MODEL").unwrap_or_else(|_| "gpt-4o".into()),
            temperature: 0.7,
        }
    }
}

/// Chat-completions client for OpenAI-compatible endpoints.
#[derive(Clone)]
pub struct OpenAiClient {
    http: Client,
    cfg: OpenAiConfig,
}

impl OpenAiClient {
    pub fn new(cfg: OpenAiConfig) -> Result<Self, LlmError> {
        if cfg.api_key.is_empty() {
            return Err(LlmError::Request("OPENAI_API_KEY missing".into()));
        }
        Ok(Self { http: Client::new(), cfg })
    }

    pub fn model(&self) -> &str {
        &self.cfg.model
    }

    fn parse_output(v: &Value) -> Result<String, LlmError> {
        v.pointer("/choices/0/message/content")
            .and_then(|x| x.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| LlmError::Decode("missing choices[0].message.content".into()))
    }
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", self.cfg.api_base.trim_end_matches('/'));
        let req = json!({
            "model": self.cfg.model,
            "temperature": self.cfg.temperature,
            "messages": [
                { "role": "user", "content": prompt }
            ]
        });
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .json(&req)
            .send()
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| LlmError::Request(e.to_string()))?;
        if !status.is_success() {
            return Err(LlmError::Status { status: status.as_u16(), body: text });
        }
        let v: Value = serde_json::from_str(&text).map_err(|e| LlmError::Decode(e.to_string()))?;
        Self::parse_output(&v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Slow;

    #[async_trait]
    impl LanguageModel for Slow {
        async fn complete(&self, _prompt: &str) -> Result<String, LlmError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("late".into())
        }
    }

    #[tokio::test]
    async fn deadline_turns_into_timeout_error() {
        let res = complete_within(&Slow, "hi", Duration::from_millis(10)).await;
        assert_eq!(res, Err(LlmError::Timeout(10)));
    }

    #[test]
    fn reads_first_choice() {
        let v = json!({"choices": [{"message": {"role": "assistant", "content": "Next engine: COMPLETE"}}]});
        assert_eq!(OpenAiClient::parse_output(&v).unwrap(), "Next engine: COMPLETE");
        assert!(OpenAiClient::parse_output(&json!({"choices": []})).is_err());
    }

    #[test]
    fn refuses_to_build_without_key() {
        let cfg = OpenAiConfig { api_key: String::new(), ..OpenAiConfig::default() };
        assert!(OpenAiClient::new(cfg).is_err());
    }
}
