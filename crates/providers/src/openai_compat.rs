//! OpenAI-compatible adapter.
//!
//! Works with OpenAI, Azure-style gateways, Ollama, vLLM, and any other
//! endpoint that follows the OpenAI chat completions contract. Each
//! pipeline prompt is sent as a single user message.

use serde_json::Value;

use ps_domain::config::LlmSettings;
use ps_domain::error::{Error, Result};

use crate::traits::{CompletionRequest, CompletionResponse, LlmProvider, Usage};
use crate::util::from_reqwest;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An LLM adapter for any OpenAI-compatible chat completions endpoint.
#[derive(Debug)]
pub struct OpenAiCompatProvider {
    id: String,
    base_url: String,
    api_key: String,
    default_model: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create the adapter from the LLM settings. The API key is resolved
    /// once from the env var named by `api_key_env`.
    pub fn from_settings(settings: &LlmSettings) -> Result<Self> {
        let api_key = std::env::var(&settings.api_key_env).map_err(|_| {
            Error::Config(format!(
                "environment variable '{}' not set or not valid UTF-8",
                settings.api_key_env
            ))
        })?;

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(from_reqwest)?;

        Ok(Self {
            id: "openai_compat".into(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key,
            default_model: settings.model.clone(),
            client,
        })
    }

    fn build_body(&self, req: &CompletionRequest) -> Value {
        let model = req
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());
        serde_json::json!({
            "model": model,
            "messages": [{ "role": "user", "content": req.prompt }],
            "temperature": req.temperature,
            "max_tokens": req.max_tokens,
        })
    }
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn complete(&self, req: CompletionRequest) -> Result<CompletionResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_body(&req);
        tracing::debug!(
            provider = %self.id,
            url = %url,
            prompt_bytes = req.prompt.len(),
            "sending chat completion request"
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = response.status();
        let payload: Value = response.json().await.map_err(from_reqwest)?;

        if !status.is_success() {
            let message = payload["error"]["message"]
                .as_str()
                .unwrap_or("unknown provider error");
            tracing::warn!(
                provider = %self.id,
                %status,
                detail = message,
                "provider returned error status"
            );
            return Err(Error::Http(format!("{status}: {message}")));
        }

        let parsed = parse_chat_response(&payload)?;
        tracing::debug!(
            provider = %self.id,
            model = %parsed.model,
            response_bytes = parsed.text.len(),
            "chat completion received"
        );
        Ok(parsed)
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

/// Pull content + usage out of a chat completions payload.
fn parse_chat_response(payload: &Value) -> Result<CompletionResponse> {
    let text = payload["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| Error::Http("response missing choices[0].message.content".into()))?
        .trim()
        .to_string();

    let usage = payload.get("usage").and_then(|u| {
        let input = u["prompt_tokens"].as_u64()?;
        let output = u["completion_tokens"].as_u64()?;
        Some(Usage {
            input_tokens: input as u32,
            output_tokens: output as u32,
        })
    });

    let model = payload["model"].as_str().unwrap_or_default().to_string();

    Ok(CompletionResponse { text, usage, model })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn settings_for(base_url: &str, key_env: &str) -> LlmSettings {
        LlmSettings {
            model: "gpt-4o".into(),
            temperature: 0.2,
            max_tokens: 512,
            base_url: base_url.into(),
            api_key_env: key_env.into(),
            request_timeout_secs: 5,
            max_attempts_per_call: 2,
        }
    }

    fn completion_request(prompt: &str) -> CompletionRequest {
        CompletionRequest {
            prompt: prompt.into(),
            model: None,
            temperature: 0.2,
            max_tokens: 512,
        }
    }

    // ── one-shot HTTP endpoint ──────────────────────────────────────

    /// Accept a single connection, capture the full request, answer with
    /// `body`, and hand the raw request text back through the join handle.
    async fn serve_once(
        status_line: &'static str,
        body: String,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                if n == 0 || request_complete(&request) {
                    break;
                }
            }

            let response = format!(
                "{status_line}\r\nContent-Type: application/json\r\n\
                 Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.ok();
            String::from_utf8_lossy(&request).into_owned()
        });

        (format!("http://{addr}"), handle)
    }

    fn request_complete(raw: &[u8]) -> bool {
        let header_end = match raw.windows(4).position(|w| w == b"\r\n\r\n") {
            Some(i) => i,
            None => return false,
        };
        let headers = String::from_utf8_lossy(&raw[..header_end]);
        let content_length = headers
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                if name.eq_ignore_ascii_case("content-length") {
                    value.trim().parse::<usize>().ok()
                } else {
                    None
                }
            })
            .unwrap_or(0);
        raw.len() >= header_end + 4 + content_length
    }

    // ── complete() against the endpoint ─────────────────────────────

    #[tokio::test]
    async fn complete_round_trips_against_local_endpoint() {
        let payload = serde_json::json!({
            "model": "gpt-4o",
            "choices": [{ "message": { "role": "assistant", "content": "{\"ok\":true}" } }],
            "usage": { "prompt_tokens": 9, "completion_tokens": 4 }
        });
        let (base_url, server) = serve_once("HTTP/1.1 200 OK", payload.to_string()).await;

        std::env::set_var("PS_TEST_OPENAI_KEY_OK", "test-key");
        let provider =
            OpenAiCompatProvider::from_settings(&settings_for(&base_url, "PS_TEST_OPENAI_KEY_OK"))
                .unwrap();

        let response = provider
            .complete(completion_request("classify these products"))
            .await
            .unwrap();

        assert_eq!(response.text, "{\"ok\":true}");
        assert_eq!(
            response.usage,
            Some(Usage {
                input_tokens: 9,
                output_tokens: 4
            })
        );
        assert_eq!(response.model, "gpt-4o");

        // The wire request carries the endpoint path, auth header, model,
        // and the prompt as a single user message.
        let request = server.await.unwrap();
        assert!(request.starts_with("POST /chat/completions"));
        assert!(request
            .to_ascii_lowercase()
            .contains("authorization: bearer test-key"));
        assert!(request.contains("\"model\":\"gpt-4o\""));
        assert!(request.contains("\"role\":\"user\""));
        assert!(request.contains("classify these products"));
    }

    #[tokio::test]
    async fn complete_surfaces_provider_error_status() {
        let payload = serde_json::json!({ "error": { "message": "invalid api key" } });
        let (base_url, server) =
            serve_once("HTTP/1.1 401 Unauthorized", payload.to_string()).await;

        std::env::set_var("PS_TEST_OPENAI_KEY_ERR", "bad-key");
        let provider =
            OpenAiCompatProvider::from_settings(&settings_for(&base_url, "PS_TEST_OPENAI_KEY_ERR"))
                .unwrap();

        let err = provider
            .complete(completion_request("anything"))
            .await
            .unwrap_err();
        match err {
            Error::Http(message) => {
                assert!(message.contains("401"));
                assert!(message.contains("invalid api key"));
            }
            other => panic!("unexpected error: {other}"),
        }
        server.await.unwrap();
    }

    #[test]
    fn from_settings_requires_api_key_env() {
        let err = OpenAiCompatProvider::from_settings(&settings_for(
            "http://localhost",
            "PS_TEST_OPENAI_KEY_MISSING",
        ))
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    // ── payload parsing ─────────────────────────────────────────────

    #[test]
    fn parse_chat_response_happy_path() {
        let payload = serde_json::json!({
            "model": "gpt-4o",
            "choices": [{ "message": { "role": "assistant", "content": "  {\"a\":1}  " } }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 5 }
        });
        let resp = parse_chat_response(&payload).unwrap();
        assert_eq!(resp.text, "{\"a\":1}");
        assert_eq!(
            resp.usage,
            Some(Usage {
                input_tokens: 12,
                output_tokens: 5
            })
        );
        assert_eq!(resp.model, "gpt-4o");
    }

    #[test]
    fn parse_chat_response_without_usage() {
        let payload = serde_json::json!({
            "choices": [{ "message": { "content": "hi" } }]
        });
        let resp = parse_chat_response(&payload).unwrap();
        assert_eq!(resp.text, "hi");
        assert!(resp.usage.is_none());
    }

    #[test]
    fn parse_chat_response_missing_content_is_error() {
        let payload = serde_json::json!({ "choices": [] });
        assert!(parse_chat_response(&payload).is_err());
    }
}
