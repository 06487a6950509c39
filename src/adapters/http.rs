//! HTTP generation and retrieval clients.
//!
//! Generation: `POST {endpoint}` with `{prompt, model, max_tokens,
//! temperature, tenant_id, user_id}`, expecting `{text, usage?}`.
//! Retrieval: `POST {endpoint}` with `{query, limit, tenant_id, user_id}`,
//! expecting `{passages: [{text, source_id, relevance_score}]}`.
//! Both authenticate with a bearer token when one is configured.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::{
    estimate_tokens, GenerationClient, GenerationOptions, GenerationOutput, Passage,
    RetrievalClient, RetrievalScope,
};
use crate::domain::TokenUsage;
use crate::errors::{GenerationError, RetrievalError};

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    tenant_id: &'a str,
    user_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    text: String,
    #[serde(default)]
    usage: Option<UsageBody>,
}

#[derive(Debug, Deserialize)]
struct UsageBody {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Generation client for an HTTP text-generation service
pub struct HttpGenerator {
    endpoint: String,
    token: Option<String>,
    default_model: Option<String>,
    client: reqwest::Client,
}

impl HttpGenerator {
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token,
            default_model: None,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn classify_status(status: StatusCode, body: String) -> GenerationError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GenerationError::Auth(body),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::PAYMENT_REQUIRED => {
            GenerationError::Quota(body)
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            GenerationError::Transport(format!("upstream timeout ({}): {}", status, body))
        }
        _ => GenerationError::Transport(format!("HTTP {}: {}", status, body)),
    }
}

#[async_trait]
impl GenerationClient for HttpGenerator {
    fn name(&self) -> &str {
        "http"
    }

    async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<GenerationOutput, GenerationError> {
        let body = GenerateRequest {
            prompt,
            model: options.model.as_deref().or(self.default_model.as_deref()),
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            tenant_id: &options.identity.tenant_id,
            user_id: &options.identity.user_id,
        };

        let mut request = self
            .client
            .post(&self.endpoint)
            .timeout(options.timeout)
            .json(&body);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                GenerationError::Timeout(options.timeout)
            } else {
                GenerationError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, text));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::InvalidResponse(e.to_string()))?;

        let usage = match parsed.usage {
            Some(u) => TokenUsage::new(u.prompt_tokens, u.completion_tokens),
            None => TokenUsage::new(estimate_tokens(prompt), estimate_tokens(&parsed.text)),
        };

        Ok(GenerationOutput::new(parsed.text).with_usage(usage))
    }
}

#[derive(Debug, Serialize)]
struct RetrieveRequest<'a> {
    query: &'a str,
    limit: usize,
    tenant_id: &'a str,
    user_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct RetrieveResponse {
    passages: Vec<Passage>,
}

/// Retrieval client for an HTTP passage-ranking service
pub struct HttpRetriever {
    endpoint: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpRetriever {
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl RetrievalClient for HttpRetriever {
    fn name(&self) -> &str {
        "http"
    }

    async fn retrieve(
        &self,
        query: &str,
        scope: &RetrievalScope,
    ) -> Result<Vec<Passage>, RetrievalError> {
        let body = RetrieveRequest {
            query,
            limit: scope.limit,
            tenant_id: &scope.identity.tenant_id,
            user_id: &scope.identity.user_id,
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| RetrievalError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RetrievalError::Unavailable(format!("HTTP {}: {}", status, text)));
        }

        let mut parsed: RetrieveResponse = response
            .json()
            .await
            .map_err(|e| RetrievalError::InvalidResponse(e.to_string()))?;

        // Ranked, best first
        parsed
            .passages
            .sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));
        parsed.passages.truncate(scope.limit);
        Ok(parsed.passages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, String::new()),
            GenerationError::Auth(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, String::new()),
            GenerationError::Quota(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, String::new()),
            GenerationError::Transport(_)
        ));
    }

    #[test]
    fn test_request_body_carries_identity() {
        let body = GenerateRequest {
            prompt: "p",
            model: Some("m"),
            max_tokens: None,
            temperature: None,
            tenant_id: "acme",
            user_id: "u1",
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["tenant_id"], "acme");
        assert_eq!(json["user_id"], "u1");
        assert!(json.get("max_tokens").is_none());
    }

    #[test]
    fn test_response_without_usage_parses() {
        let parsed: GenerateResponse = serde_json::from_str(r#"{"text": "hello"}"#).unwrap();
        assert_eq!(parsed.text, "hello");
        assert!(parsed.usage.is_none());
    }
}
