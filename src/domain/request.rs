//! Content requests: the caller-supplied input to an execution.

use serde::{Deserialize, Serialize};

use crate::errors::ValidationError;

const MAX_TOPIC_CHARS: usize = 500;
const MAX_BRIEF_CHARS: usize = 10_000;
const MAX_KEYWORDS: usize = 50;

/// Explicit tenant/user identity carried on every external call
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub tenant_id: String,
    pub user_id: String,
}

impl Identity {
    pub fn new(tenant_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
        }
    }
}

/// A request to generate one piece of long-form content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRequest {
    pub topic: String,

    pub identity: Identity,

    /// Seed keywords; research may expand on them
    #[serde(default)]
    pub keywords: Vec<String>,

    #[serde(default)]
    pub audience: Option<String>,

    /// Desired tone (e.g. "authoritative", "conversational")
    #[serde(default)]
    pub tone: Option<String>,

    #[serde(default)]
    pub target_word_count: Option<u32>,

    /// Free-form brief from the requester
    #[serde(default)]
    pub brief: Option<String>,
}

impl ContentRequest {
    pub fn new(topic: impl Into<String>, identity: Identity) -> Self {
        Self {
            topic: topic.into(),
            identity,
            keywords: Vec::new(),
            audience: None,
            tone: None,
            target_word_count: None,
            brief: None,
        }
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_target_word_count(mut self, words: u32) -> Self {
        self.target_word_count = Some(words);
        self
    }

    pub fn with_tone(mut self, tone: impl Into<String>) -> Self {
        self.tone = Some(tone.into());
        self
    }

    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    /// Reject the request before any stage runs
    pub fn validate(&self) -> Result<(), ValidationError> {
        let topic = self.topic.trim();
        if topic.is_empty() {
            return Err(ValidationError::EmptyField("topic"));
        }
        let topic_chars = topic.chars().count();
        if topic_chars > MAX_TOPIC_CHARS {
            return Err(ValidationError::TooLong {
                field: "topic",
                actual: topic_chars,
                limit: MAX_TOPIC_CHARS,
            });
        }

        if self.identity.tenant_id.trim().is_empty() {
            return Err(ValidationError::EmptyField("tenant_id"));
        }
        if self.identity.user_id.trim().is_empty() {
            return Err(ValidationError::EmptyField("user_id"));
        }

        if self.keywords.len() > MAX_KEYWORDS {
            return Err(ValidationError::TooManyKeywords {
                actual: self.keywords.len(),
                limit: MAX_KEYWORDS,
            });
        }
        if self.keywords.iter().any(|k| k.trim().is_empty()) {
            return Err(ValidationError::EmptyField("keywords"));
        }

        if let Some(words) = self.target_word_count {
            if !(100..=20_000).contains(&words) {
                return Err(ValidationError::WordCountOutOfRange(words));
            }
        }

        if let Some(ref brief) = self.brief {
            let chars = brief.chars().count();
            if chars > MAX_BRIEF_CHARS {
                return Err(ValidationError::TooLong {
                    field: "brief",
                    actual: chars,
                    limit: MAX_BRIEF_CHARS,
                });
            }
        }

        Ok(())
    }
}
