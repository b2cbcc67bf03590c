//! LLM collaborator interface.
//!
//! Vendor clients live outside this crate and plug in through [`LlmClient`].
//! [`OfflineClient`] answers with a fixed template and is used in test mode.

use std::fmt::Debug;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Instruction prepended to every table sent for analysis.
pub const ANALYST_PROMPT: &str = "You are an experienced data analyst. Briefly analyze the \
table below, point out the main trends and anomalies, and draw conclusions. Be concise and precise.";

/// Supported LLM vendors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provider {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "yandex")]
    Yandex,
    #[serde(rename = "giga")]
    GigaChat,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Yandex => "yandex",
            Self::GigaChat => "giga",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "yandex" => Ok(Self::Yandex),
            "giga" | "gigachat" => Ok(Self::GigaChat),
            other => Err(SessionError::invalid_input(format!(
                "unknown provider '{other}', expected one of: yandex, giga, openai"
            ))),
        }
    }
}

/// Builds the full prompt for a table rendered as text.
pub fn build_prompt(table_text: &str) -> String {
    format!("{ANALYST_PROMPT}\n\nHere are the first rows of the table:\n\n{table_text}")
}

/// Text completion service.
///
/// Any error is treated as "nothing to cache" by the caller and surfaced as a
/// retryable upstream failure.
#[async_trait]
pub trait LlmClient: Debug + Send + Sync {
    async fn complete(&self, provider: Provider, model: &str, prompt: &str) -> Result<String>;
}

/// Client that never leaves the process.
///
/// Responds with a template naming the provider, the model and the prompt size.
#[derive(Debug, Clone, Default)]
pub struct OfflineClient;

#[async_trait]
impl LlmClient for OfflineClient {
    async fn complete(&self, provider: Provider, model: &str, prompt: &str) -> Result<String> {
        Ok(format!(
            "Test mode is active. Data analysis:\n\n\
             Provider: {provider}\n\
             Model: {model}\n\
             Data size: {} characters\n\n\
             Test mode returns a template response without real analysis.\n\
             To enable real analysis:\n\
             1. Set TEST_MODE=false\n\
             2. Configure the API credentials for the selected provider",
            prompt.chars().count()
        ))
    }
}
