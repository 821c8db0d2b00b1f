//! LLM-backed perspective provider (OpenAI-compatible chat completions)

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{PerspectiveContext, PerspectiveProvider, Perspectives};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub model: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    pub timeout_ms: u64,
    pub temperature: f64,
    pub max_tokens: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_ms: 10_000,
            temperature: 0.2,
            max_tokens: 400,
        }
    }
}

pub struct LlmPerspectives {
    client: Client,
    api_key: String,
    config: LlmConfig,
}

impl LlmPerspectives {
    pub fn new(api_key: impl Into<String>, config: LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms.max(1)))
            .build()
            .context("Failed to build LLM HTTP client")?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            config,
        })
    }

    /// Build from config, reading the key from `config.api_key_env`
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .with_context(|| format!("{} is not set", config.api_key_env))?;
        Self::new(api_key, config.clone())
    }
}

#[derive(Serialize)]
struct Request {
    model: String,
    max_tokens: usize,
    temperature: f64,
    messages: Vec<Message>,
}

#[derive(Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct Response {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

const SYSTEM_PROMPT: &str = "You are a panel of three crypto arbitrage analysts. \
Reply with a single JSON object of the form \
{\"bullish\":{\"score\":0-1,\"reasons\":[...]},\"bearish\":{\"score\":0-1,\"reasons\":[...]},\"neutral\":{\"score\":0-1,\"reasons\":[...]}} \
and nothing else.";

fn build_prompt(context: &PerspectiveContext) -> String {
    format!(
        "Symbol: {}\nAction: {}\nSpread: {:.4}%\nEstimated gross profit: {:.4}%\n\
Risk score: {:.1}/100\nVolatility: {:.4}%\nFill ratio: {:.3}\nSlippage: {:.4}%\n\
Allocated capital: {:.2}\n\nScore how strongly each analyst favours executing now.",
        context.symbol,
        context.action,
        context.spread_pct,
        context.estimated_gross_profit_pct,
        context.risk_score,
        context.volatility_pct,
        context.fill_ratio,
        context.slippage_pct,
        context.allocated_amount
    )
}

/// Extract and parse the perspectives object from model output, tolerating
/// surrounding prose or code fences.
pub(crate) fn parse_perspectives(text: &str) -> Result<Perspectives> {
    let start = text
        .find('{')
        .ok_or_else(|| anyhow!("no JSON object in LLM response"))?;
    let end = text
        .rfind('}')
        .filter(|end| *end > start)
        .ok_or_else(|| anyhow!("unterminated JSON object in LLM response"))?;
    let perspectives: Perspectives = serde_json::from_str(&text[start..=end])
        .context("LLM response is not a perspectives object")?;
    if !perspectives.is_valid() {
        return Err(anyhow!("LLM perspective scores outside [0, 1]"));
    }
    Ok(perspectives)
}

#[async_trait]
impl PerspectiveProvider for LlmPerspectives {
    fn name(&self) -> &'static str {
        "llm"
    }

    async fn perspectives(&self, context: &PerspectiveContext) -> Result<Perspectives> {
        let request = Request {
            model: self.config.model.clone(),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            messages: vec![
                Message {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                Message {
                    role: "user",
                    content: build_prompt(context),
                },
            ],
        };

        let response = self
            .client
            .post(&self.config.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .context("LLM request failed")?
            .error_for_status()
            .context("LLM endpoint returned an error status")?
            .json::<Response>()
            .await
            .context("LLM response body is not a chat completion")?;

        let content = response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow!("LLM response has no choices"))?;

        parse_perspectives(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_json() {
        let text = "Here you go:\n```json\n{\"bullish\":{\"score\":0.7,\"reasons\":[\"wide spread\"]},\
\"bearish\":{\"score\":0.2},\"neutral\":{\"score\":0.5,\"reasons\":[]}}\n```";
        let p = parse_perspectives(text).unwrap();
        assert_eq!(p.bullish.score, 0.7);
        assert!(p.bearish.reasons.is_empty());
        assert_eq!(p.bullish.reasons, vec!["wide spread".to_string()]);
    }

    #[test]
    fn rejects_malformed_output() {
        assert!(parse_perspectives("I think you should buy").is_err());
        assert!(parse_perspectives("{\"bullish\": 0.7}").is_err());
        assert!(parse_perspectives(
            "{\"bullish\":{\"score\":2.0},\"bearish\":{\"score\":0.2},\"neutral\":{\"score\":0.5}}"
        )
        .is_err());
    }

    #[test]
    fn request_serializes_as_chat_completion() {
        let request = Request {
            model: "gpt-4o-mini".to_string(),
            max_tokens: 400,
            temperature: 0.2,
            messages: vec![Message {
                role: "user",
                content: "hi".to_string(),
            }],
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "gpt-4o-mini");
        assert_eq!(json["messages"][0]["role"], "user");
    }

    #[test]
    fn missing_key_env_is_an_error() {
        let config = LlmConfig {
            api_key_env: "CROSSARB_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
            ..Default::default()
        };
        assert!(LlmPerspectives::from_config(&config).is_err());
    }
}
