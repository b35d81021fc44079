// =============================================================================
// LLM Gateway — chat-completion client with retry, timeout, and JSON rescue
// =============================================================================
//
// The strategist and reflection loops are the only callers. Both treat the
// model as an unreliable collaborator: `query` returns `None` after three
// failed attempts instead of an error, and callers skip their cycle. Response
// parsing tolerates both the Ollama (`message.content`) and OpenAI
// (`choices[0].message.content`) response shapes, and `extract_json` digs a
// JSON object out of whatever prose or fencing the model wrapped it in.
// =============================================================================

use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, warn};

/// Query attempts before giving up.
const MAX_ATTEMPTS: u32 = 3;

pub struct LlmClient {
    client: reqwest::Client,
    host: String,
    model: String,
    /// Outcome of the most recent query, for the health report.
    reachable: RwLock<bool>,
}

impl LlmClient {
    pub fn new(host: impl Into<String>, model: impl Into<String>, timeout_s: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_s))
            .build()
            .expect("failed to build reqwest client");

        Self {
            client,
            host: host.into(),
            model: model.into(),
            reachable: RwLock::new(true),
        }
    }

    /// Whether the last query round-tripped successfully.
    pub fn is_reachable(&self) -> bool {
        *self.reachable.read()
    }

    /// Ask the model. Returns the raw completion text, or `None` if every
    /// attempt failed — callers must treat absence as "skip this cycle".
    pub async fn query(&self, system_prompt: &str, user_prompt: &str) -> Option<String> {
        self.query_with_temperature(system_prompt, user_prompt, 0.7)
            .await
    }

    pub async fn query_with_temperature(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        temperature: f64,
    ) -> Option<String> {
        let url = format!("{}/api/chat", self.host.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_prompt },
            ],
            "stream": false,
            "options": { "temperature": temperature },
        });

        for attempt in 1..=MAX_ATTEMPTS {
            match self.attempt(&url, &body).await {
                Ok(content) => {
                    *self.reachable.write() = true;
                    debug!(attempt, chars = content.len(), "llm query succeeded");
                    return Some(content);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "llm query attempt failed");
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                    }
                }
            }
        }

        *self.reachable.write() = false;
        None
    }

    async fn attempt(&self, url: &str, body: &serde_json::Value) -> anyhow::Result<String> {
        let resp = self.client.post(url).json(body).send().await?;
        let status = resp.status();
        let payload: serde_json::Value = resp.json().await?;

        if !status.is_success() {
            anyhow::bail!("llm endpoint returned {status}: {payload}");
        }

        // Ollama shape first, then OpenAI-compatible.
        let content = payload["message"]["content"]
            .as_str()
            .or_else(|| payload["choices"][0]["message"]["content"].as_str())
            .ok_or_else(|| anyhow::anyhow!("no content field in llm response"))?;

        Ok(content.to_string())
    }
}

impl std::fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmClient")
            .field("host", &self.host)
            .field("model", &self.model)
            .finish()
    }
}

// =============================================================================
// JSON extraction
// =============================================================================

/// Pull the first balanced JSON object out of model output.
///
/// Strips Markdown code fences first, then scans for `{...}` with
/// string-literal awareness so braces inside quoted text don't break the
/// balance count.
pub fn extract_json(text: &str) -> Option<String> {
    let stripped = strip_fences(text);
    let bytes = stripped.as_bytes();
    let start = stripped.find('{')?;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(stripped[start..=i].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// If the text contains a fenced code block, return its body; otherwise the
/// text unchanged.
fn strip_fences(text: &str) -> &str {
    let Some(open) = text.find("```") else {
        return text;
    };
    let after_open = &text[open + 3..];
    // Skip an optional language tag on the fence line.
    let body_start = after_open.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after_open[body_start..];
    match body.find("```") {
        Some(close) => &body[..close],
        None => body,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_plain_object() {
        let out = extract_json(r#"{"a": 1, "b": [2, 3]}"#).unwrap();
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn extracts_from_markdown_fence() {
        let text = "Here you go:\n```json\n{\"conditions\": []}\n```\nGood luck!";
        let out = extract_json(text).unwrap();
        assert_eq!(out, "{\"conditions\": []}");
    }

    #[test]
    fn extracts_first_object_from_prose() {
        let text = "I think {\"x\": {\"y\": 2}} fits, but {\"z\": 3} also works.";
        let out = extract_json(text).unwrap();
        assert_eq!(out, "{\"x\": {\"y\": 2}}");
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_the_scanner() {
        let text = r#"{"note": "use {curly} braces", "n": 1}"#;
        let out = extract_json(text).unwrap();
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["n"], 1);
    }

    #[test]
    fn escaped_quotes_inside_strings() {
        let text = r#"{"quote": "she said \"hi\"", "ok": true}"#;
        let out = extract_json(text).unwrap();
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["ok"], true);
    }

    #[test]
    fn no_object_yields_none() {
        assert!(extract_json("no json here").is_none());
        assert!(extract_json("unbalanced { oops").is_none());
        assert!(extract_json("").is_none());
    }

    #[test]
    fn fence_without_language_tag() {
        let text = "```\n{\"a\": 1}\n```";
        assert_eq!(extract_json(text).unwrap(), "{\"a\": 1}");
    }
}
