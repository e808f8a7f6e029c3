use super::{connect_timeout, CallOptions, Completion, HealthReport, StreamSink};
use crate::config::TimeoutConfig;
use crate::error::{classify_upstream_error, classify_upstream_status, GatewayError};
use futures_util::StreamExt;
use serde::Deserialize;
use std::time::Instant;

/// HTTP adapter speaking the Ollama-compatible generate API: JSON request,
/// JSON response, newline-delimited JSON when streaming.
#[derive(Debug)]
pub struct HttpUpstream {
    name: String,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    model: String,
    #[serde(default)]
    response: String,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Deserialize)]
struct StreamFrame {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Deserialize)]
struct TagModel {
    name: String,
}

impl HttpUpstream {
    pub fn new(
        name: String,
        base_url: String,
        api_key: Option<String>,
        timeout: TimeoutConfig,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout(&timeout))
            .no_proxy()
            .build()?;
        Ok(Self {
            name,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    fn request_body(&self, prompt: &str, model: &str, opts: &CallOptions, stream: bool) -> serde_json::Value {
        let mut options = serde_json::Map::new();
        if let Some(t) = opts.temperature {
            options.insert("temperature".into(), serde_json::json!(t));
        }
        if let Some(n) = opts.max_tokens {
            options.insert("num_predict".into(), serde_json::json!(n));
        }
        serde_json::json!({
            "model": model,
            "prompt": prompt,
            "stream": stream,
            "options": options,
        })
    }

    fn generate_request(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(body);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }
        req
    }

    pub async fn complete(
        &self,
        prompt: &str,
        model: &str,
        opts: &CallOptions,
    ) -> Result<Completion, GatewayError> {
        let start = Instant::now();
        let body = self.request_body(prompt, model, opts, false);

        let send = self.generate_request(&body).send();
        let resp = tokio::select! {
            r = send => r.map_err(|e| map_reqwest_error(&e))?,
            _ = opts.cancel.cancelled() => {
                return Err(GatewayError::Internal("request cancelled".into()));
            }
        };

        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_upstream_status(status, &text));
        }

        let parsed: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::Upstream(format!("malformed upstream JSON: {}", e)))?;

        if parsed.response.is_empty() {
            return Err(GatewayError::Upstream("empty upstream response".into()));
        }

        Ok(Completion {
            model: if parsed.model.is_empty() {
                model.to_string()
            } else {
                parsed.model
            },
            text: parsed.response,
            provider: self.name.clone(),
            duration_ms: start.elapsed().as_millis() as u64,
            cached: false,
            prompt_tokens: parsed.prompt_eval_count,
            completion_tokens: parsed.eval_count,
        })
    }

    /// Stream NDJSON frames, pushing each `response` fragment into the sink.
    /// Partial lines across chunk boundaries are reassembled before parsing.
    pub async fn complete_stream(
        &self,
        prompt: &str,
        model: &str,
        opts: &CallOptions,
        sink: &StreamSink,
    ) -> Result<(), GatewayError> {
        let start = Instant::now();
        let body = self.request_body(prompt, model, opts, true);

        let resp = tokio::select! {
            r = self.generate_request(&body).send() => r.map_err(|e| map_reqwest_error(&e))?,
            _ = opts.cancel.cancelled() => {
                return Err(GatewayError::Internal("request cancelled".into()));
            }
        };

        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_upstream_status(status, &text));
        }

        let mut stream = resp.bytes_stream();
        let mut pending = String::new();

        loop {
            let chunk = tokio::select! {
                c = stream.next() => c,
                _ = opts.cancel.cancelled() => {
                    // Dropping the stream aborts the in-flight request.
                    return Err(GatewayError::Internal("request cancelled".into()));
                }
            };

            let bytes = match chunk {
                Some(Ok(b)) => b,
                Some(Err(e)) => {
                    return Err(classify_upstream_error(&format!("network: {}", e)));
                }
                None => break,
            };

            pending.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(pos) = pending.find('\n') {
                let line: String = pending.drain(..=pos).collect();
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let frame: StreamFrame = match serde_json::from_str(line) {
                    Ok(f) => f,
                    Err(_) => continue,
                };
                if !frame.response.is_empty() && !sink.chunk(frame.response).await {
                    return Ok(()); // receiver gone — client disconnected
                }
                if frame.done {
                    sink.end(start.elapsed().as_millis() as u64).await;
                    return Ok(());
                }
            }
        }

        // Stream ended without a done frame; close out with what was sent.
        sink.end(start.elapsed().as_millis() as u64).await;
        Ok(())
    }

    pub async fn health_check(&self) -> HealthReport {
        let start = Instant::now();
        let result = self
            .client
            .get(format!("{}/api/version", self.base_url))
            .send()
            .await;
        let latency_ms = start.elapsed().as_millis() as u64;
        match result {
            Ok(resp) if resp.status().is_success() => HealthReport {
                ok: true,
                latency_ms,
                error: None,
            },
            Ok(resp) => HealthReport {
                ok: false,
                latency_ms,
                error: Some(format!("status {}", resp.status().as_u16())),
            },
            Err(e) => HealthReport {
                ok: false,
                latency_ms,
                error: Some(e.to_string()),
            },
        }
    }

    pub async fn list_models(&self) -> Vec<String> {
        let resp = match self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
        {
            Ok(r) => r,
            Err(_) => return Vec::new(),
        };
        match resp.json::<TagsResponse>().await {
            Ok(tags) => tags.models.into_iter().map(|m| m.name).collect(),
            Err(_) => Vec::new(),
        }
    }
}

/// Map transport-level reqwest failures onto the pipeline taxonomy.
fn map_reqwest_error(e: &reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        return GatewayError::TransportRetryable(format!("timeout: {}", e));
    }
    if e.is_connect() {
        return GatewayError::TransportRetryable(format!("econnrefused: {}", e));
    }
    classify_upstream_error(&format!("network: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimeoutConfig;

    fn upstream() -> HttpUpstream {
        HttpUpstream::new(
            "test".into(),
            "http://127.0.0.1:1/".into(),
            None,
            TimeoutConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_base_url_trailing_slash_stripped() {
        let u = upstream();
        assert_eq!(u.base_url, "http://127.0.0.1:1");
    }

    #[test]
    fn test_request_body_shape() {
        let u = upstream();
        let opts = CallOptions {
            temperature: Some(0.2),
            max_tokens: Some(128),
            ..CallOptions::default()
        };
        let body = u.request_body("hi", "llama3", &opts, true);
        assert_eq!(body["model"], "llama3");
        assert_eq!(body["prompt"], "hi");
        assert_eq!(body["stream"], true);
        assert_eq!(body["options"]["temperature"], 0.2);
        assert_eq!(body["options"]["num_predict"], 128);
    }

    #[tokio::test]
    async fn test_connect_error_is_retryable() {
        let u = upstream();
        let err = u
            .complete("hi", "llama3", &CallOptions::default())
            .await
            .unwrap_err();
        assert!(
            matches!(err, GatewayError::TransportRetryable(_)),
            "got: {:?}",
            err
        );
    }
}
