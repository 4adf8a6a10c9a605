//! HTTP transport, SSE framing, and auth headers.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{AgentError, Result};
use crate::protocol::EncodedRequest;

use super::{ModelTransport, RawEventStream};

/// Streams model responses over HTTP with reqwest.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a transport with its own connection pool.
    ///
    /// No client-level timeout is set; per-attempt deadlines come from
    /// [`crate::util::ResilientCallExecutor`] and stream idleness is bounded by
    /// the loop.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ModelTransport for HttpTransport {
    async fn open_stream(
        &self,
        request: &EncodedRequest,
        abort: &CancellationToken,
    ) -> Result<RawEventStream> {
        debug!(url = %request.url, "opening model stream");

        let send = self
            .client
            .post(&request.url)
            .headers(request.headers.clone())
            .json(&request.body)
            .send();
        let resp = tokio::select! {
            biased;
            _ = abort.cancelled() => return Err(AgentError::Aborted),
            resp = send => resp?,
        };

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(status_to_error(status, &body_text));
        }

        Ok(sse_data_stream(resp.bytes_stream()))
    }
}

/// Split a byte stream into SSE `data:` payloads.
///
/// Lines are split on raw bytes so multi-byte characters spanning chunk
/// boundaries survive. `[DONE]` sentinels, comments, and `event:` lines are
/// skipped.
pub fn sse_data_stream<S, B, E>(bytes: S) -> RawEventStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<AgentError> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut buffer: Vec<u8> = Vec::new();
        futures::pin_mut!(bytes);

        while let Some(chunk_result) = bytes.next().await {
            let chunk = match chunk_result {
                Ok(c) => c,
                Err(e) => {
                    yield Err(e.into());
                    return;
                }
            };
            buffer.extend_from_slice(chunk.as_ref());

            while let Some(line_end) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=line_end).collect();
                if let Some(data) = parse_sse_line(&line) {
                    yield Ok(data);
                }
            }
        }

        if let Some(data) = parse_sse_line(&buffer) {
            yield Ok(data);
        }
    };
    Box::pin(stream)
}

fn parse_sse_line(line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    parse_sse_data(line).map(str::to_string)
}

/// Parse an SSE "data:" line, returning None for "[DONE]".
pub fn parse_sse_data(line: &str) -> Option<&str> {
    let data = line.strip_prefix("data:")?;
    let data = data.strip_prefix(' ').unwrap_or(data);
    if data == "[DONE]" {
        return None;
    }
    Some(data)
}

/// Build default headers for a Bearer-token API.
pub fn bearer_headers(api_key: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Ok(val) = HeaderValue::from_str(&format!("Bearer {api_key}")) {
        headers.insert(AUTHORIZATION, val);
    }
    headers
}

/// Build `x-api-key` style headers.
pub fn anthropic_headers(api_key: &str, version: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Ok(val) = HeaderValue::from_str(api_key) {
        headers.insert("x-api-key", val);
    }
    if let Ok(val) = HeaderValue::from_str(version) {
        headers.insert("anthropic-version", val);
    }
    headers
}

/// Map a non-success HTTP status to an error, keeping the provider's message.
pub fn status_to_error(status: u16, body: &str) -> AgentError {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| crate::protocol::error_message(&v))
        .unwrap_or_else(|| body.to_string());
    AgentError::api(status, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn splits_data_lines_across_chunks() {
        let chunks: Vec<std::result::Result<Vec<u8>, AgentError>> = vec![
            Ok(b"data: {\"a\":".to_vec()),
            Ok(b"1}\n\n: keep-alive\nevent: ping\ndata: [DONE]\n".to_vec()),
            Ok(b"data:{\"b\":2}".to_vec()),
        ];
        let out: Vec<String> = sse_data_stream(futures::stream::iter(chunks))
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(out, vec!["{\"a\":1}".to_string(), "{\"b\":2}".to_string()]);
    }

    #[tokio::test]
    async fn keeps_multibyte_characters_split_across_chunks() {
        let text = "data: {\"t\":\"é\"}\n".as_bytes();
        let split = text.len() - 4;
        let chunks: Vec<std::result::Result<Vec<u8>, AgentError>> =
            vec![Ok(text[..split].to_vec()), Ok(text[split..].to_vec())];
        let out: Vec<String> = sse_data_stream(futures::stream::iter(chunks))
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(out, vec!["{\"t\":\"é\"}".to_string()]);
    }

    #[test]
    fn status_to_error_extracts_message() {
        let err = status_to_error(400, r#"{"error":{"message":"bad model"}}"#);
        match err {
            AgentError::Api { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "bad model");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
