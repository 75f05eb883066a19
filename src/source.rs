//! Incremental text sources feeding a turn.
//!
//! A source yields fragments in arrival order and ends with `None`. An
//! error ends the stream; whatever was buffered is still spoken.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::OllamaConfig;
use crate::error::SourceError;

#[async_trait]
pub trait TextSource: Send {
    async fn next_fragment(&mut self) -> Option<Result<String, SourceError>>;
}

/// Fixed list of fragments, e.g. a whole message typed by the user.
pub struct StaticSource {
    fragments: VecDeque<String>,
}

impl StaticSource {
    pub fn new<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new([text.into()])
    }
}

#[async_trait]
impl TextSource for StaticSource {
    async fn next_fragment(&mut self) -> Option<Result<String, SourceError>> {
        self.fragments.pop_front().map(Ok)
    }
}

/// Producer half of a [`ChannelSource`].
#[derive(Clone)]
pub struct FragmentSender {
    tx: mpsc::Sender<Result<String, SourceError>>,
}

impl FragmentSender {
    /// Returns false once the turn reading this channel is gone.
    pub async fn send(&self, fragment: impl Into<String>) -> bool {
        self.tx.send(Ok(fragment.into())).await.is_ok()
    }
}

/// Fragments pushed from elsewhere (stdin, another task). Ends when every
/// sender is dropped.
pub struct ChannelSource {
    rx: mpsc::Receiver<Result<String, SourceError>>,
}

pub fn fragment_channel(depth: usize) -> (FragmentSender, ChannelSource) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    (FragmentSender { tx }, ChannelSource { rx })
}

#[async_trait]
impl TextSource for ChannelSource {
    async fn next_fragment(&mut self) -> Option<Result<String, SourceError>> {
        self.rx.recv().await
    }
}

#[derive(Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    error: Option<String>,
}

/// Parse one NDJSON line from `/api/generate`: `(fragment, done)`.
fn parse_chunk(line: &str) -> Result<(String, bool), SourceError> {
    let chunk: GenerateChunk =
        serde_json::from_str(line).map_err(|e| SourceError::Protocol(format!("{e}: {line}")))?;
    if let Some(error) = chunk.error {
        return Err(SourceError::Protocol(error));
    }
    Ok((chunk.response, chunk.done))
}

/// Split complete lines off the front of `buffer`, leaving any partial line.
fn take_lines(buffer: &mut Vec<u8>) -> Vec<String> {
    let Some(last_newline) = buffer.iter().rposition(|&b| b == b'\n') else {
        return Vec::new();
    };
    let rest = buffer.split_off(last_newline + 1);
    let complete = std::mem::replace(buffer, rest);
    String::from_utf8_lossy(&complete)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

/// Streams a completion from Ollama; each `response` field is a fragment.
pub struct OllamaSource {
    client: Client,
    url: String,
    body: serde_json::Value,
    response: Option<reqwest::Response>,
    buffer: Vec<u8>,
    pending: VecDeque<String>,
    done: bool,
}

impl OllamaSource {
    pub fn new(config: &OllamaConfig, prompt: &str) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url: format!("{}/api/generate", config.host.trim_end_matches('/')),
            body: json!({
                "model": config.model,
                "prompt": prompt,
                "stream": true,
            }),
            response: None,
            buffer: Vec::new(),
            pending: VecDeque::new(),
            done: false,
        })
    }

    async fn connect(&self) -> Result<reqwest::Response, SourceError> {
        debug!("Requesting completion from {}", self.url);
        let resp = self.client.post(&self.url).json(&self.body).send().await?;
        if !resp.status().is_success() {
            return Err(SourceError::Status(resp.status().as_u16()));
        }
        info!("Ollama stream opened ({})", self.body["model"]);
        Ok(resp)
    }

    fn absorb(&mut self, lines: Vec<String>) -> Result<(), SourceError> {
        for line in lines {
            let (fragment, done) = parse_chunk(&line)?;
            if !fragment.is_empty() {
                self.pending.push_back(fragment);
            }
            if done {
                self.done = true;
                break;
            }
        }
        Ok(())
    }

    fn fail(&mut self, error: SourceError) -> Option<Result<String, SourceError>> {
        self.done = true;
        self.pending.clear();
        Some(Err(error))
    }
}

#[async_trait]
impl TextSource for OllamaSource {
    async fn next_fragment(&mut self) -> Option<Result<String, SourceError>> {
        loop {
            if let Some(fragment) = self.pending.pop_front() {
                return Some(Ok(fragment));
            }
            if self.done {
                return None;
            }

            if self.response.is_none() {
                match self.connect().await {
                    Ok(resp) => self.response = Some(resp),
                    Err(e) => return self.fail(e),
                }
            }
            let resp = self.response.as_mut()?;

            match resp.chunk().await {
                Ok(Some(bytes)) => {
                    self.buffer.extend_from_slice(&bytes);
                    let lines = take_lines(&mut self.buffer);
                    if let Err(e) = self.absorb(lines) {
                        return self.fail(e);
                    }
                }
                Ok(None) => {
                    // stream closed without a final newline
                    self.buffer.push(b'\n');
                    let lines = take_lines(&mut self.buffer);
                    self.done = true;
                    if let Err(e) = self.absorb(lines) {
                        return self.fail(e);
                    }
                }
                Err(e) => return self.fail(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::Router;

    async fn drain(source: &mut dyn TextSource) -> (Vec<String>, Option<SourceError>) {
        let mut fragments = Vec::new();
        while let Some(next) = source.next_fragment().await {
            match next {
                Ok(f) => fragments.push(f),
                Err(e) => return (fragments, Some(e)),
            }
        }
        (fragments, None)
    }

    async fn serve_ndjson(body: &'static str) -> OllamaConfig {
        let app = Router::new().route("/api/generate", post(move || async move { body }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        OllamaConfig {
            host: format!("http://127.0.0.1:{port}"),
            timeout_secs: 5,
            ..OllamaConfig::default()
        }
    }

    #[tokio::test]
    async fn static_source_yields_in_order() {
        let mut source = StaticSource::new(["The capital ", "is Paris."]);
        let (fragments, error) = drain(&mut source).await;
        assert_eq!(fragments, vec!["The capital ", "is Paris."]);
        assert!(error.is_none());
    }

    #[tokio::test]
    async fn channel_source_ends_when_senders_drop() {
        let (tx, mut source) = fragment_channel(4);
        tokio::spawn(async move {
            assert!(tx.send("Hello ").await);
            assert!(tx.send("world.").await);
        });
        let (fragments, _) = drain(&mut source).await;
        assert_eq!(fragments, vec!["Hello ", "world."]);
    }

    #[test]
    fn lines_split_on_newline_and_keep_partial_tail() {
        let mut buffer = b"{\"a\":1}\n{\"b\":2}\n{\"c\"".to_vec();
        assert_eq!(take_lines(&mut buffer), vec!["{\"a\":1}", "{\"b\":2}"]);
        assert_eq!(buffer, b"{\"c\"");
        assert!(take_lines(&mut buffer).is_empty());
    }

    #[test]
    fn chunk_parsing() {
        assert_eq!(
            parse_chunk(r#"{"response":"Hi","done":false}"#).unwrap(),
            ("Hi".to_string(), false)
        );
        assert_eq!(parse_chunk(r#"{"done":true}"#).unwrap(), (String::new(), true));
        assert!(matches!(
            parse_chunk(r#"{"error":"model not found"}"#),
            Err(SourceError::Protocol(_))
        ));
        assert!(matches!(parse_chunk("not json"), Err(SourceError::Protocol(_))));
    }

    #[tokio::test]
    async fn ollama_stream_yields_response_fields() {
        let config = serve_ndjson(concat!(
            "{\"response\":\"The capital of France \",\"done\":false}\n",
            "{\"response\":\"is Paris.\",\"done\":false}\n",
            "{\"response\":\"\",\"done\":true}\n",
            "{\"response\":\"ignored\",\"done\":false}\n",
        ))
        .await;

        let mut source = OllamaSource::new(&config, "capital of France?").unwrap();
        let (fragments, error) = drain(&mut source).await;
        assert!(error.is_none());
        assert_eq!(fragments, vec!["The capital of France ", "is Paris."]);
    }

    #[tokio::test]
    async fn ollama_error_payload_ends_stream() {
        let config = serve_ndjson("{\"response\":\"Partial \"}\n{\"error\":\"out of memory\"}\n").await;

        let mut source = OllamaSource::new(&config, "hi").unwrap();
        let (_, error) = drain(&mut source).await;
        assert!(matches!(error, Some(SourceError::Protocol(_))));
        assert!(source.next_fragment().await.is_none());
    }

    #[tokio::test]
    async fn unreachable_host_is_http_error() {
        let config = OllamaConfig {
            host: "http://127.0.0.1:9".into(),
            timeout_secs: 2,
            ..OllamaConfig::default()
        };
        let mut source = OllamaSource::new(&config, "hi").unwrap();
        let (_, error) = drain(&mut source).await;
        assert!(matches!(error, Some(SourceError::Http(_))));
    }
}
