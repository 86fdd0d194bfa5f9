//! Wire Protocol - Request/Response Boundary
//!
//! Messages are JSON objects discriminated by `type`. Binary fields travel as
//! base64 strings. Anything without a recognized `type` is dropped without a
//! response.

use std::collections::BTreeMap;

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::lane::CompileLane;
use crate::pipeline::{CompileJob, CompileOutcome};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error on message channel: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("response writer stopped unexpectedly")]
    WriterStopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileRequest {
    pub id: String,
    pub files: BTreeMap<String, String>,
    pub main_file: String,
    #[serde(default, with = "base64_map")]
    pub images: BTreeMap<String, Vec<u8>>,
}

impl From<CompileRequest> for CompileJob {
    fn from(request: CompileRequest) -> Self {
        CompileJob {
            id: request.id,
            sources: request.files,
            entry: request.main_file,
            auxiliary: request.images,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Compile(CompileRequest),
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Response {
    CompileResult(CompileResponse),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileResponse {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_opt")]
    pub pdf: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub diagnostics: Vec<String>,
}

impl Response {
    pub fn from_outcome(id: String, outcome: CompileOutcome) -> Self {
        let body = match outcome {
            CompileOutcome::Compiled {
                artifact,
                diagnostics,
            } => CompileResponse {
                id,
                ok: true,
                pdf: Some(artifact),
                error: None,
                diagnostics,
            },
            CompileOutcome::Failed {
                message,
                diagnostics,
            } => CompileResponse {
                id,
                ok: false,
                pdf: None,
                error: Some(message),
                diagnostics,
            },
        };
        Response::CompileResult(body)
    }

    pub fn failure(id: String, message: impl Into<String>) -> Self {
        Response::CompileResult(CompileResponse {
            id,
            ok: false,
            pdf: None,
            error: Some(message.into()),
            diagnostics: vec![],
        })
    }

    pub fn id(&self) -> &str {
        match self {
            Response::CompileResult(body) => &body.id,
        }
    }
}

/// Result of decoding one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Request(Request),
    /// A compile message whose body could not be read; answered directly.
    Rejected(Response),
    Ignored,
}

/// Decode a raw message, applying the minimal shape check.
pub fn decode(raw: &str) -> Decoded {
    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(_) => return Decoded::Ignored,
    };

    match value.get("type").and_then(Value::as_str) {
        Some("compile") => {
            let id = value.get("id").and_then(Value::as_str).map(str::to_string);
            match serde_json::from_value::<CompileRequest>(value) {
                Ok(request) => Decoded::Request(Request::Compile(request)),
                Err(err) => match id {
                    Some(id) => Decoded::Rejected(Response::failure(
                        id,
                        format!("Invalid compile request: {err}"),
                    )),
                    None => Decoded::Ignored,
                },
            }
        }
        Some("reset") => Decoded::Request(Request::Reset),
        _ => Decoded::Ignored,
    }
}

/// Route one raw message. Returns the eventual response, if the message gets
/// one. Work is queued on the lane before this returns, so responses resolve
/// in the order messages were dispatched.
pub fn dispatch(lane: &CompileLane, raw: &str) -> Option<BoxFuture<'static, Response>> {
    match decode(raw) {
        Decoded::Request(Request::Compile(request)) => {
            let id = request.id.clone();
            let outcome = lane.enqueue(request.into());
            Some(
                async move {
                    match outcome.await {
                        Ok(outcome) => Response::from_outcome(id, outcome),
                        Err(err) => Response::failure(id, err.to_string()),
                    }
                }
                .boxed(),
            )
        }
        Decoded::Request(Request::Reset) => {
            let reset = lane.reset();
            tokio::spawn(async move {
                if let Err(err) = reset.await {
                    warn!(error = %err, "reset request not processed");
                }
            });
            None
        }
        Decoded::Rejected(response) => Some(futures::future::ready(response).boxed()),
        Decoded::Ignored => {
            debug!("ignoring message without a recognized type");
            None
        }
    }
}

/// Serve newline-delimited JSON messages from `reader`, writing one JSON line
/// per response to `writer` in request order. Returns once `reader` reaches
/// end of input and every pending response has been written. Lines that are
/// not UTF-8 are dropped like any other unrecognized message.
pub async fn serve<R, W>(lane: CompileLane, reader: R, writer: W) -> Result<(), ProtocolError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (pending_tx, pending_rx) = mpsc::unbounded_channel::<BoxFuture<'static, Response>>();
    let writer_task = tokio::spawn(write_responses(pending_rx, writer));

    let read = read_requests(&lane, reader, &pending_tx).await;
    drop(pending_tx);

    // Responses already queued are written even when reading failed.
    let written = writer_task
        .await
        .map_err(|_| ProtocolError::WriterStopped)?;
    read.and(written)
}

async fn read_requests<R>(
    lane: &CompileLane,
    mut reader: R,
    pending: &mpsc::UnboundedSender<BoxFuture<'static, Response>>,
) -> Result<(), ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(());
        }
        let line = match std::str::from_utf8(&buf) {
            Ok(line) => line.trim(),
            Err(err) => {
                debug!(error = %err, "ignoring message that is not valid UTF-8");
                continue;
            }
        };
        if line.is_empty() {
            continue;
        }
        if let Some(response) = dispatch(lane, line) {
            if pending.send(response).is_err() {
                return Ok(());
            }
        }
    }
}

async fn write_responses<W>(
    mut pending: mpsc::UnboundedReceiver<BoxFuture<'static, Response>>,
    mut writer: W,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = pending.recv().await {
        let response = response.await;
        let mut line = serde_json::to_vec(&response)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
        debug!(id = response.id(), "response written");
    }
    writer.shutdown().await?;
    Ok(())
}

mod base64_opt {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|encoded| STANDARD.decode(encoded).map_err(serde::de::Error::custom))
            .transpose()
    }
}

mod base64_map {
    use std::collections::BTreeMap;

    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &BTreeMap<String, Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(value.len()))?;
        for (path, bytes) in value {
            map.serialize_entry(path, &STANDARD.encode(bytes))?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, Vec<u8>>, D::Error> {
        BTreeMap::<String, String>::deserialize(deserializer)?
            .into_iter()
            .map(|(path, encoded)| {
                STANDARD
                    .decode(encoded)
                    .map(|bytes| (path, bytes))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_compile_request() {
        let raw = json!({
            "type": "compile",
            "id": "7",
            "files": {"main.typ": "= Hi"},
            "mainFile": "main.typ",
            "images": {"logo.png": "AQID"}
        })
        .to_string();

        match decode(&raw) {
            Decoded::Request(Request::Compile(request)) => {
                assert_eq!(request.id, "7");
                assert_eq!(request.main_file, "main.typ");
                assert_eq!(request.images["logo.png"], vec![1, 2, 3]);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn test_images_are_optional() {
        let raw = r#"{"type":"compile","id":"1","files":{"main.typ":"= Hello"},"mainFile":"main.typ"}"#;
        match decode(raw) {
            Decoded::Request(Request::Compile(request)) => assert!(request.images.is_empty()),
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn test_missing_or_unknown_type_is_ignored() {
        assert_eq!(decode(r#"{"id":"1","files":{},"mainFile":"a"}"#), Decoded::Ignored);
        assert_eq!(decode(r#"{"type":"render","id":"1"}"#), Decoded::Ignored);
        assert_eq!(decode(r#"{"type":7}"#), Decoded::Ignored);
        assert_eq!(decode("not json"), Decoded::Ignored);
    }

    #[test]
    fn test_bad_body_with_id_is_rejected() {
        match decode(r#"{"type":"compile","id":"9","files":"nope","mainFile":"a"}"#) {
            Decoded::Rejected(response) => {
                assert_eq!(response.id(), "9");
                let Response::CompileResult(body) = response;
                assert!(!body.ok);
                assert!(body.diagnostics.is_empty());
            }
            other => panic!("unexpected decode: {other:?}"),
        }
        assert_eq!(decode(r#"{"type":"compile"}"#), Decoded::Ignored);
    }

    #[test]
    fn test_reset_message() {
        assert_eq!(decode(r#"{"type":"reset"}"#), Decoded::Request(Request::Reset));
    }

    #[test]
    fn test_success_response_shape() {
        let response = Response::from_outcome(
            "1".to_string(),
            CompileOutcome::Compiled {
                artifact: b"%PDF".to_vec(),
                diagnostics: vec![],
            },
        );
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "compile-result",
                "id": "1",
                "ok": true,
                "pdf": "JVBERg==",
                "diagnostics": []
            })
        );
    }

    #[test]
    fn test_failure_response_shape() {
        let response = Response::from_outcome(
            "2".to_string(),
            CompileOutcome::Failed {
                message: "main.typ:1:2: error: unknown variable".to_string(),
                diagnostics: vec!["main.typ:1:2: error: unknown variable".to_string()],
            },
        );
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["type"], "compile-result");
        assert_eq!(value["ok"], false);
        assert!(value.get("pdf").is_none());
        assert_eq!(value["diagnostics"].as_array().unwrap().len(), 1);

        let back: Response = serde_json::from_value(value).unwrap();
        assert_eq!(back, response);
    }
}
