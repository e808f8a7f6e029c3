use crate::upstream::StreamEvent;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::Response;
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tokio_util::sync::DropGuard;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Wire dialect for one SSE stream.
pub enum SseDialect {
    /// `data: {"content": "...", "done": false}` frames.
    Native,
    /// OpenAI `chat.completion.chunk` frames.
    OpenAi {
        id: String,
        model: String,
        created: u64,
    },
}

const DONE_FRAME: &str = "data: [DONE]\n\n";

fn frame_bytes(json: &serde_json::Value) -> Bytes {
    Bytes::from(format!("data: {}\n\n", json))
}

impl SseDialect {
    fn chunk_frame(&self, content: &str) -> Bytes {
        match self {
            SseDialect::Native => frame_bytes(&serde_json::json!({
                "content": content,
                "done": false,
            })),
            SseDialect::OpenAi { id, model, created } => frame_bytes(&serde_json::json!({
                "id": id,
                "object": "chat.completion.chunk",
                "created": created,
                "model": model,
                "choices": [{
                    "index": 0,
                    "delta": { "content": content },
                    "finish_reason": null,
                }],
            })),
        }
    }

    fn end_frame(&self) -> Bytes {
        match self {
            SseDialect::Native => frame_bytes(&serde_json::json!({
                "content": "",
                "done": true,
            })),
            SseDialect::OpenAi { id, model, created } => frame_bytes(&serde_json::json!({
                "id": id,
                "object": "chat.completion.chunk",
                "created": created,
                "model": model,
                "choices": [{
                    "index": 0,
                    "delta": {},
                    "finish_reason": "stop",
                }],
            })),
        }
    }

    fn error_frame(&self, message: &str) -> Bytes {
        frame_bytes(&serde_json::json!({ "error": message }))
    }
}

struct SseState {
    rx: mpsc::Receiver<StreamEvent>,
    dialect: SseDialect,
    /// Frames queued faster than the unfold yields them.
    pending: VecDeque<Bytes>,
    finished: bool,
    /// Cancels the upstream call when the client drops the body.
    _cancel_guard: Option<DropGuard>,
}

/// Bridge a stream-event channel into an SSE response body.
///
/// The body ends with `data: [DONE]\n\n` in every outcome; a mid-stream
/// error becomes a final `{"error": ...}` event before the terminator.
/// Dropping the body (client disconnect) releases the guard and cancels the
/// in-flight upstream call.
pub fn sse_body(
    rx: mpsc::Receiver<StreamEvent>,
    dialect: SseDialect,
    cancel_guard: Option<DropGuard>,
) -> BoxBody {
    let state = SseState {
        rx,
        dialect,
        pending: VecDeque::new(),
        finished: false,
        _cancel_guard: cancel_guard,
    };

    let stream = futures_util::stream::unfold(state, |mut s| async move {
        loop {
            if let Some(bytes) = s.pending.pop_front() {
                let frame: Result<Frame<Bytes>, hyper::Error> = Ok(Frame::data(bytes));
                return Some((frame, s));
            }
            if s.finished {
                return None;
            }
            match s.rx.recv().await {
                Some(StreamEvent::Chunk(content)) => {
                    s.pending.push_back(s.dialect.chunk_frame(&content));
                }
                Some(StreamEvent::End { .. }) => {
                    s.pending.push_back(s.dialect.end_frame());
                    s.pending.push_back(Bytes::from_static(DONE_FRAME.as_bytes()));
                    s.finished = true;
                }
                Some(StreamEvent::Error(err)) => {
                    s.pending.push_back(s.dialect.error_frame(&err.to_string()));
                    s.pending.push_back(Bytes::from_static(DONE_FRAME.as_bytes()));
                    s.finished = true;
                }
                None => {
                    // Producer went away without an End; close out cleanly.
                    s.pending.push_back(Bytes::from_static(DONE_FRAME.as_bytes()));
                    s.finished = true;
                }
            }
        }
    });

    BodyExt::boxed(StreamBody::new(stream))
}

/// Standard SSE response envelope with the request ID echoed.
pub fn sse_response(request_id: &str, body: BoxBody) -> Response<BoxBody> {
    Response::builder()
        .status(200)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("x-request-id", request_id)
        .body(body)
        .unwrap_or_else(|_| Response::new(full_body("")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use http_body_util::BodyExt;

    async fn collect(body: BoxBody) -> String {
        let collected = body.collect().await.unwrap();
        String::from_utf8(collected.to_bytes().to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_native_stream_framing() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(StreamEvent::Chunk("hel".into())).await.unwrap();
        tx.send(StreamEvent::Chunk("lo".into())).await.unwrap();
        tx.send(StreamEvent::End { duration_ms: 5 }).await.unwrap();
        drop(tx);

        let out = collect(sse_body(rx, SseDialect::Native, None)).await;
        assert!(out.contains(r#"data: {"content":"hel","done":false}"#));
        assert!(out.contains(r#"data: {"content":"lo","done":false}"#));
        assert!(out.contains(r#""done":true"#));
        assert!(out.ends_with("data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn test_error_becomes_final_event() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(StreamEvent::Chunk("partial".into())).await.unwrap();
        tx.send(StreamEvent::Error(GatewayError::Upstream("boom".into())))
            .await
            .unwrap();
        drop(tx);

        let out = collect(sse_body(rx, SseDialect::Native, None)).await;
        assert!(out.contains(r#""error""#));
        assert!(out.ends_with("data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn test_producer_drop_still_terminates() {
        let (tx, rx) = mpsc::channel(8);
        drop(tx);
        let out = collect(sse_body(rx, SseDialect::Native, None)).await;
        assert_eq!(out, "data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn test_openai_chunk_shape() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(StreamEvent::Chunk("hi".into())).await.unwrap();
        tx.send(StreamEvent::End { duration_ms: 5 }).await.unwrap();
        drop(tx);

        let dialect = SseDialect::OpenAi {
            id: "chatcmpl-abc123".into(),
            model: "llama3".into(),
            created: 1_700_000_000,
        };
        let out = collect(sse_body(rx, dialect, None)).await;
        assert!(out.contains("chat.completion.chunk"));
        assert!(out.contains(r#""finish_reason":"stop""#));
        assert!(out.ends_with("data: [DONE]\n\n"));
    }
}
