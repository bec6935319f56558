//! Server-sent events for `POST /v1/execute/stream`.
//!
//! A run emits any number of `output` events (`{"stream", "data"}`) while the
//! interpreter is running, then exactly one `result` event carrying what
//! `/v1/execute` returns minus the output, or one `error` event with a
//! `detail` when the run fails after streaming has begun.

use std::convert::Infallible;
use std::sync::Arc;

use axum::response::sse::Event;
use futures_util::Stream;
use sandbox::{OutputChunk, OutputStream};
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::ServiceError;
use crate::service::{ExecutionService, PreparedRequest};
use crate::types::{ExecuteResponse, WorkspaceFile};

/// Incremental UTF-8 decoding for one output stream.
///
/// A sequence split across chunks is held back until it completes. Invalid
/// bytes decode to U+FFFD, the same as the buffered response.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn push(&mut self, data: &[u8]) -> String {
        self.pending.extend_from_slice(data);
        let buf = std::mem::take(&mut self.pending);
        let mut text = String::new();
        let mut rest: &[u8] = &buf;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = after.get(len..).unwrap_or_default();
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        self.pending = rest.to_vec();
        text
    }

    /// Whatever is still held back, decoded lossily.
    pub fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Final event of a successful stream.
#[derive(Debug, Serialize)]
struct StreamResult {
    exit_code: i32,
    timed_out: bool,
    duration_ms: u64,
    files: Vec<WorkspaceFile>,
}

impl From<ExecuteResponse> for StreamResult {
    fn from(response: ExecuteResponse) -> Self {
        Self {
            exit_code: response.exit_code,
            timed_out: response.timed_out,
            duration_ms: response.duration_ms,
            files: response.files,
        }
    }
}

fn stream_name(stream: OutputStream) -> &'static str {
    match stream {
        OutputStream::Stdout => "stdout",
        OutputStream::Stderr => "stderr",
    }
}

fn output_event(stream: OutputStream, text: &str) -> Event {
    let data = json!({ "stream": stream_name(stream), "data": text });
    Event::default().event("output").data(data.to_string())
}

fn error_event(detail: &str) -> Event {
    Event::default()
        .event("error")
        .data(json!({ "detail": detail }).to_string())
}

fn result_event(response: ExecuteResponse) -> Event {
    match serde_json::to_string(&StreamResult::from(response)) {
        Ok(data) => Event::default().event("result").data(data),
        Err(e) => error_event(&format!("encode result: {e}")),
    }
}

/// Turns output chunks into `output` events, decoding each stream separately.
struct OutputEvents {
    stdout: Utf8Decoder,
    stderr: Utf8Decoder,
    events: mpsc::UnboundedSender<Event>,
}

impl OutputEvents {
    fn decoder(&mut self, stream: OutputStream) -> &mut Utf8Decoder {
        match stream {
            OutputStream::Stdout => &mut self.stdout,
            OutputStream::Stderr => &mut self.stderr,
        }
    }

    fn emit(&self, stream: OutputStream, text: &str) {
        if !text.is_empty() {
            let _ = self.events.send(output_event(stream, text));
        }
    }

    fn chunk(&mut self, chunk: OutputChunk) {
        let text = self.decoder(chunk.stream).push(&chunk.data);
        self.emit(chunk.stream, &text);
    }

    fn finish(&mut self) {
        for stream in [OutputStream::Stdout, OutputStream::Stderr] {
            let text = self.decoder(stream).finish();
            self.emit(stream, &text);
        }
    }
}

/// Run `prepared` and send its events, ending with `result` or `error`.
async fn produce(
    service: Arc<ExecutionService>,
    prepared: PreparedRequest,
    events: mpsc::UnboundedSender<Event>,
) {
    let (tx, mut chunks) = mpsc::unbounded_channel();
    let mut output = OutputEvents {
        stdout: Utf8Decoder::default(),
        stderr: Utf8Decoder::default(),
        events: events.clone(),
    };

    let run = service.run(prepared, Some(tx));
    tokio::pin!(run);
    let result = loop {
        tokio::select! {
            Some(chunk) = chunks.recv() => output.chunk(chunk),
            result = &mut run => break result,
        }
    };
    while let Ok(chunk) = chunks.try_recv() {
        output.chunk(chunk);
    }
    output.finish();

    let last = match result {
        Ok(response) => result_event(response),
        Err(e) => {
            log_failure(&e);
            error_event(&e.to_string())
        }
    };
    let _ = events.send(last);
}

fn log_failure(err: &ServiceError) {
    let status = err.status();
    if status.is_server_error() {
        warn!(status = status.as_u16(), error = %err, "streamed request failed");
    } else {
        debug!(status = status.as_u16(), error = %err, "streamed request rejected");
    }
}

/// The running request, aborted when the client goes away.
struct RunTask(JoinHandle<()>);

impl Drop for RunTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Start `prepared` in the background and return its event stream.
///
/// Dropping the stream aborts the run; its environment is then torn down the
/// same way as for a cancelled `/v1/execute` request.
pub fn events(
    service: Arc<ExecutionService>,
    prepared: PreparedRequest,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = RunTask(tokio::spawn(produce(service, prepared, tx)));
    futures_util::stream::unfold((rx, task), |(mut rx, task)| async move {
        let event = rx.recv().await?;
        Some((Ok(event), (rx, task)))
    })
}
