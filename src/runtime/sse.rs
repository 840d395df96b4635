//! Decoding of the repair progress stream.
//!
//! The runtime sends one JSON object per `data:` line. Bytes arrive in
//! arbitrary chunks, so lines are reassembled across chunk boundaries before
//! parsing. A frame that fails to parse is skipped and logged; it never ends
//! the stream.

use futures::{Stream, StreamExt};
use std::collections::VecDeque;
use tracing::{debug, warn};

use super::types::ProgressFrame;
use crate::error::{RuntimeError, RuntimeResult};

/// Incremental `data: <json>` line decoder
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    skipped: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every frame completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ProgressFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(frame) = self.parse_line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Vec<ProgressFrame> {
        let rest = std::mem::take(&mut self.buffer);
        self.parse_line(&rest).into_iter().collect()
    }

    /// Number of malformed frames dropped so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn parse_line(&mut self, raw: &[u8]) -> Option<ProgressFrame> {
        let text = String::from_utf8_lossy(raw);
        let line = text.trim();
        let data = line.strip_prefix("data:")?.trim_start();

        if data.is_empty() || data == "[DONE]" {
            return None;
        }

        match serde_json::from_str::<ProgressFrame>(data) {
            Ok(frame) => Some(frame),
            Err(e) => {
                self.skipped += 1;
                warn!(
                    error = %e,
                    frame = %data.chars().take(120).collect::<String>(),
                    "Skipping malformed progress frame"
                );
                None
            }
        }
    }
}

/// Turn a byte stream into a stream of parsed frames.
///
/// A transport error is yielded once and ends the stream.
pub fn decode_frames<S, B, E>(bytes: S) -> impl Stream<Item = RuntimeResult<ProgressFrame>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = (
        Box::pin(bytes),
        FrameDecoder::new(),
        VecDeque::<RuntimeResult<ProgressFrame>>::new(),
        false,
    );

    futures::stream::unfold(state, |(mut bytes, mut decoder, mut pending, mut done)| async move {
        loop {
            if let Some(item) = pending.pop_front() {
                return Some((item, (bytes, decoder, pending, done)));
            }
            if done {
                debug!(skipped = decoder.skipped(), "Progress stream ended");
                return None;
            }

            match bytes.next().await {
                Some(Ok(chunk)) => pending.extend(decoder.push(chunk.as_ref()).into_iter().map(Ok)),
                Some(Err(e)) => {
                    pending.push_back(Err(RuntimeError::Stream {
                        message: e.to_string(),
                    }));
                    done = true;
                }
                None => {
                    pending.extend(decoder.finish().into_iter().map(Ok));
                    done = true;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::types::FrameStatus;

    #[test]
    fn test_frames_split_across_chunks() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"data: {\"status\":\"anal").is_empty());
        let frames = decoder.push(b"yzing\"}\n\ndata: {\"status\":\"testing\",\"iteration\":1}\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].status, FrameStatus::Analyzing);
        assert_eq!(frames[1].iteration, Some(1));
    }

    #[test]
    fn test_malformed_frame_is_skipped() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(
            b"data: {not json}\ndata: {\"status\":\"success\"}\n: keep-alive\nevent: progress\n",
        );
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].status, FrameStatus::Success);
        assert_eq!(decoder.skipped(), 1);
    }

    #[test]
    fn test_crlf_and_done_marker() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(b"data: {\"status\":\"retesting\"}\r\ndata: [DONE]\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(decoder.skipped(), 0);
    }

    #[test]
    fn test_finish_flushes_unterminated_line() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"data: {\"status\":\"complete\"}").is_empty());
        let frames = decoder.finish();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].status, FrameStatus::Complete);
    }

    #[tokio::test]
    async fn test_decode_frames_over_stream() {
        let chunks: Vec<Result<Vec<u8>, String>> = vec![
            Ok(b"data: {\"status\":\"started\",\"session_id\":\"r1\"}\n".to_vec()),
            Ok(b"data: garbage\ndata: {\"status\":\"success\"}".to_vec()),
        ];
        let frames: Vec<_> = decode_frames(futures::stream::iter(chunks)).collect().await;
        assert_eq!(frames.len(), 2);
        assert_eq!(
            frames[0].as_ref().unwrap().session_id.as_deref(),
            Some("r1")
        );
        assert_eq!(frames[1].as_ref().unwrap().status, FrameStatus::Success);
    }

    #[tokio::test]
    async fn test_decode_frames_transport_error_ends_stream() {
        let chunks: Vec<Result<Vec<u8>, String>> = vec![
            Ok(b"data: {\"status\":\"testing\"}\n".to_vec()),
            Err("connection reset".to_string()),
            Ok(b"data: {\"status\":\"success\"}\n".to_vec()),
        ];
        let frames: Vec<_> = decode_frames(futures::stream::iter(chunks)).collect().await;
        assert_eq!(frames.len(), 2);
        assert!(frames[0].is_ok());
        assert!(matches!(frames[1], Err(RuntimeError::Stream { .. })));
    }
}
