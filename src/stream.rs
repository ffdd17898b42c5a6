//! Delta streaming of report snapshots
//!
//! Each snapshot must extend the text already streamed; the difference is
//! sent as one [`DeltaChunk`]. A snapshot that rewrites streamed text stops
//! the stream instead of sending anything the caller could misapply.

use serde::{Deserialize, Serialize};

use crate::error::StreamError;
use crate::report::Snapshot;

/// The suffix `current` adds to `previous`, or `None` if it does not extend it
pub fn append_delta<'a>(previous: &str, current: &'a str) -> Option<&'a str> {
    current.strip_prefix(previous)
}

/// One piece of appended text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaChunk {
    pub delta: String,
    pub sequence: u64,
    pub message_id: String,
}

/// Turns successive snapshots into append-only chunks
#[derive(Debug)]
pub struct DeltaStreamer {
    message_id: String,
    streamed: String,
    last_snapshot: Option<u64>,
    next_sequence: u64,
}

impl DeltaStreamer {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            streamed: String::new(),
            last_snapshot: None,
            next_sequence: 1,
        }
    }

    /// Diff `snapshot` against everything streamed so far.
    ///
    /// Returns `None` when the snapshot adds no text.
    pub fn push(&mut self, snapshot: &Snapshot) -> Result<Option<DeltaChunk>, StreamError> {
        if let Some(previous) = self.last_snapshot {
            if snapshot.sequence <= previous {
                return Err(StreamError::OutOfOrderSnapshot {
                    previous,
                    got: snapshot.sequence,
                });
            }
        }

        let delta = append_delta(&self.streamed, &snapshot.text).ok_or(
            StreamError::IntegrityViolation {
                sequence: snapshot.sequence,
                streamed_len: self.streamed.len(),
            },
        )?;
        self.last_snapshot = Some(snapshot.sequence);

        if delta.is_empty() {
            return Ok(None);
        }

        let chunk = DeltaChunk {
            delta: delta.to_string(),
            sequence: self.next_sequence,
            message_id: self.message_id.clone(),
        };
        self.streamed.push_str(delta);
        self.next_sequence += 1;
        Ok(Some(chunk))
    }

    /// Concatenation of every delta emitted so far
    pub fn streamed(&self) -> &str {
        &self.streamed
    }

    pub fn chunks_emitted(&self) -> u64 {
        self.next_sequence - 1
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }
}

/// Why a stream stopped early
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    Caller,
    Timeout,
}

/// Egress frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamFrame {
    #[serde(rename = "text-start")]
    Start { id: String },
    #[serde(rename = "text-delta")]
    Delta {
        id: String,
        delta: String,
        sequence: u64,
    },
    #[serde(rename = "text-end")]
    End { id: String },
    #[serde(rename = "error")]
    Error { id: String, message: String },
    #[serde(rename = "cancelled")]
    Cancelled { id: String, reason: CancelReason },
}

impl StreamFrame {
    /// Whether this frame ends the stream
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamFrame::End { .. } | StreamFrame::Error { .. } | StreamFrame::Cancelled { .. }
        )
    }

    /// Server-sent-events encoding; terminal frames are followed by `[DONE]`
    pub fn to_sse(&self) -> Result<String, serde_json::Error> {
        let mut out = format!("data: {}\n\n", serde_json::to_string(self)?);
        if self.is_terminal() {
            out.push_str("data: [DONE]\n\n");
        }
        Ok(out)
    }
}

impl From<DeltaChunk> for StreamFrame {
    fn from(chunk: DeltaChunk) -> Self {
        StreamFrame::Delta {
            id: chunk.message_id,
            delta: chunk.delta,
            sequence: chunk.sequence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(sequence: u64, text: &str) -> Snapshot {
        Snapshot {
            sequence,
            version: sequence,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_append_delta() {
        assert_eq!(append_delta("# T", "# T\n\nbody"), Some("\n\nbody"));
        assert_eq!(append_delta("# T", "# T"), Some(""));
        assert_eq!(append_delta("# T", "# U"), None);
    }

    #[test]
    fn test_chunks_reconstruct_document() {
        let mut streamer = DeltaStreamer::new("msg-1");
        let renders = ["", "# T", "# T\n\nHel", "# T\n\nHello", "# T\n\nHello", "# T\n\nHello\n"];

        let mut chunks = Vec::new();
        for (i, text) in renders.iter().enumerate() {
            if let Some(chunk) = streamer.push(&snap(i as u64, text)).unwrap() {
                chunks.push(chunk);
            }
        }

        let rebuilt: String = chunks.iter().map(|c| c.delta.as_str()).collect();
        assert_eq!(rebuilt, "# T\n\nHello\n");
        assert_eq!(streamer.streamed(), rebuilt);
        assert!(chunks.iter().all(|c| !c.delta.is_empty()));
        let sequences: Vec<u64> = chunks.iter().map(|c| c.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4]);
        assert!(chunks.iter().all(|c| c.message_id == "msg-1"));
    }

    #[test]
    fn test_rewrite_is_integrity_violation() {
        let mut streamer = DeltaStreamer::new("m");
        streamer.push(&snap(1, "# Title\n\n## A")).unwrap();

        let err = streamer.push(&snap(2, "# Title\n\n## B changed")).unwrap_err();
        assert_eq!(
            err,
            StreamError::IntegrityViolation {
                sequence: 2,
                streamed_len: 13
            }
        );
        assert_eq!(streamer.streamed(), "# Title\n\n## A");
        assert_eq!(streamer.chunks_emitted(), 1);
    }

    #[test]
    fn test_stale_snapshot_rejected() {
        let mut streamer = DeltaStreamer::new("m");
        streamer.push(&snap(3, "a")).unwrap();
        assert_eq!(
            streamer.push(&snap(3, "ab")),
            Err(StreamError::OutOfOrderSnapshot { previous: 3, got: 3 })
        );
    }

    #[test]
    fn test_frame_wire_format() {
        let frame: StreamFrame = DeltaChunk {
            delta: "hi".into(),
            sequence: 4,
            message_id: "m".into(),
        }
        .into();
        assert_eq!(
            frame.to_sse().unwrap(),
            "data: {\"type\":\"text-delta\",\"id\":\"m\",\"delta\":\"hi\",\"sequence\":4}\n\n"
        );

        let end = StreamFrame::End { id: "m".into() };
        assert_eq!(
            end.to_sse().unwrap(),
            "data: {\"type\":\"text-end\",\"id\":\"m\"}\n\ndata: [DONE]\n\n"
        );

        let cancelled = StreamFrame::Cancelled {
            id: "m".into(),
            reason: CancelReason::Timeout,
        };
        assert!(cancelled.is_terminal());
        assert_eq!(
            serde_json::to_string(&cancelled).unwrap(),
            "{\"type\":\"cancelled\",\"id\":\"m\",\"reason\":\"timeout\"}"
        );
    }
}
