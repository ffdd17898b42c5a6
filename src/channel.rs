//! Caller-side handle on a running research request

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::stream::StreamFrame;

/// Receives the frames of one request and can cancel it.
///
/// Once [`cancel`](Self::cancel) is called, queued deltas are discarded and
/// only the terminal frame is still delivered.
pub struct ResearchChannel {
    query_id: Uuid,
    message_id: String,
    frames: mpsc::UnboundedReceiver<StreamFrame>,
    cancel: CancellationToken,
    finished: bool,
}

impl ResearchChannel {
    pub(crate) fn new(
        query_id: Uuid,
        message_id: String,
        frames: mpsc::UnboundedReceiver<StreamFrame>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            query_id,
            message_id,
            frames,
            cancel,
            finished: false,
        }
    }

    pub fn query_id(&self) -> Uuid {
        self.query_id
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Next frame; `None` after the terminal frame
    pub async fn recv(&mut self) -> Option<StreamFrame> {
        if self.finished {
            return None;
        }
        loop {
            let frame = self.frames.recv().await?;
            if let Some(frame) = self.accept(frame) {
                return Some(frame);
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv)
    pub fn try_recv(&mut self) -> Option<StreamFrame> {
        if self.finished {
            return None;
        }
        loop {
            let frame = self.frames.try_recv().ok()?;
            if let Some(frame) = self.accept(frame) {
                return Some(frame);
            }
        }
    }

    fn accept(&mut self, frame: StreamFrame) -> Option<StreamFrame> {
        if frame.is_terminal() {
            self.finished = true;
            return Some(frame);
        }
        if self.cancel.is_cancelled() {
            return None;
        }
        Some(frame)
    }

    /// Ask the request to stop; the stream still ends with a terminal frame
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this request, for wiring into other shutdown paths
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Drain the stream, concatenating deltas.
    ///
    /// Returns the reconstructed text and the terminal frame, if one arrived.
    pub async fn collect_text(mut self) -> (String, Option<StreamFrame>) {
        let mut text = String::new();
        while let Some(frame) = self.recv().await {
            match frame {
                StreamFrame::Delta { delta, .. } => text.push_str(&delta),
                frame if frame.is_terminal() => return (text, Some(frame)),
                _ => {}
            }
        }
        (text, None)
    }
}
