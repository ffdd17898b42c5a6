//! Public entry point - accepts research requests and streams their reports

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::channel::ResearchChannel;
use crate::config::ResearchConfig;
use crate::controller::RoundController;
use crate::error::ResearchError;
use crate::limiter::RateLimiter;
use crate::provider::Collaborators;
use crate::report::{Report, Snapshot};
use crate::session::{ResearchSession, SessionHandle};
use crate::stream::{CancelReason, DeltaStreamer, StreamFrame};
use crate::synthesizer::Synthesizer;
use crate::types::{ResearchQuery, ResearchRequest};

/// The research orchestrator
///
/// Owns the collaborators and the outbound rate limiter shared by every
/// request it starts. Each request runs on its own task.
pub struct ResearchOrchestrator {
    config: Arc<ResearchConfig>,
    collaborators: Collaborators,
    limiter: RateLimiter,
    /// Requests still running
    active: Arc<RwLock<HashMap<Uuid, SessionHandle>>>,
}

impl ResearchOrchestrator {
    pub fn new(
        config: ResearchConfig,
        collaborators: Collaborators,
    ) -> Result<Self, ResearchError> {
        config.validate()?;
        let limiter = RateLimiter::new(config.rate_limit);

        Ok(Self {
            config: Arc::new(config),
            collaborators,
            limiter,
            active: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Share an outbound limiter with other orchestrators
    pub fn with_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn config(&self) -> &ResearchConfig {
        &self.config
    }

    fn open_session(&self, request: &ResearchRequest) -> Result<SessionHandle, ResearchError> {
        let query = ResearchQuery::new(&request.query)?;
        Ok(SessionHandle::new(ResearchSession::new(
            query,
            request.mode,
            Arc::clone(&self.config),
            self.collaborators.clone(),
            self.limiter.clone(),
            CancellationToken::new(),
        )))
    }

    /// Start a request and return the channel its frames arrive on.
    ///
    /// The stream opens with `text-start` and always ends with exactly one
    /// of `text-end`, `error` or `cancelled`.
    #[instrument(skip_all, fields(mode = ?request.mode))]
    pub fn start(&self, request: ResearchRequest) -> Result<ResearchChannel, ResearchError> {
        let session = self.open_session(&request)?;
        let query_id = session.id();
        let message_id = request
            .message_id
            .unwrap_or_else(|| format!("msg-{}", query_id.simple()));

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let cancel = session.cancel_token().clone();
        let channel = ResearchChannel::new(query_id, message_id.clone(), frames_rx, cancel);

        self.active.write().insert(query_id, session.clone());
        let active = Arc::clone(&self.active);
        let deadline = self.config.request_timeout();

        tokio::spawn(async move {
            drive(session, message_id, frames_tx, deadline).await;
            active.write().remove(&query_id);
        });

        info!(query_id = %query_id, "Research request started");
        Ok(channel)
    }

    /// Run a request to completion without streaming
    #[instrument(skip_all, fields(mode = ?request.mode))]
    pub async fn research(&self, request: ResearchRequest) -> Result<Report, ResearchError> {
        let session = self.open_session(&request)?;
        let (snapshots, _) = mpsc::unbounded_channel();
        let mut synthesizer = Synthesizer::new(snapshots);
        let mut controller = RoundController::new(session.clone());

        let run = controller.run(&mut synthesizer);
        match self.config.request_timeout() {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result,
                Err(_) => {
                    session.cancel_token().cancel();
                    Err(ResearchError::TimedOut(limit.as_millis() as u64))
                }
            },
            None => run.await,
        }
    }

    /// Cancel a running request; false if it is unknown or already finished
    pub fn cancel(&self, query_id: &Uuid) -> bool {
        match self.active.read().get(query_id) {
            Some(session) => {
                session.cancel_token().cancel();
                true
            }
            None => false,
        }
    }

    /// Ids of requests still running
    pub fn active_requests(&self) -> Vec<Uuid> {
        self.active.read().keys().copied().collect()
    }
}

/// Run one request, forwarding its snapshots as delta frames
#[instrument(skip_all, fields(query_id = %session.id(), message_id = %message_id))]
async fn drive(
    session: SessionHandle,
    message_id: String,
    frames: mpsc::UnboundedSender<StreamFrame>,
    deadline: Option<Duration>,
) {
    if frames
        .send(StreamFrame::Start {
            id: message_id.clone(),
        })
        .is_err()
    {
        debug!("Caller went away before the stream started");
        session.cancel_token().cancel();
        return;
    }

    let (snapshots_tx, snapshots_rx) = mpsc::unbounded_channel();
    let mut synthesizer = Synthesizer::new(snapshots_tx);
    let mut controller = RoundController::new(session.clone());
    let cancel = session.cancel_token().clone();

    let terminal = pump(
        controller.run(&mut synthesizer),
        snapshots_rx,
        DeltaStreamer::new(message_id),
        &frames,
        &cancel,
        deadline,
    )
    .await;

    if frames.send(terminal).is_err() {
        debug!("Caller went away before the terminal frame");
    }
}

/// Forward snapshots as deltas until `run` finishes, the request is
/// cancelled, or the deadline passes. Returns the terminal frame.
async fn pump<F>(
    run: F,
    mut snapshots: mpsc::UnboundedReceiver<Snapshot>,
    mut streamer: DeltaStreamer,
    frames: &mpsc::UnboundedSender<StreamFrame>,
    cancel: &CancellationToken,
    deadline: Option<Duration>,
) -> StreamFrame
where
    F: Future<Output = Result<Report, ResearchError>>,
{
    let id = streamer.message_id().to_string();
    let expired = async {
        match deadline {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(run);
    tokio::pin!(expired);

    let outcome = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(chunks = streamer.chunks_emitted(), "Stream cancelled by caller");
                return StreamFrame::Cancelled { id, reason: CancelReason::Caller };
            }
            _ = &mut expired => {
                cancel.cancel();
                warn!(chunks = streamer.chunks_emitted(), "Request deadline passed");
                return StreamFrame::Cancelled { id, reason: CancelReason::Timeout };
            }
            Some(snapshot) = snapshots.recv() => {
                if let Err(frame) = forward(&mut streamer, &snapshot, frames, cancel) {
                    return frame;
                }
            }
            outcome = &mut run => break outcome,
        }
    };

    // The run may have published more than was forwarded before it finished
    while let Ok(snapshot) = snapshots.try_recv() {
        if cancel.is_cancelled() {
            return StreamFrame::Cancelled {
                id,
                reason: CancelReason::Caller,
            };
        }
        if let Err(frame) = forward(&mut streamer, &snapshot, frames, cancel) {
            return frame;
        }
    }

    match outcome {
        Ok(_) => {
            info!(chunks = streamer.chunks_emitted(), "Stream complete");
            StreamFrame::End { id }
        }
        Err(ResearchError::Cancelled) => StreamFrame::Cancelled {
            id,
            reason: CancelReason::Caller,
        },
        Err(e) => {
            error!(error = %e, "Research request failed");
            StreamFrame::Error {
                id,
                message: e.to_string(),
            }
        }
    }
}

/// Send the delta for one snapshot. An integrity violation cancels the run
/// and yields the error frame to end the stream with.
fn forward(
    streamer: &mut DeltaStreamer,
    snapshot: &Snapshot,
    frames: &mpsc::UnboundedSender<StreamFrame>,
    cancel: &CancellationToken,
) -> Result<(), StreamFrame> {
    match streamer.push(snapshot) {
        Ok(Some(chunk)) => {
            if frames.send(chunk.into()).is_err() {
                debug!("Caller dropped the channel, cancelling");
                cancel.cancel();
            }
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(e) => {
            cancel.cancel();
            let err = ResearchError::from(e);
            error!(error = %err, "Aborting stream");
            Err(StreamFrame::Error {
                id: streamer.message_id().to_string(),
                message: err.to_string(),
            })
        }
    }
}
