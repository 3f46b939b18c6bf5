//! One download session: the bytes handed to the transport are counted as
//! they are pulled, and the lease is settled exactly once whichever way the
//! stream ends.
//!
//! A chunk counts as delivered once the transport polls for the next one.
//! The final chunk counts when the transport polls past the end, or when it
//! drops the body after taking every byte of the interval (hyper stops
//! polling once `Content-Length` bytes are written). A chunk still in flight
//! when the client goes away mid-interval is not counted.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use futures_util::Stream;
use parcel_core::{ByteRange, ReleaseOutcome};
use parcel_kernel::{Lease, ReleaseResult};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::dispatch::CompletionDispatcher;
use crate::leases::{token_tag, LeaseManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionEnd {
    /// The last byte of the interval was handed to the transport.
    Finished,
    /// The response body was dropped before the end.
    Disconnected,
    /// Reading the asset failed mid-stream.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SettleReport {
    /// Outcome this settlement applied, if it won the release.
    pub released: Option<ReleaseOutcome>,
    pub covered: u64,
}

/// Owner of an acquired lease until it is settled.
///
/// Settling runs on the task tracker, so a caller that stops awaiting it does
/// not cut the release short. Dropping an unsettled guard releases the lease
/// as a disconnect with nothing delivered.
pub(crate) struct Settlement {
    inner: Option<SettleTask>,
    tasks: TaskTracker,
}

struct SettleTask {
    leases: LeaseManager,
    dispatcher: Arc<CompletionDispatcher>,
    lease: Lease,
    interval: ByteRange,
    resource_len: u64,
}

impl Settlement {
    pub(crate) fn new(
        leases: LeaseManager,
        dispatcher: Arc<CompletionDispatcher>,
        lease: Lease,
        interval: ByteRange,
        resource_len: u64,
        tasks: TaskTracker,
    ) -> Self {
        Self {
            inner: Some(SettleTask {
                leases,
                dispatcher,
                lease,
                interval,
                resource_len,
            }),
            tasks,
        }
    }

    /// Bytes the session is expected to hand over.
    pub(crate) fn expected(&self) -> u64 {
        self.inner.as_ref().map(|t| t.interval.len()).unwrap_or(0)
    }

    /// Record the first `flushed` bytes of the interval and release the lease.
    ///
    /// Only a clean finish with full coverage completes the token; every other
    /// ending pauses it, even when coverage happens to be full.
    pub(crate) async fn settle(mut self, flushed: u64, end: SessionEnd) -> SettleReport {
        let Some(handle) = self.spawn(flushed, end) else {
            return SettleReport {
                released: None,
                covered: 0,
            };
        };
        handle.await.unwrap_or_else(|err| {
            error!(error = %err, "settlement task failed");
            SettleReport {
                released: None,
                covered: 0,
            }
        })
    }

    fn spawn(&mut self, flushed: u64, end: SessionEnd) -> Option<JoinHandle<SettleReport>> {
        let task = self.inner.take()?;
        if tokio::runtime::Handle::try_current().is_err() {
            warn!(
                tok = %token_tag(&task.lease.token),
                "no runtime to settle lease; it stays locked until restart recovery"
            );
            return None;
        }
        Some(self.tasks.spawn(task.run(flushed, end)))
    }
}

impl Drop for Settlement {
    fn drop(&mut self) {
        if let Some(task) = self.inner.as_ref() {
            debug!(tok = %token_tag(&task.lease.token), "unsettled lease dropped");
            self.spawn(0, SessionEnd::Disconnected);
        }
    }
}

impl SettleTask {
    async fn run(self, flushed: u64, end: SessionEnd) -> SettleReport {
        let tag = token_tag(&self.lease.token);
        let delivered = self.interval.prefix(flushed);
        let coverage = match self.leases.record_delivery(&self.lease, delivered).await {
            Ok(Some(coverage)) => Some(coverage),
            Ok(None) => {
                debug!(tok = %tag, "lease already resolved; skipping settlement");
                return SettleReport {
                    released: None,
                    covered: 0,
                };
            }
            Err(err) => {
                error!(tok = %tag, error = %err, "failed to record coverage");
                None
            }
        };
        let covered = coverage.as_ref().map(|c| c.total_covered()).unwrap_or(0);
        let outcome = match (end, &coverage) {
            (SessionEnd::Finished, Some(c)) if c.is_fully_covered(self.resource_len) => {
                ReleaseOutcome::Completed
            }
            _ => ReleaseOutcome::Paused,
        };

        match self.leases.release(&self.lease, outcome).await {
            Ok(ReleaseResult::Released) => {
                info!(
                    tok = %tag,
                    end = ?end,
                    state = %outcome.state(),
                    delivered = flushed,
                    covered,
                    size = self.resource_len,
                    "download session settled"
                );
                if outcome == ReleaseOutcome::Completed {
                    if let Err(err) = self.dispatcher.dispatch(&self.lease).await {
                        error!(tok = %tag, error = %err, "completion dispatch failed");
                    }
                }
                SettleReport {
                    released: Some(outcome),
                    covered,
                }
            }
            Ok(other) => {
                debug!(tok = %tag, result = ?other, "release was a no-op");
                SettleReport {
                    released: None,
                    covered,
                }
            }
            Err(err) => {
                error!(tok = %tag, error = %err, "failed to release lease");
                SettleReport {
                    released: None,
                    covered,
                }
            }
        }
    }
}

/// Response body stream that settles its lease when it ends or is dropped.
pub(crate) struct TrackedBody<S> {
    inner: S,
    expected: u64,
    pending: u64,
    flushed: u64,
    settlement: Option<Settlement>,
    finishing: Option<JoinHandle<SettleReport>>,
    done: bool,
}

impl<S> TrackedBody<S> {
    pub(crate) fn new(inner: S, settlement: Settlement) -> Self {
        Self {
            inner,
            expected: settlement.expected(),
            pending: 0,
            flushed: 0,
            settlement: Some(settlement),
            finishing: None,
            done: false,
        }
    }

    fn settle_in_background(&mut self, end: SessionEnd) -> Option<JoinHandle<SettleReport>> {
        let mut settlement = self.settlement.take()?;
        settlement.spawn(self.flushed, end)
    }
}

impl<S> Stream for TrackedBody<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(handle) = this.finishing.as_mut() {
                match ready!(Pin::new(handle).poll(cx)) {
                    Ok(report) => debug!(
                        released = ?report.released,
                        covered = report.covered,
                        "session stream finished"
                    ),
                    Err(err) => error!(error = %err, "settlement task failed"),
                }
                this.finishing = None;
                this.done = true;
            }
            if this.done {
                return Poll::Ready(None);
            }

            // Being polled again means the previous chunk was accepted.
            this.flushed += std::mem::take(&mut this.pending);

            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(chunk)) => {
                    this.pending = chunk.len() as u64;
                    return Poll::Ready(Some(Ok(chunk)));
                }
                Some(Err(err)) => {
                    warn!(error = %err, delivered = this.flushed, "asset read failed mid-stream");
                    this.settle_in_background(SessionEnd::Failed);
                    this.done = true;
                    return Poll::Ready(Some(Err(err)));
                }
                None => match this.settle_in_background(SessionEnd::Finished) {
                    Some(handle) => this.finishing = Some(handle),
                    None => this.done = true,
                },
            }
        }
    }
}

impl<S> Drop for TrackedBody<S> {
    fn drop(&mut self) {
        if self.settlement.is_none() {
            return;
        }
        let end = if self.flushed + self.pending >= self.expected {
            self.flushed += std::mem::take(&mut self.pending);
            SessionEnd::Finished
        } else {
            SessionEnd::Disconnected
        };
        self.settle_in_background(end);
    }
}
