//! Deadlines for streamed upstream response bodies.
//!
//! An upstream that stalls mid-body would otherwise hold the client
//! connection open indefinitely. [`DeadlineBody`] fails the stream once the
//! upstream stays silent for longer than the idle deadline (`READ_TIMEOUT`)
//! or the whole body takes longer than the total deadline (`WRITE_TIMEOUT`).
//! Time the client spends not reading does not count towards the idle
//! deadline.

use crate::error::ProxyError;
use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep, sleep};

/// Deadlines applied to one streamed body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDeadlines {
    /// Longest wait for the next frame.
    pub idle: Duration,
    /// Longest time for the entire body.
    pub total: Duration,
}

impl StreamDeadlines {
    pub fn new(idle: Duration, total: Duration) -> Self {
        Self { idle, total }
    }
}

/// Body wrapper that enforces [`StreamDeadlines`].
///
/// The total timer starts on the first poll, not on construction. The idle
/// timer only runs while the inner body is pending.
#[derive(Debug)]
pub struct DeadlineBody<B> {
    inner: B,
    deadlines: StreamDeadlines,
    idle_timer: Pin<Box<Sleep>>,
    total_timer: Pin<Box<Sleep>>,
    started: bool,
    waiting: bool,
    expired: bool,
}

impl<B> DeadlineBody<B> {
    pub fn new(inner: B, deadlines: StreamDeadlines) -> Self {
        Self {
            inner,
            deadlines,
            idle_timer: Box::pin(sleep(deadlines.idle)),
            total_timer: Box::pin(sleep(deadlines.total)),
            started: false,
            waiting: false,
            expired: false,
        }
    }

    fn timed_out(&mut self, which: &str, limit: Duration) -> ProxyError {
        self.expired = true;
        ProxyError::UpstreamTimeout(format!(
            "{} deadline of {:?} exceeded while streaming upstream body",
            which, limit
        ))
    }
}

impl<B> Body for DeadlineBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<ProxyError>,
{
    type Data = Bytes;
    type Error = ProxyError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;

        if this.expired {
            return Poll::Ready(None);
        }

        if !this.started {
            this.started = true;
            this.total_timer
                .as_mut()
                .reset(Instant::now() + this.deadlines.total);
        }

        if this.total_timer.as_mut().poll(cx).is_ready() {
            let limit = this.deadlines.total;
            return Poll::Ready(Some(Err(this.timed_out("total", limit))));
        }

        if let Poll::Ready(result) = Pin::new(&mut this.inner).poll_frame(cx) {
            this.waiting = false;
            return Poll::Ready(result.map(|r| r.map_err(Into::into)));
        }

        // Upstream has nothing for us: start counting its silence.
        if !this.waiting {
            this.waiting = true;
            this.idle_timer
                .as_mut()
                .reset(Instant::now() + this.deadlines.idle);
        }

        if this.idle_timer.as_mut().poll(cx).is_ready() {
            let limit = this.deadlines.idle;
            return Poll::Ready(Some(Err(this.timed_out("idle", limit))));
        }

        Poll::Pending
    }

    fn is_end_stream(&self) -> bool {
        self.expired || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
