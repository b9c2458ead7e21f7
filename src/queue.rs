//! FIFO admission queue for captures that arrive while every context is busy

use crate::{Artifact, CaptureRequest, ScreenshotError};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

pub type CaptureResponse = Result<Artifact, ScreenshotError>;

/// An inbound request paired with the channel its response goes out on.
#[derive(Debug)]
pub struct AdmissionEntry {
    pub request: CaptureRequest,
    pub responder: oneshot::Sender<CaptureResponse>,
    pub enqueued_at: Instant,
}

impl AdmissionEntry {
    pub fn new(request: CaptureRequest, responder: oneshot::Sender<CaptureResponse>) -> Self {
        Self {
            request,
            responder,
            enqueued_at: Instant::now(),
        }
    }

    pub fn waited(&self) -> Duration {
        self.enqueued_at.elapsed()
    }

    /// Answers the request without running a capture.
    pub fn reject(self, error: ScreenshotError) {
        let _ = self.responder.send(Err(error));
    }
}

/// Unbounded backlog, released strictly in arrival order.
#[derive(Debug)]
pub struct AdmissionQueue<T = AdmissionEntry> {
    entries: VecDeque<T>,
    enqueued: u64,
    high_water_mark: usize,
}

impl<T> AdmissionQueue<T> {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            enqueued: 0,
            high_water_mark: 0,
        }
    }

    pub fn enqueue(&mut self, entry: T) {
        self.entries.push_back(entry);
        self.enqueued += 1;
        self.high_water_mark = self.high_water_mark.max(self.entries.len());
    }

    /// Removes the oldest entry.
    pub fn pop(&mut self) -> Option<T> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn drain(&mut self) -> Vec<T> {
        self.entries.drain(..).collect()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            depth: self.entries.len(),
            enqueued: self.enqueued,
            high_water_mark: self.high_water_mark,
        }
    }
}

impl<T> Default for AdmissionQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub depth: usize,
    pub enqueued: u64,
    pub high_water_mark: usize,
}
