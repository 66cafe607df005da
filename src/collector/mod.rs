// Copyright (c) 2026 Openmesh Network
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Collector: a fixed pool of workers that own streaming subscriptions and
//! fold incoming bytes into content-addressed summaries.
//!
//! The instance swaps assignments atomically: cancel the old subscription
//! epoch, pause every worker (which seals the outgoing summaries), rebind,
//! resume. The whole sequence runs on the single caller task, so workers
//! never race the summary hand-off.

pub mod assignment;
pub mod sources;

use crate::collector::sources::{Joiner, Source, SourceError, Subscription};
use crate::core::types::{content_id, Request, Summary};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Size of the worker pool. Deployment constant.
pub const MAX_WORKERS: usize = 8;
/// Per-worker accumulation buffer size in bytes.
pub const WORKER_BUFFER_SIZE: usize = 4096;

/// Collector errors.
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("already started")]
    AlreadyStarted,
    #[error("not started")]
    NotStarted,
    #[error("worker unavailable")]
    WorkerGone,
}

enum WorkerCommand {
    /// Seal and return the current summary, then hold until resumed.
    Pause { reply: oneshot::Sender<Summary> },
    /// Bind a new assignment (or go idle) and run again.
    Resume { assignment: Option<WorkerAssignment> },
}

struct WorkerAssignment {
    request: Request,
    /// `None` when the adapter join failed: the slot stays bound but
    /// observes no traffic until the next submission.
    subscription: Option<Subscription>,
}

struct Worker {
    index: usize,
    cancel: CancellationToken,
    commands: mpsc::Receiver<WorkerCommand>,
    messages: Option<mpsc::Receiver<Vec<u8>>>,
    errors: Option<mpsc::Receiver<SourceError>>,
    buffer: Box<[u8]>,
    offset: usize,
    summary: Summary,
    paused: bool,
}

async fn recv_or_pending<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl Worker {
    fn new(index: usize, cancel: CancellationToken, commands: mpsc::Receiver<WorkerCommand>) -> Self {
        Self {
            index,
            cancel,
            commands,
            messages: None,
            errors: None,
            buffer: vec![0u8; WORKER_BUFFER_SIZE].into_boxed_slice(),
            offset: 0,
            summary: Summary::default(),
            paused: false,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                cmd = self.commands.recv() => match cmd {
                    Some(WorkerCommand::Pause { reply }) => self.handle_pause(reply),
                    Some(WorkerCommand::Resume { assignment }) => self.handle_resume(assignment),
                    None => return,
                },
                msg = recv_or_pending(&mut self.messages), if !self.paused => match msg {
                    Some(message) => self.append(&message),
                    None => self.messages = None,
                },
                err = recv_or_pending(&mut self.errors), if !self.paused => {
                    if let Some(e) = err {
                        debug!(worker = self.index, err = %e, "source stream ended");
                    }
                    // Terminal error: the slot stays bound but silent until
                    // the next submission.
                    self.messages = None;
                    self.errors = None;
                }
            }
        }
    }

    fn handle_pause(&mut self, reply: oneshot::Sender<Summary>) {
        // Drain messages that already arrived so the sealed summary covers
        // every byte the source delivered before the swap.
        loop {
            let message = match self.messages.as_mut() {
                Some(rx) => rx.try_recv().ok(),
                None => None,
            };
            let Some(message) = message else { break };
            self.append(&message);
        }
        self.flush();
        self.paused = true;
        let _ = reply.send(std::mem::take(&mut self.summary));
    }

    fn handle_resume(&mut self, assignment: Option<WorkerAssignment>) {
        match assignment {
            Some(a) => {
                self.summary = Summary::new(a.request);
                let (messages, errors) = match a.subscription {
                    Some(sub) => (Some(sub.messages), Some(sub.errors)),
                    None => (None, None),
                };
                self.messages = messages;
                self.errors = errors;
            }
            None => {
                self.summary = Summary::default();
                self.messages = None;
                self.errors = None;
            }
        }
        self.paused = false;
    }

    /// Fold one message into the buffer, spilling full ranges as content-ids.
    fn append(&mut self, message: &[u8]) {
        if self.offset + message.len() > self.buffer.len() {
            self.flush();
        }
        let mut rest = message;
        while rest.len() > self.buffer.len() {
            let (chunk, tail) = rest.split_at(self.buffer.len());
            self.summary.data_hashes.push(content_id(chunk));
            rest = tail;
        }
        self.buffer[self.offset..self.offset + rest.len()].copy_from_slice(rest);
        self.offset += rest.len();
    }

    /// Seal the buffered prefix as a content-id. Empty flushes are skipped.
    fn flush(&mut self) {
        if self.offset == 0 {
            return;
        }
        self.summary
            .data_hashes
            .push(content_id(&self.buffer[..self.offset]));
        self.offset = 0;
    }
}

/// Coordinates the worker pool and the current assignment.
pub struct CollectorInstance<J: Joiner> {
    sources: &'static [Source],
    joiner: J,
    root: CancellationToken,
    workers: Vec<mpsc::Sender<WorkerCommand>>,
    subscription: Option<CancellationToken>,
    active: usize,
}

impl<J: Joiner> CollectorInstance<J> {
    /// Create an instance over the given source table. Cancelling `cancel`
    /// terminates the worker pool and every open subscription.
    pub fn new(sources: &'static [Source], joiner: J, cancel: CancellationToken) -> Self {
        Self {
            sources,
            joiner,
            root: cancel,
            workers: Vec::new(),
            subscription: None,
            active: 0,
        }
    }

    /// Spawn the worker pool. Must be called exactly once.
    pub fn start(&mut self) -> Result<(), CollectorError> {
        if !self.workers.is_empty() {
            return Err(CollectorError::AlreadyStarted);
        }
        for index in 0..MAX_WORKERS {
            let (tx, rx) = mpsc::channel(4);
            tokio::spawn(Worker::new(index, self.root.clone(), rx).run());
            self.workers.push(tx);
        }
        Ok(())
    }

    /// Atomically replace the current assignment.
    ///
    /// Returns the sealed summaries of the outgoing assignment, in worker
    /// order, truncated to the number of slots that were live. Callers must
    /// serialize invocations; `&mut self` enforces that within one instance.
    pub async fn submit_requests(
        &mut self,
        requests: &[Request],
    ) -> Result<Vec<Summary>, CollectorError> {
        if self.workers.is_empty() {
            return Err(CollectorError::NotStarted);
        }

        // Cancel the prior subscription epoch first so stale channel sends
        // cannot race the new assignment, then open a fresh child context.
        if let Some(prior) = self.subscription.take() {
            prior.cancel();
        }
        let epoch = self.root.child_token();

        // Pause workers one at a time; each pause flushes the buffer and
        // seals the summary of the outgoing assignment.
        let mut summaries = Vec::with_capacity(self.workers.len());
        for tx in &self.workers {
            let (reply_tx, reply_rx) = oneshot::channel();
            tx.send(WorkerCommand::Pause { reply: reply_tx })
                .await
                .map_err(|_| CollectorError::WorkerGone)?;
            summaries.push(reply_rx.await.map_err(|_| CollectorError::WorkerGone)?);
        }
        summaries.truncate(self.active);

        // Open the new subscriptions before any worker resumes.
        let bound = requests.len().min(self.workers.len());
        let mut assignments: Vec<Option<WorkerAssignment>> = Vec::with_capacity(self.workers.len());
        for request in requests.iter().take(bound) {
            let source = self.sources.get(request.source as usize);
            let topic =
                source.and_then(|s| s.topics.get(request.topic as usize).copied());
            let subscription = match (source, topic) {
                (Some(source), Some(topic)) => {
                    match self.joiner.join(epoch.clone(), source, topic).await {
                        Ok(sub) => Some(sub),
                        Err(e) => {
                            warn!(
                                source = source.name,
                                topic,
                                err = %e,
                                "join failed, slot silent until reassignment"
                            );
                            None
                        }
                    }
                }
                _ => {
                    warn!(?request, "request outside source table");
                    None
                }
            };
            assignments.push(Some(WorkerAssignment {
                request: *request,
                subscription,
            }));
        }
        assignments.resize_with(self.workers.len(), || None);

        // Resume every worker.
        for (tx, assignment) in self.workers.iter().zip(assignments) {
            tx.send(WorkerCommand::Resume { assignment })
                .await
                .map_err(|_| CollectorError::WorkerGone)?;
        }

        self.subscription = Some(epoch);
        self.active = bound;
        Ok(summaries)
    }

    /// Stop every worker and the current subscription epoch.
    pub fn shutdown(&self) {
        self.root.cancel();
    }
}
