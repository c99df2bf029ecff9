// Copyright 2025 samplecache Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::thread::JoinHandle;

use futures_util::future::BoxFuture;
use samplecache_common::error::{Error, ErrorKind, Result};
use tokio::sync::{mpsc, oneshot};

pub(crate) type Task = BoxFuture<'static, ()>;

/// A dedicated thread driving a current-thread runtime.
///
/// Tasks submitted from any thread are spawned on the worker runtime in arrival order. They interleave on I/O
/// readiness but never run in parallel.
#[derive(Debug)]
pub(crate) struct LoaderWorker {
    tx: mpsc::UnboundedSender<Task>,
    shutdown: oneshot::Sender<()>,
    thread: JoinHandle<()>,
}

impl LoaderWorker {
    pub(crate) fn spawn(name: &str) -> Result<Self> {
        // Built on the caller thread so that a failure can be reported to the requester.
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::new(ErrorKind::Io, "cannot build loader runtime").with_source(e))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                tracing::trace!("[loader]: worker started");
                runtime.block_on(async move {
                    loop {
                        tokio::select! {
                            biased;
                            _ = &mut shutdown_rx => break,
                            task = rx.recv() => match task {
                                Some(task) => {
                                    tokio::spawn(task);
                                }
                                None => break,
                            }
                        }
                    }
                });
                // Dropping the runtime drops every task still in flight on this thread.
                drop(runtime);
                tracing::trace!("[loader]: worker exited");
            })
            .map_err(|e| {
                Error::new(ErrorKind::Io, "cannot spawn loader thread")
                    .with_context("name", name)
                    .with_source(e)
            })?;

        Ok(Self { tx, shutdown, thread })
    }

    pub(crate) fn submit(&self, task: Task) -> Result<()> {
        self.tx
            .send(task)
            .map_err(|_| Error::new(ErrorKind::Closed, "loader worker has exited"))
    }

    /// Close the queue and let the thread exit on its own once the queue is drained.
    ///
    /// Must only be called when no submitted task is still pending.
    pub(crate) fn retire(self) -> JoinHandle<()> {
        drop(self.tx);
        drop(self.shutdown);
        self.thread
    }

    /// Drop every in-flight task and wait for the thread to exit.
    pub(crate) fn shutdown(self) {
        let _ = self.shutdown.send(());
        drop(self.tx);
        join(self.thread);
    }
}

pub(crate) fn join(thread: JoinHandle<()>) {
    if thread.thread().id() == std::thread::current().id() {
        tracing::warn!("[loader]: skip joining the loader thread from itself");
        return;
    }
    if thread.join().is_err() {
        tracing::error!("[loader]: loader thread panicked");
    }
}
