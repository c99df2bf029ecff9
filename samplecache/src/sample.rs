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

use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Weak,
    },
};

use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;
use samplecache_common::{
    error::{Error, ErrorKind, Result},
    scope::Scope,
    strict_assert,
};
use tokio::sync::watch;
use url::Url;

use crate::{
    cache::CacheShared,
    decode::{Decoder, DecoderEvent},
    format::{AudioFormat, SampleState},
};

#[derive(Debug)]
struct SampleInner {
    state: SampleState,
    buffer: Vec<u8>,
    read_len: usize,
    format: Option<AudioFormat>,
    data: Option<Bytes>,
    error: Option<Error>,
}

impl SampleInner {
    fn reset(&mut self) {
        self.buffer = Vec::new();
        self.read_len = 0;
        self.format = None;
        self.data = None;
    }

    /// Drain the decoder into the missing tail of the buffer. Returns `true` once the buffer is full.
    fn fill(&mut self, decoder: &mut dyn Decoder) -> bool {
        while self.read_len < self.buffer.len() {
            let read = decoder.read(&mut self.buffer[self.read_len..]);
            if read == 0 {
                break;
            }
            self.read_len += read;
            strict_assert!(self.read_len <= self.buffer.len());
        }
        self.read_len == self.buffer.len()
    }
}

/// A decoded audio sample tracked by a [`SampleCache`](crate::SampleCache).
///
/// Consumers reach it through a [`SampleHandle`](crate::SampleHandle). The decoded bytes and the format are exposed
/// only once the sample is [`SampleState::Ready`].
pub struct Sample {
    url: Url,

    refs: AtomicUsize,
    /// Armed requests not yet released by the loader worker. Mutated under the cache lock.
    pub(crate) pending: AtomicUsize,
    /// Bytes this sample contributes to the cache usage. Mutated under the cache lock.
    pub(crate) charge: AtomicUsize,

    inner: Mutex<SampleInner>,
    state_tx: watch::Sender<SampleState>,

    cache: Weak<CacheShared>,
}

impl Debug for Sample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sample")
            .field("url", &self.url.as_str())
            .field("state", &self.state())
            .field("refs", &self.refs())
            .finish()
    }
}

impl Drop for Sample {
    fn drop(&mut self) {
        tracing::trace!("[sample]: destroyed, url: {}", self.url);
    }
}

impl Sample {
    pub(crate) fn new(url: Url, cache: Weak<CacheShared>) -> Self {
        let (state_tx, _) = watch::channel(SampleState::Creating);
        Self {
            url,
            refs: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            charge: AtomicUsize::new(0),
            inner: Mutex::new(SampleInner {
                state: SampleState::Creating,
                buffer: Vec::new(),
                read_len: 0,
                format: None,
                data: None,
                error: None,
            }),
            state_tx,
            cache,
        }
    }

    /// The url the sample was requested with.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SampleState {
        self.inner.lock().state
    }

    /// Count of live handles.
    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// The decoded PCM bytes, `Some` only when ready.
    pub fn data(&self) -> Option<Bytes> {
        self.inner.lock().data.clone()
    }

    /// The PCM layout, `Some` only when ready.
    pub fn format(&self) -> Option<AudioFormat> {
        self.inner
            .lock()
            .with_ref(|inner| (inner.state == SampleState::Ready).then_some(inner.format).flatten())
    }

    /// The error of the last failed load attempt.
    ///
    /// Cleared when the sample becomes ready.
    pub fn error(&self) -> Option<Error> {
        self.inner.lock().error.clone()
    }

    /// Bytes decoded so far by the current load attempt.
    pub fn read_len(&self) -> usize {
        self.inner.lock().read_len
    }

    /// Subscribe to state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SampleState> {
        self.state_tx.subscribe()
    }

    /// Wait until the sample is ready.
    ///
    /// Resolves with the load error once the sample is in [`SampleState::Error`] and no further load has been
    /// requested.
    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.state_tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                SampleState::Ready => return Ok(()),
                SampleState::Error if self.pending.load(Ordering::Acquire) == 0 => {
                    return Err(self
                        .error()
                        .unwrap_or_else(|| Error::decode("load failed").with_context("url", &self.url)));
                }
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(Error::new(ErrorKind::ChannelClosed, "sample state channel closed"));
            }
        }
    }

    pub(crate) fn add_ref(&self) -> usize {
        let refs = self.refs.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!("[sample]: add ref, url: {}, refs: {refs}", self.url);
        refs
    }

    /// Returns the remaining reference count.
    pub(crate) fn release(&self) -> usize {
        let old = self.refs.fetch_sub(1, Ordering::AcqRel);
        strict_assert!(old > 0);
        tracing::trace!("[sample]: release, url: {}, refs: {}", self.url, old - 1);
        old - 1
    }

    pub(crate) fn cache(&self) -> Option<Arc<CacheShared>> {
        self.cache.upgrade()
    }

    fn notify(&self, state: SampleState) {
        self.state_tx.send_replace(state);
    }

    /// Start a load if the sample is not loaded nor loading, otherwise just release the armed request.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "samplecache::sample::load_if_necessary"))]
    pub(crate) async fn load_if_necessary(self: Arc<Self>) {
        let start = self.inner.lock().with(|mut inner| {
            if !inner.state.is_loadable() {
                return false;
            }
            inner.reset();
            inner.state = SampleState::Loading;
            true
        });

        if !start {
            tracing::trace!("[sample]: load not necessary, url: {}", self.url);
            if let Some(cache) = self.cache() {
                cache.loading_release(&self);
            }
            return;
        }

        tracing::debug!("[sample]: loading, url: {}", self.url);
        self.notify(SampleState::Loading);
        self.load().await;
    }

    async fn load(self: &Arc<Self>) {
        let Some((fetcher, factory)) = self.cache().map(|cache| {
            cache.metrics().load.increase(1);
            (cache.fetcher().clone(), cache.decoder_factory().clone())
        }) else {
            return;
        };

        let res = async {
            let stream = fetcher.fetch(&self.url).await?;
            let decoder = factory.open(&self.url, stream)?;
            self.drive(decoder).await
        }
        .await;

        match res {
            Ok(()) => self.on_ready(),
            Err(e) => self.decoder_error(e),
        }
    }

    /// Consume decoder events until the buffer is full. The decoder is dropped on return.
    async fn drive(self: &Arc<Self>, mut decoder: Box<dyn Decoder>) -> Result<()> {
        while let Some(event) = decoder.next().await {
            let full = match event? {
                DecoderEvent::Format { format, len } => self.decoder_ready(decoder.as_mut(), format, len)?,
                DecoderEvent::Readable => self.read_sample(decoder.as_mut())?,
            };
            if full {
                return Ok(());
            }
        }
        Err(Error::decode("stream ended before the declared size was decoded")
            .with_context("url", &self.url)
            .with_context("read", self.read_len()))
    }

    /// Charge and allocate the buffer once the decoded size is known, then drain what is already decoded.
    fn decoder_ready(self: &Arc<Self>, decoder: &mut dyn Decoder, format: AudioFormat, len: usize) -> Result<bool> {
        if self.inner.lock().format.is_some() {
            tracing::warn!("[sample]: duplicated format event ignored, url: {}", self.url);
            return Ok(false);
        }

        tracing::debug!(
            "[sample]: format reported, url: {}, format: {format:?}, len: {len}",
            self.url
        );

        // Allocate before charging, a size that cannot be allocated must not evict anything.
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(len)
            .map_err(|e| Error::allocation(len).with_context("url", &self.url).with_source(e))?;

        if let Some(cache) = self.cache() {
            cache
                .refresh(self, len)
                .map_err(|e| e.with_context("url", &self.url))?;
        }
        buffer.resize(len, 0);

        Ok(self.inner.lock().with(|mut inner| {
            inner.buffer = buffer;
            inner.read_len = 0;
            inner.format = Some(format);
            inner.fill(decoder)
        }))
    }

    fn read_sample(&self, decoder: &mut dyn Decoder) -> Result<bool> {
        self.inner.lock().with(|mut inner| {
            if inner.format.is_none() {
                return Err(Error::decode("decoded data reported before the format").with_context("url", &self.url));
            }
            Ok(inner.fill(decoder))
        })
    }

    fn on_ready(self: &Arc<Self>) {
        let len = self.inner.lock().with(|mut inner| {
            strict_assert!(inner.read_len == inner.buffer.len());
            let buffer = std::mem::take(&mut inner.buffer);
            let len = buffer.len();
            inner.data = Some(Bytes::from(buffer));
            inner.error = None;
            inner.state = SampleState::Ready;
            len
        });

        tracing::debug!("[sample]: ready, url: {}, len: {len}", self.url);

        if let Some(cache) = self.cache() {
            cache.metrics().ready.increase(1);
            cache.loading_release(self);
        }
        self.notify(SampleState::Ready);
    }

    /// Fail a load the loader worker will never finish. Called at teardown once the worker is joined.
    pub(crate) fn abort(&self) {
        let state = self.inner.lock().with(|mut inner| {
            if matches!(inner.state, SampleState::Creating | SampleState::Loading) {
                inner.reset();
                inner.state = SampleState::Error;
                inner.error = Some(Error::new(ErrorKind::Closed, "sample cache closed").with_context("url", &self.url));
            }
            inner.state
        });

        if state == SampleState::Error {
            tracing::debug!("[sample]: aborted, url: {}", self.url);
            self.notify(state);
        }
    }

    fn decoder_error(self: &Arc<Self>, error: Error) {
        tracing::warn!("[sample]: load failed, url: {}, error: {error}", self.url);

        self.inner.lock().with(|mut inner| {
            inner.reset();
            inner.state = SampleState::Error;
            inner.error = Some(error);
        });

        if let Some(cache) = self.cache() {
            cache.metrics().error.increase(1);
            cache.refund(self);
            cache.loading_release(self);
        }
        self.notify(SampleState::Error);
    }
}
