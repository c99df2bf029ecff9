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

//! Utilities for testing.

use std::{
    collections::{HashMap, VecDeque},
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    task::{ready, Context, Poll},
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_core::Stream;
use futures_util::{
    future::{BoxFuture, FutureExt},
    stream::{self, StreamExt},
};
use parking_lot::Mutex;
use samplecache_common::error::{Error, Result};
use tokio::sync::watch;
use url::Url;

use crate::{
    decode::{Decoder, DecoderEvent, DecoderFactory},
    fetch::{ByteStream, Fetcher},
    format::AudioFormat,
};

/// Size of the raw PCM container header.
///
/// Layout, all little endian: `channels: u16`, `sample_width: u16`, `sample_rate: u32`, `data_len: u32`.
pub const RAW_PCM_HEADER_LEN: usize = 12;

/// Wrap `pcm` into the raw PCM container understood by [`RawPcmDecoder`].
pub fn encode_raw_pcm(format: AudioFormat, pcm: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(RAW_PCM_HEADER_LEN + pcm.len());
    buf.put_u16_le(format.channels);
    buf.put_u16_le(format.sample_width);
    buf.put_u32_le(format.sample_rate);
    buf.put_u32_le(u32::try_from(pcm.len()).expect("raw pcm payload must be shorter than 4 GiB"));
    buf.put_slice(pcm);
    buf.freeze()
}

/// Opens [`RawPcmDecoder`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawPcmDecoderFactory;

impl DecoderFactory for RawPcmDecoderFactory {
    fn open(&self, _: &Url, stream: ByteStream) -> Result<Box<dyn Decoder>> {
        Ok(Box::new(RawPcmDecoder::new(stream)))
    }
}

/// Decoder of the raw PCM container, see [`RAW_PCM_HEADER_LEN`].
///
/// Bytes beyond the declared data length are ignored.
pub struct RawPcmDecoder {
    stream: ByteStream,
    header: BytesMut,
    remaining: Option<usize>,
    decoded: BytesMut,
    events: VecDeque<DecoderEvent>,
    done: bool,
}

impl RawPcmDecoder {
    /// Wrap a container byte stream.
    pub fn new(stream: ByteStream) -> Self {
        Self {
            stream,
            header: BytesMut::with_capacity(RAW_PCM_HEADER_LEN),
            remaining: None,
            decoded: BytesMut::new(),
            events: VecDeque::new(),
            done: false,
        }
    }

    fn feed(&mut self, mut chunk: Bytes) -> Result<()> {
        if self.remaining.is_none() {
            let want = RAW_PCM_HEADER_LEN - self.header.len();
            let take = want.min(chunk.len());
            self.header.put_slice(&chunk.split_to(take));
            if self.header.len() < RAW_PCM_HEADER_LEN {
                return Ok(());
            }

            let mut header = self.header.split().freeze();
            let channels = header.get_u16_le();
            let sample_width = header.get_u16_le();
            let sample_rate = header.get_u32_le();
            let len = header.get_u32_le() as usize;
            if channels == 0 || sample_rate == 0 || !(1..=4).contains(&sample_width) {
                return Err(Error::decode("unsupported pcm format")
                    .with_context("channels", channels)
                    .with_context("sample_width", sample_width)
                    .with_context("sample_rate", sample_rate));
            }
            let format = AudioFormat {
                channels,
                sample_rate,
                sample_width,
            };
            self.remaining = Some(len);
            self.events.push_back(DecoderEvent::Format { format, len });
        }

        if let Some(remaining) = self.remaining.as_mut() {
            let take = (*remaining).min(chunk.len());
            if take > 0 {
                self.decoded.put_slice(&chunk[..take]);
                *remaining -= take;
                self.events.push_back(DecoderEvent::Readable);
            }
        }
        Ok(())
    }
}

impl Stream for RawPcmDecoder {
    type Item = Result<DecoderEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(event) = this.events.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            if this.done {
                return Poll::Ready(None);
            }
            match ready!(this.stream.poll_next_unpin(cx)) {
                Some(Ok(chunk)) => {
                    if let Err(e) = this.feed(chunk) {
                        this.done = true;
                        return Poll::Ready(Some(Err(e)));
                    }
                }
                Some(Err(e)) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
                None => {
                    this.done = true;
                    if this.remaining.is_none() {
                        return Poll::Ready(Some(Err(Error::decode("truncated pcm header"))));
                    }
                }
            }
        }
    }
}

impl Decoder for RawPcmDecoder {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let len = buf.len().min(self.decoded.len());
        buf[..len].copy_from_slice(&self.decoded[..len]);
        self.decoded.advance(len);
        len
    }
}

#[derive(Debug, Clone)]
enum Script {
    Deliver { data: Bytes, chunk: usize },
    FailFetch { message: String },
    FailStream { prefix: Bytes, message: String },
}

#[derive(Debug)]
struct MemoryFetcherInner {
    scripts: Mutex<HashMap<Url, Script>>,
    fetches: Mutex<HashMap<Url, usize>>,
    gate: watch::Sender<bool>,
    streams: AtomicUsize,
    dropped: Arc<AtomicUsize>,
}

/// A scripted in-memory [`Fetcher`].
///
/// Clones share the scripts and counters.
#[derive(Debug, Clone)]
pub struct MemoryFetcher {
    inner: Arc<MemoryFetcherInner>,
}

impl Default for MemoryFetcher {
    fn default() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            inner: Arc::new(MemoryFetcherInner {
                scripts: Mutex::new(HashMap::new()),
                fetches: Mutex::new(HashMap::new()),
                gate,
                streams: AtomicUsize::new(0),
                dropped: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }
}

struct StreamGuard(Arc<AtomicUsize>);

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

struct Delivery {
    data: Bytes,
    chunk: usize,
    failure: Option<String>,
    gate: watch::Receiver<bool>,
    _guard: StreamGuard,
}

impl MemoryFetcher {
    const DEFAULT_CHUNK: usize = 4096;

    /// Serve `data` for `url`.
    pub fn insert(&self, url: Url, data: Bytes) {
        self.insert_chunked(url, data, Self::DEFAULT_CHUNK);
    }

    /// Serve `data` for `url` in chunks of `chunk` bytes.
    pub fn insert_chunked(&self, url: Url, data: Bytes, chunk: usize) {
        let chunk = chunk.max(1);
        self.inner.scripts.lock().insert(url, Script::Deliver { data, chunk });
    }

    /// Fail fetching `url` before any byte is delivered.
    pub fn fail_fetch(&self, url: Url, message: impl Into<String>) {
        let message = message.into();
        self.inner.scripts.lock().insert(url, Script::FailFetch { message });
    }

    /// Deliver `prefix` for `url`, then fail the stream.
    pub fn fail_stream(&self, url: Url, prefix: Bytes, message: impl Into<String>) {
        let message = message.into();
        self.inner
            .scripts
            .lock()
            .insert(url, Script::FailStream { prefix, message });
    }

    /// Times `url` has been fetched.
    pub fn fetches(&self, url: &Url) -> usize {
        self.inner.fetches.lock().get(url).copied().unwrap_or(0)
    }

    /// Byte streams handed out and not dropped yet.
    pub fn live_streams(&self) -> usize {
        self.inner.streams.load(Ordering::SeqCst) - self.inner.dropped.load(Ordering::SeqCst)
    }

    /// Hold the delivery of every chunk until [`MemoryFetcher::open`].
    pub fn hold(&self) {
        self.inner.gate.send_replace(false);
    }

    /// Resume delivery.
    pub fn open(&self) {
        self.inner.gate.send_replace(true);
    }
}

impl Fetcher for MemoryFetcher {
    fn fetch(&self, url: &Url) -> BoxFuture<'static, Result<ByteStream>> {
        *self.inner.fetches.lock().entry(url.clone()).or_default() += 1;
        let script = self.inner.scripts.lock().get(url).cloned();

        let (data, chunk, failure) = match script {
            None => {
                let err = Error::fetch("no such sample").with_context("url", url);
                return async move { Err(err) }.boxed();
            }
            Some(Script::FailFetch { message }) => {
                let err = Error::fetch(message).with_context("url", url);
                return async move { Err(err) }.boxed();
            }
            Some(Script::Deliver { data, chunk }) => (data, chunk, None),
            Some(Script::FailStream { prefix, message }) => (prefix, Self::DEFAULT_CHUNK, Some(message)),
        };

        self.inner.streams.fetch_add(1, Ordering::SeqCst);
        let delivery = Delivery {
            data,
            chunk,
            failure,
            gate: self.inner.gate.subscribe(),
            _guard: StreamGuard(self.inner.dropped.clone()),
        };

        let stream = stream::unfold(delivery, |mut delivery| async move {
            loop {
                let open = *delivery.gate.borrow_and_update();
                // A dropped fetcher opens the gate.
                if open || delivery.gate.changed().await.is_err() {
                    break;
                }
            }
            if !delivery.data.is_empty() {
                let len = delivery.chunk.min(delivery.data.len());
                let chunk = delivery.data.split_to(len);
                return Some((Ok(chunk), delivery));
            }
            let message = delivery.failure.take()?;
            Some((Err(Error::fetch(message)), delivery))
        });
        async move { Ok(stream.boxed()) }.boxed()
    }
}
