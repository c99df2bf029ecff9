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
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use futures_core::Stream;
use parking_lot::Mutex;
use samplecache::{
    prelude::*,
    test_utils::{encode_raw_pcm, MemoryFetcher, RawPcmDecoderFactory, RAW_PCM_HEADER_LEN},
};

const FORMAT: AudioFormat = AudioFormat {
    channels: 2,
    sample_rate: 44_100,
    sample_width: 2,
};

fn url(name: &str) -> Url {
    Url::parse(&format!("mem://samples/{name}.pcm")).unwrap()
}

fn pcm(len: usize) -> Bytes {
    let data = (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>();
    encode_raw_pcm(FORMAT, &data)
}

#[derive(Debug, Default)]
struct Recorder {
    fetcher: Option<MemoryFetcher>,
    leaves: Mutex<Vec<(Event, Url, usize)>>,
}

impl Recorder {
    fn leaves(&self) -> Vec<(Event, Url)> {
        self.leaves.lock().iter().map(|(e, u, _)| (*e, u.clone())).collect()
    }
}

impl EventListener for Recorder {
    fn on_leave(&self, reason: Event, url: &Url, _: &Sample) {
        let live = self.fetcher.as_ref().map(|f| f.live_streams()).unwrap_or(0);
        self.leaves.lock().push((reason, url.clone(), live));
    }
}

fn build(capacity: i64, fetcher: &MemoryFetcher, recorder: &Arc<Recorder>) -> SampleCache {
    SampleCacheBuilder::new(capacity)
        .with_name("test")
        .with_fetcher(fetcher.clone())
        .with_decoder_factory(RawPcmDecoderFactory)
        .with_event_listener(recorder.clone())
        .with_loader_thread_name("test-loader")
        .build()
        .unwrap()
}

async fn settle(cache: &SampleCache) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while cache.is_loading() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("loader worker did not settle");
}

async fn wait(handle: &SampleHandle) -> Result<()> {
    tokio::time::timeout(Duration::from_secs(10), handle.wait())
        .await
        .expect("sample did not settle")
}

#[test_log::test(tokio::test)]
async fn test_identity_reuse() {
    let fetcher = MemoryFetcher::default();
    fetcher.insert(url("kick"), pcm(1024));
    fetcher.insert(url("snare"), pcm(1024));
    let recorder = Arc::new(Recorder::default());
    let cache = build(1 << 20, &fetcher, &recorder);

    let k1 = cache.request_sample(&url("kick")).unwrap();
    let k2 = cache.request_sample(&url("kick")).unwrap();
    let s1 = cache.request_sample(&url("snare")).unwrap();

    assert!(SampleHandle::ptr_eq(&k1, &k2));
    assert!(!SampleHandle::ptr_eq(&k1, &s1));
    assert_eq!(k1.refs(), 2);

    let k3 = k2.clone();
    assert_eq!(k1.refs(), 3);
    drop(k3);
    cache.release(k2);
    assert_eq!(k1.refs(), 1);
    assert_eq!(cache.len(), 2);
}

#[test_log::test(tokio::test)]
async fn test_single_flight() {
    let fetcher = MemoryFetcher::default();
    fetcher.insert_chunked(url("pad"), pcm(64 * 1024), 1000);
    let recorder = Arc::new(Recorder::default());
    let cache = build(1 << 20, &fetcher, &recorder);

    fetcher.hold();
    let handles = std::thread::scope(|s| {
        let threads = (0..8)
            .map(|_| s.spawn(|| cache.request_sample(&url("pad")).unwrap()))
            .collect::<Vec<_>>();
        threads.into_iter().map(|t| t.join().unwrap()).collect::<Vec<_>>()
    });
    fetcher.open();

    for handle in handles.iter() {
        wait(handle).await.unwrap();
    }
    settle(&cache).await;

    assert_eq!(fetcher.fetches(&url("pad")), 1);
    assert_eq!(handles[0].refs(), 8);
    assert_eq!(handles[0].data().unwrap().len(), 64 * 1024);
    assert_eq!(cache.usage(), 64 * 1024);
}

#[test_log::test(tokio::test)]
async fn test_load_if_necessary_is_idempotent_when_ready() {
    let fetcher = MemoryFetcher::default();
    fetcher.insert(url("hat"), pcm(4096));
    let recorder = Arc::new(Recorder::default());
    let cache = build(1 << 20, &fetcher, &recorder);

    let first = cache.request_sample(&url("hat")).unwrap();
    wait(&first).await.unwrap();
    let data = first.data().unwrap();

    for _ in 0..4 {
        let again = cache.request_sample(&url("hat")).unwrap();
        wait(&again).await.unwrap();
        assert_eq!(again.state(), SampleState::Ready);
    }
    settle(&cache).await;

    assert_eq!(fetcher.fetches(&url("hat")), 1);
    assert_eq!(first.data().unwrap(), data);
    assert_eq!(first.format(), Some(FORMAT));
    assert_eq!(cache.usage(), 4096);
}

#[test_log::test(tokio::test)]
async fn test_usage_is_sum_of_tracked_samples() {
    let sizes = [("a", 300usize), ("b", 500), ("c", 200), ("d", 400), ("e", 100)];
    let fetcher = MemoryFetcher::default();
    for (name, len) in sizes {
        fetcher.insert(url(name), pcm(len));
    }
    let recorder = Arc::new(Recorder::default());
    let cache = build(1000, &fetcher, &recorder);

    // Keep `b` referenced so it is never evicted.
    let b = cache.request_sample(&url("b")).unwrap();
    wait(&b).await.unwrap();
    for (name, _) in sizes {
        let handle = cache.request_sample(&url(name)).unwrap();
        wait(&handle).await.unwrap();
        settle(&cache).await;

        let tracked = sizes
            .iter()
            .filter(|(name, _)| cache.is_cached(&url(name)))
            .map(|(_, len)| *len)
            .sum::<usize>();
        assert_eq!(cache.usage(), tracked);
        assert!(cache.usage() <= 1000);
    }
    assert!(cache.is_cached(&url("b")));
    assert!(recorder.leaves().iter().all(|(event, _)| *event == Event::Evict));
}

#[test_log::test(tokio::test)]
async fn test_eviction_on_refresh() {
    let fetcher = MemoryFetcher::default();
    fetcher.insert(url("a"), pcm(800_000));
    fetcher.insert(url("b"), pcm(800_000));
    let recorder = Arc::new(Recorder::default());
    let cache = build(1_000_000, &fetcher, &recorder);

    let a = cache.request_sample(&url("a")).unwrap();
    wait(&a).await.unwrap();
    drop(a);
    settle(&cache).await;
    // Reuse is on, the unreferenced sample stays.
    assert!(cache.is_cached(&url("a")));
    assert_eq!(cache.usage(), 800_000);

    let b = cache.request_sample(&url("b")).unwrap();
    wait(&b).await.unwrap();
    settle(&cache).await;

    assert!(!cache.is_cached(&url("a")));
    assert!(cache.is_cached(&url("b")));
    assert_eq!(cache.usage(), 800_000);
    assert_eq!(recorder.leaves(), vec![(Event::Evict, url("a"))]);
}

#[test_log::test(tokio::test)]
async fn test_referenced_samples_are_not_evicted() {
    let fetcher = MemoryFetcher::default();
    fetcher.insert(url("a"), pcm(800));
    fetcher.insert(url("b"), pcm(800));
    let recorder = Arc::new(Recorder::default());
    let cache = build(1000, &fetcher, &recorder);

    let a = cache.request_sample(&url("a")).unwrap();
    let b = cache.request_sample(&url("b")).unwrap();
    wait(&a).await.unwrap();
    wait(&b).await.unwrap();
    settle(&cache).await;

    // Soft limit: both are in use.
    assert_eq!(cache.usage(), 1600);
    assert!(recorder.leaves().is_empty());
    assert_eq!(a.data().unwrap().len(), 800);
}

#[test_log::test(tokio::test)]
async fn test_retry_after_fetch_error() {
    let fetcher = MemoryFetcher::default();
    fetcher.fail_fetch(url("crash"), "connection refused");
    let recorder = Arc::new(Recorder::default());
    let cache = build(1 << 20, &fetcher, &recorder);

    let handle = cache.request_sample(&url("crash")).unwrap();
    let err = wait(&handle).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Fetch);
    settle(&cache).await;
    assert_eq!(handle.state(), SampleState::Error);
    assert!(handle.error().is_some());
    assert!(handle.data().is_none());
    assert!(handle.format().is_none());
    assert_eq!(cache.usage(), 0);

    fetcher.insert(url("crash"), pcm(2048));
    let again = cache.request_sample(&url("crash")).unwrap();
    assert!(SampleHandle::ptr_eq(&handle, &again));
    wait(&handle).await.unwrap();
    settle(&cache).await;

    assert_eq!(fetcher.fetches(&url("crash")), 2);
    assert_eq!(handle.state(), SampleState::Ready);
    assert_eq!(handle.data().unwrap().len(), 2048);
    assert!(handle.error().is_none());
    assert_eq!(cache.usage(), 2048);
}

#[test_log::test(tokio::test)]
async fn test_retry_after_truncated_stream() {
    let fetcher = MemoryFetcher::default();
    let full = pcm(10_000);
    fetcher.fail_stream(url("ride"), full.slice(..5_000), "connection reset");
    let recorder = Arc::new(Recorder::default());
    let cache = build(1 << 20, &fetcher, &recorder);

    let handle = cache.request_sample(&url("ride")).unwrap();
    assert!(wait(&handle).await.is_err());
    settle(&cache).await;
    assert_eq!(handle.read_len(), 0);
    assert_eq!(cache.usage(), 0);

    fetcher.insert_chunked(url("ride"), full, 333);
    let _again = cache.request_sample(&url("ride")).unwrap();
    wait(&handle).await.unwrap();
    settle(&cache).await;
    assert_eq!(handle.data().unwrap().len(), 10_000);
    assert_eq!(cache.usage(), 10_000);
}

#[test_log::test(tokio::test)]
async fn test_decode_error_is_reported() {
    let fetcher = MemoryFetcher::default();
    fetcher.insert(url("noise"), Bytes::from_static(&[0u8; 12]));
    let recorder = Arc::new(Recorder::default());
    let cache = build(1 << 20, &fetcher, &recorder);

    let handle = cache.request_sample(&url("noise")).unwrap();
    let err = wait(&handle).await.unwrap_err();
    assert!(err.is_decode());
}

#[test_log::test(tokio::test)]
async fn test_zero_length_sample() {
    let fetcher = MemoryFetcher::default();
    fetcher.insert(url("silence"), encode_raw_pcm(FORMAT, &[]));
    let recorder = Arc::new(Recorder::default());
    let cache = build(1 << 20, &fetcher, &recorder);

    let handle = cache.request_sample(&url("silence")).unwrap();
    wait(&handle).await.unwrap();
    assert_eq!(handle.data().unwrap().len(), 0);
    assert_eq!(handle.format(), Some(FORMAT));
}

#[test_log::test(tokio::test)]
async fn test_disabled_cache_drops_unreferenced() {
    let fetcher = MemoryFetcher::default();
    fetcher.insert(url("tom"), pcm(512));
    let recorder = Arc::new(Recorder::default());
    let cache = build(0, &fetcher, &recorder);

    let handle = cache.request_sample(&url("tom")).unwrap();
    wait(&handle).await.unwrap();
    settle(&cache).await;
    assert!(cache.is_cached(&url("tom")));
    assert_eq!(cache.usage(), 512);

    cache.release(handle);
    assert!(!cache.is_cached(&url("tom")));
    assert_eq!(cache.usage(), 0);
    assert_eq!(recorder.leaves(), vec![(Event::Remove, url("tom"))]);

    // A later request starts from scratch.
    let handle = cache.request_sample(&url("tom")).unwrap();
    wait(&handle).await.unwrap();
    assert_eq!(fetcher.fetches(&url("tom")), 2);
}

#[test_log::test(tokio::test)]
async fn test_disable_reuse_drops_unreferenced() {
    let fetcher = MemoryFetcher::default();
    for name in ["a", "b", "c"] {
        fetcher.insert(url(name), pcm(100));
    }
    let recorder = Arc::new(Recorder::default());
    let cache = build(1 << 20, &fetcher, &recorder);

    let kept = cache.request_sample(&url("b")).unwrap();
    for name in ["a", "b", "c"] {
        let handle = cache.request_sample(&url(name)).unwrap();
        wait(&handle).await.unwrap();
    }
    settle(&cache).await;
    assert_eq!(cache.len(), 3);

    cache.set_capacity(0);
    assert_eq!(cache.capacity(), 0);
    assert!(!cache.is_cached(&url("a")));
    assert!(cache.is_cached(&url("b")));
    assert!(!cache.is_cached(&url("c")));
    assert_eq!(cache.usage(), 100);

    drop(kept);
    assert!(cache.is_empty());
    assert_eq!(cache.usage(), 0);
    assert!(recorder.leaves().iter().all(|(event, _)| *event == Event::Remove));
}

#[test_log::test(tokio::test)]
async fn test_teardown_joins_worker_before_clear() {
    let fetcher = MemoryFetcher::default();
    fetcher.insert_chunked(url("loop"), pcm(100_000), 1000);
    fetcher.insert(url("done"), pcm(100));
    let recorder = Arc::new(Recorder {
        fetcher: Some(fetcher.clone()),
        ..Default::default()
    });
    let cache = build(1 << 20, &fetcher, &recorder);

    let done = cache.request_sample(&url("done")).unwrap();
    wait(&done).await.unwrap();

    fetcher.hold();
    let handle = cache.request_sample(&url("loop")).unwrap();
    tokio::time::timeout(Duration::from_secs(10), async {
        while fetcher.live_streams() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
    assert!(cache.is_loading());
    assert_eq!(fetcher.fetches(&url("loop")), 1);

    drop(cache);

    let leaves = recorder.leaves.lock().clone();
    assert_eq!(leaves.len(), 2);
    // The in-flight pipeline is gone before any sample leaves.
    assert!(leaves.iter().all(|(event, _, live)| *event == Event::Clear && *live == 0));
    // The dropped load fails its waiters instead of leaving them hanging.
    assert_eq!(handle.state(), SampleState::Error);
    assert_eq!(wait(&handle).await.unwrap_err().kind(), ErrorKind::Closed);
    assert_eq!(done.data().unwrap().len(), 100);

    // Handles outlive the cache, dropping them is a noop.
    drop(handle);
    drop(done);
}

#[test_log::test(tokio::test)]
async fn test_waiters_resolve_after_teardown() {
    let fetcher = MemoryFetcher::default();
    fetcher.insert(url("kick"), pcm(1024));
    let recorder = Arc::new(Recorder::default());
    let cache = build(1 << 20, &fetcher, &recorder);

    fetcher.hold();
    let handle = cache.request_sample(&url("kick")).unwrap();
    let waiter = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.wait().await })
    };

    drop(cache);

    let res = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("waiter hangs after teardown")
        .unwrap();
    assert_eq!(res.unwrap_err().kind(), ErrorKind::Closed);
    assert_eq!(handle.state(), SampleState::Error);
    assert!(handle.data().is_none());
}

/// Reports an unallocatable size for urls ending in `.huge`, decodes raw pcm otherwise.
#[derive(Debug)]
struct OversizedDecoderFactory;

impl DecoderFactory for OversizedDecoderFactory {
    fn open(&self, url: &Url, stream: ByteStream) -> Result<Box<dyn Decoder>> {
        if url.path().ends_with(".huge") {
            Ok(Box::new(OversizedDecoder {
                reported: false,
                _stream: stream,
            }))
        } else {
            RawPcmDecoderFactory.open(url, stream)
        }
    }
}

struct OversizedDecoder {
    reported: bool,
    _stream: ByteStream,
}

impl Stream for OversizedDecoder {
    type Item = Result<DecoderEvent>;

    fn poll_next(mut self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.reported {
            return Poll::Ready(None);
        }
        self.reported = true;
        Poll::Ready(Some(Ok(DecoderEvent::Format {
            format: FORMAT,
            len: usize::MAX,
        })))
    }
}

impl Decoder for OversizedDecoder {
    fn read(&mut self, _: &mut [u8]) -> usize {
        0
    }
}

#[test_log::test(tokio::test)]
async fn test_unallocatable_size_is_an_allocation_error() {
    let fetcher = MemoryFetcher::default();
    fetcher.insert(url("kick"), pcm(100));
    let huge = Url::parse("mem://samples/bogus.huge").unwrap();
    fetcher.insert(huge.clone(), Bytes::from_static(b"bogus"));
    let cache = SampleCacheBuilder::new(1 << 20)
        .with_fetcher(fetcher.clone())
        .with_decoder_factory(OversizedDecoderFactory)
        .build()
        .unwrap();

    let bogus = cache.request_sample(&huge).unwrap();
    let err = wait(&bogus).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Allocation);
    assert!(err.is_decode());
    settle(&cache).await;
    assert_eq!(cache.usage(), 0);

    let kick = cache.request_sample(&url("kick")).unwrap();
    wait(&kick).await.unwrap();

    // Retry with usage already charged by another sample.
    let retry = cache.request_sample(&huge).unwrap();
    let err = wait(&retry).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Allocation);
    settle(&cache).await;

    assert_eq!(retry.state(), SampleState::Error);
    assert_eq!(cache.usage(), 100);
    assert!(cache.is_cached(&url("kick")));
    assert_eq!(kick.data().unwrap().len(), 100);

    drop(bogus);
    drop(retry);
    drop(cache);
}

#[test_log::test(tokio::test)]
async fn test_default_fetcher_reads_local_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kick.pcm");
    std::fs::write(&path, pcm(4096)).unwrap();
    let url = Url::from_file_path(&path).unwrap();

    let cache = SampleCacheBuilder::new(1 << 20)
        .with_decoder_factory(RawPcmDecoderFactory)
        .build()
        .unwrap();
    let handle = cache.request_sample(&url).unwrap();
    wait(&handle).await.unwrap();

    assert_eq!(handle.format(), Some(FORMAT));
    assert_eq!(handle.data().unwrap(), pcm(4096).slice(RAW_PCM_HEADER_LEN..));
    settle(&cache).await;
    assert_eq!(cache.usage(), 4096);
}
