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
    sync::{atomic::Ordering, Arc},
    thread::JoinHandle,
};

use futures_util::FutureExt;
use itertools::Itertools;
use ordered_hash_map::OrderedHashMap;
use parking_lot::Mutex;
use samplecache_common::{
    error::{Error, ErrorKind, Result},
    metrics::{model::Metrics, registry::noop::NoopMetricsRegistry, RegistryOps},
    scope::Scope,
    strict_assert,
};
use url::Url;

use crate::{
    decode::DecoderFactory,
    event::{Event, EventListener},
    fetch::{FileFetcher, Fetcher},
    handle::SampleHandle,
    sample::Sample,
    worker::{self, LoaderWorker},
};

type Garbages = Vec<(Event, Arc<Sample>)>;

struct CacheState {
    capacity: i64,
    usage: usize,

    samples: OrderedHashMap<Url, Arc<Sample>>,
    /// Samples removed from the map while the loader worker still owes them work.
    stale: Vec<Arc<Sample>>,

    armed: usize,
    worker: Option<LoaderWorker>,
    retired: Vec<JoinHandle<()>>,
}

impl CacheState {
    fn is_tracked(&self, sample: &Arc<Sample>) -> bool {
        self.samples
            .get(sample.url())
            .is_some_and(|tracked| Arc::ptr_eq(tracked, sample))
    }

    fn limit(&self) -> Option<usize> {
        (self.capacity > 0).then_some(self.capacity as usize)
    }

    /// Drop the sample's charge and hand it out as garbage. The caller has removed it from the map.
    fn unload(&mut self, sample: Arc<Sample>, event: Event, garbages: &mut Garbages) {
        strict_assert!(!self.is_tracked(&sample));

        let charge = sample.charge.swap(0, Ordering::Relaxed);
        strict_assert!(self.usage >= charge);
        self.usage -= charge;

        if sample.pending.load(Ordering::Relaxed) > 0 {
            self.stale.push(sample.clone());
        }
        garbages.push((event, sample));
    }

    /// Evict unreferenced samples in insertion order until usage fits in `target`.
    fn evict(&mut self, target: usize, event: Event, garbages: &mut Garbages) {
        while self.usage > target {
            let Some(url) = self
                .samples
                .iter()
                .find(|(_, sample)| sample.refs() == 0)
                .map(|(url, _)| url.clone())
            else {
                tracing::debug!(
                    "[cache]: every sample is referenced, usage stays above limit, usage: {}, target: {target}",
                    self.usage
                );
                break;
            };
            if let Some(sample) = self.samples.remove(&url) {
                self.unload(sample, event, garbages);
            }
        }
    }

    fn evict_unreferenced(&mut self, event: Event, garbages: &mut Garbages) {
        let urls = self
            .samples
            .iter()
            .filter(|(_, sample)| sample.refs() == 0)
            .map(|(url, _)| url.clone())
            .collect_vec();
        for url in urls {
            if let Some(sample) = self.samples.remove(&url) {
                self.unload(sample, event, garbages);
            }
        }
    }

    /// Take the retired threads that have exited, to be joined out of the lock.
    fn take_finished(&mut self) -> Vec<JoinHandle<()>> {
        let (finished, running): (Vec<_>, Vec<_>) = self.retired.drain(..).partition(|thread| thread.is_finished());
        self.retired = running;
        finished
    }
}

pub(crate) struct CacheShared {
    name: &'static str,
    state: Mutex<CacheState>,

    fetcher: Arc<dyn Fetcher>,
    decoder_factory: Arc<dyn DecoderFactory>,
    event_listener: Option<Arc<dyn EventListener>>,
    metrics: Arc<Metrics>,

    loader_thread_name: String,
}

impl CacheShared {
    pub(crate) fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub(crate) fn fetcher(&self) -> &Arc<dyn Fetcher> {
        &self.fetcher
    }

    pub(crate) fn decoder_factory(&self) -> &Arc<dyn DecoderFactory> {
        &self.decoder_factory
    }

    fn leave(&self, garbages: Garbages) {
        for (event, sample) in garbages.iter() {
            match event {
                Event::Evict => self.metrics.evict.increase(1),
                Event::Remove => self.metrics.remove.increase(1),
                Event::Clear => self.metrics.clear.increase(1),
            }
            tracing::debug!("[cache]: sample left, reason: {event:?}, url: {}", sample.url());
            if let Some(listener) = self.event_listener.as_ref() {
                listener.on_leave(*event, sample.url(), sample);
            }
        }
    }

    /// Charge `delta` bytes for a sample being allocated, then evict down to the capacity.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "samplecache::cache::refresh"))]
    pub(crate) fn refresh(&self, sample: &Arc<Sample>, delta: usize) -> Result<()> {
        let mut garbages = vec![];

        let res = self.state.lock().with(|mut state| {
            if state.is_tracked(sample) {
                let usage = state.usage.checked_add(delta).ok_or_else(|| Error::allocation(delta))?;
                sample.charge.fetch_add(delta, Ordering::Relaxed);
                state.usage = usage;
            }
            if let Some(limit) = state.limit() {
                state.evict(limit, Event::Evict, &mut garbages);
                if state.usage > limit {
                    tracing::warn!(
                        "[cache]: usage exceeds capacity, usage: {}, capacity: {limit}",
                        state.usage
                    );
                }
            }
            self.metrics.usage.absolute(state.usage as _);
            Ok(())
        });

        // Deallocate data out of the lock critical section.
        self.leave(garbages);
        res
    }

    /// Give back the charge of a sample whose load failed.
    pub(crate) fn refund(&self, sample: &Arc<Sample>) {
        self.state.lock().with(|mut state| {
            let charge = sample.charge.swap(0, Ordering::Relaxed);
            strict_assert!(state.usage >= charge);
            state.usage -= charge;
            self.metrics.usage.absolute(state.usage as _);
        });
    }

    /// Release one armed request of `sample`. Called by the loader worker.
    pub(crate) fn loading_release(&self, sample: &Arc<Sample>) {
        let mut reclaimed = None;

        self.state.lock().with(|mut state| {
            strict_assert!(state.armed > 0);
            state.armed -= 1;
            let pending = sample.pending.fetch_sub(1, Ordering::Relaxed) - 1;

            if pending == 0 {
                if let Some(pos) = state.stale.iter().position(|stale| Arc::ptr_eq(stale, sample)) {
                    reclaimed = Some(state.stale.swap_remove(pos));
                }
            }

            if state.armed == 0 {
                if let Some(worker) = state.worker.take() {
                    tracing::debug!("[cache]: retire loader worker, name: {}", self.name);
                    self.metrics.loader_retire.increase(1);
                    let thread = worker.retire();
                    state.retired.push(thread);
                }
            }
        });

        if let Some(sample) = reclaimed {
            tracing::trace!("[cache]: reclaim stale sample, url: {}", sample.url());
        }
    }

    /// Drop an unreferenced sample right away if reuse is disabled.
    pub(crate) fn notify_unreferenced(&self, sample: &Arc<Sample>) {
        let mut garbages = vec![];

        self.state.lock().with(|mut state| {
            if sample.refs() > 0 || state.capacity > 0 || !state.is_tracked(sample) {
                return;
            }
            if let Some(sample) = state.samples.remove(sample.url()) {
                state.unload(sample, Event::Remove, &mut garbages);
            }
            self.metrics.usage.absolute(state.usage as _);
        });

        self.leave(garbages);
    }
}

/// A decoded audio sample cache.
///
/// Each url is fetched and decoded once on a dedicated loader thread, regardless of how many consumers request it.
/// Unreferenced samples stay cached until `capacity` bytes are exceeded, then they are evicted in request order.
/// With `capacity <= 0` a sample is dropped as soon as its last handle is.
pub struct SampleCache {
    shared: Arc<CacheShared>,
}

impl Debug for SampleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("SampleCache")
            .field("name", &self.shared.name)
            .field("capacity", &state.capacity)
            .field("usage", &state.usage)
            .field("samples", &state.samples.len())
            .field("armed", &state.armed)
            .finish()
    }
}

impl SampleCache {
    /// Get the sample of `url`, starting its load if it is neither loaded nor loading.
    ///
    /// Never waits for the load. Use [`Sample::wait`] on the returned handle for that.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "samplecache::cache::request_sample"))]
    pub fn request_sample(&self, url: &Url) -> Result<SampleHandle> {
        let shared = &self.shared;

        let (sample, created, submitted) = shared.state.lock().with(|mut state| {
            let (sample, created) = match state.samples.get(url) {
                Some(sample) => {
                    shared.metrics.hit.increase(1);
                    (sample.clone(), false)
                }
                None => {
                    shared.metrics.miss.increase(1);
                    let sample = Arc::new(Sample::new(url.clone(), Arc::downgrade(shared)));
                    state.samples.insert(url.clone(), sample.clone());
                    (sample, true)
                }
            };

            state.armed += 1;
            sample.pending.fetch_add(1, Ordering::Relaxed);
            // Acquired under the lock, so the worker cannot evict the sample before the handle exists.
            sample.add_ref();

            let submitted = Self::submit(&mut state, &sample).is_ok();
            (sample, created, submitted)
        });

        if submitted {
            return Ok(SampleHandle::from_acquired(sample));
        }

        // No loader worker is running, start one out of the lock.
        let spawned = LoaderWorker::spawn(&shared.loader_thread_name);

        let mut finished = vec![];
        let mut garbages = vec![];
        let res = shared.state.lock().with(|mut state| {
            finished = state.take_finished();

            let res = spawned.and_then(|worker| {
                if state.worker.is_some() {
                    // Another request has started one meanwhile.
                    state.retired.push(worker.retire());
                } else {
                    tracing::debug!("[cache]: start loader worker, name: {}", shared.name);
                    shared.metrics.loader_start.increase(1);
                    state.worker = Some(worker);
                }
                Self::submit(&mut state, &sample)
            });

            if res.is_err() {
                sample.release();
                state.armed -= 1;
                sample.pending.fetch_sub(1, Ordering::Relaxed);
                if created && sample.refs() == 0 {
                    if state.is_tracked(&sample) {
                        if let Some(sample) = state.samples.remove(url) {
                            state.unload(sample, Event::Remove, &mut garbages);
                        }
                    } else if sample.pending.load(Ordering::Relaxed) == 0 {
                        state.stale.retain(|stale| !Arc::ptr_eq(stale, &sample));
                    }
                }
                if state.armed == 0 {
                    if let Some(worker) = state.worker.take() {
                        state.retired.push(worker.retire());
                    }
                }
            }
            res
        });
        shared.leave(garbages);
        finished.into_iter().for_each(worker::join);

        match res {
            Ok(()) => Ok(SampleHandle::from_acquired(sample)),
            Err(e) => {
                tracing::warn!("[cache]: cannot arm sample load, url: {url}, error: {e}");
                if !created && sample.refs() == 0 {
                    shared.notify_unreferenced(&sample);
                }
                Err(e)
            }
        }
    }

    /// Queue the load of `sample` on the running loader worker.
    fn submit(state: &mut CacheState, sample: &Arc<Sample>) -> Result<()> {
        let worker = state
            .worker
            .take()
            .ok_or_else(|| Error::new(ErrorKind::Closed, "no loader worker running"))?;
        match worker.submit(sample.clone().load_if_necessary().boxed()) {
            Ok(()) => {
                state.worker = Some(worker);
                Ok(())
            }
            Err(e) => {
                // The thread is gone, a fresh one is started for the request.
                state.retired.push(worker.retire());
                Err(e)
            }
        }
    }

    /// Release a handle. Equivalent to dropping it.
    pub fn release(&self, handle: SampleHandle) {
        drop(handle);
    }

    /// Change the byte budget.
    ///
    /// Turning reuse off (a positive capacity to `<= 0`) drops every unreferenced sample first. Shrinking a positive
    /// capacity evicts unreferenced samples down to the new limit.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "samplecache::cache::set_capacity"))]
    pub fn set_capacity(&self, capacity: i64) {
        let mut garbages = vec![];

        self.shared.state.lock().with(|mut state| {
            if state.capacity > 0 && capacity <= 0 {
                state.evict_unreferenced(Event::Remove, &mut garbages);
            }
            state.capacity = capacity;
            if let Some(limit) = state.limit() {
                state.evict(limit, Event::Evict, &mut garbages);
            }
            self.shared.metrics.usage.absolute(state.usage as _);
        });

        self.shared.leave(garbages);
    }

    /// The byte budget. `<= 0` means samples are not kept once unreferenced.
    pub fn capacity(&self) -> i64 {
        self.shared.state.lock().capacity
    }

    /// Bytes charged by tracked samples.
    pub fn usage(&self) -> usize {
        self.shared.state.lock().usage
    }

    /// Returns `true` if a sample of `url` is tracked.
    pub fn is_cached(&self, url: &Url) -> bool {
        self.shared.state.lock().samples.contains_key(url)
    }

    /// Returns `true` while the loader worker owes work to any request.
    pub fn is_loading(&self) -> bool {
        self.shared.state.lock().armed > 0
    }

    /// Count of tracked samples.
    pub fn len(&self) -> usize {
        self.shared.state.lock().samples.len()
    }

    /// Returns `true` if no sample is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Name of the cache, used as the metrics label.
    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    #[cfg(test)]
    fn stale_len(&self) -> usize {
        self.shared.state.lock().stale.len()
    }
}

impl Drop for SampleCache {
    fn drop(&mut self) {
        let (current, retired) = self
            .shared
            .state
            .lock()
            .with(|mut state| (state.worker.take(), std::mem::take(&mut state.retired)));

        // No sample may be destroyed before the loader threads are gone.
        if let Some(current) = current {
            current.shutdown();
        }
        retired.into_iter().for_each(worker::join);

        let mut garbages = vec![];
        let stale = self.shared.state.lock().with(|mut state| {
            state.armed = 0;
            while let Some(sample) = state.samples.pop_front() {
                let charge = sample.charge.swap(0, Ordering::Relaxed);
                strict_assert!(state.usage >= charge);
                state.usage -= charge;
                sample.pending.store(0, Ordering::Relaxed);
                garbages.push((Event::Clear, sample));
            }
            strict_assert!(state.usage == 0);
            let stale = std::mem::take(&mut state.stale);
            stale.iter().for_each(|sample| sample.pending.store(0, Ordering::Relaxed));
            stale
        });

        // The dropped in-flight loads will never notify their waiters.
        garbages
            .iter()
            .map(|(_, sample)| sample)
            .chain(stale.iter())
            .for_each(|sample| sample.abort());

        self.shared.leave(garbages);
        drop(stale);
        tracing::debug!("[cache]: torn down, name: {}", self.shared.name);
    }
}

/// Builder of a [`SampleCache`].
pub struct SampleCacheBuilder {
    capacity: i64,
    name: &'static str,
    fetcher: Arc<dyn Fetcher>,
    decoder_factory: Option<Arc<dyn DecoderFactory>>,
    event_listener: Option<Arc<dyn EventListener>>,
    registry: Box<dyn RegistryOps>,
    loader_thread_name: String,
}

impl SampleCacheBuilder {
    /// Create a builder with the byte budget.
    pub fn new(capacity: i64) -> Self {
        Self {
            capacity,
            name: "samplecache",
            fetcher: Arc::new(FileFetcher::default()),
            decoder_factory: None,
            event_listener: None,
            registry: Box::new(NoopMetricsRegistry),
            loader_thread_name: "samplecache-loader".to_string(),
        }
    }

    /// Set the name of the cache, used as the metrics label.
    ///
    /// The default value is "samplecache".
    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Set the fetcher that supplies the byte streams.
    ///
    /// The default value serves `file://` urls from the local file system.
    pub fn with_fetcher(mut self, fetcher: impl Fetcher) -> Self {
        self.fetcher = Arc::new(fetcher);
        self
    }

    /// Set the decoder factory. Required.
    pub fn with_decoder_factory(mut self, decoder_factory: impl DecoderFactory) -> Self {
        self.decoder_factory = Some(Arc::new(decoder_factory));
        self
    }

    /// Set the event listener.
    pub fn with_event_listener(mut self, event_listener: Arc<dyn EventListener>) -> Self {
        self.event_listener = Some(event_listener);
        self
    }

    /// Set the metrics registry.
    ///
    /// The default value is a noop registry.
    pub fn with_metrics_registry(mut self, registry: impl RegistryOps) -> Self {
        self.registry = Box::new(registry);
        self
    }

    /// Set the name of the loader thread.
    ///
    /// The default value is "samplecache-loader".
    pub fn with_loader_thread_name(mut self, name: impl Into<String>) -> Self {
        self.loader_thread_name = name.into();
        self
    }

    /// Build the sample cache. The loader thread is started on the first request.
    pub fn build(self) -> Result<SampleCache> {
        let decoder_factory = self
            .decoder_factory
            .ok_or_else(|| Error::config("a decoder factory is required"))?;
        if self.loader_thread_name.is_empty() {
            return Err(Error::config("loader thread name must not be empty"));
        }

        let metrics = Arc::new(Metrics::new(self.name, self.registry.as_ref()));

        let shared = Arc::new(CacheShared {
            name: self.name,
            state: Mutex::new(CacheState {
                capacity: self.capacity,
                usage: 0,
                samples: OrderedHashMap::new(),
                stale: vec![],
                armed: 0,
                worker: None,
                retired: vec![],
            }),
            fetcher: self.fetcher,
            decoder_factory,
            event_listener: self.event_listener,
            metrics,
            loader_thread_name: self.loader_thread_name,
        });

        tracing::debug!("[cache]: built, name: {}, capacity: {}", self.name, self.capacity);

        Ok(SampleCache { shared })
    }
}
