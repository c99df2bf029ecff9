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

use super::{BoxedCounter, BoxedGauge, RegistryOps};

/// Metrics of a sample cache instance, labeled by the cache name.
#[derive(Debug)]
pub struct Metrics {
    /// A request found the sample already tracked.
    pub hit: BoxedCounter,
    /// A request created a new sample.
    pub miss: BoxedCounter,
    /// A load pipeline has been started for a sample.
    pub load: BoxedCounter,
    /// A sample became ready.
    pub ready: BoxedCounter,
    /// A load ended in error.
    pub error: BoxedCounter,
    /// A sample was evicted to respect the capacity.
    pub evict: BoxedCounter,
    /// An unreferenced sample was removed while retention is disabled.
    pub remove: BoxedCounter,
    /// A sample was dropped at cache teardown.
    pub clear: BoxedCounter,

    /// The loader worker has been started.
    pub loader_start: BoxedCounter,
    /// The loader worker has been retired.
    pub loader_retire: BoxedCounter,

    /// Bytes charged against the capacity.
    pub usage: BoxedGauge,
}

impl Metrics {
    /// Create a new metric with the given name.
    pub fn new<R>(name: &'static str, registry: &R) -> Self
    where
        R: RegistryOps + ?Sized,
    {
        let op_total = registry.register_counter_vec(
            "samplecache_op_total",
            "samplecache sample operations",
            &["name", "op"],
        );
        let loader_total = registry.register_counter_vec(
            "samplecache_loader_total",
            "samplecache loader worker lifecycle",
            &["name", "op"],
        );
        let usage_bytes =
            registry.register_gauge_vec("samplecache_usage_bytes", "samplecache charged bytes", &["name"]);

        Self {
            hit: op_total.counter(&[name, "hit"]),
            miss: op_total.counter(&[name, "miss"]),
            load: op_total.counter(&[name, "load"]),
            ready: op_total.counter(&[name, "ready"]),
            error: op_total.counter(&[name, "error"]),
            evict: op_total.counter(&[name, "evict"]),
            remove: op_total.counter(&[name, "remove"]),
            clear: op_total.counter(&[name, "clear"]),

            loader_start: loader_total.counter(&[name, "start"]),
            loader_retire: loader_total.counter(&[name, "retire"]),

            usage: usage_bytes.gauge(&[name]),
        }
    }
}
