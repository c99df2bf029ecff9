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

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use prometheus::{
    register_int_counter_vec_with_registry, register_int_gauge_vec_with_registry, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Registry,
};

use crate::{
    metrics::{
        BoxedCounter, BoxedCounterVec, BoxedGauge, BoxedGaugeVec, Boxer, CounterOps, CounterVecOps, GaugeOps,
        GaugeVecOps, RegistryOps,
    },
    scope::Scope,
};

#[derive(Debug, Clone)]
enum MetricVec {
    Counter(IntCounterVec),
    Gauge(IntGaugeVec),
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
struct Metadata {
    name: &'static str,
    desc: &'static str,
    label_names: &'static [&'static str],
}

impl CounterOps for IntCounter {
    fn increase(&self, val: u64) {
        self.inc_by(val);
    }
}

impl CounterVecOps for IntCounterVec {
    fn counter(&self, labels: &[&'static str]) -> BoxedCounter {
        self.with_label_values(labels).boxed()
    }
}

impl GaugeOps for IntGauge {
    fn increase(&self, val: u64) {
        self.add(val as _);
    }

    fn decrease(&self, val: u64) {
        self.sub(val as _);
    }

    fn absolute(&self, val: u64) {
        self.set(val as _);
    }
}

impl GaugeVecOps for IntGaugeVec {
    fn gauge(&self, labels: &[&'static str]) -> BoxedGauge {
        self.with_label_values(labels).boxed()
    }
}

/// Prometheus metric registry with lib `prometheus`.
///
/// Clones share the registered metric vectors, so a cloned [`PrometheusMetricsRegistry`] can be handed to multiple
/// caches without registering the same metric twice. Wrapping the same [`Registry`] twice with
/// [`PrometheusMetricsRegistry::new`] does not share them and panics on the second registration.
#[derive(Debug, Clone)]
pub struct PrometheusMetricsRegistry {
    registry: Registry,
    metrics: Arc<Mutex<HashMap<Metadata, MetricVec>>>,
}

impl PrometheusMetricsRegistry {
    /// Create an Prometheus metrics registry.
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            metrics: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The underlying prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn get_or_register(&self, metadata: Metadata, register: impl FnOnce(&Registry, Metadata) -> MetricVec) -> MetricVec {
        self.metrics.lock().with(|mut metrics| {
            metrics
                .entry(metadata)
                .or_insert_with(|| register(&self.registry, metadata))
                .clone()
        })
    }
}

impl RegistryOps for PrometheusMetricsRegistry {
    fn register_counter_vec(
        &self,
        name: &'static str,
        desc: &'static str,
        label_names: &'static [&'static str],
    ) -> BoxedCounterVec {
        let metadata = Metadata {
            name,
            desc,
            label_names,
        };
        let vec = self.get_or_register(metadata, |registry, m| {
            MetricVec::Counter(
                register_int_counter_vec_with_registry! { m.name, m.desc, m.label_names, registry }
                    .expect("metric must not be registered by another wrapper of the same registry"),
            )
        });
        match vec {
            MetricVec::Counter(v) => v.boxed(),
            MetricVec::Gauge(_) => panic!("metric {name} has been registered as a gauge"),
        }
    }

    fn register_gauge_vec(
        &self,
        name: &'static str,
        desc: &'static str,
        label_names: &'static [&'static str],
    ) -> BoxedGaugeVec {
        let metadata = Metadata {
            name,
            desc,
            label_names,
        };
        let vec = self.get_or_register(metadata, |registry, m| {
            MetricVec::Gauge(
                register_int_gauge_vec_with_registry! { m.name, m.desc, m.label_names, registry }
                    .expect("metric must not be registered by another wrapper of the same registry"),
            )
        });
        match vec {
            MetricVec::Gauge(v) => v.boxed(),
            MetricVec::Counter(_) => panic!("metric {name} has been registered as a counter"),
        }
    }
}
