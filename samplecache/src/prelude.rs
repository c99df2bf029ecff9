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

//! Everything needed to build and use a [`SampleCache`].

pub use samplecache_common::{
    error::{Error, ErrorKind, Result},
    metrics::{registry::noop::NoopMetricsRegistry, RegistryOps},
};
#[cfg(feature = "prometheus")]
pub use samplecache_common::metrics::registry::prometheus::PrometheusMetricsRegistry;
pub use url::Url;

pub use crate::{
    cache::{SampleCache, SampleCacheBuilder},
    decode::{Decoder, DecoderEvent, DecoderFactory},
    event::{Event, EventListener},
    fetch::{ByteStream, FileFetcher, Fetcher},
    format::{AudioFormat, SampleState},
    handle::SampleHandle,
    sample::Sample,
};
