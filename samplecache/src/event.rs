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

use url::Url;

use crate::sample::Sample;

/// Event identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// An unreferenced sample was evicted to bring usage back under capacity.
    Evict,
    /// An unreferenced sample was dropped because reuse is disabled (capacity <= 0).
    Remove,
    /// The cache was torn down.
    Clear,
}

/// Trait for the customized event listener.
pub trait EventListener: Send + Sync + 'static {
    /// Called when a sample leaves the cache with the reason.
    ///
    /// Called out of the cache lock. Eviction happens on the loader worker, so the callback must not block.
    #[expect(unused_variables)]
    fn on_leave(&self, reason: Event, url: &Url, sample: &Sample) {}
}
