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

use std::{fmt::Debug, ops::Deref, sync::Arc};

use crate::sample::Sample;

/// A counted reference to a cached [`Sample`].
///
/// Cloning adds a reference, dropping releases it. A sample is only evictable while no handle refers to it.
pub struct SampleHandle {
    sample: Arc<Sample>,
}

impl SampleHandle {
    /// Wrap a sample whose reference count has already been incremented for this handle.
    pub(crate) fn from_acquired(sample: Arc<Sample>) -> Self {
        Self { sample }
    }

    /// Returns `true` if both handles refer to the same sample instance.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.sample, &other.sample)
    }
}

impl Debug for SampleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SampleHandle").field(&self.sample).finish()
    }
}

impl Clone for SampleHandle {
    fn clone(&self) -> Self {
        self.sample.add_ref();
        Self {
            sample: self.sample.clone(),
        }
    }
}

impl Drop for SampleHandle {
    fn drop(&mut self) {
        if self.sample.release() > 0 {
            return;
        }
        // The cache may have been torn down already, then there is nothing left to notify.
        if let Some(cache) = self.sample.cache() {
            cache.notify_unreferenced(&self.sample);
        }
    }
}

impl Deref for SampleHandle {
    type Target = Sample;

    fn deref(&self) -> &Self::Target {
        &self.sample
    }
}
