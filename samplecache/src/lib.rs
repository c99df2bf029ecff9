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

//! A cache of decoded audio samples.
//!
//! [`SampleCache`] turns a url into a reusable in-memory PCM buffer. Each url is fetched and decoded exactly once on
//! a dedicated loader thread, no matter how many consumers request it concurrently. Unreferenced samples are kept
//! within a byte budget and evicted in request order.
//!
//! The byte stream comes from a [`Fetcher`] and is turned into PCM by a [`Decoder`] opened by the configured
//! [`DecoderFactory`]. Both are polled on the loader thread only.

mod cache;
mod decode;
mod event;
mod fetch;
mod format;
mod handle;
mod sample;
mod worker;

#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

pub mod prelude;
pub use prelude::*;
