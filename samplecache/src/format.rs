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

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// PCM layout of a decoded sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Interleaved channel count.
    pub channels: u16,
    /// Frames per second.
    pub sample_rate: u32,
    /// Bytes per sample of a single channel.
    pub sample_width: u16,
}

impl AudioFormat {
    /// Bytes occupied by one frame (one sample of every channel).
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * self.sample_width as usize
    }

    /// Playback duration of `len` decoded bytes.
    ///
    /// A trailing partial frame is not counted. Returns [`Duration::ZERO`] for a degenerate format.
    pub fn duration_of(&self, len: usize) -> Duration {
        let bpf = self.bytes_per_frame();
        if bpf == 0 || self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let frames = (len / bpf) as u64;
        let rate = self.sample_rate as u64;
        Duration::from_secs(frames / rate) + Duration::from_nanos((frames % rate) * 1_000_000_000 / rate)
    }
}

/// Lifecycle of a cached sample.
///
/// ```text
/// Creating ──► Loading ──► Ready
///                 ▲  │
///                 │  ▼
///                Error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleState {
    /// Tracked by the cache, no load has been started yet.
    Creating,
    /// Fetch and decode are in flight on the loader worker.
    Loading,
    /// The decoded buffer is complete and published.
    Ready,
    /// The last load attempt failed.
    Error,
}

impl SampleState {
    /// Returns `true` if a load may be started from this state.
    pub fn is_loadable(&self) -> bool {
        matches!(self, SampleState::Creating | SampleState::Error)
    }
}
