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

use std::fmt::Debug;

use futures_core::Stream;
use samplecache_common::error::Result;
use url::Url;

use crate::{fetch::ByteStream, format::AudioFormat};

/// Progress reported by a [`Decoder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderEvent {
    /// The container header has been parsed.
    ///
    /// `len` is the total size of the decoded PCM in bytes. Reported once per load.
    Format {
        /// Layout of the decoded PCM.
        format: AudioFormat,
        /// Decoded size in bytes.
        len: usize,
    },
    /// More decoded bytes can be drained with [`Decoder::read`].
    Readable,
}

/// A container decoder wrapping the byte stream of one sample.
///
/// The decoder reports its progress as a stream of [`DecoderEvent`]s. An `Err` item or the end of the stream before
/// the declared size has been drained fails the load.
pub trait Decoder: Stream<Item = Result<DecoderEvent>> + Send + Unpin + 'static {
    /// Drain up to `buf.len()` decoded bytes into `buf`, returning the count copied.
    ///
    /// Returns 0 when nothing is buffered.
    fn read(&mut self, buf: &mut [u8]) -> usize;
}

/// Opens [`Decoder`]s over fetched byte streams.
pub trait DecoderFactory: Send + Sync + 'static + Debug {
    /// Open a decoder for `url` on top of `stream`.
    fn open(&self, url: &Url, stream: ByteStream) -> Result<Box<dyn Decoder>>;
}
