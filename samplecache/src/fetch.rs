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

use bytes::{Bytes, BytesMut};
use futures_util::{
    future::{BoxFuture, FutureExt},
    stream::{self, BoxStream, StreamExt},
};
use samplecache_common::error::{Error, Result};
use tokio::{fs::File, io::AsyncReadExt};
use url::Url;

/// Raw container bytes of a sample, delivered in chunks.
///
/// An `Err` item terminates the load attempt.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Supplies the byte stream of a sample.
///
/// The returned future and stream are polled on the loader worker only.
pub trait Fetcher: Send + Sync + 'static + Debug {
    /// Start fetching `url`.
    fn fetch(&self, url: &Url) -> BoxFuture<'static, Result<ByteStream>>;
}

/// Serves `file://` URLs from the local file system.
#[derive(Debug, Clone)]
pub struct FileFetcher {
    chunk_size: usize,
}

impl Default for FileFetcher {
    fn default() -> Self {
        Self {
            chunk_size: Self::DEFAULT_CHUNK_SIZE,
        }
    }
}

impl FileFetcher {
    const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

    /// Set the size of each read from the file.
    ///
    /// The default value is 64 KiB.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }
}

impl Fetcher for FileFetcher {
    fn fetch(&self, url: &Url) -> BoxFuture<'static, Result<ByteStream>> {
        let url = url.clone();
        let chunk_size = self.chunk_size;
        async move {
            if url.scheme() != "file" {
                return Err(Error::fetch("unsupported url scheme").with_context("url", &url));
            }
            let path = url
                .to_file_path()
                .map_err(|_| Error::fetch("url is not a local file path").with_context("url", &url))?;
            let file = File::open(&path).await.map_err(|e| {
                Error::fetch("cannot open sample file")
                    .with_context("url", &url)
                    .with_source(e)
            })?;

            let stream = stream::unfold(Some(file), move |file| async move {
                let mut file = file?;
                let mut buf = BytesMut::with_capacity(chunk_size);
                match file.read_buf(&mut buf).await {
                    Ok(0) => None,
                    Ok(_) => Some((Ok(buf.freeze()), Some(file))),
                    Err(e) => Some((Err(Error::fetch("cannot read sample file").with_source(e)), None)),
                }
            });
            Ok(stream.boxed())
        }
        .boxed()
    }
}
