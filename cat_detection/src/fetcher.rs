use crate::config::FetchConfig;
use futures::StreamExt;
use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};
use tempfile::TempDir;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::instrument;

pub const TEMP_IMAGE_NAME: &str = "temp_image.jpg";
const TEMP_DIR_PREFIX: &str = "cat_detection_";

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("{0}")]
    Request(#[from] reqwest::Error),
    #[error("{0}")]
    Io(#[from] io::Error),
}

/// A downloaded image inside its own temporary directory.
///
/// Dropping the value removes the directory; `close` does the same but
/// reports failures.
#[derive(Debug)]
pub struct TempImage {
    dir: TempDir,
    path: PathBuf,
}

impl TempImage {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn close(self) -> io::Result<()> {
        self.dir.close()
    }
}

#[derive(Clone)]
pub struct ImageFetcher {
    client: reqwest::Client,
    temp_root: PathBuf,
}

impl ImageFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder().user_agent(config.user_agent.as_str());
        if let Some(timeout_secs) = config.timeout_secs {
            builder = builder.timeout(Duration::from_secs(timeout_secs));
        }

        Ok(Self {
            client: builder.build()?,
            temp_root: config.temp_dir.clone().unwrap_or_else(std::env::temp_dir),
        })
    }

    /// Streams the body at `url` into a fresh temporary directory.
    ///
    /// Non-success statuses are errors. Nothing is left on disk when this
    /// returns an error.
    #[instrument(skip(self))]
    pub async fn fetch(&self, url: &str) -> Result<TempImage, FetchError> {
        let response = self.client.get(url).send().await?.error_for_status()?;

        let dir = tempfile::Builder::new()
            .prefix(TEMP_DIR_PREFIX)
            .tempdir_in(&self.temp_root)?;
        let path = dir.path().join(TEMP_IMAGE_NAME);

        let mut file = tokio::fs::File::create(&path).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0usize;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len();
        }
        file.flush().await?;

        tracing::debug!("Downloaded {} bytes to {:?}", written, path);
        Ok(TempImage { dir, path })
    }
}
