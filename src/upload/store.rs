use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::{Error, Result};

/// Remote object storage as seen by the dispatcher.
///
/// `put_file` must be atomic from the caller's perspective: either the
/// whole object lands under `key`, replacing any previous object, or the
/// call fails.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_file(&self, key: &str, path: &Path) -> Result<()>;

    /// Short description for logs.
    fn describe(&self) -> String;
}

/// Store that mirrors objects into a local directory tree.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        key.split('/')
            .filter(|part| !part.is_empty() && *part != "." && *part != "..")
            .fold(self.root.clone(), |acc, part| acc.join(part))
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn put_file(&self, key: &str, path: &Path) -> Result<()> {
        let dest = self.path_for(key);
        let src = path.to_path_buf();
        tokio::task::spawn_blocking(move || copy_atomic(&src, &dest))
            .await
            .map_err(|err| Error::Store {
                path: path.to_path_buf(),
                reason: format!("copy task failed: {err}"),
            })?
            .map_err(|err| Error::Store {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })
    }

    fn describe(&self) -> String {
        format!("local:{}", self.root.display())
    }
}

fn copy_atomic(src: &Path, dest: &Path) -> std::io::Result<()> {
    let parent = dest
        .parent()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "object key has no parent"))?;
    std::fs::create_dir_all(parent)?;

    let name = dest
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dest.with_file_name(format!("{name}.tmp"));
    let _ = std::fs::remove_file(&tmp);

    let mut input = File::open(src)?;
    let mut output = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    std::io::copy(&mut input, &mut output)?;
    output.sync_all()?;
    std::fs::rename(&tmp, dest)?;
    Ok(())
}

#[cfg(feature = "http-store")]
pub use http::{HttpStore, HttpStoreConfig};

#[cfg(feature = "http-store")]
mod http {
    use std::path::Path;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use tokio_util::io::ReaderStream;
    use url::Url;

    use super::ObjectStore;
    use crate::{Error, Result};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(default)]
    pub struct HttpStoreConfig {
        /// Base URL such as `https://storage.example.com`.
        pub endpoint: String,
        pub bucket: String,
        /// Sent verbatim as the `Authorization` header when set.
        pub authorization: Option<String>,
        #[serde(with = "crate::config::secs")]
        pub timeout: Duration,
        /// Ignore `HTTP_PROXY`/`HTTPS_PROXY` from the environment.
        pub no_proxy: bool,
    }

    impl Default for HttpStoreConfig {
        fn default() -> Self {
            Self {
                endpoint: String::new(),
                bucket: String::new(),
                authorization: None,
                timeout: Duration::from_secs(600),
                no_proxy: false,
            }
        }
    }

    /// Uploads objects with an HTTP `PUT` to `<endpoint>/<bucket>/<key>`.
    #[derive(Debug, Clone)]
    pub struct HttpStore {
        client: reqwest::Client,
        base: Url,
        bucket: String,
        authorization: Option<String>,
    }

    impl HttpStore {
        pub fn new(config: HttpStoreConfig) -> Result<Self> {
            let base = Url::parse(&config.endpoint)
                .map_err(|err| Error::Config(format!("invalid store endpoint {}: {err}", config.endpoint)))?;
            if base.cannot_be_a_base() {
                return Err(Error::Config(format!("store endpoint cannot be a base: {base}")));
            }
            if config.bucket.is_empty() {
                return Err(Error::Config("store bucket is empty".to_string()));
            }
            let mut builder = reqwest::Client::builder().timeout(config.timeout);
            if config.no_proxy {
                builder = builder.no_proxy();
            }
            let client = builder
                .build()
                .map_err(|err| Error::Config(format!("http client: {err}")))?;
            Ok(Self {
                client,
                base,
                bucket: config.bucket,
                authorization: config.authorization,
            })
        }

        /// Full object URL; each key segment is percent-encoded.
        pub fn object_url(&self, key: &str) -> Url {
            let mut url = self.base.clone();
            if let Ok(mut segments) = url.path_segments_mut() {
                segments.pop_if_empty().push(&self.bucket);
                segments.extend(key.split('/').filter(|part| !part.is_empty()));
            }
            url
        }
    }

    #[async_trait]
    impl ObjectStore for HttpStore {
        async fn put_file(&self, key: &str, path: &Path) -> Result<()> {
            let store_err = |reason: String| Error::Store {
                path: path.to_path_buf(),
                reason,
            };

            let file = tokio::fs::File::open(path)
                .await
                .map_err(|err| store_err(format!("open: {err}")))?;
            let len = file
                .metadata()
                .await
                .map_err(|err| store_err(format!("stat: {err}")))?
                .len();

            let url = self.object_url(key);
            let mut request = self
                .client
                .put(url.clone())
                .header(reqwest::header::CONTENT_LENGTH, len)
                .body(reqwest::Body::wrap_stream(ReaderStream::new(file)));
            if let Some(auth) = &self.authorization {
                request = request.header(reqwest::header::AUTHORIZATION, auth);
            }

            let response = request
                .send()
                .await
                .map_err(|err| store_err(format!("PUT {url}: {err}")))?;
            response
                .error_for_status()
                .map_err(|err| store_err(format!("PUT {url}: {err}")))?;
            Ok(())
        }

        fn describe(&self) -> String {
            format!("{}{}", self.base, self.bucket)
        }
    }

}
