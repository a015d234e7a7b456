//! Local artifact store + HTTP probe/fetch engine for the disclosure mirror.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "fdr-storage";

/// Result of a metadata-only probe against a remote URL.
///
/// A 404 is data, not an error: the year-boundary resolver relies on being
/// able to distinguish "not published here" from a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Absent,
    Present { size: u64 },
}

/// Whether a local copy needs to be (re)fetched, by the size-equality rule.
///
/// This is a heuristic, not a checksum: a remote change that preserves the
/// byte size is not detected. That matches the archive's published behavior
/// and keeps probes to a single HEAD request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchDecision {
    NeedsFetch,
    UpToDate,
}

pub fn fetch_decision(local_size: Option<u64>, remote_size: u64) -> FetchDecision {
    match local_size {
        Some(size) if size == remote_size => FetchDecision::UpToDate,
        _ => FetchDecision::NeedsFetch,
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe request failed for {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("probe returned http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed for {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("incomplete download for {url}: expected {expected} bytes, got {actual}")]
    Incomplete {
        url: String,
        expected: u64,
        actual: u64,
    },
    #[error("writing {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FetchError {
    /// Write failures mean the local store itself is broken (disk full,
    /// permissions) and must abort the run; everything else is retriable by
    /// re-running.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FetchError::Write { .. })
    }
}

/// The remote archive as seen by the pipeline: metadata probes plus
/// full-body retrievals. `HttpFetcher` is the production implementation;
/// tests substitute scripted sources.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn probe(&self, url: &str) -> Result<Probe, ProbeError>;
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError>;
    async fn post_form(&self, url: &str, form: &[(&str, String)]) -> Result<String, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub probe_timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            user_agent: None,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    probe_timeout: Duration,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            probe_timeout: config.probe_timeout,
        })
    }
}

#[async_trait]
impl RemoteSource for HttpFetcher {
    /// HEAD the URL and report presence plus `Content-Length`. A missing
    /// length header reads as size 0, which simply forces a re-fetch.
    async fn probe(&self, url: &str) -> Result<Probe, ProbeError> {
        let resp = self
            .client
            .head(url)
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|source| ProbeError::Request {
                url: url.to_string(),
                source,
            })?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(Probe::Absent);
        }
        if !status.is_success() {
            return Err(ProbeError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let size = resp
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        Ok(Probe::Present { size })
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let body = resp.bytes().await.map_err(|source| FetchError::Request {
            url: url.to_string(),
            source,
        })?;
        Ok(body.to_vec())
    }

    async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let body = self.fetch(url).await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    async fn post_form(&self, url: &str, form: &[(&str, String)]) -> Result<String, FetchError> {
        let resp = self
            .client
            .post(url)
            .form(form)
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        resp.text().await.map_err(|source| FetchError::Request {
            url: url.to_string(),
            source,
        })
    }
}

/// Plain-file artifact store rooted at a data directory. Writes go through
/// a temp file and a rename, so a failed fetch never clobbers a prior good
/// copy and readers only ever see whole files.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn absolute(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.root.join(relative)
    }

    /// Size of a stored artifact, or `None` if it has never been fetched.
    pub async fn file_size(&self, relative: impl AsRef<Path>) -> std::io::Result<Option<u64>> {
        match fs::metadata(self.absolute(relative)).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Atomically replace the artifact at `relative` with `bytes`.
    pub async fn write_file(
        &self,
        relative: impl AsRef<Path>,
        bytes: &[u8],
    ) -> std::io::Result<PathBuf> {
        let absolute = self.absolute(relative);
        let parent = absolute
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent).await?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        drop(file);

        match fs::rename(&temp_path, &absolute).await {
            Ok(()) => Ok(absolute),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err)
            }
        }
    }
}

/// Download `url` and persist it at `relative` under the store root.
///
/// When the probed size is known, a body of any other length is rejected as
/// incomplete before anything touches the destination path. Returns the
/// byte count written. No retry policy lives here; callers re-run.
pub async fn fetch_to_file(
    remote: &dyn RemoteSource,
    store: &ArtifactStore,
    url: &str,
    relative: impl AsRef<Path>,
    expected_size: Option<u64>,
) -> Result<u64, FetchError> {
    let body = remote.fetch(url).await?;
    if let Some(expected) = expected_size {
        if body.len() as u64 != expected {
            return Err(FetchError::Incomplete {
                url: url.to_string(),
                expected,
                actual: body.len() as u64,
            });
        }
    }

    let relative = relative.as_ref();
    store
        .write_file(relative, &body)
        .await
        .map_err(|source| FetchError::Write {
            path: store.absolute(relative),
            source,
        })?;
    debug!(url, bytes = body.len(), "stored artifact");
    Ok(body.len() as u64)
}

#[derive(Debug, Error)]
pub enum UnpackError {
    #[error("opening archive {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("reading archive {path}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("expanding archive {path}: {source}")]
    Extract {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },
}

/// Expand every entry of the ZIP at `archive_path` into `output_dir`.
/// A corrupt archive is reported, not fatal: the caller isolates the error
/// to that archive's year and moves on.
pub fn unpack(archive_path: &Path, output_dir: &Path) -> Result<(), UnpackError> {
    let file = File::open(archive_path).map_err(|source| UnpackError::Open {
        path: archive_path.to_path_buf(),
        source,
    })?;
    let mut archive = zip::ZipArchive::new(file).map_err(|source| UnpackError::Archive {
        path: archive_path.to_path_buf(),
        source,
    })?;
    archive
        .extract(output_dir)
        .map_err(|source| UnpackError::Extract {
            path: archive_path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn size_equality_drives_the_fetch_decision() {
        assert_eq!(fetch_decision(None, 1000), FetchDecision::NeedsFetch);
        assert_eq!(fetch_decision(Some(999), 1000), FetchDecision::NeedsFetch);
        assert_eq!(fetch_decision(Some(1000), 1000), FetchDecision::UpToDate);
    }

    #[tokio::test]
    async fn write_file_overwrites_atomically() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());

        store
            .write_file("fd_zips/2020FD.zip", b"first")
            .await
            .expect("first write");
        store
            .write_file("fd_zips/2020FD.zip", b"replacement")
            .await
            .expect("second write");

        let stored = std::fs::read(dir.path().join("fd_zips/2020FD.zip")).expect("read back");
        assert_eq!(stored, b"replacement");
        assert_eq!(
            store.file_size("fd_zips/2020FD.zip").await.expect("size"),
            Some(11)
        );
    }

    #[tokio::test]
    async fn missing_artifacts_report_no_size() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        assert_eq!(store.file_size("fd_zips/1999FD.zip").await.expect("size"), None);
    }

    struct OneBodyRemote {
        body: Vec<u8>,
    }

    #[async_trait]
    impl RemoteSource for OneBodyRemote {
        async fn probe(&self, _url: &str) -> Result<Probe, ProbeError> {
            Ok(Probe::Present {
                size: self.body.len() as u64,
            })
        }

        async fn fetch(&self, _url: &str) -> Result<Vec<u8>, FetchError> {
            Ok(self.body.clone())
        }

        async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
            Err(FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            })
        }

        async fn post_form(&self, url: &str, _form: &[(&str, String)]) -> Result<String, FetchError> {
            Err(FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            })
        }
    }

    #[tokio::test]
    async fn bodies_matching_the_probed_size_are_persisted() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let remote = OneBodyRemote {
            body: b"zip bytes".to_vec(),
        };

        let written = fetch_to_file(
            &remote,
            &store,
            "https://host/2021FD.zip",
            "fd_zips/2021FD.zip",
            Some(9),
        )
        .await
        .expect("fetch");
        assert_eq!(written, 9);
        assert_eq!(store.file_size("fd_zips/2021FD.zip").await.expect("size"), Some(9));
    }

    #[tokio::test]
    async fn truncated_bodies_are_rejected_before_touching_the_destination() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        store
            .write_file("fd_zips/2021FD.zip", b"good copy")
            .await
            .expect("seed prior copy");
        let remote = OneBodyRemote {
            body: b"short".to_vec(),
        };

        let err = fetch_to_file(
            &remote,
            &store,
            "https://host/2021FD.zip",
            "fd_zips/2021FD.zip",
            Some(1000),
        )
        .await
        .expect_err("size mismatch");
        assert!(matches!(
            err,
            FetchError::Incomplete {
                expected: 1000,
                actual: 5,
                ..
            }
        ));

        let kept = std::fs::read(dir.path().join("fd_zips/2021FD.zip")).expect("read");
        assert_eq!(kept, b"good copy");
    }

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        let mut writer = zip::ZipWriter::new(&mut cursor);
        let options = zip::write::SimpleFileOptions::default();
        for (name, body) in entries {
            writer.start_file(*name, options).expect("start entry");
            writer.write_all(body).expect("write entry");
        }
        writer.finish().expect("finish zip");
        cursor.into_inner()
    }

    #[test]
    fn unpack_expands_all_entries() {
        let dir = tempdir().expect("tempdir");
        let archive_path = dir.path().join("2020FD.zip");
        std::fs::write(
            &archive_path,
            build_zip(&[("2020FD.xml", b"<FinancialDisclosure/>")]),
        )
        .expect("write archive");

        let out = dir.path().join("unpacked");
        unpack(&archive_path, &out).expect("unpack");
        let xml = std::fs::read_to_string(out.join("2020FD.xml")).expect("read entry");
        assert_eq!(xml, "<FinancialDisclosure/>");
    }

    #[test]
    fn corrupt_archives_are_reported_not_panicked() {
        let dir = tempdir().expect("tempdir");
        let archive_path = dir.path().join("2020FD.zip");
        std::fs::write(&archive_path, b"this is not a zip").expect("write junk");

        let err = unpack(&archive_path, &dir.path().join("unpacked"))
            .expect_err("junk must not unpack");
        assert!(matches!(err, UnpackError::Archive { .. }));
    }
}
