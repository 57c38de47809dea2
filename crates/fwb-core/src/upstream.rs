use std::{
    fs,
    path::{Path, PathBuf},
    time::SystemTime,
};

use async_trait::async_trait;
use chrono::DateTime;
use futures_util::StreamExt;
use reqwest::{header::LAST_MODIFIED, Client};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::ToolchainError;
use crate::toolchain::ToolchainKey;

pub const SNAPSHOT_VERSION: &str = "SNAPSHOT";

/// The distribution point serving checksum files and toolchain archives.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Location of `file_name` for a toolchain, used in logs and provenance.
    fn url(&self, key: &ToolchainKey, file_name: &str) -> String;

    /// Modification time of the remote file, without fetching its body.
    async fn last_modified(
        &self,
        key: &ToolchainKey,
        file_name: &str,
    ) -> Result<SystemTime, ToolchainError>;

    async fn download(
        &self,
        key: &ToolchainKey,
        file_name: &str,
        dest: &Path,
    ) -> Result<(), ToolchainError>;
}

/// HTTP(S) or local-directory mirror laid out like downloads.openwrt.org.
pub struct Mirror {
    base_url: String,
    client: Client,
}

impl Mirror {
    pub fn new(base_url: &str) -> Result<Self, ToolchainError> {
        let client = Client::builder()
            .user_agent("fwb-core")
            .build()
            .map_err(|e| ToolchainError::Download {
                url: base_url.to_string(),
                reason: format!("failed to build http client: {e}"),
            })?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

pub(crate) fn is_remote_url(url: &str) -> bool {
    url.starts_with("https://") || url.starts_with("http://")
}

pub(crate) fn local_path(url: &str) -> Option<PathBuf> {
    if let Some(rest) = url.strip_prefix("file://") {
        Some(PathBuf::from(rest))
    } else if url.starts_with('/') {
        Some(PathBuf::from(url))
    } else {
        None
    }
}

pub(crate) fn target_path(key: &ToolchainKey) -> String {
    if key.version == SNAPSHOT_VERSION {
        format!("snapshots/targets/{}", key.target)
    } else {
        format!("releases/{}/targets/{}", key.version, key.target)
    }
}

pub(crate) fn parse_http_date(value: &str) -> Option<SystemTime> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(SystemTime::from)
}

fn download_error(url: &str, reason: impl ToString) -> ToolchainError {
    ToolchainError::Download {
        url: url.to_string(),
        reason: reason.to_string(),
    }
}

#[async_trait]
impl Upstream for Mirror {
    fn url(&self, key: &ToolchainKey, file_name: &str) -> String {
        format!("{}/{}/{}", self.base_url, target_path(key), file_name)
    }

    async fn last_modified(
        &self,
        key: &ToolchainKey,
        file_name: &str,
    ) -> Result<SystemTime, ToolchainError> {
        let url = self.url(key, file_name);
        if !is_remote_url(&url) {
            let path = local_path(&url)
                .ok_or_else(|| download_error(&url, "mirror url is neither http nor a local path"))?;
            return fs::metadata(&path)
                .and_then(|meta| meta.modified())
                .map_err(|e| download_error(&url, e));
        }

        let resp = self
            .client
            .head(&url)
            .send()
            .await
            .map_err(|e| download_error(&url, e))?;
        if !resp.status().is_success() {
            return Err(download_error(
                &url,
                format!("metadata request failed with status {}", resp.status()),
            ));
        }
        let header = resp
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| download_error(&url, "response has no Last-Modified header"))?;
        parse_http_date(header)
            .ok_or_else(|| download_error(&url, format!("unparseable Last-Modified {header:?}")))
    }

    async fn download(
        &self,
        key: &ToolchainKey,
        file_name: &str,
        dest: &Path,
    ) -> Result<(), ToolchainError> {
        let url = self.url(key, file_name);
        tracing::info!("Downloading {url}");
        if !is_remote_url(&url) {
            let path = local_path(&url)
                .ok_or_else(|| download_error(&url, "mirror url is neither http nor a local path"))?;
            tokio::fs::copy(&path, dest)
                .await
                .map_err(|e| download_error(&url, e))?;
            return Ok(());
        }

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| download_error(&url, e))?;
        if !resp.status().is_success() {
            return Err(download_error(
                &url,
                format!("download failed with status {}", resp.status()),
            ));
        }

        let tmp = dest.with_extension(format!("tmp-{}", Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| download_error(&url, format!("failed to create temp file: {e}")))?;

        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    let _ = fs::remove_file(&tmp);
                    return Err(download_error(&url, format!("download read failed: {e}")));
                }
            };
            if let Err(e) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp);
                return Err(download_error(&url, format!("failed to write temp file: {e}")));
            }
        }

        file.flush()
            .await
            .map_err(|e| download_error(&url, format!("failed to flush temp file: {e}")))?;
        drop(file);

        fs::rename(&tmp, dest)
            .map_err(|e| download_error(&url, format!("failed to finalize download: {e}")))?;
        tracing::info!("Saved {}", dest.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Target;
    use std::time::Duration;

    fn key(version: &str) -> ToolchainKey {
        ToolchainKey::new(version, Target::new("ath79", "generic"))
    }

    #[test]
    fn snapshot_and_release_paths() {
        let mirror = Mirror::new("https://downloads.openwrt.org/").unwrap();
        assert_eq!(
            mirror.url(&key("SNAPSHOT"), "sha256sums"),
            "https://downloads.openwrt.org/snapshots/targets/ath79/generic/sha256sums"
        );
        assert_eq!(
            mirror.url(&key("23.05.0"), "sha256sums.sig"),
            "https://downloads.openwrt.org/releases/23.05.0/targets/ath79/generic/sha256sums.sig"
        );
    }

    #[test]
    fn http_dates_parse() {
        let parsed = parse_http_date("Wed, 21 Oct 2015 07:28:00 GMT").unwrap();
        let expected = SystemTime::UNIX_EPOCH + Duration::from_secs(1_445_412_480);
        assert_eq!(parsed, expected);
        assert!(parse_http_date("yesterday").is_none());
    }

    #[test]
    fn local_paths() {
        assert_eq!(local_path("file:///srv/mirror"), Some(PathBuf::from("/srv/mirror")));
        assert_eq!(local_path("/srv/mirror"), Some(PathBuf::from("/srv/mirror")));
        assert_eq!(local_path("ftp://x"), None);
        assert!(is_remote_url("http://localhost"));
    }

    #[tokio::test]
    async fn local_mirror_serves_files_and_mtimes() {
        let mirror_dir = tempfile::tempdir().unwrap();
        let files = mirror_dir.path().join("snapshots/targets/ath79/generic");
        fs::create_dir_all(&files).unwrap();
        fs::write(files.join("sha256sums"), "sums").unwrap();

        let base = format!("file://{}", mirror_dir.path().display());
        let mirror = Mirror::new(&base).unwrap();
        let out = tempfile::tempdir().unwrap();
        let dest = out.path().join("sums");
        mirror.download(&key("SNAPSHOT"), "sha256sums", &dest).await.unwrap();
        assert_eq!(fs::read_to_string(&dest).unwrap(), "sums");

        let modified = mirror.last_modified(&key("SNAPSHOT"), "sha256sums").await.unwrap();
        assert_eq!(
            modified,
            fs::metadata(files.join("sha256sums")).unwrap().modified().unwrap()
        );
        assert!(mirror
            .download(&key("SNAPSHOT"), "missing", &out.path().join("x"))
            .await
            .is_err());
    }
}
