//! Remote filesystem operations over the data plane.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use sandbox_proto::{EntryInfo, Request, Response};

use crate::error::{Error, Result};
use crate::session::{Session, expect_bool, expect_data, expect_ok};
use crate::signature::{UrlOperation, sign};

/// Default user for signed file URLs.
const DEFAULT_URL_USER: &str = "user";

/// Options for building a signed upload/download URL.
#[derive(Debug, Clone)]
pub struct UrlOptions {
    user: String,
    expires_in: Option<Duration>,
}

impl Default for UrlOptions {
    fn default() -> Self {
        Self {
            user: DEFAULT_URL_USER.to_string(),
            expires_in: None,
        }
    }
}

impl UrlOptions {
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Make the URL expire after the given duration.
    pub fn expires_in(mut self, expires_in: Duration) -> Self {
        self.expires_in = Some(expires_in);
        self
    }
}

/// Filesystem controller for one sandbox session.
#[derive(Clone)]
pub struct Files {
    pub(crate) session: Arc<Session>,
    pub(crate) host: String,
    pub(crate) token: String,
}

impl Files {
    /// Read a file's contents.
    pub async fn read(&self, path: impl Into<String>) -> Result<Vec<u8>> {
        let response = self
            .session
            .call(Request::FsRead { path: path.into() }, None)
            .await?;
        expect_data(response)
    }

    /// Write a file, creating it and any missing parent directories.
    pub async fn write(&self, path: impl Into<String>, data: impl Into<Vec<u8>>) -> Result<()> {
        let response = self
            .session
            .call(
                Request::FsWrite {
                    path: path.into(),
                    data: data.into(),
                },
                None,
            )
            .await?;
        expect_ok(response)
    }

    /// List a directory.
    pub async fn list(&self, path: impl Into<String>) -> Result<Vec<EntryInfo>> {
        match self
            .session
            .call(Request::FsList { path: path.into() }, None)
            .await?
        {
            Response::Entries(entries) => Ok(entries),
            other => Err(Error::Sandbox(format!(
                "unexpected response shape: {other:?}"
            ))),
        }
    }

    /// Remove a file or directory. Returns `false` if the path was already
    /// gone; remove is idempotent and never raises not-found.
    pub async fn remove(&self, path: impl Into<String>) -> Result<bool> {
        match self
            .session
            .call(Request::FsRemove { path: path.into() }, None)
            .await
        {
            Ok(response) => expect_bool(response),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Rename (move) a file or directory.
    pub async fn rename(&self, from: impl Into<String>, to: impl Into<String>) -> Result<()> {
        let response = self
            .session
            .call(
                Request::FsRename {
                    from: from.into(),
                    to: to.into(),
                },
                None,
            )
            .await?;
        expect_ok(response)
    }

    /// Create a directory (and parents). Returns `false` if it already
    /// existed.
    pub async fn make_dir(&self, path: impl Into<String>) -> Result<bool> {
        let response = self
            .session
            .call(Request::FsMakeDir { path: path.into() }, None)
            .await?;
        expect_bool(response)
    }

    /// Whether a path exists.
    pub async fn exists(&self, path: impl Into<String>) -> Result<bool> {
        let response = self
            .session
            .call(Request::FsExists { path: path.into() }, None)
            .await?;
        expect_bool(response)
    }

    /// Signed URL for downloading a file directly from the daemon.
    pub fn download_url(&self, path: &str, options: &UrlOptions) -> Result<String> {
        self.signed_url(path, UrlOperation::Read, options)
    }

    /// Signed URL for uploading a file directly to the daemon.
    pub fn upload_url(&self, path: &str, options: &UrlOptions) -> Result<String> {
        self.signed_url(path, UrlOperation::Write, options)
    }

    fn signed_url(&self, path: &str, operation: UrlOperation, options: &UrlOptions) -> Result<String> {
        let expiration = options
            .expires_in
            .map(|d| Utc::now().timestamp().saturating_add(d.as_secs() as i64));
        let signature = sign(path, operation, &options.user, &self.token, expiration);

        let mut url = url::Url::parse(&format!("https://{}/files", self.host))
            .map_err(|e| Error::InvalidArgument(format!("invalid daemon host: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("path", path);
            query.append_pair("username", &options.user);
            query.append_pair("signature", &signature);
            if let Some(expiration) = expiration {
                query.append_pair("signature_expiration", &expiration.to_string());
            }
        }
        Ok(url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use crate::transport::test_connection;

    fn files() -> Files {
        Files {
            session: Arc::new(Session::new(
                test_connection(),
                Duration::from_secs(1),
                None,
            )),
            host: "127.0.0.1:49733".to_string(),
            token: "tok".to_string(),
        }
    }

    #[test]
    fn download_url_carries_signature() {
        let files = files();
        let url = files
            .download_url("/home/user/a.txt", &UrlOptions::default())
            .unwrap();
        assert!(url.starts_with("https://127.0.0.1:49733/files?"));
        assert!(url.contains("path=%2Fhome%2Fuser%2Fa.txt"));
        assert!(url.contains("username=user"));
        assert!(url.contains("signature=v1_"));
        assert!(!url.contains("signature_expiration"));
    }

    #[test]
    fn upload_url_with_expiration() {
        let files = files();
        let url = files
            .upload_url(
                "/data.bin",
                &UrlOptions::default()
                    .user("root")
                    .expires_in(Duration::from_secs(600)),
            )
            .unwrap();
        assert!(url.contains("username=root"));
        assert!(url.contains("signature_expiration="));
    }

    #[test]
    fn upload_and_download_signatures_differ() {
        let files = files();
        let opts = UrlOptions::default();
        let down = files.download_url("/f", &opts).unwrap();
        let up = files.upload_url("/f", &opts).unwrap();
        assert_ne!(down, up);
    }
}
