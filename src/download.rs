use crate::error::classify_reqwest;
use crate::{Error, Result};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

const DOWNLOAD_SOURCE: &str = "download";

/// Streams a winning PDF URL to the local filesystem.
///
/// Verification stops at content-type and a `%PDF` signature check; we make
/// no attempt to validate the document body.
pub struct PdfDownloader {
    client: reqwest::Client,
    directory: PathBuf,
}

impl PdfDownloader {
    pub fn new(directory: PathBuf, user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .user_agent(user_agent)
            .build()
            .map_err(|e| Error::Config(format!("failed to build download client: {e}")))?;
        Ok(Self { client, directory })
    }

    /// Download `pdf_url` into the configured directory, returning the local
    /// path. The filename combines a sanitized title with a URL hash so
    /// distinct papers with similar titles do not clobber each other.
    pub async fn download(&self, pdf_url: &str, title: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| Error::Cache {
                operation: "create download dir".to_string(),
                reason: e.to_string(),
            })?;

        let target = url::Url::parse(pdf_url).map_err(|e| Error::InvalidInput {
            field: "pdf_url".to_string(),
            reason: e.to_string(),
        })?;

        let response = self
            .client
            .get(target)
            .send()
            .await
            .map_err(|e| classify_reqwest(&e, DOWNLOAD_SOURCE))?;

        let status = response.status();
        if !status.is_success() {
            return Err(crate::error::classify_status(
                status.as_u16(),
                response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok()),
                DOWNLOAD_SOURCE,
                "pdf download failed",
            ));
        }

        let content_type_is_pdf = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("application/pdf"));

        let path = self.target_path(pdf_url, title);
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| Error::Cache {
                operation: "create file".to_string(),
                reason: e.to_string(),
            })?;

        // Any failure past this point leaves a partial file unless we
        // remove it before surfacing the error
        let checksum = match stream_to_file(response, content_type_is_pdf, &mut file).await {
            Ok(checksum) => checksum,
            Err(e) => {
                drop(file);
                let _ = tokio::fs::remove_file(&path).await;
                return Err(e);
            }
        };

        info!(path = %path.display(), checksum = &checksum[..16], "downloaded pdf");
        Ok(path)
    }

    fn target_path(&self, pdf_url: &str, title: &str) -> PathBuf {
        let stem = sanitize_file_stem(title);
        let mut hasher = Sha256::new();
        hasher.update(pdf_url.as_bytes());
        let hash = format!("{:x}", hasher.finalize());
        self.directory.join(format!("{stem}-{}.pdf", &hash[..8]))
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

/// Stream the response body into `file`, returning the hex SHA-256 of the
/// written bytes. The first chunk carries the `%PDF` signature check when
/// the content type was inconclusive.
async fn stream_to_file(
    response: reqwest::Response,
    content_type_is_pdf: bool,
    file: &mut tokio::fs::File,
) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut first_chunk = true;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| classify_reqwest(&e, DOWNLOAD_SOURCE))?;
        if first_chunk {
            first_chunk = false;
            if !content_type_is_pdf && !chunk.starts_with(b"%PDF") {
                return Err(Error::Parse {
                    context: "pdf download".to_string(),
                    message: "response is neither application/pdf nor %PDF-signed".to_string(),
                });
            }
        }
        hasher.update(&chunk);
        file.write_all(&chunk).await.map_err(|e| Error::Cache {
            operation: "write file".to_string(),
            reason: e.to_string(),
        })?;
    }
    file.flush().await.map_err(|e| Error::Cache {
        operation: "flush file".to_string(),
        reason: e.to_string(),
    })?;

    Ok(format!("{:x}", hasher.finalize()))
}

fn sanitize_file_stem(title: &str) -> String {
    let mut stem: String = title
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    stem.truncate(60);
    if stem.is_empty() {
        stem.push_str("paper");
    }
    debug!(%title, %stem, "derived download file stem");
    stem
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_file_stem() {
        assert_eq!(
            sanitize_file_stem("Attention Is All You Need"),
            "attention_is_all_you_need"
        );
        assert_eq!(sanitize_file_stem(""), "paper");
    }

    #[test]
    fn test_target_path_distinguishes_urls() {
        let downloader =
            PdfDownloader::new(std::env::temp_dir(), "paper-fetcher-test").unwrap();
        let a = downloader.target_path("https://a/1.pdf", "Same Title");
        let b = downloader.target_path("https://b/2.pdf", "Same Title");
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_download_rejects_non_pdf_payload() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_string("<html>captcha</html>"),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let downloader =
            PdfDownloader::new(dir.path().to_path_buf(), "paper-fetcher-test").unwrap();
        let result = downloader.download(&server.uri(), "some paper").await;
        assert!(matches!(result, Err(Error::Parse { .. })));

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        assert!(
            entries.next_entry().await.unwrap().is_none(),
            "rejected download left a file behind"
        );
    }

    #[tokio::test]
    async fn test_truncated_stream_leaves_no_partial_file() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Advertise a large body, send a valid PDF prefix, then hang up
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let head = "HTTP/1.1 200 OK\r\n\
                        content-type: application/pdf\r\n\
                        content-length: 100000\r\n\r\n";
            let _ = socket.write_all(head.as_bytes()).await;
            let _ = socket.write_all(b"%PDF-1.4 truncated").await;
            let _ = socket.flush().await;
        });

        let dir = tempfile::tempdir().unwrap();
        let downloader =
            PdfDownloader::new(dir.path().to_path_buf(), "paper-fetcher-test").unwrap();
        let result = downloader
            .download(&format!("http://{addr}/paper.pdf"), "some paper")
            .await;
        assert!(result.is_err());

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        assert!(
            entries.next_entry().await.unwrap().is_none(),
            "failed download left a partial file behind"
        );
    }

    #[tokio::test]
    async fn test_download_accepts_pdf_signature() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/octet-stream")
                    .set_body_bytes(b"%PDF-1.4 fake body".to_vec()),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let downloader =
            PdfDownloader::new(dir.path().to_path_buf(), "paper-fetcher-test").unwrap();
        let path = downloader
            .download(&server.uri(), "some paper")
            .await
            .unwrap();
        let contents = tokio::fs::read(&path).await.unwrap();
        assert!(contents.starts_with(b"%PDF"));
    }
}
