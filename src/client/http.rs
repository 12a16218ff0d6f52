//! HTTP storage client
//!
//! Talks to the upload server's `/api/file` endpoints. Every response is
//! wrapped in a `{code, msg, data}` envelope where `code == 200` is success.

use super::{
    ByteProgress, ChunkUpload, ExponentialBackoff, MergeRequest, RemoteLocation, ResumeManifest,
    StorageClient,
};
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::future::Future;
use std::io;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Success code inside the response envelope
const SUCCESS_CODE: i32 = 200;

/// Body slice size; progress is reported once per slice pulled by the transport
const PROGRESS_SLICE: usize = 64 * 1024;

/// Response envelope used by every endpoint
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    code: i32,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

impl<T> ApiResponse<T> {
    fn into_result(self) -> Result<Option<T>> {
        if self.code != SUCCESS_CODE {
            return Err(Error::Remote {
                code: self.code,
                message: self.msg,
            });
        }
        Ok(self.data)
    }
}

/// `completed` arrives as a boolean or as 0/1
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Int(i64),
}

impl Flag {
    fn is_set(&self) -> bool {
        match self {
            Flag::Bool(b) => *b,
            Flag::Int(i) => *i != 0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProbePayload {
    completed: Option<Flag>,
    #[serde(default)]
    uploaded_chunks: Vec<usize>,
    url: Option<String>,
    location: Option<String>,
}

impl From<ProbePayload> for ResumeManifest {
    fn from(payload: ProbePayload) -> Self {
        ResumeManifest {
            completed: payload.completed.map(|f| f.is_set()).unwrap_or(false),
            uploaded_chunks: payload.uploaded_chunks.into_iter().collect(),
            location: payload.url.or(payload.location),
        }
    }
}

/// Storage client for the upload server's HTTP API
pub struct HttpStorageClient {
    http: reqwest::Client,
    base_url: String,
    retry_attempts: u32,
    retry_base_delay_ms: u64,
}

impl HttpStorageClient {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &config.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| Error::InvalidConfig("auth token is not a valid header".into()))?;
            headers.insert(AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(HttpStorageClient {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            retry_attempts: config.retry_attempts,
            retry_base_delay_ms: config.retry_base_delay_ms,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/file/{}", self.base_url, path)
    }

    /// Decode an envelope, mapping HTTP-level failures to `Error::Remote`
    async fn read_envelope<T: DeserializeOwned>(resp: reqwest::Response) -> Result<Option<T>> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Remote {
                code: i32::from(status.as_u16()),
                message: body,
            });
        }
        let envelope: ApiResponse<T> = resp.json().await?;
        envelope.into_result()
    }

    /// Run `op`, retrying transient failures with exponential backoff
    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff = ExponentialBackoff::new(self.retry_base_delay_ms, self.retry_attempts);

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    if let Some(delay) = backoff.next_delay() {
                        warn!("{} failed, retrying in {:?}: {}", what, delay, e);
                        tokio::time::sleep(delay).await;
                    } else {
                        error!("{} failed after {} retries: {}", what, backoff.attempts(), e);
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_chunk(&self, upload: &ChunkUpload, progress: &ByteProgress) -> Result<()> {
        let body =
            reqwest::Body::wrap_stream(progress_slices(upload.data.clone(), progress.clone()));
        let part = Part::stream_with_length(body, upload.data.len() as u64)
            .file_name(upload.file_name.clone());

        let form = Form::new()
            .text("filename", upload.file_name.clone())
            .part("file", part)
            .text("index", upload.index.to_string())
            .text("totalChunks", upload.total_chunks.to_string())
            .text("hash", upload.fingerprint.to_string())
            .text("path", upload.destination_path.clone());

        let resp = self
            .http
            .post(self.endpoint("upload"))
            .multipart(form)
            .send()
            .await?;
        Self::read_envelope::<serde_json::Value>(resp).await?;
        Ok(())
    }
}

/// Split `data` into slices, reporting cumulative bytes as each is pulled
fn progress_slices(
    data: Bytes,
    progress: ByteProgress,
) -> impl futures::Stream<Item = io::Result<Bytes>> + Send + Sync + 'static {
    let slices: Vec<Bytes> = (0..data.len())
        .step_by(PROGRESS_SLICE)
        .map(|start| data.slice(start..(start + PROGRESS_SLICE).min(data.len())))
        .collect();

    let mut sent = 0u64;
    futures::stream::iter(slices).map(move |slice| {
        sent += slice.len() as u64;
        progress(sent);
        Ok(slice)
    })
}

/// Location reported by a merge response, falling back to `<path>/<name>`
fn merge_location(data: Option<serde_json::Value>, request: &MergeRequest) -> String {
    let reported = data.as_ref().and_then(|value| {
        ["url", "location"]
            .iter()
            .find_map(|key| value.get(*key).and_then(|v| v.as_str()))
            .map(str::to_string)
    });

    reported.unwrap_or_else(|| {
        format!(
            "{}/{}",
            request.destination_path.trim_end_matches('/'),
            request.file_name
        )
    })
}

#[async_trait]
impl StorageClient for HttpStorageClient {
    async fn probe_upload(&self, fingerprint: &Fingerprint) -> Result<ResumeManifest> {
        let manifest = self
            .with_retry("Upload probe", move || {
                let request = self
                    .http
                    .get(self.endpoint("check-upload"))
                    .query(&[("quickHash", fingerprint.as_str())]);
                async move {
                    let payload = Self::read_envelope::<ProbePayload>(request.send().await?).await?;
                    Ok(payload.map(ResumeManifest::from).unwrap_or_default())
                }
            })
            .await?;

        debug!(
            fingerprint = %fingerprint,
            completed = manifest.completed,
            uploaded = manifest.uploaded_chunks.len(),
            "Probed upload state"
        );
        Ok(manifest)
    }

    async fn upload_chunk(&self, upload: ChunkUpload, progress: ByteProgress) -> Result<()> {
        let what = format!("Chunk {} upload", upload.index);
        let (chunk, progress) = (&upload, &progress);
        self.with_retry(&what, move || self.send_chunk(chunk, progress))
            .await
            .map_err(|e| Error::TransferFailure {
                index: upload.index,
                reason: e.to_string(),
            })
    }

    async fn merge_chunks(&self, request: &MergeRequest) -> Result<RemoteLocation> {
        let form = Form::new()
            .text("filename", request.file_name.clone())
            .text("size", request.total_size.to_string())
            .text("chunksCount", request.chunk_count.to_string())
            .text("path", request.destination_path.clone())
            .text("hash", request.fingerprint.to_string());

        let resp = self
            .http
            .post(self.endpoint("merge"))
            .multipart(form)
            .send()
            .await?;
        let data = Self::read_envelope::<serde_json::Value>(resp).await?;

        Ok(RemoteLocation {
            location: merge_location(data, request),
            deduplicated: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const TOKEN: &str = "secret-token";

    /// One request as seen by [`StubServer`]
    #[derive(Debug, Clone)]
    struct Received {
        method: String,
        target: String,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    }

    impl Received {
        fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
        }

        /// Value of a multipart form field
        fn field(&self, name: &str) -> Option<String> {
            let body = String::from_utf8_lossy(&self.body);
            let marker = format!("name=\"{}\"", name);
            let start = body.find(&marker)?;
            let value_start = start + body[start..].find("\r\n\r\n")? + 4;
            let value_end = value_start + body[value_start..].find("\r\n--")?;
            Some(body[value_start..value_end].to_string())
        }
    }

    /// Answers requests with scripted `(status, body)` pairs, repeating the
    /// last one, and records what it received.
    struct StubServer {
        base_url: String,
        received: Arc<Mutex<Vec<Received>>>,
    }

    impl StubServer {
        async fn start(responses: Vec<(u16, &'static str)>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let base_url = format!("http://{}", listener.local_addr().unwrap());
            let received = Arc::new(Mutex::new(Vec::new()));

            let log = received.clone();
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    let Some((mut socket, request)) = read_request(socket).await else {
                        continue;
                    };
                    let served = {
                        let mut log = log.lock();
                        log.push(request);
                        log.len()
                    };
                    let (status, body) = responses[(served - 1).min(responses.len() - 1)];
                    let response = format!(
                        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        if status == 200 { "OK" } else { "Error" },
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                }
            });

            StubServer { base_url, received }
        }

        fn received(&self) -> Vec<Received> {
            self.received.lock().clone()
        }

        fn client(&self, retry_attempts: u32) -> HttpStorageClient {
            HttpStorageClient::new(&ServerConfig {
                base_url: self.base_url.clone(),
                auth_token: Some(TOKEN.to_string()),
                request_timeout_secs: 5,
                retry_attempts,
                retry_base_delay_ms: 1,
            })
            .unwrap()
        }
    }

    async fn read_request(mut socket: TcpStream) -> Option<(TcpStream, Received)> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 8192];
        let header_end = loop {
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            let n = socket.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            buf.extend_from_slice(&chunk[..n]);
        };

        let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let mut lines = head.split("\r\n");
        let mut request_line = lines.next()?.split_whitespace();
        let method = request_line.next()?.to_string();
        let target = request_line.next()?.to_string();
        let headers: Vec<(String, String)> = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
            .collect();

        let length = headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .and_then(|(_, v)| v.parse::<usize>().ok())
            .unwrap_or(0);
        while buf.len() < header_end + length {
            let n = socket.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        let body = buf[header_end..header_end + length].to_vec();

        Some((
            socket,
            Received {
                method,
                target,
                headers,
                body,
            },
        ))
    }

    fn chunk_upload(data: &'static [u8]) -> ChunkUpload {
        ChunkUpload {
            file_name: "video.mp4".to_string(),
            fingerprint: fingerprint(),
            index: 1,
            total_chunks: 3,
            destination_path: "my-files/".to_string(),
            data: Bytes::from_static(data),
        }
    }

    const OK_EMPTY: &str = r#"{"code":200,"msg":"ok","data":null}"#;
    const UNAVAILABLE: &str = "upstream unavailable";

    fn fingerprint() -> Fingerprint {
        Fingerprint::parse(&blake3::hash(b"content").to_hex()).unwrap()
    }

    fn merge_request() -> MergeRequest {
        MergeRequest {
            file_name: "video.mp4".to_string(),
            fingerprint: fingerprint(),
            total_size: 23_000_000,
            chunk_count: 5,
            destination_path: "my-files/".to_string(),
        }
    }

    #[test]
    fn test_probe_payload_with_integer_flag() {
        let body = r#"{"code":200,"msg":"success","data":{"completed":0,"uploadedChunks":[0,1]}}"#;
        let envelope: ApiResponse<ProbePayload> = serde_json::from_str(body).unwrap();
        let manifest: ResumeManifest = envelope.into_result().unwrap().unwrap().into();

        assert!(!manifest.completed);
        assert!(manifest.is_uploaded(0));
        assert!(manifest.is_uploaded(1));
        assert!(!manifest.is_uploaded(2));
    }

    #[test]
    fn test_probe_payload_completed() {
        let body = r#"{"code":200,"data":{"completed":true,"url":"my-files/a.bin"}}"#;
        let envelope: ApiResponse<ProbePayload> = serde_json::from_str(body).unwrap();
        let manifest: ResumeManifest = envelope.into_result().unwrap().unwrap().into();

        assert!(manifest.completed);
        assert!(manifest.uploaded_chunks.is_empty());
        assert_eq!(manifest.location.as_deref(), Some("my-files/a.bin"));
    }

    #[test]
    fn test_envelope_error_code() {
        let body = r#"{"code":401,"msg":"token expired","data":null}"#;
        let envelope: ApiResponse<serde_json::Value> = serde_json::from_str(body).unwrap();
        match envelope.into_result() {
            Err(Error::Remote { code, message }) => {
                assert_eq!(code, 401);
                assert_eq!(message, "token expired");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_merge_location_fallback() {
        let request = merge_request();
        let message = Some(serde_json::json!("merged"));
        assert_eq!(merge_location(message, &request), "my-files/video.mp4");
        assert_eq!(merge_location(None, &request), "my-files/video.mp4");

        let reported = Some(serde_json::json!({"location": "store/abc"}));
        assert_eq!(merge_location(reported, &request), "store/abc");
    }

    #[test]
    fn test_endpoint_trims_base_url() {
        let config = ServerConfig {
            base_url: "http://localhost:8080/".to_string(),
            ..Default::default()
        };
        let client = HttpStorageClient::new(&config).unwrap();
        assert_eq!(
            client.endpoint("merge"),
            "http://localhost:8080/api/file/merge"
        );
    }

    #[tokio::test]
    async fn test_progress_slices_report_cumulative_bytes() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress: ByteProgress = Arc::new(move |n| sink.lock().push(n));

        let data = Bytes::from(vec![7u8; PROGRESS_SLICE * 2 + 10]);
        let mut stream = Box::pin(progress_slices(data.clone(), progress));
        let mut rebuilt = Vec::new();
        while let Some(slice) = stream.next().await {
            rebuilt.extend_from_slice(&slice.unwrap());
        }

        assert_eq!(rebuilt, data.to_vec());
        assert_eq!(
            *seen.lock(),
            vec![
                PROGRESS_SLICE as u64,
                2 * PROGRESS_SLICE as u64,
                2 * PROGRESS_SLICE as u64 + 10
            ]
        );
    }
    #[tokio::test]
    async fn test_probe_retries_until_server_recovers() {
        let server = StubServer::start(vec![
            (503, UNAVAILABLE),
            (503, UNAVAILABLE),
            (200, r#"{"code":200,"msg":"ok","data":{"completed":false,"uploadedChunks":[0,2]}}"#),
        ])
        .await;

        let manifest = server.client(3).probe_upload(&fingerprint()).await.unwrap();
        assert!(!manifest.completed);
        assert!(manifest.is_uploaded(0));
        assert!(manifest.is_uploaded(2));

        let received = server.received();
        assert_eq!(received.len(), 3);
        for request in &received {
            assert_eq!(request.method, "GET");
            assert_eq!(
                request.target,
                format!("/api/file/check-upload?quickHash={}", fingerprint())
            );
            assert_eq!(
                request.header("authorization"),
                Some(format!("Bearer {}", TOKEN).as_str())
            );
        }
    }

    #[tokio::test]
    async fn test_probe_gives_up_after_retry_budget() {
        let server = StubServer::start(vec![(503, UNAVAILABLE)]).await;

        match server.client(2).probe_upload(&fingerprint()).await {
            Err(Error::Remote { code, message }) => {
                assert_eq!(code, 503);
                assert_eq!(message, UNAVAILABLE);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(server.received().len(), 3);
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let server =
            StubServer::start(vec![(200, r#"{"code":401,"msg":"token expired","data":null}"#)])
                .await;

        let result = server.client(3).probe_upload(&fingerprint()).await;
        assert!(matches!(result, Err(Error::Remote { code: 401, .. })));
        assert_eq!(server.received().len(), 1);
    }

    #[tokio::test]
    async fn test_upload_chunk_sends_form_after_retry() {
        let server = StubServer::start(vec![(503, UNAVAILABLE), (200, OK_EMPTY)]).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress: ByteProgress = Arc::new(move |n: u64| sink.lock().push(n));

        server
            .client(3)
            .upload_chunk(chunk_upload(b"chunk-bytes"), progress)
            .await
            .unwrap();

        let received = server.received();
        assert_eq!(received.len(), 2);
        let request = &received[1];
        assert_eq!(request.method, "POST");
        assert_eq!(request.target, "/api/file/upload");
        assert!(request
            .header("content-type")
            .unwrap()
            .starts_with("multipart/form-data"));
        assert_eq!(
            request.header("authorization"),
            Some(format!("Bearer {}", TOKEN).as_str())
        );
        assert_eq!(request.field("filename").as_deref(), Some("video.mp4"));
        assert_eq!(request.field("file").as_deref(), Some("chunk-bytes"));
        assert_eq!(request.field("index").as_deref(), Some("1"));
        assert_eq!(request.field("totalChunks").as_deref(), Some("3"));
        assert_eq!(request.field("hash"), Some(fingerprint().to_string()));
        assert_eq!(request.field("path").as_deref(), Some("my-files/"));

        assert_eq!(seen.lock().last().copied(), Some(11));
    }

    #[tokio::test]
    async fn test_upload_chunk_exhausted_is_transfer_failure() {
        let server = StubServer::start(vec![(500, UNAVAILABLE)]).await;
        let progress: ByteProgress = Arc::new(|_: u64| {});

        let result = server
            .client(1)
            .upload_chunk(chunk_upload(b"chunk-bytes"), progress)
            .await;
        assert!(matches!(result, Err(Error::TransferFailure { index: 1, .. })));
        assert_eq!(server.received().len(), 2);
    }

    #[tokio::test]
    async fn test_merge_is_sent_once() {
        let server = StubServer::start(vec![(503, UNAVAILABLE), (200, OK_EMPTY)]).await;

        let result = server.client(3).merge_chunks(&merge_request()).await;
        assert!(matches!(result, Err(Error::Remote { code: 503, .. })));

        let received = server.received();
        assert_eq!(received.len(), 1);
        let request = &received[0];
        assert_eq!(request.target, "/api/file/merge");
        assert_eq!(request.field("filename").as_deref(), Some("video.mp4"));
        assert_eq!(request.field("size").as_deref(), Some("23000000"));
        assert_eq!(request.field("chunksCount").as_deref(), Some("5"));
        assert_eq!(request.field("path").as_deref(), Some("my-files/"));
        assert_eq!(request.field("hash"), Some(fingerprint().to_string()));
    }

    #[tokio::test]
    async fn test_merge_reports_location() {
        let server = StubServer::start(vec![(
            200,
            r#"{"code":200,"msg":"ok","data":"merge succeeded"}"#,
        )])
        .await;

        let location = server.client(3).merge_chunks(&merge_request()).await.unwrap();
        assert_eq!(location.location, "my-files/video.mp4");
        assert!(!location.deduplicated);
        assert_eq!(server.received().len(), 1);
    }
}
