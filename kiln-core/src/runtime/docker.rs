//! Docker Engine API adapter.
//!
//! Talks HTTP/1.1 straight over the daemon socket instead of going
//! through a typed client: the progress stream must reach the log writer
//! byte-for-byte so that unknown fields survive the trip to the manager
//! and reassembly of split JSON objects stays in one place. One
//! connection per request, `Connection: close`.

use super::{
    BuildImageOptions, ContainerRuntime, ImageDetails, PruneReport, PullImageOptions,
    PushImageOptions, RegistryAuth, TagImageOptions,
};
use crate::error::{KilnError, Result};
use crate::logstream::LogWriter;
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::{Seek, SeekFrom};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

/// Where the daemon listens.
#[derive(Debug, Clone)]
enum DockerHost {
    Unix(PathBuf),
    Tcp(String),
}

impl DockerHost {
    fn parse(host: &str) -> Result<Self> {
        if let Some(path) = host.strip_prefix("unix://") {
            Ok(Self::Unix(PathBuf::from(path)))
        } else if let Some(addr) = host.strip_prefix("tcp://").or_else(|| host.strip_prefix("http://")) {
            Ok(Self::Tcp(addr.to_string()))
        } else {
            Err(KilnError::Config { reason: format!("unsupported docker host: {host}") })
        }
    }
}

trait Connection: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Connection for T {}

/// Adapter for a Docker daemon.
pub struct DockerRuntime {
    host: DockerHost,
}

impl DockerRuntime {
    pub fn new(host: &str) -> Result<Self> {
        Ok(Self { host: DockerHost::parse(host)? })
    }

    async fn connect(&self) -> Result<Box<dyn Connection>> {
        match &self.host {
            DockerHost::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await.map_err(|err| {
                    KilnError::Internal(format!("failed to connect to docker host: {err}"))
                })?;
                Ok(Box::new(stream))
            }
            DockerHost::Tcp(addr) => {
                let stream = tokio::net::TcpStream::connect(addr).await.map_err(|err| {
                    KilnError::Internal(format!("failed to connect to docker host: {err}"))
                })?;
                Ok(Box::new(stream))
            }
        }
    }

    /// Sends one request and returns the response with its body still
    /// unread.
    async fn request(
        &self,
        method: &str,
        path_and_query: &str,
        headers: &[(String, String)],
        body: Body,
    ) -> Result<Response> {
        let mut stream = self.connect().await?;

        let mut head = format!("{method} {path_and_query} HTTP/1.1\r\nHost: docker\r\nConnection: close\r\n");
        for (name, value) in headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        match &body {
            Body::Empty => head.push_str("Content-Length: 0\r\n\r\n"),
            Body::TarFile(file) => {
                let len = file.metadata().map_err(KilnError::internal)?.len();
                head.push_str(&format!(
                    "Content-Type: application/x-tar\r\nContent-Length: {len}\r\n\r\n"
                ));
            }
        }

        stream.write_all(head.as_bytes()).await.map_err(KilnError::internal)?;

        if let Body::TarFile(mut file) = body {
            file.seek(SeekFrom::Start(0)).map_err(KilnError::internal)?;
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = std::io::Read::read(&mut file, &mut buf).map_err(KilnError::internal)?;
                if n == 0 {
                    break;
                }
                stream.write_all(&buf[..n]).await.map_err(KilnError::internal)?;
            }
        }
        stream.flush().await.map_err(KilnError::internal)?;

        Response::read(BufReader::new(stream)).await
    }

    /// Runs a streaming endpoint, feeding every body chunk to the log
    /// writer as it arrives.
    async fn stream_request(
        &self,
        method: &str,
        path_and_query: &str,
        headers: &[(String, String)],
        body: Body,
        output: &dyn LogWriter,
    ) -> Result<()> {
        let mut response = self.request(method, path_and_query, headers, body).await?;
        if !response.ok() {
            return Err(response.into_error().await);
        }

        while let Some(chunk) = response.body.next_chunk().await? {
            output.write(&chunk).await?;
        }
        Ok(())
    }

    /// Runs a request/response endpoint, buffering the whole body.
    async fn call(
        &self,
        method: &str,
        path_and_query: &str,
        headers: &[(String, String)],
    ) -> Result<Vec<u8>> {
        let mut response = self.request(method, path_and_query, headers, Body::Empty).await?;
        if !response.ok() {
            return Err(response.into_error().await);
        }
        response.body.collect().await
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn build_image(&self, opts: BuildImageOptions, output: &dyn LogWriter) -> Result<()> {
        // The daemon takes the build context as a tar body.
        let mut file = tempfile::tempfile().map_err(KilnError::internal)?;
        {
            let mut builder = tar::Builder::new(&mut file);
            builder.append_dir_all(".", &opts.context_dir).map_err(|err| {
                KilnError::Internal(format!("failed to tar build context: {err}"))
            })?;
            builder.finish().map_err(|err| {
                KilnError::Internal(format!("failed to tar build context: {err}"))
            })?;
        }

        let mut query = format!(
            "t={}&dockerfile={}&nocache={}&rm={}&forcerm={}",
            query_escape(&opts.name),
            query_escape(&opts.dockerfile),
            bool_param(opts.no_cache),
            bool_param(opts.rm_tmp_container),
            bool_param(opts.force_rm_tmp_container),
        );
        if !opts.cache_from.is_empty() {
            let cache_from =
                serde_json::to_string(&opts.cache_from).map_err(KilnError::internal)?;
            query.push_str(&format!("&cachefrom={}", query_escape(&cache_from)));
        }

        debug!("docker build query: {query}");
        self.stream_request("POST", &format!("/build?{query}"), &[], Body::TarFile(file), output)
            .await
    }

    async fn pull_image(
        &self,
        opts: PullImageOptions,
        auth: RegistryAuth,
        output: &dyn LogWriter,
    ) -> Result<()> {
        let query = format!(
            "fromImage={}&tag={}",
            query_escape(&opts.repository),
            query_escape(&opts.tag)
        );
        self.stream_request(
            "POST",
            &format!("/images/create?{query}"),
            &auth_headers(&auth),
            Body::Empty,
            output,
        )
        .await
    }

    async fn push_image(
        &self,
        opts: PushImageOptions,
        auth: RegistryAuth,
        output: &dyn LogWriter,
    ) -> Result<()> {
        let path = format!(
            "/images/{}/push?tag={}",
            path_escape(&opts.repository),
            query_escape(&opts.tag)
        );
        self.stream_request("POST", &path, &auth_headers(&auth), Body::Empty, output).await
    }

    async fn tag_image(&self, name: &str, opts: TagImageOptions) -> Result<()> {
        let path = format!(
            "/images/{}/tag?repo={}&tag={}&force={}",
            path_escape(name),
            query_escape(&opts.repository),
            query_escape(&opts.tag),
            bool_param(opts.force),
        );
        self.call("POST", &path, &[]).await.map(|_| ())
    }

    async fn inspect_image(&self, name: &str) -> Result<ImageDetails> {
        #[derive(Deserialize)]
        struct Inspect {
            #[serde(rename = "Id")]
            id: String,
            #[serde(default, rename = "RepoDigests")]
            repo_digests: Vec<String>,
        }

        let body = self.call("GET", &format!("/images/{}/json", path_escape(name)), &[]).await?;
        let inspect: Inspect = serde_json::from_slice(&body)
            .map_err(|err| KilnError::Internal(format!("failed to parse image inspect: {err}")))?;
        Ok(ImageDetails { id: inspect.id, repo_digests: inspect.repo_digests })
    }

    async fn remove_image(&self, name: &str, force: bool) -> Result<()> {
        let path = format!("/images/{}?force={}", path_escape(name), bool_param(force));
        self.call("DELETE", &path, &[]).await.map(|_| ())
    }

    async fn prune_images(&self) -> Result<PruneReport> {
        #[derive(Deserialize)]
        struct Pruned {
            #[serde(default, rename = "Untagged")]
            untagged: String,
            #[serde(default, rename = "Deleted")]
            deleted: String,
        }

        #[derive(Deserialize)]
        struct Report {
            #[serde(default, rename = "ImagesDeleted")]
            images_deleted: Option<Vec<Pruned>>,
            #[serde(default, rename = "SpaceReclaimed")]
            space_reclaimed: i64,
        }

        let body = self.call("POST", "/images/prune", &[]).await?;
        let report: Report = serde_json::from_slice(&body)
            .map_err(|err| KilnError::Internal(format!("failed to parse prune report: {err}")))?;

        let images_deleted = report
            .images_deleted
            .unwrap_or_default()
            .into_iter()
            // Whether an image was untagged or fully deleted makes no
            // difference to the caller.
            .map(|img| if img.untagged.is_empty() { img.deleted } else { img.untagged })
            .collect();

        Ok(PruneReport { images_deleted, space_reclaimed: report.space_reclaimed })
    }
}

enum Body {
    Empty,
    TarFile(std::fs::File),
}

/// Credentials ride base64-encoded in the X-Registry-Auth header.
fn auth_headers(auth: &RegistryAuth) -> Vec<(String, String)> {
    if auth.is_empty() {
        return Vec::new();
    }
    let config = serde_json::json!({
        "username": auth.username,
        "password": auth.password,
    });
    let encoded = base64::engine::general_purpose::URL_SAFE.encode(config.to_string());
    vec![("X-Registry-Auth".to_string(), encoded)]
}

fn bool_param(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

/// RFC 3986 escaping for query values.
fn query_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Escaping for image names inside a path: slashes separate repository
/// components and must survive.
fn path_escape(value: &str) -> String {
    value.split('/').map(query_escape).collect::<Vec<_>>().join("/")
}

/// A response whose body has not been consumed yet.
struct Response {
    status: u16,
    body: BodyReader,
}

impl Response {
    async fn read(mut reader: BufReader<Box<dyn Connection>>) -> Result<Self> {
        let mut status_line = String::new();
        reader.read_line(&mut status_line).await.map_err(KilnError::internal)?;
        let status: u16 = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse().ok())
            .ok_or_else(|| {
                KilnError::Internal(format!("malformed response status line: {status_line:?}"))
            })?;

        let mut headers = HashMap::new();
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).await.map_err(KilnError::internal)?;
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_lowercase(), value.trim().to_string());
            }
        }

        let kind = if headers
            .get("transfer-encoding")
            .map(|te| te.eq_ignore_ascii_case("chunked"))
            .unwrap_or(false)
        {
            BodyKind::Chunked { remaining: 0 }
        } else if let Some(length) = headers.get("content-length").and_then(|v| v.parse().ok()) {
            BodyKind::Length { remaining: length }
        } else {
            BodyKind::UntilClose
        };

        Ok(Self { status, body: BodyReader { reader, kind, done: false } })
    }

    fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turns an error response into a KilnError carrying the daemon's
    /// message.
    async fn into_error(mut self) -> KilnError {
        #[derive(Deserialize)]
        struct DaemonError {
            message: String,
        }

        let body = self.body.collect().await.unwrap_or_default();
        let message = serde_json::from_slice::<DaemonError>(&body)
            .map(|err| err.message)
            .unwrap_or_else(|_| String::from_utf8_lossy(&body).into_owned());
        KilnError::Internal(format!("docker daemon returned {}: {}", self.status, message.trim()))
    }
}

enum BodyKind {
    Chunked { remaining: u64 },
    Length { remaining: u64 },
    UntilClose,
}

/// Incremental body reader handling chunked transfer encoding,
/// content-length bodies and close-delimited bodies.
struct BodyReader {
    reader: BufReader<Box<dyn Connection>>,
    kind: BodyKind,
    done: bool,
}

impl BodyReader {
    /// Returns the next piece of the body, or `None` at the end.
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }

        match &mut self.kind {
            BodyKind::Chunked { remaining } => {
                if *remaining == 0 {
                    let mut size_line = String::new();
                    self.reader.read_line(&mut size_line).await.map_err(KilnError::internal)?;
                    let size = u64::from_str_radix(
                        size_line.trim().split(';').next().unwrap_or("").trim(),
                        16,
                    )
                    .map_err(|_| {
                        KilnError::Internal(format!("malformed chunk size: {size_line:?}"))
                    })?;

                    if size == 0 {
                        // Trailer-less end: consume the final CRLF.
                        let mut crlf = String::new();
                        let _ = self.reader.read_line(&mut crlf).await;
                        self.done = true;
                        return Ok(None);
                    }
                    *remaining = size;
                }

                let take = (*remaining).min(16 * 1024) as usize;
                let mut buf = vec![0u8; take];
                let n = self.reader.read(&mut buf).await.map_err(KilnError::internal)?;
                if n == 0 {
                    return Err(KilnError::Internal("unexpected EOF inside chunk".to_string()));
                }
                buf.truncate(n);
                *remaining -= n as u64;

                if *remaining == 0 {
                    // Chunk data is followed by CRLF.
                    let mut crlf = [0u8; 2];
                    self.reader.read_exact(&mut crlf).await.map_err(KilnError::internal)?;
                }
                Ok(Some(buf))
            }

            BodyKind::Length { remaining } => {
                if *remaining == 0 {
                    self.done = true;
                    return Ok(None);
                }
                let take = (*remaining).min(16 * 1024) as usize;
                let mut buf = vec![0u8; take];
                let n = self.reader.read(&mut buf).await.map_err(KilnError::internal)?;
                if n == 0 {
                    return Err(KilnError::Internal("unexpected EOF in response body".to_string()));
                }
                buf.truncate(n);
                *remaining -= n as u64;
                Ok(Some(buf))
            }

            BodyKind::UntilClose => {
                let mut buf = vec![0u8; 16 * 1024];
                let n = self.reader.read(&mut buf).await.map_err(KilnError::internal)?;
                if n == 0 {
                    self.done = true;
                    return Ok(None);
                }
                buf.truncate(n);
                Ok(Some(buf))
            }
        }
    }

    async fn collect(&mut self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logstream::testing::CapturingClient;
    use crate::logstream::JsonLogWriter;
    use std::sync::Arc;

    #[test]
    fn test_host_parsing() {
        assert!(matches!(
            DockerHost::parse("unix:///var/run/docker.sock"),
            Ok(DockerHost::Unix(path)) if path == PathBuf::from("/var/run/docker.sock")
        ));
        assert!(matches!(
            DockerHost::parse("tcp://127.0.0.1:2375"),
            Ok(DockerHost::Tcp(addr)) if addr == "127.0.0.1:2375"
        ));
        assert!(DockerHost::parse("ssh://example.com").is_err());
    }

    #[test]
    fn test_query_escape() {
        assert_eq!(query_escape("alpine"), "alpine");
        assert_eq!(query_escape("registry.example.com/app:v1"), "registry.example.com%2Fapp%3Av1");
        assert_eq!(query_escape("[\"a:b\"]"), "%5B%22a%3Ab%22%5D");
    }

    #[test]
    fn test_path_escape_preserves_slashes() {
        assert_eq!(path_escape("registry.example.com/team/app"), "registry.example.com/team/app");
        assert_eq!(path_escape("team/my app"), "team/my%20app");
    }

    #[test]
    fn test_auth_headers() {
        assert!(auth_headers(&RegistryAuth::default()).is_empty());

        let headers = auth_headers(&RegistryAuth {
            username: "$token".into(),
            password: "secret".into(),
        });
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].0, "X-Registry-Auth");

        let decoded = base64::engine::general_purpose::URL_SAFE.decode(&headers[0].1).unwrap();
        let config: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(config["username"], "$token");
        assert_eq!(config["password"], "secret");
    }

    async fn canned_server(response: &'static [u8]) -> String {
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut discard = [0u8; 4096];
            let _ = socket.read(&mut discard).await;
            let _ = socket.write_all(response).await;
            let _ = socket.shutdown().await;
        });
        format!("tcp://{addr}")
    }

    #[tokio::test]
    async fn test_pull_streams_chunked_body_to_writer() {
        // Two progress objects split mid-object across chunk boundaries;
        // the writer must see them reassembled.
        let response = b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n\
            13\r\n{\"status\":\"Pulling\"\r\n\
            16\r\n}{\"status\":\"Download\"}\r\n\
            0\r\n\r\n";

        let host = canned_server(response).await;
        let runtime = DockerRuntime::new(&host).unwrap();

        let client = Arc::new(CapturingClient::default());
        let writer = JsonLogWriter::new(client.clone());

        runtime
            .pull_image(
                PullImageOptions { repository: "alpine".into(), tag: "3.18".into() },
                RegistryAuth::default(),
                &writer,
            )
            .await
            .unwrap();

        let entries = client.entries.lock().unwrap().clone();
        assert_eq!(entries, vec![r#"{"status":"Pulling"}"#, r#"{"status":"Download"}"#]);
    }

    #[tokio::test]
    async fn test_error_status_carries_daemon_message() {
        let response = b"HTTP/1.1 404 Not Found\r\ncontent-length: 36\r\n\r\n{\"message\":\"no such image: missing\"}";

        let host = canned_server(response).await;
        let runtime = DockerRuntime::new(&host).unwrap();

        let err = runtime.inspect_image("missing").await.unwrap_err();
        assert!(err.to_string().contains("no such image: missing"), "{err}");
    }

    #[tokio::test]
    async fn test_inspect_parses_id_and_digests() {
        let response = b"HTTP/1.1 200 OK\r\ncontent-length: 76\r\n\r\n{\"Id\":\"sha256:abc\",\"RepoDigests\":[\"registry.example.com/app@sha256:feed\"]}  ";

        let host = canned_server(response).await;
        let runtime = DockerRuntime::new(&host).unwrap();

        let details = runtime.inspect_image("app").await.unwrap();
        assert_eq!(details.id, "sha256:abc");
        assert_eq!(details.repo_digests, vec!["registry.example.com/app@sha256:feed"]);
    }
}
