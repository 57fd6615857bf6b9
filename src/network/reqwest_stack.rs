// 基于 reqwest 的默认传输实现
//
// 请求体通过有界 channel 流式交给 reqwest，不会整体缓存在内存中：
//
//   StreamingBodyWriter --send_chunk--> ChannelSink --mpsc--> BodyStream --> reqwest::Body
//
// 超时：
// - 连接超时：reqwest connect_timeout
// - 读超时：每个分片交给 reqwest 的等待时间，以及请求体写完后等待/读取响应的时间

use super::{BodySink, HttpMethod, HttpRequest, HttpResponse, HttpTransport, RequestBodyDelegate};
use crate::config::HttpStackConfig;
use crate::uploader::error::{TransportErrorKind, UploadError};
use crate::uploader::types::{HeaderList, NameValue};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CACHE_CONTROL, CONTENT_LENGTH, PRAGMA};
use reqwest::{Client, Url};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// 请求体 channel 深度（分片数）
const BODY_CHANNEL_CAPACITY: usize = 8;

/// 最大重定向次数
const MAX_REDIRECTS: usize = 10;

/// 基于 reqwest 的 HTTP 传输
///
/// 内部的 `Client` 是共享连接池，可被多个上传任务并发使用
#[derive(Debug, Clone)]
pub struct ReqwestStack {
    client: Client,
    read_timeout: Duration,
    use_caches: bool,
}

impl ReqwestStack {
    pub fn new(config: &HttpStackConfig) -> Result<Self, UploadError> {
        config.validate()?;

        let redirect = if config.follow_redirects {
            reqwest::redirect::Policy::limited(MAX_REDIRECTS)
        } else {
            reqwest::redirect::Policy::none()
        };

        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .redirect(redirect)
            .build()
            .map_err(|e| UploadError::configuration(format!("创建 HTTP 客户端失败: {}", e)))?;

        debug!(
            "初始化 HTTP 传输: connect_timeout={}ms, read_timeout={}ms, follow_redirects={}, use_caches={}",
            config.connect_timeout_ms,
            config.read_timeout_ms,
            config.follow_redirects,
            config.use_caches
        );

        Ok(Self {
            client,
            read_timeout: config.read_timeout(),
            use_caches: config.use_caches,
        })
    }
}

impl HttpTransport for ReqwestStack {
    fn new_request(
        &self,
        upload_id: &str,
        method: HttpMethod,
        url: &str,
    ) -> Result<Box<dyn HttpRequest>, UploadError> {
        let url = parse_http_url(url)?;

        Ok(Box::new(ReqwestRequest {
            client: self.client.clone(),
            upload_id: upload_id.to_string(),
            method,
            url,
            headers: HeaderList::new(),
            total_bytes: None,
            fixed_length: false,
            read_timeout: self.read_timeout,
            use_caches: self.use_caches,
        }))
    }
}

/// 校验并解析 http/https URL
pub fn parse_http_url(url: &str) -> Result<Url, UploadError> {
    if url.trim().is_empty() {
        return Err(UploadError::configuration("服务器 URL 不能为空"));
    }

    let parsed = Url::parse(url)
        .map_err(|e| UploadError::configuration(format!("无效的服务器 URL {}: {}", url, e)))?;

    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(UploadError::configuration(format!(
            "不支持的 URL 协议: {}",
            scheme
        ))),
    }
}

struct ReqwestRequest {
    client: Client,
    upload_id: String,
    method: HttpMethod,
    url: Url,
    headers: HeaderList,
    total_bytes: Option<u64>,
    fixed_length: bool,
    read_timeout: Duration,
    use_caches: bool,
}

impl ReqwestRequest {
    fn build_header_map(&self) -> Result<HeaderMap, UploadError> {
        let mut map = HeaderMap::new();

        for header in self.headers.as_slice() {
            let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(|e| {
                UploadError::configuration(format!("无效的请求头名称 {}: {}", header.name, e))
            })?;
            let value = HeaderValue::from_bytes(header.value.as_bytes()).map_err(|e| {
                UploadError::configuration(format!("无效的请求头值 {}: {}", header.name, e))
            })?;
            map.insert(name, value);
        }

        if !self.use_caches {
            if !map.contains_key(CACHE_CONTROL) {
                map.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            }
            if !map.contains_key(PRAGMA) {
                map.insert(PRAGMA, HeaderValue::from_static("no-cache"));
            }
        }

        match (self.total_bytes, self.fixed_length) {
            (Some(total), true) => {
                map.insert(CONTENT_LENGTH, HeaderValue::from(total));
            }
            // 非定长模式由 reqwest 使用 chunked 编码
            _ => {
                map.remove(CONTENT_LENGTH);
            }
        }

        Ok(map)
    }
}

#[async_trait]
impl HttpRequest for ReqwestRequest {
    fn set_headers(&mut self, headers: &[NameValue]) -> Result<(), UploadError> {
        for header in headers {
            self.headers.set(header.clone());
        }
        Ok(())
    }

    fn set_total_body_bytes(&mut self, total_bytes: Option<u64>, fixed_length: bool) {
        self.total_bytes = total_bytes;
        self.fixed_length = fixed_length;
    }

    async fn get_response(
        self: Box<Self>,
        delegate: &mut dyn RequestBodyDelegate,
    ) -> Result<HttpResponse, UploadError> {
        let headers = self.build_header_map()?;
        let method = to_reqwest_method(self.method);
        let read_timeout = self.read_timeout;

        debug!(
            "[{}] 发送请求: {} {}, total_bytes={:?}, fixed_length={}",
            self.upload_id, self.method, self.url, self.total_bytes, self.fixed_length
        );

        let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        let send = self
            .client
            .request(method, self.url.clone())
            .headers(headers)
            .body(reqwest::Body::wrap_stream(BodyStream { rx }))
            .send();
        tokio::pin!(send);

        let write = async move {
            let mut sink = ChannelSink { tx, read_timeout };
            let result = delegate.on_write_request_body(&mut sink).await;
            if result.is_err() {
                // 让 reqwest 以错误结束请求体，而不是把截断的数据当作完整请求发出
                sink.abort();
            }
            result
        };
        tokio::pin!(write);

        let write_result = tokio::select! {
            result = &mut write => result,
            response = &mut send => {
                // 服务器在请求体写完之前就返回了
                let response = response.map_err(classify_reqwest_error)?;
                warn!(
                    "[{}] 请求体未写完服务器已响应: status={}",
                    self.upload_id,
                    response.status()
                );
                return read_response(response, read_timeout).await;
            }
        };
        write_result?;

        let response = tokio::time::timeout(read_timeout, send)
            .await
            .map_err(|_| UploadError::transport(TransportErrorKind::Timeout, "等待服务器响应超时"))?
            .map_err(classify_reqwest_error)?;

        read_response(response, read_timeout).await
    }
}

async fn read_response(
    response: reqwest::Response,
    read_timeout: Duration,
) -> Result<HttpResponse, UploadError> {
    let code = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| NameValue::new(name.as_str(), v))
        })
        .collect();

    let body = tokio::time::timeout(read_timeout, response.bytes())
        .await
        .map_err(|_| UploadError::transport(TransportErrorKind::Timeout, "读取响应体超时"))?
        .map_err(classify_reqwest_error)?;

    Ok(HttpResponse {
        code,
        headers,
        body: body.to_vec(),
    })
}

fn to_reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
    }
}

/// reqwest 错误分类
fn classify_reqwest_error(error: reqwest::Error) -> UploadError {
    let kind = if error.is_timeout() {
        TransportErrorKind::Timeout
    } else if error.is_connect() {
        TransportErrorKind::Connect
    } else if error.is_request() || error.is_body() {
        TransportErrorKind::Io
    } else {
        TransportErrorKind::Other
    };
    UploadError::transport(kind, error.to_string())
}

/// 写入端：把分片交给 reqwest
struct ChannelSink {
    tx: mpsc::Sender<std::io::Result<Vec<u8>>>,
    read_timeout: Duration,
}

impl ChannelSink {
    /// 通知 reqwest 请求体异常结束
    ///
    /// channel 已满（通常是写入超时）时直接丢弃发送端，不再等待
    fn abort(self) {
        let err = std::io::Error::new(std::io::ErrorKind::Interrupted, "请求体写入中止");
        let _ = self.tx.try_send(Err(err));
    }
}

#[async_trait]
impl BodySink for ChannelSink {
    async fn send_chunk(&mut self, chunk: Vec<u8>) -> std::io::Result<()> {
        match tokio::time::timeout(self.read_timeout, self.tx.send(Ok(chunk))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "连接已关闭",
            )),
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "写入请求体超时",
            )),
        }
    }
}

/// 读取端：reqwest 请求体流
struct BodyStream {
    rx: mpsc::Receiver<std::io::Result<Vec<u8>>>,
}

impl futures::Stream for BodyStream {
    type Item = std::io::Result<Vec<u8>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::writer::StreamingBodyWriter;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct StaticBody {
        data: Vec<u8>,
        progress: Vec<u64>,
    }

    #[async_trait]
    impl RequestBodyDelegate for StaticBody {
        async fn on_write_request_body(
            &mut self,
            sink: &mut dyn BodySink,
        ) -> Result<(), UploadError> {
            let should_continue = || true;
            let progress = &mut self.progress;
            let mut on_written = |delta: u64| progress.push(delta);
            let mut writer = StreamingBodyWriter::new(sink, 1024, &should_continue, &mut on_written);
            writer.write(&self.data).await
        }
    }

    fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|w| w == needle)
    }

    /// 本地回环服务器：读取一个带 Content-Length 的请求，返回 201 和收到的请求
    async fn serve_once(listener: TcpListener) -> Vec<u8> {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 4096];

        let header_end = loop {
            let n = socket.read(&mut buf).await.unwrap();
            assert!(n > 0, "连接提前关闭");
            received.extend_from_slice(&buf[..n]);
            if let Some(pos) = find_subsequence(&received, b"\r\n\r\n") {
                break pos + 4;
            }
        };

        let head = String::from_utf8_lossy(&received[..header_end]).to_lowercase();
        let content_length: usize = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .map(|v| v.trim().parse().unwrap())
            .expect("缺少 content-length");

        while received.len() < header_end + content_length {
            let n = socket.read(&mut buf).await.unwrap();
            assert!(n > 0, "请求体不完整");
            received.extend_from_slice(&buf[..n]);
        }

        socket
            .write_all(b"HTTP/1.1 201 Created\r\nContent-Length: 7\r\nX-Upload: done\r\nConnection: close\r\n\r\ncreated")
            .await
            .unwrap();
        socket.shutdown().await.unwrap();
        received
    }

    #[test]
    fn test_parse_http_url() {
        assert!(parse_http_url("https://example.com/upload").is_ok());
        assert!(matches!(
            parse_http_url(""),
            Err(UploadError::Configuration(_))
        ));
        assert!(parse_http_url("ftp://example.com/upload").is_err());
        assert!(parse_http_url("not a url").is_err());
    }

    #[test]
    fn test_header_map_defaults() {
        let stack = ReqwestStack::new(&HttpStackConfig::default()).unwrap();
        let mut request = ReqwestRequest {
            client: stack.client.clone(),
            upload_id: "test".to_string(),
            method: HttpMethod::Post,
            url: parse_http_url("http://127.0.0.1/upload").unwrap(),
            headers: HeaderList::new(),
            total_bytes: None,
            fixed_length: false,
            read_timeout: Duration::from_secs(1),
            use_caches: false,
        };
        request
            .set_headers(&[NameValue::new("X-Id", "1"), NameValue::new("Pragma", "custom")])
            .unwrap();
        request.set_total_body_bytes(Some(42), true);

        let map = request.build_header_map().unwrap();
        assert_eq!(map.get("x-id").unwrap(), "1");
        assert_eq!(map.get(CACHE_CONTROL).unwrap(), "no-cache");
        assert_eq!(map.get(PRAGMA).unwrap(), "custom");
        assert_eq!(map.get(CONTENT_LENGTH).unwrap(), "42");

        request.set_total_body_bytes(Some(42), false);
        let map = request.build_header_map().unwrap();
        assert!(map.get(CONTENT_LENGTH).is_none());
    }

    #[tokio::test]
    async fn test_upload_to_loopback_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_once(listener));

        let stack = ReqwestStack::new(&HttpStackConfig::default()).unwrap();
        let mut request = stack
            .new_request("test", HttpMethod::Put, &format!("http://{}/files/a.bin", addr))
            .unwrap();

        let data: Vec<u8> = (0..3000u32).map(|i| (i % 200) as u8).collect();
        request
            .set_headers(&[NameValue::new("User-Agent", "upload-engine-test")])
            .unwrap();
        request.set_total_body_bytes(Some(data.len() as u64), true);

        let mut body = StaticBody {
            data: data.clone(),
            progress: Vec::new(),
        };
        let response = request.get_response(&mut body).await.unwrap();

        assert_eq!(response.code, 201);
        assert_eq!(response.body_string(), "created");
        assert_eq!(response.header("x-upload"), Some("done"));
        assert_eq!(body.progress, vec![1024, 1024, 952]);

        let received = server.await.unwrap();
        let header_end = find_subsequence(&received, b"\r\n\r\n").unwrap() + 4;
        let head = String::from_utf8_lossy(&received[..header_end]).to_lowercase();
        assert!(head.starts_with("put /files/a.bin"));
        assert!(head.contains("user-agent: upload-engine-test"));
        assert_eq!(&received[header_end..], &data[..]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_after_write_timeout_returns_immediately() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut sink = ChannelSink {
            tx,
            read_timeout: Duration::from_secs(10),
        };
        sink.send_chunk(vec![1]).await.unwrap();

        let started = tokio::time::Instant::now();
        let err = sink.send_chunk(vec![2]).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
        assert_eq!(started.elapsed(), Duration::from_secs(10));

        // channel 已满，中止标记被丢弃，发送端关闭
        sink.abort();
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        assert_eq!(rx.recv().await.unwrap().unwrap(), vec![1]);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_abort_marks_body_as_failed() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut sink = ChannelSink {
            tx,
            read_timeout: Duration::from_secs(1),
        };
        sink.send_chunk(vec![1, 2]).await.unwrap();
        sink.abort();

        assert_eq!(rx.recv().await.unwrap().unwrap(), vec![1, 2]);
        let marker = rx.recv().await.unwrap();
        assert_eq!(marker.unwrap_err().kind(), std::io::ErrorKind::Interrupted);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let stack = ReqwestStack::new(&HttpStackConfig::default()).unwrap();
        let request = stack
            .new_request("test", HttpMethod::Post, &format!("http://{}/upload", addr))
            .unwrap();

        let mut body = StaticBody {
            data: vec![1u8; 10],
            progress: Vec::new(),
        };
        let result = request.get_response(&mut body).await;

        match result {
            Err(err @ UploadError::Transport { .. }) => assert!(err.is_retriable()),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
