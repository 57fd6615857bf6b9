// HTTP 传输抽象
//
// 上传引擎只依赖这里的 trait，不依赖具体的 HTTP 客户端：
// - HttpTransport：创建请求
// - HttpRequest：设置请求头/请求体大小，发送并获取响应
// - RequestBodyDelegate：由上传任务实现，负责把请求体写入 BodySink
// - BodySink：由传输层实现，接收请求体分片

pub mod reqwest_stack;

use crate::uploader::error::UploadError;
use crate::uploader::types::NameValue;
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;

pub use reqwest_stack::ReqwestStack;

/// HTTP 方法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            other => Err(UploadError::configuration(format!(
                "不支持的 HTTP 方法: {}",
                other
            ))),
        }
    }
}

/// 服务器响应
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP 状态码
    pub code: u16,
    /// 响应头
    pub headers: Vec<NameValue>,
    /// 响应体
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(code: u16) -> Self {
        Self {
            code,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// 状态码是否为 2xx
    pub fn is_successful(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }
}

/// 请求体输出通道（由传输层实现）
#[async_trait]
pub trait BodySink: Send {
    /// 写入一个分片，返回后该分片已交给传输层
    async fn send_chunk(&mut self, chunk: Vec<u8>) -> std::io::Result<()>;
}

/// 请求体写入委托（由上传任务实现）
///
/// 每次尝试调用一次，必须从头写出完整的请求体
#[async_trait]
pub trait RequestBodyDelegate: Send {
    async fn on_write_request_body(&mut self, sink: &mut dyn BodySink) -> Result<(), UploadError>;
}

/// 单个 HTTP 请求
#[async_trait]
pub trait HttpRequest: Send {
    /// 设置请求头（已校验、已去重）
    fn set_headers(&mut self, headers: &[NameValue]) -> Result<(), UploadError>;

    /// 设置请求体总大小
    ///
    /// # 参数
    /// * `total_bytes` - 请求体大小，未知时为 None
    /// * `fixed_length` - 是否使用定长流式模式（大小已知时发送 Content-Length）
    fn set_total_body_bytes(&mut self, total_bytes: Option<u64>, fixed_length: bool);

    /// 写出请求体并获取服务器响应
    ///
    /// 请求体写入被取消时返回 `UploadError::WriteAborted`；
    /// 服务器在请求体写完之前就返回了响应时，返回该响应
    async fn get_response(
        self: Box<Self>,
        delegate: &mut dyn RequestBodyDelegate,
    ) -> Result<HttpResponse, UploadError>;
}

/// HTTP 传输层
///
/// 实现必须可被多个任务并发使用
pub trait HttpTransport: Send + Sync {
    fn new_request(
        &self,
        upload_id: &str,
        method: HttpMethod,
        url: &str,
    ) -> Result<Box<dyn HttpRequest>, UploadError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_method_parse() {
        assert_eq!("post".parse::<HttpMethod>().unwrap(), HttpMethod::Post);
        assert_eq!("PUT".parse::<HttpMethod>().unwrap(), HttpMethod::Put);
        assert!("TRACE".parse::<HttpMethod>().is_err());
        assert_eq!(HttpMethod::Patch.to_string(), "PATCH");
    }

    #[test]
    fn test_response_helpers() {
        let mut response = HttpResponse::new(201);
        response.headers.push(NameValue::new("Content-Type", "application/json"));
        response.body = b"{\"ok\":true}".to_vec();

        assert!(response.is_successful());
        assert_eq!(response.header("content-type"), Some("application/json"));
        assert_eq!(response.body_string(), "{\"ok\":true}");

        assert!(!HttpResponse::new(302).is_successful());
        assert!(!HttpResponse::new(500).is_successful());
    }
}
