// 上传错误定义
//
// 错误分类决定任务的走向：
// - Transport / BodySource：进入重试流程
// - WriteAborted：直接进入取消终态
// - Protocol：由 ResponsePolicy 决定是否重试
// - Configuration：在任何网络请求之前失败，不重试

use crate::network::HttpResponse;
use thiserror::Error;

/// 传输层错误类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// 连接失败（DNS、拒绝连接、TLS 握手等）
    Connect,
    /// 超时（连接超时或读超时）
    Timeout,
    /// 发送/接收过程中的 I/O 错误
    Io,
    /// 其他错误
    Other,
}

/// 上传错误
#[derive(Debug, Error)]
pub enum UploadError {
    /// 传输失败，可重试
    #[error("传输失败 ({kind:?}): {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },

    /// 读取请求体数据失败，可重试
    #[error("读取请求体失败: {0}")]
    BodySource(String),

    /// 写入请求体时检测到取消
    #[error("请求体写入已中止（任务已取消）")]
    WriteAborted,

    /// 服务器返回了非 2xx 状态码
    #[error("服务器返回错误状态码: {}", .0.code)]
    Protocol(Box<HttpResponse>),

    /// 参数或配置错误，在网络请求之前检测
    #[error("配置错误: {0}")]
    Configuration(String),
}

impl UploadError {
    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        UploadError::Transport {
            kind,
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        UploadError::Configuration(message.into())
    }

    /// 根据 I/O 错误类型转换为传输错误
    pub fn from_io(error: &std::io::Error) -> Self {
        let kind = match error.kind() {
            std::io::ErrorKind::TimedOut => TransportErrorKind::Timeout,
            std::io::ErrorKind::ConnectionRefused => TransportErrorKind::Connect,
            _ => TransportErrorKind::Io,
        };
        Self::transport(kind, error.to_string())
    }

    /// 是否可重试
    ///
    /// Protocol 错误是否重试由任务的 ResponsePolicy 决定，这里返回 false
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            UploadError::Transport { .. } | UploadError::BodySource(_)
        )
    }

    /// 是否收到了服务器响应
    pub fn response(&self) -> Option<&HttpResponse> {
        match self {
            UploadError::Protocol(response) => Some(response),
            _ => None,
        }
    }
}
