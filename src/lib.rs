// Resilient HTTP Upload Engine
// 可重试、可取消的流式 HTTP 上传引擎

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// HTTP 传输层模块
pub mod network;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use config::{AppConfig, HttpStackConfig, ResponsePolicy, UploadConfig};
pub use network::{HttpMethod, HttpResponse, HttpTransport, ReqwestStack};
pub use uploader::{
    BodySource, BytesBody, FileBody, RetryPolicy, UploadError, UploadEvent, UploadFile,
    UploadHandle, UploadStatus, UploadTask, UploadTaskParameters,
};
