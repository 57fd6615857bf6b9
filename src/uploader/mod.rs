// 上传引擎模块
//
// - 流式写入请求体（固定大小分片，不整体读入内存）
// - 指数退避重试（退避等待可被取消）
// - 任务级取消（任意线程、任意时刻）
// - 每个任务恰好一个终态事件

pub mod error;
pub mod retry;
pub mod source;
pub mod task;
pub mod types;
pub mod writer;

pub use error::{TransportErrorKind, UploadError};
pub use retry::{RetryPolicy, RetryPolicyConfig};
pub use source::{BodySource, BytesBody, FileBody};
pub use task::{UploadHandle, UploadTask, UploadTaskParameters, DEFAULT_USER_AGENT};
pub use types::{HeaderList, NameValue, UploadEvent, UploadFile, UploadStatus};
pub use writer::{StreamingBodyWriter, DEFAULT_BUFFER_SIZE};
