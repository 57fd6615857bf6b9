// 上传任务
//
// 单个上传任务的状态机：
//
//   Idle → Sending → {Succeeding, Retrying, Failing}
//   Retrying → (退避等待) → Sending → ... → Completed / Error / Cancelled
//
// - 每个任务恰好产生一个终态事件
// - 取消令牌是唯一会被外部修改的状态，其余状态只由任务自身修改
// - 请求体写入和退避等待都可以被取消打断

use super::error::UploadError;
use super::retry::RetryPolicy;
use super::source::BodySource;
use super::types::{HeaderList, NameValue, UploadEvent, UploadFile, UploadStatus};
use super::writer::StreamingBodyWriter;
use crate::config::{ResponsePolicy, UploadConfig};
use crate::network::{BodySink, HttpMethod, HttpResponse, HttpTransport, RequestBodyDelegate};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 未指定 User-Agent 时使用的默认值
pub const DEFAULT_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// 上传任务参数
#[derive(Debug, Clone)]
pub struct UploadTaskParameters {
    /// 任务ID
    pub id: String,
    /// 服务器地址
    pub server_url: String,
    /// HTTP 方法
    pub method: HttpMethod,
    /// 请求头
    pub headers: Vec<NameValue>,
    /// 待上传文件
    pub files: Vec<UploadFile>,
    /// 最大重试次数（覆盖默认值）
    pub max_retries: Option<u32>,
    /// 是否使用定长流式模式（未设置时使用配置默认值）
    pub use_fixed_length_streaming_mode: Option<bool>,
    /// 自定义 User-Agent
    pub custom_user_agent: Option<String>,
    /// 是否允许请求头值包含非 ASCII 字符
    pub allow_non_ascii_header_values: bool,
}

impl UploadTaskParameters {
    /// 创建新的任务参数（POST，自动生成任务ID）
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            server_url: server_url.into(),
            method: HttpMethod::Post,
            headers: Vec::new(),
            files: Vec::new(),
            max_retries: None,
            use_fixed_length_streaming_mode: None,
            custom_user_agent: None,
            allow_non_ascii_header_values: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(NameValue::new(name, value));
        self
    }

    pub fn with_file(mut self, file: UploadFile) -> Self {
        self.files.push(file);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_fixed_length_streaming_mode(mut self, enabled: bool) -> Self {
        self.use_fixed_length_streaming_mode = Some(enabled);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.custom_user_agent = Some(user_agent.into());
        self
    }

    pub fn allow_non_ascii_header_values(mut self, allow: bool) -> Self {
        self.allow_non_ascii_header_values = allow;
        self
    }

    /// 校验请求头并生成最终请求头列表
    ///
    /// 调用方未设置 User-Agent 时补充默认值
    fn build_headers(&self) -> Result<HeaderList, UploadError> {
        let mut headers = HeaderList::new();
        for header in &self.headers {
            header.validate_as_header(self.allow_non_ascii_header_values)?;
            headers.set(header.clone());
        }

        if !headers.contains("User-Agent") {
            let user_agent = NameValue::new(
                "User-Agent",
                self.custom_user_agent
                    .as_deref()
                    .unwrap_or(DEFAULT_USER_AGENT),
            );
            user_agent.validate_as_header(self.allow_non_ascii_header_values)?;
            headers.set(user_agent);
        }

        Ok(headers)
    }

    fn validate_url(&self) -> Result<(), UploadError> {
        let url = self.server_url.trim();
        if url.is_empty() {
            return Err(UploadError::configuration("服务器 URL 不能为空"));
        }
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(UploadError::configuration(format!(
                "服务器 URL 必须以 http:// 或 https:// 开头: {}",
                url
            )));
        }
        Ok(())
    }
}

/// 上传任务句柄
///
/// 可以在任意线程、任意时刻调用 `cancel()`，重复调用或在任务结束后调用均无副作用
#[derive(Debug, Clone)]
pub struct UploadHandle {
    upload_id: String,
    cancel_token: CancellationToken,
}

impl UploadHandle {
    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn cancel(&self) {
        if !self.cancel_token.is_cancelled() {
            debug!("[{}] 请求取消上传", self.upload_id);
        }
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// 任务结束的原因
enum Outcome {
    Completed(HttpResponse),
    Failed(UploadError),
    Cancelled,
}

/// 当前尝试的进度（只由任务自身修改）
struct AttemptProgress {
    upload_id: String,
    attempt: u32,
    uploaded_bytes: u64,
    total_bytes: Option<u64>,
    events: mpsc::UnboundedSender<UploadEvent>,
}

impl AttemptProgress {
    /// 开始新一轮写入，已上传字节数归零
    fn reset(&mut self) {
        self.uploaded_bytes = 0;
        self.report();
    }

    fn on_bytes_written(&mut self, delta: u64) {
        self.uploaded_bytes = self.uploaded_bytes.saturating_add(delta);
        self.report();
    }

    fn report(&self) {
        let uploaded_bytes = match self.total_bytes {
            Some(total) => self.uploaded_bytes.min(total),
            None => self.uploaded_bytes,
        };
        let _ = self.events.send(UploadEvent::Progress {
            upload_id: self.upload_id.clone(),
            attempt: self.attempt,
            uploaded_bytes,
            total_bytes: self.total_bytes,
        });
    }
}

/// 单次尝试的请求体写入委托
struct AttemptBody<'a> {
    source: &'a dyn BodySource,
    buffer_size: usize,
    cancel_token: &'a CancellationToken,
    progress: &'a mut AttemptProgress,
}

#[async_trait]
impl RequestBodyDelegate for AttemptBody<'_> {
    async fn on_write_request_body(&mut self, sink: &mut dyn BodySink) -> Result<(), UploadError> {
        // 传输层可能在同一次尝试中重新请求请求体，每次都从 0 开始计数
        self.progress.reset();

        let token = self.cancel_token.clone();
        let should_continue = move || !token.is_cancelled();
        let progress = &mut *self.progress;
        let mut on_bytes_written = |delta: u64| progress.on_bytes_written(delta);

        let mut writer = StreamingBodyWriter::new(
            sink,
            self.buffer_size,
            &should_continue,
            &mut on_bytes_written,
        );
        self.source.write_body(&mut writer).await
    }
}

/// 上传任务
pub struct UploadTask {
    params: UploadTaskParameters,
    body: Arc<dyn BodySource>,
    transport: Arc<dyn HttpTransport>,
    config: UploadConfig,
    cancel_token: CancellationToken,
    events: mpsc::UnboundedSender<UploadEvent>,
    /// 已发起的尝试次数
    attempt: u32,
}

impl UploadTask {
    /// 创建上传任务
    ///
    /// # 参数
    /// * `params` - 任务参数
    /// * `body` - 请求体数据源
    /// * `transport` - HTTP 传输层
    /// * `config` - 上传配置（重试策略、响应策略、分片大小）
    /// * `events` - 事件通道，多个任务可以共用一个
    pub fn new(
        params: UploadTaskParameters,
        body: Arc<dyn BodySource>,
        transport: Arc<dyn HttpTransport>,
        config: &UploadConfig,
        events: mpsc::UnboundedSender<UploadEvent>,
    ) -> Self {
        Self {
            params,
            body,
            transport,
            config: config.clone(),
            cancel_token: CancellationToken::new(),
            events,
            attempt: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.params.id
    }

    /// 获取任务句柄（用于取消）
    pub fn handle(&self) -> UploadHandle {
        UploadHandle {
            upload_id: self.params.id.clone(),
            cancel_token: self.cancel_token.clone(),
        }
    }

    /// 在后台运行任务
    pub fn spawn(self) -> (UploadHandle, JoinHandle<UploadStatus>) {
        let handle = self.handle();
        (handle, tokio::spawn(self.start()))
    }

    /// 执行上传直到终态
    ///
    /// 所有错误都转换为终态事件，返回终态
    pub async fn start(mut self) -> UploadStatus {
        debug!("[{}] 开始上传任务: {}", self.params.id, self.params.server_url);

        let outcome = self.execute().await;
        self.finish(outcome)
    }

    async fn execute(&mut self) -> Outcome {
        // 1. 网络请求之前完成所有校验
        let retry_policy = match self
            .config
            .validate()
            .and_then(|_| RetryPolicy::new(self.config.retry_policy))
        {
            Ok(policy) => policy,
            Err(e) => return Outcome::Failed(e),
        };
        if let Err(e) = self.params.validate_url() {
            return Outcome::Failed(e);
        }
        let headers = match self.params.build_headers() {
            Ok(headers) => headers,
            Err(e) => return Outcome::Failed(e),
        };

        if self.cancel_token.is_cancelled() {
            return Outcome::Cancelled;
        }

        // 2. 请求体大小只计算一次，重试时不变
        let total_bytes = match self.body.body_length().await {
            Ok(total) => total,
            Err(e) => return Outcome::Failed(e),
        };

        let max_retries = retry_policy.max_retries(self.params.max_retries);
        let fixed_length = self
            .params
            .use_fixed_length_streaming_mode
            .unwrap_or(self.config.use_fixed_length_streaming_mode);

        let mut progress = AttemptProgress {
            upload_id: self.params.id.clone(),
            attempt: 0,
            uploaded_bytes: 0,
            total_bytes,
            events: self.events.clone(),
        };

        info!(
            "[{}] 开始上传: url={}, total_bytes={:?}, max_retries={}",
            self.params.id, self.params.server_url, total_bytes, max_retries
        );

        // 3. 尝试 / 重试循环
        loop {
            if self.cancel_token.is_cancelled() {
                return Outcome::Cancelled;
            }

            self.attempt += 1;
            progress.attempt = self.attempt;
            progress.uploaded_bytes = 0;
            debug!("[{}] 第 {} 次尝试", self.params.id, self.attempt);

            let token = self.cancel_token.clone();
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return Outcome::Cancelled,
                result = self.send_once(headers.as_slice(), total_bytes, fixed_length, &mut progress) => result,
            };

            let error = match result {
                Ok(response) => {
                    // 取消之后才到达的响应不视为上传完成
                    if self.cancel_token.is_cancelled() {
                        debug!(
                            "[{}] 收到响应时任务已取消，忽略响应: status={}",
                            self.params.id, response.code
                        );
                        return Outcome::Cancelled;
                    }

                    match self.check_response(response) {
                        Ok(response) => return Outcome::Completed(response),
                        Err(e) => e,
                    }
                }
                Err(UploadError::WriteAborted) => return Outcome::Cancelled,
                Err(e) => e,
            };

            if !self.should_retry(&error) {
                return Outcome::Failed(error);
            }

            let wait = match retry_policy.next_retry(self.attempt, max_retries) {
                Some(wait) => wait,
                None => {
                    warn!(
                        "[{}] 上传失败，已达最大重试次数 ({}): {}",
                        self.params.id, max_retries, error
                    );
                    return Outcome::Failed(error);
                }
            };

            warn!(
                "[{}] 上传失败，等待 {}s 后重试 ({}/{}): {}",
                self.params.id,
                wait.as_secs(),
                self.attempt,
                max_retries,
                error
            );

            tokio::select! {
                _ = self.cancel_token.cancelled() => return Outcome::Cancelled,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// 发起一次尝试：创建请求、写出请求体、获取响应
    async fn send_once(
        &self,
        headers: &[NameValue],
        total_bytes: Option<u64>,
        fixed_length: bool,
        progress: &mut AttemptProgress,
    ) -> Result<HttpResponse, UploadError> {
        let mut request =
            self.transport
                .new_request(&self.params.id, self.params.method, &self.params.server_url)?;
        request.set_headers(headers)?;
        request.set_total_body_bytes(total_bytes, fixed_length);

        let mut delegate = AttemptBody {
            source: self.body.as_ref(),
            buffer_size: self.config.buffer_size,
            cancel_token: &self.cancel_token,
            progress,
        };

        request.get_response(&mut delegate).await
    }

    /// 按响应策略检查状态码
    fn check_response(&self, response: HttpResponse) -> Result<HttpResponse, UploadError> {
        match self.config.response_policy {
            ResponsePolicy::DeliverAll => Ok(response),
            _ if response.is_successful() => Ok(response),
            _ => Err(UploadError::Protocol(Box::new(response))),
        }
    }

    fn should_retry(&self, error: &UploadError) -> bool {
        match error {
            UploadError::Protocol(_) => {
                self.config.response_policy == ResponsePolicy::RetryOnErrorStatus
            }
            other => other.is_retriable(),
        }
    }

    /// 发送终态事件（每个任务只会调用一次，start 消耗了 self）
    fn finish(mut self, outcome: Outcome) -> UploadStatus {
        let upload_id = self.params.id.clone();

        let (status, event) = match outcome {
            Outcome::Completed(response) => {
                for file in self.params.files.iter_mut() {
                    if !file.successfully_uploaded() {
                        file.set_successfully_uploaded(true);
                    }
                }
                info!(
                    "[{}] 上传完成: status={}, attempts={}",
                    upload_id, response.code, self.attempt
                );
                debug!("[{}] 服务器响应: {}", upload_id, response.body_string());
                (
                    UploadStatus::Completed,
                    UploadEvent::Completed {
                        upload_id,
                        response,
                        files: std::mem::take(&mut self.params.files),
                        completed_at: chrono::Utc::now().timestamp(),
                    },
                )
            }
            Outcome::Failed(error) => {
                error!(
                    "[{}] 上传失败: attempts={}, 错误: {}",
                    upload_id, self.attempt, error
                );
                (UploadStatus::Error, UploadEvent::Error { upload_id, error })
            }
            Outcome::Cancelled => {
                info!("[{}] 上传已取消: attempts={}", upload_id, self.attempt);
                (UploadStatus::Cancelled, UploadEvent::Cancelled { upload_id })
            }
        };

        let _ = self.events.send(event);
        status
    }
}
