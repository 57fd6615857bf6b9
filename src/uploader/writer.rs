// 流式请求体写入
//
// 按固定大小分片写入传输层通道：
// - 每个分片写入前检查是否继续（取消）
// - 每个分片写入后回调已写入字节数
// - 不把整个文件读入内存

use super::error::UploadError;
use crate::network::BodySink;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

/// 默认分片大小: 4KB
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// 流式请求体写入器
pub struct StreamingBodyWriter<'a> {
    sink: &'a mut dyn BodySink,
    buffer_size: usize,
    should_continue: &'a (dyn Fn() -> bool + Send + Sync),
    on_bytes_written: &'a mut (dyn FnMut(u64) + Send),
    bytes_written: u64,
}

impl<'a> StreamingBodyWriter<'a> {
    /// 创建写入器
    ///
    /// # 参数
    /// * `sink` - 传输层的请求体通道
    /// * `buffer_size` - 分片大小（为 0 时使用默认值）
    /// * `should_continue` - 每个分片写入前调用，返回 false 时中止写入
    /// * `on_bytes_written` - 每个分片写入后以本分片字节数回调
    pub fn new(
        sink: &'a mut dyn BodySink,
        buffer_size: usize,
        should_continue: &'a (dyn Fn() -> bool + Send + Sync),
        on_bytes_written: &'a mut (dyn FnMut(u64) + Send),
    ) -> Self {
        Self {
            sink,
            buffer_size: if buffer_size == 0 {
                DEFAULT_BUFFER_SIZE
            } else {
                buffer_size
            },
            should_continue,
            on_bytes_written,
            bytes_written: 0,
        }
    }

    /// 本次写入累计字节数
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// 写入内存中的数据
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), UploadError> {
        for chunk in bytes.chunks(self.buffer_size) {
            self.write_chunk(chunk.to_vec()).await?;
        }
        Ok(())
    }

    /// 从流中读取并写入，直到读到 EOF
    pub async fn write_stream<R>(&mut self, reader: &mut R) -> Result<(), UploadError>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        loop {
            if !(self.should_continue)() {
                debug!("写入请求体流时检测到取消: 已写入 {} bytes", self.bytes_written);
                return Err(UploadError::WriteAborted);
            }

            let mut buffer = vec![0u8; self.buffer_size];
            let read = reader
                .read(&mut buffer)
                .await
                .map_err(|e| UploadError::BodySource(e.to_string()))?;

            if read == 0 {
                return Ok(());
            }

            buffer.truncate(read);
            self.write_chunk(buffer).await?;
        }
    }

    async fn write_chunk(&mut self, chunk: Vec<u8>) -> Result<(), UploadError> {
        if !(self.should_continue)() {
            debug!("写入请求体时检测到取消: 已写入 {} bytes", self.bytes_written);
            return Err(UploadError::WriteAborted);
        }

        let len = chunk.len() as u64;
        self.sink
            .send_chunk(chunk)
            .await
            .map_err(|e| UploadError::from_io(&e))?;

        self.bytes_written += len;
        (self.on_bytes_written)(len);
        Ok(())
    }
}
