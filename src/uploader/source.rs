// 请求体数据源
//
// 每次尝试都会从头调用 write_body，数据源必须可重复读取

use super::error::UploadError;
use super::writer::StreamingBodyWriter;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tracing::debug;

/// 无法识别类型时使用的 Content-Type
pub const APPLICATION_OCTET_STREAM: &str = "application/octet-stream";

const VIDEO_MP4: &str = "video/mp4";

/// 根据文件扩展名推断 Content-Type
///
/// 扩展名不区分大小写；没有扩展名或无法识别时返回 `application/octet-stream`
pub fn detect_content_type(path: &Path) -> &'static str {
    let extension = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if !ext.is_empty() => ext.to_ascii_lowercase(),
        _ => return APPLICATION_OCTET_STREAM,
    };

    if extension == "mp4" {
        return VIDEO_MP4;
    }

    mime_guess::from_ext(&extension)
        .first_raw()
        .unwrap_or(APPLICATION_OCTET_STREAM)
}

/// 请求体数据源
#[async_trait]
pub trait BodySource: Send + Sync {
    /// 请求体总大小，未知时返回 None
    ///
    /// 在第一次尝试前调用一次
    async fn body_length(&self) -> Result<Option<u64>, UploadError>;

    /// 从头写出完整的请求体
    async fn write_body(&self, writer: &mut StreamingBodyWriter<'_>) -> Result<(), UploadError>;
}

/// 内存数据
#[derive(Debug, Clone)]
pub struct BytesBody {
    data: Vec<u8>,
}

impl BytesBody {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }
}

#[async_trait]
impl BodySource for BytesBody {
    async fn body_length(&self) -> Result<Option<u64>, UploadError> {
        Ok(Some(self.data.len() as u64))
    }

    async fn write_body(&self, writer: &mut StreamingBodyWriter<'_>) -> Result<(), UploadError> {
        writer.write(&self.data).await
    }
}

/// 本地文件（原始二进制请求体）
#[derive(Debug, Clone)]
pub struct FileBody {
    path: PathBuf,
}

impl FileBody {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 按扩展名推断的 Content-Type
    pub fn content_type(&self) -> &'static str {
        detect_content_type(self.path())
    }
}

#[async_trait]
impl BodySource for FileBody {
    async fn body_length(&self) -> Result<Option<u64>, UploadError> {
        let metadata = tokio::fs::metadata(&self.path).await.map_err(|e| {
            UploadError::configuration(format!("无法读取文件信息 {:?}: {}", self.path, e))
        })?;

        if !metadata.is_file() {
            return Err(UploadError::configuration(format!(
                "不是普通文件: {:?}",
                self.path
            )));
        }

        Ok(Some(metadata.len()))
    }

    async fn write_body(&self, writer: &mut StreamingBodyWriter<'_>) -> Result<(), UploadError> {
        // 每次尝试重新打开文件，从头读取
        let mut file = File::open(&self.path)
            .await
            .map_err(|e| UploadError::BodySource(format!("打开上传文件失败 {:?}: {}", self.path, e)))?;

        debug!("开始写入文件请求体: {:?}", self.path);
        writer.write_stream(&mut file).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::BodySink;
    use std::io::Write;

    #[derive(Default)]
    struct CollectSink {
        data: Vec<u8>,
    }

    #[async_trait]
    impl BodySink for CollectSink {
        async fn send_chunk(&mut self, chunk: Vec<u8>) -> std::io::Result<()> {
            self.data.extend_from_slice(&chunk);
            Ok(())
        }
    }

    async fn collect(source: &dyn BodySource) -> Result<Vec<u8>, UploadError> {
        let mut sink = CollectSink::default();
        let should_continue = || true;
        let mut on_written = |_delta: u64| {};
        {
            let mut writer = StreamingBodyWriter::new(&mut sink, 1024, &should_continue, &mut on_written);
            source.write_body(&mut writer).await?;
        }
        Ok(sink.data)
    }

    #[tokio::test]
    async fn test_bytes_body() {
        let body = BytesBody::new("hello upload");
        assert_eq!(body.body_length().await.unwrap(), Some(12));
        assert_eq!(collect(&body).await.unwrap(), b"hello upload");
    }

    #[tokio::test]
    async fn test_file_body_rereadable() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let content: Vec<u8> = (0..5000u32).map(|i| (i % 256) as u8).collect();
        file.write_all(&content).unwrap();
        file.flush().unwrap();

        let body = FileBody::new(file.path());
        assert_eq!(body.body_length().await.unwrap(), Some(5000));

        // 重试时需要能从头再读一遍
        assert_eq!(collect(&body).await.unwrap(), content);
        assert_eq!(collect(&body).await.unwrap(), content);
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let body = FileBody::new(dir.path().join("missing.bin"));

        assert!(matches!(
            body.body_length().await,
            Err(UploadError::Configuration(_))
        ));
        assert!(matches!(
            collect(&body).await,
            Err(UploadError::BodySource(_))
        ));
    }

    #[test]
    fn test_detect_content_type() {
        assert_eq!(detect_content_type(Path::new("/sdcard/movie.mp4")), "video/mp4");
        assert_eq!(detect_content_type(Path::new("clip.MP4")), "video/mp4");
        assert_eq!(detect_content_type(Path::new("photo.JPG")), "image/jpeg");
        assert_eq!(detect_content_type(Path::new("notes.txt")), "text/plain");
        assert_eq!(detect_content_type(Path::new("data.json")), "application/json");
        assert_eq!(detect_content_type(Path::new("archive")), APPLICATION_OCTET_STREAM);
        assert_eq!(detect_content_type(Path::new("trailing.")), APPLICATION_OCTET_STREAM);
        assert_eq!(
            detect_content_type(Path::new("blob.unknownext")),
            APPLICATION_OCTET_STREAM
        );
    }

    #[test]
    fn test_file_body_content_type() {
        let body = FileBody::new("/tmp/upload/report.pdf");
        assert_eq!(body.path(), Path::new("/tmp/upload/report.pdf"));
        assert_eq!(body.content_type(), "application/pdf");
    }

    #[tokio::test]
    async fn test_directory_is_not_a_body() {
        let dir = tempfile::tempdir().unwrap();
        let body = FileBody::new(dir.path());
        assert!(body.body_length().await.is_err());
    }
}
