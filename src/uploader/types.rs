// 上传数据模型
//
// UploadFile / UploadStatus / 请求头 / 任务事件

use super::error::UploadError;
use crate::network::HttpResponse;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 上传成功标记的属性名
const PROPERTY_SUCCESSFUL_UPLOAD: &str = "successful_upload";

/// 待上传文件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadFile {
    /// 文件路径或标识
    pub path: String,
    /// 文件属性
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl UploadFile {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            properties: HashMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// 是否已上传成功
    pub fn successfully_uploaded(&self) -> bool {
        self.properties
            .get(PROPERTY_SUCCESSFUL_UPLOAD)
            .map(|v| v == "true")
            .unwrap_or(false)
    }

    pub fn set_successfully_uploaded(&mut self, value: bool) {
        self.properties
            .insert(PROPERTY_SUCCESSFUL_UPLOAD.to_string(), value.to_string());
    }
}

/// 上传状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    /// 上传中
    InProgress,
    /// 失败
    Error,
    /// 已完成
    Completed,
    /// 已取消
    Cancelled,
}

impl UploadStatus {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        !matches!(self, UploadStatus::InProgress)
    }
}

/// 名称/值对（请求头）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameValue {
    pub name: String,
    pub value: String,
}

impl NameValue {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// 校验为合法的 HTTP 请求头
    ///
    /// - 名称：非空，仅包含 RFC 7230 token 字符
    /// - 值：默认仅允许可打印 ASCII 和 HTAB；`allow_non_ascii` 时放开非 ASCII 字符，
    ///   但控制字符（CR/LF 等）始终拒绝
    pub fn validate_as_header(&self, allow_non_ascii: bool) -> Result<(), UploadError> {
        if self.name.is_empty() {
            return Err(UploadError::configuration("请求头名称不能为空"));
        }

        if let Some(c) = self.name.chars().find(|c| !is_token_char(*c)) {
            return Err(UploadError::configuration(format!(
                "请求头名称包含非法字符 {:?}: {:?}",
                c, self.name
            )));
        }

        let invalid_value_char = self.value.chars().find(|&c| {
            if c == '\t' {
                return false;
            }
            if c.is_ascii() {
                c.is_ascii_control()
            } else {
                !allow_non_ascii || c.is_control()
            }
        });

        if let Some(c) = invalid_value_char {
            return Err(UploadError::configuration(format!(
                "请求头 {} 的值包含非法字符 {:?}",
                self.name, c
            )));
        }

        Ok(())
    }
}

/// RFC 7230 tchar
fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c)
}

/// 按名称去重的请求头列表
///
/// 名称不区分大小写；同名请求头后者覆盖前者的值，保留首次出现的位置
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList {
    headers: Vec<NameValue>,
}

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, header: NameValue) {
        match self
            .headers
            .iter_mut()
            .find(|h| h.name.eq_ignore_ascii_case(&header.name))
        {
            Some(existing) => existing.value = header.value,
            None => self.headers.push(header),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.headers.iter().any(|h| h.name.eq_ignore_ascii_case(name))
    }

    pub fn as_slice(&self) -> &[NameValue] {
        &self.headers
    }
}

/// 上传任务事件
///
/// 每个任务恰好产生一个终态事件（Completed / Error / Cancelled）
#[derive(Debug)]
pub enum UploadEvent {
    /// 进度更新（字节数相对于当前尝试）
    Progress {
        upload_id: String,
        attempt: u32,
        uploaded_bytes: u64,
        total_bytes: Option<u64>,
    },
    /// 上传完成
    Completed {
        upload_id: String,
        response: HttpResponse,
        files: Vec<UploadFile>,
        completed_at: i64,
    },
    /// 上传失败
    Error {
        upload_id: String,
        error: UploadError,
    },
    /// 上传已取消
    Cancelled { upload_id: String },
}

impl UploadEvent {
    pub fn upload_id(&self) -> &str {
        match self {
            UploadEvent::Progress { upload_id, .. }
            | UploadEvent::Completed { upload_id, .. }
            | UploadEvent::Error { upload_id, .. }
            | UploadEvent::Cancelled { upload_id } => upload_id,
        }
    }

    pub fn status(&self) -> UploadStatus {
        match self {
            UploadEvent::Progress { .. } => UploadStatus::InProgress,
            UploadEvent::Completed { .. } => UploadStatus::Completed,
            UploadEvent::Error { .. } => UploadStatus::Error,
            UploadEvent::Cancelled { .. } => UploadStatus::Cancelled,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_successfully_uploaded_flag() {
        let mut file = UploadFile::new("/tmp/photo.jpg");
        assert!(!file.successfully_uploaded());

        file.set_successfully_uploaded(true);
        assert!(file.successfully_uploaded());
        assert_eq!(
            file.properties.get("successful_upload").map(String::as_str),
            Some("true")
        );

        file.set_successfully_uploaded(false);
        assert!(!file.successfully_uploaded());
    }

    #[test]
    fn test_header_name_validation() {
        assert!(NameValue::new("X-Token", "abc").validate_as_header(false).is_ok());
        assert!(NameValue::new("", "abc").validate_as_header(false).is_err());
        assert!(NameValue::new("X\r\nInjected", "abc").validate_as_header(false).is_err());
        assert!(NameValue::new("X Token", "abc").validate_as_header(false).is_err());
        assert!(NameValue::new("X-Tök", "abc").validate_as_header(true).is_err());
    }

    #[test]
    fn test_header_value_validation() {
        assert!(NameValue::new("X-Name", "tab\tseparated").validate_as_header(false).is_ok());
        assert!(NameValue::new("X-Name", "line\nbreak").validate_as_header(false).is_err());
        assert!(NameValue::new("X-Name", "line\nbreak").validate_as_header(true).is_err());

        let non_ascii = NameValue::new("X-Name", "文件.txt");
        assert!(matches!(
            non_ascii.validate_as_header(false),
            Err(UploadError::Configuration(_))
        ));
        assert!(non_ascii.validate_as_header(true).is_ok());
    }

    #[test]
    fn test_header_list_dedup() {
        let mut headers = HeaderList::new();
        headers.set(NameValue::new("Content-Type", "text/plain"));
        headers.set(NameValue::new("X-Id", "1"));
        headers.set(NameValue::new("content-type", "application/octet-stream"));

        assert_eq!(
            headers.as_slice(),
            &[
                NameValue::new("Content-Type", "application/octet-stream"),
                NameValue::new("X-Id", "1"),
            ]
        );
        assert!(headers.contains("x-id"));
        assert!(!headers.contains("User-Agent"));
    }

    #[test]
    fn test_event_status() {
        let event = UploadEvent::Cancelled {
            upload_id: "abc".to_string(),
        };
        assert_eq!(event.status(), UploadStatus::Cancelled);
        assert_eq!(event.upload_id(), "abc");
        assert!(event.is_terminal());

        let event = UploadEvent::Progress {
            upload_id: "abc".to_string(),
            attempt: 1,
            uploaded_bytes: 10,
            total_bytes: Some(100),
        };
        assert!(!event.is_terminal());
    }
}
