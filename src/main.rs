use anyhow::{bail, Context};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use upload_engine::{
    config::DEFAULT_CONFIG_PATH, logging, AppConfig, FileBody, HttpMethod, HttpTransport,
    ReqwestStack, UploadEvent, UploadFile, UploadStatus, UploadTask, UploadTaskParameters,
};

const USAGE: &str = "用法: upload-engine [--method <METHOD>] <server-url> <file>...";

/// 命令行参数
#[derive(Debug, PartialEq, Eq)]
struct CliArgs {
    method: HttpMethod,
    server_url: String,
    files: Vec<String>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<CliArgs> {
    let mut method = HttpMethod::Post;
    let mut positional = Vec::new();

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        if arg == "--method" || arg == "-X" {
            let value = match args.next() {
                Some(value) => value,
                None => bail!("{} 缺少参数值\n{}", arg, USAGE),
            };
            method = value.parse().context("无效的 HTTP 方法")?;
        } else if let Some(value) = arg.strip_prefix("--method=") {
            method = value.parse().context("无效的 HTTP 方法")?;
        } else {
            positional.push(arg);
        }
    }

    let mut positional = positional.into_iter();
    let server_url = match positional.next() {
        Some(url) => url,
        None => bail!("缺少服务器地址\n{}", USAGE),
    };
    let files: Vec<String> = positional.collect();
    if files.is_empty() {
        bail!("缺少待上传文件\n{}", USAGE);
    }

    Ok(CliArgs {
        method,
        server_url,
        files,
    })
}

/// 事件转为一行 JSON
fn event_to_json(event: &UploadEvent) -> serde_json::Value {
    match event {
        UploadEvent::Progress {
            upload_id,
            attempt,
            uploaded_bytes,
            total_bytes,
        } => json!({
            "event": "progress",
            "upload_id": upload_id,
            "attempt": attempt,
            "uploaded_bytes": uploaded_bytes,
            "total_bytes": total_bytes,
        }),
        UploadEvent::Completed {
            upload_id,
            response,
            files,
            completed_at,
        } => json!({
            "event": "completed",
            "upload_id": upload_id,
            "status_code": response.code,
            "body": response.body_string(),
            "files": files,
            "completed_at": completed_at,
        }),
        UploadEvent::Error { upload_id, error } => json!({
            "event": "error",
            "upload_id": upload_id,
            "message": error.to_string(),
            "retriable": error.is_retriable(),
            "status_code": error.response().map(|r| r.code),
        }),
        UploadEvent::Cancelled { upload_id } => json!({
            "event": "cancelled",
            "upload_id": upload_id,
        }),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load_or_default(DEFAULT_CONFIG_PATH).await;

    // 初始化日志系统（必须保持 log_guard 存活）
    let log_guard = logging::init_logging(&config.log);

    let CliArgs {
        method,
        server_url,
        files,
    } = parse_args(std::env::args().skip(1))?;

    let transport: Arc<dyn HttpTransport> =
        Arc::new(ReqwestStack::new(&config.http).context("初始化 HTTP 客户端失败")?);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let mut handles = Vec::with_capacity(files.len());
    let mut joins = Vec::with_capacity(files.len());

    for path in &files {
        let body = FileBody::new(path);
        let params = UploadTaskParameters::new(server_url.clone())
            .with_method(method)
            .with_header("Content-Type", body.content_type())
            .with_file(UploadFile::new(path.clone()));
        info!(
            "创建上传任务: id={}, file={}, content_type={}",
            params.id,
            path,
            body.content_type()
        );

        let task = UploadTask::new(
            params,
            Arc::new(body),
            transport.clone(),
            &config.upload,
            event_tx.clone(),
        );
        let (handle, join) = task.spawn();
        handles.push(handle);
        joins.push(join);
    }
    drop(event_tx);

    // Ctrl-C 取消所有任务
    let cancel_handles = handles.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到中断信号，取消所有上传任务");
            for handle in &cancel_handles {
                if !handle.is_cancelled() {
                    info!("[{}] 取消上传", handle.upload_id());
                }
                handle.cancel();
            }
        }
    });

    // 所有任务结束后发送端全部释放，循环退出
    let mut statuses: HashMap<String, UploadStatus> = HashMap::new();
    while let Some(event) = event_rx.recv().await {
        println!("{}", event_to_json(&event));
        if event.is_terminal() {
            statuses.insert(event.upload_id().to_string(), event.status());
        }
    }

    for join in joins {
        join.await.context("上传任务异常退出")?;
    }

    let completed = statuses
        .values()
        .filter(|s| **s == UploadStatus::Completed)
        .count();
    info!("上传结束: {}/{} 个任务完成", completed, handles.len());

    if completed != handles.len() {
        // exit 不会执行析构，先刷出文件日志
        drop(log_guard);
        std::process::exit(1);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_args_defaults_to_post() {
        let parsed = parse_args(args(&["http://localhost/upload", "a.bin", "b.mp4"])).unwrap();
        assert_eq!(parsed.method, HttpMethod::Post);
        assert_eq!(parsed.server_url, "http://localhost/upload");
        assert_eq!(parsed.files, vec!["a.bin", "b.mp4"]);
    }

    #[test]
    fn test_parse_args_method() {
        let parsed =
            parse_args(args(&["--method", "put", "http://localhost/upload", "a.bin"])).unwrap();
        assert_eq!(parsed.method, HttpMethod::Put);

        let parsed = parse_args(args(&["http://localhost/upload", "-X", "PATCH", "a.bin"])).unwrap();
        assert_eq!(parsed.method, HttpMethod::Patch);
        assert_eq!(parsed.files, vec!["a.bin"]);

        let parsed = parse_args(args(&["--method=delete", "http://localhost/x", "a"])).unwrap();
        assert_eq!(parsed.method, HttpMethod::Delete);
    }

    #[test]
    fn test_parse_args_errors() {
        assert!(parse_args(args(&[])).is_err());
        assert!(parse_args(args(&["http://localhost/upload"])).is_err());
        assert!(parse_args(args(&["--method", "TRACE", "http://localhost/upload", "a"])).is_err());
        assert!(parse_args(args(&["http://localhost/upload", "a", "--method"])).is_err());
    }

    #[test]
    fn test_event_to_json_cancelled() {
        let event = UploadEvent::Cancelled {
            upload_id: "task-1".to_string(),
        };
        let value = event_to_json(&event);
        assert_eq!(value["event"], "cancelled");
        assert_eq!(value["upload_id"], "task-1");
    }
}
