//! 进程级共享 HTTP 客户端
//!
//! 两个独立的客户端：
//! - auth 客户端：30 秒总超时，用于所有认证类请求（注册、换 token、轮询）
//! - 流式客户端：5 分钟总超时，用于上游助手 API 的长响应
//!
//! 分开的原因：流式请求不能借用 auth 的短超时，否则长响应会被整体 deadline
//! 中断。reqwest::Client 内部是 Arc，clone 共享同一个连接池。

use std::sync::OnceLock;
use std::time::Duration;

use reqwest::Client;

use crate::error::{Error, Result};

/// 认证类请求总超时
const AUTH_TIMEOUT: Duration = Duration::from_secs(30);

/// 流式请求总超时
const STREAM_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// 空闲连接保留时长
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);

fn build(timeout: Duration, max_idle_per_host: usize) -> Result<Client> {
    // gzip 由 feature 默认开启；HTTP/2 经 ALPN 协商。
    // reqwest 只暴露 per-host 空闲上限，没有全局上限。
    Client::builder()
        .timeout(timeout)
        .pool_max_idle_per_host(max_idle_per_host)
        .pool_idle_timeout(IDLE_TIMEOUT)
        .build()
        .map_err(|e| Error::Other(format!("构建 HTTP 客户端失败: {}", e)))
}

/// 获取认证用共享客户端
pub fn auth_client() -> Result<Client> {
    static CLIENT: OnceLock<Client> = OnceLock::new();
    if let Some(c) = CLIENT.get() {
        return Ok(c.clone());
    }
    let c = build(AUTH_TIMEOUT, 10)?;
    Ok(CLIENT.get_or_init(|| c).clone())
}

/// 获取流式用共享客户端
pub fn stream_client() -> Result<Client> {
    static CLIENT: OnceLock<Client> = OnceLock::new();
    if let Some(c) = CLIENT.get() {
        return Ok(c.clone());
    }
    let c = build(STREAM_TIMEOUT, 20)?;
    Ok(CLIENT.get_or_init(|| c).clone())
}
