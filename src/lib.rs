//! kiro-relay：Kiro 多账号代理核心
//!
//! 把一池账号复用在单个下游接口后面：
//! - `pool`：账号选取（主池/兜底池 + 加权随机）、冷却与统计
//! - `kiro`：上游调用编排与事件流（AWS Event Stream）解码
//! - `auth`：PKCE / 设备码两种登录流程、Token 刷新与身份探测
//!
//! 配置持久化、请求翻译与 HTTP 前端不在本 crate 内，
//! 通过 `config::ConfigStore` 等接口由外部提供。

pub mod auth;
pub mod config;
pub mod error;
pub mod http_client;
pub mod kiro;
pub mod pool;

pub use config::{Account, ConfigStore, PreferredEndpoint, SharedConfigStore};
pub use error::{Error, Result};
pub use kiro::model::request::KiroPayload;
pub use kiro::provider::KiroProvider;
pub use kiro::stream::{StreamCallbacks, ToolUse};
pub use pool::AccountPool;
