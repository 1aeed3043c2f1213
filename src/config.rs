//! 账号记录与配置仓库接口
//!
//! 配置持久化由外部实现（文件 / 数据库均可），核心只通过 `ConfigStore`
//! 读取启用的账号、回写统计并查询端点偏好。

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// 权重缺失或非正时的默认值
pub const DEFAULT_WEIGHT: i64 = 100;

/// 账号记录
///
/// 由配置仓库加载，账号池独占持有；所有修改都在池的写锁内进行。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Account {
    /// 池内唯一 ID
    pub id: String,

    /// 访问 Token
    pub access_token: String,
    /// 刷新 Token
    pub refresh_token: String,
    /// 访问 Token 过期时间（Unix 秒；0 表示未知）
    pub expires_at: i64,

    /// 注册时获得的 OIDC client 对
    pub client_id: String,
    pub client_secret: String,

    /// 注册时使用的 region / start-url
    pub region: String,
    pub start_url: String,

    /// 机器标识（可选，影响 User-Agent）
    pub machine_id: Option<String>,

    /// 选号权重（非正时按 100 处理）
    pub weight: i64,

    /// 近期用量积分（仓库提供的"热度"，本地不推导）
    pub usage_current: i64,

    /// 最近一次 Token 刷新时间（Unix 秒）
    pub last_refresh: i64,

    /// 累计统计
    pub request_count: u64,
    pub error_count: u64,
    pub total_tokens: i64,
    pub total_credits: f64,
    /// 最近一次使用时间（Unix 秒）
    pub last_used: i64,

    /// 是否启用
    pub enabled: bool,
}

impl Account {
    /// 选号时的有效权重
    pub fn effective_weight(&self) -> i64 {
        if self.weight > 0 {
            self.weight
        } else {
            DEFAULT_WEIGHT
        }
    }
}

/// 首选端点配置
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreferredEndpoint {
    /// 默认顺序（CodeWhisperer 优先）
    #[default]
    Auto,
    /// CodeWhisperer 优先
    CodeWhisperer,
    /// AmazonQ 优先
    AmazonQ,
}

/// 配置仓库接口
///
/// 实现方负责持久化；`update_account_stats` 由账号池在独立任务中调用，
/// 可以安全地做磁盘 I/O。
pub trait ConfigStore: Send + Sync {
    /// 读取所有启用的账号
    fn enabled_accounts(&self) -> Vec<Account>;

    /// 回写单个账号的累计统计
    fn update_account_stats(
        &self,
        id: &str,
        request_count: u64,
        error_count: u64,
        total_tokens: i64,
        total_credits: f64,
        last_used: i64,
    );

    /// 查询首选端点
    fn preferred_endpoint(&self) -> PreferredEndpoint;
}

/// 共享的配置仓库句柄
pub type SharedConfigStore = Arc<dyn ConfigStore>;
