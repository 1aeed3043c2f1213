//! 账号池
//!
//! 持有配置仓库加载的账号列表，实现：
//! - 主池/兜底池分层 + 排序窗口内加权随机的选号策略
//! - 错误冷却（配额错误 1 小时，连续 3 次普通错误 1 分钟）
//! - Token 安装与统计累计（持久化在独立任务中进行，不阻塞调用方）
//!
//! 单个读写锁保护 `{accounts, cooldowns, error_counts}`；重载账号列表
//! 不会清掉冷却与错误计数。

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;

use crate::config::{Account, SharedConfigStore};

/// 进入主池的用量积分门槛
const PRIMARY_USAGE_THRESHOLD: i64 = 10;

/// 排序窗口大小：只在前 N 个候选里加权随机
const TOP_CANDIDATE_LIMIT: usize = 3;

/// Token 临期过滤余量（秒）
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 300;

/// 连续普通错误触发冷却的阈值
const ERROR_COOLDOWN_THRESHOLD: u32 = 3;

struct PoolInner {
    accounts: Vec<Account>,
    /// 账号 ID -> 冷却截止时刻
    cooldowns: HashMap<String, DateTime<Utc>>,
    /// 账号 ID -> 连续错误计数
    error_counts: HashMap<String, u32>,
}

/// 账号池
pub struct AccountPool {
    store: SharedConfigStore,
    inner: RwLock<PoolInner>,
}

impl AccountPool {
    /// 创建账号池并立即从仓库加载启用的账号
    pub fn new(store: SharedConfigStore) -> Self {
        let accounts = store.enabled_accounts();
        tracing::info!("账号池已加载 {} 个账号", accounts.len());
        Self {
            store,
            inner: RwLock::new(PoolInner {
                accounts,
                cooldowns: HashMap::new(),
                error_counts: HashMap::new(),
            }),
        }
    }

    /// 从仓库重新加载账号，冷却与错误计数保持不变
    pub fn reload(&self) {
        let accounts = self.store.enabled_accounts();
        let mut inner = self.inner.write();
        inner.accounts = accounts;
    }

    /// 选出一个可用账号
    ///
    /// 过滤冷却中与 Token 临期的账号后分两层：
    /// 用量积分达标的主池优先，其次兜底池；层内按积分/刷新时间排序，
    /// 在前 3 个候选里加权随机。全部不可用时返回冷却最早结束的账号。
    /// 池为空时返回 None。
    pub fn get_next(&self) -> Option<Account> {
        let inner = self.inner.read();
        if inner.accounts.is_empty() {
            return None;
        }

        let now = Utc::now();
        let now_unix = now.timestamp();

        let mut primary: Vec<&Account> = Vec::new();
        let mut fallback: Vec<&Account> = Vec::new();

        for acc in &inner.accounts {
            // 跳过冷却中的账号
            if let Some(cooldown) = inner.cooldowns.get(&acc.id) {
                if now < *cooldown {
                    continue;
                }
            }

            // 跳过即将过期的 Token
            if token_expiring_soon(acc.expires_at, now_unix) {
                continue;
            }

            if acc.usage_current >= PRIMARY_USAGE_THRESHOLD {
                primary.push(acc);
            } else {
                fallback.push(acc);
            }
        }

        if let Some(picked) = pick_weighted_with_ranking(&mut primary) {
            return Some(picked.clone());
        }
        if let Some(picked) = pick_weighted_with_ranking(&mut fallback) {
            return Some(picked.clone());
        }

        // 无可用账号：返回冷却最早结束的；没有冷却条目的直接返回
        let mut best: Option<(&Account, DateTime<Utc>)> = None;
        for acc in &inner.accounts {
            match inner.cooldowns.get(&acc.id) {
                Some(cooldown) => {
                    let earlier = best
                        .as_ref()
                        .map(|(_, earliest)| cooldown < earliest)
                        .unwrap_or(true);
                    if earlier {
                        best = Some((acc, *cooldown));
                    }
                }
                None => return Some(acc.clone()),
            }
        }
        best.map(|(acc, _)| acc.clone())
    }

    /// 按 ID 查找账号
    pub fn get_by_id(&self, id: &str) -> Option<Account> {
        let inner = self.inner.read();
        inner.accounts.iter().find(|a| a.id == id).cloned()
    }

    /// 记录请求成功：清除冷却并重置错误计数
    pub fn record_success(&self, id: &str) {
        let mut inner = self.inner.write();
        inner.cooldowns.remove(id);
        inner.error_counts.insert(id.to_string(), 0);
    }

    /// 记录请求失败
    ///
    /// 配额错误立即冷却 1 小时；普通错误累计到 3 次后冷却 1 分钟。
    pub fn record_error(&self, id: &str, is_quota_error: bool) {
        let mut inner = self.inner.write();

        let count = inner.error_counts.entry(id.to_string()).or_insert(0);
        *count += 1;
        let count = *count;

        if is_quota_error {
            tracing::warn!(id, "账号配额错误，冷却 1 小时");
            inner
                .cooldowns
                .insert(id.to_string(), Utc::now() + Duration::hours(1));
        } else if count >= ERROR_COOLDOWN_THRESHOLD {
            tracing::warn!(id, count, "账号连续错误，冷却 1 分钟");
            inner
                .cooldowns
                .insert(id.to_string(), Utc::now() + Duration::minutes(1));
        }
    }

    /// 安装新 Token
    ///
    /// refresh_token 仅在非空时替换。
    pub fn update_token(&self, id: &str, access_token: &str, refresh_token: &str, expires_at: i64) {
        let mut inner = self.inner.write();
        if let Some(acc) = inner.accounts.iter_mut().find(|a| a.id == id) {
            acc.access_token = access_token.to_string();
            if !refresh_token.is_empty() {
                acc.refresh_token = refresh_token.to_string();
            }
            acc.expires_at = expires_at;
        }
    }

    /// 累计用量统计并调度异步持久化
    pub fn update_stats(&self, id: &str, tokens: i64, credits: f64) {
        let snapshot = {
            let mut inner = self.inner.write();
            let Some(acc) = inner.accounts.iter_mut().find(|a| a.id == id) else {
                return;
            };

            acc.request_count += 1;
            acc.total_tokens += tokens;
            acc.total_credits += credits;
            acc.last_used = Utc::now().timestamp();

            (
                acc.id.clone(),
                acc.request_count,
                acc.error_count,
                acc.total_tokens,
                acc.total_credits,
                acc.last_used,
            )
        };

        // 持久化在独立任务中执行，调用方不等待磁盘 I/O
        let store = self.store.clone();
        let persist = move || {
            let (id, request_count, error_count, total_tokens, total_credits, last_used) = snapshot;
            store.update_account_stats(
                &id,
                request_count,
                error_count,
                total_tokens,
                total_credits,
                last_used,
            );
        };

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn_blocking(persist);
        } else {
            persist();
        }
    }

    /// 账号总数
    pub fn count(&self) -> usize {
        self.inner.read().accounts.len()
    }

    /// 可用账号数（未处于冷却中）
    pub fn available_count(&self) -> usize {
        let inner = self.inner.read();
        let now = Utc::now();
        inner
            .accounts
            .iter()
            .filter(|acc| {
                inner
                    .cooldowns
                    .get(&acc.id)
                    .map(|cooldown| now >= *cooldown)
                    .unwrap_or(true)
            })
            .count()
    }

    /// 所有账号的副本
    pub fn get_all_accounts(&self) -> Vec<Account> {
        self.inner.read().accounts.clone()
    }
}

/// Token 是否临期（过期前 5 分钟即视为不可用；expires_at 为 0 表示未知，不过滤）
fn token_expiring_soon(expires_at: i64, now: i64) -> bool {
    expires_at > 0 && expires_at - TOKEN_EXPIRY_MARGIN_SECS <= now
}

/// 层内选号：按积分/刷新时间排序后在前 N 个候选里加权随机
fn pick_weighted_with_ranking<'a>(candidates: &mut [&'a Account]) -> Option<&'a Account> {
    if candidates.is_empty() {
        return None;
    }

    // 稳定排序：积分降序，相同时按最近刷新优先
    candidates.sort_by(|a, b| {
        b.usage_current
            .cmp(&a.usage_current)
            .then_with(|| b.last_refresh.cmp(&a.last_refresh))
    });

    let limit = candidates.len().min(TOP_CANDIDATE_LIMIT);
    let top = &candidates[..limit];

    let total_weight: i64 = top.iter().map(|a| a.effective_weight()).sum();
    if total_weight <= 0 {
        // 权重默认规则下到不了这里，保底均匀随机
        return Some(top[fastrand::usize(..top.len())]);
    }

    let mut r = fastrand::i64(0..total_weight);
    for acc in top {
        r -= acc.effective_weight();
        if r < 0 {
            return Some(acc);
        }
    }
    Some(top[limit - 1])
}
