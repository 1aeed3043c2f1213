//! 使用额度查询数据模型
//!
//! getUsageLimits API 的响应类型；isEmailRequired=true 时附带 userInfo。

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// 使用额度查询响应
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageLimitsResponse {
    /// 账号身份（isEmailRequired=true 时返回）
    #[serde(default)]
    pub user_info: Option<UsageUserInfo>,

    /// 下次重置日期 (Unix 时间戳)
    #[serde(default)]
    pub next_date_reset: Option<f64>,

    /// 订阅信息
    #[serde(default)]
    pub subscription_info: Option<SubscriptionInfo>,

    /// 使用量明细列表
    #[serde(default)]
    pub usage_breakdown_list: Vec<UsageBreakdown>,
}

/// 账号身份信息
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageUserInfo {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// 订阅信息
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInfo {
    /// 订阅标题 (KIRO PRO+ / KIRO FREE 等)
    #[serde(default)]
    pub subscription_title: Option<String>,
}

/// 使用量明细
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageBreakdown {
    /// 当前使用量
    #[serde(default)]
    pub current_usage: i64,

    /// 当前使用量（精确值）
    #[serde(default)]
    pub current_usage_with_precision: f64,

    /// 免费试用信息
    #[serde(default)]
    pub free_trial_info: Option<FreeTrialInfo>,

    /// 下次重置日期 (Unix 时间戳)
    #[serde(default)]
    pub next_date_reset: Option<f64>,

    /// 使用限额
    #[serde(default)]
    pub usage_limit: i64,

    /// 使用限额（精确值）
    #[serde(default)]
    pub usage_limit_with_precision: f64,

    /// 额外用量包（如 GIFT 类型）
    #[serde(default)]
    pub bonuses: Option<Vec<Bonus>>,
}

/// 额外用量包信息（如 GIFT 类型）
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bonus {
    #[serde(default)]
    pub display_name: Option<String>,

    #[serde(default)]
    pub current_usage_with_precision: f64,

    #[serde(default)]
    pub usage_limit_with_precision: f64,

    /// 状态 (ACTIVE / EXPIRED)
    #[serde(default)]
    pub status: Option<String>,

    /// 过期时间 (RFC3339 格式)
    #[serde(default)]
    pub expires_at: Option<String>,
}

/// 免费试用信息
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreeTrialInfo {
    #[serde(default)]
    pub current_usage_with_precision: f64,

    #[serde(default)]
    pub usage_limit_with_precision: f64,

    /// 免费试用状态 (ACTIVE / EXPIRED)
    #[serde(default)]
    pub free_trial_status: Option<String>,
}

impl Bonus {
    /// 用量包是否仍然有效
    pub fn is_active(&self) -> bool {
        match self.status.as_deref() {
            Some(s) => s.eq_ignore_ascii_case("ACTIVE"),
            None => {
                // 没有 status 时：优先用 expires_at 判断；再用 limit/current 兜底。
                if let Some(exp) = self.expires_at.as_deref() {
                    if let Ok(dt) = DateTime::parse_from_rfc3339(exp) {
                        return dt > Utc::now();
                    }
                }
                self.usage_limit_with_precision > 0.0 || self.current_usage_with_precision > 0.0
            }
        }
    }
}

impl FreeTrialInfo {
    /// 免费试用是否处于激活状态
    pub fn is_active(&self) -> bool {
        self.free_trial_status
            .as_deref()
            .map(|s| s == "ACTIVE")
            .unwrap_or(false)
    }
}

impl UsageLimitsResponse {
    /// 获取订阅标题
    pub fn subscription_title(&self) -> Option<&str> {
        self.subscription_info
            .as_ref()
            .and_then(|info| info.subscription_title.as_deref())
    }

    fn primary_breakdown(&self) -> Option<&UsageBreakdown> {
        self.usage_breakdown_list.first()
    }

    /// 总使用限额：基础额度 + 激活的免费试用 + 激活的用量包
    pub fn usage_limit(&self) -> f64 {
        let Some(breakdown) = self.primary_breakdown() else {
            return 0.0;
        };

        let free_trial = breakdown
            .free_trial_info
            .as_ref()
            .filter(|t| t.is_active())
            .map(|t| t.usage_limit_with_precision)
            .unwrap_or(0.0);

        let bonuses: f64 = breakdown
            .bonuses
            .as_ref()
            .map(|bs| {
                bs.iter()
                    .filter(|b| b.is_active())
                    .map(|b| b.usage_limit_with_precision)
                    .sum()
            })
            .unwrap_or(0.0);

        breakdown.usage_limit_with_precision + free_trial + bonuses
    }

    /// 总当前使用量：口径与 `usage_limit` 一致
    pub fn current_usage(&self) -> f64 {
        let Some(breakdown) = self.primary_breakdown() else {
            return 0.0;
        };

        let free_trial = breakdown
            .free_trial_info
            .as_ref()
            .filter(|t| t.is_active())
            .map(|t| t.current_usage_with_precision)
            .unwrap_or(0.0);

        let bonuses: f64 = breakdown
            .bonuses
            .as_ref()
            .map(|bs| {
                bs.iter()
                    .filter(|b| b.is_active())
                    .map(|b| b.current_usage_with_precision)
                    .sum()
            })
            .unwrap_or(0.0);

        breakdown.current_usage_with_precision + free_trial + bonuses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_response() {
        let json = r#"{
            "userInfo": {"email": "dev@example.com", "userId": "u-1"},
            "subscriptionInfo": {"subscriptionTitle": "KIRO FREE"},
            "usageBreakdownList": [{
                "currentUsage": 3,
                "currentUsageWithPrecision": 3.5,
                "usageLimit": 50,
                "usageLimitWithPrecision": 50.0,
                "freeTrialInfo": {
                    "currentUsageWithPrecision": 1.0,
                    "usageLimitWithPrecision": 10.0,
                    "freeTrialStatus": "ACTIVE"
                },
                "bonuses": [{
                    "displayName": "Gift",
                    "currentUsageWithPrecision": 0.5,
                    "usageLimitWithPrecision": 5.0,
                    "status": "ACTIVE"
                }]
            }]
        }"#;

        let resp: UsageLimitsResponse = match serde_json::from_str(json) {
            Ok(v) => v,
            Err(e) => panic!("{:?}", e),
        };

        assert_eq!(resp.subscription_title(), Some("KIRO FREE"));
        assert!((resp.usage_limit() - 65.0).abs() < 1e-9);
        assert!((resp.current_usage() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_inactive_extras_excluded() {
        let json = r#"{
            "usageBreakdownList": [{
                "usageLimitWithPrecision": 50.0,
                "currentUsageWithPrecision": 10.0,
                "freeTrialInfo": {
                    "usageLimitWithPrecision": 10.0,
                    "freeTrialStatus": "EXPIRED"
                },
                "bonuses": [{
                    "usageLimitWithPrecision": 5.0,
                    "status": "EXPIRED"
                }]
            }]
        }"#;

        let resp: UsageLimitsResponse = match serde_json::from_str(json) {
            Ok(v) => v,
            Err(e) => panic!("{:?}", e),
        };

        assert!((resp.usage_limit() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_breakdown() {
        let resp: UsageLimitsResponse = match serde_json::from_str("{}") {
            Ok(v) => v,
            Err(e) => panic!("{:?}", e),
        };
        assert_eq!(resp.usage_limit(), 0.0);
        assert_eq!(resp.current_usage(), 0.0);
        assert!(resp.user_info.is_none());
    }

    #[test]
    fn test_bonus_active_by_expiry() {
        let future = (Utc::now() + chrono::Duration::days(1)).to_rfc3339();
        let bonus = Bonus {
            display_name: None,
            current_usage_with_precision: 0.0,
            usage_limit_with_precision: 0.0,
            status: None,
            expires_at: Some(future),
        };
        assert!(bonus.is_active());

        let past = (Utc::now() - chrono::Duration::days(1)).to_rfc3339();
        let expired = Bonus {
            expires_at: Some(past),
            ..bonus
        };
        assert!(!expired.is_active());
    }
}
