//! 账号身份探测
//!
//! 用 accessToken 调 getUsageLimits 拿 userInfo（顺带返回用量信息）。

use crate::error::{Error, Result};
use crate::http_client;
use crate::kiro::model::usage_limits::UsageLimitsResponse;

const USAGE_LIMITS_URL: &str = "https://q.us-east-1.amazonaws.com/getUsageLimits?origin=AI_EDITOR&resourceType=AGENTIC_REQUEST&isEmailRequired=true";

/// 模拟官方 SDK 的 User-Agent
const USER_AGENT: &str = "aws-sdk-js/1.0.18 KiroRelay";

/// 账号身份
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub email: String,
    pub user_id: String,
}

/// 查询使用额度（含 userInfo）
pub async fn get_usage_limits(access_token: &str) -> Result<UsageLimitsResponse> {
    let client = http_client::auth_client()?;

    let response = client
        .get(USAGE_LIMITS_URL)
        .header("Authorization", format!("Bearer {}", access_token))
        .header("Accept", "application/json")
        .header("User-Agent", USER_AGENT)
        .header("x-amz-user-agent", USER_AGENT)
        .send()
        .await
        .map_err(Error::network)?;

    let status = response.status().as_u16();
    if status != 200 {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::from_status(status, body, "getUsageLimits"));
    }

    response
        .json()
        .await
        .map_err(|e| Error::Decode(format!("解析使用额度响应失败: {}", e)))
}

/// 获取账号身份（email / userId）
pub async fn get_user_info(access_token: &str) -> Result<UserIdentity> {
    let limits = get_usage_limits(access_token).await?;
    let user_info = limits.user_info.unwrap_or_default();
    Ok(UserIdentity {
        email: user_info.email.unwrap_or_default(),
        user_id: user_info.user_id.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 集成测试：使用真实 accessToken 探测身份
    ///
    /// ```
    /// KIRO_ACCESS_TOKEN=... cargo test test_get_user_info_real -- --ignored --nocapture
    /// ```
    #[tokio::test]
    #[ignore] // 需要真实凭据，默认跳过
    async fn test_get_user_info_real() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();

        let Ok(token) = std::env::var("KIRO_ACCESS_TOKEN") else {
            println!("跳过测试：未设置 KIRO_ACCESS_TOKEN");
            return;
        };

        match get_user_info(&token).await {
            Ok(identity) => {
                println!("email: {}", identity.email);
                println!("userId: {}", identity.user_id);
                assert!(!identity.user_id.is_empty());
            }
            Err(e) => panic!("探测身份失败: {}", e),
        }
    }

    #[test]
    fn test_identity_parsed_from_response() {
        let json = r#"{
            "userInfo": {"email": "dev@example.com", "userId": "u-1"},
            "usageBreakdownList": []
        }"#;
        let limits: UsageLimitsResponse = match serde_json::from_str(json) {
            Ok(v) => v,
            Err(e) => panic!("{:?}", e),
        };
        let info = limits.user_info.unwrap_or_default();
        assert_eq!(info.email.as_deref(), Some("dev@example.com"));
        assert_eq!(info.user_id.as_deref(), Some("u-1"));
    }
}
