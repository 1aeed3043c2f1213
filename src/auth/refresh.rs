//! Token 刷新
//!
//! 用账号保存的 refreshToken + client 对向 OIDC 换新的访问 Token。
//! 刷新结果由调用方通过账号池的 `update_token` 安装。

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::{oidc_base, region_or_default};
use crate::config::Account;
use crate::error::{Error, Result};
use crate::http_client;

/// 刷新请求所需的 x-amz-user-agent
const REFRESH_AMZ_USER_AGENT: &str =
    "aws-sdk-js/3.738.0 ua/2.1 os/other lang/js md/browser#unknown_unknown api/sso-oidc#3.738.0 m/E KiroIDE";

/// 刷新结果
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    /// 上游可能轮换 refreshToken；None 表示沿用旧值
    pub refresh_token: Option<String>,
    /// 新的过期时间（Unix 秒）
    pub expires_at: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    refresh_token: &'a str,
    grant_type: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// 校验 refreshToken 的基本有效性
///
/// 明显被截断的 token（过短或带省略号）直接拒绝，避免白白消耗一次请求。
pub fn validate_refresh_token(account: &Account) -> Result<()> {
    let token = &account.refresh_token;
    if token.is_empty() {
        return Err(Error::Other("缺少 refreshToken".to_string()));
    }
    if token.len() < 100 || token.contains("...") {
        return Err(Error::Other(format!(
            "refreshToken 疑似被截断（长度 {} 字符）",
            token.len()
        )));
    }
    Ok(())
}

/// 刷新账号的访问 Token
pub async fn refresh_account_token(account: &Account) -> Result<RefreshedToken> {
    validate_refresh_token(account)?;

    if account.client_id.is_empty() || account.client_secret.is_empty() {
        return Err(Error::Other("刷新需要 clientId / clientSecret".to_string()));
    }

    let region = region_or_default(&account.region);
    let url = format!("{}/token", oidc_base(region));

    tracing::info!(id = %account.id, region, "正在刷新 Token...");

    let body = RefreshRequest {
        client_id: &account.client_id,
        client_secret: &account.client_secret,
        refresh_token: &account.refresh_token,
        grant_type: "refresh_token",
    };

    let client = http_client::auth_client()?;
    let response = client
        .post(&url)
        .header("x-amz-user-agent", REFRESH_AMZ_USER_AGENT)
        .header("Accept", "*/*")
        .header("User-Agent", "node")
        .json(&body)
        .send()
        .await
        .map_err(Error::network)?;

    let status = response.status().as_u16();
    if status != 200 {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::from_status(status, body, "refreshToken"));
    }

    let data: RefreshResponse = response
        .json()
        .await
        .map_err(|e| Error::Decode(format!("解析刷新响应失败: {}", e)))?;

    let expires_at = Utc::now().timestamp() + data.expires_in.unwrap_or(0);

    Ok(RefreshedToken {
        access_token: data.access_token,
        refresh_token: data.refresh_token.filter(|t| !t.is_empty()),
        expires_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account_with_refresh(token: &str) -> Account {
        Account {
            id: "a".to_string(),
            refresh_token: token.to_string(),
            client_id: "cid".to_string(),
            client_secret: "cs".to_string(),
            ..Account::default()
        }
    }

    #[test]
    fn test_validate_refresh_token() {
        assert!(validate_refresh_token(&account_with_refresh("")).is_err());
        assert!(validate_refresh_token(&account_with_refresh("short")).is_err());
        assert!(validate_refresh_token(&account_with_refresh(&format!("{}...", "a".repeat(120)))).is_err());
        assert!(validate_refresh_token(&account_with_refresh(&"a".repeat(120))).is_ok());
    }

    #[test]
    fn test_refresh_request_serializes_camel_case() {
        let req = RefreshRequest {
            client_id: "cid",
            client_secret: "cs",
            refresh_token: "rt",
            grant_type: "refresh_token",
        };
        let out = match serde_json::to_value(&req) {
            Ok(v) => v,
            Err(e) => panic!("{:?}", e),
        };
        assert_eq!(out["clientId"], "cid");
        assert_eq!(out["grantType"], "refresh_token");
    }

    #[test]
    fn test_refresh_response_optional_fields() {
        let data: RefreshResponse =
            match serde_json::from_str(r#"{"accessToken":"at","expiresIn":3600}"#) {
                Ok(v) => v,
                Err(e) => panic!("{:?}", e),
            };
        assert_eq!(data.access_token, "at");
        assert!(data.refresh_token.is_none());
        assert_eq!(data.expires_in, Some(3600));
    }
}
