//! 携带 SSO Bearer 的设备码登录
//!
//! 拿着现成的 `x-amz-sso_authn` Bearer，走设备授权流程并替用户
//! 自动确认，免去交互式同意页：
//! 注册设备码客户端 → 发起设备授权 → 验证 Bearer → 换设备会话 →
//! 接受 userCode →（如有 deviceContext）关联 → 轮询取 Token。

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{oidc_base, region_or_default, SCOPES};
use crate::error::{Error, Result};
use crate::http_client;

/// SSO Portal 基址
const PORTAL_BASE: &str = "https://portal.sso.us-east-1.amazonaws.com";

/// 设备码客户端注册使用的 issuerUrl
const START_URL: &str = "https://view.awsapps.com/start";

/// 接受 userCode / 关联 Token 时要求的 Referer
const REFERER: &str = "https://view.awsapps.com/";

/// 设备码授权类型
const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// 轮询总预算
const POLL_BUDGET: Duration = Duration::from_secs(2 * 60);

/// 登录成功后的凭据材料
#[derive(Debug, Clone)]
pub struct SsoImportTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub client_id: String,
    pub client_secret: String,
    pub expires_in: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterDeviceClientRequest<'a> {
    client_name: &'a str,
    client_type: &'a str,
    scopes: &'a [&'a str],
    grant_types: &'a [&'a str],
    issuer_url: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterDeviceClientResponse {
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    client_secret: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceAuthRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    start_url: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceAuthResponse {
    #[serde(default)]
    device_code: String,
    #[serde(default)]
    user_code: String,
    #[serde(default)]
    interval: i64,
}

#[derive(Debug, Deserialize)]
struct DeviceSessionResponse {
    #[serde(default)]
    token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AcceptUserCodeRequest<'a> {
    user_code: &'a str,
    user_session_id: &'a str,
}

/// 设备上下文（accept_user_code 可能返回 null）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceContext {
    #[serde(default)]
    pub device_context_id: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AcceptUserCodeResponse {
    #[serde(default)]
    device_context: Option<DeviceContext>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AssociateTokenRequest<'a> {
    device_context: &'a DeviceContext,
    user_session_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceTokenRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    grant_type: &'a str,
    device_code: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceTokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    refresh_token: String,
    #[serde(default)]
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct DeviceTokenError {
    #[serde(default)]
    error: String,
}

/// 从 SSO Bearer Token 导入账号
pub async fn import_from_sso_token(bearer_token: &str, region: &str) -> Result<SsoImportTokens> {
    let region = region_or_default(region);
    let oidc = oidc_base(region);
    let client = http_client::auth_client()?;

    let (client_id, client_secret) = register_device_client(&client, &oidc).await?;

    let device_auth = start_device_auth(&client, &oidc, &client_id, &client_secret).await?;
    let interval = normalize_interval(device_auth.interval);

    verify_bearer_token(&client, bearer_token).await?;

    let device_session_token = get_device_session_token(&client, bearer_token).await?;

    let device_context =
        accept_user_code(&client, &oidc, &device_auth.user_code, &device_session_token).await?;

    if let Some(ctx) = &device_context {
        associate_token(&client, &oidc, ctx, &device_session_token).await?;
    }

    let tokens = poll_for_token(
        &client,
        &oidc,
        &client_id,
        &client_secret,
        &device_auth.device_code,
        interval,
    )
    .await?;

    tracing::info!(region, "设备码登录完成");

    Ok(SsoImportTokens {
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token,
        client_id,
        client_secret,
        expires_in: tokens.expires_in,
    })
}

/// interval 为 0 时按 1 秒处理
fn normalize_interval(interval: i64) -> u64 {
    if interval <= 0 {
        1
    } else {
        interval as u64
    }
}

async fn read_failure(response: reqwest::Response) -> Error {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Error::HttpStatus { status, body }
}

async fn register_device_client(client: &Client, oidc: &str) -> Result<(String, String)> {
    let body = RegisterDeviceClientRequest {
        client_name: "Kiro Relay",
        client_type: "public",
        scopes: &SCOPES,
        grant_types: &[DEVICE_CODE_GRANT, "refresh_token"],
        issuer_url: START_URL,
    };

    let response = client
        .post(format!("{}/client/register", oidc))
        .json(&body)
        .send()
        .await
        .map_err(Error::network)?;

    if response.status().as_u16() != 200 {
        return Err(read_failure(response).await);
    }

    let data: RegisterDeviceClientResponse = response
        .json()
        .await
        .map_err(|e| Error::Decode(format!("解析设备客户端注册响应失败: {}", e)))?;
    Ok((data.client_id, data.client_secret))
}

async fn start_device_auth(
    client: &Client,
    oidc: &str,
    client_id: &str,
    client_secret: &str,
) -> Result<DeviceAuthResponse> {
    let body = DeviceAuthRequest {
        client_id,
        client_secret,
        start_url: START_URL,
    };

    let response = client
        .post(format!("{}/device_authorization", oidc))
        .json(&body)
        .send()
        .await
        .map_err(Error::network)?;

    if response.status().as_u16() != 200 {
        return Err(read_failure(response).await);
    }

    response
        .json()
        .await
        .map_err(|e| Error::Decode(format!("解析设备授权响应失败: {}", e)))
}

async fn verify_bearer_token(client: &Client, bearer_token: &str) -> Result<()> {
    let response = client
        .get(format!("{}/token/whoAmI", PORTAL_BASE))
        .header("Authorization", format!("Bearer {}", bearer_token))
        .header("Accept", "application/json")
        .send()
        .await
        .map_err(Error::network)?;

    let status = response.status().as_u16();
    if status != 200 {
        return Err(Error::from_status(
            status,
            response.text().await.unwrap_or_default(),
            "whoAmI",
        ));
    }
    Ok(())
}

async fn get_device_session_token(client: &Client, bearer_token: &str) -> Result<String> {
    let response = client
        .post(format!("{}/session/device", PORTAL_BASE))
        .header("Authorization", format!("Bearer {}", bearer_token))
        .header("Content-Type", "application/json")
        .body("{}")
        .send()
        .await
        .map_err(Error::network)?;

    if response.status().as_u16() != 200 {
        return Err(read_failure(response).await);
    }

    let data: DeviceSessionResponse = response
        .json()
        .await
        .map_err(|e| Error::Decode(format!("解析设备会话响应失败: {}", e)))?;
    Ok(data.token)
}

async fn accept_user_code(
    client: &Client,
    oidc: &str,
    user_code: &str,
    device_session_token: &str,
) -> Result<Option<DeviceContext>> {
    let body = AcceptUserCodeRequest {
        user_code,
        user_session_id: device_session_token,
    };

    let response = client
        .post(format!("{}/device_authorization/accept_user_code", oidc))
        .header("Referer", REFERER)
        .json(&body)
        .send()
        .await
        .map_err(Error::network)?;

    if response.status().as_u16() != 200 {
        return Err(read_failure(response).await);
    }

    let data: AcceptUserCodeResponse = response
        .json()
        .await
        .map_err(|e| Error::Decode(format!("解析接受用户码响应失败: {}", e)))?;
    Ok(data.device_context)
}

async fn associate_token(
    client: &Client,
    oidc: &str,
    device_context: &DeviceContext,
    device_session_token: &str,
) -> Result<()> {
    let body = AssociateTokenRequest {
        device_context,
        user_session_id: device_session_token,
    };

    let response = client
        .post(format!("{}/device_authorization/associate_token", oidc))
        .header("Referer", REFERER)
        .json(&body)
        .send()
        .await
        .map_err(Error::network)?;

    if response.status().as_u16() != 200 {
        return Err(read_failure(response).await);
    }
    Ok(())
}

/// 轮询取 Token
///
/// `authorization_pending` 静默继续；`slow_down` 把间隔加 5 秒；
/// 其他 400 错误码直接失败；非 200/400 响应容忍并继续。
/// 总预算 2 分钟，独立于单次请求超时。
async fn poll_for_token(
    client: &Client,
    oidc: &str,
    client_id: &str,
    client_secret: &str,
    device_code: &str,
    mut interval: u64,
) -> Result<DeviceTokenResponse> {
    let body = DeviceTokenRequest {
        client_id,
        client_secret,
        grant_type: DEVICE_CODE_GRANT,
        device_code,
    };

    let deadline = tokio::time::Instant::now() + POLL_BUDGET;

    loop {
        tokio::time::sleep(Duration::from_secs(interval)).await;
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::PollTimeout);
        }

        let response = match client
            .post(format!("{}/token", oidc))
            .json(&body)
            .send()
            .await
        {
            Ok(resp) => resp,
            // 网络抖动：继续轮询
            Err(_) => continue,
        };

        match response.status().as_u16() {
            200 => {
                return response
                    .json()
                    .await
                    .map_err(|e| Error::Decode(format!("解析 Token 响应失败: {}", e)));
            }
            400 => {
                let err: DeviceTokenError = response.json().await.unwrap_or(DeviceTokenError {
                    error: String::new(),
                });
                match err.error.as_str() {
                    "authorization_pending" => continue,
                    "slow_down" => {
                        interval += 5;
                        continue;
                    }
                    code => {
                        return Err(Error::DeviceError {
                            code: code.to_string(),
                        })
                    }
                }
            }
            // 其他状态容忍，继续轮询
            _ => continue,
        }
    }
}
