//! IAM SSO（PKCE 授权码）登录流程
//!
//! 两次调用完成一次登录：
//! 1. `start`：注册 OIDC 客户端、生成 PKCE 材料、返回授权 URL
//! 2. `complete`：用回调里的授权码换 Token
//!
//! 进行中的会话保存在内存里，10 分钟过期；会话一次性使用，
//! 成功或 state / 过期失败都会销毁。每次 `start` 顺带异步清理过期会话。

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;
use uuid::Uuid;

use super::{oidc_base, region_or_default, SCOPES};
use crate::error::{Error, Result};
use crate::http_client;

/// 回调固定指向本机
const REDIRECT_URI: &str = "http://127.0.0.1/oauth/callback";

/// 会话有效期
const SESSION_TTL_SECS: i64 = 600;

/// 进行中的登录会话
#[derive(Debug, Clone)]
struct IamSsoSession {
    client_id: String,
    client_secret: String,
    code_verifier: String,
    state: String,
    region: String,
    redirect_uri: String,
    expires_at: DateTime<Utc>,
}

/// `start` 的返回值
#[derive(Debug, Clone)]
pub struct StartLoginResponse {
    pub session_id: String,
    pub authorize_url: String,
    /// 会话有效期（秒）
    pub expires_in: i64,
}

/// `complete` 的返回值：新账号所需的全部凭据材料
#[derive(Debug, Clone)]
pub struct IamSsoTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub client_id: String,
    pub client_secret: String,
    pub region: String,
    pub expires_in: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterClientRequest<'a> {
    client_name: &'a str,
    client_type: &'a str,
    scopes: &'a [&'a str],
    grant_types: &'a [&'a str],
    redirect_uris: &'a [&'a str],
    issuer_url: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterClientResponse {
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    client_secret: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTokenRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    grant_type: &'a str,
    redirect_uri: &'a str,
    code: &'a str,
    code_verifier: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    refresh_token: String,
    #[serde(default)]
    expires_in: i64,
}

/// PKCE 登录管理器（持有会话表）
#[derive(Debug, Default)]
pub struct IamSsoLogin {
    sessions: Arc<RwLock<HashMap<String, IamSsoSession>>>,
}

impl IamSsoLogin {
    pub fn new() -> Self {
        Self::default()
    }

    /// 发起登录：注册客户端、生成 PKCE 材料、保存会话
    ///
    /// 返回会话 ID、授权 URL 与会话有效期（秒）。
    pub async fn start(&self, start_url: &str, region: &str) -> Result<StartLoginResponse> {
        let region = region_or_default(region);
        let oidc = oidc_base(region);

        let (client_id, client_secret) =
            register_oidc_client(&oidc, start_url, REDIRECT_URI).await?;

        let code_verifier = generate_code_verifier();
        let code_challenge = generate_code_challenge(&code_verifier);
        let state = Uuid::new_v4().to_string();

        let authorize_url = build_authorize_url(&oidc, &client_id, &state, &code_challenge)?;

        let session_id = Uuid::new_v4().to_string();
        let session = IamSsoSession {
            client_id,
            client_secret,
            code_verifier,
            state,
            region: region.to_string(),
            redirect_uri: REDIRECT_URI.to_string(),
            expires_at: Utc::now() + Duration::seconds(SESSION_TTL_SECS),
        };

        self.sessions.write().insert(session_id.clone(), session);

        // 顺带异步清理过期会话
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            sweep_expired(&sessions);
        });

        tracing::info!(region, "IAM SSO 登录会话已创建");

        Ok(StartLoginResponse {
            session_id,
            authorize_url,
            expires_in: SESSION_TTL_SECS,
        })
    }

    /// 完成登录：校验回调、换取 Token、销毁会话
    pub async fn complete(&self, session_id: &str, callback_url: &str) -> Result<IamSsoTokens> {
        let session = {
            let sessions = self.sessions.read();
            sessions.get(session_id).cloned()
        };
        let Some(session) = session else {
            return Err(Error::SessionInvalid);
        };

        if Utc::now() > session.expires_at {
            self.sessions.write().remove(session_id);
            return Err(Error::SessionInvalid);
        }

        let parsed = Url::parse(callback_url)
            .map_err(|e| Error::Other(format!("无效的回调 URL: {}", e)))?;
        let query: HashMap<String, String> = parsed
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        if let Some(code) = query.get("error") {
            return Err(Error::CallbackError { code: code.clone() });
        }

        // state 防 CSRF：不一致时连会话一起销毁
        if query.get("state").map(String::as_str) != Some(session.state.as_str()) {
            self.sessions.write().remove(session_id);
            return Err(Error::StateMismatch);
        }

        let code = query.get("code").filter(|c| !c.is_empty());
        let Some(code) = code else {
            return Err(Error::Other("回调缺少授权码".to_string()));
        };

        let oidc = oidc_base(&session.region);
        let tokens = exchange_token(&oidc, &session, code).await?;

        self.sessions.write().remove(session_id);

        Ok(IamSsoTokens {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            client_id: session.client_id,
            client_secret: session.client_secret,
            region: session.region,
            expires_in: tokens.expires_in,
        })
    }

    /// 当前会话数
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }
}

/// 清理所有过期会话
fn sweep_expired(sessions: &RwLock<HashMap<String, IamSsoSession>>) {
    let now = Utc::now();
    let mut sessions = sessions.write();
    sessions.retain(|_, s| s.expires_at > now);
}

async fn register_oidc_client(
    oidc: &str,
    start_url: &str,
    redirect_uri: &str,
) -> Result<(String, String)> {
    let body = RegisterClientRequest {
        client_name: "Kiro",
        client_type: "public",
        scopes: &SCOPES,
        grant_types: &["authorization_code", "refresh_token"],
        redirect_uris: &[redirect_uri],
        issuer_url: start_url,
    };

    let client = http_client::auth_client()?;
    let response = client
        .post(format!("{}/client/register", oidc))
        .json(&body)
        .send()
        .await
        .map_err(Error::network)?;

    let status = response.status().as_u16();
    if status != 200 {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::HttpStatus { status, body });
    }

    let data: RegisterClientResponse = response
        .json()
        .await
        .map_err(|e| Error::Decode(format!("解析客户端注册响应失败: {}", e)))?;

    Ok((data.client_id, data.client_secret))
}

async fn exchange_token(
    oidc: &str,
    session: &IamSsoSession,
    code: &str,
) -> Result<CreateTokenResponse> {
    let body = CreateTokenRequest {
        client_id: &session.client_id,
        client_secret: &session.client_secret,
        grant_type: "authorization_code",
        redirect_uri: &session.redirect_uri,
        code,
        code_verifier: &session.code_verifier,
    };

    let client = http_client::auth_client()?;
    let response = client
        .post(format!("{}/token", oidc))
        .json(&body)
        .send()
        .await
        .map_err(Error::network)?;

    let status = response.status().as_u16();
    if status != 200 {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::HttpStatus { status, body });
    }

    response
        .json()
        .await
        .map_err(|e| Error::Decode(format!("解析 Token 响应失败: {}", e)))
}

/// 生成 PKCE code_verifier：32 随机字节 → base64url（无填充）
fn generate_code_verifier() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// code_challenge = base64url(sha256(verifier))
fn generate_code_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

fn build_authorize_url(
    oidc: &str,
    client_id: &str,
    state: &str,
    code_challenge: &str,
) -> Result<String> {
    let mut url = Url::parse(&format!("{}/authorize", oidc))
        .map_err(|e| Error::Other(format!("构建授权 URL 失败: {}", e)))?;

    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", client_id)
        .append_pair("redirect_uri", REDIRECT_URI)
        .append_pair("scopes", &SCOPES.join(","))
        .append_pair("state", state)
        .append_pair("code_challenge", code_challenge)
        .append_pair("code_challenge_method", "S256");

    Ok(url.to_string())
}
