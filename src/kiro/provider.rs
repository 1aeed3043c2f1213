//! Kiro API 调用编排
//!
//! 核心组件，负责与上游助手 API 通信：
//! - 按配置排序双端点，429 / 瞬态错误自动回退到备用端点
//! - 401/403 视为凭据问题，立即返回，不做回退
//! - 200 时交给事件流解码器，回调按帧序触发

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use uuid::Uuid;

use crate::config::{Account, SharedConfigStore};
use crate::error::{Error, Result};
use crate::http_client;
use crate::kiro::endpoints::{sorted_endpoints, KiroEndpoint};
use crate::kiro::model::request::KiroPayload;
use crate::kiro::stream::{process_event_stream, StreamCallbacks};

/// 模拟的 Kiro IDE 版本号（User-Agent 用）
const KIRO_VERSION: &str = "0.6.18";

/// Kiro API Provider
pub struct KiroProvider {
    store: SharedConfigStore,
    stream_client: Client,
}

impl KiroProvider {
    /// 创建 Provider（流式客户端为进程级共享实例）
    pub fn new(store: SharedConfigStore) -> Result<Self> {
        let stream_client = http_client::stream_client()?;
        Ok(Self {
            store,
            stream_client,
        })
    }

    /// 调用上游助手 API（流式）
    ///
    /// 按端点顺序尝试，流正常结束返回 Ok，否则返回最后一次观察到的错误。
    /// 调用方根据错误种类回报账号池（`is_quota` / 其他）。
    pub async fn call_kiro_api(
        &self,
        account: &Account,
        payload: &mut KiroPayload,
        callbacks: &mut dyn StreamCallbacks,
    ) -> Result<()> {
        let endpoints = sorted_endpoints(self.store.preferred_endpoint());
        self.call_with_endpoints(endpoints, account, payload, callbacks)
            .await
    }

    async fn call_with_endpoints(
        &self,
        endpoints: [&KiroEndpoint; 2],
        account: &Account,
        payload: &mut KiroPayload,
        callbacks: &mut dyn StreamCallbacks,
    ) -> Result<()> {
        let body = serde_json::to_string(payload)
            .map_err(|e| Error::Decode(format!("序列化请求体失败: {}", e)))?;

        // 预估输入 token（约 3 字符 = 1 token）
        let estimated_input_tokens = (body.len() as i64 / 3).max(1);

        let (user_agent, amz_user_agent) = build_user_agents(account.machine_id.as_deref());

        let mut last_err: Option<Error> = None;
        for ep in endpoints {
            // origin 随端点改写后重新序列化
            payload.set_origin(ep.origin);
            let body = serde_json::to_string(payload)
                .map_err(|e| Error::Decode(format!("序列化请求体失败: {}", e)))?;

            let headers = match build_headers(ep, &user_agent, &amz_user_agent, account) {
                Ok(h) => h,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };

            let response = match self
                .stream_client
                .post(ep.url)
                .headers(headers)
                .body(body)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    tracing::warn!(endpoint = ep.name, "上游请求发送失败: {}", e);
                    last_err = Some(Error::network(e));
                    continue;
                }
            };

            let status = response.status().as_u16();

            if status == 200 {
                return process_event_stream(response, callbacks, estimated_input_tokens).await;
            }

            if status == 429 {
                tracing::warn!(endpoint = ep.name, "端点额度耗尽 (429)，尝试下一个端点");
                last_err = Some(Error::QuotaExhausted {
                    endpoint: ep.name.to_string(),
                });
                continue;
            }

            let body_text = response.text().await.unwrap_or_default();

            // 认证错误不做端点回退
            if status == 401 || status == 403 {
                return Err(Error::AuthFatal {
                    status,
                    body: body_text,
                });
            }

            tracing::warn!(endpoint = ep.name, status, "上游请求失败: {}", body_text);
            last_err = Some(Error::HttpStatus {
                status,
                body: body_text,
            });
        }

        Err(last_err.unwrap_or_else(|| Error::Other("所有端点均失败".to_string())))
    }
}

/// 构建两种 User-Agent
///
/// 有 machineId 时拼在版本号后面。
fn build_user_agents(machine_id: Option<&str>) -> (String, String) {
    match machine_id {
        Some(mid) if !mid.is_empty() => (
            format!(
                "aws-sdk-js/1.0.18 ua/2.1 os/linux lang/js md/nodejs#20.16.0 api/codewhispererstreaming#1.0.18 m/E KiroIDE-{}-{}",
                KIRO_VERSION, mid
            ),
            format!("aws-sdk-js/1.0.18 KiroIDE {} {}", KIRO_VERSION, mid),
        ),
        _ => (
            format!(
                "aws-sdk-js/1.0.18 ua/2.1 os/linux lang/js md/nodejs#20.16.0 api/codewhispererstreaming#1.0.18 m/E KiroIDE-{}",
                KIRO_VERSION
            ),
            format!("aws-sdk-js/1.0.18 KiroIDE {}", KIRO_VERSION),
        ),
    }
}

fn header(s: &str, name: &'static str) -> Result<HeaderValue> {
    HeaderValue::from_str(s).map_err(|e| Error::Other(format!("{} header 无效: {}", name, e)))
}

fn build_headers(
    ep: &KiroEndpoint,
    user_agent: &str,
    amz_user_agent: &str,
    account: &Account,
) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();

    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    headers.insert("x-amz-target", HeaderValue::from_static(ep.amz_target));
    headers.insert(reqwest::header::USER_AGENT, header(user_agent, "user-agent")?);
    headers.insert("x-amz-user-agent", header(amz_user_agent, "x-amz-user-agent")?);
    headers.insert("x-amzn-kiro-agent-mode", HeaderValue::from_static("spec"));
    headers.insert(
        "x-amzn-codewhisperer-optout",
        HeaderValue::from_static("true"),
    );
    headers.insert("amz-sdk-request", HeaderValue::from_static("attempt=1; max=3"));
    headers.insert(
        "amz-sdk-invocation-id",
        header(&Uuid::new_v4().to_string(), "amz-sdk-invocation-id")?,
    );
    headers.insert(
        AUTHORIZATION,
        header(
            &format!("Bearer {}", account.access_token),
            "authorization",
        )?,
    );

    Ok(headers)
}
