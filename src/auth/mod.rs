//! 登录与凭据获取流程
//!
//! - `iam_sso`：PKCE 授权码登录（两次调用 + 内存会话）
//! - `sso_token`：携带 SSO Bearer 的设备码登录（免交互确认）
//! - `user_info`：用 accessToken 探测账号身份
//! - `refresh`：用 refreshToken 续期访问 Token

pub mod iam_sso;
pub mod refresh;
pub mod sso_token;
pub mod user_info;

/// OIDC 注册使用的权限范围
pub(crate) const SCOPES: [&str; 5] = [
    "codewhisperer:completions",
    "codewhisperer:analysis",
    "codewhisperer:conversations",
    "codewhisperer:transformations",
    "codewhisperer:taskassist",
];

/// 未指定 region 时的默认值
pub(crate) const DEFAULT_REGION: &str = "us-east-1";

/// OIDC 服务基址
pub(crate) fn oidc_base(region: &str) -> String {
    format!("https://oidc.{}.amazonaws.com", region)
}

/// region 为空时回退默认值
pub(crate) fn region_or_default(region: &str) -> &str {
    if region.is_empty() {
        DEFAULT_REGION
    } else {
        region
    }
}
