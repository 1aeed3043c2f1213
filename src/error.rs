//! 错误类型定义
//!
//! 上游调用、账号池与登录流程共用一套错误枚举，
//! 调用方依赖错误种类决定恢复策略（换端点 / 直接失败 / 继续轮询）。

/// kiro-relay 统一错误类型
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// 网络层错误（连接失败、超时、流读取中断等）
    #[error("网络错误: {0}")]
    Network(String),

    /// 上游返回的非 2xx 状态（不属于下列特殊分类的）
    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// 401/403：凭据或权限问题，不再尝试其他端点
    #[error("认证失败 (HTTP {status}): {body}")]
    AuthFatal { status: u16, body: String },

    /// 429：当前端点额度耗尽，允许切换端点
    #[error("端点 {endpoint} 额度耗尽 (429)")]
    QuotaExhausted { endpoint: String },

    /// 事件流帧格式错误（流中途截断等，无法继续解码）
    #[error("事件流格式错误: {0}")]
    Protocol(String),

    /// PKCE 登录会话不存在或已过期
    #[error("登录会话不存在或已过期")]
    SessionInvalid,

    /// 回调 state 与会话不一致（CSRF 防护）
    #[error("state 不匹配，可能存在安全风险")]
    StateMismatch,

    /// 授权回调带回了 error 参数（用户拒绝等）
    #[error("授权回调失败: {code}")]
    CallbackError { code: String },

    /// 设备码轮询超出时间预算
    #[error("设备授权轮询超时")]
    PollTimeout,

    /// 设备码轮询返回了 pending/slow_down 之外的错误码
    #[error("设备授权错误: {code}")]
    DeviceError { code: String },

    /// Token 即将过期（选号时静默过滤，不对外报错）
    #[error("Token 即将过期")]
    TokenExpiringSoon,

    /// 响应体解析失败（JSON 反序列化等）
    #[error("响应解析失败: {0}")]
    Decode(String),

    /// 其他不可恢复错误（入参缺失、URL 无效等）
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// 把 reqwest 错误归类为网络错误
    pub(crate) fn network(e: reqwest::Error) -> Self {
        Error::Network(e.to_string())
    }

    /// 按状态码归类一个失败响应
    ///
    /// 401/403 视为认证失败，429 视为额度耗尽，其余归入 HttpStatus。
    pub(crate) fn from_status(status: u16, body: String, endpoint: &str) -> Self {
        match status {
            401 | 403 => Error::AuthFatal { status, body },
            429 => Error::QuotaExhausted {
                endpoint: endpoint.to_string(),
            },
            _ => Error::HttpStatus { status, body },
        }
    }

    /// 是否为额度类错误（账号池据此决定 1 小时冷却）
    pub fn is_quota(&self) -> bool {
        matches!(self, Error::QuotaExhausted { .. })
    }

    /// 是否为认证类错误（不做端点回退）
    pub fn is_auth_fatal(&self) -> bool {
        matches!(self, Error::AuthFatal { .. })
    }
}

/// kiro-relay 统一 Result 别名
pub type Result<T> = std::result::Result<T, Error>;
