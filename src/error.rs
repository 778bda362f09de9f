use std::time::Duration;

/// 连接关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// 正常关闭（本地请求断开或对端关闭）
    Normal,
    /// 超时（连接超时或空闲超时）
    Timeout,
    /// 错误
    Error(String),
    /// 被强制关闭（传输系统清理）
    Forced,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Normal => write!(f, "normal"),
            CloseReason::Timeout => write!(f, "timeout"),
            CloseReason::Error(reason) => write!(f, "error: {}", reason),
            CloseReason::Forced => write!(f, "forced"),
        }
    }
}

/// 统一传输错误类型
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum TransportError {
    /// 连接描述符格式错误
    #[error("Malformed descriptor '{input}': {reason}")]
    Descriptor {
        input: String,
        reason: String,
    },

    /// 未安装的传输系统
    #[error("Unknown transport system '{name}'")]
    UnknownSystem {
        name: String,
    },

    /// 传输系统重复安装
    #[error("Transport system '{name}' is already installed")]
    DuplicateSystem {
        name: String,
    },

    /// 传输系统不支持的连接类型
    #[error("Transport system '{system}' does not support '{kind}'")]
    Unsupported {
        system: String,
        kind: String,
    },

    /// 容量耗尽
    #[error("Capacity '{resource}' exceeded: current {current}, limit {limit}")]
    Capacity {
        resource: String,
        current: usize,
        limit: usize,
    },

    /// 连接相关错误
    #[error("Connection error: {reason} (retryable: {retryable})")]
    Connection {
        reason: String,
        retryable: bool,
    },

    /// 超时错误
    #[error("Operation '{operation}' timeout after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// 配置相关错误
    #[error("Configuration error in field '{field}': {reason}")]
    Configuration {
        field: String,
        reason: String,
    },
}

impl TransportError {
    /// 判断错误是否可重试
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Connection { retryable, .. } => *retryable,
            TransportError::Capacity { .. } => true,  // 等待容量释放
            TransportError::Timeout { .. } => true,
            TransportError::Descriptor { .. }
            | TransportError::UnknownSystem { .. }
            | TransportError::DuplicateSystem { .. }
            | TransportError::Unsupported { .. }
            | TransportError::Configuration { .. } => false,
        }
    }

    /// 获取错误代码
    pub fn error_code(&self) -> &'static str {
        match self {
            TransportError::Descriptor { .. } => "DESCRIPTOR_ERROR",
            TransportError::UnknownSystem { .. } => "UNKNOWN_SYSTEM",
            TransportError::DuplicateSystem { .. } => "DUPLICATE_SYSTEM",
            TransportError::Unsupported { .. } => "UNSUPPORTED",
            TransportError::Capacity { .. } => "CAPACITY_ERROR",
            TransportError::Connection { .. } => "CONNECTION_ERROR",
            TransportError::Timeout { .. } => "TIMEOUT_ERROR",
            TransportError::Configuration { .. } => "CONFIG_ERROR",
        }
    }
}

/// 便利构造函数
impl TransportError {
    /// 创建描述符错误
    pub fn descriptor_error(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Descriptor {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// 创建未知系统错误
    pub fn unknown_system(name: impl Into<String>) -> Self {
        Self::UnknownSystem { name: name.into() }
    }

    /// 创建不支持错误
    pub fn unsupported(system: impl Into<String>, kind: impl Into<String>) -> Self {
        Self::Unsupported {
            system: system.into(),
            kind: kind.into(),
        }
    }

    /// 创建容量错误
    pub fn capacity_error(resource: impl Into<String>, current: usize, limit: usize) -> Self {
        Self::Capacity {
            resource: resource.into(),
            current,
            limit,
        }
    }

    /// 创建连接错误
    pub fn connection_error(reason: impl Into<String>, retryable: bool) -> Self {
        Self::Connection {
            reason: reason.into(),
            retryable,
        }
    }

    /// 创建超时错误
    pub fn timeout_error(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// 创建配置错误
    pub fn config_error(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// 兼容性转换 - 从标准IO错误
impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        let retryable = matches!(
            error.kind(),
            std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::AddrInUse
        );

        TransportError::Connection {
            reason: format!("IO error: {}", error),
            retryable,
        }
    }
}
