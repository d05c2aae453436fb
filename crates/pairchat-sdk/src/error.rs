use std::fmt;

#[derive(Debug)]
pub enum PairchatSDKError {
    JsonError(String),
    InvalidArgument(String),
    NotFound(String),
    AlreadyExists(String),
    PermissionDenied(String),
    KvStore(String),
    Serialization(String),
    IO(String),
    Transport(String),
    SendFailed(String),
    InvalidData(String),
    Config(String),
    NotInitialized(String),
    ShuttingDown(String),
    Timeout(String),
    Other(String),
}

impl fmt::Display for PairchatSDKError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairchatSDKError::JsonError(e) => write!(f, "JSON error: {}", e),
            PairchatSDKError::InvalidArgument(e) => write!(f, "Invalid argument: {}", e),
            PairchatSDKError::NotFound(e) => write!(f, "Not found: {}", e),
            PairchatSDKError::AlreadyExists(e) => write!(f, "Already exists: {}", e),
            PairchatSDKError::PermissionDenied(e) => write!(f, "Permission denied: {}", e),
            PairchatSDKError::KvStore(e) => write!(f, "KV store error: {}", e),
            PairchatSDKError::Serialization(e) => write!(f, "Serialization error: {}", e),
            PairchatSDKError::IO(e) => write!(f, "IO error: {}", e),
            PairchatSDKError::Transport(e) => write!(f, "Transport error: {}", e),
            PairchatSDKError::SendFailed(e) => write!(f, "Send failed: {}", e),
            PairchatSDKError::InvalidData(e) => write!(f, "Invalid data: {}", e),
            PairchatSDKError::Config(e) => write!(f, "Config error: {}", e),
            PairchatSDKError::NotInitialized(e) => write!(f, "Not initialized: {}", e),
            PairchatSDKError::ShuttingDown(e) => write!(f, "Shutting down: {}", e),
            PairchatSDKError::Timeout(e) => write!(f, "Timeout: {}", e),
            PairchatSDKError::Other(e) => write!(f, "Other error: {}", e),
        }
    }
}

impl std::error::Error for PairchatSDKError {}

impl From<serde_json::Error> for PairchatSDKError {
    fn from(error: serde_json::Error) -> Self {
        PairchatSDKError::JsonError(error.to_string())
    }
}

impl From<std::io::Error> for PairchatSDKError {
    fn from(error: std::io::Error) -> Self {
        PairchatSDKError::IO(error.to_string())
    }
}

impl PairchatSDKError {
    /// 判断是否是"视为不存在"的读取错误
    ///
    /// 房间解析时，权限类/未找到类错误都按"房间不存在"处理，
    /// 继续走创建流程，而不是作为致命错误抛出。
    pub fn is_treated_as_absent(&self) -> bool {
        matches!(
            self,
            PairchatSDKError::NotFound(_) | PairchatSDKError::PermissionDenied(_)
        )
    }

    /// 判断是否是"已存在"错误（创建竞态时视为成功）
    pub fn is_already_exists(&self) -> bool {
        matches!(self, PairchatSDKError::AlreadyExists(_))
    }
}

pub type Result<T> = std::result::Result<T, PairchatSDKError>;
