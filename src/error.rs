//! 同步错误分类

use thiserror::Error;

/// 同步过程中的致命错误
///
/// 单个文件/对象的问题不会走到这里：列举阶段的跳过记录为 `Listed::Skipped`，
/// 任务失败记录在 `RunResult::failed` 中。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// 配置错误或互相矛盾的参数
    #[error("参数错误 (usage error): {0}")]
    Usage(String),

    /// 源端无法列举（根路径不存在、列表请求失败等）
    #[error("列举失败 (enumeration error): {0}")]
    Enumeration(String),

    /// 目标端不可用
    #[error("目标不可用 (destination error): {0}")]
    Destination(String),

    #[error("同步已取消")]
    Cancelled,
}

impl SyncError {
    pub fn usage(msg: impl Into<String>) -> Self {
        SyncError::Usage(msg.into())
    }

    pub fn enumeration(msg: impl Into<String>) -> Self {
        SyncError::Enumeration(msg.into())
    }

    /// 是否属于参数/配置类错误
    pub fn is_usage(&self) -> bool {
        matches!(self, SyncError::Usage(_) | SyncError::Destination(_))
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
