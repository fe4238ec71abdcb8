//! 结果汇总与退出分类

use crate::core::entry::SkipReason;
use crate::core::task::Task;
use crate::error::SyncError;
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

/// 运行结果分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitClass {
    Success,
    /// 有任务失败或有警告
    CompletedWithWarnings,
    UsageError,
    FatalError,
}

impl ExitClass {
    /// 进程退出码
    pub fn exit_code(&self) -> i32 {
        match self {
            ExitClass::Success => 0,
            ExitClass::CompletedWithWarnings => 2,
            ExitClass::UsageError => 252,
            ExitClass::FatalError => 255,
        }
    }
}

/// 单个任务的结局
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded { bytes: u64 },
    Skipped(SkipReason),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedItem {
    pub location: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedItem {
    pub location: String,
    pub message: String,
}

/// 同步报告
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    pub tasks_planned: usize,
    pub succeeded_count: usize,
    pub skipped: Vec<SkippedItem>,
    pub failed: Vec<FailedItem>,
    /// 按产生顺序排列
    pub warnings: Vec<String>,
    pub bytes_transferred: u64,
    pub fatal: Option<SyncError>,
}

impl RunResult {
    pub fn exit_class(&self) -> ExitClass {
        match &self.fatal {
            Some(e) if e.is_usage() => ExitClass::UsageError,
            Some(_) => ExitClass::FatalError,
            None if !self.failed.is_empty() || !self.warnings.is_empty() => {
                ExitClass::CompletedWithWarnings
            }
            None => ExitClass::Success,
        }
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    /// 直接以致命错误结束的结果
    pub fn from_fatal(error: SyncError) -> Self {
        Self {
            fatal: Some(error),
            ..Default::default()
        }
    }
}

/// 运行期间共享的结果收集器
#[derive(Debug, Default)]
pub struct ResultCollector {
    inner: Mutex<RunResult>,
}

impl ResultCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RunResult> {
        // 持锁期间不会 panic，中毒时继续使用内部数据
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        warn!("{}", message);
        self.lock().warnings.push(message);
    }

    pub fn skip(&self, location: impl Into<String>, reason: SkipReason) {
        self.lock().skipped.push(SkippedItem {
            location: location.into(),
            reason,
        });
    }

    pub fn task_planned(&self) {
        self.lock().tasks_planned += 1;
    }

    pub fn record_outcome(&self, task: &Task, outcome: &TaskOutcome) {
        let mut result = self.lock();
        match outcome {
            TaskOutcome::Succeeded { bytes } => {
                result.succeeded_count += 1;
                result.bytes_transferred += bytes;
            }
            TaskOutcome::Skipped(reason) => result.skipped.push(SkippedItem {
                location: task.location.clone(),
                reason: reason.clone(),
            }),
            TaskOutcome::Failed(message) => result.failed.push(FailedItem {
                location: task.location.clone(),
                message: message.clone(),
            }),
        }
    }

    /// 只保留第一个致命错误
    pub fn set_fatal(&self, error: SyncError) {
        let mut result = self.lock();
        if result.fatal.is_none() {
            result.fatal = Some(error);
        }
    }

    pub fn finish(&self) -> RunResult {
        std::mem::take(&mut *self.lock())
    }
}

/// 任务完成时被同步调用
pub trait TaskObserver: Send + Sync {
    fn on_task_complete(&self, task: &Task, outcome: &TaskOutcome);
}

/// 一行任务描述，例如 `upload: a.txt to s3://bucket/a.txt`
pub fn describe_outcome(task: &Task, outcome: &TaskOutcome) -> String {
    match outcome {
        TaskOutcome::Succeeded { .. } => task.describe(),
        TaskOutcome::Skipped(SkipReason::DryRun) => format!("(dryrun) {}", task.describe()),
        TaskOutcome::Skipped(reason) => format!("skip {}: {}", task.location, reason),
        TaskOutcome::Failed(message) => format!("{} failed: {}", task.describe(), message),
    }
}

/// 通过 tracing 输出任务结果
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl TaskObserver for TracingObserver {
    fn on_task_complete(&self, task: &Task, outcome: &TaskOutcome) {
        let line = describe_outcome(task, outcome);
        match outcome {
            TaskOutcome::Failed(_) => warn!("{}", line),
            _ => info!("{}", line),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::entry::Entry;
    use crate::core::properties::Properties;
    use crate::core::task::{Endpoint, TaskKind};
    use crate::storage::ObjectLocation;
    use std::path::PathBuf;

    fn upload_task() -> Task {
        Task::transfer(
            TaskKind::Upload,
            &Entry::local("a.txt", 3, None),
            Endpoint::Local(PathBuf::from("/src/a.txt")),
            Endpoint::Remote(ObjectLocation::new("bucket", "a.txt")),
            Properties::default(),
        )
    }

    #[test]
    fn test_exit_class() {
        let mut result = RunResult::default();
        assert_eq!(result.exit_class(), ExitClass::Success);

        result.warnings.push("w".to_string());
        assert_eq!(result.exit_class(), ExitClass::CompletedWithWarnings);
        assert_eq!(result.exit_class().exit_code(), 2);

        result.fatal = Some(SyncError::usage("bad"));
        assert_eq!(result.exit_class(), ExitClass::UsageError);

        let result = RunResult::from_fatal(SyncError::enumeration("gone"));
        assert_eq!(result.exit_class(), ExitClass::FatalError);
        assert_eq!(result.exit_class().exit_code(), 255);
    }

    #[test]
    fn test_skips_alone_do_not_warn() {
        let collector = ResultCollector::new();
        collector.skip("a", SkipReason::DryRun);
        let result = collector.finish();
        assert_eq!(result.skipped_count(), 1);
        assert_eq!(result.exit_class(), ExitClass::Success);
    }

    #[test]
    fn test_collector_records_outcomes() {
        let collector = ResultCollector::new();
        let task = upload_task();
        collector.task_planned();
        collector.record_outcome(&task, &TaskOutcome::Succeeded { bytes: 3 });
        collector.record_outcome(&task, &TaskOutcome::Failed("boom".to_string()));
        collector.set_fatal(SyncError::enumeration("first"));
        collector.set_fatal(SyncError::usage("second"));

        let result = collector.finish();
        assert_eq!(result.tasks_planned, 1);
        assert_eq!(result.succeeded_count, 1);
        assert_eq!(result.bytes_transferred, 3);
        assert_eq!(result.failed_count(), 1);
        assert_eq!(result.fatal, Some(SyncError::enumeration("first")));
    }

    #[test]
    fn test_describe_outcome() {
        let task = upload_task();
        assert_eq!(
            describe_outcome(&task, &TaskOutcome::Skipped(SkipReason::DryRun)),
            "(dryrun) upload: /src/a.txt to s3://bucket/a.txt"
        );
        assert_eq!(
            describe_outcome(&task, &TaskOutcome::Failed("denied".to_string())),
            "upload: /src/a.txt to s3://bucket/a.txt failed: denied"
        );
    }
}
