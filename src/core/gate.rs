//! 冷存储门控：在任务进入执行队列前拦截需要读取冷存储对象的任务

use crate::core::entry::SkipReason;
use crate::core::task::Task;
use tracing::debug;

/// 冷存储对象的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColdStoragePolicy {
    /// 跳过并警告
    #[default]
    Warn,
    /// 照常传输
    Force,
    /// 静默跳过
    Suppress,
}

impl ColdStoragePolicy {
    /// 同时指定时 force 优先
    pub fn from_flags(force: bool, suppress: bool) -> Self {
        match (force, suppress) {
            (true, _) => ColdStoragePolicy::Force,
            (false, true) => ColdStoragePolicy::Suppress,
            (false, false) => ColdStoragePolicy::Warn,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Proceed(Task),
    Drop {
        location: String,
        reason: SkipReason,
        warning: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StorageClassGate {
    policy: ColdStoragePolicy,
}

impl StorageClassGate {
    pub fn new(policy: ColdStoragePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ColdStoragePolicy {
        self.policy
    }

    pub fn evaluate(&self, task: Task) -> GateDecision {
        let class = match task.storage_class {
            Some(class) if class.is_cold() && task.kind.reads_remote_source() => class,
            _ => return GateDecision::Proceed(task),
        };

        match self.policy {
            ColdStoragePolicy::Force => GateDecision::Proceed(task),
            ColdStoragePolicy::Suppress => {
                debug!("静默跳过冷存储对象: {}", task.location);
                GateDecision::Drop {
                    location: task.location,
                    reason: SkipReason::ColdStorage(class),
                    warning: None,
                }
            }
            ColdStoragePolicy::Warn => {
                let object = task
                    .source
                    .as_ref()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| task.location.clone());
                let warning = format!(
                    "跳过文件 {}：对象存储类型为 {}，读取前需要先恢复。\
                     可使用 force_cold_transfer 强制传输，或 suppress_cold_warnings 关闭此警告",
                    object, class
                );
                GateDecision::Drop {
                    location: task.location,
                    reason: SkipReason::ColdStorage(class),
                    warning: Some(warning),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::entry::{Entry, StorageClass};
    use crate::core::properties::Properties;
    use crate::core::task::{Endpoint, TaskKind};
    use crate::storage::ObjectLocation;
    use std::path::PathBuf;

    fn download(class: StorageClass) -> Task {
        let entry = Entry::remote("foo.txt", 3, None, Some(class));
        Task::transfer(
            TaskKind::Download,
            &entry,
            Endpoint::Remote(ObjectLocation::new("bucket", "foo.txt")),
            Endpoint::Local(PathBuf::from("/tmp/foo.txt")),
            Properties::default(),
        )
    }

    #[test]
    fn test_policy_from_flags() {
        assert_eq!(ColdStoragePolicy::from_flags(false, false), ColdStoragePolicy::Warn);
        assert_eq!(ColdStoragePolicy::from_flags(true, false), ColdStoragePolicy::Force);
        assert_eq!(ColdStoragePolicy::from_flags(false, true), ColdStoragePolicy::Suppress);
        assert_eq!(ColdStoragePolicy::from_flags(true, true), ColdStoragePolicy::Force);
    }

    #[test]
    fn test_warn_names_class_and_object() {
        let gate = StorageClassGate::new(ColdStoragePolicy::Warn);
        match gate.evaluate(download(StorageClass::Glacier)) {
            GateDecision::Drop {
                reason, warning, ..
            } => {
                assert_eq!(reason, SkipReason::ColdStorage(StorageClass::Glacier));
                let warning = warning.unwrap();
                assert!(warning.contains("GLACIER"));
                assert!(warning.contains("s3://bucket/foo.txt"));
            }
            other => panic!("unexpected decision: {:?}", other),
        }
    }

    #[test]
    fn test_suppress_drops_without_warning() {
        let gate = StorageClassGate::new(ColdStoragePolicy::Suppress);
        assert!(matches!(
            gate.evaluate(download(StorageClass::DeepArchive)),
            GateDecision::Drop { warning: None, .. }
        ));
    }

    #[test]
    fn test_force_and_warm_classes_proceed() {
        let gate = StorageClassGate::new(ColdStoragePolicy::Force);
        assert!(matches!(
            gate.evaluate(download(StorageClass::Glacier)),
            GateDecision::Proceed(_)
        ));

        let gate = StorageClassGate::new(ColdStoragePolicy::Warn);
        assert!(matches!(
            gate.evaluate(download(StorageClass::GlacierIr)),
            GateDecision::Proceed(_)
        ));
    }

    #[test]
    fn test_delete_is_never_gated() {
        let gate = StorageClassGate::new(ColdStoragePolicy::Warn);
        let mut task = Task::delete(
            "foo.txt",
            Endpoint::Remote(ObjectLocation::new("bucket", "foo.txt")),
        );
        task.storage_class = Some(StorageClass::Glacier);
        assert!(matches!(gate.evaluate(task), GateDecision::Proceed(_)));
    }
}
