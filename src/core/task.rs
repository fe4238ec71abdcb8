//! 同步任务模型

use crate::core::entry::{Entry, StorageClass};
use crate::core::properties::Properties;
use crate::storage::ObjectLocation;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// 同步方向（由源和目标的类型决定）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// 本地 -> 远程
    Upload,
    /// 远程 -> 本地
    Download,
    /// 远程 -> 远程
    BucketToBucket,
}

impl Direction {
    /// 该方向上源独有/较新的条目对应的任务类型
    pub fn transfer_kind(&self) -> TaskKind {
        match self {
            Direction::Upload => TaskKind::Upload,
            Direction::Download => TaskKind::Download,
            Direction::BucketToBucket => TaskKind::Copy,
        }
    }
}

/// 目标已一致时是否补发属性复制
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MetadataRefresh {
    #[default]
    Never,
    /// 总是重新复制属性
    Always,
    /// 先比较源和目标的属性，不同时才复制
    WhenDifferent,
}

/// 任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Upload,
    Download,
    Copy,
    Delete,
    /// 内容不变，只刷新属性的复制
    MetadataCopy,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Upload => "upload",
            TaskKind::Download => "download",
            TaskKind::Copy => "copy",
            TaskKind::Delete => "delete",
            TaskKind::MetadataCopy => "metadata-copy",
        }
    }

    /// 是否需要读取远程源对象
    pub fn reads_remote_source(&self) -> bool {
        matches!(
            self,
            TaskKind::Download | TaskKind::Copy | TaskKind::MetadataCopy
        )
    }

    /// 是否需要搬运对象内容（可能走分块）
    pub fn moves_content(&self) -> bool {
        matches!(
            self,
            TaskKind::Upload | TaskKind::Download | TaskKind::Copy | TaskKind::MetadataCopy
        )
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务的源或目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Local(PathBuf),
    Remote(ObjectLocation),
}

impl Endpoint {
    pub fn as_local(&self) -> Option<&Path> {
        match self {
            Endpoint::Local(p) => Some(p),
            Endpoint::Remote(_) => None,
        }
    }

    pub fn as_remote(&self) -> Option<&ObjectLocation> {
        match self {
            Endpoint::Remote(loc) => Some(loc),
            Endpoint::Local(_) => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Local(p) => write!(f, "{}", p.display()),
            Endpoint::Remote(loc) => write!(f, "{}", loc),
        }
    }
}

/// 一个待执行的同步任务，创建后不再修改
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub kind: TaskKind,
    /// 相对路径（两侧的连接键）
    pub location: String,
    /// 删除任务没有源
    pub source: Option<Endpoint>,
    pub destination: Endpoint,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub storage_class: Option<StorageClass>,
    /// 随写入请求附带的属性
    pub properties: Properties,
}

impl Task {
    /// 由源条目生成传输类任务
    pub fn transfer(
        kind: TaskKind,
        entry: &Entry,
        source: Endpoint,
        destination: Endpoint,
        properties: Properties,
    ) -> Self {
        Self {
            kind,
            location: entry.location.clone(),
            source: Some(source),
            destination,
            size: entry.size,
            last_modified: entry.last_modified,
            storage_class: entry.storage_class,
            properties,
        }
    }

    pub fn delete(location: impl Into<String>, destination: Endpoint) -> Self {
        Self {
            kind: TaskKind::Delete,
            location: location.into(),
            source: None,
            destination,
            size: 0,
            last_modified: None,
            storage_class: None,
            properties: Properties::default(),
        }
    }

    pub fn source_local(&self) -> Result<&Path> {
        self.source
            .as_ref()
            .and_then(Endpoint::as_local)
            .ok_or_else(|| anyhow!("{} 任务缺少本地源: {}", self.kind, self.location))
    }

    pub fn source_remote(&self) -> Result<&ObjectLocation> {
        self.source
            .as_ref()
            .and_then(Endpoint::as_remote)
            .ok_or_else(|| anyhow!("{} 任务缺少远程源: {}", self.kind, self.location))
    }

    pub fn destination_local(&self) -> Result<&Path> {
        self.destination
            .as_local()
            .ok_or_else(|| anyhow!("{} 任务的目标不是本地路径: {}", self.kind, self.location))
    }

    pub fn destination_remote(&self) -> Result<&ObjectLocation> {
        self.destination
            .as_remote()
            .ok_or_else(|| anyhow!("{} 任务的目标不是远程对象: {}", self.kind, self.location))
    }

    /// 用于输出的一行描述，例如 `upload: /tmp/a.txt to s3://bucket/a.txt`
    pub fn describe(&self) -> String {
        match &self.source {
            Some(src) => format!("{}: {} to {}", self.kind, src, self.destination),
            None => format!("{}: {}", self.kind, self.destination),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe() {
        let entry = Entry::local("dir/a.txt", 9, None);
        let task = Task::transfer(
            TaskKind::Upload,
            &entry,
            Endpoint::Local(PathBuf::from("/data/dir/a.txt")),
            Endpoint::Remote(ObjectLocation::new("bucket", "dir/a.txt")),
            Properties::default(),
        );
        assert_eq!(
            task.describe(),
            "upload: /data/dir/a.txt to s3://bucket/dir/a.txt"
        );

        let delete = Task::delete(
            "old.txt",
            Endpoint::Remote(ObjectLocation::new("bucket", "old.txt")),
        );
        assert_eq!(delete.describe(), "delete: s3://bucket/old.txt");
        assert!(delete.source_local().is_err());
    }

    #[test]
    fn test_kind_flags() {
        assert!(TaskKind::Download.reads_remote_source());
        assert!(TaskKind::Copy.reads_remote_source());
        assert!(!TaskKind::Upload.reads_remote_source());
        assert!(!TaskKind::Delete.moves_content());
        assert_eq!(Direction::BucketToBucket.transfer_kind(), TaskKind::Copy);
    }
}
