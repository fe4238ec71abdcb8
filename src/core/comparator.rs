use crate::config::SyncPath;
use crate::core::entry::{Entry, Listed, SkipReason};
use crate::core::properties::Properties;
use crate::core::report::ResultCollector;
use crate::core::scanner::ListStream;
use crate::core::task::{Direction, MetadataRefresh, Task, TaskKind};
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use futures::StreamExt;
use std::cmp::Ordering;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 文件比较结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRelation {
    /// 大小相同，时间（秒）相同
    Equal,
    SizeDiffers,
    /// 大小相同，源更新
    SourceNewer,
    /// 大小相同，目标更新
    DestNewer,
}

/// 比较配置
#[derive(Debug, Clone, Default)]
pub struct CompareConfig {
    /// 只比较大小
    pub size_only: bool,
    /// 下载时要求时间完全一致
    pub exact_timestamps: bool,
    /// 删除目标端独有的条目
    pub delete: bool,
    /// 只产生删除任务
    pub delete_only: bool,
    pub metadata_refresh: MetadataRefresh,
}

/// 接收比较器产出的任务
#[async_trait]
pub trait TaskSink: Send {
    /// 返回 false 表示下游已关闭，比较器随即停止
    async fn accept(&mut self, task: Task) -> bool;
}

#[async_trait]
impl TaskSink for Vec<Task> {
    async fn accept(&mut self, task: Task) -> bool {
        self.push(task);
        true
    }
}

/// 合并统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub source_entries: usize,
    pub dest_entries: usize,
    pub tasks: usize,
}

/// 有序列举流的一侧，负责检查顺序并把跳过项交给收集器
struct OrderedSide {
    name: &'static str,
    stream: ListStream,
    last: Option<String>,
    seen: usize,
    /// 无法读取的目录，其下的条目不完整
    unreadable: Vec<String>,
}

impl OrderedSide {
    fn new(name: &'static str, stream: ListStream) -> Self {
        Self {
            name,
            stream,
            last: None,
            seen: 0,
            unreadable: Vec::new(),
        }
    }

    /// location 是否落在某个无法读取的目录下
    fn is_incomplete(&self, location: &str) -> bool {
        self.unreadable.iter().any(|dir| {
            dir.is_empty()
                || location == dir
                || (location.starts_with(dir.as_str())
                    && location.as_bytes().get(dir.len()) == Some(&b'/'))
        })
    }

    async fn next_entry(&mut self, collector: &ResultCollector) -> SyncResult<Option<Entry>> {
        while let Some(item) = self.stream.next().await {
            match item? {
                Listed::Warning(message) => collector.warn(message),
                Listed::Skipped { location, reason } => {
                    if matches!(reason, SkipReason::Unreadable(_)) {
                        self.unreadable.push(location.clone());
                    }
                    collector.warn(format!("跳过文件 {}：{}", location, reason));
                    collector.skip(location, reason);
                }
                Listed::Entry(entry) => {
                    if let Some(last) = &self.last {
                        if entry.location.as_str() <= last.as_str() {
                            return Err(SyncError::enumeration(format!(
                                "{}列表顺序错误: {:?} 出现在 {:?} 之后",
                                self.name, entry.location, last
                            )));
                        }
                    }
                    self.last = Some(entry.location.clone());
                    self.seen += 1;
                    return Ok(Some(entry));
                }
            }
        }
        Ok(None)
    }
}

/// 文件比较器：对两侧有序列举流做归并，产出最小任务集合
#[derive(Debug, Clone)]
pub struct FileComparator {
    config: CompareConfig,
    direction: Direction,
    source_root: SyncPath,
    dest_root: SyncPath,
    /// 附加到上传/复制任务上的属性
    properties: Properties,
}

impl FileComparator {
    pub fn new(
        config: CompareConfig,
        direction: Direction,
        source_root: SyncPath,
        dest_root: SyncPath,
        properties: Properties,
    ) -> Self {
        Self {
            config,
            direction,
            source_root,
            dest_root,
            properties,
        }
    }

    /// 比较两个条目（时间精确到秒）
    pub fn compare_files(&self, source: &Entry, dest: &Entry) -> FileRelation {
        if source.size != dest.size {
            debug!(
                "文件大小不同: {} (src={}, dst={})",
                source.location, source.size, dest.size
            );
            return FileRelation::SizeDiffers;
        }
        let (src_time, dst_time) = (source.modified_secs(), dest.modified_secs());
        match src_time.cmp(&dst_time) {
            Ordering::Equal => FileRelation::Equal,
            Ordering::Greater => FileRelation::SourceNewer,
            Ordering::Less => FileRelation::DestNewer,
        }
    }

    /// 两侧是否已经一致
    pub fn in_sync(&self, source: &Entry, dest: &Entry) -> bool {
        let relation = self.compare_files(source, dest);
        if relation == FileRelation::SizeDiffers {
            return false;
        }
        if self.config.size_only {
            return true;
        }
        match self.direction {
            // 目标不比源旧即可
            Direction::Upload | Direction::BucketToBucket => {
                matches!(relation, FileRelation::Equal | FileRelation::DestNewer)
            }
            // 下载后本地时间会被设置为远程时间
            Direction::Download if self.config.exact_timestamps => {
                relation == FileRelation::Equal
            }
            Direction::Download => {
                matches!(relation, FileRelation::Equal | FileRelation::SourceNewer)
            }
        }
    }

    fn transfer(&self, kind: TaskKind, entry: &Entry) -> Task {
        let properties = match kind {
            TaskKind::Download => Properties::default(),
            _ => self.properties.clone(),
        };
        Task::transfer(
            kind,
            entry,
            self.source_root.endpoint(&entry.location),
            self.dest_root.endpoint(&entry.location),
            properties,
        )
    }

    /// 对同一 location 的一对条目做出决定
    pub fn decide(&self, source: Option<&Entry>, dest: Option<&Entry>) -> Option<Task> {
        match (source, dest) {
            (Some(src), None) => {
                if self.config.delete_only {
                    return None;
                }
                Some(self.transfer(self.direction.transfer_kind(), src))
            }
            (None, Some(dst)) => {
                if !self.config.delete {
                    return None;
                }
                Some(Task::delete(
                    dst.location.clone(),
                    self.dest_root.endpoint(&dst.location),
                ))
            }
            (Some(src), Some(dst)) => {
                if self.config.delete_only {
                    return None;
                }
                if !self.in_sync(src, dst) {
                    return Some(self.transfer(self.direction.transfer_kind(), src));
                }
                let refresh = self.direction == Direction::BucketToBucket
                    && self.config.metadata_refresh != MetadataRefresh::Never;
                refresh.then(|| self.transfer(TaskKind::MetadataCopy, src))
            }
            (None, None) => None,
        }
    }

    /// 归并两侧列举流，把任务依次交给 sink
    pub async fn merge(
        &self,
        source: ListStream,
        dest: ListStream,
        collector: &ResultCollector,
        cancel: &CancellationToken,
        sink: &mut dyn TaskSink,
    ) -> SyncResult<MergeSummary> {
        let mut src_side = OrderedSide::new("源", source);
        let mut dst_side = OrderedSide::new("目标", dest);
        let mut summary = MergeSummary::default();

        let mut src = src_side.next_entry(collector).await?;
        let mut dst = dst_side.next_entry(collector).await?;

        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let order = match (&src, &dst) {
                (None, None) => break,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(s), Some(d)) => s.location.cmp(&d.location),
            };

            let task = match order {
                Ordering::Less => {
                    let task = self.decide(src.as_ref(), None);
                    src = src_side.next_entry(collector).await?;
                    task
                }
                Ordering::Greater => {
                    let task = match dst.as_ref() {
                        Some(d) if src_side.is_incomplete(&d.location) => {
                            warn!("源目录无法读取，保留目标文件: {}", d.location);
                            None
                        }
                        d => self.decide(None, d),
                    };
                    dst = dst_side.next_entry(collector).await?;
                    task
                }
                Ordering::Equal => {
                    let task = self.decide(src.as_ref(), dst.as_ref());
                    src = src_side.next_entry(collector).await?;
                    dst = dst_side.next_entry(collector).await?;
                    task
                }
            };

            if let Some(task) = task {
                debug!("计划任务: {}", task.describe());
                summary.tasks += 1;
                if !sink.accept(task).await {
                    debug!("任务队列已关闭，停止比较");
                    break;
                }
            }
        }

        summary.source_entries = src_side.seen;
        summary.dest_entries = dst_side.seen;
        info!(
            "比较完成: 源 {} 项, 目标 {} 项, {} 个任务",
            summary.source_entries, summary.dest_entries, summary.tasks
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::entry::SkipReason;
    use crate::core::task::Endpoint;
    use crate::storage::ObjectLocation;
    use chrono::{DateTime, Utc};
    use std::path::PathBuf;

    fn at(secs: i64) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(secs, 0)
    }

    fn local(loc: &str, size: u64, secs: i64) -> Entry {
        Entry::local(loc, size, at(secs))
    }

    fn remote(loc: &str, size: u64, secs: i64) -> Entry {
        Entry::remote(loc, size, at(secs), None)
    }

    fn comparator(direction: Direction, config: CompareConfig) -> FileComparator {
        let (src, dst) = match direction {
            Direction::Upload => (
                SyncPath::Local(PathBuf::from("/src")),
                SyncPath::remote("bucket", ""),
            ),
            Direction::Download => (
                SyncPath::remote("bucket", ""),
                SyncPath::Local(PathBuf::from("/dst")),
            ),
            Direction::BucketToBucket => {
                (SyncPath::remote("src", ""), SyncPath::remote("dst", ""))
            }
        };
        FileComparator::new(config, direction, src, dst, Properties::default())
    }

    fn stream(items: Vec<Listed>) -> ListStream {
        futures::stream::iter(items.into_iter().map(Ok)).boxed()
    }

    fn entries(items: Vec<Entry>) -> ListStream {
        stream(items.into_iter().map(Listed::Entry).collect())
    }

    #[test]
    fn test_upload_time_rules() {
        let cmp = comparator(Direction::Upload, CompareConfig::default());
        // 远程比本地新：一致
        assert!(cmp.decide(Some(&local("a", 1, 100)), Some(&remote("a", 1, 200))).is_none());
        // 本地比远程新：上传
        let task = cmp
            .decide(Some(&local("a", 1, 300)), Some(&remote("a", 1, 200)))
            .unwrap();
        assert_eq!(task.kind, TaskKind::Upload);
        assert_eq!(
            task.destination,
            Endpoint::Remote(ObjectLocation::new("bucket", "a"))
        );
        // 大小不同：上传
        assert!(cmp.decide(Some(&local("a", 2, 100)), Some(&remote("a", 1, 200))).is_some());
    }

    #[test]
    fn test_download_time_rules() {
        let cmp = comparator(Direction::Download, CompareConfig::default());
        // 本地不比远程新：一致
        assert!(cmp.decide(Some(&remote("a", 1, 200)), Some(&local("a", 1, 100))).is_none());
        assert!(cmp.decide(Some(&remote("a", 1, 200)), Some(&local("a", 1, 200))).is_none());
        // 本地比远程新：下载
        let task = cmp
            .decide(Some(&remote("a", 1, 200)), Some(&local("a", 1, 300)))
            .unwrap();
        assert_eq!(task.kind, TaskKind::Download);
        assert_eq!(task.destination, Endpoint::Local(PathBuf::from("/dst/a")));

        let exact = comparator(
            Direction::Download,
            CompareConfig {
                exact_timestamps: true,
                ..Default::default()
            },
        );
        assert!(exact
            .decide(Some(&remote("a", 1, 200)), Some(&local("a", 1, 100)))
            .is_some());
        assert!(exact
            .decide(Some(&remote("a", 1, 200)), Some(&local("a", 1, 200)))
            .is_none());
    }

    #[test]
    fn test_size_only_and_missing_time() {
        let cmp = comparator(
            Direction::Upload,
            CompareConfig {
                size_only: true,
                ..Default::default()
            },
        );
        assert!(cmp.decide(Some(&local("a", 1, 900)), Some(&remote("a", 1, 1))).is_none());

        // 缺失的时间按纪元处理
        let cmp = comparator(Direction::Upload, CompareConfig::default());
        let unknown = Entry::local("a", 1, None);
        assert!(cmp.decide(Some(&unknown), Some(&remote("a", 1, 0))).is_none());
    }

    #[test]
    fn test_delete_rules() {
        let no_delete = comparator(Direction::Upload, CompareConfig::default());
        assert!(no_delete.decide(None, Some(&remote("x", 1, 1))).is_none());

        let delete = comparator(
            Direction::Upload,
            CompareConfig {
                delete: true,
                ..Default::default()
            },
        );
        let task = delete.decide(None, Some(&remote("x", 1, 1))).unwrap();
        assert_eq!(task.kind, TaskKind::Delete);
        assert!(task.source.is_none());

        let delete_only = comparator(
            Direction::Upload,
            CompareConfig {
                delete: true,
                delete_only: true,
                ..Default::default()
            },
        );
        assert!(delete_only.decide(Some(&local("a", 1, 1)), None).is_none());
        assert!(delete_only
            .decide(Some(&local("a", 2, 1)), Some(&remote("a", 1, 1)))
            .is_none());
        assert!(delete_only.decide(None, Some(&remote("x", 1, 1))).is_some());
    }

    #[test]
    fn test_metadata_refresh_only_between_buckets() {
        let config = CompareConfig {
            metadata_refresh: MetadataRefresh::Always,
            ..Default::default()
        };
        let b2b = comparator(Direction::BucketToBucket, config.clone());
        let task = b2b
            .decide(Some(&remote("a", 1, 100)), Some(&remote("a", 1, 200)))
            .unwrap();
        assert_eq!(task.kind, TaskKind::MetadataCopy);

        let upload = comparator(Direction::Upload, config);
        assert!(upload
            .decide(Some(&local("a", 1, 100)), Some(&remote("a", 1, 200)))
            .is_none());
    }

    #[tokio::test]
    async fn test_merge_scenario() {
        let cmp = comparator(
            Direction::Upload,
            CompareConfig {
                delete: true,
                ..Default::default()
            },
        );
        let source = entries(vec![
            local("a", 1, 10),
            local("b", 5, 10),
            local("d", 1, 10),
        ]);
        let dest = entries(vec![
            remote("b", 5, 20),
            remote("c", 1, 10),
            remote("d", 2, 20),
        ]);

        let collector = ResultCollector::new();
        let mut tasks: Vec<Task> = Vec::new();
        let summary = cmp
            .merge(source, dest, &collector, &CancellationToken::new(), &mut tasks)
            .await
            .unwrap();

        let planned: Vec<_> = tasks
            .iter()
            .map(|t| (t.kind, t.location.as_str()))
            .collect();
        assert_eq!(
            planned,
            vec![
                (TaskKind::Upload, "a"),
                (TaskKind::Delete, "c"),
                (TaskKind::Upload, "d"),
            ]
        );
        assert_eq!(summary.tasks, 3);
        assert_eq!(summary.source_entries, 3);
        assert_eq!(summary.dest_entries, 3);
    }

    #[tokio::test]
    async fn test_merge_forwards_skips_as_warnings() {
        let cmp = comparator(Direction::Upload, CompareConfig::default());
        let source = stream(vec![
            Listed::Skipped {
                location: "gone".to_string(),
                reason: SkipReason::Vanished("No such file".to_string()),
            },
            Listed::Entry(local("z", 1, 1)),
        ]);

        let collector = ResultCollector::new();
        let mut tasks: Vec<Task> = Vec::new();
        cmp.merge(source, entries(vec![]), &collector, &CancellationToken::new(), &mut tasks)
            .await
            .unwrap();

        assert_eq!(tasks.len(), 1);
        let result = collector.finish();
        assert_eq!(result.skipped_count(), 1);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("gone"));
        assert!(result.warnings[0].contains("File does not exist"));
    }

    #[tokio::test]
    async fn test_unreadable_source_dir_blocks_deletes_below_it() {
        let cmp = comparator(
            Direction::Upload,
            CompareConfig {
                delete: true,
                ..Default::default()
            },
        );
        let source = stream(vec![
            Listed::Entry(local("a", 1, 1)),
            Listed::Skipped {
                location: "sub".to_string(),
                reason: SkipReason::Unreadable("Permission denied".to_string()),
            },
            Listed::Entry(local("z", 1, 1)),
        ]);
        let dest = entries(vec![
            remote("a", 1, 1),
            remote("sub-x", 1, 1),
            remote("sub/f", 1, 1),
            remote("sub/g/h", 1, 1),
        ]);

        let collector = ResultCollector::new();
        let mut tasks: Vec<Task> = Vec::new();
        cmp.merge(source, dest, &collector, &CancellationToken::new(), &mut tasks)
            .await
            .unwrap();

        let planned: Vec<_> = tasks
            .iter()
            .map(|t| (t.kind, t.location.as_str()))
            .collect();
        assert_eq!(
            planned,
            vec![(TaskKind::Delete, "sub-x"), (TaskKind::Upload, "z")]
        );
        assert_eq!(collector.finish().warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_unreadable_source_root_blocks_all_deletes() {
        let cmp = comparator(
            Direction::Upload,
            CompareConfig {
                delete: true,
                ..Default::default()
            },
        );
        let source = stream(vec![Listed::Skipped {
            location: String::new(),
            reason: SkipReason::Unreadable("Permission denied".to_string()),
        }]);

        let collector = ResultCollector::new();
        let mut tasks: Vec<Task> = Vec::new();
        cmp.merge(
            source,
            entries(vec![remote("x", 1, 1)]),
            &collector,
            &CancellationToken::new(),
            &mut tasks,
        )
        .await
        .unwrap();
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn test_merge_rejects_unordered_stream() {
        let cmp = comparator(Direction::Upload, CompareConfig::default());
        let source = entries(vec![local("b", 1, 1), local("a", 1, 1)]);

        let collector = ResultCollector::new();
        let mut tasks: Vec<Task> = Vec::new();
        let result = cmp
            .merge(source, entries(vec![]), &collector, &CancellationToken::new(), &mut tasks)
            .await;
        assert!(matches!(result, Err(SyncError::Enumeration(_))));
    }

    #[tokio::test]
    async fn test_merge_stops_on_cancel() {
        let cmp = comparator(Direction::Upload, CompareConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let collector = ResultCollector::new();
        let mut tasks: Vec<Task> = Vec::new();
        let result = cmp
            .merge(
                entries(vec![local("a", 1, 1)]),
                entries(vec![]),
                &collector,
                &cancel,
                &mut tasks,
            )
            .await;
        assert_eq!(result, Err(SyncError::Cancelled));
        assert!(tasks.is_empty());
    }
}
