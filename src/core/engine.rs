//! 同步引擎：列举 -> 比较 -> 冷存储门控 -> 执行

use crate::config::{RunConfig, SyncPath};
use crate::core::comparator::{FileComparator, TaskSink};
use crate::core::context::SyncContext;
use crate::core::gate::{GateDecision, StorageClassGate};
use crate::core::properties::PropertyPropagator;
use crate::core::report::{ResultCollector, RunResult, TaskObserver, TracingObserver};
use crate::core::scanner::{FileScanner, ListStream};
use crate::core::task::Task;
use crate::core::transfer::TransferExecutor;
use crate::error::{SyncError, SyncResult};
use crate::storage::{FileSystem, NodeKind, ObjectStore};
use async_trait::async_trait;
use futures::StreamExt;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// 待执行任务队列长度
const TASK_QUEUE_SIZE: usize = 1000;

/// 把比较器产出的任务经过门控后送入执行队列
struct GatedSink {
    gate: StorageClassGate,
    collector: Arc<ResultCollector>,
    tx: mpsc::Sender<Task>,
}

#[async_trait]
impl TaskSink for GatedSink {
    async fn accept(&mut self, task: Task) -> bool {
        match self.gate.evaluate(task) {
            GateDecision::Proceed(task) => {
                self.collector.task_planned();
                self.tx.send(task).await.is_ok()
            }
            GateDecision::Drop {
                location,
                reason,
                warning,
            } => {
                if let Some(warning) = warning {
                    self.collector.warn(warning);
                }
                self.collector.skip(location, reason);
                true
            }
        }
    }
}

/// 同步引擎
pub struct SyncEngine {
    config: RunConfig,
    fs: Arc<dyn FileSystem>,
    store: Arc<dyn ObjectStore>,
    observer: Arc<dyn TaskObserver>,
    cancel: CancellationToken,
}

impl SyncEngine {
    pub fn new(config: RunConfig, fs: Arc<dyn FileSystem>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            config,
            fs,
            store,
            observer: Arc::new(TracingObserver),
            cancel: CancellationToken::new(),
        }
    }

    /// 替换任务完成回调
    pub fn with_observer(mut self, observer: Arc<dyn TaskObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// 取消同步：不再派发新任务，进行中的任务会执行完
    pub fn cancel(&self) {
        info!("收到取消请求");
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 执行一次同步
    pub async fn run(&self) -> RunResult {
        let collector = Arc::new(ResultCollector::new());

        if let Err(e) = self.run_inner(&collector).await {
            error!("同步失败: {}", e);
            collector.set_fatal(e);
        }

        let result = collector.finish();
        info!(
            "同步结束: 计划 {} 个任务, 成功 {}, 跳过 {}, 失败 {}, 警告 {}, 传输 {} 字节",
            result.tasks_planned,
            result.succeeded_count,
            result.skipped_count(),
            result.failed_count(),
            result.warnings.len(),
            result.bytes_transferred
        );
        result
    }

    async fn run_inner(&self, collector: &Arc<ResultCollector>) -> SyncResult<()> {
        let direction = self.config.validate()?;
        let properties = self.config.configured_properties()?;
        let filter = self.config.path_filter()?;

        info!(
            "开始同步: {} -> {} ({:?}, 存储 {})",
            self.config.source,
            self.config.destination,
            direction,
            self.store.name()
        );
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        // 内部致命错误只取消本次运行
        let run_cancel = self.cancel.child_token();
        let ctx = SyncContext::new(
            self.fs.clone(),
            self.store.clone(),
            self.config.request_context(),
            run_cancel.clone(),
        );

        if let SyncPath::Local(root) = &self.config.source {
            self.check_local_source(root).await?;
        }
        let dest_exists = match &self.config.destination {
            SyncPath::Local(root) => self.prepare_local_destination(root).await?,
            SyncPath::Remote { .. } => true,
        };

        let scanner = FileScanner::new(filter, self.config.follow_symlinks);
        let source = scanner.scan(&ctx, &self.config.source);
        let dest: ListStream = if dest_exists {
            scanner.scan(&ctx, &self.config.destination)
        } else {
            futures::stream::empty().boxed()
        };

        let comparator = FileComparator::new(
            self.config.compare_config(),
            direction,
            self.config.source.clone(),
            self.config.destination.clone(),
            properties,
        );
        let executor = TransferExecutor::new(
            ctx,
            self.config.transfer_config(),
            PropertyPropagator::new(self.config.copy_props),
            collector.clone(),
            self.observer.clone(),
        );

        let (tx, rx) = mpsc::channel(TASK_QUEUE_SIZE);
        let worker = tokio::spawn(async move { executor.run(rx).await });

        let mut sink = GatedSink {
            gate: StorageClassGate::new(self.config.cold_storage_policy()),
            collector: collector.clone(),
            tx,
        };
        let merged = comparator
            .merge(source, dest, collector, &run_cancel, &mut sink)
            .await;
        // 关闭队列，执行器处理完剩余任务后退出
        drop(sink);

        if let Err(e) = &merged {
            if *e != SyncError::Cancelled {
                error!("列举失败，停止派发新任务: {}", e);
                run_cancel.cancel();
            }
        }

        if let Err(e) = worker.await {
            error!("执行器异常退出: {}", e);
        }

        let summary = merged?;
        debug!(
            "源 {} 项, 目标 {} 项, {} 个任务",
            summary.source_entries, summary.dest_entries, summary.tasks
        );

        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    async fn check_local_source(&self, root: &Path) -> SyncResult<()> {
        match self.fs.kind(root).await {
            Ok(Some(NodeKind::Directory)) => Ok(()),
            Ok(Some(NodeKind::File)) => Err(SyncError::enumeration(format!(
                "源路径不是目录: {}",
                root.display()
            ))),
            Ok(None) => Err(SyncError::enumeration(format!(
                "源路径不存在: {} (does not exist)",
                root.display()
            ))),
            Err(e) => Err(SyncError::enumeration(format!(
                "无法访问源路径 {}: {:#}",
                root.display(),
                e
            ))),
        }
    }

    /// 确保本地目标目录可用，返回目录是否已存在
    async fn prepare_local_destination(&self, root: &Path) -> SyncResult<bool> {
        match self.fs.kind(root).await {
            Ok(Some(NodeKind::Directory)) => Ok(true),
            Ok(Some(NodeKind::File)) => Err(SyncError::Destination(format!(
                "目标路径是文件而不是目录: {}",
                root.display()
            ))),
            Ok(None) if self.config.dry_run => {
                debug!("(dryrun) 目标目录不存在: {}", root.display());
                Ok(false)
            }
            Ok(None) => {
                debug!("目标目录不存在，自动创建: {}", root.display());
                self.fs.create_dir_all(root).await.map_err(|e| {
                    SyncError::Destination(format!(
                        "创建目标目录 {} 失败: {:#}",
                        root.display(),
                        e
                    ))
                })?;
                Ok(false)
            }
            Err(e) => Err(SyncError::Destination(format!(
                "无法访问目标路径 {}: {:#}",
                root.display(),
                e
            ))),
        }
    }
}
