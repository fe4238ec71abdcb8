//! 传输执行器：并发执行任务，支持分块传输和重试

use crate::core::context::SyncContext;
use crate::core::entry::SkipReason;
use crate::core::properties::{PreparedProperties, PropertyPropagator};
use crate::core::report::{ResultCollector, TaskObserver, TaskOutcome};
use crate::core::task::{Endpoint, MetadataRefresh, Task, TaskKind};
use crate::storage::{CompletedPart, ObjectLocation, PendingWrite};
use anyhow::{anyhow, Result};
use std::future::Future;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 单个对象最多的分块数
pub const MAX_PARTS: u64 = 10_000;

/// 传输配置
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// 同时进行的操作数（整任务和分块共用）
    pub concurrency: usize,
    /// 达到此大小（字节）的对象使用分块传输
    pub multipart_threshold: u64,
    /// 初始分块大小（字节）
    pub part_size: u64,
    /// 最大重试次数
    pub max_retries: u32,
    /// 重试基础延迟（毫秒）
    pub retry_base_delay_ms: u64,
    pub dry_run: bool,
    pub metadata_refresh: MetadataRefresh,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            multipart_threshold: 8 * 1024 * 1024, // 8MB
            part_size: 8 * 1024 * 1024,           // 8MB
            max_retries: 5,
            retry_base_delay_ms: 2000,
            dry_run: false,
            metadata_refresh: MetadataRefresh::Never,
        }
    }
}

/// 切分字节范围，分块数超过上限时分块大小翻倍
pub fn plan_parts(size: u64, part_size: u64) -> Vec<Range<u64>> {
    let mut part = part_size.max(1);
    while size.div_ceil(part) > MAX_PARTS {
        part = part.saturating_mul(2);
    }

    let mut ranges = Vec::with_capacity(size.div_ceil(part) as usize);
    let mut start = 0;
    while start < size {
        let end = (start + part).min(size);
        ranges.push(start..end);
        start = end;
    }
    ranges
}

/// 指数退避重试
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    cancel: CancellationToken,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay_ms: u64, cancel: CancellationToken) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            cancel,
        }
    }

    /// 执行操作，失败时按 `base * 2^attempt` 等待后重试；取消后不再重试
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt >= self.max_retries || self.cancel.is_cancelled() => {
                    if self.max_retries > 0 {
                        error!("{} 最终失败 (已重试{}次): {:#}", what, attempt, e);
                    }
                    return Err(e);
                }
                Err(e) => {
                    let delay = self
                        .base_delay_ms
                        .saturating_mul(2u64.saturating_pow(attempt));
                    warn!(
                        "{} 失败，{}ms 后重试 ({}/{}): {:#}",
                        what,
                        delay,
                        attempt + 1,
                        self.max_retries,
                        e
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(e),
                        _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}

struct ExecutorInner {
    ctx: SyncContext,
    config: TransferConfig,
    propagator: PropertyPropagator,
    semaphore: Arc<Semaphore>,
    retry: RetryPolicy,
    collector: Arc<ResultCollector>,
    observer: Arc<dyn TaskObserver>,
}

/// 传输执行器
#[derive(Clone)]
pub struct TransferExecutor {
    inner: Arc<ExecutorInner>,
}

type PendingSlot = Arc<Mutex<Option<Box<dyn PendingWrite>>>>;

fn flatten<T>(joined: std::result::Result<Result<T>, JoinError>) -> Result<T> {
    joined.map_err(|e| anyhow!("分块任务异常退出: {}", e))?
}

impl TransferExecutor {
    pub fn new(
        ctx: SyncContext,
        config: TransferConfig,
        propagator: PropertyPropagator,
        collector: Arc<ResultCollector>,
        observer: Arc<dyn TaskObserver>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
        let retry = RetryPolicy::new(
            config.max_retries,
            config.retry_base_delay_ms,
            ctx.cancel.clone(),
        );
        Self {
            inner: Arc::new(ExecutorInner {
                ctx,
                config,
                propagator,
                semaphore,
                retry,
                collector,
                observer,
            }),
        }
    }

    /// 从 channel 接收任务并发执行，直到 channel 关闭或被取消
    pub async fn run(&self, mut rx: mpsc::Receiver<Task>) {
        let cancel = self.inner.ctx.cancel.clone();
        let mut workers = JoinSet::new();

        loop {
            let task = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                task = rx.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = self.inner.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let executor = self.clone();
            workers.spawn(async move { executor.execute(task, permit).await });

            while let Some(joined) = workers.try_join_next() {
                if let Err(e) = joined {
                    error!("传输任务异常退出: {}", e);
                }
            }
        }

        if cancel.is_cancelled() {
            rx.close();
            let mut dropped = 0usize;
            while rx.recv().await.is_some() {
                dropped += 1;
            }
            info!(
                "同步已取消，等待 {} 个进行中的任务完成，{} 个任务未开始",
                workers.len(),
                dropped
            );
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("传输任务异常退出: {}", e);
            }
        }
    }

    /// 执行单个任务并记录结果
    pub async fn execute(&self, task: Task, permit: OwnedSemaphorePermit) {
        let outcome = if self.inner.config.dry_run {
            drop(permit);
            TaskOutcome::Skipped(SkipReason::DryRun)
        } else {
            match self.perform(&task, permit).await {
                Ok(outcome) => outcome,
                Err(e) => TaskOutcome::Failed(format!("{:#}", e)),
            }
        };

        self.inner.collector.record_outcome(&task, &outcome);
        self.inner.observer.on_task_complete(&task, &outcome);
    }

    fn is_multipart(&self, task: &Task) -> bool {
        task.kind.moves_content()
            && task.size > 0
            && task.size >= self.inner.config.multipart_threshold
    }

    async fn perform(&self, task: &Task, permit: OwnedSemaphorePermit) -> Result<TaskOutcome> {
        let multipart = self.is_multipart(task);
        debug!(
            "执行: {} ({}字节, multipart={})",
            task.describe(),
            task.size,
            multipart
        );

        match task.kind {
            TaskKind::Delete => {
                self.delete(task).await?;
                return Ok(TaskOutcome::Succeeded { bytes: 0 });
            }
            TaskKind::MetadataCopy
                if self.inner.config.metadata_refresh == MetadataRefresh::WhenDifferent =>
            {
                let ctx = &self.inner.ctx;
                let matches = self
                    .inner
                    .propagator
                    .destination_matches(task, ctx.store.as_ref(), &ctx.request)
                    .await?;
                if matches {
                    return Ok(TaskOutcome::Skipped(SkipReason::PropertiesUnchanged));
                }
            }
            _ => {}
        }

        match (task.kind, multipart) {
            (TaskKind::Upload, false) => self.upload_single(task).await?,
            (TaskKind::Upload, true) => self.upload_multipart(task, permit).await?,
            (TaskKind::Download, false) => self.download_single(task).await?,
            (TaskKind::Download, true) => self.download_multipart(task, permit).await?,
            (TaskKind::Copy | TaskKind::MetadataCopy, false) => self.copy_single(task).await?,
            (TaskKind::Copy | TaskKind::MetadataCopy, true) => {
                self.copy_multipart(task, permit).await?
            }
            (TaskKind::Delete, _) => {}
        }

        let bytes = match task.kind {
            TaskKind::Upload | TaskKind::Download | TaskKind::Copy => task.size,
            TaskKind::MetadataCopy | TaskKind::Delete => 0,
        };
        Ok(TaskOutcome::Succeeded { bytes })
    }

    async fn prepare(&self, task: &Task, multipart: bool) -> Result<PreparedProperties> {
        let ctx = &self.inner.ctx;
        self.inner
            .propagator
            .prepare(task, multipart, ctx.store.as_ref(), &ctx.request)
            .await
    }

    async fn delete(&self, task: &Task) -> Result<()> {
        let ctx = &self.inner.ctx;
        let what = task.describe();
        match &task.destination {
            Endpoint::Remote(loc) => {
                self.inner
                    .retry
                    .run(&what, || ctx.store.delete_object(loc, &ctx.request))
                    .await
            }
            Endpoint::Local(path) => self.inner.retry.run(&what, || ctx.fs.remove(path)).await,
        }
    }

    /// 写入完成后单独设置过大的标签集合
    async fn apply_deferred_tags(&self, task: &Task, prepared: &PreparedProperties) -> Result<()> {
        let Some(tags) = &prepared.deferred_tags else {
            return Ok(());
        };
        let ctx = &self.inner.ctx;
        let dst = task.destination_remote()?;
        self.inner
            .retry
            .run("put_tags", || ctx.store.put_tags(dst, tags, &ctx.request))
            .await
    }

    /// 下载完成后把本地修改时间设置为远程时间
    async fn restore_mtime(&self, task: &Task, path: &Path) {
        let Some(time) = task.last_modified else {
            return;
        };
        if let Err(e) = self.inner.ctx.fs.set_modified(path, time).await {
            self.inner.collector.warn(format!(
                "已下载 {}，但无法更新其修改时间: {:#}",
                path.display(),
                e
            ));
        }
    }

    async fn reacquire(&self) -> Result<OwnedSemaphorePermit> {
        Ok(self.inner.semaphore.clone().acquire_owned().await?)
    }

    async fn upload_single(&self, task: &Task) -> Result<()> {
        let ctx = &self.inner.ctx;
        let path = task.source_local()?;
        let dst = task.destination_remote()?;
        let prepared = self.prepare(task, false).await?;

        let body = self
            .inner
            .retry
            .run("读取本地文件", || ctx.fs.read_range(path, 0, task.size))
            .await?;
        self.inner
            .retry
            .run(&task.describe(), || {
                ctx.store
                    .put_object(dst, body.clone(), &prepared.outgoing, &ctx.request)
            })
            .await?;
        self.apply_deferred_tags(task, &prepared).await
    }

    async fn download_single(&self, task: &Task) -> Result<()> {
        let ctx = &self.inner.ctx;
        let src = task.source_remote()?;
        let dst = task.destination_local()?;

        let data = self
            .inner
            .retry
            .run(&task.describe(), || ctx.store.get_object(src, None, &ctx.request))
            .await?;

        let mut pending = ctx.fs.begin_write(dst).await?;
        if let Err(e) = pending.write_at(0, data).await {
            if let Err(abort_err) = pending.abort().await {
                warn!("清理临时文件失败: {:#}", abort_err);
            }
            return Err(e);
        }
        pending.commit().await?;
        self.restore_mtime(task, dst).await;
        Ok(())
    }

    async fn copy_single(&self, task: &Task) -> Result<()> {
        let ctx = &self.inner.ctx;
        let src = task.source_remote()?;
        let dst = task.destination_remote()?;
        let prepared = self.prepare(task, false).await?;

        self.inner
            .retry
            .run(&task.describe(), || {
                ctx.store
                    .copy_object(src, dst, &prepared.outgoing, &ctx.request)
            })
            .await?;
        self.apply_deferred_tags(task, &prepared).await
    }

    /// 并发执行所有分块；任一分块失败时取消其余分块
    async fn run_parts<T, F, Fut>(&self, parts: Vec<Range<u64>>, part: F) -> Result<Vec<T>>
    where
        F: Fn(u32, Range<u64>) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let mut set = JoinSet::new();
        let mut results = Vec::with_capacity(parts.len());

        for (index, range) in parts.into_iter().enumerate() {
            let permit = self.reacquire().await?;
            let fut = part(index as u32 + 1, range);
            set.spawn(async move {
                let result = fut.await;
                drop(permit);
                result
            });

            while let Some(joined) = set.try_join_next() {
                match flatten(joined) {
                    Ok(v) => results.push(v),
                    Err(e) => {
                        set.abort_all();
                        while set.join_next().await.is_some() {}
                        return Err(e);
                    }
                }
            }
        }

        while let Some(joined) = set.join_next().await {
            match flatten(joined) {
                Ok(v) => results.push(v),
                Err(e) => {
                    set.abort_all();
                    while set.join_next().await.is_some() {}
                    return Err(e);
                }
            }
        }
        Ok(results)
    }

    /// 提交或取消远程分块上传
    async fn finish_remote_multipart(
        &self,
        dst: &ObjectLocation,
        upload_id: &str,
        parts: Result<Vec<CompletedPart>>,
    ) -> Result<()> {
        let ctx = &self.inner.ctx;
        let result = match parts {
            Ok(mut parts) => {
                parts.sort_by_key(|p| p.part_number);
                self.inner
                    .retry
                    .run("complete_multipart", || {
                        ctx.store
                            .complete_multipart(dst, upload_id, parts.clone(), &ctx.request)
                    })
                    .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            warn!("分块上传失败，取消上传 {} ({}): {:#}", dst, upload_id, e);
            if let Err(abort_err) = ctx.store.abort_multipart(dst, upload_id, &ctx.request).await {
                warn!("取消分块上传失败 {}: {:#}", dst, abort_err);
            }
            return Err(e);
        }
        Ok(())
    }

    async fn upload_multipart(&self, task: &Task, permit: OwnedSemaphorePermit) -> Result<()> {
        let ctx = &self.inner.ctx;
        let path = task.source_local()?;
        let dst = task.destination_remote()?;
        let prepared = self.prepare(task, true).await?;

        let upload_id = self
            .inner
            .retry
            .run("create_multipart", || {
                ctx.store.create_multipart(dst, &prepared.outgoing, &ctx.request)
            })
            .await?;
        let parts = plan_parts(task.size, self.inner.config.part_size);
        debug!("分块上传 {}: {} 个分块, upload id {}", dst, parts.len(), upload_id);

        // 等待分块期间不占用并发名额
        drop(permit);
        let result = self
            .run_parts(parts, |number, range| {
                let ctx = ctx.clone();
                let retry = self.inner.retry.clone();
                let path = path.to_path_buf();
                let dst = dst.clone();
                let upload_id = upload_id.clone();
                async move {
                    let len = range.end - range.start;
                    let body = retry
                        .run("读取本地分块", || ctx.fs.read_range(&path, range.start, len))
                        .await?;
                    retry
                        .run(&format!("upload_part {}", number), || {
                            ctx.store
                                .upload_part(&dst, &upload_id, number, body.clone(), &ctx.request)
                        })
                        .await
                }
            })
            .await;

        let _permit = self.reacquire().await?;
        self.finish_remote_multipart(dst, &upload_id, result).await?;
        self.apply_deferred_tags(task, &prepared).await
    }

    async fn copy_multipart(&self, task: &Task, permit: OwnedSemaphorePermit) -> Result<()> {
        let ctx = &self.inner.ctx;
        let src = task.source_remote()?;
        let dst = task.destination_remote()?;
        let prepared = self.prepare(task, true).await?;

        let upload_id = self
            .inner
            .retry
            .run("create_multipart", || {
                ctx.store.create_multipart(dst, &prepared.outgoing, &ctx.request)
            })
            .await?;
        let parts = plan_parts(task.size, self.inner.config.part_size);
        debug!("分块复制 {} -> {}: {} 个分块", src, dst, parts.len());

        drop(permit);
        let result = self
            .run_parts(parts, |number, range| {
                let ctx = ctx.clone();
                let retry = self.inner.retry.clone();
                let src = src.clone();
                let dst = dst.clone();
                let upload_id = upload_id.clone();
                async move {
                    retry
                        .run(&format!("upload_part_copy {}", number), || {
                            ctx.store.upload_part_copy(
                                &src,
                                &dst,
                                &upload_id,
                                number,
                                range.clone(),
                                &ctx.request,
                            )
                        })
                        .await
                }
            })
            .await;

        let _permit = self.reacquire().await?;
        self.finish_remote_multipart(dst, &upload_id, result).await?;
        self.apply_deferred_tags(task, &prepared).await
    }

    async fn download_multipart(&self, task: &Task, permit: OwnedSemaphorePermit) -> Result<()> {
        let ctx = &self.inner.ctx;
        let src = task.source_remote()?;
        let dst = task.destination_local()?;

        let slot: PendingSlot = Arc::new(Mutex::new(Some(ctx.fs.begin_write(dst).await?)));
        let parts = plan_parts(task.size, self.inner.config.part_size);
        debug!("分块下载 {}: {} 个分块", src, parts.len());

        drop(permit);
        let result = self
            .run_parts(parts, |number, range| {
                let ctx = ctx.clone();
                let retry = self.inner.retry.clone();
                let src = src.clone();
                let slot = slot.clone();
                async move {
                    let data = retry
                        .run(&format!("下载分块 {}", number), || {
                            ctx.store.get_object(&src, Some(range.clone()), &ctx.request)
                        })
                        .await?;
                    let mut guard = slot.lock().await;
                    let pending = guard
                        .as_mut()
                        .ok_or_else(|| anyhow!("本地写入已结束"))?;
                    pending.write_at(range.start, data).await
                }
            })
            .await;

        let _permit = self.reacquire().await?;
        let pending = slot
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("本地写入已结束: {}", dst.display()))?;
        match result {
            Ok(_) => pending.commit().await?,
            Err(e) => {
                if let Err(abort_err) = pending.abort().await {
                    warn!("清理临时文件失败: {:#}", abort_err);
                }
                return Err(e);
            }
        }
        self.restore_mtime(task, dst).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::entry::Entry;
    use crate::core::properties::{CopyPropsMode, Properties};
    use crate::core::report::TracingObserver;
    use crate::storage::memory::{MemoryObject, MemoryObjectStore, OperationKind};
    use crate::storage::{LocalFileSystem, RequestContext};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn executor(store: Arc<MemoryObjectStore>, config: TransferConfig) -> (TransferExecutor, Arc<ResultCollector>) {
        let ctx = SyncContext::new(
            Arc::new(LocalFileSystem::new()),
            store,
            RequestContext::default(),
            CancellationToken::new(),
        );
        let collector = Arc::new(ResultCollector::new());
        let exec = TransferExecutor::new(
            ctx,
            config,
            PropertyPropagator::new(CopyPropsMode::Default),
            collector.clone(),
            Arc::new(TracingObserver),
        );
        (exec, collector)
    }

    fn small_parts() -> TransferConfig {
        TransferConfig {
            concurrency: 1,
            multipart_threshold: 4,
            part_size: 4,
            max_retries: 0,
            retry_base_delay_ms: 1,
            ..Default::default()
        }
    }

    fn upload_task(path: PathBuf, size: u64) -> Task {
        Task::transfer(
            TaskKind::Upload,
            &Entry::local("data.bin", size, None),
            Endpoint::Local(path),
            Endpoint::Remote(ObjectLocation::new("bucket", "data.bin")),
            Properties::default(),
        )
    }

    async fn run_tasks(exec: &TransferExecutor, tasks: Vec<Task>) {
        let (tx, rx) = mpsc::channel(16);
        for task in tasks {
            tx.send(task).await.unwrap();
        }
        drop(tx);
        tokio::time::timeout(Duration::from_secs(10), exec.run(rx))
            .await
            .expect("executor did not finish");
    }

    #[test]
    fn test_plan_parts() {
        assert_eq!(plan_parts(10, 4), vec![0..4, 4..8, 8..10]);
        assert_eq!(plan_parts(8, 8), vec![0..8]);
        assert!(plan_parts(0, 8).is_empty());

        // 超过 10000 个分块时分块大小翻倍
        let parts = plan_parts(20_001, 1);
        assert_eq!(parts.len(), 5001);
        assert_eq!(parts[0], 0..4);
        assert!(parts.len() as u64 <= MAX_PARTS);
    }

    #[tokio::test]
    async fn test_retry_policy() {
        let policy = RetryPolicy::new(3, 1, CancellationToken::new());
        let calls = AtomicU32::new(0);
        let value = policy
            .run("op", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(anyhow!("transient"))
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let policy = RetryPolicy::new(3, 1, cancel);
        let calls = AtomicU32::new(0);
        let result: Result<()> = policy
            .run("op", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(anyhow!("fail"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_multipart_upload_with_single_permit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        let store = Arc::new(MemoryObjectStore::new());
        store.create_bucket("bucket");
        let (exec, collector) = executor(store.clone(), small_parts());

        run_tasks(&exec, vec![upload_task(path, 10)]).await;

        let result = collector.finish();
        assert_eq!(result.succeeded_count, 1);
        assert_eq!(result.bytes_transferred, 10);
        assert_eq!(&store.object("bucket", "data.bin").unwrap().data[..], b"0123456789");
        assert_eq!(store.operations_of(OperationKind::UploadPart).len(), 3);
        assert_eq!(store.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn test_in_flight_requests_bounded_by_concurrency() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new().with_latency(Duration::from_millis(5)));
        store.create_bucket("bucket");

        // 分块任务和普通任务混合，共用同一组许可
        let mut tasks = Vec::new();
        for (i, size) in [10usize, 3, 10, 3, 10, 3, 10].into_iter().enumerate() {
            let name = format!("file-{}.bin", i);
            let path = dir.path().join(&name);
            std::fs::write(&path, vec![i as u8; size]).unwrap();
            tasks.push(Task::transfer(
                TaskKind::Upload,
                &Entry::local(&name, size as u64, None),
                Endpoint::Local(path),
                Endpoint::Remote(ObjectLocation::new("bucket", &name)),
                Properties::default(),
            ));
        }

        let config = TransferConfig {
            concurrency: 2,
            ..small_parts()
        };
        let (exec, collector) = executor(store.clone(), config);
        run_tasks(&exec, tasks).await;

        let result = collector.finish();
        assert_eq!(result.succeeded_count, 7);
        assert_eq!(store.operations_of(OperationKind::UploadPart).len(), 12);
        assert!(store.peak_in_flight() >= 1);
        assert!(store.peak_in_flight() <= 2, "peak {}", store.peak_in_flight());
        assert_eq!(store.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn test_failed_part_aborts_upload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        let store = Arc::new(MemoryObjectStore::new());
        store.create_bucket("bucket");
        store.fail_on(OperationKind::UploadPart, "data.bin");
        let (exec, collector) = executor(
            store.clone(),
            TransferConfig {
                concurrency: 4,
                ..small_parts()
            },
        );

        run_tasks(&exec, vec![upload_task(path, 10)]).await;

        let result = collector.finish();
        assert_eq!(result.failed_count(), 1);
        assert!(store.object("bucket", "data.bin").is_none());
        assert_eq!(store.operations_of(OperationKind::AbortMultipart).len(), 1);
        assert!(store.operations_of(OperationKind::CompleteMultipart).is_empty());
        assert_eq!(store.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn test_multipart_download_is_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out/data.bin");

        let store = Arc::new(MemoryObjectStore::new());
        store.insert(
            "bucket",
            "data.bin",
            MemoryObject::new(&b"abcdefghij"[..]).with_last_modified("2014-01-09T20:45:49.000Z"),
        );
        let entry = Entry::remote(
            "data.bin",
            10,
            crate::core::entry::parse_timestamp("2014-01-09T20:45:49.000Z"),
            None,
        );
        let task = Task::transfer(
            TaskKind::Download,
            &entry,
            Endpoint::Remote(ObjectLocation::new("bucket", "data.bin")),
            Endpoint::Local(target.clone()),
            Properties::default(),
        );

        let (exec, collector) = executor(store.clone(), small_parts());
        run_tasks(&exec, vec![task]).await;

        assert_eq!(collector.finish().succeeded_count, 1);
        assert_eq!(std::fs::read(&target).unwrap(), b"abcdefghij");
        let ranges: Vec<_> = store
            .operations_of(OperationKind::GetObject)
            .into_iter()
            .map(|op| op.range.unwrap())
            .collect();
        assert_eq!(ranges.len(), 3);
        let mtime = std::fs::metadata(&target).unwrap().modified().unwrap();
        assert_eq!(
            mtime.duration_since(std::time::UNIX_EPOCH).unwrap().as_secs(),
            1389300349
        );
        // 只剩目标文件，没有临时文件
        assert_eq!(std::fs::read_dir(dir.path().join("out")).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_failed_download_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("data.bin");

        let store = Arc::new(MemoryObjectStore::new());
        store.insert("bucket", "data.bin", MemoryObject::new(&b"abcdefghij"[..]));
        store.fail_on(OperationKind::GetObject, "data.bin");
        let task = Task::transfer(
            TaskKind::Download,
            &Entry::remote("data.bin", 10, None, None),
            Endpoint::Remote(ObjectLocation::new("bucket", "data.bin")),
            Endpoint::Local(target.clone()),
            Properties::default(),
        );

        let (exec, collector) = executor(store, small_parts());
        run_tasks(&exec, vec![task]).await;

        assert_eq!(collector.finish().failed_count(), 1);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_dry_run_performs_no_io() {
        let store = Arc::new(MemoryObjectStore::new());
        store.create_bucket("bucket");
        let (exec, collector) = executor(
            store.clone(),
            TransferConfig {
                dry_run: true,
                ..small_parts()
            },
        );

        run_tasks(
            &exec,
            vec![upload_task(PathBuf::from("/does/not/exist"), 10)],
        )
        .await;

        let result = collector.finish();
        assert_eq!(result.skipped_count(), 1);
        assert_eq!(result.skipped[0].reason, SkipReason::DryRun);
        assert!(store.operations().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_before_dispatch() {
        let store = Arc::new(MemoryObjectStore::new());
        store.create_bucket("bucket");
        let (exec, collector) = executor(store.clone(), small_parts());
        exec.inner.ctx.cancel.cancel();

        run_tasks(&exec, vec![Task::delete(
            "x",
            Endpoint::Remote(ObjectLocation::new("bucket", "x")),
        )])
        .await;

        let result = collector.finish();
        assert_eq!(result.succeeded_count, 0);
        assert!(store.operations().is_empty());
    }
}
