use crate::config::SyncPath;
use crate::core::context::SyncContext;
use crate::core::entry::{parse_timestamp, Entry, Listed, SkipReason, StorageClass};
use crate::core::filter::PathFilter;
use crate::error::{SyncError, SyncResult};
use crate::storage::local::TEMP_SUFFIX;
use crate::storage::WalkItem;
use futures::stream::{BoxStream, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

/// 列举结果流，按 location 严格升序
pub type ListStream = BoxStream<'static, SyncResult<Listed>>;

const LIST_CHANNEL_SIZE: usize = 1000;

type Sender = mpsc::Sender<SyncResult<Listed>>;

/// 文件扫描器
///
/// 扫描在后台任务中进行，结果通过有界 channel 推给比较器，
/// 因此比较和传输可以在列举结束前开始。
#[derive(Debug, Clone)]
pub struct FileScanner {
    filter: Arc<PathFilter>,
    follow_links: bool,
}

impl FileScanner {
    pub fn new(filter: PathFilter, follow_links: bool) -> Self {
        Self {
            filter: Arc::new(filter),
            follow_links,
        }
    }

    pub fn scan(&self, ctx: &SyncContext, root: &SyncPath) -> ListStream {
        match root {
            SyncPath::Local(path) => self.scan_local(ctx, path.clone()),
            SyncPath::Remote { bucket, prefix } => {
                self.scan_remote(ctx, bucket.clone(), prefix.clone())
            }
        }
    }

    /// 扫描本地目录
    pub fn scan_local(&self, ctx: &SyncContext, root: PathBuf) -> ListStream {
        let (tx, rx) = mpsc::channel(LIST_CHANNEL_SIZE);
        let ctx = ctx.clone();
        let scanner = self.clone();

        tokio::spawn(async move {
            info!("开始扫描本地目录: {:?}", root);
            let mut walk = ctx.fs.walk(&root, scanner.follow_links);
            let mut count = 0usize;

            while let Some(item) = walk.next().await {
                if ctx.is_cancelled() {
                    debug!("扫描已取消: {:?}", root);
                    return;
                }
                let listed = match item {
                    Ok(item) => scanner.local_item(&ctx, &root, item).await,
                    Err(e) => {
                        let path = e.path.as_deref().unwrap_or(&root);
                        vec![Listed::Skipped {
                            location: relative_location(&root, path)
                                .unwrap_or_else(|| path.to_string_lossy().to_string()),
                            reason: SkipReason::Unreadable(e.message),
                        }]
                    }
                };
                for l in listed {
                    if matches!(l, Listed::Entry(_)) {
                        count += 1;
                    }
                    if tx.send(Ok(l)).await.is_err() {
                        return;
                    }
                }
            }
            info!("本地扫描完成: {:?}, {} 个文件", root, count);
        });

        ReceiverStream::new(rx).boxed()
    }

    async fn local_item(&self, ctx: &SyncContext, root: &Path, item: WalkItem) -> Vec<Listed> {
        if item.is_dir || (item.is_symlink && !self.follow_links) {
            return Vec::new();
        }
        let is_temp = item
            .path
            .file_name()
            .is_some_and(|n| n.to_string_lossy().ends_with(TEMP_SUFFIX));
        if is_temp {
            return Vec::new();
        }

        let Some(location) = relative_location(root, &item.path) else {
            return vec![Listed::Skipped {
                location: item.path.to_string_lossy().to_string(),
                reason: SkipReason::Unreadable("文件名不是有效的 UTF-8".to_string()),
            }];
        };
        if !self.filter.accepts(&location) {
            return Vec::new();
        }

        match ctx.fs.stat(&item.path).await {
            Err(e) => vec![Listed::Skipped {
                location,
                reason: SkipReason::Vanished(e.to_string()),
            }],
            Ok(stat) => {
                let mut out = Vec::with_capacity(2);
                if stat.modified.is_none() {
                    out.push(Listed::Warning(format!(
                        "文件 {} 的修改时间无效，按 1970-01-01 处理",
                        item.path.display()
                    )));
                }
                out.push(Listed::Entry(Entry::local(location, stat.size, stat.modified)));
                out
            }
        }
    }

    /// 扫描远程 prefix
    pub fn scan_remote(&self, ctx: &SyncContext, bucket: String, prefix: String) -> ListStream {
        let (tx, rx) = mpsc::channel(LIST_CHANNEL_SIZE);
        let ctx = ctx.clone();
        let scanner = self.clone();

        tokio::spawn(async move {
            info!("开始扫描存储: s3://{}/{}", bucket, prefix);
            let mut token: Option<String> = None;
            let mut count = 0usize;

            loop {
                if ctx.is_cancelled() {
                    debug!("扫描已取消: s3://{}/{}", bucket, prefix);
                    return;
                }
                let page = match ctx
                    .store
                    .list_objects(&bucket, &prefix, token.as_deref(), &ctx.request)
                    .await
                {
                    Ok(page) => page,
                    Err(e) => {
                        let err = SyncError::enumeration(format!(
                            "列举 s3://{}/{} 失败: {:#}",
                            bucket, prefix, e
                        ));
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                };

                for obj in page.objects {
                    for l in scanner.remote_item(&bucket, &prefix, obj) {
                        if matches!(l, Listed::Entry(_)) {
                            count += 1;
                        }
                        if tx.send(Ok(l)).await.is_err() {
                            return;
                        }
                    }
                }

                match page.next_token {
                    Some(next) => token = Some(next),
                    None => break,
                }
            }
            info!("存储扫描完成: s3://{}/{}, {} 个对象", bucket, prefix, count);
        });

        ReceiverStream::new(rx).boxed()
    }

    fn remote_item(&self, bucket: &str, prefix: &str, obj: crate::storage::ObjectInfo) -> Vec<Listed> {
        let Some(location) = obj.key.strip_prefix(prefix) else {
            return Vec::new();
        };
        // 目录占位对象
        if location.is_empty() || location.ends_with('/') {
            return Vec::new();
        }
        if !self.filter.accepts(location) {
            return Vec::new();
        }

        let mut out = Vec::with_capacity(2);
        let modified = parse_timestamp(&obj.last_modified);
        if modified.is_none() {
            out.push(Listed::Warning(format!(
                "对象 s3://{}/{} 的修改时间无法解析 ({:?})，按 1970-01-01 处理",
                bucket, obj.key, obj.last_modified
            )));
        }
        let class = obj.storage_class.as_deref().map(StorageClass::from);
        out.push(Listed::Entry(Entry::remote(location, obj.size, modified, class)));
        out
    }
}

/// 相对 root 的 `/` 分隔路径，无法表示为 UTF-8 时返回 None
fn relative_location(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts = rel
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::filter::FilterRule;
    use crate::storage::memory::{MemoryObject, MemoryObjectStore};
    use crate::storage::{LocalFileSystem, RequestContext};
    use futures::TryStreamExt;
    use tokio_util::sync::CancellationToken;

    fn context(store: Arc<MemoryObjectStore>) -> SyncContext {
        SyncContext::new(
            Arc::new(LocalFileSystem::new()),
            store,
            RequestContext::default(),
            CancellationToken::new(),
        )
    }

    fn entries(items: &[Listed]) -> Vec<String> {
        items
            .iter()
            .filter_map(|l| match l {
                Listed::Entry(e) => Some(e.location.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_scan_local_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("a/b")).unwrap();
        std::fs::write(root.join("a/b/c.txt"), b"1").unwrap();
        std::fs::write(root.join("a+b.txt"), b"12").unwrap();
        std::fs::write(root.join("z.tmp"), b"1").unwrap();
        std::fs::write(root.join(format!(".x.1234{}", TEMP_SUFFIX)), b"1").unwrap();

        let filter = PathFilter::new(&[FilterRule::Exclude("*.tmp".to_string())]).unwrap();
        let scanner = FileScanner::new(filter, true);
        let ctx = context(Arc::new(MemoryObjectStore::new()));

        let items: Vec<Listed> = scanner
            .scan(&ctx, &SyncPath::Local(root.to_path_buf()))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(entries(&items), vec!["a+b.txt", "a/b/c.txt"]);
        match &items[0] {
            Listed::Entry(e) => assert_eq!(e.size, 2),
            other => panic!("unexpected item: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_scan_local_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(dir.path().join("outside"), b"1").unwrap();
        std::fs::write(root.join("real"), b"1").unwrap();
        std::os::unix::fs::symlink(dir.path().join("outside"), root.join("link")).unwrap();

        let ctx = context(Arc::new(MemoryObjectStore::new()));

        let followed: Vec<Listed> = FileScanner::new(PathFilter::default(), true)
            .scan_local(&ctx, root.clone())
            .try_collect()
            .await
            .unwrap();
        assert_eq!(entries(&followed), vec!["link", "real"]);

        let not_followed: Vec<Listed> = FileScanner::new(PathFilter::default(), false)
            .scan_local(&ctx, root)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(entries(&not_followed), vec!["real"]);
    }

    #[tokio::test]
    async fn test_scan_remote_pages_and_markers() {
        let store = Arc::new(MemoryObjectStore::new().with_page_size(2));
        store.insert("bucket", "base/", MemoryObject::new(&b""[..]));
        store.insert("bucket", "base/a", MemoryObject::new(&b"1"[..]));
        store.insert("bucket", "base/dir/", MemoryObject::new(&b""[..]));
        store.insert(
            "bucket",
            "base/dir/b",
            MemoryObject::new(&b"22"[..]).with_storage_class("GLACIER"),
        );
        store.insert(
            "bucket",
            "base/dir/c",
            MemoryObject::new(&b"333"[..]).with_last_modified("00:00:00Z"),
        );
        store.insert("bucket", "other/x", MemoryObject::new(&b"1"[..]));

        let scanner = FileScanner::new(PathFilter::default(), true);
        let ctx = context(store.clone());
        let items: Vec<Listed> = scanner
            .scan(&ctx, &SyncPath::remote("bucket", "base"))
            .try_collect()
            .await
            .unwrap();

        assert_eq!(entries(&items), vec!["a", "dir/b", "dir/c"]);
        let glacier = items.iter().find_map(|l| match l {
            Listed::Entry(e) if e.location == "dir/b" => Some(e.clone()),
            _ => None,
        });
        assert_eq!(glacier.unwrap().storage_class, Some(StorageClass::Glacier));

        let warnings: Vec<_> = items
            .iter()
            .filter(|l| matches!(l, Listed::Warning(_)))
            .collect();
        assert_eq!(warnings.len(), 1);
        let bad = items.iter().find_map(|l| match l {
            Listed::Entry(e) if e.location == "dir/c" => Some(e.clone()),
            _ => None,
        });
        assert_eq!(bad.unwrap().modified_secs(), 0);
    }

    #[tokio::test]
    async fn test_scan_remote_list_failure_is_fatal() {
        let store = Arc::new(MemoryObjectStore::new());
        let scanner = FileScanner::new(PathFilter::default(), true);
        let ctx = context(store);

        let result: SyncResult<Vec<Listed>> = scanner
            .scan(&ctx, &SyncPath::remote("missing", ""))
            .try_collect()
            .await;
        assert!(matches!(result, Err(SyncError::Enumeration(_))));
    }
}
