use super::{FileStat, FileSystem, NodeKind, PendingWrite, WalkError, WalkItem};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use scopeguard::ScopeGuard;
use std::cmp::Ordering;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

/// 下载过程中临时文件的后缀，遍历时会被忽略
pub const TEMP_SUFFIX: &str = ".s3sync-tmp";

const WALK_CHANNEL_SIZE: usize = 256;

/// 基于 tokio 和 walkdir 的本地文件系统
#[derive(Debug, Default, Clone)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    pub fn new() -> Self {
        Self
    }
}

/// 目录名追加 `/` 后按字节排序，与 S3 列表的 key 顺序一致
fn walk_order(a: &DirEntry, b: &DirEntry, follow_links: bool) -> Ordering {
    sort_key(a, follow_links).cmp(&sort_key(b, follow_links))
}

fn sort_key(entry: &DirEntry, follow_links: bool) -> Vec<u8> {
    let mut key = entry.file_name().as_encoded_bytes().to_vec();
    // 排序时 walkdir 给出的是链接本身的类型，跟随链接时需要看目标
    let is_dir = if follow_links && entry.path_is_symlink() {
        std::fs::metadata(entry.path()).is_ok_and(|m| m.is_dir())
    } else {
        entry.file_type().is_dir()
    };
    if is_dir {
        key.push(b'/');
    }
    key
}

fn system_time_to_utc(time: SystemTime) -> Option<DateTime<Utc>> {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => DateTime::from_timestamp(i64::try_from(d.as_secs()).ok()?, d.subsec_nanos()),
        Err(e) => {
            let d = e.duration();
            let secs = i64::try_from(d.as_secs()).ok()?;
            // 纪元之前的时间按整秒向下取
            if d.subsec_nanos() == 0 {
                DateTime::from_timestamp(-secs, 0)
            } else {
                DateTime::from_timestamp(-secs - 1, 1_000_000_000 - d.subsec_nanos())
            }
        }
    }
}

fn remove_quietly(path: PathBuf) {
    if let Err(e) = std::fs::remove_file(&path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("清理临时文件失败 {:?}: {}", path, e);
        }
    }
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn kind(&self, path: &Path) -> Result<Option<NodeKind>> {
        match fs::metadata(path).await {
            Ok(m) if m.is_dir() => Ok(Some(NodeKind::Directory)),
            Ok(_) => Ok(Some(NodeKind::File)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn walk(&self, root: &Path, follow_links: bool) -> BoxStream<'static, Result<WalkItem, WalkError>> {
        let (tx, rx) = mpsc::channel(WALK_CHANNEL_SIZE);
        let root = root.to_path_buf();

        // 使用 spawn_blocking 避免阻塞 async runtime
        tokio::task::spawn_blocking(move || {
            let walker = WalkDir::new(&root)
                .min_depth(1)
                .follow_links(follow_links)
                .sort_by(move |a, b| walk_order(a, b, follow_links));

            for entry in walker {
                let item = entry
                    .map(|e| WalkItem {
                        is_dir: e.file_type().is_dir(),
                        is_symlink: e.path_is_symlink(),
                        path: e.into_path(),
                    })
                    .map_err(|e| WalkError {
                        path: e.path().map(Path::to_path_buf),
                        message: e.to_string(),
                    });
                if tx.blocking_send(item).is_err() {
                    debug!("遍历被提前终止: {:?}", root);
                    break;
                }
            }
        });

        ReceiverStream::new(rx).boxed()
    }

    async fn stat(&self, path: &Path) -> Result<FileStat> {
        let metadata = fs::metadata(path).await?;
        let modified = metadata.modified().ok().and_then(system_time_to_utc);
        Ok(FileStat {
            size: metadata.len(),
            modified,
        })
    }

    async fn read_range(&self, path: &Path, offset: u64, length: u64) -> Result<Bytes> {
        let mut file = fs::File::open(path).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buffer = Vec::with_capacity(length as usize);
        file.take(length).read_to_end(&mut buffer).await?;
        if (buffer.len() as u64) < length {
            return Err(anyhow!(
                "文件在读取过程中被截断: {:?} (offset {}, 期望 {} 字节, 实际 {} 字节)",
                path,
                offset,
                length,
                buffer.len()
            ));
        }
        Ok(Bytes::from(buffer))
    }

    async fn begin_write(&self, path: &Path) -> Result<Box<dyn PendingWrite>> {
        let parent = path
            .parent()
            .ok_or_else(|| anyhow!("目标路径没有父目录: {:?}", path))?;
        let name = path
            .file_name()
            .ok_or_else(|| anyhow!("目标路径没有文件名: {:?}", path))?
            .to_string_lossy();
        fs::create_dir_all(parent).await?;

        let id = uuid::Uuid::new_v4().simple().to_string();
        let temp_path = parent.join(format!(".{}.{}{}", name, &id[..8], TEMP_SUFFIX));
        let file = fs::File::create(&temp_path).await?;
        let guard = scopeguard::guard(temp_path, remove_quietly as fn(PathBuf));

        Ok(Box::new(LocalPendingWrite {
            file,
            temp: guard,
            target: path.to_path_buf(),
        }))
    }

    async fn set_modified(&self, path: &Path, time: DateTime<Utc>) -> Result<()> {
        let path = path.to_path_buf();
        let time = SystemTime::from(time);
        tokio::task::spawn_blocking(move || -> Result<()> {
            let file = std::fs::OpenOptions::new().write(true).open(&path)?;
            file.set_modified(time)?;
            Ok(())
        })
        .await?
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).await?;
        Ok(())
    }
}

/// 写入目标旁边的临时文件，提交时原子重命名
struct LocalPendingWrite {
    file: fs::File,
    /// drop 时删除临时文件，提交成功后解除
    temp: ScopeGuard<PathBuf, fn(PathBuf)>,
    target: PathBuf,
}

#[async_trait]
impl PendingWrite for LocalPendingWrite {
    async fn write_at(&mut self, offset: u64, data: Bytes) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(&data).await?;
        self.file.flush().await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let LocalPendingWrite {
            mut file,
            temp,
            target,
        } = *self;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&*temp, &target).await?;
        ScopeGuard::into_inner(temp);
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        let LocalPendingWrite { file, temp, .. } = *self;
        drop(file);
        let path = ScopeGuard::into_inner(temp);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use futures::TryStreamExt;

    fn relative(root: &Path, items: Vec<WalkItem>) -> Vec<String> {
        items
            .into_iter()
            .map(|i| {
                i.path
                    .strip_prefix(root)
                    .unwrap()
                    .to_string_lossy()
                    .replace('\\', "/")
            })
            .collect()
    }

    #[tokio::test]
    async fn test_walk_matches_s3_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("a")).unwrap();
        std::fs::write(root.join("a/x"), b"1").unwrap();
        std::fs::write(root.join("a-b"), b"1").unwrap();
        std::fs::write(root.join("a.txt"), b"1").unwrap();

        let fs = LocalFileSystem::new();
        let items: Vec<WalkItem> = fs.walk(root, true).try_collect().await.unwrap();
        let files: Vec<WalkItem> = items.into_iter().filter(|i| !i.is_dir).collect();

        // '-' (0x2d) < '.' (0x2e) < '/' (0x2f)
        assert_eq!(relative(root, files), vec!["a-b", "a.txt", "a/x"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_walk_orders_symlinked_dir_as_dir() {
        let dir = tempfile::tempdir().unwrap();
        let outside = dir.path().join("outside");
        let root = dir.path().join("root");
        std::fs::create_dir_all(&outside).unwrap();
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(outside.join("x"), b"1").unwrap();
        std::os::unix::fs::symlink(&outside, root.join("a")).unwrap();
        std::fs::write(root.join("a-b"), b"1").unwrap();

        let fs = LocalFileSystem::new();
        let items: Vec<WalkItem> = fs.walk(&root, true).try_collect().await.unwrap();
        let files: Vec<WalkItem> = items.into_iter().filter(|i| !i.is_dir).collect();
        assert_eq!(relative(&root, files), vec!["a-b", "a/x"]);

        // 不跟随时链接本身按文件排序
        let items: Vec<WalkItem> = fs.walk(&root, false).try_collect().await.unwrap();
        assert_eq!(relative(&root, items), vec!["a", "a-b"]);
    }

    #[tokio::test]
    async fn test_pending_write_commit_and_abort() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("sub/file.bin");
        let fs = LocalFileSystem::new();

        let mut write = fs.begin_write(&target).await.unwrap();
        write.write_at(3, Bytes::from_static(b"def")).await.unwrap();
        write.write_at(0, Bytes::from_static(b"abc")).await.unwrap();
        assert!(!target.exists());
        write.commit().await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"abcdef");

        let aborted = dir.path().join("sub/other.bin");
        let mut write = fs.begin_write(&aborted).await.unwrap();
        write.write_at(0, Bytes::from_static(b"x")).await.unwrap();
        write.abort().await.unwrap();
        assert!(!aborted.exists());

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("sub"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(leftovers, vec!["file.bin"]);
    }

    #[tokio::test]
    async fn test_dropped_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFileSystem::new();
        {
            let mut write = fs.begin_write(&dir.path().join("f")).await.unwrap();
            write.write_at(0, Bytes::from_static(b"x")).await.unwrap();
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_set_modified_and_stat() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello").unwrap();

        let fs = LocalFileSystem::new();
        let time = Utc.with_ymd_and_hms(2014, 1, 9, 20, 45, 49).unwrap();
        fs.set_modified(&path, time).await.unwrap();

        let stat = fs.stat(&path).await.unwrap();
        assert_eq!(stat.size, 5);
        assert_eq!(stat.modified.unwrap().timestamp(), time.timestamp());
    }

    #[tokio::test]
    async fn test_read_range_and_kind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"0123456789").unwrap();

        let fs = LocalFileSystem::new();
        assert_eq!(&fs.read_range(&path, 2, 3).await.unwrap()[..], b"234");
        assert!(fs.read_range(&path, 8, 5).await.is_err());
        assert_eq!(fs.kind(&path).await.unwrap(), Some(NodeKind::File));
        assert_eq!(fs.kind(dir.path()).await.unwrap(), Some(NodeKind::Directory));
        assert_eq!(fs.kind(&dir.path().join("missing")).await.unwrap(), None);
        fs.remove(&dir.path().join("missing")).await.unwrap();
    }

    #[test]
    fn test_pre_epoch_time() {
        let t = UNIX_EPOCH - std::time::Duration::from_millis(1500);
        let utc = system_time_to_utc(t).unwrap();
        assert_eq!(utc.timestamp(), -2);
        assert_eq!(utc.timestamp_subsec_millis(), 500);
    }
}
