pub mod local;
pub mod memory;
pub mod s3;

use crate::core::properties::{OutgoingProperties, Properties, Tags};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};

pub use local::LocalFileSystem;
pub use memory::{MemoryObjectStore, Operation, OperationKind};
pub use s3::{S3ObjectStore, S3Settings};

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- stat, delete 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- read, write 等
pub const IO_TIMEOUT_SECS: u64 = 300;
/// 单页列表最多返回的对象数
pub const LIST_PAGE_SIZE: usize = 1000;

/// 远程对象位置
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// 随每次存储调用透传的请求上下文
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    /// 请求者付费标记（例如 "requester"）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_payer: Option<String>,
}

/// 列表返回的原始对象信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    /// 存储返回的原始时间字符串，可能无法解析
    pub last_modified: String,
    pub storage_class: Option<String>,
    pub etag: Option<String>,
}

/// 一页列表结果
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectInfo>,
    /// 下一页的续传标记，None 表示已到末尾
    pub next_token: Option<String>,
}

/// 已上传的分块
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// 对象存储抽象接口
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// 列出 prefix 下的一页对象，按 key 升序
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<&str>,
        ctx: &RequestContext,
    ) -> Result<ListPage>;

    /// 读取对象（可选字节范围，左闭右开）
    async fn get_object(
        &self,
        loc: &ObjectLocation,
        range: Option<Range<u64>>,
        ctx: &RequestContext,
    ) -> Result<Bytes>;

    async fn put_object(
        &self,
        loc: &ObjectLocation,
        body: Bytes,
        props: &OutgoingProperties,
        ctx: &RequestContext,
    ) -> Result<()>;

    /// 服务端复制
    async fn copy_object(
        &self,
        src: &ObjectLocation,
        dst: &ObjectLocation,
        props: &OutgoingProperties,
        ctx: &RequestContext,
    ) -> Result<()>;

    async fn delete_object(&self, loc: &ObjectLocation, ctx: &RequestContext) -> Result<()>;

    /// 创建分块上传，返回 upload id
    async fn create_multipart(
        &self,
        loc: &ObjectLocation,
        props: &OutgoingProperties,
        ctx: &RequestContext,
    ) -> Result<String>;

    async fn upload_part(
        &self,
        loc: &ObjectLocation,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
        ctx: &RequestContext,
    ) -> Result<CompletedPart>;

    /// 从源对象的字节范围复制一个分块
    async fn upload_part_copy(
        &self,
        src: &ObjectLocation,
        dst: &ObjectLocation,
        upload_id: &str,
        part_number: u32,
        range: Range<u64>,
        ctx: &RequestContext,
    ) -> Result<CompletedPart>;

    /// 提交分块上传，parts 必须按分块序号排序
    async fn complete_multipart(
        &self,
        loc: &ObjectLocation,
        upload_id: &str,
        parts: Vec<CompletedPart>,
        ctx: &RequestContext,
    ) -> Result<()>;

    async fn abort_multipart(
        &self,
        loc: &ObjectLocation,
        upload_id: &str,
        ctx: &RequestContext,
    ) -> Result<()>;

    /// 读取对象的头部属性和用户元数据
    async fn get_properties(&self, loc: &ObjectLocation, ctx: &RequestContext)
        -> Result<Properties>;

    async fn get_tags(&self, loc: &ObjectLocation, ctx: &RequestContext) -> Result<Tags>;

    async fn put_tags(&self, loc: &ObjectLocation, tags: &Tags, ctx: &RequestContext)
        -> Result<()>;

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;
}

/// 本地路径类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
}

/// 目录遍历产生的条目（尚未 stat）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkItem {
    pub path: PathBuf,
    pub is_dir: bool,
    pub is_symlink: bool,
}

/// 遍历错误（通常是某个子目录无法读取）
#[derive(Debug, Clone)]
pub struct WalkError {
    pub path: Option<PathBuf>,
    pub message: String,
}

/// 文件元数据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    /// 无法表示为时间戳时为 None
    pub modified: Option<DateTime<Utc>>,
}

/// 进行中的本地写入，提交前对外不可见
#[async_trait]
pub trait PendingWrite: Send {
    async fn write_at(&mut self, offset: u64, data: Bytes) -> Result<()>;

    /// 原子地移动到目标位置
    async fn commit(self: Box<Self>) -> Result<()>;

    /// 丢弃临时文件
    async fn abort(self: Box<Self>) -> Result<()>;
}

/// 本地文件系统抽象接口
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// 路径类型，不存在时返回 None
    async fn kind(&self, path: &Path) -> Result<Option<NodeKind>>;

    /// 深度优先遍历，每层子项按名称排序（目录名视为带 `/` 后缀）
    fn walk(
        &self,
        root: &Path,
        follow_links: bool,
    ) -> BoxStream<'static, std::result::Result<WalkItem, WalkError>>;

    async fn stat(&self, path: &Path) -> Result<FileStat>;

    async fn read_range(&self, path: &Path, offset: u64, length: u64) -> Result<Bytes>;

    async fn begin_write(&self, path: &Path) -> Result<Box<dyn PendingWrite>>;

    async fn set_modified(&self, path: &Path, time: DateTime<Utc>) -> Result<()>;

    async fn remove(&self, path: &Path) -> Result<()>;

    async fn create_dir_all(&self, path: &Path) -> Result<()>;
}

