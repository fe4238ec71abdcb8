//! 内存对象存储，记录收到的每一次调用，主要用于测试

use super::{CompletedPart, ListPage, ObjectInfo, ObjectLocation, ObjectStore, RequestContext};
use crate::core::properties::{Directive, OutgoingProperties, Properties, PropertyKey, Tags};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

const DEFAULT_PAGE_SIZE: usize = 1000;

fn format_time(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// 内存中的一个对象
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryObject {
    pub data: Bytes,
    /// 列表中返回的原始时间字符串
    pub last_modified: String,
    pub storage_class: Option<String>,
    pub properties: Properties,
    pub tags: Tags,
}

impl MemoryObject {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            last_modified: format_time(Utc::now()),
            storage_class: None,
            properties: Properties::default(),
            tags: Tags::new(),
        }
    }

    pub fn with_last_modified(mut self, raw: impl Into<String>) -> Self {
        self.last_modified = raw.into();
        self
    }

    pub fn with_storage_class(mut self, class: impl Into<String>) -> Self {
        self.storage_class = Some(class.into());
        self
    }

    pub fn with_header(mut self, key: PropertyKey, value: impl Into<String>) -> Self {
        self.properties.headers.insert(key, value.into());
        self
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.properties.metadata = metadata;
        self
    }

    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }

    fn written(data: Bytes, props: &Properties, tags: Tags) -> Self {
        Self {
            data,
            last_modified: format_time(Utc::now()),
            storage_class: props.get(PropertyKey::StorageClass).map(str::to_string),
            properties: Properties {
                tags: Tags::new(),
                ..props.clone()
            },
            tags,
        }
    }
}

/// 调用类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    ListObjects,
    GetObject,
    PutObject,
    CopyObject,
    DeleteObject,
    CreateMultipart,
    UploadPart,
    UploadPartCopy,
    CompleteMultipart,
    AbortMultipart,
    GetProperties,
    GetTags,
    PutTags,
}

/// 一次调用的记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub kind: OperationKind,
    pub bucket: String,
    /// 列表调用时为 prefix
    pub key: String,
    pub source: Option<ObjectLocation>,
    pub part_number: Option<u32>,
    pub range: Option<Range<u64>>,
    pub properties: Option<OutgoingProperties>,
    pub tags: Option<Tags>,
    pub request_payer: Option<String>,
}

impl Operation {
    fn new(kind: OperationKind, bucket: &str, key: &str, ctx: &RequestContext) -> Self {
        Self {
            kind,
            bucket: bucket.to_string(),
            key: key.to_string(),
            source: None,
            part_number: None,
            range: None,
            properties: None,
            tags: None,
            request_payer: ctx.request_payer.clone(),
        }
    }
}

#[derive(Debug)]
struct PendingUpload {
    location: ObjectLocation,
    props: OutgoingProperties,
    parts: BTreeMap<u32, Bytes>,
}

type Buckets = BTreeMap<String, BTreeMap<String, MemoryObject>>;

/// 内存对象存储
#[derive(Debug)]
pub struct MemoryObjectStore {
    buckets: RwLock<Buckets>,
    uploads: Mutex<HashMap<String, PendingUpload>>,
    operations: Mutex<Vec<Operation>>,
    failures: Mutex<HashSet<(OperationKind, String)>>,
    page_size: usize,
    /// 每次调用的模拟耗时
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            buckets: RwLock::new(BTreeMap::new()),
            uploads: Mutex::new(HashMap::new()),
            operations: Mutex::new(Vec::new()),
            failures: Mutex::new(HashSet::new()),
            page_size: DEFAULT_PAGE_SIZE,
            latency: None,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// 每页最多返回的对象数
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// 每次调用额外等待一段时间，便于观察并发
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// 同时进行中的调用数的最大值
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn read_buckets(&self) -> RwLockReadGuard<'_, Buckets> {
        self.buckets.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_buckets(&self) -> RwLockWriteGuard<'_, Buckets> {
        self.buckets.write().unwrap_or_else(|e| e.into_inner())
    }

    fn uploads(&self) -> MutexGuard<'_, HashMap<String, PendingUpload>> {
        self.uploads.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn log(&self) -> MutexGuard<'_, Vec<Operation>> {
        self.operations.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn create_bucket(&self, bucket: &str) {
        self.write_buckets().entry(bucket.to_string()).or_default();
    }

    pub fn insert(&self, bucket: &str, key: &str, object: MemoryObject) {
        self.write_buckets()
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), object);
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<MemoryObject> {
        self.read_buckets().get(bucket)?.get(key).cloned()
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.read_buckets()
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.log().clone()
    }

    /// 除列表外的调用类型，按调用顺序
    pub fn operation_kinds(&self) -> Vec<OperationKind> {
        self.log()
            .iter()
            .map(|op| op.kind)
            .filter(|k| *k != OperationKind::ListObjects)
            .collect()
    }

    pub fn operations_of(&self, kind: OperationKind) -> Vec<Operation> {
        self.log().iter().filter(|op| op.kind == kind).cloned().collect()
    }

    pub fn clear_operations(&self) {
        self.log().clear();
    }

    /// 未提交也未取消的分块上传数
    pub fn pending_uploads(&self) -> usize {
        self.uploads().len()
    }

    /// 对指定 key 的某类调用总是失败
    pub fn fail_on(&self, kind: OperationKind, key: &str) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((kind, key.to_string()));
    }

    /// 记录一次调用；返回的守卫在调用结束前计入并发数
    async fn record(&self, op: Operation) -> Result<InFlight<'_>> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let busy = InFlight(&self.in_flight);
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);

        let injected = self
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&(op.kind, op.key.clone()));
        let kind = op.kind;
        let key = op.key.clone();
        self.log().push(op);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if injected {
            bail!("InternalError: 模拟的 {:?} 失败: {}", kind, key);
        }
        Ok(busy)
    }

    fn get(&self, loc: &ObjectLocation) -> Result<MemoryObject> {
        let buckets = self.read_buckets();
        let objects = buckets
            .get(&loc.bucket)
            .ok_or_else(|| anyhow!("NoSuchBucket: {}", loc.bucket))?;
        objects
            .get(&loc.key)
            .cloned()
            .ok_or_else(|| anyhow!("NoSuchKey: {}", loc))
    }

    fn put(&self, loc: &ObjectLocation, object: MemoryObject) -> Result<()> {
        let mut buckets = self.write_buckets();
        let objects = buckets
            .get_mut(&loc.bucket)
            .ok_or_else(|| anyhow!("NoSuchBucket: {}", loc.bucket))?;
        objects.insert(loc.key.clone(), object);
        Ok(())
    }

    fn take_upload(&self, upload_id: &str) -> Result<PendingUpload> {
        self.uploads()
            .remove(upload_id)
            .ok_or_else(|| anyhow!("NoSuchUpload: {}", upload_id))
    }

    fn with_upload<T>(&self, upload_id: &str, f: impl FnOnce(&mut PendingUpload) -> T) -> Result<T> {
        let mut uploads = self.uploads();
        let upload = uploads
            .get_mut(upload_id)
            .ok_or_else(|| anyhow!("NoSuchUpload: {}", upload_id))?;
        Ok(f(upload))
    }
}

fn slice(data: &Bytes, range: &Range<u64>) -> Result<Bytes> {
    let len = data.len() as u64;
    if range.start > range.end || range.end > len {
        bail!("InvalidRange: {:?} (对象大小 {})", range, len);
    }
    Ok(data.slice(range.start as usize..range.end as usize))
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<&str>,
        ctx: &RequestContext,
    ) -> Result<ListPage> {
        let _busy = self
            .record(Operation::new(OperationKind::ListObjects, bucket, prefix, ctx))
            .await?;

        let buckets = self.read_buckets();
        let objects = buckets
            .get(bucket)
            .ok_or_else(|| anyhow!("NoSuchBucket: {}", bucket))?;

        let mut matching = objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .filter(|(k, _)| continuation.map_or(true, |token| k.as_str() > token));

        let page: Vec<ObjectInfo> = matching
            .by_ref()
            .take(self.page_size)
            .map(|(k, o)| ObjectInfo {
                key: k.clone(),
                size: o.data.len() as u64,
                last_modified: o.last_modified.clone(),
                storage_class: o.storage_class.clone(),
                etag: None,
            })
            .collect();

        let next_token = if matching.next().is_some() {
            page.last().map(|o| o.key.clone())
        } else {
            None
        };
        Ok(ListPage {
            objects: page,
            next_token,
        })
    }

    async fn get_object(
        &self,
        loc: &ObjectLocation,
        range: Option<Range<u64>>,
        ctx: &RequestContext,
    ) -> Result<Bytes> {
        let mut op = Operation::new(OperationKind::GetObject, &loc.bucket, &loc.key, ctx);
        op.range = range.clone();
        let _busy = self.record(op).await?;

        let object = self.get(loc)?;
        match range {
            Some(r) => slice(&object.data, &r),
            None => Ok(object.data),
        }
    }

    async fn put_object(
        &self,
        loc: &ObjectLocation,
        body: Bytes,
        props: &OutgoingProperties,
        ctx: &RequestContext,
    ) -> Result<()> {
        let mut op = Operation::new(OperationKind::PutObject, &loc.bucket, &loc.key, ctx);
        op.properties = Some(props.clone());
        let _busy = self.record(op).await?;

        let tags = props.properties.tags.clone();
        self.put(loc, MemoryObject::written(body, &props.properties, tags))
    }

    async fn copy_object(
        &self,
        src: &ObjectLocation,
        dst: &ObjectLocation,
        props: &OutgoingProperties,
        ctx: &RequestContext,
    ) -> Result<()> {
        let mut op = Operation::new(OperationKind::CopyObject, &dst.bucket, &dst.key, ctx);
        op.source = Some(src.clone());
        op.properties = Some(props.clone());
        let _busy = self.record(op).await?;

        let source = self.get(src)?;
        let properties = match props.metadata_directive {
            Directive::Copy => source.properties.clone(),
            Directive::Replace => props.properties.clone(),
        };
        let tags = match props.tagging_directive {
            Directive::Copy => source.tags.clone(),
            Directive::Replace => props.properties.tags.clone(),
        };
        self.put(dst, MemoryObject::written(source.data, &properties, tags))
    }

    async fn delete_object(&self, loc: &ObjectLocation, ctx: &RequestContext) -> Result<()> {
        let _busy = self
            .record(Operation::new(
                OperationKind::DeleteObject,
                &loc.bucket,
                &loc.key,
                ctx,
            ))
            .await?;
        if let Some(objects) = self.write_buckets().get_mut(&loc.bucket) {
            objects.remove(&loc.key);
        }
        Ok(())
    }

    async fn create_multipart(
        &self,
        loc: &ObjectLocation,
        props: &OutgoingProperties,
        ctx: &RequestContext,
    ) -> Result<String> {
        let mut op = Operation::new(OperationKind::CreateMultipart, &loc.bucket, &loc.key, ctx);
        op.properties = Some(props.clone());
        let _busy = self.record(op).await?;

        if !self.read_buckets().contains_key(&loc.bucket) {
            bail!("NoSuchBucket: {}", loc.bucket);
        }
        let upload_id = uuid::Uuid::new_v4().to_string();
        self.uploads().insert(
            upload_id.clone(),
            PendingUpload {
                location: loc.clone(),
                props: props.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        loc: &ObjectLocation,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
        ctx: &RequestContext,
    ) -> Result<CompletedPart> {
        let mut op = Operation::new(OperationKind::UploadPart, &loc.bucket, &loc.key, ctx);
        op.part_number = Some(part_number);
        let _busy = self.record(op).await?;

        self.with_upload(upload_id, |u| u.parts.insert(part_number, body))?;
        Ok(CompletedPart {
            part_number,
            etag: format!("etag-{}", part_number),
        })
    }

    async fn upload_part_copy(
        &self,
        src: &ObjectLocation,
        dst: &ObjectLocation,
        upload_id: &str,
        part_number: u32,
        range: Range<u64>,
        ctx: &RequestContext,
    ) -> Result<CompletedPart> {
        let mut op = Operation::new(OperationKind::UploadPartCopy, &dst.bucket, &dst.key, ctx);
        op.source = Some(src.clone());
        op.part_number = Some(part_number);
        op.range = Some(range.clone());
        let _busy = self.record(op).await?;

        let data = slice(&self.get(src)?.data, &range)?;
        self.with_upload(upload_id, |u| u.parts.insert(part_number, data))?;
        Ok(CompletedPart {
            part_number,
            etag: format!("etag-{}", part_number),
        })
    }

    async fn complete_multipart(
        &self,
        loc: &ObjectLocation,
        upload_id: &str,
        parts: Vec<CompletedPart>,
        ctx: &RequestContext,
    ) -> Result<()> {
        let _busy = self
            .record(Operation::new(
                OperationKind::CompleteMultipart,
                &loc.bucket,
                &loc.key,
                ctx,
            ))
            .await?;

        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            bail!("InvalidPartOrder: {}", loc);
        }
        let upload = self.take_upload(upload_id)?;
        if upload.location != *loc {
            bail!("NoSuchUpload: {} 不属于 {}", upload_id, loc);
        }

        let mut data = BytesMut::new();
        for part in &parts {
            let body = upload
                .parts
                .get(&part.part_number)
                .ok_or_else(|| anyhow!("InvalidPart: {}", part.part_number))?;
            data.extend_from_slice(body);
        }

        let tags = upload.props.properties.tags.clone();
        self.put(
            loc,
            MemoryObject::written(data.freeze(), &upload.props.properties, tags),
        )
    }

    async fn abort_multipart(
        &self,
        loc: &ObjectLocation,
        upload_id: &str,
        ctx: &RequestContext,
    ) -> Result<()> {
        let _busy = self
            .record(Operation::new(
                OperationKind::AbortMultipart,
                &loc.bucket,
                &loc.key,
                ctx,
            ))
            .await?;
        self.take_upload(upload_id)?;
        Ok(())
    }

    async fn get_properties(
        &self,
        loc: &ObjectLocation,
        ctx: &RequestContext,
    ) -> Result<Properties> {
        let _busy = self
            .record(Operation::new(
                OperationKind::GetProperties,
                &loc.bucket,
                &loc.key,
                ctx,
            ))
            .await?;
        Ok(self.get(loc)?.properties)
    }

    async fn get_tags(&self, loc: &ObjectLocation, ctx: &RequestContext) -> Result<Tags> {
        let _busy = self
            .record(Operation::new(OperationKind::GetTags, &loc.bucket, &loc.key, ctx))
            .await?;
        Ok(self.get(loc)?.tags)
    }

    async fn put_tags(&self, loc: &ObjectLocation, tags: &Tags, ctx: &RequestContext) -> Result<()> {
        let mut op = Operation::new(OperationKind::PutTags, &loc.bucket, &loc.key, ctx);
        op.tags = Some(tags.clone());
        let _busy = self.record(op).await?;

        let mut buckets = self.write_buckets();
        let object = buckets
            .get_mut(&loc.bucket)
            .and_then(|objects| objects.get_mut(&loc.key))
            .ok_or_else(|| anyhow!("NoSuchKey: {}", loc))?;
        object.tags = tags.clone();
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
