use super::{
    CompletedPart, ListPage, ObjectInfo, ObjectLocation, ObjectStore, RequestContext,
    IO_TIMEOUT_SECS, LIST_PAGE_SIZE, OP_TIMEOUT_SECS,
};
use crate::core::properties::{
    encode_tags, Directive, OutgoingProperties, Properties, PropertyKey, Tags,
};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use bytes::Bytes;
use opendal::{layers::TimeoutLayer, Operator};
use s3::config::{BehaviorVersion, Credentials, Region};
use s3::error::DisplayErrorContext;
use s3::primitives::{ByteStream, DateTime, DateTimeFormat};
use s3::types::{
    CompletedMultipartUpload, MetadataDirective, ObjectCannedAcl, RequestPayer, StorageClass,
    Tag, Tagging, TaggingDirective,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::debug;

fn default_region() -> String {
    "us-east-1".to_string()
}

/// S3 连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Settings {
    #[serde(default = "default_region")]
    pub region: String,
    /// 自定义 endpoint（兼容 S3 的服务）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// 为空时使用默认凭证链
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
}

impl Default for S3Settings {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint: None,
            access_key: String::new(),
            secret_key: String::new(),
        }
    }
}

/// S3 对象存储
///
/// 读取、删除和只带常规头部的写入走 opendal；列表（含存储类别）、属性、
/// 服务端复制、原生分块上传、标签和请求者付费走 aws-sdk-s3。
pub struct S3ObjectStore {
    settings: S3Settings,
    operators: RwLock<HashMap<String, Operator>>,
    client: OnceCell<s3::Client>,
}

impl S3ObjectStore {
    pub fn new(settings: S3Settings) -> Self {
        Self {
            settings,
            operators: RwLock::new(HashMap::new()),
            client: OnceCell::new(),
        }
    }

    /// 获取（必要时创建）bucket 对应的 operator
    fn operator(&self, bucket: &str) -> Result<Operator> {
        if let Some(op) = self
            .operators
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(bucket)
        {
            return Ok(op.clone());
        }

        use opendal::services::S3;

        let mut builder = S3::default()
            .bucket(bucket)
            .region(&self.settings.region)
            .access_key_id(&self.settings.access_key)
            .secret_access_key(&self.settings.secret_key);

        if let Some(ref ep) = self.settings.endpoint {
            builder = builder.endpoint(ep);
        }

        // 添加超时层
        let operator = Operator::new(builder)?
            .layer(
                TimeoutLayer::default()
                    .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                    .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS)),
            )
            .finish();

        debug!("创建 S3 operator: {}", bucket);
        self.operators
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(bucket.to_string(), operator.clone());
        Ok(operator)
    }

    /// 首次使用时创建 SDK 客户端
    async fn client(&self) -> &s3::Client {
        self.client
            .get_or_init(|| async {
                let mut loader = aws_config::defaults(BehaviorVersion::latest())
                    .region(Region::new(self.settings.region.clone()))
                    .timeout_config(
                        aws_config::timeout::TimeoutConfig::builder()
                            .connect_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                            .operation_timeout(Duration::from_secs(IO_TIMEOUT_SECS))
                            .build(),
                    );
                if let Some(ref ep) = self.settings.endpoint {
                    loader = loader.endpoint_url(ep);
                }
                if !self.settings.access_key.is_empty() {
                    loader = loader.credentials_provider(Credentials::new(
                        &self.settings.access_key,
                        &self.settings.secret_key,
                        None,
                        None,
                        "Static",
                    ));
                }
                let sdk_config = loader.load().await;

                // 自定义 endpoint 通常不支持虚拟主机风格
                let config = s3::config::Builder::from(&sdk_config)
                    .force_path_style(self.settings.endpoint.is_some())
                    .build();
                debug!("创建 S3 客户端: region={}", self.settings.region);
                s3::Client::from_conf(config)
            })
            .await
    }

    async fn write_with_opendal(
        &self,
        loc: &ObjectLocation,
        body: Bytes,
        props: &Properties,
    ) -> Result<()> {
        let op = self.operator(&loc.bucket)?;
        let mut write = op.write_with(&loc.key, body);
        if let Some(v) = props.get(PropertyKey::ContentType) {
            write = write.content_type(v);
        }
        if let Some(v) = props.get(PropertyKey::CacheControl) {
            write = write.cache_control(v);
        }
        if let Some(v) = props.get(PropertyKey::ContentDisposition) {
            write = write.content_disposition(v);
        }
        if !props.metadata.is_empty() {
            write = write.user_metadata(props.metadata.clone());
        }
        write.await?;
        Ok(())
    }
}

/// 把属性写到 PutObject / CopyObject / CreateMultipartUpload 请求上
macro_rules! with_properties {
    ($request:expr, $props:expr) => {{
        let props: &Properties = $props;
        $request
            .set_content_type(header(props, PropertyKey::ContentType))
            .set_cache_control(header(props, PropertyKey::CacheControl))
            .set_content_disposition(header(props, PropertyKey::ContentDisposition))
            .set_content_encoding(header(props, PropertyKey::ContentEncoding))
            .set_content_language(header(props, PropertyKey::ContentLanguage))
            .set_expires(parse_expires(props)?)
            .set_website_redirect_location(header(props, PropertyKey::WebsiteRedirect))
            .set_storage_class(props.get(PropertyKey::StorageClass).map(StorageClass::from))
            .set_acl(props.get(PropertyKey::Acl).map(ObjectCannedAcl::from))
            .set_metadata(user_metadata(props))
            .set_tagging(tagging_header(&props.tags))
    }};
}

fn header(props: &Properties, key: PropertyKey) -> Option<String> {
    props.get(key).map(str::to_string)
}

fn user_metadata(props: &Properties) -> Option<HashMap<String, String>> {
    (!props.metadata.is_empty()).then(|| {
        props
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    })
}

fn tagging_header(tags: &Tags) -> Option<String> {
    (!tags.is_empty()).then(|| encode_tags(tags))
}

/// Expires 接受 HTTP 日期或 RFC 3339，无法解析时任务失败
fn parse_expires(props: &Properties) -> Result<Option<DateTime>> {
    let Some(raw) = props.get(PropertyKey::Expires) else {
        return Ok(None);
    };
    DateTime::from_str(raw, DateTimeFormat::HttpDate)
        .or_else(|_| DateTime::from_str(raw, DateTimeFormat::DateTime))
        .map(Some)
        .map_err(|e| anyhow!("无法解析 Expires 属性 {:?}: {}", raw, e))
}

/// opendal 能完整写出的属性：三种常规头部和用户元数据
fn opendal_can_carry(props: &Properties) -> bool {
    props.tags.is_empty()
        && props.headers.keys().all(|k| {
            matches!(
                k,
                PropertyKey::ContentType | PropertyKey::CacheControl | PropertyKey::ContentDisposition
            )
        })
}

fn request_payer(ctx: &RequestContext) -> Option<RequestPayer> {
    ctx.request_payer.as_deref().map(RequestPayer::from)
}

fn copy_source(src: &ObjectLocation) -> String {
    format!("{}/{}", src.bucket, urlencoding::encode(&src.key))
}

/// HTTP Range 头，区间为左闭右开
fn range_header(range: &Range<u64>) -> Result<String> {
    if range.is_empty() {
        bail!("空的读取区间: {:?}", range);
    }
    Ok(format!("bytes={}-{}", range.start, range.end - 1))
}

fn to_part_number(n: u32) -> Result<i32> {
    i32::try_from(n).map_err(|_| anyhow!("分块序号超出范围: {}", n))
}

fn s3_error<E: std::error::Error>(action: &str, target: impl fmt::Display, err: E) -> anyhow::Error {
    anyhow!("{} {} 失败: {}", action, target, DisplayErrorContext(err))
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<&str>,
        ctx: &RequestContext,
    ) -> Result<ListPage> {
        let response = self
            .client()
            .await
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .max_keys(LIST_PAGE_SIZE as i32)
            .set_continuation_token(continuation.map(str::to_string))
            .set_request_payer(request_payer(ctx))
            .send()
            .await
            .map_err(|e| s3_error("列举", format!("s3://{}/{}", bucket, prefix), e))?;

        let objects = response
            .contents()
            .iter()
            .filter_map(|obj| {
                let key = obj.key()?;
                Some(ObjectInfo {
                    key: key.to_string(),
                    size: obj.size().unwrap_or(0).max(0) as u64,
                    last_modified: obj
                        .last_modified()
                        .and_then(|t| t.fmt(DateTimeFormat::DateTime).ok())
                        .unwrap_or_default(),
                    storage_class: obj.storage_class().map(|c| c.as_str().to_string()),
                    etag: obj.e_tag().map(|s| s.trim_matches('"').to_string()),
                })
            })
            .collect();

        let next_token = match response.is_truncated() {
            Some(true) => response.next_continuation_token().map(str::to_string),
            _ => None,
        };
        Ok(ListPage {
            objects,
            next_token,
        })
    }

    async fn get_object(
        &self,
        loc: &ObjectLocation,
        range: Option<Range<u64>>,
        ctx: &RequestContext,
    ) -> Result<Bytes> {
        if ctx.request_payer.is_none() {
            let op = self.operator(&loc.bucket)?;
            let data = match range {
                Some(r) => op.read_with(&loc.key).range(r).await?,
                None => op.read(&loc.key).await?,
            };
            return Ok(Bytes::from(data.to_vec()));
        }

        let mut request = self
            .client()
            .await
            .get_object()
            .bucket(&loc.bucket)
            .key(&loc.key)
            .set_request_payer(request_payer(ctx));
        if let Some(r) = range {
            request = request.range(range_header(&r)?);
        }
        let output = request
            .send()
            .await
            .map_err(|e| s3_error("读取", loc, e))?;
        let data = output
            .body
            .collect()
            .await
            .map_err(|e| anyhow!("读取 {} 失败: {}", loc, e))?;
        Ok(data.into_bytes())
    }

    async fn put_object(
        &self,
        loc: &ObjectLocation,
        body: Bytes,
        props: &OutgoingProperties,
        ctx: &RequestContext,
    ) -> Result<()> {
        if ctx.request_payer.is_none() && opendal_can_carry(&props.properties) {
            return self.write_with_opendal(loc, body, &props.properties).await;
        }

        let request = self
            .client()
            .await
            .put_object()
            .bucket(&loc.bucket)
            .key(&loc.key)
            .body(ByteStream::from(body))
            .set_request_payer(request_payer(ctx));
        let request = with_properties!(request, &props.properties);
        request
            .send()
            .await
            .map_err(|e| s3_error("上传", loc, e))?;
        Ok(())
    }

    async fn copy_object(
        &self,
        src: &ObjectLocation,
        dst: &ObjectLocation,
        props: &OutgoingProperties,
        ctx: &RequestContext,
    ) -> Result<()> {
        let request = self
            .client()
            .await
            .copy_object()
            .bucket(&dst.bucket)
            .key(&dst.key)
            .copy_source(copy_source(src))
            .metadata_directive(match props.metadata_directive {
                Directive::Copy => MetadataDirective::Copy,
                Directive::Replace => MetadataDirective::Replace,
            })
            .tagging_directive(match props.tagging_directive {
                Directive::Copy => TaggingDirective::Copy,
                Directive::Replace => TaggingDirective::Replace,
            })
            .set_request_payer(request_payer(ctx));
        let request = with_properties!(request, &props.properties);
        request
            .send()
            .await
            .map_err(|e| s3_error("复制", dst, e))?;
        Ok(())
    }

    async fn delete_object(&self, loc: &ObjectLocation, ctx: &RequestContext) -> Result<()> {
        if ctx.request_payer.is_none() {
            // S3 删除不存在的文件不会报错
            self.operator(&loc.bucket)?.delete(&loc.key).await?;
            return Ok(());
        }
        self.client()
            .await
            .delete_object()
            .bucket(&loc.bucket)
            .key(&loc.key)
            .set_request_payer(request_payer(ctx))
            .send()
            .await
            .map_err(|e| s3_error("删除", loc, e))?;
        Ok(())
    }

    async fn create_multipart(
        &self,
        loc: &ObjectLocation,
        props: &OutgoingProperties,
        ctx: &RequestContext,
    ) -> Result<String> {
        let request = self
            .client()
            .await
            .create_multipart_upload()
            .bucket(&loc.bucket)
            .key(&loc.key)
            .set_request_payer(request_payer(ctx));
        let request = with_properties!(request, &props.properties);
        let output = request
            .send()
            .await
            .map_err(|e| s3_error("创建分块上传", loc, e))?;
        let upload_id = output
            .upload_id()
            .ok_or_else(|| anyhow!("创建分块上传 {} 未返回 upload id", loc))?;
        debug!("分块上传已创建: {} ({})", loc, upload_id);
        Ok(upload_id.to_string())
    }

    async fn upload_part(
        &self,
        loc: &ObjectLocation,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
        ctx: &RequestContext,
    ) -> Result<CompletedPart> {
        let output = self
            .client()
            .await
            .upload_part()
            .bucket(&loc.bucket)
            .key(&loc.key)
            .upload_id(upload_id)
            .part_number(to_part_number(part_number)?)
            .body(ByteStream::from(body))
            .set_request_payer(request_payer(ctx))
            .send()
            .await
            .map_err(|e| s3_error(&format!("上传分块 {}", part_number), loc, e))?;
        let etag = output
            .e_tag()
            .ok_or_else(|| anyhow!("分块 {} 未返回 ETag: {}", part_number, loc))?;
        Ok(CompletedPart {
            part_number,
            etag: etag.to_string(),
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
        let output = self
            .client()
            .await
            .upload_part_copy()
            .bucket(&dst.bucket)
            .key(&dst.key)
            .upload_id(upload_id)
            .part_number(to_part_number(part_number)?)
            .copy_source(copy_source(src))
            .copy_source_range(range_header(&range)?)
            .set_request_payer(request_payer(ctx))
            .send()
            .await
            .map_err(|e| s3_error(&format!("复制分块 {}", part_number), dst, e))?;
        let etag = output
            .copy_part_result()
            .and_then(|r| r.e_tag())
            .ok_or_else(|| anyhow!("分块 {} 未返回 ETag: {}", part_number, dst))?;
        Ok(CompletedPart {
            part_number,
            etag: etag.to_string(),
        })
    }

    async fn complete_multipart(
        &self,
        loc: &ObjectLocation,
        upload_id: &str,
        parts: Vec<CompletedPart>,
        ctx: &RequestContext,
    ) -> Result<()> {
        let parts = parts
            .into_iter()
            .map(|p| {
                Ok(s3::types::CompletedPart::builder()
                    .part_number(to_part_number(p.part_number)?)
                    .e_tag(p.etag)
                    .build())
            })
            .collect::<Result<Vec<_>>>()?;
        self.client()
            .await
            .complete_multipart_upload()
            .bucket(&loc.bucket)
            .key(&loc.key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .set_request_payer(request_payer(ctx))
            .send()
            .await
            .map_err(|e| s3_error("完成分块上传", loc, e))?;
        Ok(())
    }

    async fn abort_multipart(
        &self,
        loc: &ObjectLocation,
        upload_id: &str,
        ctx: &RequestContext,
    ) -> Result<()> {
        self.client()
            .await
            .abort_multipart_upload()
            .bucket(&loc.bucket)
            .key(&loc.key)
            .upload_id(upload_id)
            .set_request_payer(request_payer(ctx))
            .send()
            .await
            .map_err(|e| s3_error("取消分块上传", loc, e))?;
        Ok(())
    }

    async fn get_properties(
        &self,
        loc: &ObjectLocation,
        ctx: &RequestContext,
    ) -> Result<Properties> {
        let output = self
            .client()
            .await
            .head_object()
            .bucket(&loc.bucket)
            .key(&loc.key)
            .set_request_payer(request_payer(ctx))
            .send()
            .await
            .map_err(|e| s3_error("读取属性", loc, e))?;

        let mut props = Properties::default();
        let headers = [
            (PropertyKey::ContentType, output.content_type()),
            (PropertyKey::CacheControl, output.cache_control()),
            (PropertyKey::ContentDisposition, output.content_disposition()),
            (PropertyKey::ContentEncoding, output.content_encoding()),
            (PropertyKey::ContentLanguage, output.content_language()),
            (PropertyKey::Expires, output.expires_string()),
            (PropertyKey::WebsiteRedirect, output.website_redirect_location()),
            (PropertyKey::StorageClass, output.storage_class().map(|c| c.as_str())),
        ];
        for (key, value) in headers {
            if let Some(v) = value {
                props.headers.insert(key, v.to_string());
            }
        }
        if let Some(metadata) = output.metadata() {
            props.metadata = metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
        }
        Ok(props)
    }

    async fn get_tags(&self, loc: &ObjectLocation, ctx: &RequestContext) -> Result<Tags> {
        let output = self
            .client()
            .await
            .get_object_tagging()
            .bucket(&loc.bucket)
            .key(&loc.key)
            .set_request_payer(request_payer(ctx))
            .send()
            .await
            .map_err(|e| s3_error("读取标签", loc, e))?;
        Ok(output
            .tag_set()
            .iter()
            .map(|t| (t.key().to_string(), t.value().to_string()))
            .collect())
    }

    async fn put_tags(&self, loc: &ObjectLocation, tags: &Tags, ctx: &RequestContext) -> Result<()> {
        let tag_set = tags
            .iter()
            .map(|(k, v)| Ok(Tag::builder().key(k).value(v).build()?))
            .collect::<Result<Vec<_>>>()?;
        self.client()
            .await
            .put_object_tagging()
            .bucket(&loc.bucket)
            .key(&loc.key)
            .tagging(Tagging::builder().set_tag_set(Some(tag_set)).build()?)
            .set_request_payer(request_payer(ctx))
            .send()
            .await
            .map_err(|e| s3_error("设置标签", loc, e))?;
        Ok(())
    }

    fn name(&self) -> &str {
        "s3"
    }
}
