//! 属性传递：决定哪些元数据、标签和特殊指令随写入请求发送

use crate::core::task::{Task, TaskKind};
use crate::error::{SyncError, SyncResult};
use crate::storage::{ObjectStore, RequestContext};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// 对象标签
pub type Tags = BTreeMap<String, String>;

/// 标签随请求头发送时的长度上限（编码后）
pub const TAG_HEADER_LIMIT: usize = 2 * 1024;

/// 可识别的属性键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PropertyKey {
    ContentType,
    CacheControl,
    ContentDisposition,
    ContentEncoding,
    ContentLanguage,
    Expires,
    /// 网站重定向目标
    WebsiteRedirect,
    StorageClass,
    Acl,
}

impl PropertyKey {
    pub const ALL: [PropertyKey; 9] = [
        PropertyKey::ContentType,
        PropertyKey::CacheControl,
        PropertyKey::ContentDisposition,
        PropertyKey::ContentEncoding,
        PropertyKey::ContentLanguage,
        PropertyKey::Expires,
        PropertyKey::WebsiteRedirect,
        PropertyKey::StorageClass,
        PropertyKey::Acl,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyKey::ContentType => "content-type",
            PropertyKey::CacheControl => "cache-control",
            PropertyKey::ContentDisposition => "content-disposition",
            PropertyKey::ContentEncoding => "content-encoding",
            PropertyKey::ContentLanguage => "content-language",
            PropertyKey::Expires => "expires",
            PropertyKey::WebsiteRedirect => "website-redirect",
            PropertyKey::StorageClass => "storage-class",
            PropertyKey::Acl => "acl",
        }
    }

    /// 仅对本次写入有效，不属于源对象的属性
    pub fn is_directive(&self) -> bool {
        matches!(self, PropertyKey::StorageClass | PropertyKey::Acl)
    }
}

impl FromStr for PropertyKey {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        PropertyKey::ALL
            .into_iter()
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| format!("未知的属性: {}", s))
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 类型化的属性集合
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub headers: BTreeMap<PropertyKey, String>,
    /// 用户元数据（x-amz-meta-*）
    pub metadata: BTreeMap<String, String>,
    pub tags: Tags,
}

impl Properties {
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty() && self.metadata.is_empty() && self.tags.is_empty()
    }

    pub fn get(&self, key: PropertyKey) -> Option<&str> {
        self.headers.get(&key).map(String::as_str)
    }

    pub fn with(mut self, key: PropertyKey, value: impl Into<String>) -> Self {
        self.headers.insert(key, value.into());
        self
    }

    /// 覆盖到 base 之上，self 中的值优先
    pub fn merged_over(&self, base: &Properties) -> Properties {
        let mut merged = base.clone();
        merged
            .headers
            .extend(self.headers.iter().map(|(k, v)| (*k, v.clone())));
        merged
            .metadata
            .extend(self.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
            .tags
            .extend(self.tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    /// 不含一次性指令的部分，用于比较源和目标
    fn comparable(&self) -> (BTreeMap<PropertyKey, String>, &BTreeMap<String, String>) {
        let headers = self
            .headers
            .iter()
            .filter(|(k, _)| !k.is_directive())
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        (headers, &self.metadata)
    }
}

/// 未知属性键的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnknownPropertyPolicy {
    /// 作为配置错误拒绝
    #[default]
    Reject,
    /// 作为用户元数据透传
    PassThrough,
}

/// 从配置构建属性集合
pub fn build_properties(
    raw: &BTreeMap<String, String>,
    metadata: &BTreeMap<String, String>,
    policy: UnknownPropertyPolicy,
) -> SyncResult<Properties> {
    let mut props = Properties {
        metadata: metadata.clone(),
        ..Default::default()
    };
    for (key, value) in raw {
        match key.parse::<PropertyKey>() {
            Ok(k) => {
                props.headers.insert(k, value.clone());
            }
            Err(e) => match policy {
                UnknownPropertyPolicy::Reject => return Err(SyncError::usage(e)),
                UnknownPropertyPolicy::PassThrough => {
                    debug!("未知属性 {} 作为元数据透传", key);
                    props.metadata.insert(key.clone(), value.clone());
                }
            },
        }
    }
    Ok(props)
}

/// 标签编码为查询串形式（与请求头中的格式一致）
pub fn encode_tags(tags: &Tags) -> String {
    tags.iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// 复制时的属性处理指令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// 由服务端从源对象复制
    Copy,
    /// 使用请求中给出的值
    Replace,
}

/// 实际随写入请求发送的属性
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingProperties {
    pub properties: Properties,
    pub metadata_directive: Directive,
    pub tagging_directive: Directive,
}

impl OutgoingProperties {
    pub fn replace(properties: Properties) -> Self {
        Self {
            properties,
            metadata_directive: Directive::Replace,
            tagging_directive: Directive::Replace,
        }
    }

    pub fn empty() -> Self {
        Self::replace(Properties::default())
    }
}

/// copy-props 模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CopyPropsMode {
    /// 不复制源对象的任何属性
    None,
    /// 复制头部属性和用户元数据
    MetadataDirective,
    /// 复制头部属性、用户元数据和标签
    #[default]
    Default,
}

impl CopyPropsMode {
    fn carries_metadata(&self) -> bool {
        !matches!(self, CopyPropsMode::None)
    }

    fn carries_tags(&self) -> bool {
        matches!(self, CopyPropsMode::Default)
    }
}

/// 准备好的属性
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedProperties {
    pub outgoing: OutgoingProperties,
    /// 超过请求头上限、需要在写入完成后单独设置的标签
    pub deferred_tags: Option<Tags>,
}

/// 属性传递器
#[derive(Debug, Clone, Copy)]
pub struct PropertyPropagator {
    mode: CopyPropsMode,
}

impl PropertyPropagator {
    pub fn new(mode: CopyPropsMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> CopyPropsMode {
        self.mode
    }

    /// 写入前是否需要先读取源对象的元数据
    pub fn needs_metadata_read(&self, task: &Task, multipart: bool) -> bool {
        is_copy(task)
            && self.mode.carries_metadata()
            && (multipart || !task.properties.headers.is_empty() || !task.properties.metadata.is_empty())
    }

    /// 写入前是否需要先读取源对象的标签
    pub fn needs_tags_read(&self, task: &Task, multipart: bool) -> bool {
        is_copy(task) && self.mode.carries_tags() && (multipart || !task.properties.tags.is_empty())
    }

    /// 计算任务写入时附带的属性，必要时先读取源对象
    pub async fn prepare(
        &self,
        task: &Task,
        multipart: bool,
        store: &dyn ObjectStore,
        ctx: &RequestContext,
    ) -> Result<PreparedProperties> {
        match task.kind {
            TaskKind::Upload => Ok(split_oversized_tags(OutgoingProperties::replace(
                task.properties.clone(),
            ))),
            TaskKind::Download | TaskKind::Delete => Ok(PreparedProperties {
                outgoing: OutgoingProperties::empty(),
                deferred_tags: None,
            }),
            TaskKind::Copy | TaskKind::MetadataCopy => {
                self.prepare_copy(task, multipart, store, ctx).await
            }
        }
    }

    async fn prepare_copy(
        &self,
        task: &Task,
        multipart: bool,
        store: &dyn ObjectStore,
        ctx: &RequestContext,
    ) -> Result<PreparedProperties> {
        let configured = &task.properties;

        if !self.mode.carries_metadata() {
            let mut props = configured.clone();
            props.tags.clear();
            return Ok(PreparedProperties {
                outgoing: OutgoingProperties::replace(props),
                deferred_tags: None,
            });
        }

        let src = task.source_remote()?;
        let mut outgoing = OutgoingProperties {
            properties: Properties::default(),
            metadata_directive: Directive::Copy,
            tagging_directive: Directive::Copy,
        };

        if self.needs_metadata_read(task, multipart) {
            debug!("读取源对象属性: {}", src);
            let source_props = store.get_properties(src, ctx).await?;
            let mut merged = configured.merged_over(&source_props);
            merged.tags.clear();
            outgoing.properties = merged;
            outgoing.metadata_directive = Directive::Replace;
        }

        if !self.mode.carries_tags() {
            outgoing.tagging_directive = Directive::Replace;
            return Ok(PreparedProperties {
                outgoing,
                deferred_tags: None,
            });
        }

        if self.needs_tags_read(task, multipart) {
            debug!("读取源对象标签: {}", src);
            let mut tags = store.get_tags(src, ctx).await?;
            tags.extend(configured.tags.iter().map(|(k, v)| (k.clone(), v.clone())));
            outgoing.properties.tags = tags;
            outgoing.tagging_directive = Directive::Replace;
            return Ok(split_oversized_tags(outgoing));
        }

        Ok(PreparedProperties {
            outgoing,
            deferred_tags: None,
        })
    }

    /// 目标对象的属性是否已与源一致（用于按需刷新属性）
    pub async fn destination_matches(
        &self,
        task: &Task,
        store: &dyn ObjectStore,
        ctx: &RequestContext,
    ) -> Result<bool> {
        let src = task.source_remote()?;
        let dst = task.destination_remote()?;

        // 与 prepare 写入的内容一致：None 模式只写配置的属性
        let expected = if self.mode.carries_metadata() {
            task.properties.merged_over(&store.get_properties(src, ctx).await?)
        } else {
            task.properties.clone()
        };
        let actual = store.get_properties(dst, ctx).await?;
        if expected.comparable() != actual.comparable() {
            return Ok(false);
        }

        if self.mode.carries_tags() {
            let mut expected_tags = store.get_tags(src, ctx).await?;
            expected_tags.extend(task.properties.tags.clone());
            if expected_tags != store.get_tags(dst, ctx).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn is_copy(task: &Task) -> bool {
    matches!(task.kind, TaskKind::Copy | TaskKind::MetadataCopy)
}

/// 标签编码后超过上限时，改为写入完成后单独设置
fn split_oversized_tags(mut outgoing: OutgoingProperties) -> PreparedProperties {
    let tags = &outgoing.properties.tags;
    if tags.is_empty() || encode_tags(tags).len() <= TAG_HEADER_LIMIT {
        return PreparedProperties {
            outgoing,
            deferred_tags: None,
        };
    }
    debug!("标签集合超过 {} 字节，改为写入后单独设置", TAG_HEADER_LIMIT);
    let deferred = std::mem::take(&mut outgoing.properties.tags);
    PreparedProperties {
        outgoing,
        deferred_tags: Some(deferred),
    }
}
