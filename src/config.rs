//! 运行配置模块

use crate::core::comparator::CompareConfig;
use crate::core::filter::{FilterRule, PathFilter};
use crate::core::gate::ColdStoragePolicy;
use crate::core::properties::{build_properties, CopyPropsMode, Properties, UnknownPropertyPolicy};
use crate::core::task::{Direction, Endpoint, MetadataRefresh};
use crate::core::transfer::TransferConfig;
use crate::error::{SyncError, SyncResult};
use crate::logging::LogConfig;
use crate::storage::{ObjectLocation, RequestContext, S3Settings};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

const S3_SCHEME: &str = "s3://";

/// 同步的一端：本地目录或 `s3://bucket/prefix`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SyncPath {
    Local(PathBuf),
    Remote {
        bucket: String,
        /// 为空或以 `/` 结尾
        prefix: String,
    },
}

/// 访问点 ARN 形式的 bucket
fn access_point_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<bucket>arn:aws[a-z\-]*:s3[a-z\-]*:[a-z\-0-9]*:[0-9]{12}:accesspoint[:/][^/]+)/?(?P<key>.*)$").ok()
    })
    .as_ref()
}

impl SyncPath {
    pub fn remote(bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }
        SyncPath::Remote {
            bucket: bucket.into(),
            prefix,
        }
    }

    /// 相对路径在这一端对应的位置
    pub fn endpoint(&self, location: &str) -> Endpoint {
        match self {
            SyncPath::Local(root) => {
                let mut path = root.clone();
                path.extend(location.split('/').filter(|s| !s.is_empty()));
                Endpoint::Local(path)
            }
            SyncPath::Remote { bucket, prefix } => {
                Endpoint::Remote(ObjectLocation::new(bucket.clone(), format!("{}{}", prefix, location)))
            }
        }
    }
}

impl FromStr for SyncPath {
    type Err = SyncError;

    fn from_str(s: &str) -> SyncResult<Self> {
        let Some(rest) = s.strip_prefix(S3_SCHEME) else {
            if s.is_empty() {
                return Err(SyncError::usage("路径不能为空"));
            }
            return Ok(SyncPath::Local(PathBuf::from(s)));
        };

        if let Some(caps) = access_point_regex().and_then(|re| re.captures(rest)) {
            return Ok(SyncPath::remote(&caps["bucket"], &caps["key"]));
        }

        let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(SyncError::usage(format!("无效的 S3 路径（缺少 bucket）: {}", s)));
        }
        Ok(SyncPath::remote(bucket, prefix))
    }
}

impl TryFrom<String> for SyncPath {
    type Error = SyncError;

    fn try_from(s: String) -> SyncResult<Self> {
        s.parse()
    }
}

impl From<SyncPath> for String {
    fn from(p: SyncPath) -> Self {
        p.to_string()
    }
}

impl fmt::Display for SyncPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncPath::Local(p) => write!(f, "{}", p.display()),
            SyncPath::Remote { bucket, prefix } => write!(f, "{}{}/{}", S3_SCHEME, bucket, prefix),
        }
    }
}

fn default_concurrency() -> usize {
    10
}

fn default_part_size() -> u64 {
    8 * 1024 * 1024 // 8MB
}

fn default_multipart_threshold() -> u64 {
    8 * 1024 * 1024 // 8MB
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    2000
}

fn default_follow_symlinks() -> bool {
    true
}

/// 一次同步运行的完整配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    pub source: SyncPath,
    pub destination: SyncPath,
    /// 删除目标端独有的条目
    #[serde(default)]
    pub delete: bool,
    /// 只执行删除，不传输（需同时开启 delete）
    #[serde(default)]
    pub delete_only: bool,
    #[serde(default)]
    pub force_cold_transfer: bool,
    #[serde(default)]
    pub suppress_cold_warnings: bool,
    #[serde(default)]
    pub size_only: bool,
    #[serde(default)]
    pub exact_timestamps: bool,
    #[serde(default)]
    pub copy_props: CopyPropsMode,
    #[serde(default)]
    pub metadata_refresh: MetadataRefresh,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_payer: Option<String>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_part_size")]
    pub part_size: u64,
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 重试基础延迟（毫秒）
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_follow_symlinks")]
    pub follow_symlinks: bool,
    #[serde(default)]
    pub filters: Vec<FilterRule>,
    /// 写入时附带的属性，例如 `{"content-type": "text/plain"}`
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// 用户元数据
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub unknown_properties: UnknownPropertyPolicy,
    #[serde(default)]
    pub s3: S3Settings,
    #[serde(default)]
    pub log: LogConfig,
}

impl RunConfig {
    pub fn new(source: SyncPath, destination: SyncPath) -> Self {
        Self {
            source,
            destination,
            delete: false,
            delete_only: false,
            force_cold_transfer: false,
            suppress_cold_warnings: false,
            size_only: false,
            exact_timestamps: false,
            copy_props: CopyPropsMode::default(),
            metadata_refresh: MetadataRefresh::default(),
            request_payer: None,
            concurrency: default_concurrency(),
            part_size: default_part_size(),
            multipart_threshold: default_multipart_threshold(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            dry_run: false,
            follow_symlinks: default_follow_symlinks(),
            filters: Vec::new(),
            properties: BTreeMap::new(),
            metadata: BTreeMap::new(),
            tags: BTreeMap::new(),
            unknown_properties: UnknownPropertyPolicy::default(),
            s3: S3Settings::default(),
            log: LogConfig::default(),
        }
    }

    /// 从 JSON 配置文件加载
    pub fn load(path: &Path) -> SyncResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| SyncError::usage(format!("读取配置文件 {} 失败: {}", path.display(), e)))?;
        serde_json::from_str(&content)
            .map_err(|e| SyncError::usage(format!("解析配置文件 {} 失败: {}", path.display(), e)))
    }

    /// 检查参数组合并推导同步方向
    pub fn validate(&self) -> SyncResult<Direction> {
        if self.concurrency == 0 {
            return Err(SyncError::usage("concurrency 必须大于 0"));
        }
        if self.part_size == 0 {
            return Err(SyncError::usage("partSize 必须大于 0"));
        }
        if self.delete_only && !self.delete {
            return Err(SyncError::usage("deleteOnly 需要同时开启 delete"));
        }
        if self.source == self.destination {
            return Err(SyncError::usage(format!(
                "源和目标相同: {}",
                self.source
            )));
        }
        match (&self.source, &self.destination) {
            (SyncPath::Local(_), SyncPath::Remote { .. }) => Ok(Direction::Upload),
            (SyncPath::Remote { .. }, SyncPath::Local(_)) => Ok(Direction::Download),
            (SyncPath::Remote { .. }, SyncPath::Remote { .. }) => Ok(Direction::BucketToBucket),
            (SyncPath::Local(_), SyncPath::Local(_)) => Err(SyncError::usage(
                "源和目标至少有一端必须是 s3:// 路径",
            )),
        }
    }

    pub fn request_context(&self) -> RequestContext {
        RequestContext {
            request_payer: self.request_payer.clone(),
        }
    }

    pub fn compare_config(&self) -> CompareConfig {
        CompareConfig {
            size_only: self.size_only,
            exact_timestamps: self.exact_timestamps,
            delete: self.delete,
            delete_only: self.delete_only,
            metadata_refresh: self.metadata_refresh,
        }
    }

    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            concurrency: self.concurrency,
            multipart_threshold: self.multipart_threshold,
            part_size: self.part_size,
            max_retries: self.max_retries,
            retry_base_delay_ms: self.retry_base_delay_ms,
            dry_run: self.dry_run,
            metadata_refresh: self.metadata_refresh,
        }
    }

    pub fn cold_storage_policy(&self) -> ColdStoragePolicy {
        ColdStoragePolicy::from_flags(self.force_cold_transfer, self.suppress_cold_warnings)
    }

    /// 配置中给出的属性（未知键按 unknown_properties 处理）
    pub fn configured_properties(&self) -> SyncResult<Properties> {
        let mut props = build_properties(&self.properties, &self.metadata, self.unknown_properties)?;
        props.tags = self.tags.clone();
        Ok(props)
    }

    pub fn path_filter(&self) -> SyncResult<PathFilter> {
        PathFilter::new(&self.filters)
    }
}
