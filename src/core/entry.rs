//! 列举阶段产生的条目

use chrono::{DateTime, NaiveDateTime, Utc};
use std::fmt;

/// 条目所在的一侧
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Local,
    Remote,
}

/// 远程对象的存储类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageClass {
    Standard,
    ReducedRedundancy,
    StandardIa,
    OnezoneIa,
    IntelligentTiering,
    Glacier,
    DeepArchive,
    GlacierIr,
    Outposts,
    ExpressOnezone,
    /// 存储返回了无法识别的值
    Unknown,
}

impl StorageClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageClass::Standard => "STANDARD",
            StorageClass::ReducedRedundancy => "REDUCED_REDUNDANCY",
            StorageClass::StandardIa => "STANDARD_IA",
            StorageClass::OnezoneIa => "ONEZONE_IA",
            StorageClass::IntelligentTiering => "INTELLIGENT_TIERING",
            StorageClass::Glacier => "GLACIER",
            StorageClass::DeepArchive => "DEEP_ARCHIVE",
            StorageClass::GlacierIr => "GLACIER_IR",
            StorageClass::Outposts => "OUTPOSTS",
            StorageClass::ExpressOnezone => "EXPRESS_ONEZONE",
            StorageClass::Unknown => "UNKNOWN",
        }
    }

    /// 读取前需要先恢复（解冻）的存储类型
    pub fn is_cold(&self) -> bool {
        matches!(self, StorageClass::Glacier | StorageClass::DeepArchive)
    }
}

impl From<&str> for StorageClass {
    fn from(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "STANDARD" => StorageClass::Standard,
            "REDUCED_REDUNDANCY" => StorageClass::ReducedRedundancy,
            "STANDARD_IA" => StorageClass::StandardIa,
            "ONEZONE_IA" => StorageClass::OnezoneIa,
            "INTELLIGENT_TIERING" => StorageClass::IntelligentTiering,
            "GLACIER" => StorageClass::Glacier,
            "DEEP_ARCHIVE" => StorageClass::DeepArchive,
            "GLACIER_IR" => StorageClass::GlacierIr,
            "OUTPOSTS" => StorageClass::Outposts,
            "EXPRESS_ONEZONE" => StorageClass::ExpressOnezone,
            _ => StorageClass::Unknown,
        }
    }
}

impl fmt::Display for StorageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一个本地文件或远程对象
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// 相对同步根的路径，使用 `/` 分隔
    pub location: String,
    pub size: u64,
    /// None 表示时间无法解析或无法表示，比较时按纪元时间处理
    pub last_modified: Option<DateTime<Utc>>,
    pub storage_class: Option<StorageClass>,
    pub side: Side,
}

impl Entry {
    pub fn local(location: impl Into<String>, size: u64, modified: Option<DateTime<Utc>>) -> Self {
        Self {
            location: location.into(),
            size,
            last_modified: modified,
            storage_class: None,
            side: Side::Local,
        }
    }

    pub fn remote(
        location: impl Into<String>,
        size: u64,
        modified: Option<DateTime<Utc>>,
        storage_class: Option<StorageClass>,
    ) -> Self {
        Self {
            location: location.into(),
            size,
            last_modified: modified,
            storage_class,
            side: Side::Remote,
        }
    }

    /// 修改时间（秒），缺失时为 0
    pub fn modified_secs(&self) -> i64 {
        self.last_modified.map_or(0, |t| t.timestamp())
    }

    pub fn is_cold(&self) -> bool {
        self.storage_class.is_some_and(|c| c.is_cold())
    }
}

/// 解析存储返回的时间字符串
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.fZ")
        .ok()
        .map(|t| t.and_utc())
}

/// 跳过原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// 列目录之后文件消失或无法 stat
    Vanished(String),
    /// 目录无法读取或路径无法表示
    Unreadable(String),
    /// 冷存储对象
    ColdStorage(StorageClass),
    DryRun,
    /// 目标属性已与源一致
    PropertiesUnchanged,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Vanished(e) => write!(f, "文件不存在或无法读取 (File does not exist): {}", e),
            SkipReason::Unreadable(e) => write!(f, "无法读取: {}", e),
            SkipReason::ColdStorage(class) => write!(f, "对象存储类型为 {}", class),
            SkipReason::DryRun => write!(f, "dryrun"),
            SkipReason::PropertiesUnchanged => write!(f, "属性未变化"),
        }
    }
}

/// 列举流中的一项
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Listed {
    Entry(Entry),
    /// 该条目被跳过，不参与比较
    Skipped { location: String, reason: SkipReason },
    /// 附带的警告（条目本身仍会单独产出）
    Warning(String),
}
