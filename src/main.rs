use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser};
use s3sync_lib::core::{
    describe_outcome, CopyPropsMode, FilterRule, MetadataRefresh, SkipReason, Task,
};
use s3sync_lib::logging::{LogConfig, SizeRotatingWriter};
use s3sync_lib::storage::{LocalFileSystem, S3ObjectStore};
use s3sync_lib::{ExitClass, RunConfig, SyncEngine, SyncError, SyncPath, TaskObserver, TaskOutcome};
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// 在本地目录和 S3 bucket 之间增量同步
#[derive(Parser)]
#[command(name = "s3sync", author, version, about, long_about = None)]
struct Cli {
    /// 源路径（本地目录或 s3://bucket/prefix）
    source: Option<String>,

    /// 目标路径（本地目录或 s3://bucket/prefix）
    destination: Option<String>,

    /// JSON 配置文件，命令行参数会覆盖其中的值
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// 删除目标端独有的文件
    #[arg(long)]
    delete: bool,

    /// 只删除，不传输（需同时指定 --delete）
    #[arg(long)]
    delete_only: bool,

    /// 只打印将要执行的操作
    #[arg(long)]
    dryrun: bool,

    /// 只比较大小
    #[arg(long)]
    size_only: bool,

    /// 下载时要求时间完全一致
    #[arg(long)]
    exact_timestamps: bool,

    /// 传输冷存储对象
    #[arg(long)]
    force_glacier_transfer: bool,

    /// 不提示冷存储对象
    #[arg(long)]
    ignore_glacier_warnings: bool,

    /// 排除匹配的路径（可多次指定，与 --include 按出现顺序生效）
    #[arg(long, value_name = "PATTERN")]
    exclude: Vec<String>,

    /// 重新包含匹配的路径
    #[arg(long, value_name = "PATTERN")]
    include: Vec<String>,

    /// 属性复制模式: none, metadata-directive, default
    #[arg(long, value_name = "MODE", value_parser = parse_kebab::<CopyPropsMode>)]
    copy_props: Option<CopyPropsMode>,

    /// 目标已一致时的属性刷新: never, always, when-different
    #[arg(long, value_name = "MODE", value_parser = parse_kebab::<MetadataRefresh>)]
    metadata_refresh: Option<MetadataRefresh>,

    /// 请求者付费，例如 requester
    #[arg(long, value_name = "PAYER")]
    request_payer: Option<String>,

    /// 并发数
    #[arg(long)]
    concurrency: Option<usize>,

    /// 不跟随符号链接
    #[arg(long)]
    no_follow_symlinks: bool,

    /// 输出调试日志
    #[arg(short, long)]
    verbose: bool,
}

fn parse_kebab<T: DeserializeOwned>(raw: &str) -> Result<T, String> {
    serde_json::from_value(serde_json::Value::String(raw.to_string())).map_err(|e| e.to_string())
}

/// 按命令行中出现的顺序合并 --include / --exclude
fn filter_rules(matches: &ArgMatches) -> Vec<FilterRule> {
    let mut indexed: Vec<(usize, FilterRule)> = Vec::new();
    for (id, make) in [
        ("exclude", FilterRule::Exclude as fn(String) -> FilterRule),
        ("include", FilterRule::Include as fn(String) -> FilterRule),
    ] {
        if let (Some(values), Some(indices)) = (
            matches.get_many::<String>(id),
            matches.indices_of(id),
        ) {
            indexed.extend(indices.zip(values.map(|v| make(v.clone()))));
        }
    }
    indexed.sort_by_key(|(i, _)| *i);
    indexed.into_iter().map(|(_, rule)| rule).collect()
}

fn build_config(cli: Cli, rules: Vec<FilterRule>) -> Result<RunConfig, SyncError> {
    let parse = |raw: &str| raw.parse::<SyncPath>();
    let mut config = match (&cli.config, &cli.source, &cli.destination) {
        (Some(path), _, _) => RunConfig::load(path)?,
        (None, Some(src), Some(dst)) => RunConfig::new(parse(src)?, parse(dst)?),
        _ => {
            return Err(SyncError::usage(
                "需要指定源和目标路径，或者通过 --config 提供配置文件",
            ))
        }
    };

    if let (Some(src), Some(dst)) = (&cli.source, &cli.destination) {
        config.source = parse(src)?;
        config.destination = parse(dst)?;
    }
    config.delete |= cli.delete;
    config.delete_only |= cli.delete_only;
    config.dry_run |= cli.dryrun;
    config.size_only |= cli.size_only;
    config.exact_timestamps |= cli.exact_timestamps;
    config.force_cold_transfer |= cli.force_glacier_transfer;
    config.suppress_cold_warnings |= cli.ignore_glacier_warnings;
    if cli.no_follow_symlinks {
        config.follow_symlinks = false;
    }
    config.filters.extend(rules);
    if let Some(mode) = cli.copy_props {
        config.copy_props = mode;
    }
    if let Some(refresh) = cli.metadata_refresh {
        config.metadata_refresh = refresh;
    }
    if cli.request_payer.is_some() {
        config.request_payer = cli.request_payer;
    }
    if let Some(n) = cli.concurrency {
        config.concurrency = n;
    }
    if cli.verbose {
        config.log.level = "debug".to_string();
    }
    Ok(config)
}

/// 初始化日志系统：控制台输出到 stderr，可选写入日志文件
fn init_logging(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},opendal=warn", config.tracing_level())));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let file_layer = config.file_directory().and_then(|dir| {
        match SizeRotatingWriter::new(dir, config.max_size_mb) {
            Ok(writer) => Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(false),
            ),
            Err(e) => {
                eprintln!("无法创建日志文件 {}: {}", dir.display(), e);
                None
            }
        }
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();
}

/// 每个任务输出一行
struct ConsoleObserver;

impl TaskObserver for ConsoleObserver {
    fn on_task_complete(&self, task: &Task, outcome: &TaskOutcome) {
        let line = describe_outcome(task, outcome);
        match outcome {
            TaskOutcome::Failed(_) => eprintln!("{}", line),
            TaskOutcome::Skipped(reason) if *reason != SkipReason::DryRun => {}
            _ => println!("{}", line),
        }
    }
}

#[tokio::main]
async fn main() {
    let matches = match Cli::command().try_get_matches() {
        Ok(m) => m,
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => {
            let _ = e.print();
            std::process::exit(ExitClass::UsageError.exit_code());
        }
    };
    let rules = filter_rules(&matches);
    let cli = match Cli::from_arg_matches(&matches) {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            std::process::exit(ExitClass::UsageError.exit_code());
        }
    };

    let config = match build_config(cli, rules) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(ExitClass::UsageError.exit_code());
        }
    };
    init_logging(&config.log);

    let store = Arc::new(S3ObjectStore::new(config.s3.clone()));
    let engine = SyncEngine::new(config, Arc::new(LocalFileSystem::new()), store)
        .with_observer(Arc::new(ConsoleObserver));

    let cancel = engine.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("正在取消，等待进行中的传输完成...");
            cancel.cancel();
        }
    });

    let result = engine.run().await;

    for warning in &result.warnings {
        eprintln!("warning: {}", warning);
    }
    if let Some(fatal) = &result.fatal {
        eprintln!("fatal error: {}", fatal);
    }
    if !result.failed.is_empty() {
        eprintln!("{} 个任务失败:", result.failed.len());
        for item in &result.failed {
            eprintln!("  {}: {}", item.location, item.message);
        }
    }

    std::process::exit(result.exit_class().exit_code());
}
