//! NDR 教材批量下载器（传输引擎）。
//!
//! 读取爬取阶段生成的任务列表，按配置并发下载教材 PDF 及其附属的音视频资源，
//! 结束后写出失败记录（供 `--retry-failed` 重试）和附属资源清单。
//!
//! 代码结构（读代码入口）：
//! - `base_system`：配置/日志/中断处理等基础设施
//! - `network`：HTTP 传输层（reqwest 阻塞客户端）
//! - `transfer`：解析、限速、重试、校验与工作池

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use tracing::{error, info, warn};

mod base_system;
mod network;
#[cfg(test)]
mod testing;
mod transfer;

use base_system::config::load_or_create;
use base_system::context::Config;
use base_system::logging::{LogOptions, LogSystem};
use network::http::ReqwestTransport;
use transfer::filter::{TaskFilter, select_tasks};
use transfer::integrity::IntegrityMode;
use transfer::journal;
use transfer::models::{FailureRecord, RunSummary, Task};
use transfer::orchestrator::TaskOrchestrator;
use transfer::progress::ProgressReporter;

const EXIT_TASKS_FAILED: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "ndr-bulk-downloader")]
#[command(about = "NDR 教材批量下载器")]
struct Cli {
    /// 访问令牌（附加在每个请求的授权头中）
    #[arg(long, env = "NDR_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// 任务列表文件（默认取配置中的 tasks_file）
    #[arg(long)]
    tasks: Option<PathBuf>,

    /// 输出目录
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// 并发工作线程数
    #[arg(long)]
    workers: Option<usize>,

    /// 只下载指定学段
    #[arg(long)]
    stage: Option<String>,

    /// 只下载指定学科
    #[arg(long)]
    subject: Option<String>,

    /// 只下载指定版本
    #[arg(long = "version", id = "edition")]
    edition: Option<String>,

    /// 最多处理的任务数
    #[arg(long)]
    limit: Option<usize>,

    /// 重新下载上次失败记录中的任务
    #[arg(
        long,
        default_value_t = false,
        conflicts_with_all = ["stage", "subject", "edition", "no_teacher_books"]
    )]
    retry_failed: bool,

    /// 排除教师用书
    #[arg(long, default_value_t = false)]
    no_teacher_books: bool,

    /// 不下载音视频等附属资源
    #[arg(long, default_value_t = false)]
    no_multimedia: bool,

    /// 关闭重试
    #[arg(long, default_value_t = false)]
    no_retry: bool,

    /// 关闭限流
    #[arg(long, default_value_t = false)]
    no_ratelimit: bool,

    /// 每秒请求数上限（0 表示不限）
    #[arg(long)]
    rate_limit: Option<f64>,

    /// 已有文件的完整性校验模式
    #[arg(long, value_enum)]
    integrity_mode: Option<IntegrityMode>,

    /// 配置文件路径（默认 ./downloader.yml）
    #[arg(long)]
    config: Option<PathBuf>,

    /// 启用调试日志输出
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// 退出时保留 logs/latest.log，不打包
    #[arg(long, default_value_t = false)]
    keep_log: bool,
}

impl Cli {
    fn apply_overrides(&self, config: &mut Config) {
        if let Some(output) = &self.output {
            config.output_dir = output.to_string_lossy().into_owned();
        }
        if let Some(workers) = self.workers {
            config.max_workers = workers.max(1);
        }
        if let Some(rate) = self.rate_limit {
            config.rate_limit = rate.max(0.0);
        }
        if let Some(mode) = self.integrity_mode {
            config.integrity_mode = mode;
        }
        if self.no_ratelimit {
            config.enable_ratelimit = false;
        }
        if self.no_retry {
            config.enable_retry = false;
        }
        if self.no_multimedia {
            config.enable_multimedia = false;
        }
    }

    fn task_filter(&self) -> TaskFilter {
        TaskFilter {
            stage: self.stage.clone(),
            subject: self.subject.clone(),
            version: self.edition.clone(),
            exclude_teacher_books: self.no_teacher_books,
            limit: self.limit,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log = match init_logging(&cli) {
        Ok(log) => log,
        Err(err) => {
            eprintln!("{err:#}");
            return ExitCode::FAILURE;
        }
    };

    let code = match run(&cli, &log) {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    };
    log.safe_exit();
    code
}

fn init_logging(cli: &Cli) -> Result<LogSystem> {
    let opts = LogOptions {
        debug: cli.debug,
        archive_on_exit: !cli.keep_log,
        ..LogOptions::default()
    };
    LogSystem::init(opts).map_err(|e| anyhow!(e))
}

fn run(cli: &Cli, log: &LogSystem) -> Result<ExitCode> {
    let cancel = Arc::new(AtomicBool::new(false));
    log.install_interrupt_handler(cancel.clone())?;

    let mut config =
        load_or_create::<Config>(cli.config.as_deref()).map_err(|e| anyhow!(e.to_string()))?;
    cli.apply_overrides(&mut config);

    let token = cli.token.as_deref().map(str::trim).unwrap_or_default();
    if token.is_empty() {
        bail!("缺少访问令牌：请使用 --token 或设置环境变量 NDR_TOKEN");
    }

    let selection = select(cli, &config)?;
    if selection.tasks.is_empty() {
        warn!("没有符合条件的任务，未写入任何文件");
        return Ok(ExitCode::SUCCESS);
    }
    let tasks = selection.tasks;
    info!(
        "共 {} 个任务，{} 个工作线程，完整性校验: {}",
        tasks.len(),
        config.max_workers,
        config.integrity_mode
    );

    let output_dir = config.output_path();
    fs::create_dir_all(&output_dir)
        .with_context(|| format!("无法创建输出目录 {}", output_dir.display()))?;

    let transport = ReqwestTransport::new(&config.transport_settings(token))
        .context("初始化 HTTP 客户端失败")?;
    let orchestrator = TaskOrchestrator::new(config.engine_settings(), Arc::new(transport), cancel);

    let mut progress = ProgressReporter::new(tasks.len(), true);
    let report = orchestrator.run(tasks, &mut progress);
    progress.finish();

    let manifest_path = PathBuf::from(&config.multimedia_manifest);
    if journal::save_manifest(&manifest_path, &report.manifest)
        .with_context(|| format!("写入附属资源清单 {} 失败", manifest_path.display()))?
    {
        info!(
            "附属资源清单已保存: {} ({} 条)",
            manifest_path.display(),
            report.manifest.len()
        );
    }

    let journal_path = PathBuf::from(&config.failed_journal);
    let records = journal::carry_forward(
        report.failures,
        report.unstarted,
        &selection.previous,
        selection.deferred,
    );
    journal::save_failure_journal(&journal_path, &records)
        .with_context(|| format!("写入失败记录 {} 失败", journal_path.display()))?;

    print_summary(&report.summary, config.integrity_mode);
    if !records.is_empty() {
        warn!(
            "失败记录共 {} 条，已保存到 {}，可使用 --retry-failed 重试",
            records.len(),
            journal_path.display()
        );
    }
    if report.summary.failed > 0 {
        return Ok(ExitCode::from(EXIT_TASKS_FAILED));
    }
    Ok(ExitCode::SUCCESS)
}

/// 本次要处理的任务。重试模式下还带着失败记录：
/// `previous` 是本次选中的旧记录，`deferred` 是被数量限制截掉的旧记录。
struct Selection {
    tasks: Vec<Task>,
    previous: Vec<FailureRecord>,
    deferred: Vec<FailureRecord>,
}

fn select(cli: &Cli, config: &Config) -> Result<Selection> {
    if cli.retry_failed {
        let path = PathBuf::from(&config.failed_journal);
        let records = journal::load_failure_journal(&path).context("读取失败记录失败")?;
        info!("重试模式：从 {} 载入 {} 个失败任务", path.display(), records.len());
        let (previous, deferred) = journal::split_for_retry(records, cli.limit);
        if !deferred.is_empty() {
            info!("本次重试 {} 个，其余 {} 个留在失败记录中", previous.len(), deferred.len());
        }
        return Ok(Selection {
            tasks: previous.iter().map(|r| r.task.clone()).collect(),
            previous,
            deferred,
        });
    }

    let path = cli
        .tasks
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.tasks_file));
    let list = journal::load_task_list(&path).context("读取任务列表失败")?;
    if let Some(generated_at) = &list.generated_at {
        info!("任务列表生成于 {generated_at}");
    }
    let filter = cli.task_filter();
    let loaded = list.tasks.len();
    let tasks = select_tasks(list.tasks, &filter);
    if filter.has_content_filters() {
        info!("筛选后剩余 {}/{} 个任务", tasks.len(), loaded);
    }
    Ok(Selection {
        tasks,
        previous: Vec::new(),
        deferred: Vec::new(),
    })
}

fn print_summary(summary: &RunSummary, mode: IntegrityMode) {
    let tally = &summary.tally;
    info!("==================== 下载统计 ====================");
    info!("完整性校验模式: {mode}");
    info!("任务总数: {}", summary.total);
    info!("成功: {}", summary.success);
    info!("失败: {}", summary.failed);
    info!("跳过(已存在): {}", summary.skipped);
    info!("无可下载资源: {}", summary.no_resource);
    info!("仅有附属资源: {}", summary.secondary_only);
    info!("视频下载: {}", tally.videos_downloaded);
    info!("DRM 视频跳过: {}", tally.videos_skipped_drm);
    info!("音频下载: {}", tally.audios_downloaded);
    info!("附属资源失败: {}", tally.secondary_failed);
    info!("重试次数: {}", tally.retries);
    info!("CDN 切换: {}", tally.cdn_switches);
    info!("校验降级: {}", tally.integrity_fallbacks);
    if summary.canceled > 0 {
        info!("未开始(已中止): {}", summary.canceled);
    }
    info!("耗时: {:.1}s", summary.duration().as_secs_f64());
    info!("==================================================");
}
