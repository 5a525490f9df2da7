//! 批量下载调度：固定大小的工作线程池、逐任务的解析→下载→校验流程、结果汇总。
//!
//! 工作线程之间不共享可变状态：每个任务的结果（含重试、CDN 切换等计数）
//! 通过通道发回主线程，由主线程单点汇总统计、失败记录和附属资源清单。

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel as channel;
use tracing::{debug, error, info, warn};

use super::cdn::CdnResolver;
use super::fetcher::{FetchReport, RetryPolicy, RetryingFetcher};
use super::integrity::{IntegrityMode, IntegrityOracle};
use super::models::{
    FailureRecord, ManifestEntry, ResourceKind, RunSummary, SecondaryResource, Task, TaskReport,
    TaskTally, TransferOutcome, format_size,
};
use super::paths::PathLayout;
use super::progress::{ConsoleGate, ProgressReporter};
use super::rate_limiter::RateLimiter;
use super::resolver::{ResolverSettings, ResourceResolver, is_bundle};
use crate::network::http::HttpTransport;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub workers: usize,
    /// 每秒请求数，0 表示不限流。
    pub rate_limit: f64,
    pub retry: RetryPolicy,
    pub integrity_mode: IntegrityMode,
    pub check_timeout: Duration,
    pub cdn_nodes: Vec<String>,
    pub resolver: ResolverSettings,
    pub layout: PathLayout,
}

/// 一次运行的全部产出。
#[derive(Debug, Default)]
pub struct RunReport {
    pub summary: RunSummary,
    /// 按完成顺序排列。
    pub failures: Vec<FailureRecord>,
    pub manifest: Vec<ManifestEntry>,
    /// 因取消而没有开始的任务，保持输入顺序。
    pub unstarted: Vec<Task>,
}

pub struct TaskOrchestrator {
    workers: usize,
    mode: IntegrityMode,
    layout: PathLayout,
    oracle: Arc<IntegrityOracle>,
    resolver: ResourceResolver,
    fetcher: RetryingFetcher,
    cancel: Arc<AtomicBool>,
}

impl TaskOrchestrator {
    pub fn new(
        settings: EngineSettings,
        transport: Arc<dyn HttpTransport>,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(settings.rate_limit));
        let oracle = Arc::new(IntegrityOracle::new(
            settings.integrity_mode,
            transport.clone(),
            settings.check_timeout,
        ));
        let resolver = ResourceResolver::new(transport.clone(), limiter.clone(), settings.resolver);
        let fetcher = RetryingFetcher::new(
            transport,
            limiter,
            oracle.clone(),
            CdnResolver::new(settings.cdn_nodes),
            settings.retry,
        );
        Self {
            workers: settings.workers.max(1),
            mode: settings.integrity_mode,
            layout: settings.layout,
            oracle,
            resolver,
            fetcher,
            cancel,
        }
    }

    fn canceled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// 处理全部任务并返回汇总。单个任务的任何错误（包括 panic）都只影响该任务。
    ///
    /// 取消信号置位后不再开始新任务，已开始的任务照常完成；未开始的任务计入 `canceled`，
    /// 并原样放进 `unstarted`。
    pub fn run(&self, tasks: Vec<Task>, progress: &mut ProgressReporter) -> RunReport {
        let total = tasks.len();
        let mut report = RunReport {
            summary: RunSummary::started(total),
            ..RunReport::default()
        };
        if total == 0 {
            report.summary.finish();
            return report;
        }

        let workers = self.workers.min(total);
        info!(
            "开始批量下载：{} 个任务，{} 个线程，完整性检查 {}",
            total, workers, self.mode
        );

        let (task_tx, task_rx) = channel::bounded::<(usize, Task)>(workers);
        let (report_tx, report_rx) = channel::unbounded::<TaskReport>();
        let (skip_tx, skip_rx) = channel::unbounded::<(usize, Task)>();
        let console = progress.console();

        thread::scope(|scope| {
            let feeder_skip = skip_tx.clone();
            let feeder = thread::Builder::new()
                .name("task-feeder".to_string())
                .spawn_scoped(scope, move || {
                    let mut pending = tasks.into_iter().enumerate();
                    for item in pending.by_ref() {
                        if self.canceled() {
                            let _ = feeder_skip.send(item);
                            break;
                        }
                        if let Err(channel::SendError(item)) = task_tx.send(item) {
                            let _ = feeder_skip.send(item);
                            break;
                        }
                    }
                    for item in pending {
                        let _ = feeder_skip.send(item);
                    }
                });
            if let Err(e) = feeder {
                error!("无法启动任务分发线程: {e}");
            }

            for idx in 0..workers {
                let rx = task_rx.clone();
                let tx = report_tx.clone();
                let skip = skip_tx.clone();
                let console = console.clone();
                let spawned = thread::Builder::new()
                    .name(format!("worker-{}", idx + 1))
                    .spawn_scoped(scope, move || {
                        for (pos, task) in rx.iter() {
                            if self.canceled() {
                                let _ = skip.send((pos, task));
                                continue;
                            }
                            if tx.send(self.process_guarded(task, &console)).is_err() {
                                return;
                            }
                        }
                    });
                if let Err(e) = spawned {
                    error!("无法启动下载线程 worker-{}: {e}", idx + 1);
                }
            }
            drop(task_rx);
            drop(report_tx);
            drop(skip_tx);

            for task_report in report_rx.iter() {
                self.aggregate(&mut report, task_report, progress);
            }
        });

        let mut unstarted: Vec<(usize, Task)> = skip_rx.try_iter().collect();
        unstarted.sort_by_key(|(pos, _)| *pos);
        report.unstarted = unstarted.into_iter().map(|(_, task)| task).collect();

        let summary = &mut report.summary;
        summary.canceled = summary.total.saturating_sub(summary.completed());
        summary.finish();
        if summary.canceled > 0 {
            warn!("下载已中止，{} 个任务未开始", summary.canceled);
        }
        report
    }

    fn aggregate(
        &self,
        report: &mut RunReport,
        task_report: TaskReport,
        progress: &mut ProgressReporter,
    ) {
        progress.record(&task_report.outcome);
        report.summary.absorb(&task_report);
        if let Some(failure) = task_report.failure {
            progress.suspend(|| {
                warn!(task_id = %failure.task.id, "任务失败: {}", failure.error);
            });
            report.failures.push(failure);
        }
        if let Some(entry) = task_report.manifest {
            report.manifest.push(entry);
        }
    }

    fn process_guarded(&self, task: Task, console: &ConsoleGate) -> TaskReport {
        match panic::catch_unwind(AssertUnwindSafe(|| self.process(&task, console))) {
            Ok(report) => report,
            Err(payload) => {
                let detail = panic_payload_to_string(payload);
                console.suspend(|| error!(task_id = %task.id, "处理任务时发生 panic: {detail}"));
                let error = format!("处理任务失败 (panic): {detail}");
                let mut report = TaskReport::new(
                    task.clone(),
                    TransferOutcome::Failed {
                        last_error: error.clone(),
                    },
                );
                report.failure = Some(FailureRecord {
                    task,
                    error,
                    last_attempted_url: None,
                });
                report
            }
        }
    }

    fn process(&self, task: &Task, console: &ConsoleGate) -> TaskReport {
        let destination = self.layout.primary_path(task);
        let bundle = is_bundle(task);

        // strict 模式需要源地址才能比对大小，只能先解析
        let needs_secondary = bundle && self.resolver.fetches_secondary();
        if self.mode != IntegrityMode::Strict && !needs_secondary && destination.exists() {
            let verdict = self.oracle.check(&destination, None);
            if verdict.complete {
                debug!(task_id = %task.id, "文件已存在且完整，跳过: {}", destination.display());
                return TaskReport::new(
                    task.clone(),
                    TransferOutcome::Skipped {
                        reason: verdict.reason,
                    },
                );
            }
        }

        let resolution = self.resolver.resolve(task);
        for warning in &resolution.warnings {
            console.suspend(|| warn!(task_id = %task.id, "{warning}"));
        }

        let mut tally = TaskTally {
            videos_skipped_drm: resolution.drm_videos() as u64,
            ..TaskTally::default()
        };
        let discovered = !resolution.secondary.is_empty();
        if discovered {
            console.suspend(|| {
                info!(
                    task_id = %task.id,
                    "发现 {} 个多媒体资源: {}",
                    resolution.secondary.total(),
                    task.title()
                )
            });
        }

        let mut report = match &resolution.primary_url {
            None => {
                let reason = resolution
                    .failure
                    .clone()
                    .unwrap_or_else(|| "未找到PDF资源".to_string());
                console.suspend(|| warn!(task_id = %task.id, "{reason}: {}", task.title()));
                let mut report =
                    TaskReport::new(task.clone(), TransferOutcome::NoResource { reason });
                report.secondary_only = discovered;
                report
            }
            Some(url) => {
                let fetch = self.fetcher.transfer(url, &destination, task.referer());
                absorb_fetch(&mut tally, &fetch);
                log_fetch(console, &task.id, &destination, &fetch);
                // 专题课程里的文档在所有节点上都不存在，视同未解析到主资源
                if bundle && fetch.missing_everywhere() {
                    let reason = format!("专题课程PDF不存在: {}", fetch.last_url);
                    console.suspend(|| warn!(task_id = %task.id, "{reason}"));
                    let mut report =
                        TaskReport::new(task.clone(), TransferOutcome::NoResource { reason });
                    report.secondary_only = discovered;
                    report
                } else {
                    let mut report = TaskReport::new(task.clone(), fetch.outcome.clone());
                    if let TransferOutcome::Failed { last_error } = &fetch.outcome {
                        report.failure = Some(FailureRecord {
                            task: task.clone(),
                            error: last_error.clone(),
                            last_attempted_url: Some(fetch.last_url.clone()),
                        });
                    }
                    report
                }
            }
        };

        if discovered {
            let found = &resolution.secondary;
            self.fetch_secondaries(task, &found.videos, ResourceKind::Video, &mut tally, console);
            self.fetch_secondaries(task, &found.audios, ResourceKind::Audio, &mut tally, console);
            self.fetch_secondaries(task, &found.images, ResourceKind::Image, &mut tally, console);
            report.manifest = Some(ManifestEntry {
                task: task.clone(),
                multimedia: resolution.secondary,
            });
        }

        report.tally = tally;
        report
    }

    /// 附属资源逐个独立下载，失败只记数，不影响任务本身的结果。
    fn fetch_secondaries(
        &self,
        task: &Task,
        resources: &[SecondaryResource],
        kind: ResourceKind,
        tally: &mut TaskTally,
        console: &ConsoleGate,
    ) {
        for (idx, resource) in resources.iter().enumerate() {
            let index = idx + 1;
            if kind == ResourceKind::Video {
                if resource.has_drm {
                    console.suspend(|| {
                        warn!(task_id = %task.id, "跳过DRM加密视频: {}", resource.title)
                    });
                    continue;
                }
                if resource.format != "mp4" {
                    debug!(task_id = %task.id, "流媒体视频只记录不下载: {}", resource.title);
                    continue;
                }
            }

            let destination = self.layout.secondary_path(task, kind, resource, index);
            let fetch = self
                .fetcher
                .transfer(&resource.url, &destination, task.referer());
            absorb_fetch(tally, &fetch);
            let label = format!("{}_{}_{index}", task.id, kind_tag(kind));
            log_fetch(console, &label, &destination, &fetch);

            if fetch.outcome.is_obtained() {
                match kind {
                    ResourceKind::Video => tally.videos_downloaded += 1,
                    ResourceKind::Audio => tally.audios_downloaded += 1,
                    _ => {}
                }
            } else {
                tally.secondary_failed += 1;
            }
        }
    }
}

fn kind_tag(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Document => "document",
        ResourceKind::Video => "video",
        ResourceKind::Audio => "audio",
        ResourceKind::Image => "image",
    }
}

fn absorb_fetch(tally: &mut TaskTally, fetch: &FetchReport) {
    tally.retries += fetch.retries;
    tally.integrity_fallbacks += fetch.integrity_fallbacks;
    if fetch.cdn_switch.is_some() {
        tally.cdn_switches += 1;
    }
}

fn log_fetch(console: &ConsoleGate, task_id: &str, destination: &Path, fetch: &FetchReport) {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    for failure in &fetch.failures {
        debug!(
            task_id,
            url = %failure.url,
            attempt = failure.attempt + 1,
            "下载尝试失败: {}",
            failure.error
        );
    }
    console.suspend(|| {
        if let Some(switch) = &fetch.cdn_switch {
            info!(task_id, url = %switch.to, "CDN 切换成功: {} -> {}", switch.from, switch.to);
        }
        match &fetch.outcome {
            TransferOutcome::Success { bytes_written } => {
                info!(task_id, "下载成功: {name} ({})", format_size(*bytes_written));
            }
            TransferOutcome::Skipped { reason } => {
                debug!(task_id, "文件已存在且完整，跳过: {name} ({reason})");
            }
            TransferOutcome::Failed { last_error } => {
                warn!(task_id, url = %fetch.last_url, "下载失败: {name}: {last_error}");
            }
            TransferOutcome::NoResource { reason } => {
                warn!(task_id, "无可用资源: {name}: {reason}");
            }
        }
    });
}

fn panic_payload_to_string(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic payload".to_string()
}
