//! 批量下载的 CLI 进度条。

use std::io::IsTerminal;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use super::models::TransferOutcome;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressCounts {
    pub done: u64,
    pub success: u64,
    pub failed: u64,
    pub skipped: u64,
    pub no_resource: u64,
}

/// 进度条的共享句柄：工作线程借它输出日志，避免与进度条交错。
#[derive(Clone, Default)]
pub struct ConsoleGate {
    bar: Option<ProgressBar>,
}

impl ConsoleGate {
    pub fn suspend<R>(&self, f: impl FnOnce() -> R) -> R {
        match &self.bar {
            Some(bar) => bar.suspend(f),
            None => f(),
        }
    }
}

pub struct ProgressReporter {
    counts: ProgressCounts,
    bar: Option<ProgressBar>,
}

impl ProgressReporter {
    /// `visible` 为真且 stderr 是终端时才绘制进度条。
    pub fn new(total: usize, visible: bool) -> Self {
        let bar = (visible && std::io::stderr().is_terminal()).then(|| {
            let style = ProgressStyle::with_template(
                "{prefix} [{elapsed_precise}] {wide_bar} {pos}/{len} ({eta}) {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");
            let bar = ProgressBar::with_draw_target(Some(total as u64), ProgressDrawTarget::stderr());
            bar.set_style(style);
            bar.set_prefix("下载进度");
            bar
        });
        Self {
            counts: ProgressCounts::default(),
            bar,
        }
    }

    #[cfg(test)]
    pub fn hidden() -> Self {
        Self {
            counts: ProgressCounts::default(),
            bar: None,
        }
    }

    #[cfg(test)]
    pub fn counts(&self) -> ProgressCounts {
        self.counts
    }

    pub fn record(&mut self, outcome: &TransferOutcome) {
        self.counts.done += 1;
        match outcome {
            TransferOutcome::Success { .. } => self.counts.success += 1,
            TransferOutcome::Failed { .. } => self.counts.failed += 1,
            TransferOutcome::Skipped { .. } => self.counts.skipped += 1,
            TransferOutcome::NoResource { .. } => self.counts.no_resource += 1,
        }
        if let Some(bar) = &self.bar {
            bar.set_message(format!(
                "成功 {} | 失败 {} | 跳过 {}",
                self.counts.success,
                self.counts.failed,
                self.counts.skipped + self.counts.no_resource
            ));
            bar.inc(1);
        }
    }

    pub fn console(&self) -> ConsoleGate {
        ConsoleGate {
            bar: self.bar.clone(),
        }
    }

    /// 进度条绘制期间输出日志，避免两者在终端里交错。
    pub fn suspend<R>(&self, f: impl FnOnce() -> R) -> R {
        self.console().suspend(f)
    }

    pub fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.finish();
    }
}
