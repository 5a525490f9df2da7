//! 日志系统：控制台 + `logs/latest.log` 双输出，退出时把日志打包为 zip。
//!
//! 同时负责 Ctrl-C：第一次只置位取消标志，让进行中的下载收尾；第二次立即退出。

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::{panic, thread, time::Duration};

use time::OffsetDateTime;
use time::macros::format_description;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::{self, WorkerGuard};
use tracing_appender::rolling;
use tracing_subscriber::Layer;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use zip::CompressionMethod;
use zip::write::FileOptions;

const LATEST_LOG: &str = "latest.log";
const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;
const ARCHIVE_WAIT_MS: u64 = 200;
/// 第二次 Ctrl-C 的退出码（128 + SIGINT）。
pub const INTERRUPT_EXIT_CODE: i32 = 130;

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("日志系统已初始化")]
    AlreadyInitialized,
    #[error("初始化日志订阅器失败: {0}")]
    SubscriberInit(#[from] tracing_subscriber::util::TryInitError),
    #[error("日志文件读写失败: {0}")]
    Io(#[from] io::Error),
    #[error("日志打包失败: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("时间格式化失败: {0}")]
    Time(#[from] time::error::Format),
    #[error("注册中断处理失败: {0}")]
    Signal(#[from] ctrlc::Error),
}

#[derive(Clone, Debug)]
pub struct LogOptions {
    pub debug: bool,
    pub use_color: bool,
    pub archive_on_exit: bool,
    pub logs_dir: PathBuf,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            debug: false,
            use_color: true,
            archive_on_exit: true,
            logs_dir: PathBuf::from("logs"),
        }
    }
}

pub struct LogSystem {
    runtime: Arc<LogRuntime>,
}

impl LogSystem {
    pub fn init(options: LogOptions) -> Result<Self, LogError> {
        let logs_dir = options.logs_dir.clone();
        fs::create_dir_all(&logs_dir)?;
        let latest_log = logs_dir.join(LATEST_LOG);
        archive_if_large(&latest_log, &logs_dir)?;

        let (file_writer, guard) = non_blocking::NonBlockingBuilder::default()
            .lossy(false)
            .finish(rolling::never(&logs_dir, LATEST_LOG));

        let console_level = if options.debug {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        };
        let console_layer = fmt::layer()
            .with_target(false)
            .with_level(true)
            .with_thread_names(true)
            .with_ansi(options.use_color)
            .with_writer(io::stdout)
            .with_filter(console_level);
        let file_layer = fmt::layer()
            .with_target(false)
            .with_level(true)
            .with_thread_names(true)
            .with_ansi(false)
            .with_writer(file_writer)
            .with_filter(LevelFilter::DEBUG);

        tracing_subscriber::registry()
            .with(console_layer)
            .with(file_layer)
            .try_init()
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("global subscriber") || msg.contains("already") {
                    LogError::AlreadyInitialized
                } else {
                    LogError::SubscriberInit(e)
                }
            })?;

        let runtime = Arc::new(LogRuntime {
            logs_dir,
            latest_log,
            guard: Mutex::new(Some(guard)),
            exit_called: AtomicBool::new(false),
            archive_on_exit: options.archive_on_exit,
        });
        install_panic_hook();

        Ok(Self { runtime })
    }

    /// 注册 Ctrl-C 处理：第一次置位 `cancel`，第二次收尾日志后以 130 退出。
    pub fn install_interrupt_handler(&self, cancel: Arc<AtomicBool>) -> Result<(), LogError> {
        let runtime = Arc::clone(&self.runtime);
        let presses = AtomicU32::new(0);
        ctrlc::set_handler(move || {
            if presses.fetch_add(1, Ordering::SeqCst) == 0 {
                cancel.store(true, Ordering::SeqCst);
                warn!("收到中断信号：不再开始新任务，等待进行中的下载完成（再按一次立即退出）");
                return;
            }
            warn!("再次收到中断信号，立即退出");
            runtime.safe_exit();
            std::process::exit(INTERRUPT_EXIT_CODE);
        })?;
        Ok(())
    }

    pub fn safe_exit(&self) {
        self.runtime.safe_exit();
    }
}

impl Drop for LogSystem {
    fn drop(&mut self) {
        self.runtime.safe_exit();
    }
}

struct LogRuntime {
    logs_dir: PathBuf,
    latest_log: PathBuf,
    guard: Mutex<Option<WorkerGuard>>,
    exit_called: AtomicBool,
    archive_on_exit: bool,
}

impl LogRuntime {
    fn safe_exit(&self) {
        if self.exit_called.swap(true, Ordering::SeqCst) {
            return;
        }
        // 丢弃 guard 会把缓冲中的日志全部写盘
        if let Ok(mut guard) = self.guard.lock() {
            guard.take();
        }
        if !self.archive_on_exit {
            return;
        }
        thread::sleep(Duration::from_millis(ARCHIVE_WAIT_MS));
        if let Err(err) = archive_log_file(&self.latest_log, &self.logs_dir) {
            eprintln!("日志打包失败: {err}");
        }
    }
}

// 任务内的 panic 会被调度器拦截，这里只负责记进日志，不结束进程。
fn install_panic_hook() {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        let thread = thread::current();
        let name = thread.name().unwrap_or("unnamed");
        match info.location() {
            Some(location) => error!(
                "线程 {name} panic at {}:{}: {info}",
                location.file(),
                location.line()
            ),
            None => error!("线程 {name} panic: {info}"),
        }
        previous(info);
    }));
}

fn archive_if_large(latest_log: &Path, logs_dir: &Path) -> Result<(), LogError> {
    if let Ok(meta) = fs::metadata(latest_log)
        && meta.len() >= MAX_LOG_BYTES
    {
        archive_log_file(latest_log, logs_dir)?;
    }
    Ok(())
}

fn archive_log_file(latest_log: &Path, logs_dir: &Path) -> Result<Option<PathBuf>, LogError> {
    let meta = match fs::metadata(latest_log) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if meta.len() == 0 {
        let _ = fs::remove_file(latest_log);
        return Ok(None);
    }

    let timestamp = OffsetDateTime::now_utc().format(format_description!(
        "[year][month][day]_[hour][minute][second]"
    ))?;
    let mut archive_path = logs_dir.join(format!("log_{timestamp}.zip"));
    let mut seq = 1;
    while archive_path.exists() {
        archive_path = logs_dir.join(format!("log_{timestamp}_{seq}.zip"));
        seq += 1;
    }

    let mut zip = zip::ZipWriter::new(File::create(&archive_path)?);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    zip.start_file(format!("{timestamp}.log"), options)?;
    io::copy(&mut File::open(latest_log)?, &mut zip)?;
    zip.finish()?;

    let _ = fs::remove_file(latest_log);
    info!("日志已打包: {}", archive_path.display());
    Ok(Some(archive_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn archive_packs_log_and_removes_original() {
        let dir = tempfile::tempdir().unwrap();
        let latest = dir.path().join(LATEST_LOG);
        fs::write(&latest, "INFO 下载成功\n").unwrap();

        let archive = archive_log_file(&latest, dir.path()).unwrap().unwrap();
        assert!(!latest.exists());
        assert_eq!(archive.extension().and_then(|e| e.to_str()), Some("zip"));

        let mut zip = zip::ZipArchive::new(File::open(&archive).unwrap()).unwrap();
        assert_eq!(zip.len(), 1);
        let mut text = String::new();
        zip.by_index(0).unwrap().read_to_string(&mut text).unwrap();
        assert_eq!(text, "INFO 下载成功\n");

        // 同一秒内再次打包不覆盖已有归档
        fs::write(&latest, "second\n").unwrap();
        let again = archive_log_file(&latest, dir.path()).unwrap().unwrap();
        assert_ne!(again, archive);
    }

    #[test]
    fn empty_or_missing_logs_are_not_archived() {
        let dir = tempfile::tempdir().unwrap();
        let latest = dir.path().join(LATEST_LOG);
        assert!(archive_log_file(&latest, dir.path()).unwrap().is_none());
        fs::write(&latest, "").unwrap();
        assert!(archive_log_file(&latest, dir.path()).unwrap().is_none());
        assert!(!latest.exists());
    }

    #[test]
    fn small_logs_are_kept_on_startup() {
        let dir = tempfile::tempdir().unwrap();
        let latest = dir.path().join(LATEST_LOG);
        fs::write(&latest, "small").unwrap();
        archive_if_large(&latest, dir.path()).unwrap();
        assert!(latest.exists());
    }
}
