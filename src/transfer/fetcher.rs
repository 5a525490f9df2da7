//! 单个资源的下载：有限次重试、带抖动的指数退避、CDN 节点轮换。
//!
//! 数据先写入目标目录下的临时文件，长度核对无误后原子改名为目标文件，
//! 目标路径上永远不会出现写了一半的文件。

use std::fs;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use thiserror::Error;

use super::cdn::CdnResolver;
use super::integrity::IntegrityOracle;
use super::models::TransferOutcome;
use super::rate_limiter::RateLimiter;
use crate::network::http::{HttpTransport, TransportError};

const COPY_BUF_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// 每个候选节点的尝试次数；关闭重试时为 1。
    pub fn attempts(&self) -> u32 {
        if self.enabled {
            self.max_attempts.max(1)
        } else {
            1
        }
    }

    /// 第 `attempt` 次尝试前的等待：`min(base * (2^attempt + U(0,1)), max)`。
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2f64.powi(attempt.min(20) as i32) + fastrand::f64();
        self.base_delay.mul_f64(factor).min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("下载不完整: {written}/{expected} bytes")]
    Truncated { written: u64, expected: u64 },
    #[error("读取响应失败: {0}")]
    Read(#[source] io::Error),
    #[error("写入文件失败 {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl TransferError {
    pub fn is_transient(&self) -> bool {
        match self {
            TransferError::Transport(e) => e.is_transient(),
            TransferError::Truncated { .. } | TransferError::Read(_) => true,
            TransferError::Write { .. } => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            TransferError::Transport(TransportError::Status { status, .. }) => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    pub url: String,
    pub attempt: u32,
    pub error: String,
    pub status: Option<u16>,
    pub transient: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdnSwitch {
    pub from: String,
    pub to: String,
}

/// 一次 `transfer` 的完整经过，供编排层记日志和计数。
#[derive(Debug, Clone)]
pub struct FetchReport {
    pub outcome: TransferOutcome,
    pub retries: u64,
    pub cdn_switch: Option<CdnSwitch>,
    pub integrity_fallbacks: u64,
    pub last_url: String,
    pub failures: Vec<AttemptFailure>,
}

impl FetchReport {
    /// 每个节点都明确回应了 4xx（非 408/429），说明资源在源站上不存在。
    pub fn missing_everywhere(&self) -> bool {
        self.outcome.is_failed()
            && !self.failures.is_empty()
            && self
                .failures
                .iter()
                .all(|f| !f.transient && f.status.is_some_and(|s| (400..500).contains(&s)))
    }
}

pub struct RetryingFetcher {
    transport: Arc<dyn HttpTransport>,
    limiter: Arc<RateLimiter>,
    oracle: Arc<IntegrityOracle>,
    cdn: CdnResolver,
    policy: RetryPolicy,
}

impl RetryingFetcher {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        limiter: Arc<RateLimiter>,
        oracle: Arc<IntegrityOracle>,
        cdn: CdnResolver,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            limiter,
            oracle,
            cdn,
            policy,
        }
    }

    pub fn transfer(&self, url: &str, destination: &Path, referer: Option<&str>) -> FetchReport {
        let candidates = self.cdn.candidates(url);
        let attempts = self.policy.attempts();
        let mut report = FetchReport {
            outcome: TransferOutcome::Failed {
                last_error: "没有可尝试的地址".to_string(),
            },
            retries: 0,
            cdn_switch: None,
            integrity_fallbacks: 0,
            last_url: url.to_string(),
            failures: Vec::new(),
        };
        let mut last_error: Option<String> = None;

        for (idx, candidate) in candidates.iter().enumerate() {
            for attempt in 0..attempts {
                if attempt > 0 {
                    thread::sleep(self.policy.backoff(attempt));
                    report.retries += 1;
                }
                self.limiter.acquire();
                report.last_url = candidate.clone();

                if destination.exists() {
                    let verdict = self.oracle.check(destination, Some(candidate));
                    if verdict.fallback.is_some() {
                        report.integrity_fallbacks += 1;
                    }
                    if verdict.complete {
                        report.outcome = TransferOutcome::Skipped {
                            reason: verdict.reason,
                        };
                        report.cdn_switch = switch(idx, url, candidate);
                        return report;
                    }
                }

                match self.stream_to(candidate, destination, referer) {
                    Ok(bytes_written) => {
                        report.outcome = TransferOutcome::Success { bytes_written };
                        report.cdn_switch = switch(idx, url, candidate);
                        return report;
                    }
                    Err(err) => {
                        let transient = err.is_transient();
                        let message = err.to_string();
                        report.failures.push(AttemptFailure {
                            url: candidate.clone(),
                            attempt,
                            error: message.clone(),
                            status: err.status(),
                            transient,
                        });
                        last_error = Some(message);
                        if !transient {
                            // 换节点可能有用，但同一节点重试没有意义
                            break;
                        }
                    }
                }
            }
        }

        report.outcome = TransferOutcome::Failed {
            last_error: last_error.unwrap_or_else(|| "下载失败".to_string()),
        };
        report
    }

    fn stream_to(
        &self,
        url: &str,
        destination: &Path,
        referer: Option<&str>,
    ) -> Result<u64, TransferError> {
        let parent = destination
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        fs::create_dir_all(parent).map_err(|source| TransferError::Write {
            path: parent.to_path_buf(),
            source,
        })?;

        let mut body = self.transport.get_body(url, referer)?;

        let file_name = destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".to_string());
        let mut tmp = tempfile::Builder::new()
            .prefix(&format!(".{file_name}."))
            .suffix(".part")
            .tempfile_in(parent)
            .map_err(|source| TransferError::Write {
                path: parent.to_path_buf(),
                source,
            })?;

        let written = {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            let written = copy_counting(&mut body.reader, &mut writer, destination)?;
            writer.flush().map_err(|source| TransferError::Write {
                path: destination.to_path_buf(),
                source,
            })?;
            written
        };

        // 临时文件在 drop 时自动删除
        if let Some(expected) = body.content_length
            && written != expected
        {
            return Err(TransferError::Truncated { written, expected });
        }

        tmp.persist(destination)
            .map_err(|e| TransferError::Write {
                path: destination.to_path_buf(),
                source: e.error,
            })?;
        Ok(written)
    }
}

fn switch(idx: usize, original: &str, used: &str) -> Option<CdnSwitch> {
    (idx > 0).then(|| CdnSwitch {
        from: original.to_string(),
        to: used.to_string(),
    })
}

fn copy_counting(
    reader: &mut dyn Read,
    writer: &mut impl Write,
    destination: &Path,
) -> Result<u64, TransferError> {
    let mut buf = vec![0u8; COPY_BUF_BYTES];
    let mut written = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(written),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransferError::Read(e)),
        };
        writer
            .write_all(&buf[..n])
            .map_err(|source| TransferError::Write {
                path: destination.to_path_buf(),
                source,
            })?;
        written += n as u64;
    }
}
