//! 本地文件完整性判断。
//!
//! - `local`：文件存在且不小于 1 KiB。
//! - `smart`（默认）：按扩展名查格式校验表（PDF 头/尾标记、MP3 帧同步等）。
//! - `strict`：HEAD 取源站长度并与本地大小精确比较；拿不到长度或网络失败时退回
//!   `smart`，并在结果里标明退回原因。
//!
//! 本模块从不返回错误：读不到文件就判为不完整。

use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::network::http::HttpTransport;

const LOCAL_MIN_BYTES: u64 = 1024;
const PDF_MIN_BYTES: u64 = 10 * 1024;
const AUDIO_MIN_BYTES: u64 = 5 * 1024;
const OTHER_MIN_BYTES: u64 = 100;
const PDF_TAIL_WINDOW: u64 = 1024;
const MP3_SCAN_WINDOW: u64 = 4096;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityMode {
    Local,
    #[default]
    Smart,
    Strict,
}

impl fmt::Display for IntegrityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IntegrityMode::Local => "local",
            IntegrityMode::Smart => "smart",
            IntegrityMode::Strict => "strict",
        })
    }
}

/// strict 模式退回 smart 的原因。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackCause {
    /// 源站未声明长度
    NoLength,
    /// HEAD 请求失败
    Network(String),
    /// 调用方没有提供源地址
    NoUrl,
}

impl fmt::Display for FallbackCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackCause::NoLength => f.write_str("服务器未返回文件大小"),
            FallbackCause::Network(e) => write!(f, "网络检查失败: {e}"),
            FallbackCause::NoUrl => f.write_str("缺少源地址"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub complete: bool,
    pub reason: String,
    pub fallback: Option<FallbackCause>,
}

impl Verdict {
    fn complete(reason: impl Into<String>) -> Self {
        Self {
            complete: true,
            reason: reason.into(),
            fallback: None,
        }
    }

    fn incomplete(reason: impl Into<String>) -> Self {
        Self {
            complete: false,
            reason: reason.into(),
            fallback: None,
        }
    }
}

type FormatValidator = fn(&Path, u64) -> Verdict;

/// 扩展名 → 校验函数。新增格式只需在这里加一行。
const FORMAT_VALIDATORS: &[(&str, FormatValidator)] = &[
    ("pdf", check_pdf),
    ("mp3", check_mp3),
    ("m4a", check_m4a),
];

pub struct IntegrityOracle {
    mode: IntegrityMode,
    transport: Arc<dyn HttpTransport>,
    check_timeout: Duration,
}

impl IntegrityOracle {
    pub fn new(
        mode: IntegrityMode,
        transport: Arc<dyn HttpTransport>,
        check_timeout: Duration,
    ) -> Self {
        Self {
            mode,
            transport,
            check_timeout,
        }
    }

    pub fn check(&self, path: &Path, source_url: Option<&str>) -> Verdict {
        let size = match std::fs::metadata(path) {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => return Verdict::incomplete("不是普通文件"),
            Err(_) => return Verdict::incomplete("文件不存在"),
        };

        match self.mode {
            IntegrityMode::Local => check_local(size),
            IntegrityMode::Smart => check_smart(path, size),
            IntegrityMode::Strict => self.check_strict(path, size, source_url),
        }
    }

    fn check_strict(&self, path: &Path, size: u64, source_url: Option<&str>) -> Verdict {
        let Some(url) = source_url else {
            return fallback(path, size, FallbackCause::NoUrl);
        };
        match self.transport.head_length(url, self.check_timeout) {
            Ok(Some(remote)) if remote > 0 => {
                if remote == size {
                    Verdict::complete("严格检查通过")
                } else {
                    Verdict::incomplete(format!("文件大小不匹配: 本地={size}, 远程={remote}"))
                }
            }
            Ok(_) => fallback(path, size, FallbackCause::NoLength),
            Err(err) => fallback(path, size, FallbackCause::Network(err.to_string())),
        }
    }
}

fn fallback(path: &Path, size: u64, cause: FallbackCause) -> Verdict {
    let mut verdict = check_smart(path, size);
    verdict.fallback = Some(cause);
    verdict
}

fn check_local(size: u64) -> Verdict {
    if size < LOCAL_MIN_BYTES {
        Verdict::incomplete(format!("文件过小: {size} bytes"))
    } else {
        Verdict::complete("本地检查通过")
    }
}

fn check_smart(path: &Path, size: u64) -> Verdict {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let validator = FORMAT_VALIDATORS
        .iter()
        .find(|(name, _)| *name == ext)
        .map(|(_, f)| *f)
        .unwrap_or(check_other);
    validator(path, size)
}

fn check_other(_path: &Path, size: u64) -> Verdict {
    if size < OTHER_MIN_BYTES {
        Verdict::incomplete(format!("文件过小: {size} bytes"))
    } else {
        Verdict::complete("智能检查通过")
    }
}

fn check_pdf(path: &Path, size: u64) -> Verdict {
    if size < PDF_MIN_BYTES {
        return Verdict::incomplete(format!("PDF文件过小: {size} bytes"));
    }
    let result = (|| -> std::io::Result<Option<&'static str>> {
        let mut file = File::open(path)?;
        let mut header = [0u8; 5];
        file.read_exact(&mut header)?;
        if &header != b"%PDF-" {
            return Ok(Some("无效的PDF文件头"));
        }
        file.seek(SeekFrom::Start(size.saturating_sub(PDF_TAIL_WINDOW)))?;
        let mut tail = Vec::with_capacity(PDF_TAIL_WINDOW as usize);
        file.read_to_end(&mut tail)?;
        if !contains(&tail, b"%%EOF") {
            return Ok(Some("PDF文件可能不完整（缺少EOF标记）"));
        }
        Ok(None)
    })();
    match result {
        Ok(None) => Verdict::complete("智能检查通过"),
        Ok(Some(reason)) => Verdict::incomplete(reason),
        Err(e) => Verdict::incomplete(format!("读取文件失败: {e}")),
    }
}

fn check_mp3(path: &Path, size: u64) -> Verdict {
    if size < AUDIO_MIN_BYTES {
        return Verdict::incomplete(format!("音频文件过小: {size} bytes"));
    }
    let result = (|| -> std::io::Result<bool> {
        let mut head = Vec::with_capacity(MP3_SCAN_WINDOW as usize);
        File::open(path)?
            .take(MP3_SCAN_WINDOW)
            .read_to_end(&mut head)?;
        if head.starts_with(b"ID3") || is_frame_sync(&head) {
            return Ok(true);
        }
        Ok(head.windows(2).any(is_frame_sync))
    })();
    match result {
        Ok(true) => Verdict::complete("智能检查通过"),
        Ok(false) => Verdict::incomplete("无效的MP3文件格式"),
        Err(e) => Verdict::incomplete(format!("读取音频文件失败: {e}")),
    }
}

fn check_m4a(_path: &Path, size: u64) -> Verdict {
    if size < AUDIO_MIN_BYTES {
        Verdict::incomplete(format!("音频文件过小: {size} bytes"))
    } else {
        Verdict::complete("智能检查通过")
    }
}

// MPEG-1 Layer III 帧同步（带/不带 CRC）
fn is_frame_sync(bytes: &[u8]) -> bool {
    matches!(bytes, [0xFF, 0xFB, ..] | [0xFF, 0xFA, ..])
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
