//! 任务列表、失败记录与附属资源清单的读写。
//!
//! 写入一律先落到同目录临时文件，再原子替换目标文件。

use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use super::models::{FailureRecord, ManifestEntry, Task, TaskList};

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("文件不存在: {0}")]
    Missing(PathBuf),
    #[error("读写 {path} 失败: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("解析 {path} 失败: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub fn load_task_list(path: &Path) -> Result<TaskList, JournalError> {
    read_json(path)
}

pub fn load_failure_journal(path: &Path) -> Result<Vec<FailureRecord>, JournalError> {
    read_json(path)
}

/// 失败记录每次运行结束都会整体重写；没有失败时写入空数组，
/// 上一次的记录不会残留到下一次重试。
pub fn save_failure_journal(path: &Path, records: &[FailureRecord]) -> Result<(), JournalError> {
    write_json_atomic(path, &records)
}

/// 未开始任务在失败记录中的错误信息。
pub const NOT_STARTED: &str = "任务未开始（运行被中止）";

/// 重试模式按数量限制切分失败记录：前 `limit` 条本次重试，其余留给下一次。
pub fn split_for_retry(
    records: Vec<FailureRecord>,
    limit: Option<usize>,
) -> (Vec<FailureRecord>, Vec<FailureRecord>) {
    let mut selected = records;
    let deferred = match limit {
        Some(n) if n < selected.len() => selected.split_off(n),
        _ => Vec::new(),
    };
    (selected, deferred)
}

/// 组装运行结束时写回的失败记录。
///
/// 顺序：本次失败的任务、因取消没有开始的任务、本次没有选中的旧记录。
/// 没有开始的任务若在 `previous` 里有旧记录，沿用旧记录的错误与地址。
pub fn carry_forward(
    failures: Vec<FailureRecord>,
    unstarted: Vec<Task>,
    previous: &[FailureRecord],
    deferred: Vec<FailureRecord>,
) -> Vec<FailureRecord> {
    let mut records = failures;
    for task in unstarted {
        let record = match previous.iter().find(|r| r.task.id == task.id) {
            Some(old) => old.clone(),
            None => FailureRecord {
                task,
                error: NOT_STARTED.to_string(),
                last_attempted_url: None,
            },
        };
        records.push(record);
    }
    records.extend(deferred);
    records
}

/// 清单为空时不写文件，返回 `false`。
pub fn save_manifest(path: &Path, entries: &[ManifestEntry]) -> Result<bool, JournalError> {
    if entries.is_empty() {
        return Ok(false);
    }
    write_json_atomic(path, &entries)?;
    Ok(true)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, JournalError> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(JournalError::Missing(path.to_path_buf()));
        }
        Err(source) => {
            return Err(JournalError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_slice(&raw).map_err(|source| JournalError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), JournalError> {
    let io_err = |source| JournalError::Io {
        path: path.to_path_buf(),
        source,
    };
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(parent).map_err(io_err)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(io_err)?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        serde_json::to_writer_pretty(&mut writer, value).map_err(|source| {
            JournalError::Io {
                path: path.to_path_buf(),
                source: source.into(),
            }
        })?;
        writer.flush().map_err(io_err)?;
    }
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}
