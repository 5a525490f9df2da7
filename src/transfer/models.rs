//! 传输引擎的数据模型。
//!
//! 任务（Task）、单次传输结果（TransferOutcome）、失败记录（FailureRecord）、
//! 附属资源清单以及整次运行的统计（RunSummary）。

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

/// 资源类型，对应任务列表中的 `content_type`。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    #[default]
    #[serde(rename = "assets_document", alias = "document")]
    Document,
    #[serde(rename = "assets_video", alias = "video")]
    Video,
    #[serde(rename = "assets_audio", alias = "audio")]
    Audio,
    #[serde(rename = "assets_image", alias = "image")]
    Image,
}

impl ResourceKind {
    /// 附属资源目录的后缀名（`<pdf名>_音频` 等）。
    pub fn dir_label(self) -> &'static str {
        match self {
            ResourceKind::Document => "文档",
            ResourceKind::Video => "视频",
            ResourceKind::Audio => "音频",
            ResourceKind::Image => "图片",
        }
    }
}

/// 一个下载任务。
///
/// `id` 在生成任务列表时分配，之后不再重新计算；它是任务列表与失败日志之间的关联键。
/// 未识别的字段原样保留在 `extra` 中，重试日志写回时不丢信息。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub content_id: String,
    #[serde(rename = "content_type", default)]
    pub resource_kind: ResourceKind,
    #[serde(default)]
    pub original_title: String,
    pub save_path: String,
    #[serde(rename = "page_url", default)]
    pub page_referer: String,
    /// 解析真实地址用的定位符：直链或需要查询的元数据接口。
    #[serde(rename = "api_url", default)]
    pub source_descriptor: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Task {
    pub fn meta_str(&self, key: &str) -> &str {
        self.metadata
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    pub fn referer(&self) -> Option<&str> {
        let r = self.page_referer.trim();
        if r.is_empty() { None } else { Some(r) }
    }

    pub fn title(&self) -> &str {
        if self.original_title.is_empty() {
            &self.id
        } else {
            &self.original_title
        }
    }
}

/// 任务列表文件：`{ total, generated_at, tasks }`。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskList {
    #[serde(default)]
    pub total: Option<usize>,
    #[serde(default)]
    pub generated_at: Option<String>,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

/// 单个资源的一次传输结果。产生后不再修改。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Success { bytes_written: u64 },
    Skipped { reason: String },
    Failed { last_error: String },
    NoResource { reason: String },
}

impl TransferOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, TransferOutcome::Failed { .. })
    }

    /// 附属资源统计里，成功与已存在都算作“已获取”。
    pub fn is_obtained(&self) -> bool {
        matches!(
            self,
            TransferOutcome::Success { .. } | TransferOutcome::Skipped { .. }
        )
    }
}

/// 失败日志中的一条记录；重试模式直接以其中的 `task` 作为任务列表。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub task: Task,
    pub error: String,
    #[serde(
        rename = "pdf_url",
        alias = "last_attempted_url",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_attempted_url: Option<String>,
}

/// 解析主资源时顺带发现的附属资源（热区音频、专题课程的音视频等）。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecondaryResource {
    pub title: String,
    pub url: String,
    pub format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hotzone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_id: Option<String>,
    #[serde(default)]
    pub has_drm: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredResources {
    #[serde(default)]
    pub videos: Vec<SecondaryResource>,
    #[serde(default)]
    pub audios: Vec<SecondaryResource>,
    #[serde(default)]
    pub images: Vec<SecondaryResource>,
}

impl DiscoveredResources {
    pub fn is_empty(&self) -> bool {
        self.videos.is_empty() && self.audios.is_empty() && self.images.is_empty()
    }

    pub fn total(&self) -> usize {
        self.videos.len() + self.audios.len() + self.images.len()
    }
}

/// 附属资源清单中的一条：`{ task, multimedia }`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub task: Task,
    pub multimedia: DiscoveredResources,
}

/// 每个任务在传输过程中累积的计数，由汇总点合并进 [`RunSummary`]。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskTally {
    pub retries: u64,
    pub cdn_switches: u64,
    pub integrity_fallbacks: u64,
    pub videos_downloaded: u64,
    pub videos_skipped_drm: u64,
    pub audios_downloaded: u64,
    pub secondary_failed: u64,
}

impl TaskTally {
    pub fn merge(&mut self, other: &TaskTally) {
        self.retries += other.retries;
        self.cdn_switches += other.cdn_switches;
        self.integrity_fallbacks += other.integrity_fallbacks;
        self.videos_downloaded += other.videos_downloaded;
        self.videos_skipped_drm += other.videos_skipped_drm;
        self.audios_downloaded += other.audios_downloaded;
        self.secondary_failed += other.secondary_failed;
    }
}

/// 一个任务处理完毕后由工作线程发给汇总点的报告。
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub task: Task,
    pub outcome: TransferOutcome,
    pub tally: TaskTally,
    /// 主资源未解析到，但发现了附属资源。
    pub secondary_only: bool,
    pub failure: Option<FailureRecord>,
    pub manifest: Option<ManifestEntry>,
}

impl TaskReport {
    pub(crate) fn new(task: Task, outcome: TransferOutcome) -> Self {
        Self {
            task,
            outcome,
            tally: TaskTally::default(),
            secondary_only: false,
            failure: None,
            manifest: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub skipped: u64,
    pub no_resource: u64,
    pub secondary_only: u64,
    pub canceled: u64,
    pub tally: TaskTally,
    pub started_at: Option<OffsetDateTime>,
    pub finished_at: Option<OffsetDateTime>,
}

impl RunSummary {
    pub fn started(total: usize) -> Self {
        Self {
            total: total as u64,
            started_at: Some(OffsetDateTime::now_utc()),
            ..Self::default()
        }
    }

    pub fn absorb(&mut self, report: &TaskReport) {
        match report.outcome {
            TransferOutcome::Success { .. } => self.success += 1,
            TransferOutcome::Skipped { .. } => self.skipped += 1,
            TransferOutcome::Failed { .. } => self.failed += 1,
            TransferOutcome::NoResource { .. } => self.no_resource += 1,
        }
        if report.secondary_only {
            self.secondary_only += 1;
        }
        self.tally.merge(&report.tally);
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(OffsetDateTime::now_utc());
    }

    pub fn completed(&self) -> u64 {
        self.success + self.failed + self.skipped + self.no_resource
    }

    pub fn duration(&self) -> Duration {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => (end - start).try_into().unwrap_or_default(),
            _ => Duration::ZERO,
        }
    }
}

pub fn format_size(size: u64) -> String {
    let mut value = size as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if value < 1024.0 {
            return format!("{value:.1} {unit}");
        }
        value /= 1024.0;
    }
    format!("{value:.1} TB")
}
