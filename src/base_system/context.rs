//! 全局配置结构（Config）与默认值。
//!
//! 该模块同时提供生成 `downloader.yml` 的字段元信息，以及把配置换算成
//! 传输引擎、HTTP 客户端所需参数的方法。

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::{ConfigSpec, FieldMeta};
use crate::network::http::TransportSettings;
use crate::transfer::cdn::DEFAULT_CDN_NODES;
use crate::transfer::fetcher::RetryPolicy;
use crate::transfer::integrity::IntegrityMode;
use crate::transfer::orchestrator::EngineSettings;
use crate::transfer::paths::{LIBRARY_ROOT, PathLayout};
use crate::transfer::resolver::{DEFAULT_DRM_KEY_HOST, DEFAULT_THEMATIC_LIST_URL, ResolverSettings};

/// 开启重试时每个 CDN 节点的尝试次数。
const MAX_ATTEMPTS: u32 = 3;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // 并发与限流
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_rate_limit")]
    pub rate_limit: f64,
    #[serde(default = "default_true")]
    pub enable_ratelimit: bool,

    // 重试
    #[serde(default = "default_true")]
    pub enable_retry: bool,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    // 校验与附属资源
    #[serde(default)]
    pub integrity_mode: IntegrityMode,
    #[serde(default = "default_true")]
    pub enable_multimedia: bool,

    // 超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default = "default_metadata_timeout")]
    pub metadata_timeout: u64,
    #[serde(default = "default_check_timeout")]
    pub check_timeout: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    // 文件
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    #[serde(default = "default_tasks_file")]
    pub tasks_file: String,
    #[serde(default = "default_failed_journal")]
    pub failed_journal: String,
    #[serde(default = "default_multimedia_manifest")]
    pub multimedia_manifest: String,

    // 源站
    #[serde(default = "default_cdn_nodes")]
    pub cdn_nodes: Vec<String>,
    #[serde(default = "default_thematic_list_url")]
    pub thematic_list_url: String,
    #[serde(default = "default_drm_key_host")]
    pub drm_key_host: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            rate_limit: default_rate_limit(),
            enable_ratelimit: default_true(),
            enable_retry: default_true(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            integrity_mode: IntegrityMode::default(),
            enable_multimedia: default_true(),
            request_timeout: default_request_timeout(),
            metadata_timeout: default_metadata_timeout(),
            check_timeout: default_check_timeout(),
            connect_timeout: default_connect_timeout(),
            output_dir: default_output_dir(),
            tasks_file: default_tasks_file(),
            failed_journal: default_failed_journal(),
            multimedia_manifest: default_multimedia_manifest(),
            cdn_nodes: default_cdn_nodes(),
            thematic_list_url: default_thematic_list_url(),
            drm_key_host: default_drm_key_host(),
            user_agent: default_user_agent(),
        }
    }
}

impl ConfigSpec for Config {
    const FILE_NAME: &'static str = "downloader.yml";

    fn fields() -> &'static [FieldMeta] {
        static FIELDS: [FieldMeta; 20] = [
            FieldMeta {
                name: "max_workers",
                description: "同时进行的下载任务数",
            },
            FieldMeta {
                name: "rate_limit",
                description: "每秒最多发起的请求数（所有线程合计），0 表示不限",
            },
            FieldMeta {
                name: "enable_ratelimit",
                description: "是否启用请求限流",
            },
            FieldMeta {
                name: "enable_retry",
                description: "下载失败时是否重试（开启时每个 CDN 节点最多尝试 3 次，关闭后只尝试一次）",
            },
            FieldMeta {
                name: "backoff_base_ms",
                description: "重试退避基数, 单位ms（第 n 次重试前等待 基数 × (2^n + 随机抖动)）",
            },
            FieldMeta {
                name: "backoff_max_ms",
                description: "单次退避等待上限, 单位ms",
            },
            FieldMeta {
                name: "integrity_mode",
                description: "已存在文件的完整性检查方式, 可选: [local, smart, strict]\nlocal: 只看大小\nsmart: 按格式检查文件头尾\nstrict: 与服务器声明的大小比对，失败时退回 smart",
            },
            FieldMeta {
                name: "enable_multimedia",
                description: "是否下载附属的音频、视频资源",
            },
            FieldMeta {
                name: "request_timeout",
                description: "单次文件下载的超时时间（秒）",
            },
            FieldMeta {
                name: "metadata_timeout",
                description: "资源详情、热区数据等元数据请求的超时时间（秒）",
            },
            FieldMeta {
                name: "check_timeout",
                description: "HEAD 校验与 m3u8 加密探测的超时时间（秒）",
            },
            FieldMeta {
                name: "connect_timeout",
                description: "建立连接的超时时间（秒）",
            },
            FieldMeta {
                name: "output_dir",
                description: "教材保存目录",
            },
            FieldMeta {
                name: "tasks_file",
                description: "任务列表文件",
            },
            FieldMeta {
                name: "failed_journal",
                description: "失败任务记录文件，配合 --retry-failed 使用",
            },
            FieldMeta {
                name: "multimedia_manifest",
                description: "附属多媒体资源清单文件",
            },
            FieldMeta {
                name: "cdn_nodes",
                description: "可互相替换的 CDN 节点，按顺序轮换",
            },
            FieldMeta {
                name: "thematic_list_url",
                description: "专题课程资源列表地址，{content_id} 会被替换为资源 ID",
            },
            FieldMeta {
                name: "drm_key_host",
                description: "m3u8 中出现该密钥服务器即视为 DRM 加密",
            },
            FieldMeta {
                name: "user_agent",
                description: "请求使用的 User-Agent",
            },
        ];
        &FIELDS
    }

    fn validate(&self) -> Result<(), String> {
        if self.max_workers == 0 {
            return Err("max_workers 必须大于 0".to_string());
        }
        if !self.rate_limit.is_finite() || self.rate_limit < 0.0 {
            return Err("rate_limit 不能为负数".to_string());
        }
        if self.output_dir.trim().is_empty() {
            return Err("output_dir 不能为空".to_string());
        }
        if !self.thematic_list_url.contains("{content_id}") {
            return Err("thematic_list_url 必须包含 {content_id}".to_string());
        }
        Ok(())
    }
}

impl Config {
    pub fn output_path(&self) -> PathBuf {
        PathBuf::from(&self.output_dir)
    }

    /// 实际生效的请求速率；关闭限流时为 0。
    pub fn effective_rate(&self) -> f64 {
        if self.enable_ratelimit {
            self.rate_limit
        } else {
            0.0
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            enabled: self.enable_retry,
            max_attempts: MAX_ATTEMPTS,
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms.max(self.backoff_base_ms)),
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            workers: self.max_workers.max(1),
            rate_limit: self.effective_rate(),
            retry: self.retry_policy(),
            integrity_mode: self.integrity_mode,
            check_timeout: Duration::from_secs(self.check_timeout),
            cdn_nodes: self.cdn_nodes.clone(),
            resolver: ResolverSettings {
                thematic_list_url: self.thematic_list_url.clone(),
                drm_key_host: self.drm_key_host.clone(),
                fetch_secondary: self.enable_multimedia,
                metadata_timeout: Duration::from_secs(self.metadata_timeout),
                check_timeout: Duration::from_secs(self.check_timeout),
            },
            layout: PathLayout::new(self.output_path()),
        }
    }

    pub fn transport_settings(&self, token: &str) -> TransportSettings {
        TransportSettings {
            token: token.to_string(),
            user_agent: self.user_agent.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout),
            transfer_timeout: Duration::from_secs(self.request_timeout),
        }
    }
}

/// 把任意标题变成可用的文件名：替换 Windows 非法字符，去掉首尾的空格和点，
/// 避开保留设备名，并截断到最多 `max_len` 个字符。
pub fn safe_fs_name(name: &str, replacement: char, max_len: usize) -> String {
    let replaced: String = name
        .chars()
        .map(|ch| match ch {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => replacement,
            c if (c as u32) < 32 => replacement,
            c => c,
        })
        .collect();
    let mut cleaned = replaced.trim_matches(|c| c == ' ' || c == '.').to_string();

    if cleaned.is_empty() {
        cleaned.push_str("unnamed");
    }

    const RESERVED: [&str; 22] = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
        "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];
    if RESERVED.contains(&cleaned.to_uppercase().as_str()) {
        cleaned.insert(0, '_');
    }

    if cleaned.chars().count() > max_len {
        cleaned = cleaned.chars().take(max_len).collect();
        let trimmed_len = cleaned.trim_end_matches([' ', '.']).len();
        cleaned.truncate(trimmed_len);
        if cleaned.is_empty() {
            cleaned.push_str("unnamed");
        }
    }

    cleaned
}

fn default_true() -> bool {
    true
}

fn default_max_workers() -> usize {
    3
}

fn default_rate_limit() -> f64 {
    2.0
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_request_timeout() -> u64 {
    300
}

fn default_metadata_timeout() -> u64 {
    30
}

fn default_check_timeout() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_output_dir() -> String {
    LIBRARY_ROOT.to_string()
}

fn default_tasks_file() -> String {
    "download_tasks.json".to_string()
}

fn default_failed_journal() -> String {
    "failed_tasks.json".to_string()
}

fn default_multimedia_manifest() -> String {
    "multimedia_resources.json".to_string()
}

fn default_cdn_nodes() -> Vec<String> {
    DEFAULT_CDN_NODES.iter().map(|s| s.to_string()).collect()
}

fn default_thematic_list_url() -> String {
    DEFAULT_THEMATIC_LIST_URL.to_string()
}

fn default_drm_key_host() -> String {
    DEFAULT_DRM_KEY_HOST.to_string()
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base_system::config::{load_or_create, render_with_comments};

    #[test]
    fn every_field_is_described_once() {
        let value = serde_yaml::to_value(Config::default()).unwrap();
        let map = value.as_mapping().unwrap();
        assert_eq!(map.len(), Config::fields().len());
        for field in Config::fields() {
            assert!(map.contains_key(field.name), "missing {}", field.name);
        }
        let text = render_with_comments(&Config::default()).unwrap();
        assert!(text.contains("integrity_mode: smart"));
        assert!(text.contains("# strict: 与服务器声明的大小比对"));
    }

    #[test]
    fn partial_file_keeps_defaults_for_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("downloader.yml");
        std::fs::write(&path, "max_workers: 6\nintegrity_mode: strict\nenable_ratelimit: false\n")
            .unwrap();
        let cfg: Config = load_or_create(Some(&path)).unwrap();
        assert_eq!(cfg.max_workers, 6);
        assert_eq!(cfg.integrity_mode, IntegrityMode::Strict);
        assert_eq!(cfg.effective_rate(), 0.0);
        assert_eq!(cfg.cdn_nodes.len(), 3);
        let settings = cfg.engine_settings();
        assert_eq!(settings.workers, 6);
        assert!(settings.resolver.fetch_secondary);
        assert_eq!(settings.retry.attempts(), 3);
    }

    #[test]
    fn disabling_retry_yields_single_attempt_policy() {
        let cfg = Config {
            enable_retry: false,
            ..Config::default()
        };
        assert_eq!(cfg.retry_policy().attempts(), 1);
        assert_eq!(Config::default().retry_policy().attempts(), 3);
        assert_eq!(cfg.retry_policy().max_delay, Duration::from_secs(30));
    }

    #[test]
    fn safe_names_strip_illegal_characters() {
        assert_eq!(safe_fs_name("Unit 1: Hello/World?", '_', 100), "Unit 1_ Hello_World_");
        assert_eq!(safe_fs_name("  ..标题..  ", '_', 100), "标题");
        assert_eq!(safe_fs_name("con", '_', 100), "_con");
        assert_eq!(safe_fs_name("...", '_', 100), "unnamed");
        let long = "音".repeat(150);
        assert_eq!(safe_fs_name(&long, '_', 100).chars().count(), 100);
    }
}
