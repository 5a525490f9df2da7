//! 资源解析：由任务得到主文档地址，并顺带发现附属音视频。
//!
//! 两条路径：
//! - 普通教材：查询资源详情，取 PDF 存储地址；若有热区数据则解析出其中的音频。
//! - 专题课程：查询资源列表，文档作为主资源，视频经 DRM 探测后作为附属资源，音频直接作为附属资源。
//!
//! 解析失败不返回错误，只在结果里留下原因，由编排层判为无可用资源。

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde_json::Value;

use super::models::{DiscoveredResources, SecondaryResource, Task};
use super::rate_limiter::RateLimiter;
use crate::network::http::HttpTransport;

pub const DEFAULT_THEMATIC_LIST_URL: &str =
    "https://s-file-1.ykt.cbern.com.cn/zxx/ndrs/special_edu/thematic_course/{content_id}/resources/list.json";
pub const DEFAULT_DRM_KEY_HOST: &str = "ndvideo-key.ykt.eduyun.cn";

const BUNDLE_MARKER: &str = "contentType=thematic_course";
const VIDEO_FORMATS: [&str; 4] = ["mp4", "video/mp4", "m3u8", "video/m3u8"];
const AUDIO_FORMATS: [&str; 4] = ["mp3", "audio/mp3", "wav", "m4a"];

fn mp3_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"https?://[^\s"]+\.mp3"#).expect("compile MP3_URL"))
}

#[derive(Debug, Clone)]
pub struct ResolverSettings {
    /// 含 `{content_id}` 占位符的专题课程资源列表地址。
    pub thematic_list_url: String,
    pub drm_key_host: String,
    pub fetch_secondary: bool,
    pub metadata_timeout: Duration,
    pub check_timeout: Duration,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            thematic_list_url: DEFAULT_THEMATIC_LIST_URL.to_string(),
            drm_key_host: DEFAULT_DRM_KEY_HOST.to_string(),
            fetch_secondary: true,
            metadata_timeout: Duration::from_secs(30),
            check_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub primary_url: Option<String>,
    pub secondary: DiscoveredResources,
    /// 主资源未解析到的原因。
    pub failure: Option<String>,
    /// 不影响主资源的问题（热区数据读取失败、DRM 探测失败等）。
    pub warnings: Vec<String>,
}

impl Resolution {
    fn unresolved(reason: impl Into<String>) -> Self {
        Self {
            failure: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn drm_videos(&self) -> usize {
        self.secondary.videos.iter().filter(|v| v.has_drm).count()
    }
}

/// 专题课程任务的判别：定位符或页面地址中带有专题课程的类型标记。
pub fn is_bundle(task: &Task) -> bool {
    task.source_descriptor.contains(BUNDLE_MARKER) || task.page_referer.contains(BUNDLE_MARKER)
}

pub struct ResourceResolver {
    transport: Arc<dyn HttpTransport>,
    limiter: Arc<RateLimiter>,
    settings: ResolverSettings,
}

impl ResourceResolver {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        limiter: Arc<RateLimiter>,
        settings: ResolverSettings,
    ) -> Self {
        Self {
            transport,
            limiter,
            settings,
        }
    }

    pub fn fetches_secondary(&self) -> bool {
        self.settings.fetch_secondary
    }

    pub fn resolve(&self, task: &Task) -> Resolution {
        if is_bundle(task) {
            self.resolve_bundle(task)
        } else {
            self.resolve_simple(task)
        }
    }

    fn fetch_json(&self, url: &str, task: &Task) -> Result<Value, String> {
        self.limiter.acquire();
        let text = self
            .transport
            .get_text(url, task.referer(), self.settings.metadata_timeout)
            .map_err(|e| e.to_string())?;
        serde_json::from_str(&text).map_err(|e| format!("解析JSON失败: {e}"))
    }

    fn resolve_simple(&self, task: &Task) -> Resolution {
        let api_url = task.source_descriptor.trim();
        if api_url.is_empty() {
            return Resolution::unresolved("缺少资源详情地址");
        }
        let data = match self.fetch_json(api_url, task) {
            Ok(v) => v,
            Err(e) => return Resolution::unresolved(format!("获取资源详情失败: {e}")),
        };
        let items = data
            .get("ti_items")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let mut resolution = Resolution {
            primary_url: items
                .iter()
                .filter(|item| str_field(item, "lc_ti_format") == "pdf")
                .find_map(first_storage),
            ..Resolution::default()
        };

        if self.settings.fetch_secondary {
            let hot_zone = items
                .iter()
                .filter(|item| str_field(item, "ti_file_flag") == "hot_zone")
                .find_map(first_storage);
            if let Some(url) = hot_zone {
                match self.hot_zone_audio(&url, task) {
                    Ok(audios) => resolution.secondary.audios = audios,
                    Err(e) => resolution.warnings.push(format!("解析热区数据失败: {e}")),
                }
            }
        }

        if resolution.primary_url.is_none() {
            resolution.failure = Some("未找到PDF资源".to_string());
        }
        resolution
    }

    fn hot_zone_audio(&self, url: &str, task: &Task) -> Result<Vec<SecondaryResource>, String> {
        self.limiter.acquire();
        let text = self
            .transport
            .get_text(url, task.referer(), self.settings.metadata_timeout)
            .map_err(|e| e.to_string())?;
        Ok(parse_hot_zone(&text))
    }

    fn resolve_bundle(&self, task: &Task) -> Resolution {
        let list_url = self
            .settings
            .thematic_list_url
            .replace("{content_id}", &task.content_id);
        let data = match self.fetch_json(&list_url, task) {
            Ok(v) => v,
            Err(e) => return Resolution::unresolved(format!("获取专题课程资源失败: {e}")),
        };
        let Some(entries) = data.as_array() else {
            return Resolution::unresolved("专题课程资源列表格式错误");
        };

        let mut resolution = Resolution::default();
        for entry in entries {
            let title = entry
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or("未知资源");
            let resource_id = entry.get("id").and_then(value_to_string);
            let items = entry
                .get("ti_items")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();

            match str_field(entry, "resource_type_code") {
                "assets_video" if self.settings.fetch_secondary => {
                    let video = self.bundle_video(
                        items,
                        title,
                        &resource_id,
                        task,
                        &mut resolution.warnings,
                    );
                    resolution.secondary.videos.extend(video);
                }
                "assets_audio" if self.settings.fetch_secondary => {
                    let audio = items.iter().find_map(|item| {
                        let format = str_field(item, "lc_ti_format");
                        if !AUDIO_FORMATS.contains(&format) {
                            return None;
                        }
                        Some(SecondaryResource {
                            title: title.to_string(),
                            url: first_storage(item)?,
                            format: format.trim_start_matches("audio/").to_string(),
                            resource_id: resource_id.clone(),
                            ..SecondaryResource::default()
                        })
                    });
                    resolution.secondary.audios.extend(audio);
                }
                "assets_document" if resolution.primary_url.is_none() => {
                    resolution.primary_url = items
                        .iter()
                        .filter(|item| str_field(item, "lc_ti_format") == "pdf")
                        .find_map(first_storage);
                }
                _ => {}
            }
        }

        if resolution.primary_url.is_none() {
            resolution.failure = Some("专题课程未找到PDF".to_string());
        }
        resolution
    }

    fn bundle_video(
        &self,
        items: &[Value],
        title: &str,
        resource_id: &Option<String>,
        task: &Task,
        warnings: &mut Vec<String>,
    ) -> Option<SecondaryResource> {
        let (item, format) = items.iter().find_map(|item| {
            let format = str_field(item, "lc_ti_format");
            (VIDEO_FORMATS.contains(&format) && first_storage(item).is_some())
                .then_some((item, format))
        })?;
        let url = first_storage(item)?;
        let format = if format.contains("m3u8") { "m3u8" } else { "mp4" };

        let mut has_drm = item
            .get("custom_properties")
            .and_then(|p| p.get("encryption"))
            .and_then(Value::as_str)
            == Some("drm");
        if format == "m3u8" && !has_drm {
            has_drm = match self.manifest_has_drm(&url, task) {
                Ok(drm) => drm,
                Err(e) => {
                    // 探测失败按加密处理
                    warnings.push(format!("检查M3U8加密失败: {e}"));
                    true
                }
            };
        }

        Some(SecondaryResource {
            title: title.to_string(),
            url,
            format: format.to_string(),
            resource_id: resource_id.clone(),
            has_drm,
            ..SecondaryResource::default()
        })
    }

    fn manifest_has_drm(&self, url: &str, task: &Task) -> Result<bool, String> {
        self.limiter.acquire();
        let manifest = self
            .transport
            .get_text(url, task.referer(), self.settings.check_timeout)
            .map_err(|e| e.to_string())?;
        Ok(manifest.contains("#EXT-X-KEY") && manifest.contains(&self.settings.drm_key_host))
    }
}

/// 热区数据：通常是 `[{audio_src, audio_name, ...}]`，不是 JSON 时退回正则抽取 mp3 地址。
fn parse_hot_zone(text: &str) -> Vec<SecondaryResource> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Array(items)) => items
            .iter()
            .filter_map(|item| {
                let url = item.get("audio_src").and_then(Value::as_str)?;
                let name = item.get("audio_name").and_then(Value::as_str)?;
                Some(SecondaryResource {
                    title: name.to_string(),
                    url: url.to_string(),
                    format: "mp3".to_string(),
                    source: Some("hot_zone".to_string()),
                    page: Some(item.get("current_page").cloned().unwrap_or(Value::from(0))),
                    hotzone_number: item
                        .get("hotzone_number")
                        .and_then(value_to_string)
                        .filter(|s| !s.is_empty()),
                    audio_id: item
                        .get("audio_id")
                        .and_then(value_to_string)
                        .filter(|s| !s.is_empty()),
                    ..SecondaryResource::default()
                })
            })
            .collect(),
        Ok(_) => Vec::new(),
        Err(_) => mp3_pattern()
            .find_iter(text)
            .enumerate()
            .map(|(i, m)| SecondaryResource {
                title: format!("音频_{}", i + 1),
                url: m.as_str().to_string(),
                format: "mp3".to_string(),
                source: Some("hot_zone".to_string()),
                page: Some(Value::from(0)),
                hotzone_number: Some(format!("AUDIO-{}", i + 1)),
                ..SecondaryResource::default()
            })
            .collect(),
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or("")
}

fn first_storage(item: &Value) -> Option<String> {
    item.get("ti_storages")?
        .as_array()?
        .first()?
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeResponse, FakeTransport};
    use serde_json::json;

    const API: &str = "https://s-file-1.ykt.cbern.com.cn/zxx/ndrv2/resources/tch_material/details/abc.json";
    const HOT: &str = "https://r1-ndr-private.ykt.cbern.com.cn/abc/hot_zone.json";
    const PDF: &str = "https://r1-ndr-private.ykt.cbern.com.cn/abc/pdf.pdf";

    fn task(api_url: &str, page_url: &str) -> Task {
        serde_json::from_value(json!({
            "id": "task_0001",
            "content_id": "abc",
            "content_type": "assets_document",
            "original_title": "英语三年级上册",
            "save_path": "教材库/小学/英语/英语_三年级_上册.pdf",
            "page_url": page_url,
            "api_url": api_url,
        }))
        .unwrap()
    }

    fn bundle_list_url() -> String {
        DEFAULT_THEMATIC_LIST_URL.replace("{content_id}", "abc")
    }

    fn resolver(transport: Arc<FakeTransport>, fetch_secondary: bool) -> ResourceResolver {
        ResourceResolver::new(
            transport,
            Arc::new(RateLimiter::disabled()),
            ResolverSettings {
                fetch_secondary,
                ..ResolverSettings::default()
            },
        )
    }

    fn details() -> Value {
        json!({
            "ti_items": [
                {"lc_ti_format": "jpg", "ti_storages": ["https://x/cover.jpg"]},
                {"lc_ti_format": "pdf", "ti_storages": [PDF, "https://r2/other.pdf"]},
                {"ti_file_flag": "hot_zone", "lc_ti_format": "json", "ti_storages": [HOT]}
            ]
        })
    }

    #[test]
    fn simple_path_picks_first_pdf_storage_and_hot_zone_audio() {
        let transport = Arc::new(
            FakeTransport::new().json(API, details()).json(
                HOT,
                json!([
                    {"audio_src": "https://r1/a1.mp3", "audio_name": "Unit 1_Lesson 1_Listen",
                     "current_page": 5, "hotzone_number": "P5-1", "audio_id": "x1"},
                    {"audio_name": "no source"},
                    {"audio_src": "https://r1/a2.mp3", "audio_name": "Song"}
                ]),
            ),
        );
        let page = "https://basic.smartedu.cn/tchMaterial/detail?contentId=abc";
        let res = resolver(transport.clone(), true).resolve(&task(API, page));

        assert_eq!(res.primary_url.as_deref(), Some(PDF));
        assert!(res.failure.is_none());
        assert_eq!(res.secondary.audios.len(), 2);
        let first = &res.secondary.audios[0];
        assert_eq!(first.hotzone_number.as_deref(), Some("P5-1"));
        assert_eq!(first.page, Some(json!(5)));
        assert_eq!(first.source.as_deref(), Some("hot_zone"));
        assert_eq!(res.secondary.audios[1].hotzone_number, None);
        assert_eq!(transport.referer_for(API).as_deref(), Some(page));
        assert_eq!(transport.referer_for(HOT).as_deref(), Some(page));
    }

    #[test]
    fn hot_zone_is_not_fetched_when_secondary_disabled() {
        let transport = Arc::new(FakeTransport::new().json(API, details()));
        let res = resolver(transport.clone(), false).resolve(&task(API, ""));
        assert_eq!(res.primary_url.as_deref(), Some(PDF));
        assert!(res.secondary.is_empty());
        assert_eq!(transport.get_count(HOT), 0);
    }

    #[test]
    fn non_json_hot_zone_falls_back_to_url_scan() {
        let audios = parse_hot_zone(
            r#"var data = {src:"https://r1/x/one.mp3", other:"https://r1/y/two.mp3"};"#,
        );
        assert_eq!(audios.len(), 2);
        assert_eq!(audios[0].url, "https://r1/x/one.mp3");
        assert_eq!(audios[1].title, "音频_2");
        assert_eq!(audios[1].hotzone_number.as_deref(), Some("AUDIO-2"));
    }

    #[test]
    fn simple_path_failures_become_unresolved() {
        let transport = Arc::new(FakeTransport::new().status(API, 500));
        let res = resolver(transport, true).resolve(&task(API, ""));
        assert!(res.primary_url.is_none());
        assert!(res.failure.unwrap().contains("500"));

        let transport = Arc::new(FakeTransport::new().body(API, "<html>"));
        let res = resolver(transport, true).resolve(&task(API, ""));
        assert!(res.failure.unwrap().contains("JSON"));

        let transport = Arc::new(FakeTransport::new().json(API, json!({"ti_items": []})));
        let res = resolver(transport, true).resolve(&task(API, ""));
        assert_eq!(res.failure.as_deref(), Some("未找到PDF资源"));

        let res = resolver(Arc::new(FakeTransport::new()), true).resolve(&task("", ""));
        assert!(res.failure.is_some());
    }

    #[test]
    fn hot_zone_failure_is_only_a_warning() {
        let transport = Arc::new(
            FakeTransport::new()
                .json(API, details())
                .route(HOT, vec![FakeResponse::Timeout]),
        );
        let res = resolver(transport, true).resolve(&task(API, ""));
        assert_eq!(res.primary_url.as_deref(), Some(PDF));
        assert!(res.secondary.is_empty());
        assert_eq!(res.warnings.len(), 1);
    }

    #[test]
    fn bundle_path_classifies_entries_and_inspects_manifests() {
        let clear = "https://r1/v/clear.m3u8";
        let locked = "https://r1/v/locked.m3u8";
        let broken = "https://r1/v/broken.m3u8";
        let list = json!([
            {"id": "v1", "title": "导入视频", "resource_type_code": "assets_video",
             "ti_items": [{"lc_ti_format": "video/mp4", "ti_storages": ["https://r1/v/a.mp4"]}]},
            {"id": "v2", "title": "加密视频", "resource_type_code": "assets_video",
             "ti_items": [{"lc_ti_format": "mp4", "ti_storages": ["https://r1/v/b.mp4"],
                           "custom_properties": {"encryption": "drm"}}]},
            {"id": 3, "title": "普通流", "resource_type_code": "assets_video",
             "ti_items": [{"lc_ti_format": "m3u8", "ti_storages": [clear]}]},
            {"id": 4, "title": "密钥流", "resource_type_code": "assets_video",
             "ti_items": [{"lc_ti_format": "m3u8", "ti_storages": [locked]}]},
            {"id": 5, "title": "坏流", "resource_type_code": "assets_video",
             "ti_items": [{"lc_ti_format": "m3u8", "ti_storages": [broken]}]},
            {"id": "a1", "title": "朗读", "resource_type_code": "assets_audio",
             "ti_items": [{"lc_ti_format": "audio/mp3", "ti_storages": ["https://r1/a.mp3"]}]},
            {"id": "d1", "title": "学习单", "resource_type_code": "assets_document",
             "ti_items": [{"lc_ti_format": "pdf", "ti_storages": [PDF]}]},
            {"id": "d2", "title": "第二份", "resource_type_code": "assets_document",
             "ti_items": [{"lc_ti_format": "pdf", "ti_storages": ["https://r1/second.pdf"]}]}
        ]);
        let transport = Arc::new(
            FakeTransport::new()
                .json(&bundle_list_url(), list)
                .body(clear, "#EXTM3U\n#EXTINF:10,\nseg0.ts\n")
                .body(
                    locked,
                    "#EXTM3U\n#EXT-X-KEY:METHOD=AES-128,URI=\"https://ndvideo-key.ykt.eduyun.cn/k\"\n",
                )
                .status(broken, 503),
        );
        let page = "https://basic.smartedu.cn/qualityCourse?contentType=thematic_course&courseId=abc";
        let res = resolver(transport.clone(), true).resolve(&task("", page));

        assert_eq!(res.primary_url.as_deref(), Some(PDF));
        let drm: Vec<bool> = res.secondary.videos.iter().map(|v| v.has_drm).collect();
        assert_eq!(drm, vec![false, true, false, true, true]);
        assert_eq!(res.drm_videos(), 3);
        assert_eq!(res.secondary.videos[0].format, "mp4");
        assert_eq!(res.secondary.videos[2].resource_id.as_deref(), Some("3"));
        assert_eq!(res.secondary.audios.len(), 1);
        assert_eq!(res.secondary.audios[0].format, "mp3");
        assert_eq!(res.warnings.len(), 1);
        // 已标记 DRM 的 mp4 不需要探测
        assert_eq!(transport.get_count("https://r1/v/b.mp4"), 0);
    }

    #[test]
    fn bundle_without_secondary_fetching_only_looks_for_documents() {
        let list = json!([
            {"title": "视频", "resource_type_code": "assets_video",
             "ti_items": [{"lc_ti_format": "m3u8", "ti_storages": ["https://r1/v.m3u8"]}]},
            {"title": "文档", "resource_type_code": "assets_document", "ti_items": []}
        ]);
        let transport = Arc::new(FakeTransport::new().json(&bundle_list_url(), list));
        let t = task("https://x/list?contentType=thematic_course", "");
        assert!(is_bundle(&t));
        let res = resolver(transport.clone(), false).resolve(&t);
        assert!(res.primary_url.is_none());
        assert!(res.secondary.is_empty());
        assert_eq!(res.failure.as_deref(), Some("专题课程未找到PDF"));
        assert_eq!(transport.get_count("https://r1/v.m3u8"), 0);
    }
}
