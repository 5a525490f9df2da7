//! 保存路径：任务中的 `save_path` 映射到输出目录，附属资源放在主文档旁的子目录里。

use std::path::{Component, Path, PathBuf};

use super::models::{ResourceKind, SecondaryResource, Task};
use crate::base_system::context::safe_fs_name;

/// 任务列表里 `save_path` 的默认根目录名。
pub const LIBRARY_ROOT: &str = "教材库";

const NAME_MAX_CHARS: usize = 100;

#[derive(Debug, Clone)]
pub struct PathLayout {
    output_dir: PathBuf,
}

impl PathLayout {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// 以 `教材库/` 开头的路径换根到输出目录，其余直接拼在输出目录下。
    /// 绝对路径前缀和 `..` 被丢弃，结果总在输出目录内。
    pub fn primary_path(&self, task: &Task) -> PathBuf {
        let mut parts = Path::new(&task.save_path)
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part),
                _ => None,
            })
            .peekable();
        if parts.peek().is_some_and(|first| *first == LIBRARY_ROOT) {
            parts.next();
        }
        let mut path = self.output_dir.clone();
        path.extend(parts);
        path
    }

    /// 附属资源路径：`<pdf 目录>/<pdf 文件名>_<类型>/…`，`index` 从 1 开始。
    ///
    /// 形如 `Unit 1_Lesson 2_标题` 的音频标题会拆成 `Unit 1/Lesson 2/` 两级目录。
    pub fn secondary_path(
        &self,
        task: &Task,
        kind: ResourceKind,
        resource: &SecondaryResource,
        index: usize,
    ) -> PathBuf {
        let primary = self.primary_path(task);
        let stem = primary
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| task.id.clone());
        let mut dir = primary
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.output_dir.clone());
        dir.push(format!("{stem}_{}", kind.dir_label()));

        if kind == ResourceKind::Audio {
            let ext = if resource.format.is_empty() {
                "mp3"
            } else {
                resource.format.as_str()
            };
            let parts: Vec<&str> = resource.title.split('_').collect();
            let content = if parts.len() >= 2 {
                dir.push(safe(parts[0].trim()));
                dir.push(safe(parts[1].trim()));
                if parts.len() > 2 {
                    parts[2..].join("_").trim().to_string()
                } else {
                    resource.title.clone()
                }
            } else {
                resource.title.clone()
            };
            let prefix = match resource.hotzone_number.as_deref() {
                Some(number) if !number.is_empty() => safe(number),
                _ => format!("{index:02}"),
            };
            return dir.join(format!("{prefix}_{}.{ext}", safe(&content)));
        }

        let title = if resource.title.trim().is_empty() {
            format!("资源_{index}")
        } else {
            resource.title.clone()
        };
        let ext = if resource.format.is_empty() {
            "unknown"
        } else {
            resource.format.as_str()
        };
        dir.join(format!("{index:02}_{}.{ext}", safe(&title)))
    }
}

fn safe(name: &str) -> String {
    safe_fs_name(name, '_', NAME_MAX_CHARS)
}
