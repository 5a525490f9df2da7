//! 任务筛选：按学段、学科、版本过滤，可排除教师用书，最后按数量截断。

use super::models::Task;

const GUIDE_STAGE: &str = "教学指南";
const TEACHER_BOOK: &str = "教师用书";

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub stage: Option<String>,
    pub subject: Option<String>,
    pub version: Option<String>,
    pub exclude_teacher_books: bool,
    pub limit: Option<usize>,
}

impl TaskFilter {
    /// 是否设置了内容筛选条件（不含数量限制）。
    pub fn has_content_filters(&self) -> bool {
        self.stage.is_some()
            || self.subject.is_some()
            || self.version.is_some()
            || self.exclude_teacher_books
    }

    pub fn matches(&self, task: &Task) -> bool {
        if let Some(stage) = &self.stage {
            let wanted = normalize(stage);
            let actual = normalize(task.meta_str("stage"));
            // 教学指南类资源在任务列表中常常没有学段
            let guide = wanted == GUIDE_STAGE && actual.is_empty();
            if actual != wanted && !guide {
                return false;
            }
        }
        if let Some(subject) = &self.subject
            && normalize(task.meta_str("subject")) != normalize(subject)
        {
            return false;
        }
        if let Some(version) = &self.version
            && normalize(task.meta_str("version")) != normalize(version)
        {
            return false;
        }
        if self.exclude_teacher_books && is_teacher_book(task) {
            return false;
        }
        true
    }
}

pub fn is_teacher_book(task: &Task) -> bool {
    task.meta_str("grade") == TEACHER_BOOK || task.save_path.contains(TEACHER_BOOK)
}

/// 从任务列表中选出本次要处理的任务：先筛选，再按数量截断。
///
/// 重试模式不经过这里，见 `journal::split_for_retry`。
pub fn select_tasks(tasks: Vec<Task>, filter: &TaskFilter) -> Vec<Task> {
    let limit = filter.limit.unwrap_or(usize::MAX);
    tasks
        .into_iter()
        .filter(|t| filter.matches(t))
        .take(limit)
        .collect()
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}
