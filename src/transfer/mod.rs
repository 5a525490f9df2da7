//! 批量传输引擎：解析任务资源、限速、CDN 轮换重试、完整性校验，
//! 由固定数量的工作线程并发执行，汇总后写出失败记录与附属资源清单。
//!
//! 读代码入口：
//! - `orchestrator`：工作池与单任务流水线
//! - `resolver`：元数据解析（普通教材 / 专题课程）
//! - `fetcher`：单个文件的下载、重试与 CDN 切换
//! - `integrity`：已有文件是否完整

pub mod cdn;
pub mod fetcher;
pub mod filter;
pub mod integrity;
pub mod journal;
pub mod models;
pub mod orchestrator;
pub mod paths;
pub mod progress;
pub mod rate_limiter;
pub mod resolver;
