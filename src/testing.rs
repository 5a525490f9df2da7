//! 测试用的内存 HTTP 实现：按 URL 预设响应序列，并记录所有请求。

use std::collections::HashMap;
use std::io::{self, Cursor, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::network::http::{HttpBody, HttpTransport, TransportError};

#[derive(Debug, Clone)]
pub enum FakeResponse {
    /// 完整响应，声明长度与实际一致。
    Body(Vec<u8>),
    /// 声明 `advertised` 字节，但只发送 `bytes` 后正常结束。
    Short { bytes: Vec<u8>, advertised: u64 },
    /// 发送部分字节后连接被重置。
    Reset(Vec<u8>),
    Status(u16),
    Timeout,
    /// 在请求处理中直接 panic，用来检验工作线程的隔离。
    Panic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Get(String),
    Head(String),
}

#[derive(Default)]
pub struct FakeTransport {
    routes: Mutex<HashMap<String, Vec<FakeResponse>>>,
    heads: Mutex<HashMap<String, Result<Option<u64>, u16>>>,
    calls: Mutex<Vec<Call>>,
    referers: Mutex<Vec<(String, Option<String>)>>,
    trips: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 依次返回给定响应；用完后重复最后一个。
    pub fn route(self, url: &str, responses: Vec<FakeResponse>) -> Self {
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_string(), responses);
        self
    }

    pub fn body(self, url: &str, bytes: impl Into<Vec<u8>>) -> Self {
        self.route(url, vec![FakeResponse::Body(bytes.into())])
    }

    pub fn json(self, url: &str, value: serde_json::Value) -> Self {
        self.body(url, value.to_string())
    }

    pub fn status(self, url: &str, code: u16) -> Self {
        self.route(url, vec![FakeResponse::Status(code)])
    }

    pub fn head(self, url: &str, result: Result<Option<u64>, u16>) -> Self {
        self.heads.lock().unwrap().insert(url.to_string(), result);
        self
    }

    /// 请求 `url` 时置位 `flag`，用来在运行中途触发取消。
    pub fn trip(self, url: &str, flag: Arc<AtomicBool>) -> Self {
        self.trips.lock().unwrap().insert(url.to_string(), flag);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn get_count(&self, url: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Get(u) if u == url))
            .count()
    }

    pub fn referer_for(&self, url: &str) -> Option<String> {
        self.referers
            .lock()
            .unwrap()
            .iter()
            .find(|(u, _)| u == url)
            .and_then(|(_, r)| r.clone())
    }

    fn next(&self, url: &str) -> FakeResponse {
        let mut routes = self.routes.lock().unwrap();
        match routes.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.remove(0),
            Some(queue) if !queue.is_empty() => queue[0].clone(),
            _ => FakeResponse::Status(404),
        }
    }

    fn record_get(&self, url: &str, referer: Option<&str>) {
        self.calls.lock().unwrap().push(Call::Get(url.to_string()));
        self.referers
            .lock()
            .unwrap()
            .push((url.to_string(), referer.map(str::to_string)));
        if let Some(flag) = self.trips.lock().unwrap().get(url) {
            flag.store(true, Ordering::SeqCst);
        }
    }
}

struct ResetReader {
    inner: Cursor<Vec<u8>>,
}

impl Read for ResetReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            ));
        }
        Ok(n)
    }
}

fn status_error(url: &str, code: u16) -> TransportError {
    TransportError::Status {
        status: code,
        url: url.to_string(),
    }
}

impl HttpTransport for FakeTransport {
    fn get_text(
        &self,
        url: &str,
        referer: Option<&str>,
        _timeout: Duration,
    ) -> Result<String, TransportError> {
        self.record_get(url, referer);
        match self.next(url) {
            FakeResponse::Body(bytes) | FakeResponse::Short { bytes, .. } => {
                Ok(String::from_utf8_lossy(&bytes).into_owned())
            }
            FakeResponse::Reset(_) => Err(TransportError::Request("connection reset".into())),
            FakeResponse::Status(code) => Err(status_error(url, code)),
            FakeResponse::Timeout => Err(TransportError::Timeout(url.to_string())),
            FakeResponse::Panic => panic!("scripted panic for {url}"),
        }
    }

    fn get_body(&self, url: &str, referer: Option<&str>) -> Result<HttpBody, TransportError> {
        self.record_get(url, referer);
        match self.next(url) {
            FakeResponse::Body(bytes) => Ok(HttpBody {
                content_length: Some(bytes.len() as u64).filter(|n| *n > 0),
                reader: Box::new(Cursor::new(bytes)),
            }),
            FakeResponse::Short { bytes, advertised } => Ok(HttpBody {
                content_length: Some(advertised),
                reader: Box::new(Cursor::new(bytes)),
            }),
            FakeResponse::Reset(bytes) => Ok(HttpBody {
                content_length: None,
                reader: Box::new(ResetReader {
                    inner: Cursor::new(bytes),
                }),
            }),
            FakeResponse::Status(code) => Err(status_error(url, code)),
            FakeResponse::Timeout => Err(TransportError::Timeout(url.to_string())),
            FakeResponse::Panic => panic!("scripted panic for {url}"),
        }
    }

    fn head_length(&self, url: &str, _timeout: Duration) -> Result<Option<u64>, TransportError> {
        self.calls.lock().unwrap().push(Call::Head(url.to_string()));
        match self.heads.lock().unwrap().get(url) {
            Some(Ok(len)) => Ok(*len),
            Some(Err(code)) => Err(status_error(url, *code)),
            None => Err(TransportError::Connect(url.to_string())),
        }
    }
}

/// 一个能通过 smart 检查的最小 PDF：文件头 + 填充 + EOF 标记，总长 `size` 字节。
pub fn valid_pdf(size: usize) -> Vec<u8> {
    let head = b"%PDF-1.7\n";
    let tail = b"\n%%EOF\n";
    let mut out = Vec::with_capacity(size);
    out.extend_from_slice(head);
    out.resize(size.saturating_sub(tail.len()).max(head.len()), b' ');
    out.extend_from_slice(tail);
    out
}

pub fn write_file(path: &Path, bytes: &[u8]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, bytes).unwrap();
}
