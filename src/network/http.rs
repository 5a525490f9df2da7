//! HTTP 传输层。
//!
//! 引擎只通过 [`HttpTransport`] 访问网络：生产环境使用基于 `reqwest::blocking` 的
//! [`ReqwestTransport`]，测试中替换为内存实现。

use std::io::Read;
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::header::{
    ACCEPT, ACCEPT_ENCODING, ACCEPT_LANGUAGE, CONNECTION, CONTENT_LENGTH, HeaderMap, HeaderName,
    HeaderValue, REFERER, USER_AGENT,
};
use thiserror::Error;

const AUTH_HEADER: &str = "x-nd-auth";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP {status}: {url}")]
    Status { status: u16, url: String },
    #[error("请求超时: {0}")]
    Timeout(String),
    #[error("连接失败: {0}")]
    Connect(String),
    #[error("请求失败: {0}")]
    Request(String),
    #[error("无效的请求头: {0}")]
    Header(String),
}

impl TransportError {
    /// 超时、连接失败、5xx/408/429 属于瞬时错误，值得在同一节点上重试。
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Status { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            TransportError::Timeout(_)
            | TransportError::Connect(_)
            | TransportError::Request(_) => true,
            TransportError::Header(_) => false,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return TransportError::Status {
                status: status.as_u16(),
                url: err.url().map(|u| u.to_string()).unwrap_or_default(),
            };
        }
        if err.is_timeout() {
            TransportError::Timeout(err.to_string())
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Request(err.to_string())
        }
    }
}

/// 一个已开始的响应体。`content_length` 为源站声明的长度（未声明或为 0 时为 `None`）。
pub struct HttpBody {
    pub content_length: Option<u64>,
    pub reader: Box<dyn Read + Send>,
}

pub trait HttpTransport: Send + Sync {
    /// GET 并把响应体读成文本（元数据、热区数据、m3u8 清单）。
    fn get_text(
        &self,
        url: &str,
        referer: Option<&str>,
        timeout: Duration,
    ) -> Result<String, TransportError>;

    /// GET 并返回流式响应体，调用方负责读完。
    fn get_body(&self, url: &str, referer: Option<&str>) -> Result<HttpBody, TransportError>;

    /// HEAD 请求，只取源站声明的长度。
    fn head_length(&self, url: &str, timeout: Duration) -> Result<Option<u64>, TransportError>;
}

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub token: String,
    pub user_agent: String,
    pub connect_timeout: Duration,
    /// 单次传输尝试的整体超时。
    pub transfer_timeout: Duration,
}

pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(settings: &TransportSettings) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        // 不启用 gzip 解码：声明的长度与写入字节数可以直接比较。
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.8"),
        );
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&settings.user_agent)
                .unwrap_or(HeaderValue::from_static("Mozilla/5.0")),
        );
        let mut auth = HeaderValue::from_str(&auth_value(&settings.token))
            .map_err(|e| TransportError::Header(e.to_string()))?;
        auth.set_sensitive(true);
        headers.insert(HeaderName::from_static(AUTH_HEADER), auth);

        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.transfer_timeout)
            .build()?;
        Ok(Self { client })
    }

    fn with_referer(
        builder: reqwest::blocking::RequestBuilder,
        referer: Option<&str>,
    ) -> reqwest::blocking::RequestBuilder {
        match referer.and_then(|r| HeaderValue::from_str(r).ok()) {
            Some(value) => builder.header(REFERER, value),
            None => builder,
        }
    }
}

impl HttpTransport for ReqwestTransport {
    fn get_text(
        &self,
        url: &str,
        referer: Option<&str>,
        timeout: Duration,
    ) -> Result<String, TransportError> {
        let builder = Self::with_referer(self.client.get(url), referer).timeout(timeout);
        let resp = builder.send()?.error_for_status()?;
        Ok(resp.text()?)
    }

    fn get_body(&self, url: &str, referer: Option<&str>) -> Result<HttpBody, TransportError> {
        let resp = Self::with_referer(self.client.get(url), referer)
            .send()?
            .error_for_status()?;
        Ok(HttpBody {
            content_length: advertised_length(&resp),
            reader: Box::new(resp),
        })
    }

    fn head_length(&self, url: &str, timeout: Duration) -> Result<Option<u64>, TransportError> {
        let resp = self.client.head(url).timeout(timeout).send()?;
        if !resp.status().is_success() {
            return Err(TransportError::Status {
                status: resp.status().as_u16(),
                url: url.to_string(),
            });
        }
        Ok(advertised_length(&resp))
    }
}

pub fn auth_value(token: &str) -> String {
    format!("MAC id=\"{}\",nonce=\"0\",mac=\"0\"", token.trim())
}

// 直接读 Content-Length 头：HEAD 响应没有响应体，body size hint 不可靠。
fn advertised_length(resp: &Response) -> Option<u64> {
    resp.headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|len| *len > 0)
}
