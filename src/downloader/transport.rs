//! HTTP 传输层
//!
//! 下载任务只依赖 `HttpTransport` / `HttpResponse` 两个窄接口：发送 GET（可带 Range），
//! 读取响应头，按块读取响应体。生产环境使用 reqwest 实现。

use super::error::DownloadError;
use crate::config::{Credentials, DownloadConfig};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderName, CONTENT_LENGTH, CONTENT_TYPE, LAST_MODIFIED, RANGE};
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// 一次下载请求
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    /// 从该字节开始续传，`None` 表示完整下载
    pub range_start: Option<u64>,
    pub credentials: Option<Credentials>,
}

/// 响应头中下载任务关心的部分
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub content_type: Option<String>,
    /// 本次响应体长度
    pub content_length: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl ResponseHead {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait HttpResponse: Send {
    fn head(&self) -> &ResponseHead;

    /// 读取下一块响应体，结束时返回 `Ok(None)`
    async fn chunk(&mut self) -> Result<Option<Bytes>, DownloadError>;
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: &DownloadRequest) -> Result<Box<dyn HttpResponse>, DownloadError>;
}

/// 基于 reqwest 的传输实现
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(config: &DownloadConfig) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.timeout())
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &DownloadRequest) -> Result<Box<dyn HttpResponse>, DownloadError> {
        let mut builder = self.client.get(&request.url);
        if let Some(start) = request.range_start {
            builder = builder.header(RANGE, format!("bytes={}-", start));
        }
        if let Some(credentials) = &request.credentials {
            builder = builder.basic_auth(&credentials.username, credentials.password.as_ref());
        }

        let response = builder.send().await?;
        let headers = response.headers();
        let header_str = |name: HeaderName| headers.get(name).and_then(|v| v.to_str().ok());

        let head = ResponseHead {
            status: response.status().as_u16(),
            content_type: header_str(CONTENT_TYPE).map(str::to_string),
            content_length: header_str(CONTENT_LENGTH).and_then(|v| v.trim().parse().ok()),
            last_modified: header_str(LAST_MODIFIED).and_then(parse_http_date),
        };
        debug!(
            "收到响应: url={}, status={}, length={:?}",
            request.url, head.status, head.content_length
        );

        Ok(Box::new(ReqwestResponse { head, response }))
    }
}

struct ReqwestResponse {
    head: ResponseHead,
    response: reqwest::Response,
}

#[async_trait]
impl HttpResponse for ReqwestResponse {
    fn head(&self) -> &ResponseHead {
        &self.head
    }

    async fn chunk(&mut self) -> Result<Option<Bytes>, DownloadError> {
        Ok(self.response.chunk().await?)
    }
}

/// 解析 HTTP 日期（RFC 7231 IMF-fixdate，兼容 RFC 2822 写法）
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
pub(crate) mod mock {
    //! 测试用脚本化传输

    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// 模拟的远程资源，按 Range 头返回 200/206/416
    #[derive(Debug, Clone)]
    pub(crate) struct MockResource {
        pub body: Vec<u8>,
        pub content_type: Option<String>,
        pub last_modified: Option<DateTime<Utc>>,
        pub chunk_size: usize,
        pub chunk_delay: Option<Duration>,
        /// 忽略 Range，总是返回完整内容
        pub ignore_range: bool,
    }

    impl MockResource {
        pub(crate) fn new(body: Vec<u8>) -> Self {
            Self {
                body,
                content_type: Some("audio/mpeg".to_string()),
                last_modified: None,
                chunk_size: 512,
                chunk_delay: None,
                ignore_range: false,
            }
        }
    }

    /// 预先编排的一次响应
    #[derive(Debug, Clone)]
    pub(crate) enum MockReply {
        Status(u16),
        /// 响应头正常但响应体永远不返回
        Stall,
        /// 声明长度大于实际返回的内容
        Truncated { declared: u64, body: Vec<u8> },
    }

    pub(crate) struct MockTransport {
        resource: MockResource,
        scripted: Mutex<VecDeque<MockReply>>,
        requests: Mutex<Vec<DownloadRequest>>,
    }

    impl MockTransport {
        pub(crate) fn new(resource: MockResource) -> Self {
            Self {
                resource,
                scripted: Mutex::new(VecDeque::new()),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn script(self, replies: Vec<MockReply>) -> Self {
            *self.scripted.lock() = replies.into();
            self
        }

        pub(crate) fn requests(&self) -> Vec<DownloadRequest> {
            self.requests.lock().clone()
        }

        pub(crate) fn range_starts(&self) -> Vec<Option<u64>> {
            self.requests().iter().map(|r| r.range_start).collect()
        }

        fn reply_for(&self, request: &DownloadRequest) -> MockBody {
            let res = &self.resource;
            let head = |status: u16, len: Option<u64>| ResponseHead {
                status,
                content_type: res.content_type.clone(),
                content_length: len,
                last_modified: res.last_modified,
            };

            if let Some(reply) = self.scripted.lock().pop_front() {
                return match reply {
                    MockReply::Status(status) => MockBody::new(head(status, Some(0)), Vec::new(), res),
                    MockReply::Stall => MockBody {
                        head: head(200, Some(res.body.len() as u64)),
                        chunks: VecDeque::new(),
                        delay: None,
                        stall: true,
                    },
                    MockReply::Truncated { declared, body } => {
                        MockBody::new(head(200, Some(declared)), body, res)
                    }
                };
            }

            let len = res.body.len() as u64;
            match request.range_start {
                Some(start) if !res.ignore_range => {
                    if start >= len {
                        MockBody::new(head(416, Some(0)), Vec::new(), res)
                    } else {
                        let rest = res.body[start as usize..].to_vec();
                        MockBody::new(head(206, Some(len - start)), rest, res)
                    }
                }
                _ => MockBody::new(head(200, Some(len)), res.body.clone(), res),
            }
        }
    }

    #[async_trait]
    impl HttpTransport for MockTransport {
        async fn send(
            &self,
            request: &DownloadRequest,
        ) -> Result<Box<dyn HttpResponse>, DownloadError> {
            self.requests.lock().push(request.clone());
            Ok(Box::new(self.reply_for(request)))
        }
    }

    struct MockBody {
        head: ResponseHead,
        chunks: VecDeque<Bytes>,
        delay: Option<Duration>,
        stall: bool,
    }

    impl MockBody {
        fn new(head: ResponseHead, body: Vec<u8>, res: &MockResource) -> Self {
            let chunks = body
                .chunks(res.chunk_size.max(1))
                .map(|c| Bytes::copy_from_slice(c))
                .collect();
            Self {
                head,
                chunks,
                delay: res.chunk_delay,
                stall: false,
            }
        }
    }

    #[async_trait]
    impl HttpResponse for MockBody {
        fn head(&self) -> &ResponseHead {
            &self.head
        }

        async fn chunk(&mut self) -> Result<Option<Bytes>, DownloadError> {
            if self.stall {
                futures::future::pending::<()>().await;
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self.chunks.pop_front())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_http_date() {
        let parsed = parse_http_date("Wed, 21 Oct 2015 07:28:00 GMT").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2015, 10, 21, 7, 28, 0).unwrap());
        assert!(parse_http_date("not a date").is_none());
    }

    #[test]
    fn test_response_head_success() {
        let head = ResponseHead {
            status: 206,
            ..Default::default()
        };
        assert!(head.is_success());
        let head = ResponseHead {
            status: 416,
            ..Default::default()
        };
        assert!(!head.is_success());
    }

    #[tokio::test]
    async fn test_mock_honours_range() {
        use mock::*;
        let transport = MockTransport::new(MockResource::new(vec![7u8; 100]));
        let request = DownloadRequest {
            url: "http://example.com/a.mp3".into(),
            range_start: Some(40),
            credentials: None,
        };
        let mut resp = transport.send(&request).await.unwrap();
        assert_eq!(resp.head().status, 206);
        assert_eq!(resp.head().content_length, Some(60));

        let mut total = 0;
        while let Some(chunk) = resp.chunk().await.unwrap() {
            total += chunk.len();
        }
        assert_eq!(total, 60);

        let past_end = DownloadRequest {
            range_start: Some(100),
            ..request
        };
        let resp = transport.send(&past_end).await.unwrap();
        assert_eq!(resp.head().status, 416);
        assert_eq!(transport.range_starts(), vec![Some(40), Some(100)]);
    }
}
