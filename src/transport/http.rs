// 基于 reqwest 的 HTTP 传输实现

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Response, StatusCode};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    EventSender, RangeRequest, ResourceInfo, TransferEvent, TransferEventKind, TransferHandle,
    Transport, TransportError,
};
use crate::config::DownloadOptions;

const USER_AGENT: &str = concat!("slicedl/", env!("CARGO_PKG_VERSION"));

/// HTTP 传输
///
/// 内部 `Client` 自带连接池，所有范围传输共享同一个实例。
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// 按下载参数构建客户端（连接超时、代理）
    pub fn new(options: &DownloadOptions) -> Result<Self, TransportError> {
        let mut builder = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(options.connect_timeout())
            .pool_max_idle_per_host(options.thread_num.max(1))
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::limited(10));

        if let Some(proxy) = options.proxy.as_deref().filter(|p| !p.trim().is_empty()) {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| TransportError::Init(format!("代理地址无效 {}: {}", proxy, e)))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| TransportError::Init(format!("构建 HTTP 客户端失败: {}", e)))?;

        Ok(Self { client })
    }

    fn build_headers(headers: &BTreeMap<String, String>) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(n), Ok(v)) => {
                    map.insert(n, v);
                }
                _ => warn!("忽略无效的请求头: {}: {}", name, value),
            }
        }
        map
    }

    /// 用 `Range: bytes=0-0` 探测大小和 Range 支持
    async fn probe_with_range(
        &self,
        url: &str,
        headers: &HeaderMap,
        timeout: Duration,
    ) -> Result<ResourceInfo, TransportError> {
        let resp = self
            .client
            .get(url)
            .headers(headers.clone())
            .header(reqwest::header::RANGE, "bytes=0-0")
            .timeout(timeout)
            .send()
            .await?;

        let status = resp.status();
        let mut info = ResourceInfo {
            redirect_url: resp.url().to_string(),
            content_hash: content_md5(&resp),
            ..Default::default()
        };

        if status == StatusCode::PARTIAL_CONTENT {
            info.accept_ranges = true;
            info.size = header_str(&resp, reqwest::header::CONTENT_RANGE)
                .and_then(|v| parse_content_range(&v))
                .and_then(|(_, _, total)| total);
        } else if status.is_success() {
            info.accept_ranges = false;
            info.size = content_length(&resp);
        } else {
            return Err(TransportError::HttpStatus(status.as_u16()));
        }
        // 不读取响应体，丢弃即中断连接
        drop(resp);

        Ok(info)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch_metadata(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<ResourceInfo, TransportError> {
        let header_map = Self::build_headers(headers);

        // 先 HEAD；失败或信息不全时退回带 Range 的 GET
        match self
            .client
            .head(url)
            .headers(header_map.clone())
            .timeout(timeout)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                let size = content_length(&resp);
                let accept_ranges = header_str(&resp, reqwest::header::ACCEPT_RANGES)
                    .map(|v| v.to_ascii_lowercase().contains("bytes"))
                    .unwrap_or(false);

                if size.is_some() && accept_ranges {
                    let info = ResourceInfo {
                        size,
                        accept_ranges,
                        content_hash: content_md5(&resp),
                        redirect_url: resp.url().to_string(),
                    };
                    debug!("HEAD 获取文件信息: {:?}", info);
                    return Ok(info);
                }
                debug!("HEAD 信息不完整 (size={:?}, ranges={})，改用 Range 探测", size, accept_ranges);
            }
            Ok(resp) => {
                debug!("HEAD 返回 {}，改用 Range 探测", resp.status());
            }
            Err(e) => {
                debug!("HEAD 请求失败: {}，改用 Range 探测", e);
            }
        }

        let info = self.probe_with_range(url, &header_map, timeout).await?;
        debug!("Range 探测获取文件信息: {:?}", info);
        Ok(info)
    }

    fn open_range(
        &self,
        request: RangeRequest,
        events: EventSender,
    ) -> Result<TransferHandle, TransportError> {
        let token = CancellationToken::new();
        let task_token = token.clone();
        let client = self.client.clone();

        let task = tokio::spawn(async move {
            let slice_index = request.slice_index;
            let transfer_id = request.transfer_id;

            let result = tokio::select! {
                _ = task_token.cancelled() => return,
                r = run_transfer(&client, &request, &events, &task_token) => r,
            };

            if task_token.is_cancelled() {
                return;
            }
            let _ = events
                .send(TransferEvent {
                    slice_index,
                    transfer_id,
                    kind: TransferEventKind::Finished(result),
                })
                .await;
        });

        Ok(TransferHandle::new(token, task))
    }
}

/// 执行一次范围传输，直到响应体读完、出错或被取消
async fn run_transfer(
    client: &Client,
    request: &RangeRequest,
    events: &EventSender,
    token: &CancellationToken,
) -> Result<(), TransportError> {
    let mut builder = client
        .get(&request.url)
        .headers(HttpTransport::build_headers(&request.headers));
    if let Some(range) = request.range_header() {
        builder = builder.header(reqwest::header::RANGE, range);
    }

    let resp = builder.send().await?;
    check_range_response(&resp, request)?;

    let mut stream = resp.bytes_stream();
    let started = Instant::now();
    let mut received = 0u64;

    loop {
        let next = match request.read_timeout {
            Some(limit) => match tokio::time::timeout(limit, stream.next()).await {
                Ok(next) => next,
                Err(_) => return Err(TransportError::ReadTimeout(limit)),
            },
            None => stream.next().await,
        };

        let chunk = match next {
            Some(chunk) => chunk?,
            None => return Ok(()),
        };
        received += chunk.len() as u64;

        let event = TransferEvent {
            slice_index: request.slice_index,
            transfer_id: request.transfer_id,
            kind: TransferEventKind::Data(chunk),
        };
        if events.send(event).await.is_err() {
            // 调度循环已退出
            return Ok(());
        }

        if request.rate_limit > 0 {
            throttle(received, request.rate_limit, started, token).await;
        }
    }
}

/// 超出限速时休眠到平均速度回落
async fn throttle(received: u64, rate_limit: u64, started: Instant, token: &CancellationToken) {
    let expected = Duration::from_secs_f64(received as f64 / rate_limit as f64);
    let elapsed = started.elapsed();
    if expected > elapsed {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(expected - elapsed) => {}
        }
    }
}

/// 校验响应状态和 Content-Range 是否与请求的范围一致
fn check_range_response(resp: &Response, request: &RangeRequest) -> Result<(), TransportError> {
    let status = resp.status();
    let ranged = request.range_header().is_some();

    if status == StatusCode::PARTIAL_CONTENT {
        let content_range = header_str(resp, reqwest::header::CONTENT_RANGE);
        let start = content_range
            .as_deref()
            .and_then(parse_content_range)
            .map(|(start, _, _)| start);
        if ranged && start != Some(request.start) {
            return Err(TransportError::RangeNotHonored {
                requested: request.start,
                status: status.as_u16(),
                content_range,
            });
        }
        return Ok(());
    }

    if status.is_success() {
        // 整个文件从 0 开始返回：只有请求起点为 0 时还能接受
        if request.start > 0 {
            return Err(TransportError::RangeNotHonored {
                requested: request.start,
                status: status.as_u16(),
                content_range: None,
            });
        }
        return Ok(());
    }

    Err(TransportError::HttpStatus(status.as_u16()))
}

fn header_str(resp: &Response, name: HeaderName) -> Option<String> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
}

/// 读 Content-Length 头（HEAD 响应的 `content_length()` 恒为 0）
fn content_length(resp: &Response) -> Option<u64> {
    header_str(resp, reqwest::header::CONTENT_LENGTH).and_then(|v| v.parse().ok())
}

/// 内容哈希（十六进制 MD5），都没有时返回空串
///
/// 优先 Content-MD5（base64）；其次是形如 MD5 的强 ETag（对象存储的单段上传）。
fn content_md5(resp: &Response) -> String {
    header_str(resp, HeaderName::from_static("content-md5"))
        .and_then(|v| STANDARD.decode(v.as_bytes()).ok())
        .filter(|raw| raw.len() == 16)
        .map(hex::encode)
        .or_else(|| header_str(resp, reqwest::header::ETAG).and_then(|v| md5_from_etag(&v)))
        .unwrap_or_default()
}

/// 弱 ETag 和多段上传的 `xxx-N` 形式都不是内容哈希
fn md5_from_etag(etag: &str) -> Option<String> {
    let value = etag.strip_prefix('"')?.strip_suffix('"')?;
    (value.len() == 32 && value.chars().all(|c| c.is_ascii_hexdigit()))
        .then(|| value.to_ascii_lowercase())
}

/// 解析 `bytes start-end/total`，total 为 `*` 时返回 None
pub(crate) fn parse_content_range(value: &str) -> Option<(u64, u64, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let (start, end) = range.trim().split_once('-')?;
    let start = start.trim().parse().ok()?;
    let end = end.trim().parse().ok()?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some((start, end, total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::event_channel;
    use axum::extract::State;
    use axum::http::{header, HeaderMap as AxumHeaders, StatusCode as AxumStatus};
    use axum::response::{IntoResponse, Response as AxumResponse};
    use axum::routing::get;
    use axum::Router;
    use std::sync::Arc;

    #[derive(Clone)]
    struct ServerState {
        data: Arc<Vec<u8>>,
        honor_range: bool,
    }

    fn parse_range(value: &str) -> Option<(u64, Option<u64>)> {
        let range = value.strip_prefix("bytes=")?;
        let (start, end) = range.split_once('-')?;
        let start = start.parse().ok()?;
        let end = if end.is_empty() { None } else { Some(end.parse().ok()?) };
        Some((start, end))
    }

    async fn serve_file(State(state): State<ServerState>, headers: AxumHeaders) -> AxumResponse {
        let total = state.data.len() as u64;
        let range = headers
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range);

        match range {
            Some((start, end)) if state.honor_range && start < total => {
                let end = end.unwrap_or(total - 1).min(total - 1);
                let body = state.data[start as usize..=end as usize].to_vec();
                (
                    AxumStatus::PARTIAL_CONTENT,
                    [
                        (header::CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, total)),
                        (header::ACCEPT_RANGES, "bytes".to_string()),
                    ],
                    body,
                )
                    .into_response()
            }
            _ => (AxumStatus::OK, state.data.to_vec()).into_response(),
        }
    }

    async fn start_server(data: Vec<u8>, honor_range: bool) -> String {
        let state = ServerState {
            data: Arc::new(data),
            honor_range,
        };
        let app = Router::new()
            .route("/file.bin", get(serve_file))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/file.bin", addr)
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn range_request(url: &str, start: u64, end: Option<u64>) -> RangeRequest {
        RangeRequest {
            slice_index: 2,
            transfer_id: 7,
            url: url.to_string(),
            headers: BTreeMap::new(),
            start,
            end,
            rate_limit: 0,
            read_timeout: Some(Duration::from_secs(5)),
        }
    }

    async fn collect(mut rx: crate::transport::EventReceiver) -> (Vec<u8>, Result<(), TransportError>) {
        let mut body = Vec::new();
        while let Some(event) = rx.recv().await {
            assert_eq!(event.slice_index, 2);
            assert_eq!(event.transfer_id, 7);
            match event.kind {
                TransferEventKind::Data(bytes) => body.extend_from_slice(&bytes),
                TransferEventKind::Finished(result) => return (body, result),
            }
        }
        panic!("传输未发送结束事件");
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(parse_content_range("bytes 0-0/1234"), Some((0, 0, Some(1234))));
        assert_eq!(parse_content_range("bytes 10-19/*"), Some((10, 19, None)));
        assert_eq!(parse_content_range("items 0-1/2"), None);
        assert_eq!(parse_content_range("bytes abc"), None);
    }

    #[test]
    fn test_md5_from_etag() {
        assert_eq!(
            md5_from_etag("\"5EB63BBBE01EEED093CB22BB8F5ACDC3\"").as_deref(),
            Some("5eb63bbbe01eeed093cb22bb8f5acdc3")
        );
        assert_eq!(md5_from_etag("W/\"5eb63bbbe01eeed093cb22bb8f5acdc3\""), None);
        assert_eq!(md5_from_etag("\"5eb63bbbe01eeed093cb22bb8f5acdc3-2\""), None);
        assert_eq!(md5_from_etag("\"abc\""), None);
    }

    #[tokio::test]
    async fn test_fetch_metadata() {
        let url = start_server(sample(4096), true).await;
        let transport = HttpTransport::new(&DownloadOptions::default()).unwrap();

        let info = transport
            .fetch_metadata(&url, &BTreeMap::new(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(info.size, Some(4096));
        assert!(info.accept_ranges);
        assert!(info.redirect_url.ends_with("/file.bin"));
    }

    #[tokio::test]
    async fn test_fetch_metadata_without_range_support() {
        let url = start_server(sample(1000), false).await;
        let transport = HttpTransport::new(&DownloadOptions::default()).unwrap();

        let info = transport
            .fetch_metadata(&url, &BTreeMap::new(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(info.size, Some(1000));
        assert!(!info.accept_ranges);
    }

    #[tokio::test]
    async fn test_range_transfer() {
        let data = sample(10_000);
        let url = start_server(data.clone(), true).await;
        let transport = HttpTransport::new(&DownloadOptions::default()).unwrap();

        let (tx, rx) = event_channel();
        let _handle = transport
            .open_range(range_request(&url, 1000, Some(2999)), tx)
            .unwrap();
        let (body, result) = collect(rx).await;

        assert!(result.is_ok());
        assert_eq!(body, &data[1000..3000]);
    }

    #[tokio::test]
    async fn test_range_ignored_is_detected() {
        let url = start_server(sample(2000), false).await;
        let transport = HttpTransport::new(&DownloadOptions::default()).unwrap();

        let (tx, rx) = event_channel();
        let _handle = transport.open_range(range_request(&url, 500, None), tx).unwrap();
        let (body, result) = collect(rx).await;

        assert!(body.is_empty());
        assert!(matches!(
            result,
            Err(TransportError::RangeNotHonored { requested: 500, status: 200, .. })
        ));
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let url = start_server(sample(10), true).await;
        let transport = HttpTransport::new(&DownloadOptions::default()).unwrap();
        let missing = url.replace("file.bin", "missing.bin");

        let (tx, rx) = event_channel();
        let _handle = transport.open_range(range_request(&missing, 0, None), tx).unwrap();
        let (_, result) = collect(rx).await;
        assert!(matches!(result, Err(TransportError::HttpStatus(404))));
    }

    #[test]
    fn test_invalid_proxy_rejected() {
        let options = DownloadOptions {
            proxy: Some("::not a proxy::".into()),
            ..Default::default()
        };
        assert!(matches!(
            HttpTransport::new(&options),
            Err(TransportError::Init(_))
        ));
    }
}
