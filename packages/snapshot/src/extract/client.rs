//! HTTP client with a resource cache, denied address ranges and per-host
//! proxies.
//!
//! Lookups go through the in-memory cache first. A cache hit never touches
//! the network, so deny rules and proxies only apply to real requests.
//!
//! Denied ranges are enforced three times: before each request (IP literal
//! or resolved host), on every redirect hop with an IP literal, and in the
//! DNS resolver used for connections.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use ipnet::IpNet;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{redirect, StatusCode};
use tracing::debug;
use url::{Host, Url};

use super::log::RunLog;
use super::pattern::glob_match;
use crate::error::{FetchError, FetchResult};

pub const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:75.0) Gecko/20100101 Firefox/75.0";

const MAX_REDIRECTS: usize = 10;

/// Routes requests whose host matches `host` (a glob) through `url`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyMatch {
    pub host: String,
    pub url: Url,
}

/// A fetched (or cached) response with its body fully read.
#[derive(Debug, Clone)]
pub struct Response {
    /// Final URL after redirects
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }
}

/// Per-request overrides.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub headers: HeaderMap,
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    headers: HeaderMap,
    body: Bytes,
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    denied_ips: Vec<IpNet>,
    proxies: Vec<ProxyMatch>,
    timeout: Duration,
    log: Option<RunLog>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self {
            denied_ips: Vec::new(),
            proxies: Vec::new(),
            timeout: Duration::from_secs(10),
            log: None,
        }
    }
}

impl ClientBuilder {
    pub fn denied_ips(mut self, denied: Vec<IpNet>) -> Self {
        self.denied_ips = denied;
        self
    }

    pub fn proxies(mut self, proxies: Vec<ProxyMatch>) -> Self {
        self.proxies = proxies;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Records cache hits in a run log.
    pub fn log(mut self, log: RunLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn build(self) -> FetchResult<Client> {
        let denied = Arc::new(self.denied_ips);

        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .connect_timeout(Duration::from_secs(15))
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Duration::from_secs(30))
            .cookie_store(true)
            .redirect(redirect_policy(denied.clone()));

        if !denied.is_empty() {
            builder = builder.dns_resolver(Arc::new(DenyResolver {
                denied: denied.clone(),
            }));
        }
        if !self.proxies.is_empty() {
            builder = builder.proxy(proxy_dispatch(Arc::new(self.proxies)));
        }

        Ok(Client {
            inner: Arc::new(Inner {
                http: builder.build()?,
                headers: RwLock::new(default_headers()),
                denied,
                cache: RwLock::new(HashMap::new()),
                log: self.log,
            }),
        })
    }
}

struct Inner {
    http: reqwest::Client,
    headers: RwLock<HeaderMap>,
    denied: Arc<Vec<IpNet>>,
    cache: RwLock<HashMap<String, CacheEntry>>,
    log: Option<RunLog>,
}

/// Cloneable fetch client; clones share the cache and default headers.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Client with no denied ranges and no proxies.
    pub fn new() -> FetchResult<Self> {
        ClientBuilder::default().build()
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Sets a default header sent with every request.
    pub fn set_header(&self, name: HeaderName, value: HeaderValue) {
        self.write_headers().insert(name, value);
    }

    /// Seeds the cache: later requests for `url` get a 200 response with
    /// these headers and body, as many times as asked.
    pub fn add_to_cache<K, V>(
        &self,
        url: &str,
        headers: impl IntoIterator<Item = (K, V)>,
        body: impl Into<Bytes>,
    ) where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_ref().as_bytes()),
                HeaderValue::from_str(value.as_ref()),
            ) {
                map.append(name, value);
            }
        }

        let entry = CacheEntry {
            headers: map,
            body: body.into(),
        };
        self.inner
            .cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(cache_key(url), entry);
    }

    pub fn is_in_cache(&self, url: &str) -> bool {
        self.inner
            .cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&cache_key(url))
    }

    pub async fn get(&self, url: &Url) -> FetchResult<Response> {
        self.send(url, RequestOptions::default()).await
    }

    pub async fn send(&self, url: &Url, options: RequestOptions) -> FetchResult<Response> {
        if let Some(rsp) = self.from_cache(url) {
            return Ok(rsp);
        }

        self.check_destination(url).await?;

        let mut headers = self
            .inner
            .headers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for (name, value) in options.headers.iter() {
            headers.insert(name.clone(), value.clone());
        }

        let mut request = self.inner.http.get(url.clone()).headers(headers);
        if let Some(timeout) = options.timeout {
            request = request.timeout(timeout);
        }

        let rsp = request.send().await?;
        let final_url = rsp.url().clone();
        let status = rsp.status();
        let headers = rsp.headers().clone();
        let body = rsp.bytes().await?;

        debug!(url = %final_url, status = status.as_u16(), size = body.len(), "fetched");

        Ok(Response {
            url: final_url,
            status,
            headers,
            body,
        })
    }

    fn from_cache(&self, url: &Url) -> Option<Response> {
        let cache = self.inner.cache.read().unwrap_or_else(|e| e.into_inner());
        let entry = cache.get(&cache_key(url.as_str()))?;

        if let Some(log) = &self.inner.log {
            log.debug("cache hit", &[("url", url)]);
        }

        Some(Response {
            url: url.clone(),
            status: StatusCode::OK,
            headers: entry.headers.clone(),
            body: entry.body.clone(),
        })
    }

    async fn check_destination(&self, url: &Url) -> FetchResult<()> {
        if self.inner.denied.is_empty() {
            return Ok(());
        }

        let ips: Vec<IpAddr> = match url.host() {
            Some(Host::Ipv4(ip)) => vec![IpAddr::V4(ip)],
            Some(Host::Ipv6(ip)) => vec![IpAddr::V6(ip)],
            Some(Host::Domain(name)) => {
                let port = url.port_or_known_default().unwrap_or(80);
                tokio::net::lookup_host((name, port))
                    .await
                    .map_err(|source| FetchError::Resolve {
                        host: name.to_string(),
                        source,
                    })?
                    .map(|addr| addr.ip())
                    .collect()
            }
            None => return Err(FetchError::NoHost(url.to_string())),
        };

        check_ips(&self.inner.denied, &ips)
    }

    fn write_headers(&self) -> std::sync::RwLockWriteGuard<'_, HeaderMap> {
        self.inner.headers.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Fails on the first address contained in a denied range.
pub fn check_ips(denied: &[IpNet], ips: &[IpAddr]) -> FetchResult<()> {
    for ip in ips {
        if let Some(rule) = denied.iter().find(|net| net.contains(ip)) {
            return Err(FetchError::Blocked {
                ip: *ip,
                rule: *rule,
            });
        }
    }
    Ok(())
}

fn cache_key(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_fragment(None);
            parsed.to_string()
        }
        Err(_) => url.to_string(),
    }
}

fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
    headers.insert(
        header::ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    );
    headers.insert(header::ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.8"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("max-age=0"));
    headers.insert(header::UPGRADE_INSECURE_REQUESTS, HeaderValue::from_static("1"));
    headers
}

fn redirect_policy(denied: Arc<Vec<IpNet>>) -> redirect::Policy {
    redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error("too many redirects");
        }

        let literal = match attempt.url().host() {
            Some(Host::Ipv4(ip)) => Some(IpAddr::V4(ip)),
            Some(Host::Ipv6(ip)) => Some(IpAddr::V6(ip)),
            _ => None,
        };
        if let Some(ip) = literal {
            if let Err(err) = check_ips(&denied, &[ip]) {
                return attempt.error(err);
            }
        }
        attempt.follow()
    })
}

fn proxy_dispatch(proxies: Arc<Vec<ProxyMatch>>) -> reqwest::Proxy {
    reqwest::Proxy::custom(move |url| {
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => return None,
        };

        proxies
            .iter()
            .find(|p| glob_match(&p.host, &host))
            .map(|p| {
                debug!(host = %host, proxy = %p.url, "using proxy");
                p.url.clone()
            })
    })
}

/// DNS resolver refusing hosts that resolve into a denied range.
struct DenyResolver {
    denied: Arc<Vec<IpNet>>,
}

impl Resolve for DenyResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let denied = self.denied.clone();
        Box::pin(async move {
            let addrs: Vec<SocketAddr> = tokio::net::lookup_host((name.as_str(), 0))
                .await?
                .collect();
            let ips: Vec<IpAddr> = addrs.iter().map(SocketAddr::ip).collect();
            check_ips(&denied, &ips)?;

            let addrs: Addrs = Box::new(addrs.into_iter());
            Ok(addrs)
        })
    }
}
