//! Extraction Engine
//!
//! An [`Extractor`] owns a growable list of [`Drop`]s, starting with the seed
//! URL, and drives each one through fixed steps:
//!
//! ```text
//! Start -> (fetch) -> Body -> [Dom, HTML only] -> Finish
//! ```
//!
//! then, once every drop went through, builds the final HTML and runs the
//! `PostProcess` step. Each step runs the whole processor chain; processors
//! check [`ProcessMessage::step`] and ignore the steps they don't handle.
//!
//! Processors can add drops (multi-page articles), replace the only drop and
//! rewind the cursor (redirect-like swaps), or cancel the run. Resets and
//! the drop count are bounded so a misbehaving processor cannot loop
//! forever.
//!
//! # Usage
//!
//! ```rust,ignore
//! use snapshot::extract::{Extractor, ExtractorOptions, Flow, ProcessMessage, Step};
//!
//! let mut ex = Extractor::new("https://example.net/article", ExtractorOptions::default())?;
//! ex.add_processor(|m: &mut ProcessMessage, ex: &mut Extractor| {
//!     if m.step() == Step::Finish {
//!         tracing::info!(title = %ex.first_drop().title, "loaded");
//!     }
//!     Flow::Continue
//! });
//! ex.run().await?;
//! ```

pub mod client;
pub mod drop;
pub mod log;
pub mod pattern;
pub mod picture;

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use ipnet::IpNet;
use lazy_static::lazy_static;
use scraper::{Html, Selector};
use url::Url;

use crate::error::{ExtractError, ExtractResult};

pub use client::{Client, ClientBuilder, ProxyMatch, RequestOptions, Response};
pub use drop::{Drop, DropMeta, DropProperties};
pub use log::{ErrorList, Level, RunLog};
pub use picture::Picture;

/// Position resets allowed in a single run.
pub const MAX_RESET: usize = 10;

/// Drops allowed in a single run.
pub const MAX_DROPS: usize = 100;

lazy_static! {
    static ref BODY: Selector = Selector::parse("body").unwrap();
}

/// Processing steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    /// Before the drop is fetched
    Start,
    /// The raw body is available
    Body,
    /// The parsed document is available in [`ProcessMessage::dom`]
    Dom,
    /// The drop is done
    Finish,
    /// Every drop is done and [`Extractor::html`] is set
    PostProcess,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Start => "start",
            Step::Body => "body",
            Step::Dom => "dom",
            Step::Finish => "finish",
            Step::PostProcess => "postprocess",
        };
        f.write_str(name)
    }
}

/// What the chain does after a processor returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Run the next processor
    Continue,
    /// Stop the chain for this step
    Stop,
    /// Skip the next `n` processors
    Skip(usize),
}

/// One unit of the processing chain.
#[async_trait]
pub trait Processor: Send {
    async fn process(&mut self, m: &mut ProcessMessage, ex: &mut Extractor) -> Flow;
}

#[async_trait]
impl<F> Processor for F
where
    F: FnMut(&mut ProcessMessage, &mut Extractor) -> Flow + Send,
{
    async fn process(&mut self, m: &mut ProcessMessage, ex: &mut Extractor) -> Flow {
        self(m, ex)
    }
}

/// Runs `processor` only when `condition` holds.
pub fn when<C, P>(condition: C, processor: P) -> Box<dyn Processor>
where
    C: Fn(&ProcessMessage, &Extractor) -> bool + Send + 'static,
    P: Processor + 'static,
{
    Box::new(When {
        condition,
        processor,
    })
}

struct When<C, P> {
    condition: C,
    processor: P,
}

#[async_trait]
impl<C, P> Processor for When<C, P>
where
    C: Fn(&ProcessMessage, &Extractor) -> bool + Send,
    P: Processor,
{
    async fn process(&mut self, m: &mut ProcessMessage, ex: &mut Extractor) -> Flow {
        if (self.condition)(m, ex) {
            self.processor.process(m, ex).await
        } else {
            Flow::Continue
        }
    }
}

/// State shared by the processors of one run.
pub struct ProcessMessage {
    step: Step,
    /// `None` right after a reset: the next drop is the first one
    position: Option<usize>,
    reset_counter: usize,
    max_reset: usize,
    canceled: Option<String>,
    values: HashMap<String, Box<dyn Any + Send + Sync>>,
    log: RunLog,
    /// Parsed document during [`Step::Dom`]. Setting it to `None` discards
    /// the drop's content.
    pub dom: Option<Html>,
}

impl ProcessMessage {
    fn new(log: RunLog, max_reset: usize) -> Self {
        Self {
            step: Step::Start,
            position: Some(0),
            reset_counter: 0,
            max_reset,
            canceled: None,
            values: HashMap::new(),
            log,
            dom: None,
        }
    }

    pub fn step(&self) -> Step {
        self.step
    }

    /// Index of the current drop.
    pub fn position(&self) -> usize {
        self.position.unwrap_or(0)
    }

    /// True between a [`ProcessMessage::reset_position`] and the next drop.
    pub fn is_rewound(&self) -> bool {
        self.position.is_none()
    }

    pub fn reset_counter(&self) -> usize {
        self.reset_counter
    }

    /// Restarts the run at the first drop. Exceeding the allowed number of
    /// resets cancels the run.
    pub fn reset_position(&mut self) {
        if self.reset_counter >= self.max_reset {
            self.cancel("too many redirects");
        }
        self.reset_counter += 1;
        self.position = None;
    }

    /// Stops the run after the current processor.
    pub fn cancel(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        self.log.error("operation canceled", &[("err", &reason)]);
        if self.canceled.is_none() {
            self.canceled = Some(reason);
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.is_some()
    }

    pub fn cancel_reason(&self) -> Option<&str> {
        self.canceled.as_deref()
    }

    pub fn value<T: Any>(&self, name: &str) -> Option<&T> {
        self.values.get(name)?.downcast_ref()
    }

    pub fn set_value<T: Any + Send + Sync>(&mut self, name: &str, value: T) {
        self.values.insert(name.to_string(), Box::new(value));
    }

    /// Drops the parsed document and the current drop's body.
    pub fn reset_content(&mut self, ex: &mut Extractor) {
        self.dom = None;
        if let Some(drop) = ex.drops.get_mut(self.position()) {
            drop.body.clear();
        }
    }

    pub fn log(&self) -> &RunLog {
        &self.log
    }

    fn next_position(&self) -> usize {
        self.position.map_or(0, |p| p + 1)
    }
}

/// URLs already processed in a run, fragments ignored.
#[derive(Debug, Clone, Default)]
pub struct UrlList(HashSet<String>);

impl UrlList {
    pub fn add(&mut self, url: &Url) {
        self.0.insert(Self::key(url));
    }

    pub fn is_present(&self, url: &Url) -> bool {
        self.0.contains(&Self::key(url))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn key(url: &Url) -> String {
        let mut url = url.clone();
        url.set_fragment(None);
        url.to_string()
    }
}

/// Extractor construction options.
#[derive(Debug, Clone)]
pub struct ExtractorOptions {
    /// Fields attached to every run log line
    pub log_fields: Vec<(String, String)>,
    pub denied_ips: Vec<IpNet>,
    pub proxies: Vec<ProxyMatch>,
    pub max_drops: usize,
    pub max_reset: usize,
}

impl Default for ExtractorOptions {
    fn default() -> Self {
        Self {
            log_fields: Vec::new(),
            denied_ips: Vec::new(),
            proxies: Vec::new(),
            max_drops: MAX_DROPS,
            max_reset: MAX_RESET,
        }
    }
}

impl ExtractorOptions {
    pub fn with_log_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.log_fields.push((key.into(), value.into()));
        self
    }

    pub fn with_denied_ips(mut self, denied: Vec<IpNet>) -> Self {
        self.denied_ips = denied;
        self
    }

    pub fn with_proxies(mut self, proxies: Vec<ProxyMatch>) -> Self {
        self.proxies = proxies;
        self
    }

    pub fn with_max_drops(mut self, max: usize) -> Self {
        self.max_drops = max;
        self
    }

    pub fn with_max_reset(mut self, max: usize) -> Self {
        self.max_reset = max;
        self
    }
}

/// Runs the processing chain over a growing list of drops.
pub struct Extractor {
    url: Url,
    /// Concatenated body of every drop, set before [`Step::PostProcess`]
    pub html: Vec<u8>,
    /// Plain text content, set by a post-process processor
    pub text: String,
    /// Typed values processors share with the caller
    pub context: http::Extensions,
    client: Client,
    processors: Vec<Box<dyn Processor>>,
    drops: Vec<Drop>,
    visited: UrlList,
    log: RunLog,
    max_drops: usize,
    max_reset: usize,
}

impl Extractor {
    /// Creates an extractor for `src`. Only http(s) URLs are accepted.
    pub fn new(src: &str, options: ExtractorOptions) -> ExtractResult<Self> {
        let mut url = Url::parse(src)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ExtractError::UnsupportedScheme {
                scheme: url.scheme().to_string(),
            });
        }
        url.set_fragment(None);

        let log = RunLog::new(options.log_fields);
        let client = Client::builder()
            .denied_ips(options.denied_ips)
            .proxies(options.proxies)
            .log(log.clone())
            .build()
            .map_err(ExtractError::Client)?;

        Ok(Self {
            drops: vec![Drop::new(url.clone())],
            url,
            html: Vec::new(),
            text: String::new(),
            context: http::Extensions::new(),
            client,
            processors: Vec::new(),
            visited: UrlList::default(),
            log,
            max_drops: options.max_drops,
            max_reset: options.max_reset,
        })
    }

    /// Seed URL, fragment removed.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Serves `body` for `url` without network access.
    pub fn add_to_cache<K, V>(
        &self,
        url: &str,
        headers: impl IntoIterator<Item = (K, V)>,
        body: impl Into<Bytes>,
    ) where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.client.add_to_cache(url, headers, body);
    }

    pub fn is_in_cache(&self, url: &str) -> bool {
        self.client.is_in_cache(url)
    }

    pub fn log(&self) -> &RunLog {
        &self.log
    }

    pub fn logs(&self) -> Vec<String> {
        self.log.lines()
    }

    pub fn errors(&self) -> ErrorList {
        self.log.errors()
    }

    pub fn add_error(&self, err: impl fmt::Display) {
        self.log.push_error(err.to_string());
    }

    pub fn drops(&self) -> &[Drop] {
        &self.drops
    }

    pub fn drops_mut(&mut self) -> &mut [Drop] {
        &mut self.drops
    }

    /// The first drop. There is always at least one.
    pub fn first_drop(&self) -> &Drop {
        &self.drops[0]
    }

    pub fn first_drop_mut(&mut self) -> &mut Drop {
        &mut self.drops[0]
    }

    pub fn visited(&self) -> &UrlList {
        &self.visited
    }

    /// Queues a new drop after the existing ones.
    pub fn add_drop(&mut self, url: Url) {
        self.drops.push(Drop::new(url));
    }

    /// Replaces the only drop with a new one.
    pub fn replace_drop(&mut self, url: Url) -> ExtractResult<()> {
        if self.drops.len() != 1 {
            return Err(ExtractError::MultipleDrops);
        }
        self.drops[0] = Drop::new(url);
        Ok(())
    }

    pub fn add_processor(&mut self, processor: impl Processor + 'static) {
        self.processors.push(Box::new(processor));
    }

    pub fn add_processors(&mut self, processors: impl IntoIterator<Item = Box<dyn Processor>>) {
        self.processors.extend(processors);
    }

    /// Runs every drop through the chain, then post-processes.
    ///
    /// Failing to load the first drop, or a cancellation, ends the run with
    /// an error; the error list carries the details. Any other drop failing
    /// to load is recorded and skipped.
    pub async fn run(&mut self) -> ExtractResult<()> {
        // Processors get `&mut Extractor`, so the chain lives outside of it
        // while running. Processors added meanwhile go after the chain.
        let mut processors = std::mem::take(&mut self.processors);
        let result = self.run_drops(&mut processors).await;
        processors.append(&mut self.processors);
        self.processors = processors;
        result
    }

    async fn run_drops(&mut self, processors: &mut [Box<dyn Processor>]) -> ExtractResult<()> {
        let mut m = ProcessMessage::new(self.log.clone(), self.max_reset);
        let mut i = 0;

        while i < self.drops.len() {
            let url = self.drops[i].url.clone();
            if self.visited.is_present(&url) {
                i += 1;
                continue;
            }
            self.visited.add(&url);

            m.position = Some(i);
            if self.drops.len() >= self.max_drops {
                m.cancel("too many pages");
                return Err(canceled(&m));
            }

            self.log.info("start", &[("idx", &i), ("url", &url)]);

            self.run_step(&mut m, Step::Start, processors).await?;

            if let Err(err) = self.drops[i].load(&self.client).await {
                if i == 0 {
                    self.log.error("cannot load resource", &[("url", &url), ("err", &err)]);
                    return Err(ExtractError::Load {
                        url: url.to_string(),
                        source: err,
                    });
                }
                self.log.warn("cannot load resource", &[("url", &url), ("err", &err)]);
                self.add_error(format!("cannot load {url}: {err}"));
                self.drops[i].errors.push(err.to_string());
                i += 1;
                continue;
            }

            self.run_step(&mut m, Step::Body, processors).await?;

            if self.drops[i].is_html() {
                let doc = Html::parse_document(&String::from_utf8_lossy(&self.drops[i].body));
                m.dom = Some(doc);

                let dom_result = self.run_step(&mut m, Step::Dom, processors).await;
                let dom = m.dom.take();
                dom_result?;

                // After a reset, index `i` holds another drop.
                if let (Some(dom), false) = (dom, m.is_rewound()) {
                    self.drops[i].body = body_html(&dom).into_bytes();
                }
            }

            self.run_step(&mut m, Step::Finish, processors).await?;

            i = m.next_position();
        }

        self.set_final_html();
        self.run_step(&mut m, Step::PostProcess, processors).await
    }

    async fn run_step(
        &mut self,
        m: &mut ProcessMessage,
        step: Step,
        processors: &mut [Box<dyn Processor>],
    ) -> ExtractResult<()> {
        m.step = step;
        self.log.debug("step", &[("step", &step), ("idx", &m.position())]);

        let mut idx = 0;
        while idx < processors.len() && !m.is_canceled() {
            match processors[idx].process(m, self).await {
                Flow::Continue => idx += 1,
                Flow::Skip(n) => idx = idx.saturating_add(n).saturating_add(1),
                Flow::Stop => break,
            }
        }

        if m.is_canceled() {
            return Err(canceled(m));
        }
        Ok(())
    }

    fn set_final_html(&mut self) {
        let mut html = String::new();
        for (i, drop) in self.drops.iter().enumerate() {
            if drop.body.is_empty() {
                continue;
            }
            html.push_str(&format!("<!-- page {} -->\n", i + 1));
            html.push_str(&String::from_utf8_lossy(&drop.body));
            html.push('\n');
        }
        self.html = html.into_bytes();
    }
}

fn canceled(m: &ProcessMessage) -> ExtractError {
    ExtractError::Canceled {
        reason: m.cancel_reason().unwrap_or_default().to_string(),
    }
}

/// Children of `<body>`, serialized.
fn body_html(doc: &Html) -> String {
    match doc.select(&BODY).next() {
        Some(body) => body.inner_html(),
        None => doc.root_element().html(),
    }
}
