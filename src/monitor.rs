//! One endpoint probe under a host/scheme.
//!
//! A monitor describes a single HTTP request (method, path, body, content
//! check) and tracks the last observed status and content digest. Request
//! execution happens in a spawned task; the owning worker applies the
//! outcome back onto the entity, which yields a list of [`MonitorEffect`]s
//! (events to report, latency samples, failing-set transitions).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::debug;
use url::Url;

use crate::aggregator::EventType;
use crate::scrub;
use crate::types::{now_secs, MonitorId};

/// Per-request transfer deadline.
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(60);

/// Samples slower than the transfer deadline are discarded.
pub const MAXIMUM_LATENCY_MICROSECONDS: u64 = 60_000_000;

/// User agent applied when neither the default header map nor the monitor
/// supplies one.
pub const DEFAULT_USER_AGENT: &str = "PollWatchBot";

const USER_AGENT_HEADER: &str = "user-agent";

/// Snapshot of the process-wide default header map.
pub type DefaultHeaders = Arc<BTreeMap<String, String>>;

/// HTTP request method used by a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Patch,
}

impl HttpMethod {
    /// Parses the inbound API token, e.g. `"get"` or `"PATCH"`.
    pub fn parse(s: &str) -> Option<HttpMethod> {
        match s.trim().to_ascii_lowercase().as_str() {
            "get" => Some(HttpMethod::Get),
            "head" => Some(HttpMethod::Head),
            "post" => Some(HttpMethod::Post),
            "put" => Some(HttpMethod::Put),
            "delete" => Some(HttpMethod::Delete),
            "options" => Some(HttpMethod::Options),
            "patch" => Some(HttpMethod::Patch),
            _ => None,
        }
    }

    /// True for methods that never carry a request body.
    pub fn is_bodyless(self) -> bool {
        matches!(
            self,
            HttpMethod::Get | HttpMethod::Head | HttpMethod::Delete | HttpMethod::Options
        )
    }

    fn as_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Options => reqwest::Method::OPTIONS,
            HttpMethod::Patch => reqwest::Method::PATCH,
        }
    }
}

/// Content integrity check applied to successful responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentCheckMode {
    NoCheck,
    ContentMatch,
    AllKeywords,
    AnyKeywords,
    SmartContentMatch,
}

impl ContentCheckMode {
    /// Parses the inbound API token; `-` is accepted in place of `_`.
    pub fn parse(s: &str) -> Option<ContentCheckMode> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "no_check" => Some(ContentCheckMode::NoCheck),
            "content_match" => Some(ContentCheckMode::ContentMatch),
            "all_keywords" => Some(ContentCheckMode::AllKeywords),
            "any_keywords" => Some(ContentCheckMode::AnyKeywords),
            "smart_content_match" => Some(ContentCheckMode::SmartContentMatch),
            _ => None,
        }
    }
}

/// Content type sent with POST/PUT/PATCH bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostContentType {
    Text,
    Json,
    Xml,
}

impl PostContentType {
    pub fn parse(s: &str) -> Option<PostContentType> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Some(PostContentType::Text),
            "json" => Some(PostContentType::Json),
            "xml" => Some(PostContentType::Xml),
            _ => None,
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            PostContentType::Text => "text/plain",
            PostContentType::Json => "application/json",
            PostContentType::Xml => "application/xml",
        }
    }
}

/// Last reported state of a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorStatus {
    Unknown,
    Working,
    Failed,
}

impl MonitorStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MonitorStatus::Unknown => "unknown",
            MonitorStatus::Working => "working",
            MonitorStatus::Failed => "failed",
        }
    }
}

/// A single endpoint probe.
#[derive(Debug)]
pub struct Monitor {
    pub id: MonitorId,
    /// Path (and optional query) applied under the host/scheme URL.
    pub path: String,
    pub method: HttpMethod,
    pub check_mode: ContentCheckMode,
    /// Raw keyword bytes; base64 was already stripped at ingest.
    pub keywords: Vec<Vec<u8>>,
    pub content_type: PostContentType,
    /// Monitor-local user-agent override; empty means "use the default".
    pub user_agent: String,
    pub post_content: Vec<u8>,
    pub status: MonitorStatus,
    last_digest: Option<[u8; 32]>,
    in_flight: bool,
}

impl Monitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: MonitorId,
        path: String,
        method: HttpMethod,
        check_mode: ContentCheckMode,
        keywords: Vec<Vec<u8>>,
        content_type: PostContentType,
        user_agent: String,
        post_content: Vec<u8>,
    ) -> Self {
        Self {
            id,
            path,
            method,
            check_mode,
            keywords,
            content_type,
            user_agent,
            post_content,
            status: MonitorStatus::Unknown,
            last_digest: None,
            in_flight: false,
        }
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Marks a request as issued. Returns false when one is already pending,
    /// in which case no new request may be started.
    pub fn begin_check(&mut self) -> bool {
        if self.in_flight {
            return false;
        }
        self.in_flight = true;
        true
    }

    /// Cancels the in-flight request; the status returns to UNKNOWN.
    pub fn abort(&mut self) {
        self.in_flight = false;
        self.status = MonitorStatus::Unknown;
    }

    /// Builds the request description for this monitor against its
    /// host/scheme base URL.
    pub fn probe_spec(&self, base_url: &Url, default_headers: DefaultHeaders) -> ProbeSpec {
        let mut url = base_url.clone();
        url.set_path(&self.path);

        // Only body-carrying requests consult the monitor-local override;
        // bodyless methods always use the default-header user agent.
        let user_agent = if self.method.is_bodyless() || self.user_agent.is_empty() {
            None
        } else {
            Some(self.user_agent.clone())
        };

        ProbeSpec {
            url,
            method: self.method,
            content_type: self.content_type,
            user_agent,
            body: if self.method.is_bodyless() {
                Vec::new()
            } else {
                self.post_content.clone()
            },
            default_headers,
        }
    }

    /// Applies a completed probe to the monitor state.
    pub fn apply_outcome(&mut self, outcome: ProbeOutcome, ctx: &CheckContext) -> Vec<MonitorEffect> {
        self.in_flight = false;
        match outcome.result {
            Err(message) => self.apply_failure(message),
            Ok(success) => self.apply_success(outcome.started_unix, outcome.elapsed, success, ctx),
        }
    }

    fn apply_failure(&mut self, message: String) -> Vec<MonitorEffect> {
        let mut effects = Vec::new();
        if self.status != MonitorStatus::Failed {
            effects.push(MonitorEffect::Event {
                event_type: EventType::NoResponse,
                status: self.status,
                hash: None,
                message,
            });
            self.status = MonitorStatus::Failed;
            effects.push(MonitorEffect::NowFailed);
        }
        effects
    }

    fn apply_success(
        &mut self,
        started_unix: u64,
        elapsed: Duration,
        success: ProbeSuccess,
        ctx: &CheckContext,
    ) -> Vec<MonitorEffect> {
        let mut effects = Vec::new();

        if self.status != MonitorStatus::Working {
            effects.push(MonitorEffect::NowResponsive);
            effects.push(MonitorEffect::Event {
                event_type: EventType::Working,
                status: self.status,
                hash: None,
                message: String::new(),
            });
        }
        self.status = MonitorStatus::Working;

        match self.check_mode {
            ContentCheckMode::NoCheck => {}
            ContentCheckMode::ContentMatch => self.check_content_change(&success.body, &mut effects),
            ContentCheckMode::AnyKeywords => self.check_any_keyword(&success.body, &mut effects),
            ContentCheckMode::AllKeywords => self.check_all_keywords(&success.body, &mut effects),
            ContentCheckMode::SmartContentMatch => {
                self.check_content_change_smart(&success.body, &mut effects)
            }
        }

        if ctx.latency_enabled {
            let microseconds = (elapsed.as_nanos() as u64 + 500) / 1_000;
            if microseconds <= MAXIMUM_LATENCY_MICROSECONDS {
                effects.push(MonitorEffect::Latency {
                    timestamp: started_unix,
                    microseconds: microseconds as u32,
                });
            }
        }

        if let Some(expiry) = success.certificate_expiry {
            effects.push(MonitorEffect::CertificateObserved { expiry });
        }

        effects
    }

    fn check_content_change(&mut self, body: &[u8], effects: &mut Vec<MonitorEffect>) {
        let mut hasher = Sha256::new();
        hasher.update(self.id.to_le_bytes());
        hasher.update(body);
        let digest: [u8; 32] = hasher.finalize().into();

        match self.last_digest {
            None => self.last_digest = Some(digest),
            Some(previous) if previous != digest => {
                effects.push(MonitorEffect::Event {
                    event_type: EventType::ContentChanged,
                    status: self.status,
                    hash: Some(digest.to_vec()),
                    message: String::new(),
                });
                self.last_digest = Some(digest);
            }
            Some(_) => {}
        }
    }

    fn check_any_keyword(&mut self, body: &[u8], effects: &mut Vec<MonitorEffect>) {
        if self.keywords.is_empty() {
            return;
        }

        let mut hasher = Sha256::new();
        hasher.update(self.id.to_le_bytes());
        hasher.update(body);

        let matched = self
            .keywords
            .iter()
            .find(|keyword| contains_subslice(body, keyword));
        if let Some(keyword) = matched {
            hasher.update(keyword);
        }
        let digest: [u8; 32] = hasher.finalize().into();

        if matched.is_none() && self.last_digest != Some(digest) {
            effects.push(MonitorEffect::Event {
                event_type: EventType::Keywords,
                status: self.status,
                hash: Some(digest.to_vec()),
                message: String::new(),
            });
        }
        self.last_digest = Some(digest);
    }

    fn check_all_keywords(&mut self, body: &[u8], effects: &mut Vec<MonitorEffect>) {
        if self.keywords.is_empty() {
            return;
        }

        let mut hasher = Sha256::new();
        hasher.update(self.id.to_le_bytes());
        hasher.update(body);

        let mut missing: Option<&[u8]> = None;
        for keyword in &self.keywords {
            if contains_subslice(body, keyword) {
                hasher.update(keyword);
            } else {
                missing = Some(keyword);
                break;
            }
        }
        let digest: [u8; 32] = hasher.finalize().into();

        if let Some(keyword) = missing {
            if self.last_digest != Some(digest) {
                effects.push(MonitorEffect::Event {
                    event_type: EventType::Keywords,
                    status: self.status,
                    hash: Some(digest.to_vec()),
                    message: format!("Missing keyword \"{}\"", String::from_utf8_lossy(keyword)),
                });
            }
        }
        self.last_digest = Some(digest);
    }

    fn check_content_change_smart(&mut self, body: &[u8], effects: &mut Vec<MonitorEffect>) {
        let digest = scrub::smart_digest(self.id, body);

        match self.last_digest {
            None => self.last_digest = Some(digest),
            Some(previous) if previous != digest => {
                effects.push(MonitorEffect::Event {
                    event_type: EventType::ContentChanged,
                    status: self.status,
                    hash: Some(digest.to_vec()),
                    message: String::new(),
                });
                self.last_digest = Some(digest);
            }
            Some(_) => {}
        }
    }
}

/// Conditions the worker resolves from the owning customer before applying
/// an outcome.
pub struct CheckContext {
    pub latency_enabled: bool,
}

/// State changes produced by applying a probe outcome.
#[derive(Debug)]
pub enum MonitorEffect {
    /// Report an anomaly event; `status` is the monitor status at the time
    /// the event was observed (before any transition it describes).
    Event {
        event_type: EventType,
        status: MonitorStatus,
        hash: Option<Vec<u8>>,
        message: String,
    },
    /// The monitor left the failing set.
    NowResponsive,
    /// The monitor entered the failing set.
    NowFailed,
    /// A latency sample to record, if the customer measures latency.
    Latency { timestamp: u64, microseconds: u32 },
    /// A TLS peer certificate with this expiry was observed.
    CertificateObserved { expiry: u64 },
}

/// Everything needed to execute one probe off the worker task.
pub struct ProbeSpec {
    pub url: Url,
    pub method: HttpMethod,
    pub content_type: PostContentType,
    pub user_agent: Option<String>,
    pub body: Vec<u8>,
    pub default_headers: DefaultHeaders,
}

/// Body and TLS details of a successful probe.
pub struct ProbeSuccess {
    pub body: Vec<u8>,
    pub certificate_expiry: Option<u64>,
}

/// Result of a finished probe, delivered back to the owning worker.
pub struct ProbeOutcome {
    pub started_unix: u64,
    pub elapsed: Duration,
    pub result: Result<ProbeSuccess, String>,
}

/// Executes a probe with the worker's shared HTTP client.
pub async fn execute_probe(client: reqwest::Client, spec: ProbeSpec) -> ProbeOutcome {
    let started_unix = now_secs();
    let started = Instant::now();

    let mut request = client.request(spec.method.as_reqwest(), spec.url.clone());

    let mut user_agent: Option<&str> = None;
    for (name, value) in spec.default_headers.iter() {
        if name.eq_ignore_ascii_case(USER_AGENT_HEADER) {
            user_agent = Some(value.as_str());
        } else {
            request = request.header(name.as_str(), value.as_str());
        }
    }
    let user_agent = spec.user_agent.as_deref().or(user_agent).unwrap_or(DEFAULT_USER_AGENT);
    request = request.header(reqwest::header::USER_AGENT, user_agent);

    if !spec.method.is_bodyless() {
        request = request
            .header(reqwest::header::CONTENT_TYPE, spec.content_type.mime())
            .body(spec.body);
    }

    metrics::counter!("probes_issued").increment(1);

    let result = match request.send().await {
        Ok(response) => {
            let certificate_expiry = peer_certificate_expiry(&response);
            match response.error_for_status() {
                Ok(response) => match response.bytes().await {
                    Ok(body) => Ok(ProbeSuccess {
                        body: body.to_vec(),
                        certificate_expiry,
                    }),
                    Err(error) => Err(error.to_string()),
                },
                Err(error) => Err(error.to_string()),
            }
        }
        Err(error) => Err(error.to_string()),
    };

    if result.is_err() {
        metrics::counter!("probes_failed").increment(1);
        debug!(url = %spec.url, "probe failed");
    }

    ProbeOutcome {
        started_unix,
        elapsed: started.elapsed(),
        result,
    }
}

/// Reads the peer certificate's notAfter from the response TLS info, when
/// the client was built with `tls_info(true)` and the scheme was https.
fn peer_certificate_expiry(response: &reqwest::Response) -> Option<u64> {
    let info = response.extensions().get::<reqwest::tls::TlsInfo>()?;
    let der = info.peer_certificate()?;
    let (_, certificate) = x509_parser::parse_x509_certificate(der).ok()?;
    let not_after = certificate.validity().not_after.timestamp();
    u64::try_from(not_after).ok()
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    if haystack.len() < needle.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|window| window == needle)
}
