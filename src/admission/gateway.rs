//! The per-request admission pipeline.
//!
//! The gateway is the single entry point every inbound request passes
//! before reaching application logic. It applies, in order and
//! short-circuiting on the first rejection: the skip-local bypass, the
//! ACL, per-IP frequency limiting (with header-keyed extra limits and
//! the per-principal limiter), download-rate throttling, and concurrency
//! admission. Admitted requests are handed to the next handler through
//! the [`Forwarder`] hook while an in-flight permit is held.
//!
//! Derived state (compiled ACL rules, limiters, concurrency caps) is
//! rebuilt lazily whenever the settings store reports a new generation;
//! a request racing a change may be served under the previous
//! configuration, which is acceptable by design.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::json;
use tracing::{debug, error, warn};

use crate::acl::AccessControlList;
use crate::error::PalisadeError;
use crate::ratelimit::{
    Clock, DownloadThrottle, Limiter, MemoryStorage, RateLimit, SystemClock, UsageStorage,
};
use crate::settings::{LimiterSettings, SettingsStore};

use super::concurrency::{InFlightPermit, RequestLimiter};

/// The request attributes the gateway inspects.
#[derive(Debug, Clone)]
pub struct Request {
    /// The direct peer address of the connection.
    pub remote_addr: IpAddr,
    /// The request path.
    pub path: String,
    /// Request headers; names are matched case-insensitively.
    pub headers: HashMap<String, String>,
    /// Authenticated principal, when the surrounding stack resolved one.
    pub principal: Option<String>,
}

impl Request {
    /// Build a request with just an address and path.
    pub fn new(remote_addr: IpAddr, path: impl Into<String>) -> Self {
        Self {
            remote_addr,
            path: path.into(),
            headers: HashMap::new(),
            principal: None,
        }
    }

    /// Attach a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Attach a principal.
    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A response handed back through the admission chain.
#[derive(Debug, Clone)]
pub struct Response {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: Vec<(String, String)>,
    /// Response body.
    pub body: Vec<u8>,
}

impl Response {
    /// A rejection carrying a small JSON status payload.
    fn rejection(status: u16, reason: &str) -> Self {
        let body = serde_json::to_vec(&json!({
            "status": status,
            "reason": reason,
        }))
        .unwrap_or_default();
        Self {
            status,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body,
        }
    }

    fn too_many_requests(retry_after_secs: u64) -> Self {
        let mut response = Self::rejection(429, "rate limit exceeded");
        response
            .headers
            .push(("Retry-After".to_string(), retry_after_secs.to_string()));
        response
    }

    fn internal_error() -> Self {
        Self::rejection(500, "internal error")
    }
}

/// The next handler in the chain; invoked only for admitted requests.
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Handle an admitted request.
    async fn forward(&self, request: Request) -> Response;
}

/// Gateway-local options not carried by the sync protocol.
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    /// Status used for ACL rejections.
    pub deny_status: u16,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self { deny_status: 403 }
    }
}

/// An extra limit compiled for evaluation.
struct ExtraGuard {
    header: String,
    regex: Regex,
    limiter: Arc<Limiter>,
    window_secs: u64,
}

/// Limiters derived from the current settings generation.
#[derive(Default)]
struct DerivedState {
    applied_generation: u64,
    ip_limiter: Option<Arc<Limiter>>,
    user_limiter: Option<Arc<Limiter>>,
    extras: Arc<Vec<ExtraGuard>>,
}

struct FrequencyLimiters {
    ip: Option<Arc<Limiter>>,
    user: Option<Arc<Limiter>>,
    extras: Arc<Vec<ExtraGuard>>,
}

/// What the pipeline decided for one request.
enum Outcome {
    Admitted {
        permit: Option<InFlightPermit>,
        throttle: Option<DownloadThrottle>,
    },
    Rejected(Response),
}

/// The admission gateway.
pub struct AdmissionGateway {
    store: Arc<SettingsStore>,
    storage: Arc<dyn UsageStorage>,
    clock: Arc<dyn Clock>,
    options: GatewayOptions,
    acl: AccessControlList,
    request_limiter: RequestLimiter,
    derived: Mutex<DerivedState>,
}

impl AdmissionGateway {
    /// Create a gateway with in-process usage storage and the wall
    /// clock.
    pub fn new(store: Arc<SettingsStore>) -> Self {
        Self::with_backend(
            store,
            Arc::new(MemoryStorage::new()),
            Arc::new(SystemClock::new()),
            GatewayOptions::default(),
        )
    }

    /// Create a gateway over an explicit storage backend and clock,
    /// e.g. [`crate::ratelimit::ClusterStorage`] for cluster mode.
    pub fn with_backend(
        store: Arc<SettingsStore>,
        storage: Arc<dyn UsageStorage>,
        clock: Arc<dyn Clock>,
        options: GatewayOptions,
    ) -> Self {
        let settings = store.snapshot();
        let request_limiter = RequestLimiter::new(
            settings.max_concurrent_requests,
            settings.max_concurrent_per_ip,
            settings.request_limit_queue_size,
        );
        Self {
            store,
            storage,
            clock,
            options,
            acl: AccessControlList::new(),
            request_limiter,
            derived: Mutex::new(DerivedState::default()),
        }
    }

    /// The concurrency limiter, exposed for observability.
    pub fn request_limiter(&self) -> &RequestLimiter {
        &self.request_limiter
    }

    /// Run the full admission pipeline and forward on success.
    ///
    /// This is the outermost boundary: internal failures never escape,
    /// they become a generic 500 response.
    pub async fn handle(&self, request: Request, next: &dyn Forwarder) -> Response {
        match self.admit(&request).await {
            Ok(Outcome::Admitted { permit, throttle }) => {
                let response = next.forward(request).await;
                if let Some(throttle) = &throttle {
                    throttle.consume(response.body.len() as u64).await;
                }
                drop(permit);
                response
            }
            Ok(Outcome::Rejected(response)) => response,
            Err(e) => {
                error!(error = %e, "admission pipeline failure");
                Response::internal_error()
            }
        }
    }

    async fn admit(&self, request: &Request) -> Result<Outcome, PalisadeError> {
        let (settings, limiters) = self.refresh();
        let client_ip = resolve_client_ip(request, settings.max_forwarded_ips);
        let local = settings.enable_skip_local_ip && is_local(client_ip);
        if local {
            debug!(%client_ip, "local address, bypassing access control and rate limits");
        }

        // IP and header access control.
        if !local
            && self.acl.have_rules()
            && path_applies(
                &request.path,
                &settings.skip_ip_control_url,
                &settings.need_ip_control_url,
            )
        {
            if self.acl.have_ip_rules() && !self.acl.validate_ip(client_ip) {
                debug!(%client_ip, path = %request.path, "request rejected by IP rules");
                return Ok(Outcome::Rejected(Response::rejection(
                    self.options.deny_status,
                    "access denied",
                )));
            }
            if self.acl.have_head_rules() && !self.acl.validate_head(&request.headers) {
                debug!(%client_ip, path = %request.path, "request rejected by header rules");
                return Ok(Outcome::Rejected(Response::rejection(
                    self.options.deny_status,
                    "access denied",
                )));
            }
        }

        let frequency_path = path_applies(
            &request.path,
            &settings.skip_frequency_limiter_url,
            &settings.need_frequency_limiter_url,
        );

        // Frequency limiting: per-IP, then extra header-keyed limits,
        // then per-principal.
        if !local && frequency_path {
            if let Some(limiter) = &limiters.ip {
                match limiter.try_call(&client_ip.to_string()).await {
                    Ok(true) => {
                        if let Some(rejection) =
                            self.check_extras(&limiters.extras, request).await
                        {
                            return Ok(Outcome::Rejected(rejection));
                        }
                    }
                    Ok(false) => {
                        return Ok(Outcome::Rejected(Response::too_many_requests(
                            settings.duration_of_limit_for_ip,
                        )));
                    }
                    Err(e) => {
                        // Fail open: a broken usage backend must not take
                        // the whole edge down with it.
                        warn!(error = %e, "usage storage failed, admitting without quota check");
                    }
                }
            }
            if let Some(limiter) = &limiters.user {
                if let Some(principal) = &request.principal {
                    match limiter.try_call(principal).await {
                        Ok(true) => {}
                        Ok(false) => {
                            return Ok(Outcome::Rejected(Response::too_many_requests(
                                settings.duration_of_limit_for_user,
                            )));
                        }
                        Err(e) => {
                            warn!(error = %e, "usage storage failed, admitting without quota check");
                        }
                    }
                }
            }
        }

        // Download-rate throttling wraps the response path.
        let throttle = if !local
            && settings.enable_download_rate_limiter
            && settings.limit_rate_bytes > 0
            && frequency_path
        {
            Some(DownloadThrottle::new(
                settings.limit_rate_bytes,
                settings.rate_period(),
            ))
        } else {
            None
        };

        // Concurrency admission applies to local traffic too.
        let permit = if settings.enable_concurrent_request_limiter && frequency_path {
            match self.request_limiter.acquire(client_ip).await {
                Ok(permit) => Some(permit),
                Err(_) => {
                    debug!(%client_ip, "request rejected, concurrency caps exhausted");
                    return Ok(Outcome::Rejected(Response::rejection(
                        503,
                        "too many concurrent requests",
                    )));
                }
            }
        } else {
            None
        };

        Ok(Outcome::Admitted { permit, throttle })
    }

    /// Extra limits are consulted only after the base per-IP limiter
    /// passed; each is keyed by the matching header value.
    async fn check_extras(
        &self,
        extras: &[ExtraGuard],
        request: &Request,
    ) -> Option<Response> {
        for extra in extras {
            let Some(value) = request.header(&extra.header) else {
                continue;
            };
            if !extra.regex.is_match(value) {
                continue;
            }
            match extra.limiter.try_call(value).await {
                Ok(true) => {}
                Ok(false) => {
                    return Some(Response::too_many_requests(extra.window_secs));
                }
                Err(e) => {
                    warn!(error = %e, "usage storage failed, admitting without quota check");
                }
            }
        }
        None
    }

    /// Rebuild derived state when the settings generation moved.
    fn refresh(&self) -> (Arc<LimiterSettings>, FrequencyLimiters) {
        let settings = self.store.snapshot();
        let generation = self.store.generation();
        let mut derived = self.derived.lock();
        if derived.applied_generation != generation {
            self.rebuild(&mut derived, &settings);
            derived.applied_generation = generation;
        }
        let limiters = FrequencyLimiters {
            ip: derived.ip_limiter.clone(),
            user: derived.user_limiter.clone(),
            extras: Arc::clone(&derived.extras),
        };
        (settings, limiters)
    }

    fn rebuild(&self, derived: &mut DerivedState, settings: &LimiterSettings) {
        let head_pairs = |rules: &[crate::settings::HeaderPattern]| {
            rules
                .iter()
                .map(|r| (r.name.clone(), r.pattern.clone()))
                .collect::<Vec<_>>()
        };
        self.acl.reload(
            &settings.allow_cidr,
            &settings.deny_cidr,
            &head_pairs(&settings.allow_head),
            &head_pairs(&settings.deny_head),
        );

        derived.ip_limiter = self.build_limiter(
            "request:ip",
            settings.enable_ip_based_limiter,
            settings.limit_capacity_for_ip,
            settings.ip_limit_window(),
        );
        derived.user_limiter = self.build_limiter(
            "request:user",
            settings.enable_user_based_limiter,
            settings.limit_capacity_for_user,
            settings.user_limit_window(),
        );

        let mut extras = Vec::new();
        for extra in &settings.extra_limits {
            let guard = Regex::new(&format!("^(?:{})$", extra.pattern))
                .map_err(|e| {
                    PalisadeError::Config(format!(
                        "malformed pattern {:?}: {}",
                        extra.pattern, e
                    ))
                })
                .and_then(|regex| {
                    let quota = RateLimit::of(extra.name.as_str())
                        .to(extra.capacity)
                        .per(Duration::from_secs(extra.window_secs))?;
                    let limiter = Limiter::new(
                        format!("extra:{}", extra.name),
                        Arc::clone(&self.clock),
                        Arc::clone(&self.storage),
                        vec![quota],
                    )?;
                    Ok(ExtraGuard {
                        header: extra.header.clone(),
                        regex,
                        limiter: Arc::new(limiter),
                        window_secs: extra.window_secs,
                    })
                });
            match guard {
                Ok(guard) => extras.push(guard),
                // Same tolerance as the wire format: a bad entry is
                // skipped, the rest stay live.
                Err(e) => warn!(error = %e, name = %extra.name, "skipping unusable extra limit"),
            }
        }
        derived.extras = Arc::new(extras);

        self.request_limiter.reconfigure(
            settings.max_concurrent_requests,
            settings.max_concurrent_per_ip,
            settings.request_limit_queue_size,
        );
        debug!(version = settings.version, "rebuilt derived admission state");
    }

    fn build_limiter(
        &self,
        resource: &str,
        enabled: bool,
        capacity: u64,
        window: Duration,
    ) -> Option<Arc<Limiter>> {
        if !enabled {
            return None;
        }
        let quota = match RateLimit::of(resource).to(capacity).per(window) {
            Ok(quota) => quota,
            Err(e) => {
                warn!(error = %e, resource, "disabling limiter with unusable quota");
                return None;
            }
        };
        match Limiter::new(
            resource,
            Arc::clone(&self.clock),
            Arc::clone(&self.storage),
            vec![quota],
        ) {
            Ok(limiter) => Some(Arc::new(limiter)),
            Err(e) => {
                warn!(error = %e, resource, "disabling unusable limiter");
                None
            }
        }
    }
}

/// Skip/need path qualification shared by every limiter type: an
/// explicit skip prefix always wins; an empty need list means "applies
/// everywhere not skipped".
fn path_applies(path: &str, skip: &[String], need: &[String]) -> bool {
    if skip.iter().any(|prefix| path.starts_with(prefix)) {
        return false;
    }
    need.is_empty() || need.iter().any(|prefix| path.starts_with(prefix))
}

/// Resolve the client address, trusting at most `max_forwarded` hops of
/// `X-Forwarded-For`. Zero disables the header entirely; a chain longer
/// than the trusted depth falls back to the direct peer.
fn resolve_client_ip(request: &Request, max_forwarded: u32) -> IpAddr {
    if max_forwarded == 0 {
        return request.remote_addr;
    }
    let Some(forwarded) = request.header("x-forwarded-for") else {
        return request.remote_addr;
    };
    let hops: Vec<&str> = forwarded
        .split(',')
        .map(str::trim)
        .filter(|hop| !hop.is_empty())
        .collect();
    if hops.is_empty() || hops.len() > max_forwarded as usize {
        return request.remote_addr;
    }
    hops[0].parse().unwrap_or(request.remote_addr)
}

/// Loopback, link-local and private/unique-local addresses count as
/// local for the skip-local bypass.
fn is_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_link_local() || v4.is_private(),
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback() || (first & 0xffc0) == 0xfe80 || (first & 0xfe00) == 0xfc00
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::ratelimit::ManualClock;

    struct CountingForwarder {
        hits: AtomicUsize,
    }

    impl CountingForwarder {
        fn new() -> Self {
            Self {
                hits: AtomicUsize::new(0),
            }
        }

        fn hits(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Forwarder for CountingForwarder {
        async fn forward(&self, _request: Request) -> Response {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Response {
                status: 200,
                headers: Vec::new(),
                body: b"ok".to_vec(),
            }
        }
    }

    struct FailingStorage;

    #[async_trait]
    impl UsageStorage for FailingStorage {
        async fn add_and_get(
            &self,
            _resource: &str,
            _key: &str,
            _window: Duration,
            _now_millis: u64,
            _limit: u64,
        ) -> crate::error::Result<u64> {
            Err(PalisadeError::Storage("backend unreachable".into()))
        }
    }

    fn request(ip: &str, path: &str) -> Request {
        Request::new(ip.parse().unwrap(), path)
    }

    fn gateway_with(store: Arc<SettingsStore>) -> AdmissionGateway {
        AdmissionGateway::with_backend(
            store,
            Arc::new(MemoryStorage::new()),
            Arc::new(ManualClock::new(60_000)),
            GatewayOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_no_rules_forwards_everything() {
        let store = Arc::new(SettingsStore::new(LimiterSettings::default()));
        let gateway = gateway_with(store);
        let next = CountingForwarder::new();

        let response = gateway.handle(request("8.8.8.8", "/any"), &next).await;
        assert_eq!(response.status, 200);
        assert_eq!(next.hits(), 1);
    }

    #[tokio::test]
    async fn test_acl_rejects_with_configured_status() {
        let store = Arc::new(SettingsStore::new(LimiterSettings {
            allow_cidr: vec!["10.0.0.0/8".into()],
            ..Default::default()
        }));
        let gateway = gateway_with(store);
        let next = CountingForwarder::new();

        let allowed = gateway.handle(request("10.1.2.3", "/api"), &next).await;
        assert_eq!(allowed.status, 200);

        let denied = gateway.handle(request("192.168.1.1", "/api"), &next).await;
        assert_eq!(denied.status, 403);
        assert_eq!(next.hits(), 1);
        let payload: serde_json::Value = serde_json::from_slice(&denied.body).unwrap();
        assert_eq!(payload["reason"], "access denied");
    }

    #[tokio::test]
    async fn test_acl_skip_list_bypasses_control() {
        let store = Arc::new(SettingsStore::new(LimiterSettings {
            allow_cidr: vec!["10.0.0.0/8".into()],
            skip_ip_control_url: vec!["/health".into()],
            ..Default::default()
        }));
        let gateway = gateway_with(store);
        let next = CountingForwarder::new();

        let response = gateway
            .handle(request("192.168.1.1", "/health/live"), &next)
            .await;
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn test_header_rules_enforced() {
        let store = Arc::new(SettingsStore::new(LimiterSettings {
            deny_head: vec![crate::settings::HeaderPattern {
                name: "user-agent".into(),
                pattern: ".*badbot.*".into(),
            }],
            ..Default::default()
        }));
        let gateway = gateway_with(store);
        let next = CountingForwarder::new();

        let bad = request("8.8.8.8", "/").with_header("User-Agent", "badbot 1.0");
        assert_eq!(gateway.handle(bad, &next).await.status, 403);

        let good = request("8.8.8.8", "/").with_header("User-Agent", "curl");
        assert_eq!(gateway.handle(good, &next).await.status, 200);
    }

    #[tokio::test]
    async fn test_frequency_limit_returns_429_with_retry_after() {
        let store = Arc::new(SettingsStore::new(LimiterSettings {
            enable_ip_based_limiter: true,
            limit_capacity_for_ip: 2,
            duration_of_limit_for_ip: 60,
            ..Default::default()
        }));
        let gateway = gateway_with(store);
        let next = CountingForwarder::new();

        for _ in 0..2 {
            let response = gateway.handle(request("8.8.8.8", "/api"), &next).await;
            assert_eq!(response.status, 200);
        }
        let limited = gateway.handle(request("8.8.8.8", "/api"), &next).await;
        assert_eq!(limited.status, 429);
        let retry_after = limited
            .headers
            .iter()
            .find(|(name, _)| name == "Retry-After")
            .map(|(_, value)| value.clone());
        assert_eq!(retry_after.as_deref(), Some("60"));
        assert_eq!(next.hits(), 2);

        // Another source is unaffected.
        let other = gateway.handle(request("9.9.9.9", "/api"), &next).await;
        assert_eq!(other.status, 200);
    }

    #[tokio::test]
    async fn test_extra_limit_applies_after_base_limiter() {
        let store = Arc::new(SettingsStore::new(LimiterSettings {
            enable_ip_based_limiter: true,
            limit_capacity_for_ip: 100,
            duration_of_limit_for_ip: 60,
            extra_limits: vec![crate::settings::ExtraLimit {
                name: "tenant".into(),
                header: "x-tenant".into(),
                pattern: "t-.*".into(),
                capacity: 1,
                window_secs: 30,
            }],
            ..Default::default()
        }));
        let gateway = gateway_with(store);
        let next = CountingForwarder::new();

        let tenant = || request("8.8.8.8", "/api").with_header("X-Tenant", "t-acme");
        assert_eq!(gateway.handle(tenant(), &next).await.status, 200);
        let limited = gateway.handle(tenant(), &next).await;
        assert_eq!(limited.status, 429);
        let retry_after = limited
            .headers
            .iter()
            .find(|(name, _)| name == "Retry-After")
            .map(|(_, value)| value.clone());
        assert_eq!(retry_after.as_deref(), Some("30"));

        // A non-matching header value is not subject to the extra limit.
        let other = request("8.8.8.8", "/api").with_header("X-Tenant", "internal");
        assert_eq!(gateway.handle(other, &next).await.status, 200);
    }

    #[tokio::test]
    async fn test_user_limiter_keys_on_principal() {
        let store = Arc::new(SettingsStore::new(LimiterSettings {
            enable_user_based_limiter: true,
            limit_capacity_for_user: 1,
            duration_of_limit_for_user: 60,
            ..Default::default()
        }));
        let gateway = gateway_with(store);
        let next = CountingForwarder::new();

        let alice = || request("8.8.8.8", "/api").with_principal("alice");
        assert_eq!(gateway.handle(alice(), &next).await.status, 200);
        assert_eq!(gateway.handle(alice(), &next).await.status, 429);
        // Anonymous requests are not user-limited.
        assert_eq!(
            gateway.handle(request("8.8.8.8", "/api"), &next).await.status,
            200
        );
    }

    #[tokio::test]
    async fn test_skip_local_bypasses_acl_and_quota() {
        let store = Arc::new(SettingsStore::new(LimiterSettings {
            enable_skip_local_ip: true,
            allow_cidr: vec!["10.99.0.0/16".into()],
            enable_ip_based_limiter: true,
            limit_capacity_for_ip: 1,
            duration_of_limit_for_ip: 60,
            ..Default::default()
        }));
        let gateway = gateway_with(store);
        let next = CountingForwarder::new();

        for _ in 0..3 {
            let response = gateway.handle(request("127.0.0.1", "/api"), &next).await;
            assert_eq!(response.status, 200);
        }
        // Remote addresses still face the allow list.
        assert_eq!(
            gateway.handle(request("8.8.8.8", "/api"), &next).await.status,
            403
        );
    }

    #[tokio::test]
    async fn test_storage_failure_fails_open() {
        let store = Arc::new(SettingsStore::new(LimiterSettings {
            enable_ip_based_limiter: true,
            limit_capacity_for_ip: 1,
            duration_of_limit_for_ip: 60,
            ..Default::default()
        }));
        let gateway = AdmissionGateway::with_backend(
            store,
            Arc::new(FailingStorage),
            Arc::new(ManualClock::new(0)),
            GatewayOptions::default(),
        );
        let next = CountingForwarder::new();

        for _ in 0..5 {
            let response = gateway.handle(request("8.8.8.8", "/api"), &next).await;
            assert_eq!(response.status, 200);
        }
        assert_eq!(next.hits(), 5);
    }

    #[tokio::test]
    async fn test_concurrency_rejection_when_saturated() {
        let store = Arc::new(SettingsStore::new(LimiterSettings {
            enable_concurrent_request_limiter: true,
            max_concurrent_requests: 1,
            max_concurrent_per_ip: 1,
            request_limit_queue_size: 0,
            ..Default::default()
        }));
        let gateway = Arc::new(gateway_with(store));

        struct BlockingForwarder {
            release: tokio::sync::Notify,
            entered: tokio::sync::Notify,
        }

        #[async_trait]
        impl Forwarder for BlockingForwarder {
            async fn forward(&self, _request: Request) -> Response {
                self.entered.notify_one();
                self.release.notified().await;
                Response {
                    status: 200,
                    headers: Vec::new(),
                    body: Vec::new(),
                }
            }
        }

        let next = Arc::new(BlockingForwarder {
            release: tokio::sync::Notify::new(),
            entered: tokio::sync::Notify::new(),
        });

        let first = {
            let gateway = Arc::clone(&gateway);
            let next = Arc::clone(&next);
            tokio::spawn(async move {
                gateway
                    .handle(request("8.8.8.8", "/api"), next.as_ref())
                    .await
            })
        };
        next.entered.notified().await;

        // While the first request is in flight, the second is rejected.
        let quick = CountingForwarder::new();
        let rejected = gateway.handle(request("9.9.9.9", "/api"), &quick).await;
        assert_eq!(rejected.status, 503);
        assert_eq!(quick.hits(), 0);

        next.release.notify_one();
        assert_eq!(first.await.unwrap().status, 200);
        assert_eq!(gateway.request_limiter().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_settings_change_is_picked_up() {
        let store = Arc::new(SettingsStore::new(LimiterSettings::default()));
        let gateway = gateway_with(Arc::clone(&store));
        let next = CountingForwarder::new();

        assert_eq!(
            gateway.handle(request("192.168.1.1", "/"), &next).await.status,
            200
        );

        store.add_allow_cidr("10.0.0.0/8").unwrap();
        assert_eq!(
            gateway.handle(request("192.168.1.1", "/"), &next).await.status,
            403
        );
        assert_eq!(
            gateway.handle(request("10.0.0.1", "/"), &next).await.status,
            200
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_throttle_delays_large_bodies() {
        let store = Arc::new(SettingsStore::new(LimiterSettings {
            enable_download_rate_limiter: true,
            limit_rate_bytes: 1,
            limit_rate_period: 1,
            ..Default::default()
        }));
        let gateway = gateway_with(store);
        let next = CountingForwarder::new();

        let start = tokio::time::Instant::now();
        // The 2-byte body at 1 byte/s crosses one slice boundary.
        let response = gateway.handle(request("8.8.8.8", "/file"), &next).await;
        assert_eq!(response.status, 200);
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[test]
    fn test_path_applies_skip_wins_over_need() {
        let skip = vec!["/admin/health".to_string()];
        let need = vec!["/admin".to_string()];
        assert!(!path_applies("/admin/health", &skip, &need));
        assert!(path_applies("/admin/users", &skip, &need));
        assert!(!path_applies("/public", &skip, &need));
        assert!(path_applies("/public", &skip, &[]));
    }

    #[test]
    fn test_resolve_client_ip_depth() {
        let direct = request("1.1.1.1", "/");
        assert_eq!(resolve_client_ip(&direct, 2), "1.1.1.1".parse::<IpAddr>().unwrap());

        let forwarded = request("1.1.1.1", "/")
            .with_header("X-Forwarded-For", "8.8.8.8, 10.0.0.1");
        assert_eq!(
            resolve_client_ip(&forwarded, 2),
            "8.8.8.8".parse::<IpAddr>().unwrap()
        );
        // Too many hops: fall back to the direct peer.
        assert_eq!(
            resolve_client_ip(&forwarded, 1),
            "1.1.1.1".parse::<IpAddr>().unwrap()
        );
        // Depth zero ignores the header entirely.
        assert_eq!(
            resolve_client_ip(&forwarded, 0),
            "1.1.1.1".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_is_local() {
        assert!(is_local("127.0.0.1".parse().unwrap()));
        assert!(is_local("10.0.0.1".parse().unwrap()));
        assert!(is_local("169.254.1.1".parse().unwrap()));
        assert!(is_local("::1".parse().unwrap()));
        assert!(is_local("fe80::1".parse().unwrap()));
        assert!(is_local("fd00::1".parse().unwrap()));
        assert!(!is_local("8.8.8.8".parse().unwrap()));
        assert!(!is_local("2001:db8::1".parse().unwrap()));
    }
}
