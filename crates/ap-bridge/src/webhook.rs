//! Webhook authenticity: HMAC signature, timestamp freshness and replay
//! defence, checked in that order so forged payloads never reach the
//! replay cache.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, warn};

use ap_core::config::WebhookConfig;
use ap_telemetry::metrics::global_metrics;

type HmacSha256 = Hmac<Sha256>;

/// Unix timestamps above this are taken to be milliseconds.
const MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

/// Cache size that triggers a sweep on insert, on top of the periodic one.
const SWEEP_ON_INSERT_LEN: usize = 1024;

/// Source of "now". Swapped out in tests.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("missing or invalid signature")]
    InvalidSignature,
    #[error("missing, unparseable or inconsistent timestamp")]
    InvalidTimestamp,
    #[error("timestamp outside the freshness window (too old)")]
    StaleTimestamp,
    #[error("timestamp outside the freshness window (in the future)")]
    FutureTimestamp,
    #[error("request already seen")]
    ReplayDetected,
}

impl Rejection {
    /// Label used for `webhook_rejections_total{reason}`.
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::InvalidSignature => "invalid_signature",
            Rejection::InvalidTimestamp => "invalid_timestamp",
            Rejection::StaleTimestamp => "stale_timestamp",
            Rejection::FutureTimestamp => "future_timestamp",
            Rejection::ReplayDetected => "replay_detected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verified {
    Authentic,
    /// Dev-mode bypass; nothing was checked.
    Bypassed,
}

// ---------------------------------------------------------------------------
// ReplayCache
// ---------------------------------------------------------------------------

/// Signatures seen within the freshness window, each with the instant its
/// entry may be forgotten. In-memory only: a restart forgets it, and the
/// freshness check covers anything older than the window.
#[derive(Debug, Default)]
pub struct ReplayCache {
    seen: DashMap<String, DateTime<Utc>>,
}

impl ReplayCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `signature` until `expires_at`. Returns `false` if it was
    /// already present.
    pub fn insert(&self, signature: &str, expires_at: DateTime<Utc>) -> bool {
        match self.seen.entry(signature.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(expires_at);
                true
            }
        }
    }

    /// Drop entries whose expiry is at or before `now`. Returns how many
    /// were removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let before = self.seen.len();
        self.seen.retain(|_, expires_at| *expires_at > now);
        before.saturating_sub(self.seen.len())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

// ---------------------------------------------------------------------------
// WebhookVerifier
// ---------------------------------------------------------------------------

pub struct WebhookVerifier {
    /// `None` rejects every request unless `dev_bypass` is set.
    secret: Option<Vec<u8>>,
    tolerance: Duration,
    dev_bypass: bool,
    replay: ReplayCache,
    clock: Clock,
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("has_secret", &self.secret.is_some())
            .field("tolerance", &self.tolerance)
            .field("dev_bypass", &self.dev_bypass)
            .field("replay_entries", &self.replay.len())
            .finish()
    }
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<Vec<u8>>, tolerance: std::time::Duration) -> Self {
        Self {
            secret: Some(secret.into()).filter(|s: &Vec<u8>| !s.is_empty()),
            tolerance: to_chrono(tolerance),
            dev_bypass: false,
            replay: ReplayCache::new(),
            clock: Arc::new(Utc::now),
        }
    }

    pub fn from_config(config: &WebhookConfig, secret: Option<String>) -> Self {
        let mut verifier = Self::new(secret.unwrap_or_default(), config.tolerance());
        verifier.dev_bypass = config.dev_bypass;
        if verifier.secret.is_none() && !verifier.dev_bypass {
            warn!(
                env = %config.secret_env,
                "no webhook secret configured, all webhook requests will be rejected"
            );
        }
        verifier
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_dev_bypass(mut self, enabled: bool) -> Self {
        self.dev_bypass = enabled;
        self
    }

    pub fn tolerance(&self) -> Duration {
        self.tolerance
    }

    pub fn replay_cache(&self) -> &ReplayCache {
        &self.replay
    }

    /// Check one delivery. `signature` and `timestamp` are the raw header
    /// values, absent when the header was missing.
    pub fn verify(
        &self,
        body: &[u8],
        signature: Option<&str>,
        timestamp: Option<&str>,
    ) -> Result<Verified, Rejection> {
        if self.dev_bypass {
            warn!("webhook verification bypassed (dev mode)");
            return Ok(Verified::Bypassed);
        }

        let result = self.check(body, signature, timestamp);
        if let Err(rejection) = &result {
            global_metrics()
                .increment_counter("webhook_rejections_total", &[("reason", rejection.reason())]);
        }
        result
    }

    fn check(
        &self,
        body: &[u8],
        signature: Option<&str>,
        timestamp: Option<&str>,
    ) -> Result<Verified, Rejection> {
        let signature = self.check_signature(body, signature)?;

        let now = (self.clock)();
        let sent_at = self.sent_at(body, timestamp)?;
        if now - sent_at > self.tolerance {
            return Err(Rejection::StaleTimestamp);
        }
        if sent_at - now > self.tolerance {
            return Err(Rejection::FutureTimestamp);
        }

        if self.replay.len() >= SWEEP_ON_INSERT_LEN {
            self.replay.sweep(now);
        }
        // Keep the entry for as long as this timestamp could still pass the
        // freshness check, which for a future timestamp outlasts `now`.
        let expires_at = now.max(sent_at) + self.tolerance;
        if !self.replay.insert(&signature, expires_at) {
            return Err(Rejection::ReplayDetected);
        }
        Ok(Verified::Authentic)
    }

    /// The delivery time to judge freshness by. The header is required.
    /// When the signed body carries its own `webhookTimestamp`, that value
    /// wins and the header must agree with it to within the tolerance, so a
    /// captured body cannot be re-stamped through the unsigned header.
    fn sent_at(&self, body: &[u8], timestamp: Option<&str>) -> Result<DateTime<Utc>, Rejection> {
        let header = timestamp
            .and_then(parse_timestamp)
            .ok_or(Rejection::InvalidTimestamp)?;
        match signed_timestamp(body) {
            Some(signed) if signed.max(header) - signed.min(header) > self.tolerance => {
                debug!(%signed, %header, "webhook timestamp header disagrees with signed body");
                Err(Rejection::InvalidTimestamp)
            }
            Some(signed) => Ok(signed),
            None => Ok(header),
        }
    }

    /// Returns the normalized hex signature on success.
    fn check_signature(&self, body: &[u8], signature: Option<&str>) -> Result<String, Rejection> {
        let secret = self.secret.as_deref().ok_or(Rejection::InvalidSignature)?;
        let raw = signature.map(str::trim).ok_or(Rejection::InvalidSignature)?;
        let hex_sig = raw.strip_prefix("sha256=").unwrap_or(raw).to_ascii_lowercase();
        let provided = hex::decode(&hex_sig).map_err(|_| Rejection::InvalidSignature)?;

        let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| Rejection::InvalidSignature)?;
        mac.update(body);
        // Constant-time comparison.
        mac.verify_slice(&provided)
            .map_err(|_| Rejection::InvalidSignature)?;
        Ok(hex_sig)
    }

    /// Periodic maintenance; the daemon calls this on a timer.
    pub fn sweep(&self) -> usize {
        let removed = self.replay.sweep((self.clock)());
        if removed > 0 {
            debug!(removed, remaining = self.replay.len(), "swept webhook replay cache");
        }
        removed
    }
}

/// Hex HMAC-SHA256 of `body` under `secret`, as a sender would compute it.
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Unix seconds, Unix milliseconds or RFC 3339.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(n) = raw.parse::<i64>() {
        return from_unix(n);
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// `webhookTimestamp` from the JSON body, covered by the signature. Bodies
/// that are not JSON objects or lack the field have none.
pub fn signed_timestamp(body: &[u8]) -> Option<DateTime<Utc>> {
    #[derive(serde::Deserialize)]
    struct Stamped {
        #[serde(rename = "webhookTimestamp")]
        webhook_timestamp: Option<serde_json::Value>,
    }

    let stamped: Stamped = serde_json::from_slice(body).ok()?;
    match stamped.webhook_timestamp? {
        serde_json::Value::Number(n) => n.as_i64().and_then(from_unix),
        serde_json::Value::String(s) => parse_timestamp(&s),
        _ => None,
    }
}

fn from_unix(n: i64) -> Option<DateTime<Utc>> {
    if n > MILLIS_THRESHOLD {
        DateTime::from_timestamp_millis(n)
    } else {
        DateTime::from_timestamp(n, 0)
    }
}

fn to_chrono(d: std::time::Duration) -> Duration {
    Duration::from_std(d).unwrap_or_else(|_| Duration::days(365))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const SECRET: &[u8] = b"whsec_test";
    const BODY: &[u8] = br#"{"action":"create","type":"Issue","data":{"id":"a"}}"#;

    fn fixed_clock(at: DateTime<Utc>) -> (Clock, Arc<Mutex<DateTime<Utc>>>) {
        let cell = Arc::new(Mutex::new(at));
        let reader = Arc::clone(&cell);
        let clock: Clock = Arc::new(move || *reader.lock().unwrap());
        (clock, cell)
    }

    fn verifier_at(now: DateTime<Utc>) -> WebhookVerifier {
        let (clock, _) = fixed_clock(now);
        WebhookVerifier::new(SECRET, std::time::Duration::from_secs(300)).with_clock(clock)
    }

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn valid_request_passes_then_replay_is_rejected() {
        let v = verifier_at(now());
        let sig = sign(SECRET, BODY);
        let ts = now().timestamp().to_string();

        assert_eq!(v.verify(BODY, Some(sig.as_str()), Some(ts.as_str())), Ok(Verified::Authentic));
        assert_eq!(v.verify(BODY, Some(sig.as_str()), Some(ts.as_str())), Err(Rejection::ReplayDetected));
    }

    #[test]
    fn ten_minute_old_timestamp_is_stale() {
        let v = verifier_at(now());
        let sig = sign(SECRET, BODY);
        let ts = (now() - Duration::minutes(10)).timestamp().to_string();
        assert_eq!(v.verify(BODY, Some(sig.as_str()), Some(ts.as_str())), Err(Rejection::StaleTimestamp));
    }

    #[test]
    fn future_timestamp_is_rejected() {
        let v = verifier_at(now());
        let sig = sign(SECRET, BODY);
        let ts = (now() + Duration::minutes(6)).timestamp().to_string();
        assert_eq!(v.verify(BODY, Some(sig.as_str()), Some(ts.as_str())), Err(Rejection::FutureTimestamp));
    }

    #[test]
    fn signature_is_checked_first() {
        let v = verifier_at(now());
        let forged = sign(b"other", BODY);
        let ts = now().timestamp().to_string();

        assert_eq!(v.verify(BODY, Some(forged.as_str()), Some(ts.as_str())), Err(Rejection::InvalidSignature));
        assert_eq!(v.verify(BODY, None, Some(ts.as_str())), Err(Rejection::InvalidSignature));
        assert_eq!(v.verify(BODY, Some("zz-not-hex"), Some(ts.as_str())), Err(Rejection::InvalidSignature));
        // Forged requests never populate the cache, even with a stale timestamp.
        assert_eq!(v.verify(BODY, Some(forged.as_str()), Some("1")), Err(Rejection::InvalidSignature));
        assert!(v.replay_cache().is_empty());
    }

    #[test]
    fn tampered_body_fails() {
        let v = verifier_at(now());
        let sig = sign(SECRET, BODY);
        let ts = now().timestamp().to_string();
        assert_eq!(
            v.verify(b"{\"tampered\":true}", Some(sig.as_str()), Some(ts.as_str())),
            Err(Rejection::InvalidSignature)
        );
    }

    #[test]
    fn prefix_and_case_are_tolerated() {
        let v = verifier_at(now());
        let sig = format!("sha256={}", sign(SECRET, BODY).to_uppercase());
        let ts = now().timestamp().to_string();
        assert_eq!(v.verify(BODY, Some(sig.as_str()), Some(ts.as_str())), Ok(Verified::Authentic));
    }

    #[test]
    fn timestamp_formats() {
        let t = now();
        assert_eq!(parse_timestamp("1700000000"), Some(t));
        assert_eq!(parse_timestamp("1700000000000"), Some(t));
        assert_eq!(parse_timestamp("2023-11-14T22:13:20Z"), Some(t));
        assert_eq!(parse_timestamp(" 1700000000 "), Some(t));
        assert_eq!(parse_timestamp("yesterday"), None);
        assert_eq!(parse_timestamp(""), None);
    }

    #[test]
    fn missing_or_bad_timestamp_is_invalid() {
        let v = verifier_at(now());
        let sig = sign(SECRET, BODY);
        assert_eq!(v.verify(BODY, Some(sig.as_str()), None), Err(Rejection::InvalidTimestamp));
        assert_eq!(v.verify(BODY, Some(sig.as_str()), Some("soon")), Err(Rejection::InvalidTimestamp));
    }

    #[test]
    fn no_secret_rejects_everything() {
        let v = WebhookVerifier::new(Vec::new(), std::time::Duration::from_secs(300));
        let ts = Utc::now().timestamp().to_string();
        assert_eq!(
            v.verify(BODY, Some(sign(b"", BODY).as_str()), Some(ts.as_str())),
            Err(Rejection::InvalidSignature)
        );
    }

    #[test]
    fn dev_bypass_skips_checks() {
        let v = verifier_at(now()).with_dev_bypass(true);
        assert_eq!(v.verify(BODY, None, None), Ok(Verified::Bypassed));
        assert_eq!(v.verify(BODY, None, None), Ok(Verified::Bypassed));
    }

    #[test]
    fn sweep_forgets_entries_older_than_window() {
        let (clock, cell) = fixed_clock(now());
        let v = WebhookVerifier::new(SECRET, std::time::Duration::from_secs(300)).with_clock(clock);
        let sig = sign(SECRET, BODY);
        let ts = now().timestamp().to_string();
        v.verify(BODY, Some(sig.as_str()), Some(ts.as_str())).unwrap();

        *cell.lock().unwrap() = now() + Duration::seconds(200);
        assert_eq!(v.sweep(), 0);
        assert_eq!(v.replay_cache().len(), 1);

        *cell.lock().unwrap() = now() + Duration::seconds(301);
        assert_eq!(v.sweep(), 1);
        assert!(v.replay_cache().is_empty());
    }

    #[test]
    fn future_timestamp_outlives_its_sweep() {
        let (clock, cell) = fixed_clock(now());
        let v = WebhookVerifier::new(SECRET, std::time::Duration::from_secs(300)).with_clock(clock);
        let sig = sign(SECRET, BODY);
        let ts = (now() + Duration::seconds(290)).timestamp().to_string();
        assert_eq!(v.verify(BODY, Some(sig.as_str()), Some(ts.as_str())), Ok(Verified::Authentic));

        // Still fresh at +360, so the entry must survive the sweep.
        *cell.lock().unwrap() = now() + Duration::seconds(360);
        assert_eq!(v.sweep(), 0);
        assert_eq!(
            v.verify(BODY, Some(sig.as_str()), Some(ts.as_str())),
            Err(Rejection::ReplayDetected)
        );

        // Past the window for that timestamp, it is swept and the request is stale.
        *cell.lock().unwrap() = now() + Duration::seconds(591);
        assert_eq!(v.sweep(), 1);
        assert_eq!(
            v.verify(BODY, Some(sig.as_str()), Some(ts.as_str())),
            Err(Rejection::StaleTimestamp)
        );
    }

    #[test]
    fn signed_body_timestamp_pins_the_delivery_time() {
        let (clock, cell) = fixed_clock(now());
        let v = WebhookVerifier::new(SECRET, std::time::Duration::from_secs(300)).with_clock(clock);
        let body = format!(
            r#"{{"action":"create","type":"Issue","data":{{"id":"a"}},"webhookTimestamp":{}}}"#,
            now().timestamp_millis()
        );
        let sig = sign(SECRET, body.as_bytes());
        let ts = now().timestamp().to_string();
        assert_eq!(v.verify(body.as_bytes(), Some(sig.as_str()), Some(ts.as_str())), Ok(Verified::Authentic));

        // Long after the window, a fresh header cannot revive the captured body.
        *cell.lock().unwrap() = now() + Duration::minutes(30);
        v.sweep();
        let restamped = (now() + Duration::minutes(30)).timestamp().to_string();
        assert_eq!(
            v.verify(body.as_bytes(), Some(sig.as_str()), Some(restamped.as_str())),
            Err(Rejection::InvalidTimestamp)
        );
    }

    #[test]
    fn signed_timestamp_forms() {
        let t = now();
        assert_eq!(signed_timestamp(br#"{"webhookTimestamp":1700000000000}"#), Some(t));
        assert_eq!(signed_timestamp(br#"{"webhookTimestamp":"2023-11-14T22:13:20Z"}"#), Some(t));
        assert_eq!(signed_timestamp(br#"{"action":"create"}"#), None);
        assert_eq!(signed_timestamp(b"not json"), None);
    }

    #[test]
    fn rejection_reasons_are_stable() {
        assert_eq!(Rejection::ReplayDetected.reason(), "replay_detected");
        assert_eq!(Rejection::StaleTimestamp.reason(), "stale_timestamp");
    }

    #[test]
    fn rejections_are_counted() {
        let v = verifier_at(now());
        let before = global_metrics()
            .get_counter("webhook_rejections_total", &[("reason", "invalid_timestamp")]);
        let sig = sign(SECRET, BODY);
        let _ = v.verify(BODY, Some(sig.as_str()), Some("never"));
        let after = global_metrics()
            .get_counter("webhook_rejections_total", &[("reason", "invalid_timestamp")]);
        assert!(after > before);
    }
}
