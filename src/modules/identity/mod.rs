//! Client identity rotation.
//!
//! Keeps a weighted pool of browser fingerprints and returns a header set that
//! is internally coherent with the current one: client hints only for Chromium
//! engines, platform hints derived from the operating system, and an Accept
//! value matching the browser family.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use http::header::{
    ACCEPT, ACCEPT_ENCODING, ACCEPT_LANGUAGE, HeaderMap, HeaderName, HeaderValue,
    UPGRADE_INSECURE_REQUESTS, USER_AGENT,
};
use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use rand::thread_rng;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Number of recent picks excluded from random rotation.
const RECENT_EXCLUSION: usize = 5;
const HISTORY_LIMIT: usize = 20;

const ACCEPT_CHROMIUM: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.7";
const ACCEPT_FIREFOX: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8";
const ACCEPT_SAFARI: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
const ACCEPT_ENCODING_VALUE: &str = "gzip, deflate, br";

static CHROMIUM_MAJOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:Chrome|CriOS)/(\d+)").expect("invalid chromium version regex"));

const DESKTOP_CHROME: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
];

const DESKTOP_FIREFOX: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:122.0) Gecko/20100101 Firefox/122.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:122.0) Gecko/20100101 Firefox/122.0",
];

const DESKTOP_SAFARI: &[&str] = &[
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
];

const DESKTOP_EDGE: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36 Edg/121.0.0.0",
];

const MOBILE: &[&str] = &[
    "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36",
    "Mozilla/5.0 (Linux; Android 13; SM-S918B) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Mobile Safari/537.36",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_2 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_2 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) CriOS/120.0.6099.119 Mobile/15E148 Safari/604.1",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserFamily {
    Chrome,
    Edge,
    Firefox,
    Safari,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Windows,
    MacOs,
    Linux,
    Android,
    Ios,
}

impl OsFamily {
    fn client_hint(self) -> &'static str {
        match self {
            OsFamily::Windows => "\"Windows\"",
            OsFamily::MacOs => "\"macOS\"",
            OsFamily::Linux => "\"Linux\"",
            OsFamily::Android => "\"Android\"",
            OsFamily::Ios => "\"iOS\"",
        }
    }
}

/// One entry of the identity pool.
#[derive(Debug, Clone, PartialEq)]
pub struct Fingerprint {
    pub user_agent: String,
    pub browser: BrowserFamily,
    pub os: OsFamily,
    pub mobile: bool,
    pub weight: u32,
}

impl Fingerprint {
    pub fn from_user_agent(user_agent: &str, weight: u32) -> Self {
        let lower = user_agent.to_ascii_lowercase();

        let browser = if lower.contains("edg/") {
            BrowserFamily::Edge
        } else if lower.contains("firefox/") {
            BrowserFamily::Firefox
        } else if lower.contains("chrome/") || lower.contains("crios/") {
            BrowserFamily::Chrome
        } else {
            BrowserFamily::Safari
        };

        let os = if lower.contains("iphone") || lower.contains("ipad") {
            OsFamily::Ios
        } else if lower.contains("android") {
            OsFamily::Android
        } else if lower.contains("windows") {
            OsFamily::Windows
        } else if lower.contains("mac os x") || lower.contains("macintosh") {
            OsFamily::MacOs
        } else {
            OsFamily::Linux
        };

        Self {
            user_agent: user_agent.to_string(),
            browser,
            os,
            mobile: lower.contains("mobile"),
            weight: weight.max(1),
        }
    }

    /// Chromium engines expose client hints; iOS forces WebKit even for CriOS.
    fn sends_client_hints(&self) -> bool {
        matches!(self.browser, BrowserFamily::Chrome | BrowserFamily::Edge) && self.os != OsFamily::Ios
    }

    fn chromium_major(&self) -> Option<&str> {
        CHROMIUM_MAJOR_RE
            .captures(&self.user_agent)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
    }

    fn accept(&self) -> &'static str {
        match self.browser {
            BrowserFamily::Chrome | BrowserFamily::Edge if self.os != OsFamily::Ios => {
                ACCEPT_CHROMIUM
            }
            BrowserFamily::Firefox => ACCEPT_FIREFOX,
            _ => ACCEPT_SAFARI,
        }
    }

    /// Full header set for this identity.
    pub fn headers(&self, accept_language: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        insert(&mut headers, USER_AGENT, &self.user_agent);
        insert(&mut headers, ACCEPT, self.accept());
        insert(&mut headers, ACCEPT_LANGUAGE, accept_language);
        insert(&mut headers, ACCEPT_ENCODING, ACCEPT_ENCODING_VALUE);
        insert(&mut headers, UPGRADE_INSECURE_REQUESTS, "1");
        insert_named(&mut headers, "dnt", "1");

        if self.sends_client_hints() {
            if let Some(major) = self.chromium_major() {
                let brand = match self.browser {
                    BrowserFamily::Edge => "Microsoft Edge",
                    _ => "Google Chrome",
                };
                let hint = format!(
                    "\"Not_A Brand\";v=\"8\", \"Chromium\";v=\"{major}\", \"{brand}\";v=\"{major}\""
                );
                insert_named(&mut headers, "sec-ch-ua", &hint);
            }
            insert_named(
                &mut headers,
                "sec-ch-ua-mobile",
                if self.mobile { "?1" } else { "?0" },
            );
            insert_named(&mut headers, "sec-ch-ua-platform", self.os.client_hint());
        }

        insert_named(&mut headers, "sec-fetch-dest", "document");
        insert_named(&mut headers, "sec-fetch-mode", "navigate");
        insert_named(&mut headers, "sec-fetch-site", "none");
        insert_named(&mut headers, "sec-fetch-user", "?1");
        headers
    }
}

fn insert(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => log::warn!("skipping invalid value for header {name}"),
    }
}

fn insert_named(headers: &mut HeaderMap, name: &'static str, value: &str) {
    insert(headers, HeaderName::from_static(name), value);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Requests served by one identity before rotating.
    pub rotation_interval: u32,
    /// Weighted random rotation; sequential when false.
    pub random_rotation: bool,
    /// Give desktop Chrome a double weight, matching its market share.
    pub prefer_chrome: bool,
    pub include_mobile: bool,
    pub accept_language: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            rotation_interval: 10,
            random_rotation: true,
            prefer_chrome: true,
            include_mobile: false,
            accept_language: "ru-RU,ru;q=0.9,en;q=0.8".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentitySnapshot {
    pub current_user_agent: Option<String>,
    pub request_count: u32,
    pub rotation_interval: u32,
    pub pool_size: usize,
    pub rotations: u64,
}

#[derive(Debug, Default)]
struct RotatorState {
    current: Option<usize>,
    request_count: u32,
    history: VecDeque<usize>,
    rotations: u64,
}

#[derive(Debug)]
pub struct IdentityRotator {
    config: IdentityConfig,
    pool: Vec<Fingerprint>,
    state: Mutex<RotatorState>,
}

impl IdentityRotator {
    pub fn new(config: IdentityConfig) -> Self {
        let pool = default_pool(&config);
        Self::with_pool(config, pool)
    }

    /// Rotator over a caller-supplied pool. An empty pool falls back to the
    /// built-in one.
    pub fn with_pool(config: IdentityConfig, pool: Vec<Fingerprint>) -> Self {
        let pool = if pool.is_empty() {
            default_pool(&config)
        } else {
            pool
        };
        Self {
            config,
            pool,
            state: Mutex::new(RotatorState::default()),
        }
    }

    pub fn pool(&self) -> &[Fingerprint] {
        &self.pool
    }

    fn state(&self) -> MutexGuard<'_, RotatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Header set for the next request, rotating first when the current
    /// identity has served `rotation_interval` requests.
    pub fn headers(&self) -> HeaderMap {
        let fingerprint = {
            let mut state = self.state();
            let due = state.current.is_none()
                || state.request_count >= self.config.rotation_interval.max(1);
            if due {
                self.rotate(&mut state);
            }
            state.request_count += 1;
            state.current.map(|index| self.pool[index].clone())
        };

        fingerprint
            .map(|fp| fp.headers(&self.config.accept_language))
            .unwrap_or_default()
    }

    /// Switch identity immediately and return the new user agent.
    pub fn force_rotate(&self) -> String {
        let mut state = self.state();
        self.rotate(&mut state);
        state
            .current
            .map(|index| self.pool[index].user_agent.clone())
            .unwrap_or_default()
    }

    /// Random pool entry; rotation state is left untouched.
    pub fn random_user_agent(&self) -> String {
        self.pool
            .choose(&mut thread_rng())
            .map(|fp| fp.user_agent.clone())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> IdentitySnapshot {
        let state = self.state();
        IdentitySnapshot {
            current_user_agent: state.current.map(|index| self.pool[index].user_agent.clone()),
            request_count: state.request_count,
            rotation_interval: self.config.rotation_interval,
            pool_size: self.pool.len(),
            rotations: state.rotations,
        }
    }

    fn rotate(&self, state: &mut RotatorState) {
        let next = if self.config.random_rotation {
            self.pick_weighted(state)
        } else {
            state.current.map_or(0, |index| (index + 1) % self.pool.len())
        };

        state.current = Some(next);
        state.request_count = 0;
        state.rotations += 1;
        state.history.push_back(next);
        if state.history.len() > HISTORY_LIMIT {
            state.history.pop_front();
        }
        log::debug!("identity rotated to {}", self.pool[next].user_agent);
    }

    fn pick_weighted(&self, state: &RotatorState) -> usize {
        let recent: Vec<usize> = state
            .history
            .iter()
            .rev()
            .take(RECENT_EXCLUSION)
            .copied()
            .collect();
        let mut candidates: Vec<usize> = (0..self.pool.len())
            .filter(|index| !recent.contains(index))
            .collect();
        if candidates.is_empty() {
            candidates = (0..self.pool.len()).collect();
        }

        candidates
            .choose_weighted(&mut thread_rng(), |&index| self.pool[index].weight)
            .copied()
            .unwrap_or(candidates[0])
    }
}

impl Default for IdentityRotator {
    fn default() -> Self {
        Self::new(IdentityConfig::default())
    }
}

fn default_pool(config: &IdentityConfig) -> Vec<Fingerprint> {
    let chrome_weight = if config.prefer_chrome { 2 } else { 1 };
    let mut pool: Vec<Fingerprint> = DESKTOP_CHROME
        .iter()
        .map(|ua| Fingerprint::from_user_agent(ua, chrome_weight))
        .collect();
    pool.extend(
        DESKTOP_FIREFOX
            .iter()
            .chain(DESKTOP_SAFARI)
            .chain(DESKTOP_EDGE)
            .map(|ua| Fingerprint::from_user_agent(ua, 1)),
    );
    if config.include_mobile {
        pool.extend(MOBILE.iter().map(|ua| Fingerprint::from_user_agent(ua, 1)));
    }
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_user_agents() {
        let edge = Fingerprint::from_user_agent(DESKTOP_EDGE[0], 1);
        assert_eq!(edge.browser, BrowserFamily::Edge);
        assert_eq!(edge.os, OsFamily::Windows);

        let iphone = Fingerprint::from_user_agent(MOBILE[2], 1);
        assert_eq!(iphone.browser, BrowserFamily::Safari);
        assert_eq!(iphone.os, OsFamily::Ios);
        assert!(iphone.mobile);

        let android = Fingerprint::from_user_agent(MOBILE[0], 1);
        assert_eq!(android.os, OsFamily::Android);
        assert_eq!(android.browser, BrowserFamily::Chrome);
    }

    #[test]
    fn chrome_headers_carry_matching_client_hints() {
        let chrome = Fingerprint::from_user_agent(DESKTOP_CHROME[3], 2);
        let headers = chrome.headers("en-US");
        assert_eq!(headers["sec-ch-ua-platform"], "\"macOS\"");
        assert_eq!(headers["sec-ch-ua-mobile"], "?0");
        assert!(
            headers["sec-ch-ua"]
                .to_str()
                .unwrap()
                .contains("\"Google Chrome\";v=\"120\"")
        );
        assert_eq!(headers[ACCEPT], ACCEPT_CHROMIUM);
        assert_eq!(headers[ACCEPT_LANGUAGE], "en-US");
    }

    #[test]
    fn firefox_and_safari_omit_client_hints() {
        for ua in [DESKTOP_FIREFOX[0], DESKTOP_SAFARI[0], MOBILE[3]] {
            let headers = Fingerprint::from_user_agent(ua, 1).headers("ru");
            assert!(!headers.contains_key("sec-ch-ua"), "{ua}");
            assert!(!headers.contains_key("sec-ch-ua-platform"), "{ua}");
        }
        let firefox = Fingerprint::from_user_agent(DESKTOP_FIREFOX[0], 1).headers("ru");
        assert_eq!(firefox[ACCEPT], ACCEPT_FIREFOX);
    }

    #[test]
    fn rotates_after_interval() {
        let rotator = IdentityRotator::new(IdentityConfig {
            rotation_interval: 3,
            random_rotation: false,
            ..IdentityConfig::default()
        });

        let agents: Vec<_> = (0..7)
            .map(|_| rotator.headers()[USER_AGENT].to_str().unwrap().to_string())
            .collect();
        assert_eq!(agents[0], agents[2]);
        assert_ne!(agents[2], agents[3]);
        assert_eq!(agents[3], agents[5]);
        assert_ne!(agents[5], agents[6]);
        assert_eq!(rotator.snapshot().rotations, 3);
    }

    #[test]
    fn random_rotation_avoids_recent_picks() {
        let rotator = IdentityRotator::default();
        let mut picks: Vec<String> = Vec::new();
        for _ in 0..60 {
            let agent = rotator.force_rotate();
            let recent = picks.iter().rev().take(RECENT_EXCLUSION);
            for previous in recent {
                assert_ne!(previous, &agent);
            }
            picks.push(agent);
        }
    }

    #[test]
    fn random_user_agent_does_not_rotate() {
        let rotator = IdentityRotator::default();
        rotator.headers();
        let before = rotator.snapshot();
        let agent = rotator.random_user_agent();
        assert!(rotator.pool().iter().any(|fp| fp.user_agent == agent));
        assert_eq!(rotator.snapshot(), before);
    }

    #[test]
    fn mobile_agents_only_when_enabled() {
        let desktop = IdentityRotator::default();
        assert!(desktop.pool().iter().all(|fp| !fp.mobile));

        let mixed = IdentityRotator::new(IdentityConfig {
            include_mobile: true,
            ..IdentityConfig::default()
        });
        assert!(mixed.pool().iter().any(|fp| fp.mobile));
    }
}
