// Browser fingerprint pool and outbound header builder.
//
// Mirrors a curated-user-agent sampling scheme: on startup a pool of
// plausible browser fingerprints is generated once; requests either draw a
// random one or, when sticky, always get the same one for a given
// credential (index = credential_id mod pool_size).

use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_2_1) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_2_1) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.3 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:122.0) Gecko/20100101 Firefox/122.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14.2; rv:122.0) Gecko/20100101 Firefox/122.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36 Edg/121.0.0.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36",
];

const ACCEPT_LANGUAGES: &[&str] = &[
    "en-US,en;q=0.9",
    "en-GB,en;q=0.9",
    "en-US,en;q=0.9,zh-CN;q=0.8,zh;q=0.7",
    "zh-CN,zh;q=0.9,en;q=0.8",
    "ja-JP,ja;q=0.9,en;q=0.8",
    "ko-KR,ko;q=0.9,en;q=0.8",
    "de-DE,de;q=0.9,en;q=0.8",
    "fr-FR,fr;q=0.9,en;q=0.8",
    "es-ES,es;q=0.9,en;q=0.8",
];

const SEC_CH_UA_LIST: &[&str] = &[
    r#""Not_A Brand";v="8", "Chromium";v="120", "Google Chrome";v="120""#,
    r#""Not_A Brand";v="8", "Chromium";v="121", "Google Chrome";v="121""#,
    r#""Not_A Brand";v="8", "Chromium";v="122", "Google Chrome";v="122""#,
    r#""Chromium";v="120", "Microsoft Edge";v="120", "Not=A?Brand";v="8""#,
    r#""Chromium";v="121", "Microsoft Edge";v="121", "Not=A?Brand";v="8""#,
];

#[derive(Debug, Clone)]
pub struct BrowserFingerprint {
    pub user_agent: String,
    pub accept: String,
    pub accept_language: String,
    pub accept_encoding: String,
    pub sec_ch_ua: Option<String>,
    pub sec_ch_ua_mobile: Option<String>,
    pub sec_ch_ua_platform: Option<String>,
}

impl BrowserFingerprint {
    fn generate(rng: &mut impl Rng) -> Self {
        let user_agent = USER_AGENTS.choose(rng).unwrap().to_string();
        let is_chrome = user_agent.contains("Chrome") && !user_agent.contains("Edg");
        let is_edge = user_agent.contains("Edg");

        let (sec_ch_ua, sec_ch_ua_mobile, sec_ch_ua_platform) = if is_chrome || is_edge {
            let platform = if user_agent.contains("Windows") {
                "\"Windows\""
            } else if user_agent.contains("Macintosh") {
                "\"macOS\""
            } else if user_agent.contains("Linux") {
                "\"Linux\""
            } else {
                "\"Unknown\""
            };
            (
                Some(SEC_CH_UA_LIST.choose(rng).unwrap().to_string()),
                Some("?0".to_string()),
                Some(platform.to_string()),
            )
        } else {
            (None, None, None)
        };

        Self {
            user_agent,
            accept: "application/json, text/plain, */*".to_string(),
            accept_language: ACCEPT_LANGUAGES.choose(rng).unwrap().to_string(),
            accept_encoding: "gzip, deflate, br".to_string(),
            sec_ch_ua,
            sec_ch_ua_mobile,
            sec_ch_ua_platform,
        }
    }
}

/// Pre-generated fingerprint pool, drawn from on every outbound request.
pub struct FingerprintPool {
    fingerprints: Vec<BrowserFingerprint>,
}

impl FingerprintPool {
    pub fn new(size: usize) -> Self {
        let mut rng = rand::thread_rng();
        let fingerprints = (0..size)
            .map(|_| BrowserFingerprint::generate(&mut rng))
            .collect();
        tracing::info!("Generated {} browser fingerprints", size);
        Self { fingerprints }
    }

    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }

    fn random(&self) -> &BrowserFingerprint {
        let mut rng = rand::thread_rng();
        self.fingerprints.choose(&mut rng).expect("pool is non-empty")
    }

    fn for_credential(&self, credential_id: &str) -> &BrowserFingerprint {
        let hash: u64 = credential_id.bytes().fold(0u64, |acc, b| {
            acc.wrapping_mul(31).wrapping_add(b as u64)
        });
        let idx = (hash as usize) % self.fingerprints.len();
        &self.fingerprints[idx]
    }

    /// Merge a complete, plausible set of browser headers into `base_headers`.
    ///
    /// With `sticky=true`, the same `credential_id` always draws the same
    /// fingerprint. An `Authorization` header is added from `api_key` only
    /// if one isn't already present in `base_headers`.
    pub fn build_headers(
        &self,
        credential_id: &str,
        api_key: Option<&str>,
        base_headers: &HashMap<String, String>,
        sticky: bool,
    ) -> HashMap<String, String> {
        let fp = if sticky {
            self.for_credential(credential_id)
        } else {
            self.random()
        };

        let mut headers = base_headers.clone();
        headers.insert("User-Agent".to_string(), fp.user_agent.clone());
        headers.insert("Accept".to_string(), fp.accept.clone());
        headers.insert("Accept-Language".to_string(), fp.accept_language.clone());
        headers.insert("Accept-Encoding".to_string(), fp.accept_encoding.clone());

        if let Some(ua) = &fp.sec_ch_ua {
            headers.insert("Sec-CH-UA".to_string(), ua.clone());
        }
        if let Some(mobile) = &fp.sec_ch_ua_mobile {
            headers.insert("Sec-CH-UA-Mobile".to_string(), mobile.clone());
        }
        if let Some(platform) = &fp.sec_ch_ua_platform {
            headers.insert("Sec-CH-UA-Platform".to_string(), platform.clone());
        }

        headers.insert("Sec-Fetch-Dest".to_string(), "empty".to_string());
        headers.insert("Sec-Fetch-Mode".to_string(), "cors".to_string());
        headers.insert("Sec-Fetch-Site".to_string(), "same-origin".to_string());

        if let Some(key) = api_key {
            headers
                .entry("Authorization".to_string())
                .or_insert_with(|| format!("Bearer {key}"));
        }

        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_generates_requested_size() {
        let pool = FingerprintPool::new(20);
        assert_eq!(pool.len(), 20);
    }

    #[test]
    fn test_sticky_fingerprint_is_stable() {
        let pool = FingerprintPool::new(50);
        let base = HashMap::new();
        let h1 = pool.build_headers("cred-123", None, &base, true);
        let h2 = pool.build_headers("cred-123", None, &base, true);
        assert_eq!(h1.get("User-Agent"), h2.get("User-Agent"));
    }

    #[test]
    fn test_build_headers_preserves_existing_authorization() {
        let pool = FingerprintPool::new(5);
        let mut base = HashMap::new();
        base.insert("Authorization".to_string(), "Bearer preset".to_string());
        let headers = pool.build_headers("cred-1", Some("ignored"), &base, true);
        assert_eq!(headers.get("Authorization").unwrap(), "Bearer preset");
    }

    #[test]
    fn test_build_headers_adds_authorization_when_absent() {
        let pool = FingerprintPool::new(5);
        let base = HashMap::new();
        let headers = pool.build_headers("cred-1", Some("sk-abc"), &base, true);
        assert_eq!(headers.get("Authorization").unwrap(), "Bearer sk-abc");
    }

    #[test]
    fn test_all_headers_present() {
        let pool = FingerprintPool::new(5);
        let base = HashMap::new();
        let headers = pool.build_headers("cred-1", None, &base, false);
        for key in ["User-Agent", "Accept", "Accept-Language", "Accept-Encoding"] {
            assert!(headers.contains_key(key));
        }
    }
}
