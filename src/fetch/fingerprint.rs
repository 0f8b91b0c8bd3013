use anyhow::Result;
use rand::{thread_rng, Rng};
use tracing::debug;

use crate::cli::config::HeaderProfile;

/// Pool of browser-like header profiles the fetch strategies draw from.
///
/// Rotating profiles keeps repeated requests from presenting one static
/// client signature to a defended site.
pub struct ProfilePool {
    profiles: Vec<HeaderProfile>,
}

impl ProfilePool {
    pub fn new(profiles: Vec<HeaderProfile>) -> Self {
        let profiles = if profiles.is_empty() {
            HeaderProfile::defaults()
        } else {
            profiles
        };
        Self { profiles }
    }

    /// Select a random profile.
    pub fn pick(&self) -> &HeaderProfile {
        let mut rng = thread_rng();
        let profile = &self.profiles[rng.gen_range(0..self.profiles.len())];
        debug!("selected header profile: {}", profile.name);
        profile
    }

    /// Get a specific profile by name.
    pub fn get(&self, name: &str) -> Result<&HeaderProfile> {
        self.profiles
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| anyhow::anyhow!("Header profile not found: {}", name))
    }
}

/// Full header set for a profile: its own headers plus the standard ones a
/// real browser always sends.
pub fn request_headers(profile: &HeaderProfile) -> Vec<(String, String)> {
    let mut headers = vec![
        ("User-Agent".to_string(), profile.user_agent.clone()),
        ("Accept-Language".to_string(), profile.accept_language.clone()),
        (
            "Accept".to_string(),
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8"
                .to_string(),
        ),
        ("Accept-Encoding".to_string(), "gzip, deflate, br".to_string()),
        ("Connection".to_string(), "keep-alive".to_string()),
        ("Upgrade-Insecure-Requests".to_string(), "1".to_string()),
        ("Sec-Fetch-Dest".to_string(), "document".to_string()),
        ("Sec-Fetch-Mode".to_string(), "navigate".to_string()),
        ("Sec-Fetch-Site".to_string(), "none".to_string()),
        ("Sec-Fetch-User".to_string(), "?1".to_string()),
    ];
    for (key, value) in &profile.extra_headers {
        headers.push((key.clone(), value.clone()));
    }
    headers
}
