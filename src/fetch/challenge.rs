use scraper::{Html, Selector};

use crate::cli::config::ChallengeSettings;

/// Heuristics for recognizing anti-bot interstitial pages.
///
/// A page wins only if it is not itself a challenge: step-specific positive
/// selectors override the marker lists, because a job-board page can
/// legitimately mention "security" in its copy.
pub struct ChallengeDetector {
    title_markers: Vec<String>,
    content_markers: Vec<String>,
}

impl Default for ChallengeDetector {
    fn default() -> Self {
        Self {
            title_markers: [
                "just a moment",
                "checking your browser",
                "verify you are human",
                "attention required",
                "cloudflare",
                "security check",
                "access denied",
                "please wait",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            content_markers: [
                "cf-challenge",
                "cf-browser-verification",
                "turnstile",
                "checking if the site connection is secure",
                "enable javascript and cookies to continue",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl ChallengeDetector {
    pub fn from_settings(settings: &ChallengeSettings) -> Self {
        let defaults = Self::default();
        Self {
            title_markers: if settings.title_markers.is_empty() {
                defaults.title_markers
            } else {
                settings.title_markers.clone()
            },
            content_markers: if settings.content_markers.is_empty() {
                defaults.content_markers
            } else {
                settings.content_markers.clone()
            },
        }
    }

    /// Whether the fetched page still looks like a challenge interstitial.
    pub fn is_challenge(&self, title: &str, html: &str, positive_selectors: &[String]) -> bool {
        if selectors_present(html, positive_selectors) {
            return false;
        }

        let title = title.to_lowercase();
        if self.title_markers.iter().any(|m| title.contains(m)) {
            return true;
        }

        let html_lower = html.to_lowercase();
        self.content_markers.iter().any(|m| html_lower.contains(m))
    }

    /// Resolution signals for the interactive strategy: expected content
    /// appeared, or the page moved off its initial challenge state.
    pub fn looks_resolved(
        &self,
        title: &str,
        html: &str,
        current_url: &str,
        initial_title: &str,
        initial_url: &str,
        positive_selectors: &[String],
    ) -> bool {
        if selectors_present(html, positive_selectors) {
            return true;
        }
        if self.is_challenge(title, html, &[]) {
            return false;
        }
        // No markers left and the page moved on from where the challenge sat
        (title != initial_title || current_url != initial_url) && title.trim().len() >= 5
    }
}

/// Extract the document title from raw HTML.
pub fn page_title(html: &str) -> String {
    let document = Html::parse_document(html);
    let selector = match Selector::parse("title") {
        Ok(selector) => selector,
        Err(_) => return String::new(),
    };
    document
        .select(&selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .unwrap_or_default()
}

fn selectors_present(html: &str, selectors: &[String]) -> bool {
    if selectors.is_empty() {
        return false;
    }
    let document = Html::parse_document(html);
    selectors.iter().any(|raw| {
        Selector::parse(raw)
            .map(|selector| document.select(&selector).next().is_some())
            .unwrap_or(false)
    })
}
