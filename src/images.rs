//! Embedded image URL extraction and checks.
//!
//! A note may reference images with Markdown (`![alt](url "title")`) or
//! HTML (`<img src="...">`). Each URL must be absolute (root-relative URLs
//! are resolved against the site URL when one is configured), must not be on
//! the block list, must be on the allow list when that list is non-empty,
//! and must answer a HEAD (or fallback GET) request with a 2xx status.

use regex::Regex;
use reqwest::Url;
use std::sync::OnceLock;
use std::time::Duration;

use crate::config::{Config, Secrets};

fn image_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"!\[[^\]]*\]\(\s*([^)\s]*)[^)]*\)|<img\b[^>]*?\bsrc\s*=\s*["']([^"']+)["']"#)
            .expect("static regex")
    })
}

/// Collect image URLs from Markdown and HTML image tags, in document order.
pub fn extract_image_urls(content: &str) -> Vec<String> {
    image_re()
        .captures_iter(content)
        .filter_map(|c| c.get(1).or_else(|| c.get(2)))
        .map(|m| m.as_str().trim().trim_start_matches('<').trim_end_matches('>').to_string())
        .filter(|u| !u.is_empty())
        .collect()
}

/// Whether `host` is `domain` or one of its subdomains.
pub fn host_matches(host: &str, domain: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    let domain = domain.trim().trim_start_matches('.').to_ascii_lowercase();
    if domain.is_empty() {
        return false;
    }
    host == domain || host.ends_with(&format!(".{}", domain))
}

/// Checks image URLs against domain lists and for reachability.
#[derive(Clone)]
pub struct ImageChecker {
    client: reqwest::Client,
    site_url: Option<Url>,
    allowed: Vec<String>,
    blocked: Vec<String>,
    check_reachability: bool,
}

impl ImageChecker {
    pub fn new(config: &Config, secrets: &Secrets) -> anyhow::Result<Self> {
        let (allowed, blocked) = config.image_domains(secrets);
        let site_url = match &config.site.url {
            Some(u) => Some(Url::parse(u)?),
            None => None,
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.validation.image_timeout_secs))
            .user_agent(concat!("summary-press/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            site_url,
            allowed,
            blocked,
            check_reachability: config.validation.check_image_reachability,
        })
    }

    /// Resolve a URL as written in the note into an absolute http(s) URL.
    pub fn resolve(&self, raw: &str) -> Result<Url, String> {
        if raw.starts_with('/') && !raw.starts_with("//") {
            return match &self.site_url {
                Some(base) => base
                    .join(raw)
                    .map_err(|_| format!("the image URL \"{}\" is not valid", raw)),
                None => Err(format!(
                    "the image \"{}\" must use an absolute URL (http:// or https://)",
                    raw
                )),
            };
        }
        if !raw.starts_with("http://") && !raw.starts_with("https://") {
            return Err(format!(
                "the image \"{}\" must use an absolute URL (http:// or https://)",
                raw
            ));
        }
        Url::parse(raw).map_err(|_| format!("the image URL \"{}\" is not valid", raw))
    }

    /// Domain policy only. Block list wins over allow list.
    pub fn check_domain(&self, url: &Url, raw: &str) -> Result<(), String> {
        let host = url.host_str().unwrap_or_default();
        if self.blocked.iter().any(|d| host_matches(host, d)) {
            return Err(format!("the domain of image \"{}\" is blocked", raw));
        }
        if !self.allowed.is_empty() && !self.allowed.iter().any(|d| host_matches(host, d)) {
            return Err(format!(
                "the domain of image \"{}\" is not in the list of allowed domains",
                raw
            ));
        }
        Ok(())
    }

    async fn is_reachable(&self, url: &Url) -> bool {
        match self.client.head(url.clone()).send().await {
            Ok(resp) if resp.status().is_success() => return true,
            Ok(resp) => {
                tracing::debug!(%url, status = %resp.status(), "HEAD failed, retrying with GET");
            }
            Err(e) => {
                tracing::debug!(%url, error = %e, "HEAD errored, retrying with GET");
            }
        }
        match self.client.get(url.clone()).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Check one URL; `Err` carries the user-facing message.
    pub async fn check_one(&self, raw: &str) -> Result<(), String> {
        let url = self.resolve(raw)?;
        self.check_domain(&url, raw)?;
        if self.check_reachability && !self.is_reachable(&url).await {
            return Err(format!(
                "the image \"{}\" is not reachable or the server took too long to answer",
                raw
            ));
        }
        Ok(())
    }

    /// Check every URL and collect the error messages.
    pub async fn check(&self, urls: &[String]) -> Vec<String> {
        let mut errors = Vec::new();
        for raw in urls {
            if let Err(e) = self.check_one(raw).await {
                errors.push(e);
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    fn checker(extra: &str, secrets: Secrets) -> ImageChecker {
        let toml = format!(
            "{}\n[validation]\ncheck_image_reachability = false\n\n[storage]\ntargets = [\"local\"]\n[storage.local]\nroot = \".\"\n",
            extra
        );
        ImageChecker::new(&parse_config(&toml).unwrap(), &secrets).unwrap()
    }

    #[test]
    fn extracts_markdown_and_html() {
        let body = r#"
![cover](https://img.example.org/a.png "A title")
Text <img class="x" src="https://cdn.example.org/b.jpg" alt="b">
![rel](/img/c.webp)
"#;
        assert_eq!(
            extract_image_urls(body),
            vec![
                "https://img.example.org/a.png",
                "https://cdn.example.org/b.jpg",
                "/img/c.webp"
            ]
        );
    }

    #[test]
    fn host_matching_is_suffix_on_label_boundary() {
        assert!(host_matches("example.org", "example.org"));
        assert!(host_matches("cdn.example.org", "example.org"));
        assert!(!host_matches("badexample.org", "example.org"));
        assert!(!host_matches("example.org", ""));
    }

    #[test]
    fn relative_urls_need_a_site() {
        let c = checker("", Secrets::default());
        assert!(c.resolve("/img/x.png").unwrap_err().contains("absolute"));
        assert!(c.resolve("img/x.png").unwrap_err().contains("absolute"));

        let c = checker("[site]\nurl = \"https://site.example\"", Secrets::default());
        assert_eq!(
            c.resolve("/img/x.png").unwrap().as_str(),
            "https://site.example/img/x.png"
        );
    }

    #[tokio::test]
    async fn block_list_wins_over_allow_list() {
        let secrets = Secrets {
            allowed_image_domains: vec!["example.org".into()],
            blocked_image_domains: vec!["bad.example.org".into()],
            ..Secrets::default()
        };
        let c = checker("", secrets);
        assert!(c.check_one("https://img.example.org/a.png").await.is_ok());
        assert!(c
            .check_one("https://bad.example.org/a.png")
            .await
            .unwrap_err()
            .contains("blocked"));
        assert!(c
            .check_one("https://other.net/a.png")
            .await
            .unwrap_err()
            .contains("allowed"));
    }

    #[tokio::test]
    async fn collects_one_error_per_bad_url() {
        let c = checker("", Secrets::default());
        let errors = c
            .check(&[
                "ftp://x/a.png".to_string(),
                "https://fine.example/a.png".to_string(),
                "https://[bad".to_string(),
            ])
            .await;
        assert_eq!(errors.len(), 2);
        assert!(errors[1].contains("not valid"));
    }
}
