//! Corrections for request URLs that known buggy clients send.
//!
//! Every fixer is stateless and idempotent, and only rewrites URLs it
//! recognises, so the chain gives the same result in any order.

use std::fmt;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::debug;

/// Rewrites a malformed URL, or returns it unchanged.
pub trait UrlFixer: Send + Sync {
    fn fix(&self, url: &str) -> String;
}

/// PlayStation network check URL, sent with the host segment duplicated:
///
/// `http://ps4-system.sec.np.dl.playstation.net http://ps4-system.sec.np.dl.playstation.net/ps4-system/party/np/v00/party_config.env`
///
/// which should be the second segment alone.
static PSN_DOUBLED_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^http://\S*[.]playstation[.]net http://\S*[.]playstation[.]net/\S*$")
        .expect("PSN URL pattern is valid")
});

/// Strips the duplicated leading segment from PlayStation network URLs.
#[derive(Debug, Clone, Copy, Default)]
pub struct PsnUrlFixer;

impl UrlFixer for PsnUrlFixer {
    fn fix(&self, url: &str) -> String {
        if !PSN_DOUBLED_URL.is_match(url) {
            return url.to_string();
        }

        // The first segment has no whitespace, so the first space is the seam.
        match url.split_once(' ') {
            Some((_, fixed)) => {
                debug!(original = %url, fixed = %fixed, "Fixed doubled PlayStation URL");
                fixed.to_string()
            }
            None => url.to_string(),
        }
    }
}

/// The set of fixers applied to every parsed request URL.
#[derive(Clone, Default)]
pub struct UrlFixers {
    fixers: Vec<Arc<dyn UrlFixer>>,
}

impl UrlFixers {
    /// A chain with no fixers.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A chain with every built-in fixer.
    pub fn with_defaults() -> Self {
        Self::empty().with(PsnUrlFixer)
    }

    /// Add a fixer to the chain.
    pub fn with(mut self, fixer: impl UrlFixer + 'static) -> Self {
        self.fixers.push(Arc::new(fixer));
        self
    }

    pub fn len(&self) -> usize {
        self.fixers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixers.is_empty()
    }

    /// Run `url` through every fixer.
    pub fn fix(&self, url: &str) -> String {
        self.fixers
            .iter()
            .fold(url.to_string(), |current, fixer| fixer.fix(&current))
    }
}

impl fmt::Debug for UrlFixers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UrlFixers")
            .field("count", &self.fixers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_psn_url_fixed() {
        let fixers = UrlFixers::with_defaults();
        assert_eq!(
            fixers.fix("http://x.playstation.net http://x.playstation.net/path"),
            "http://x.playstation.net/path"
        );
        assert_eq!(
            fixers.fix(
                "http://ps4-system.sec.np.dl.playstation.net http://ps4-system.sec.np.dl.playstation.net/ps4-system/party/np/v00/party_config.env"
            ),
            "http://ps4-system.sec.np.dl.playstation.net/ps4-system/party/np/v00/party_config.env"
        );
    }

    #[test]
    fn test_other_urls_unchanged() {
        let fixers = UrlFixers::with_defaults();
        assert_eq!(fixers.fix("http://example.com/path"), "http://example.com/path");
        assert_eq!(
            fixers.fix("http://x.playstation.net/path"),
            "http://x.playstation.net/path"
        );
        // Second segment without a path does not match.
        assert_eq!(
            fixers.fix("http://x.playstation.net http://x.playstation.net"),
            "http://x.playstation.net http://x.playstation.net"
        );
    }

    #[test]
    fn test_empty_chain_is_identity() {
        let fixers = UrlFixers::empty();
        assert!(fixers.is_empty());
        assert_eq!(fixers.fix("anything at all"), "anything at all");
    }

    fn psn_shaped() -> impl Strategy<Value = String> {
        ("[a-z0-9.-]{0,12}", "[a-z0-9.-]{0,12}", "[a-zA-Z0-9/._-]{0,24}").prop_map(
            |(a, b, path)| format!("http://{a}.playstation.net http://{b}.playstation.net/{path}"),
        )
    }

    proptest! {
        #[test]
        fn fix_is_idempotent(url in any::<String>()) {
            let fixers = UrlFixers::with_defaults();
            let once = fixers.fix(&url);
            prop_assert_eq!(fixers.fix(&once), once);
        }

        #[test]
        fn fix_is_idempotent_for_psn_urls(url in psn_shaped()) {
            let fixers = UrlFixers::with_defaults();
            let once = fixers.fix(&url);
            prop_assert!(!once.contains(' '));
            prop_assert_eq!(fixers.fix(&once), once);
        }
    }
}
