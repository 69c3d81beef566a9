//! Page origin, same-origin checks and URL normalization.

use url::Url;

/// The origin instrumented calls are compared against.
///
/// Relative targets resolve against the base URL and are therefore
/// same-origin. Scheme, host and port must match exactly; default ports are
/// made explicit before comparing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageOrigin {
    base: Url,
}

impl PageOrigin {
    pub fn parse(base: &str) -> Result<Self, url::ParseError> {
        Url::parse(base).map(|base| Self { base })
    }

    pub fn from_url(base: Url) -> Self {
        Self { base }
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Resolves `target` against the page base.
    pub fn resolve(&self, target: &str) -> Option<Url> {
        self.base.join(target).ok()
    }

    pub fn is_same_origin(&self, target: &str) -> bool {
        match self.resolve(target) {
            // Opaque origins (data:, file:) never compare equal.
            Some(url) => url.origin() == self.base.origin(),
            None => false,
        }
    }
}

/// Canonicalizes a request target before it is recorded.
pub trait UrlNormalizer: Send + Sync {
    fn normalize(&self, url: &str, origin: &PageOrigin) -> String;
}

/// Resolves relative targets to absolute URLs; unparsable targets pass
/// through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResolvingNormalizer;

impl UrlNormalizer for ResolvingNormalizer {
    fn normalize(&self, url: &str, origin: &PageOrigin) -> String {
        origin
            .resolve(url)
            .map_or_else(|| url.to_string(), String::from)
    }
}
