//! `mcp://<server>/<resource-uri>` references embedded in chat messages.

use std::fmt;

use url::Url;

const SCHEME_PREFIX: &str = "mcp://";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct McpUri {
    pub server: String,
    /// Resource URI as the server knows it; may itself contain slashes.
    pub resource: String,
}

impl McpUri {
    pub fn parse(input: &str) -> Option<Self> {
        if !input.starts_with(SCHEME_PREFIX) {
            return None;
        }
        let parsed = Url::parse(input).ok()?;
        let server = parsed.host_str().filter(|h| !h.is_empty())?.to_string();

        let mut resource = parsed.path().trim_start_matches('/').to_string();
        if resource.is_empty() {
            return None;
        }
        if let Some(q) = parsed.query() {
            resource.push('?');
            resource.push_str(q);
        }
        if let Some(f) = parsed.fragment() {
            resource.push('#');
            resource.push_str(f);
        }
        Some(Self { server, resource })
    }
}

impl fmt::Display for McpUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME_PREFIX}{}/{}", self.server, self.resource)
    }
}

/// Finds every well-formed `mcp://` reference in `text`, in order of appearance.
/// A reference ends at the first whitespace character.
pub fn extract_mcp_uris(text: &str) -> Vec<McpUri> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(idx) = rest.find(SCHEME_PREFIX) {
        let candidate = &rest[idx..];
        let end = candidate
            .find(char::is_whitespace)
            .unwrap_or(candidate.len());
        if let Some(uri) = McpUri::parse(&candidate[..end]) {
            out.push(uri);
        }
        rest = &candidate[end.max(SCHEME_PREFIX.len())..];
    }
    out
}
