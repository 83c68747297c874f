//! Provider URL canonicalization.
//!
//! Content identifiers hash a *canonical* form of the primary URL so that
//! cosmetic differences (scheme case, default ports, trailing slashes, view
//! parameters) never split the cache. Known providers collapse to short
//! tokens that survive site redesigns; unknown hosts keep `host + path`.

use url::Url;

use crate::error::DownloadError;

/// Hostname fragment of the mod-index provider.
pub const NEXUS_HOST: &str = "nexusmods.com";
/// Hostname fragment of the forum-storage provider.
pub const DEADLYSTREAM_HOST: &str = "deadlystream.com";
/// Hostname fragments of the anonymous-cloud provider.
pub const MEGA_HOSTS: [&str; 2] = ["mega.nz", "mega.co.nz"];
/// Hostname fragment of the JS-gated provider.
pub const MEDIAFIRE_HOST: &str = "mediafire.com";

/// Canonicalize a URL for identity purposes.
///
/// Already-canonical inputs (provider tokens such as `deadlystream:1234`, or
/// `host/path` forms without a scheme) are returned unchanged, which makes
/// normalization idempotent.
pub fn normalize_url(raw: &str, strip_query: bool) -> Result<String, DownloadError> {
    let url = match Url::parse(raw) {
        Ok(url) => url,
        // No scheme separator: treat as an already-normalized host/path form.
        Err(url::ParseError::RelativeUrlWithoutBase) => return Ok(raw.to_string()),
        Err(_) => return Err(DownloadError::invalid_url(raw)),
    };

    let scheme = url.scheme().to_ascii_lowercase();
    if scheme != "http" && scheme != "https" {
        // Provider tokens parse as exotic schemes (`mega:file:abc`); they are
        // already canonical.
        return Ok(raw.to_string());
    }

    let Some(host) = url.host_str() else {
        return Err(DownloadError::invalid_url(raw));
    };
    let host = host.to_ascii_lowercase();

    if let Some(token) = provider_token(&host, &url) {
        return Ok(token);
    }

    let mut path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        path.pop();
    }

    let mut out = host;
    // `Url::port` is already `None` for the scheme's default port.
    if let Some(port) = url.port() {
        out.push(':');
        out.push_str(&port.to_string());
    }
    out.push_str(&path);
    if !strip_query {
        if let Some(query) = url.query() {
            if !query.is_empty() {
                out.push('?');
                out.push_str(query);
            }
        }
    }
    Ok(out)
}

/// Collapse known provider URLs to stable short tokens.
fn provider_token(host: &str, url: &Url) -> Option<String> {
    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();

    if host.contains(NEXUS_HOST) {
        // nexusmods.com/<game>/mods/<id>
        if let [game, "mods", id, ..] = segments.as_slice() {
            let digits = leading_digits(id);
            if !digits.is_empty() {
                return Some(format!("nexusmods:{}:{digits}", game.to_ascii_lowercase()));
            }
        }
    } else if host.contains(DEADLYSTREAM_HOST) {
        // deadlystream.com/files/file/<id>-<slug>
        if let ["files", "file", seg, ..] = segments.as_slice() {
            let digits = leading_digits(seg);
            if !digits.is_empty() {
                return Some(format!("deadlystream:{digits}"));
            }
        }
    } else if MEGA_HOSTS.iter().any(|h| host.contains(h)) {
        // mega.nz/file/<id>#<key> or mega.nz/folder/<id>#<key>
        if let [kind @ ("file" | "folder"), id, ..] = segments.as_slice() {
            return Some(format!("mega:{kind}:{id}"));
        }
    }
    None
}

fn leading_digits(s: &str) -> &str {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    &s[..end]
}

/// Rewrite legacy anonymous-cloud fragment URLs to the modern path form.
///
/// `https://mega.nz/#!<id>!<key>` becomes `https://mega.nz/file/<id>#<key>`
/// and `#F!<id>!<key>` becomes `/folder/<id>#<key>`. URLs that are not in a
/// legacy form are returned unchanged.
#[must_use]
pub fn rewrite_legacy_cloud_url(raw: &str) -> String {
    let Ok(url) = Url::parse(raw) else {
        return raw.to_string();
    };
    let is_cloud = url
        .host_str()
        .is_some_and(|h| MEGA_HOSTS.iter().any(|m| h.to_ascii_lowercase().contains(m)));
    if !is_cloud {
        return raw.to_string();
    }
    let Some(fragment) = url.fragment() else {
        return raw.to_string();
    };

    let (kind, rest) = if let Some(rest) = fragment.strip_prefix("F!") {
        ("folder", rest)
    } else if let Some(rest) = fragment.strip_prefix('!') {
        ("file", rest)
    } else {
        return raw.to_string();
    };

    let (id, key) = match rest.split_once('!') {
        Some((id, key)) => (id, Some(key)),
        None => (rest, None),
    };
    if id.is_empty() {
        return raw.to_string();
    }

    let host = url.host_str().unwrap_or_default();
    let mut out = format!("{}://{host}/{kind}/{id}", url.scheme());
    if let Some(key) = key {
        out.push('#');
        out.push_str(key);
    }
    out
}
