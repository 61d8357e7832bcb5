use std::collections::HashSet;

use serde::{Deserialize, Serialize};

pub const FALLBACK_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// A STUN/TURN server usable by the peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn fallback() -> Vec<IceServer> {
        vec![IceServer::stun(FALLBACK_STUN_URL)]
    }
}

/// Server descriptor as the discovery endpoint returns it. `urls` may be a
/// single string or a list, and older deployments send `url`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawIceServer {
    #[serde(default, alias = "url")]
    pub urls: Option<UrlList>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum UrlList {
    One(String),
    Many(Vec<String>),
}

impl UrlList {
    fn into_vec(self) -> Vec<String> {
        match self {
            UrlList::One(url) => vec![url],
            UrlList::Many(urls) => urls,
        }
    }
}

fn is_comment(url: &str) -> bool {
    url.is_empty() || url.starts_with('#') || url.starts_with("//")
}

fn has_ice_scheme(url: &str) -> bool {
    let Some((scheme, rest)) = url.split_once(':') else {
        return false;
    };
    !rest.is_empty()
        && matches!(
            scheme.to_ascii_lowercase().as_str(),
            "stun" | "turn" | "turns"
        )
}

/// Cleans a discovery response. Comment-like entries and non STUN/TURN URLs
/// are dropped, duplicates are removed across servers, and servers left
/// without URLs disappear. An empty result falls back to public STUN.
pub fn normalize_ice_servers(raw: Vec<RawIceServer>) -> Vec<IceServer> {
    let mut seen = HashSet::new();
    let mut servers = Vec::new();
    for entry in raw {
        let urls: Vec<String> = entry
            .urls
            .map(UrlList::into_vec)
            .unwrap_or_default()
            .into_iter()
            .map(|url| url.trim().to_string())
            .filter(|url| !is_comment(url) && has_ice_scheme(url))
            .filter(|url| seen.insert(url.clone()))
            .collect();
        if urls.is_empty() {
            continue;
        }
        servers.push(IceServer {
            urls,
            username: entry.username.filter(|value| !value.is_empty()),
            credential: entry.credential.filter(|value| !value.is_empty()),
        });
    }
    if servers.is_empty() {
        tracing::debug!(target = "api", "no usable ice servers; using fallback stun");
        return IceServer::fallback();
    }
    servers
}
