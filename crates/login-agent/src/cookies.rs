//! Per-host cookie jar the HTTP client writes into.
//!
//! The backend ties a CAPTCHA to whatever session cookie it set on the
//! image response, so the jar has to be clearable per host before every
//! fetch. reqwest's built-in jar cannot do that; this one can.
//!
//! Cookies are scoped by request host only. `Path` and `Domain` attributes
//! are ignored, which is enough for a single-host backend. `Expires` is
//! read in RFC 2822 form (`Thu, 19 Nov 1981 08:52:00 GMT`) and in the
//! dashed Netscape form (`Thu, 01-Jan-1970 00:00:00 GMT`); other date
//! formats are ignored and the cookie is kept.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::cookie::CookieStore;
use reqwest::header::HeaderValue;
use reqwest::Url;

/// Cookie values keyed by host, then by cookie name.
#[derive(Debug, Default)]
pub struct HostCookieStore {
    jar: RwLock<HashMap<String, BTreeMap<String, String>>>,
}

impl HostCookieStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, host: &str, name: &str) -> Option<String> {
        let jar = self.jar.read().unwrap_or_else(PoisonError::into_inner);
        jar.get(host).and_then(|cookies| cookies.get(name)).cloned()
    }

    pub fn insert(&self, host: &str, name: &str, value: &str) {
        let mut jar = self.jar.write().unwrap_or_else(PoisonError::into_inner);
        jar.entry(host.to_string())
            .or_default()
            .insert(name.to_string(), value.to_string());
    }

    pub fn remove(&self, host: &str, name: &str) {
        let mut jar = self.jar.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(cookies) = jar.get_mut(host) {
            cookies.remove(name);
        }
    }

    /// Drop every cookie stored for `host`. Returns how many were removed.
    pub fn clear_host(&self, host: &str) -> usize {
        let mut jar = self.jar.write().unwrap_or_else(PoisonError::into_inner);
        jar.remove(host).map(|cookies| cookies.len()).unwrap_or(0)
    }

    pub fn count(&self, host: &str) -> usize {
        let jar = self.jar.read().unwrap_or_else(PoisonError::into_inner);
        jar.get(host).map(BTreeMap::len).unwrap_or(0)
    }

    fn apply(&self, host: &str, cookie: ParsedCookie) {
        if cookie.expired {
            self.remove(host, &cookie.name);
        } else {
            self.insert(host, &cookie.name, &cookie.value);
        }
    }
}

impl CookieStore for HostCookieStore {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        let Some(host) = url.host_str() else {
            return;
        };
        for header in cookie_headers {
            let Ok(raw) = header.to_str() else {
                continue;
            };
            match parse_set_cookie(raw) {
                Some(cookie) => self.apply(host, cookie),
                None => tracing::debug!(host, "ignoring malformed Set-Cookie header"),
            }
        }
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        let host = url.host_str()?;
        let jar = self.jar.read().unwrap_or_else(PoisonError::into_inner);
        let cookies = jar.get(host).filter(|c| !c.is_empty())?;
        let header = cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ");
        HeaderValue::from_str(&header).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCookie {
    pub name: String,
    pub value: String,
    /// `Max-Age<=0` or an `Expires` date in the past.
    pub expired: bool,
}

/// Parse the name, value and expiry of one `Set-Cookie` header.
pub fn parse_set_cookie(raw: &str) -> Option<ParsedCookie> {
    let mut parts = raw.split(';');
    let (name, value) = parts.next()?.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    let value = value.trim().trim_matches('"');

    let mut expired = false;
    for attr in parts {
        let Some((key, val)) = attr.split_once('=') else {
            continue;
        };
        let val = val.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "max-age" => {
                if val.parse::<i64>().map(|secs| secs <= 0).unwrap_or(false) {
                    expired = true;
                }
            }
            "expires" => {
                if parse_expires(val).is_some_and(|at| at <= Utc::now()) {
                    expired = true;
                }
            }
            _ => {}
        }
    }

    Some(ParsedCookie {
        name: name.to_string(),
        value: value.to_string(),
        expired,
    })
}

/// `Expires` date in RFC 2822 or dashed Netscape form.
fn parse_expires(val: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc2822(val) {
        return Some(at.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(val, "%a, %d-%b-%Y %H:%M:%S GMT")
        .ok()
        .map(|at| at.and_utc())
}
