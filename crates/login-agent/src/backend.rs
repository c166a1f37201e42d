//! HTTP implementation of [`SessionBroker`] and [`CredentialSubmitter`].
//!
//! `GET {captcha_path}` returns the CAPTCHA image and sets the session
//! cookie. `POST {login_path}` takes a form with `username`, `password`
//! and `code` and answers `{"status": "..."}`.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{HeaderMap, COOKIE, SET_COOKIE};
use reqwest::{Client, Url};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::LoginConfig;
use crate::cookies::HostCookieStore;
use crate::errors::{ErrorKind, LoginError};
use crate::session::{
    redact, CaptchaImage, CredentialSubmitter, LoginAttempt, Session, SessionBroker, SubmitReply,
};

#[derive(Debug, Deserialize)]
struct LoginResponse {
    status: String,
}

pub struct HttpBackend {
    client: Client,
    cookies: Arc<HostCookieStore>,
    captcha_url: Url,
    login_url: Url,
    host: String,
    cookie_name: String,
    token_pattern: Regex,
    /// Token handed out by the previous fetch; a repeat is treated as missing.
    last_token: Mutex<Option<String>>,
}

impl HttpBackend {
    pub fn new(config: &LoginConfig) -> Result<Self, LoginError> {
        Self::with_cookie_store(config, Arc::new(HostCookieStore::new()))
    }

    pub fn with_cookie_store(
        config: &LoginConfig,
        cookies: Arc<HostCookieStore>,
    ) -> Result<Self, LoginError> {
        let base = base_url(&config.backend_url)?;
        let captcha_url = join(&base, &config.captcha_path)?;
        let login_url = join(&base, &config.login_path)?;
        let host = base
            .host_str()
            .ok_or_else(|| {
                LoginError::Configuration(format!("backend URL has no host: {base}"))
            })?
            .to_string();

        if config.session_cookie.trim().is_empty() {
            return Err(LoginError::Configuration(
                "session cookie name is empty".into(),
            ));
        }
        let token_pattern = Regex::new(&format!(
            r"(?:^|[;,\s]){}=([^;,\s]+)",
            regex::escape(&config.session_cookie)
        ))
        .map_err(|e| LoginError::Configuration(format!("session cookie pattern: {e}")))?;

        let client = Client::builder()
            .cookie_provider(cookies.clone())
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            client,
            cookies,
            captcha_url,
            login_url,
            host,
            cookie_name: config.session_cookie.clone(),
            token_pattern,
            last_token: Mutex::new(None),
        })
    }

    pub fn captcha_url(&self) -> &Url {
        &self.captcha_url
    }

    pub fn login_url(&self) -> &Url {
        &self.login_url
    }

    pub fn cookies(&self) -> &Arc<HostCookieStore> {
        &self.cookies
    }

    /// Session token from raw `Set-Cookie` headers, for responses whose
    /// cookie the jar refused to store.
    pub fn token_from_headers(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .find_map(|raw| {
                self.token_pattern
                    .captures(raw)
                    .and_then(|caps| caps.get(1))
                    .map(|m| m.as_str().to_string())
            })
    }

    fn session_token(&self, headers: &HeaderMap) -> Option<String> {
        self.cookies
            .get(&self.host, &self.cookie_name)
            .or_else(|| self.token_from_headers(headers))
            .filter(|token| !token.is_empty())
    }

    /// Record `token` as the latest one. False if it repeats the previous fetch.
    fn remember_token(&self, token: &str) -> bool {
        let mut last = self.last_token.lock().unwrap_or_else(PoisonError::into_inner);
        if last.as_deref() == Some(token) {
            return false;
        }
        *last = Some(token.to_string());
        true
    }
}

#[async_trait]
impl SessionBroker for HttpBackend {
    async fn fetch_fresh(&self) -> Result<CaptchaImage, ErrorKind> {
        let cleared = self.cookies.clear_host(&self.host);
        debug!(host = %self.host, cleared, "cleared cookies before captcha fetch");

        let response = self
            .client
            .get(self.captcha_url.clone())
            .send()
            .await
            .map_err(|e| {
                warn!(url = %self.captcha_url, error = %e, "captcha request failed");
                ErrorKind::TransportError
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(url = %self.captcha_url, %status, "captcha endpoint returned error status");
            return Err(ErrorKind::TransportError);
        }

        let token = self.session_token(response.headers());
        let bytes = response.bytes().await.map_err(|e| {
            warn!(error = %e, "captcha body could not be read");
            ErrorKind::TransportError
        })?;

        let Some(token) = token else {
            warn!(cookie = %self.cookie_name, "captcha response carried no session token");
            return Err(ErrorKind::SessionMissing);
        };
        if !self.remember_token(&token) {
            warn!(token = %redact(&token), "backend reissued the previous session token");
            return Err(ErrorKind::SessionMissing);
        }

        debug!(token = %redact(&token), bytes = bytes.len(), "captcha fetched");
        Ok(CaptchaImage::new(bytes.to_vec(), Session::new(token)))
    }
}

#[async_trait]
impl CredentialSubmitter for HttpBackend {
    async fn submit(&self, attempt: &LoginAttempt<'_>) -> SubmitReply {
        let cookie = format!("{}={}", self.cookie_name, attempt.session.token());
        let form = [
            ("username", attempt.credentials.username()),
            ("password", attempt.credentials.password()),
            ("code", attempt.captcha_text),
        ];

        // An explicit Cookie header stops the client from adding jar cookies.
        let response = match self
            .client
            .post(self.login_url.clone())
            .header(COOKIE, cookie)
            .form(&form)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %self.login_url, error = %e, "login request failed");
                return SubmitReply::Transport(e.to_string());
            }
        };

        let status = response.status();
        if status.is_server_error() {
            warn!(%status, "login endpoint returned server error");
            return SubmitReply::Transport(format!("HTTP {status}"));
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return SubmitReply::Transport(e.to_string()),
        };

        match serde_json::from_str::<LoginResponse>(&body) {
            Ok(parsed) => {
                debug!(%status, backend_status = %parsed.status, "login response decoded");
                SubmitReply::Status(parsed.status)
            }
            Err(e) => {
                warn!(%status, error = %e, "login response was not the expected JSON");
                SubmitReply::Undecodable(e.to_string())
            }
        }
    }
}

fn base_url(raw: &str) -> Result<Url, LoginError> {
    let mut normalized = raw.trim().to_string();
    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    Url::parse(&normalized)
        .map_err(|e| LoginError::Configuration(format!("invalid backend URL {raw:?}: {e}")))
}

fn join(base: &Url, path: &str) -> Result<Url, LoginError> {
    base.join(path.trim_start_matches('/'))
        .map_err(|e| LoginError::Configuration(format!("invalid endpoint path {path:?}: {e}")))
}
