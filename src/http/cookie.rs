use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};

/// RFC 1123 date as used in `Date` and `Expires`.
pub const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// A cookie to be sent in a `Set-Cookie` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    name: String,
    value: String,
    domain: Option<String>,
    path: Option<String>,
    secure: bool,
    http_only: bool,
    version: Option<u32>,
    comment: Option<String>,
    /// Lifetime in seconds. Also determines `Expires`.
    max_age: Option<i64>,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: None,
            secure: false,
            http_only: false,
            version: None,
            comment: None,
            max_age: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn set_domain(&mut self, domain: impl Into<String>) {
        self.domain = Some(domain.into());
    }

    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = Some(path.into());
    }

    pub fn set_secure(&mut self, secure: bool) {
        self.secure = secure;
    }

    pub fn set_http_only(&mut self, http_only: bool) {
        self.http_only = http_only;
    }

    pub fn set_version(&mut self, version: u32) {
        self.version = Some(version);
    }

    pub fn set_comment(&mut self, comment: impl Into<String>) {
        self.comment = Some(comment.into());
    }

    pub fn set_max_age(&mut self, seconds: i64) {
        self.max_age = Some(seconds);
    }

    /// Header value with `Expires` computed relative to `now`.
    pub fn header_value(&self, now: DateTime<Utc>) -> String {
        let mut out = format!("{}={}", self.name, self.value);
        if let Some(domain) = &self.domain {
            out.push_str("; Domain=");
            out.push_str(domain);
        }
        if let Some(path) = &self.path {
            out.push_str("; Path=");
            out.push_str(path);
        }
        if self.secure {
            out.push_str("; Secure");
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        if let Some(version) = self.version {
            out.push_str(&format!("; Version={}", version));
        }
        if let Some(comment) = &self.comment {
            out.push_str("; Comment=");
            out.push_str(comment);
        }
        if let Some(max_age) = self.max_age {
            out.push_str(&format!("; Max-Age={}", max_age));
            // Out of chrono's range: Max-Age alone still bounds the cookie.
            if let Some(expires) = TimeDelta::try_seconds(max_age).and_then(|d| now.checked_add_signed(d)) {
                out.push_str(&format!("; Expires={}", expires.format(HTTP_DATE)));
            }
        }
        out
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.header_value(Utc::now()))
    }
}
