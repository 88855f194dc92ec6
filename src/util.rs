use std::sync::Mutex;

use http::Uri;
use http::header::{HeaderName, HeaderValue};

use crate::error::Error;

const MAX_ERROR_BODY_LEN: usize = 2048;

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn parse_header_name(name: &str) -> Result<HeaderName, Error> {
    name.parse().map_err(|source| Error::InvalidHeaderName {
        name: name.to_owned(),
        source,
    })
}

pub(crate) fn parse_header_value(name: &str, value: &str) -> Result<HeaderValue, Error> {
    value.parse().map_err(|source| Error::InvalidHeaderValue {
        name: name.to_owned(),
        source,
    })
}

/// Parses the request target; only absolute `http`/`https` URLs with a host are accepted.
pub(crate) fn resolve_uri(uri_text: &str) -> Result<Uri, Error> {
    let trimmed = uri_text.trim();
    let invalid = || Error::InvalidUri {
        uri: redact_uri_for_logs(uri_text),
    };
    if trimmed.is_empty() {
        return Err(invalid());
    }
    let uri: Uri = trimmed.parse().map_err(|_| invalid())?;
    let scheme_ok = uri.scheme_str().is_some_and(|scheme| {
        scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https")
    });
    if !scheme_ok || uri.host().is_none() {
        return Err(invalid());
    }
    Ok(uri)
}

pub(crate) fn append_query_pairs(uri_text: &str, query_pairs: &[(String, String)]) -> String {
    if query_pairs.is_empty() {
        return uri_text.to_owned();
    }
    let Ok(mut url) = url::Url::parse(uri_text) else {
        return uri_text.to_owned();
    };
    {
        let mut serializer = url.query_pairs_mut();
        for (name, value) in query_pairs {
            serializer.append_pair(name, value);
        }
    }
    url.to_string()
}

pub(crate) fn default_port(uri: &Uri) -> Option<u16> {
    uri.port_u16().or_else(|| match uri.scheme_str() {
        Some(scheme) if scheme.eq_ignore_ascii_case("https") => Some(443),
        Some(scheme) if scheme.eq_ignore_ascii_case("http") => Some(80),
        _ => None,
    })
}

pub(crate) fn path_segments(uri: &Uri) -> impl Iterator<Item = &str> {
    uri.path().split('/').filter(|segment| !segment.is_empty())
}

/// Metrics label: host, optionally followed by the first two path segments.
pub(crate) fn endpoint_label(uri: &Uri, include_path: bool) -> String {
    let mut label = uri.host().unwrap_or_default().to_ascii_lowercase();
    if include_path {
        for segment in path_segments(uri).take(2) {
            label.push('/');
            label.push_str(&segment.to_ascii_lowercase());
        }
    }
    label
}

pub(crate) fn redact_uri_for_logs(uri_text: &str) -> String {
    let Ok(mut parsed) = url::Url::parse(uri_text) else {
        let without_query = uri_text.split(['?', '#']).next().unwrap_or(uri_text);
        return match without_query.split_once("://") {
            Some((scheme, rest)) => match rest.split_once('@') {
                Some((userinfo, host)) if !userinfo.contains('/') => format!("{scheme}://{host}"),
                _ => without_query.to_owned(),
            },
            None => without_query.to_owned(),
        };
    };

    let _ = parsed.set_username("");
    let _ = parsed.set_password(None);
    parsed.set_query(None);
    parsed.set_fragment(None);
    parsed.to_string()
}

pub(crate) fn truncate_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.chars().count() <= MAX_ERROR_BODY_LEN {
        return text.into_owned();
    }

    let truncated: String = text.chars().take(MAX_ERROR_BODY_LEN).collect();
    format!("{truncated}...(truncated)")
}
