use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use url::Url;

pub const INVALID_URL_MESSAGE: &str = "Enter a valid URL (including domain, e.g., example.com).";
pub const INVALID_URL_ON_SUBMIT: &str = "Enter a valid URL before saving.";

static LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9-]+$").expect("valid host label pattern"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UrlError {
    #[error("not an absolute address: {0}")]
    Unparseable(String),
    #[error("scheme {0:?} is not http or https")]
    Scheme(String),
    #[error("host {0:?} has no domain separator")]
    NoDomain(String),
    #[error("host label {0:?} contains characters outside [A-Za-z0-9-]")]
    LabelCharacters(String),
    #[error("host label {0:?} starts or ends with a hyphen")]
    LabelHyphen(String),
    #[error("top-level domain {0:?} is shorter than two characters")]
    ShortTld(String),
}

/// Syntactic check that `input` is a fetchable web address. Never touches the
/// network.
pub fn validate_url(input: &str) -> Result<Url, UrlError> {
    let url = Url::parse(input).map_err(|err| UrlError::Unparseable(err.to_string()))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(UrlError::Scheme(url.scheme().to_string()));
    }

    let host = url.host_str().unwrap_or_default();
    if !host.contains('.') {
        return Err(UrlError::NoDomain(host.to_string()));
    }

    let labels: Vec<&str> = host.split('.').collect();
    if let Some(bad) = labels.iter().find(|label| !LABEL.is_match(label)) {
        return Err(UrlError::LabelCharacters(bad.to_string()));
    }
    if let Some(bad) = labels
        .iter()
        .find(|label| label.starts_with('-') || label.ends_with('-'))
    {
        return Err(UrlError::LabelHyphen(bad.to_string()));
    }

    let tld = labels.last().copied().unwrap_or_default();
    if tld.len() < 2 {
        return Err(UrlError::ShortTld(tld.to_string()));
    }

    Ok(url)
}

pub fn is_valid_url(input: &str) -> bool {
    validate_url(input).is_ok()
}
