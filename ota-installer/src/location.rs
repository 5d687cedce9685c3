// Download URL comparisons used for continuity and record-store retention decisions.

use url::Url;

fn parse(raw: &str) -> Option<Url> {
    Url::parse(raw.trim()).ok()
}

/// Scheme and host (both lowercase) of an absolute URL.
pub fn origin(raw: &str) -> Option<(String, String)> {
    let url = parse(raw)?;
    let host = url.host_str()?.to_ascii_lowercase();
    Some((url.scheme().to_ascii_lowercase(), host))
}

/// Two download URLs come from the same origin (scheme + host, case-insensitive).
/// Unparsable URLs never match.
pub fn same_origin(a: &str, b: &str) -> bool {
    match (origin(a), origin(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Scheme, host and path all equal; query and fragment are ignored.
pub fn same_scheme_host_path(a: &str, b: &str) -> bool {
    match (parse(a), parse(b)) {
        (Some(a), Some(b)) => {
            a.scheme().eq_ignore_ascii_case(b.scheme())
                && a.host_str().map(str::to_ascii_lowercase)
                    == b.host_str().map(str::to_ascii_lowercase)
                && a.path() == b.path()
        }
        _ => false,
    }
}

/// Resolve the archive URL advertised by a descriptor. Relative URLs resolve against the
/// descriptor URL; without one they are an error.
pub fn resolve_archive_url(
    descriptor_url: Option<&str>,
    archive_url: &str,
) -> Result<String, url::ParseError> {
    let archive_url = archive_url.trim();
    match Url::parse(archive_url) {
        Ok(url) => Ok(url.to_string()),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let base = descriptor_url.ok_or(url::ParseError::RelativeUrlWithoutBase)?;
            let base = Url::parse(base.trim())?;
            Ok(base.join(archive_url)?.to_string())
        }
        Err(e) => Err(e),
    }
}
