use url::Url;

const REDACTED: &str = "[REDACTED]";
const REDACTED_LONG: &str = "[REDACTED_LONG]";
const REDACTED_TOKEN: &str = "[REDACTED_TOKEN_HEURISTIC]";

const SENSITIVE_MARKERS: [&str; 5] = ["token", "pass", "auth", "key", "secret"];

/// Redact an argv for forensic logging.
///
/// Values following a sensitive flag, sensitive `k=v` pairs, auth-like URL
/// query parameters, oversized query values and bearer-token-shaped strings
/// are all replaced before anything reaches a log line.
pub fn redact_args(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut redact_next = false;
    for arg in args {
        if redact_next {
            out.push(REDACTED.to_string());
            redact_next = false;
            continue;
        }
        if is_sensitive_flag(arg) {
            redact_next = true;
            out.push(arg.clone());
            continue;
        }
        out.push(redact_value(arg));
    }
    out
}

/// Shell-safe reproduction string for the (already redacted) argv
pub fn cmd_repro(args: &[String]) -> String {
    redact_args(args)
        .iter()
        .map(|a| shell_quote(a))
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_sensitive_flag(arg: &str) -> bool {
    if !arg.starts_with('-') {
        return false;
    }
    let lower = arg.to_ascii_lowercase();
    SENSITIVE_MARKERS.iter().any(|m| lower.contains(m))
}

fn redact_value(arg: &str) -> String {
    // k=v pairs with a sensitive key
    if let Some((key, _)) = arg.split_once('=') {
        let lower = key.to_ascii_lowercase();
        if !key.is_empty() && SENSITIVE_MARKERS.iter().any(|m| lower.contains(m)) {
            return format!("{key}={REDACTED}");
        }
    }

    if arg.contains("://") {
        if let Ok(url) = Url::parse(arg) {
            return redact_url(url);
        }
    }

    if looks_like_token(arg) {
        return REDACTED_TOKEN.to_string();
    }

    arg.to_string()
}

fn redact_url(mut url: Url) -> String {
    if url.password().is_some() {
        let _ = url.set_password(Some(REDACTED));
    }
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if !pairs.is_empty() {
        let mut qp = url.query_pairs_mut();
        qp.clear();
        for (k, v) in pairs {
            let lower = k.to_ascii_lowercase();
            if SENSITIVE_MARKERS.iter().any(|m| lower.contains(m)) {
                qp.append_pair(&k, REDACTED);
            } else if v.len() > 128 {
                qp.append_pair(&k, REDACTED_LONG);
            } else {
                qp.append_pair(&k, &v);
            }
        }
    }
    url.to_string()
}

/// Bearer-token / JWT shape heuristic for bare strings over 50 chars
fn looks_like_token(s: &str) -> bool {
    let s = s.strip_prefix("Bearer ").unwrap_or(s);
    if s.len() <= 50 {
        return false;
    }
    // JWT: three dot-separated base64url segments
    let parts: Vec<&str> = s.split('.').collect();
    if parts.len() == 3 && parts.iter().all(|p| !p.is_empty() && is_base64url(p)) {
        return true;
    }
    // Opaque token: one long unbroken base64url run, no path separators
    !s.contains('/') && !s.contains(':') && is_base64url(s)
}

fn is_base64url(s: &str) -> bool {
    s.bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'=')
}

fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'/' | b':' | b'=' | b',' | b'%' | b'+')
        })
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}
