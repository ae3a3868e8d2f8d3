//! Link-target sanitisation for rendered markdown.

const ALLOWED_SCHEMES: &[&str] = &["http", "https", "mailto"];
const MAX_DECODE_PASSES: usize = 3;

/// Return a safe `href` for a markdown link, or `"#"`.
///
/// The target is percent-decoded (repeatedly, best-effort) and stripped of
/// whitespace and control characters before its scheme is read, so encoded
/// or split schemes such as `JaVa%73CrIpT:` are recognised. Only `http`,
/// `https` and `mailto` survive; the original target is then HTML-escaped.
pub fn sanitise_markdown_href(href: &str) -> String {
    let trimmed = href.trim();
    match scheme_of(&decode_for_inspection(trimmed)) {
        Some(scheme) if ALLOWED_SCHEMES.contains(&scheme.as_str()) => html_escape(trimmed),
        _ => "#".to_string(),
    }
}

fn decode_for_inspection(raw: &str) -> String {
    let mut current = raw.to_string();
    for _ in 0..MAX_DECODE_PASSES {
        let decoded = String::from_utf8_lossy(&urlencoding::decode_binary(current.as_bytes())).into_owned();
        if decoded == current {
            break;
        }
        current = decoded;
    }
    current
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_control())
        .collect()
}

/// Lower-cased scheme, if the string starts with `scheme:`.
fn scheme_of(url: &str) -> Option<String> {
    let (scheme, _) = url.split_once(':')?;
    let mut chars = scheme.chars();
    let first = chars.next()?;
    if !first.is_ascii_alphabetic() {
        return None;
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')) {
        return None;
    }
    Some(scheme.to_ascii_lowercase())
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}
