//! Parsing of commit messages.

use std::sync::LazyLock;

use regex::Regex;

static MERGE_PR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Merge pull request #(\d+)").expect("merge PR pattern is valid"));

static SQUASH_PR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(#(\d+)\)").expect("squash PR pattern is valid"));

static ANY_PR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#(\d+)").expect("PR reference pattern is valid"));

static CO_AUTHOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^[ \t]*co-authored-by:[ \t]*(.+?)[ \t]*$")
        .expect("co-author trailer pattern is valid")
});

static NOREPLY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:\d+\+)?([a-z0-9](?:[a-z0-9-]*[a-z0-9])?)@users\.noreply\.github\.com$")
        .expect("noreply address pattern is valid")
});

/// Find the pull request a commit message refers to.
///
/// Tries, in order: GitHub's merge commit subject (`Merge pull request #N`),
/// the squash-merge suffix (`(#N)`), then the first `#N` anywhere.
pub fn pr_number(message: &str) -> Option<u64> {
    [&*MERGE_PR_RE, &*SQUASH_PR_RE, &*ANY_PR_RE]
        .into_iter()
        .find_map(|re| re.captures(message)?.get(1)?.as_str().parse().ok())
}

/// Collect `Co-authored-by:` trailers as `Name <email>`.
///
/// Matching is case-insensitive. Duplicate trailers are kept once.
pub fn co_authors(message: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for caps in CO_AUTHOR_RE.captures_iter(message) {
        let Some(value) = caps.get(1).map(|m| m.as_str()) else {
            continue;
        };
        let normalized = normalize_identity(value);
        if !normalized.is_empty() && !out.contains(&normalized) {
            out.push(normalized);
        }
    }
    out
}

fn normalize_identity(value: &str) -> String {
    match (value.find('<'), value.rfind('>')) {
        (Some(open), Some(close)) if open < close => {
            let name = value[..open].trim();
            let email = value[open + 1..close].trim();
            if name.is_empty() {
                format!("<{email}>")
            } else {
                format!("{name} <{email}>")
            }
        }
        _ => value.trim().to_string(),
    }
}

/// GitHub login encoded in a `users.noreply.github.com` address.
///
/// Both the `ID+login@` and the older `login@` forms are recognized.
pub fn noreply_login(email: &str) -> Option<String> {
    NOREPLY_RE
        .captures(email.trim())
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// First line of a commit message.
pub fn subject(message: &str) -> &str {
    message.lines().next().unwrap_or_default()
}
