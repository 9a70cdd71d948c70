use regex::Regex;
use url::Url;

const PLAYLIST_URL: &str = r#"https?://[^\s<>"'\\]+?\.m3u8(?:\?[^\s<>"'\\]*)?"#;
const SCRIPT_BODY: &str = r"(?is)<script\b[^>]*>(.*?)</script>";

/// Finds `.m3u8` URLs in page markup and inline scripts.
#[derive(Debug, Clone)]
pub struct CandidateScanner {
    playlist: Regex,
    script: Regex,
}

impl Default for CandidateScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl CandidateScanner {
    pub fn new() -> Self {
        Self {
            playlist: Regex::new(PLAYLIST_URL).expect("valid regex"),
            script: Regex::new(SCRIPT_BODY).expect("valid regex"),
        }
    }

    /// Unique candidates in first-seen order.
    pub fn scan(&self, body: &str) -> Vec<String> {
        let mut found = Vec::new();
        self.collect(body, &mut found);
        for capture in self.script.captures_iter(body) {
            if let Some(script) = capture.get(1) {
                // inline JSON escapes slashes
                let unescaped = script
                    .as_str()
                    .replace("\\/", "/")
                    .replace("\\u002F", "/")
                    .replace("\\u002f", "/");
                self.collect(&unescaped, &mut found);
            }
        }
        found
    }

    fn collect(&self, text: &str, found: &mut Vec<String>) {
        for hit in self.playlist.find_iter(text) {
            let candidate = hit.as_str().replace("&amp;", "&");
            if !found.contains(&candidate) {
                found.push(candidate);
            }
        }
    }
}

fn file_name(candidate: &str) -> &str {
    let path = candidate
        .split(['?', '#'])
        .next()
        .unwrap_or(candidate)
        .trim_end_matches('/');
    path.rsplit('/').next().unwrap_or(path)
}

fn preference(candidate: &str) -> u8 {
    let name = file_name(candidate).to_ascii_lowercase();
    if name.contains("master") {
        0
    } else if name.contains("playlist") {
        1
    } else if name.contains("index") {
        2
    } else {
        3
    }
}

/// Stable sort: `master` before `playlist` before `index` before the rest.
pub fn rank_candidates(mut candidates: Vec<String>) -> Vec<String> {
    candidates.sort_by_key(|candidate| preference(candidate));
    candidates
}

/// Picks one URL out of resolver output: best-ranked playlist URL, else
/// the first absolute http(s) URL. Lines that are not URLs never qualify.
pub fn select_resolver_url<'a, I>(lines: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let urls: Vec<&str> = lines
        .into_iter()
        .map(str::trim)
        .filter(|line| is_http_url(line))
        .collect();
    let playlists: Vec<String> = urls
        .iter()
        .filter(|url| url.to_ascii_lowercase().contains(".m3u8"))
        .map(|url| url.to_string())
        .collect();
    if let Some(best) = rank_candidates(playlists).into_iter().next() {
        return Some(best);
    }
    urls.first().map(|url| url.to_string())
}

fn is_http_url(line: &str) -> bool {
    Url::parse(line)
        .map(|url| matches!(url.scheme(), "http" | "https") && url.has_host())
        .unwrap_or(false)
}
