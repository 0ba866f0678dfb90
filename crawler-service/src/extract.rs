//! The extractor boundary. The orchestrating code only sees
//! `Extractor::extract`; rule-based and AI-backed implementations live
//! behind it. A page classifier short-circuits pages that never yield
//! people (press releases, job boards).

use once_cell::sync::Lazy;
use regex::Regex;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Candidate {
    pub first: Option<String>,
    pub last: Option<String>,
    pub full: Option<String>,
    pub title: Option<String>,
    pub email: Option<String>,
    pub source_url: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractHints {
    pub ai_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractorKind {
    Heuristic,
    Ai,
}

pub trait Extractor: Send + Sync {
    fn extract(&self, page_html: &str, source_url: &str, hints: &ExtractHints) -> Vec<Candidate>;
    fn kind(&self) -> ExtractorKind;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    PeopleLikely,
    PressRelease,
    JobBoard,
    Other,
}

/// Cheap pre-filter on raw HTML. Press-release and job-board pages list
/// names that are not employees and would poison extraction.
pub fn classify_page(html: &str, url: &str) -> PageKind {
    let lower_url = url.to_lowercase();
    let sample: String = html.chars().take(4096).collect::<String>().to_lowercase();
    if lower_url.contains("/press") || lower_url.contains("/news")
        || sample.contains("press release") || sample.contains("newsroom")
    {
        return PageKind::PressRelease;
    }
    if lower_url.contains("/careers") || lower_url.contains("/jobs")
        || sample.contains("open positions") || sample.contains("apply now")
    {
        return PageKind::JobBoard;
    }
    const PEOPLE_MARKERS: &[&str] =
        &["our team", "leadership", "meet the", "founders", "management team", "who we are"];
    if PEOPLE_MARKERS.iter().any(|m| sample.contains(m))
        || lower_url.contains("/team") || lower_url.contains("/about")
        || lower_url.contains("/people") || lower_url.contains("/leadership")
    {
        return PageKind::PeopleLikely;
    }
    PageKind::Other
}

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<(script|style)\b.*?</(script|style)>|<[^>]+>").unwrap());
static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b[a-z0-9][a-z0-9._%+-]*@[a-z0-9][a-z0-9.-]+\.[a-z]{2,}\b").unwrap()
});
// "Jane Doe — CTO", "Jane Doe, VP of Sales", "Jane van Doe - Director".
// Titles are single-space word runs; stripped tags leave runs of
// whitespace, which bounds the capture at element boundaries.
static PERSON_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b([A-Z][a-z]+(?: (?:van|von|de|da|del|di|la))?) ([A-Z][a-zA-Z'-]+) ?(?:—|–|-|,|\||·|:) ?([A-Z][A-Za-z.,&/-]*(?: [A-Za-z.,&/-]+){0,5})",
    )
    .unwrap()
});

static TITLE_KEYWORDS: &[&str] = &[
    "ceo", "cto", "cfo", "coo", "chief", "founder", "president", "director",
    "vp", "vice president", "head", "manager", "lead", "officer", "partner",
    "principal", "engineer", "architect",
];

/// Regex-driven extraction over de-tagged text. Conservative on purpose:
/// a missed person costs a lead, an invented one costs probe budget and
/// sender reputation.
pub struct RuleBasedExtractor;

impl RuleBasedExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RuleBasedExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl Extractor for RuleBasedExtractor {
    fn extract(&self, page_html: &str, source_url: &str, _hints: &ExtractHints) -> Vec<Candidate> {
        if matches!(classify_page(page_html, source_url), PageKind::PressRelease | PageKind::JobBoard) {
            return Vec::new();
        }
        let text = TAG_RE.replace_all(page_html, " ");
        let mut out: Vec<Candidate> = Vec::new();

        for caps in PERSON_RE.captures_iter(&text) {
            let first = caps[1].trim().to_string();
            let last = caps[2].trim().to_string();
            let title = caps[3].trim().trim_end_matches([',', '.']).to_string();
            let title_lower = title.to_lowercase();
            if !TITLE_KEYWORDS.iter().any(|k| title_lower.contains(k)) {
                continue;
            }
            let full = format!("{first} {last}");
            if out.iter().any(|c| c.full.as_deref() == Some(full.as_str())) {
                continue;
            }
            out.push(Candidate {
                first: Some(first),
                last: Some(last),
                full: Some(full),
                title: Some(title),
                email: None,
                source_url: source_url.to_string(),
                confidence: 0.7,
            });
        }

        // Addresses hide in mailto: attributes as often as in text, so the
        // email scan runs over the raw markup.
        for m in EMAIL_RE.find_iter(page_html) {
            let email = m.as_str().to_lowercase();
            if email.ends_with(".png") || email.ends_with(".jpg") || email.ends_with(".svg") {
                continue;
            }
            if out.iter().any(|c| c.email.as_deref() == Some(email.as_str())) {
                continue;
            }
            // Try to attach the address to an already-found person by
            // local-part similarity; otherwise keep it as a bare email.
            let local = email.split('@').next().unwrap_or("").to_lowercase();
            let owner = out.iter_mut().find(|c| {
                match (&c.first, &c.last) {
                    (Some(f), Some(l)) => {
                        let f = f.to_lowercase();
                        let l = l.to_lowercase();
                        c.email.is_none()
                            && (local.contains(&l) || (local.contains(&f) && f.len() > 2))
                    }
                    _ => false,
                }
            });
            match owner {
                Some(person) => person.email = Some(email),
                None => out.push(Candidate {
                    email: Some(email),
                    source_url: source_url.to_string(),
                    confidence: 0.9,
                    ..Default::default()
                }),
            }
        }
        out
    }

    fn kind(&self) -> ExtractorKind {
        ExtractorKind::Heuristic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEAM_PAGE: &str = r#"
        <html><head><title>Team</title><style>.x{color:red}</style></head>
        <body>
          <h1>Our Team</h1>
          <div><h3>Jane Doe — CTO</h3><p>Jane leads engineering.</p></div>
          <div><h3>John Smith, VP of Sales</h3>
               <a href="mailto:john.smith@example.com">email</a></div>
          <div><h3>Random Sentence That Is Not A Person</h3></div>
          <footer>contact@example.com</footer>
        </body></html>"#;

    #[test]
    fn extracts_people_and_emails_from_team_page() {
        let extractor = RuleBasedExtractor::new();
        let found = extractor.extract(TEAM_PAGE, "https://example.com/team", &ExtractHints::default());

        let jane = found.iter().find(|c| c.full.as_deref() == Some("Jane Doe")).unwrap();
        assert_eq!(jane.title.as_deref(), Some("CTO"));
        assert!(jane.email.is_none());

        let john = found.iter().find(|c| c.full.as_deref() == Some("John Smith")).unwrap();
        assert_eq!(john.email.as_deref(), Some("john.smith@example.com"));

        assert!(found.iter().any(|c| c.email.as_deref() == Some("contact@example.com") && c.full.is_none()));
    }

    #[test]
    fn press_and_job_pages_are_short_circuited() {
        let extractor = RuleBasedExtractor::new();
        let html = "<html><body>Press release: Jane Doe — CEO announced...</body></html>";
        assert!(extractor
            .extract(html, "https://example.com/press/2024", &ExtractHints::default())
            .is_empty());
        assert_eq!(
            classify_page("<html>Open positions. Apply now</html>", "https://x.test/careers"),
            PageKind::JobBoard
        );
    }

    #[test]
    fn page_classifier_spots_people_pages() {
        assert_eq!(
            classify_page("<html><h1>Meet the leadership</h1></html>", "https://x.test/company"),
            PageKind::PeopleLikely
        );
        assert_eq!(classify_page("<html>hello</html>", "https://x.test/"), PageKind::Other);
    }

    #[test]
    fn image_like_matches_are_dropped() {
        let extractor = RuleBasedExtractor::new();
        let html = "<html><body>Our team: logo@2x.png</body></html>";
        let found = extractor.extract(html, "https://x.test/team", &ExtractHints::default());
        assert!(found.iter().all(|c| c.email.is_none()));
    }
}
