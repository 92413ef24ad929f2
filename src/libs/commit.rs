use std::sync::OnceLock;

use regex::Regex;

/// A commit message following the `type(scope)!: subject` convention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConventionalCommit
{
    pub hash: String,
    pub kind: String,
    pub scope: Option<String>,
    pub breaking: bool,
    pub subject: String,
    pub body: String,
}

fn header_regex() -> &'static Regex
{
    static HEADER: OnceLock<Regex> = OnceLock::new();
    HEADER.get_or_init(|| {
        Regex::new(r"^(?P<type>[a-zA-Z]+)(?:\((?P<scope>[^()\r\n]+)\))?(?P<breaking>!)?:\s+(?P<subject>.+)$")
            .expect("header regex is valid")
    })
}

impl ConventionalCommit
{
    /// Returns `None` when the first line does not follow the convention.
    pub fn parse(hash: &str, message: &str) -> Option<ConventionalCommit>
    {
        let mut lines = message.lines();
        let header = lines.next()?.trim_end();
        let captures = header_regex().captures(header)?;

        let body = lines.collect::<Vec<&str>>().join("\n").trim().to_string();
        let breaking = captures.name("breaking").is_some()
            || body.lines().any(|line| line.starts_with("BREAKING CHANGE:") || line.starts_with("BREAKING-CHANGE:"));

        Some(ConventionalCommit {
            hash: hash.to_string(),
            kind: captures["type"].to_lowercase(),
            scope: captures.name("scope").map(|scope| scope.as_str().trim().to_string()),
            breaking,
            subject: captures["subject"].trim().to_string(),
            body,
        })
    }

    pub fn short_hash(&self) -> &str
    {
        let end = self.hash.len().min(7);
        &self.hash[..end]
    }
}

#[test]
fn test_parse_header()
{
    let commit = ConventionalCommit::parse("0123456789abcdef", "minor(loki): push tags as labels").unwrap();
    assert_eq!(commit.kind, "minor");
    assert_eq!(commit.scope.as_deref(), Some("loki"));
    assert!(!commit.breaking);
    assert_eq!(commit.subject, "push tags as labels");
    assert_eq!(commit.short_hash(), "0123456");
}

#[test]
fn test_parse_scope_with_dashes()
{
    let commit = ConventionalCommit::parse("abc", "patch(no-release): bump readme").unwrap();
    assert_eq!(commit.scope.as_deref(), Some("no-release"));
    assert_eq!(commit.short_hash(), "abc");
}

#[test]
fn test_parse_breaking()
{
    let commit = ConventionalCommit::parse("abc", "feat!: drop the v1 config format").unwrap();
    assert!(commit.breaking);
    assert_eq!(commit.scope, None);

    let commit = ConventionalCommit::parse("abc", "feat: rename options\n\nBREAKING CHANGE: `url` is now `endpoint`").unwrap();
    assert!(commit.breaking);
    assert_eq!(commit.body, "BREAKING CHANGE: `url` is now `endpoint`");
}

#[test]
fn test_parse_rejects_free_form()
{
    assert!(ConventionalCommit::parse("abc", "Merge branch 'main' into feature").is_none());
    assert!(ConventionalCommit::parse("abc", "fix:missing space").is_none());
    assert!(ConventionalCommit::parse("abc", "").is_none());
}
