use std::fmt::Write;

use chrono::NaiveDate;

use crate::libs::{commit::ConventionalCommit, release::TypeSection, version::SemanticVersion};

/// Sections the conventional commits preset shows when nothing overrides them.
const DEFAULT_SECTIONS: [(&str, &str); 4] = [
    ("feat", "Features"),
    ("fix", "Bug Fixes"),
    ("perf", "Performance Improvements"),
    ("revert", "Reverts"),
];

/// Section for each commit type. Configured types come first, in the order
/// given; defaults only fill in types the configuration leaves out.
fn section_titles(types: &[TypeSection]) -> Vec<(String, String)>
{
    let mut titles: Vec<(String, String)> = types
        .iter()
        .map(|entry| (entry.kind.clone(), entry.section.clone()))
        .collect();

    for (kind, section) in DEFAULT_SECTIONS
    {
        if !titles.iter().any(|(configured, _)| configured == kind)
        {
            titles.push((kind.to_string(), section.to_string()));
        }
    }
    titles
}

fn bullet(commit: &ConventionalCommit, text: &str) -> String
{
    match &commit.scope
    {
        Some(scope) => format!("* **{}:** {} ({})", scope, text, commit.short_hash()),
        None => format!("* {} ({})", text, commit.short_hash()),
    }
}

/// The footer text of a breaking change, or the subject when there is none.
fn breaking_note(commit: &ConventionalCommit) -> &str
{
    commit
        .body
        .lines()
        .find_map(|line| line.strip_prefix("BREAKING CHANGE:").or_else(|| line.strip_prefix("BREAKING-CHANGE:")))
        .map(str::trim)
        .filter(|note| !note.is_empty())
        .unwrap_or(&commit.subject)
}

/// Markdown release notes for `version`.
///
/// Commits whose type has no section are left out. Types sharing a section
/// title are listed together under it.
pub fn generate_notes(version: &SemanticVersion, date: NaiveDate, commits: &[ConventionalCommit], types: &[TypeSection]) -> String
{
    let mut notes = String::new();
    let _ = writeln!(notes, "## {} ({})", version.version(), date.format("%Y-%m-%d"));

    let breaking: Vec<String> = commits
        .iter()
        .filter(|commit| commit.breaking)
        .map(|commit| bullet(commit, breaking_note(commit)))
        .collect();
    if !breaking.is_empty()
    {
        let _ = write!(notes, "\n### ⚠ BREAKING CHANGES\n\n{}\n", breaking.join("\n"));
    }

    let titles = section_titles(types);
    let mut sections: Vec<(&str, Vec<String>)> = Vec::new();
    for (kind, title) in &titles
    {
        let entries = commits.iter().filter(|commit| &commit.kind == kind).map(|commit| bullet(commit, &commit.subject));
        match sections.iter_mut().find(|(existing, _)| *existing == title.as_str())
        {
            Some((_, bullets)) => bullets.extend(entries),
            None => sections.push((title.as_str(), entries.collect())),
        }
    }

    for (title, bullets) in sections.iter().filter(|(_, bullets)| !bullets.is_empty())
    {
        let _ = write!(notes, "\n### {}\n\n{}\n", title, bullets.join("\n"));
    }

    notes
}

#[cfg(test)]
fn commit(hash: &str, message: &str) -> ConventionalCommit
{
    ConventionalCommit::parse(hash, message).unwrap()
}

#[cfg(test)]
fn date() -> NaiveDate
{
    NaiveDate::from_ymd_opt(2026, 10, 16).unwrap()
}

#[test]
fn test_project_sections()
{
    let types = crate::libs::release::ReleaseConfig::project_default()
        .notes_generator()
        .unwrap()
        .preset_config
        .types;
    let commits = vec![
        commit("1111111aaaa", "patch(loki): retry on 503"),
        commit("2222222bbbb", "chore: tidy"),
        commit("3333333cccc", "minor: basic auth for loki"),
    ];

    let notes = generate_notes(&SemanticVersion::parse("1.3.0").unwrap(), date(), &commits, &types);

    assert_eq!(
        notes,
        "## 1.3.0 (2026-10-16)\n\
         \n\
         ### Other\n\
         \n\
         * **loki:** retry on 503 (1111111)\n\
         * basic auth for loki (3333333)\n"
    );
}

#[test]
fn test_default_sections_and_breaking_changes()
{
    let commits = vec![
        commit("aaaaaaa1", "fix: page through every service"),
        commit("bbbbbbb2", "feat(config)!: role regions are required\n\nBREAKING CHANGE: roles no longer inherit regions"),
        commit("ccccccc3", "feat: max_concurrency option"),
    ];

    let notes = generate_notes(&SemanticVersion::parse("2.0.0").unwrap(), date(), &commits, &[]);

    assert_eq!(
        notes,
        "## 2.0.0 (2026-10-16)\n\
         \n\
         ### ⚠ BREAKING CHANGES\n\
         \n\
         * **config:** roles no longer inherit regions (bbbbbbb)\n\
         \n\
         ### Features\n\
         \n\
         * **config:** role regions are required (bbbbbbb)\n\
         * max_concurrency option (ccccccc)\n\
         \n\
         ### Bug Fixes\n\
         \n\
         * page through every service (aaaaaaa)\n"
    );
}

#[test]
fn test_no_sections_without_commits()
{
    let notes = generate_notes(&SemanticVersion::parse("1.0.1").unwrap(), date(), &[commit("abcdef0", "docs: readme")], &[]);
    assert_eq!(notes, "## 1.0.1 (2026-10-16)\n");
}
