use log::{debug, info, warn};

use crate::libs::{
    commit::ConventionalCommit,
    error::{Error, Result},
    release::{ReleaseRule, RuleRelease},
    version::{ReleaseType, SemanticVersion},
};

/// The most recent release reachable from HEAD.
#[derive(Debug, Clone)]
pub struct LastRelease
{
    pub version: SemanticVersion,
    pub tag: String,
    pub commit: git2::Oid,
}

/// What the commits since the last release add up to.
#[derive(Debug, Clone)]
pub struct ReleasePlan
{
    pub last_release: Option<LastRelease>,
    pub version: SemanticVersion,
    pub release_type: ReleaseType,
    pub git_head: String,
    pub commits: Vec<ConventionalCommit>,
}

pub fn current_branch(repository: &git2::Repository) -> Result<String>
{
    let head = repository.head()?;
    head.shorthand()
        .map(str::to_string)
        .ok_or_else(|| Error::Release("HEAD is not on a named branch".to_string()))
}

/// Highest semver tag whose commit is HEAD or one of its ancestors.
/// Tags that are not versions are ignored.
pub fn last_release(repository: &git2::Repository) -> Result<Option<LastRelease>>
{
    let head = repository.head()?.peel_to_commit()?.id();
    let mut latest: Option<LastRelease> = None;

    let tags = repository.tag_names(None)?;
    for tag_name in tags.iter().flatten()
    {
        let Ok(version) = SemanticVersion::parse(tag_name) else
        {
            debug!("Ignoring tag: {}", tag_name);
            continue;
        };

        // Annotated and lightweight tags both peel to their commit.
        let commit = repository.revparse_single(tag_name)?.peel_to_commit()?.id();
        if commit != head && !repository.graph_descendant_of(head, commit)?
        {
            debug!("Tag {} is not reachable from HEAD", tag_name);
            continue;
        }

        if latest.as_ref().map_or(true, |latest| version > latest.version)
        {
            latest = Some(LastRelease { version, tag: tag_name.to_string(), commit });
        }
    }

    Ok(latest)
}

/// Commits after `since` up to HEAD, oldest first. With no `since`, the whole history.
pub fn commits_since(repository: &git2::Repository, since: Option<git2::Oid>) -> Result<Vec<ConventionalCommit>>
{
    let mut revwalk = repository.revwalk()?;
    revwalk.push_head()?;
    if let Some(since) = since
    {
        revwalk.hide(since)?;
    }
    revwalk.set_sorting(git2::Sort::TOPOLOGICAL | git2::Sort::REVERSE)?;

    let mut commits = Vec::new();
    for id in revwalk
    {
        let commit = repository.find_commit(id?)?;
        let hash = commit.id().to_string();
        let message = commit.message().unwrap_or_default();

        match ConventionalCommit::parse(&hash, message)
        {
            Some(parsed) => commits.push(parsed),
            None => warn!("Commit: [NON-FORMATTED] {} - {} - {}", hash, commit.author().name().unwrap_or_default(), message.lines().next().unwrap_or_default()),
        }
    }

    Ok(commits)
}

/// The release a single commit asks for.
///
/// A matching `release: false` rule wins over everything else. Otherwise the
/// largest release among matching rules applies. When no rule matches, the
/// conventional defaults do: breaking changes are major, `feat` is minor,
/// `fix` and `perf` are patches.
pub fn analyze_commit(rules: &[ReleaseRule], commit: &ConventionalCommit) -> Option<ReleaseType>
{
    let matching: Vec<&ReleaseRule> = rules
        .iter()
        .filter(|rule| rule.matches(&commit.kind, commit.scope.as_deref()))
        .collect();

    if matching.iter().any(|rule| rule.release == RuleRelease::Suppress)
    {
        return None;
    }

    let custom = matching
        .iter()
        .filter_map(|rule| match rule.release
        {
            RuleRelease::Bump(release_type) => Some(release_type),
            RuleRelease::Suppress => None,
        })
        .max();
    if custom.is_some()
    {
        return custom;
    }

    if commit.breaking
    {
        return Some(ReleaseType::Major);
    }
    match commit.kind.as_str()
    {
        "feat" => Some(ReleaseType::Minor),
        "fix" | "perf" => Some(ReleaseType::Patch),
        _ => None,
    }
}

/// Works out the next release from HEAD, or `None` when no commit since the
/// last release calls for one.
pub fn next_release(repository: &git2::Repository, rules: &[ReleaseRule]) -> Result<Option<ReleasePlan>>
{
    let last = last_release(repository)?;
    match &last
    {
        Some(last) => info!("Found git tag {} associated with version {}", last.tag, last.version.version()),
        None => info!("No git tag version found"),
    }

    let commits = commits_since(repository, last.as_ref().map(|last| last.commit))?;
    info!("Found {} commits since last release", commits.len());

    let mut release_type: Option<ReleaseType> = None;
    for commit in &commits
    {
        let commit_type = analyze_commit(rules, commit);
        info!(
            "Commit: [{}] {} - {}",
            commit_type.map_or("no release".to_string(), |t| t.to_string()),
            commit.short_hash(),
            commit.subject
        );
        release_type = release_type.max(commit_type);
    }

    let Some(release_type) = release_type else
    {
        info!("There are no relevant changes, so no new version is released");
        return Ok(None);
    };

    // The first release is always 1.0.0.
    let version = match &last
    {
        Some(last) => last.version.bumped(release_type)?,
        None => SemanticVersion { major: 1, ..SemanticVersion::new() },
    };
    info!("The next release version is {}", version.version());

    let git_head = repository.head()?.peel_to_commit()?.id().to_string();
    Ok(Some(ReleasePlan { last_release: last, version, release_type, git_head, commits }))
}

#[cfg(test)]
pub(crate) mod testing
{
    use git2::{Oid, Repository, RepositoryInitOptions, Signature};
    use tempfile::TempDir;

    pub fn init_repository() -> (TempDir, Repository)
    {
        let dir = TempDir::new().unwrap();
        let mut options = RepositoryInitOptions::new();
        options.initial_head("main");
        let repository = Repository::init_opts(dir.path(), &options).unwrap();
        (dir, repository)
    }

    pub fn commit(repository: &Repository, message: &str) -> Oid
    {
        let signature = Signature::now("Test Author", "author@example.com").unwrap();
        let tree_id = repository.index().unwrap().write_tree().unwrap();
        let tree = repository.find_tree(tree_id).unwrap();
        let parent = repository.head().ok().and_then(|head| head.peel_to_commit().ok());
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        repository.commit(Some("HEAD"), &signature, &signature, message, &tree, &parents).unwrap()
    }

    pub fn tag(repository: &Repository, name: &str, commit: Oid)
    {
        let object = repository.find_object(commit, None).unwrap();
        let signature = Signature::now("Test Author", "author@example.com").unwrap();
        repository.tag(name, &object, &signature, &format!("Release: {}", name), false).unwrap();
    }
}

#[cfg(test)]
fn project_rules() -> Vec<ReleaseRule>
{
    crate::libs::release::ReleaseConfig::project_default().commit_analyzer().unwrap().release_rules
}

#[test]
fn test_analyze_commit_with_project_rules()
{
    let rules = project_rules();
    let analyze = |message: &str| analyze_commit(&rules, &ConventionalCommit::parse("abc", message).unwrap());

    assert_eq!(analyze("patch: fix label sanitizing"), Some(ReleaseType::Patch));
    assert_eq!(analyze("minor(loki): basic auth"), Some(ReleaseType::Minor));
    assert_eq!(analyze("major: new config format"), Some(ReleaseType::Major));
    assert_eq!(analyze("major(no-release): draft config format"), None);
    assert_eq!(analyze("chore: tidy"), None);

    // Nothing custom matched, so the conventional defaults apply.
    assert_eq!(analyze("feat: add kafka emitter"), Some(ReleaseType::Minor));
    assert_eq!(analyze("fix: handle empty pages"), Some(ReleaseType::Patch));
    assert_eq!(analyze("refactor!: rename everything"), Some(ReleaseType::Major));
}

#[test]
fn test_analyze_commit_highest_rule_wins()
{
    let rules: Vec<ReleaseRule> = serde_json::from_str(r#"[
        { "type": "docs", "release": "patch" },
        { "scope": "api", "release": "minor" }
    ]"#).unwrap();

    let commit = ConventionalCommit::parse("abc", "docs(api): document the push endpoint").unwrap();
    assert_eq!(analyze_commit(&rules, &commit), Some(ReleaseType::Minor));
}

#[test]
fn test_first_release()
{
    let (_dir, repository) = testing::init_repository();
    testing::commit(&repository, "patch: initial import");
    testing::commit(&repository, "Merge branch 'wip'");

    assert_eq!(current_branch(&repository).unwrap(), "main");
    assert!(last_release(&repository).unwrap().is_none());

    let plan = next_release(&repository, &project_rules()).unwrap().unwrap();
    assert_eq!(plan.version.version(), "1.0.0");
    assert_eq!(plan.release_type, ReleaseType::Patch);
    assert_eq!(plan.commits.len(), 1);
}

#[test]
fn test_next_release_since_last_tag()
{
    let (_dir, repository) = testing::init_repository();
    let first = testing::commit(&repository, "patch: initial import");
    testing::tag(&repository, "v1.2.0", first);
    testing::tag(&repository, "nightly", first);
    testing::commit(&repository, "patch: fix pagination");
    testing::commit(&repository, "minor: loki basic auth");
    testing::commit(&repository, "major(no-release): sketch v2 config");

    let last = last_release(&repository).unwrap().unwrap();
    assert_eq!(last.tag, "v1.2.0");

    let plan = next_release(&repository, &project_rules()).unwrap().unwrap();
    assert_eq!(plan.release_type, ReleaseType::Minor);
    assert_eq!(plan.version.version(), "1.3.0");
    let subjects: Vec<&str> = plan.commits.iter().map(|c| c.subject.as_str()).collect();
    assert_eq!(subjects, vec!["fix pagination", "loki basic auth", "sketch v2 config"]);
}

#[test]
fn test_highest_reachable_tag_wins()
{
    let (_dir, repository) = testing::init_repository();
    let first = testing::commit(&repository, "patch: one");
    testing::tag(&repository, "v1.0.0", first);
    let second = testing::commit(&repository, "patch: two");
    testing::tag(&repository, "v1.0.1", second);

    assert_eq!(last_release(&repository).unwrap().unwrap().version.version(), "1.0.1");
    assert!(next_release(&repository, &project_rules()).unwrap().is_none());
}

#[test]
fn test_nothing_to_release()
{
    let (_dir, repository) = testing::init_repository();
    let first = testing::commit(&repository, "patch: one");
    testing::tag(&repository, "v1.0.0", first);
    testing::commit(&repository, "chore: bump dependencies");
    testing::commit(&repository, "patch(no-release): readme");

    assert!(next_release(&repository, &project_rules()).unwrap().is_none());
}
