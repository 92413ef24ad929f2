use std::path::PathBuf;

use chrono::Utc;
use log::{debug, info};

use super::{
    notes::generate_notes,
    retrieval::{current_branch, next_release, ReleasePlan},
};
use crate::libs::{
    config::EnvLookup,
    error::{Error, Result},
    release::{NextRelease, ReleaseConfig, COMMIT_ANALYZER, GITHUB, NOTES_GENERATOR},
};

pub mod github;

#[derive(Debug, Clone)]
pub struct ReleaseOptions
{
    pub repository: PathBuf,
    pub dry_run: bool,
}

/// A release that was published, or would have been on a dry run.
#[derive(Debug, Clone)]
pub struct ReleaseOutcome
{
    pub previous_tag: Option<String>,
    pub next_release: NextRelease,
    pub url: Option<String>,
}

fn unknown_plugin(id: &str) -> Error
{
    Error::Release(format!("unknown plugin `{}`", id))
}

fn planned(plan: &Option<ReleasePlan>, step: &str) -> Result<ReleasePlan>
{
    plan.clone()
        .ok_or_else(|| Error::Release(format!("{} needs {} to run first", step, COMMIT_ANALYZER)))
}

/// Runs the configured plugins against the repository.
///
/// Returns `None` when nothing is released: HEAD is on a branch that does not
/// publish, or no commit since the last release calls for one.
pub async fn run(config: &ReleaseConfig, options: &ReleaseOptions, env: EnvLookup<'_>) -> Result<Option<ReleaseOutcome>>
{
    config.validate()?;

    let repository = git2::Repository::open(&options.repository)?;
    if repository.is_bare()
    {
        return Err(Error::Release("repository is bare".to_string()));
    }

    let branch = current_branch(&repository)?;
    info!("Selected branch: {}", branch);
    if !config.branches.iter().any(|configured| configured == &branch)
    {
        info!(
            "This run was triggered on the branch {}, while releases are only published from {}",
            branch,
            config.branches.join(", ")
        );
        return Ok(None);
    }

    // verifyConditions
    let mut github_context = None;
    for id in &config.verify_conditions
    {
        match id.as_str()
        {
            GITHUB => github_context = Some(github::verify(&repository, env)?),
            COMMIT_ANALYZER | NOTES_GENERATOR => debug!("{} has no conditions to verify", id),
            other => return Err(unknown_plugin(other)),
        }
    }

    let asset_root = repository.workdir().map(PathBuf::from).unwrap_or_else(|| options.repository.clone());
    let mut plan: Option<ReleasePlan> = None;
    let mut notes = String::new();
    let mut url = None;

    for plugin in &config.plugins
    {
        info!("Running {}", plugin.id());
        match plugin.id()
        {
            COMMIT_ANALYZER =>
            {
                let rules = config.commit_analyzer()?.release_rules;
                match next_release(&repository, &rules)?
                {
                    Some(next) => plan = Some(next),
                    None => return Ok(None),
                }
            }
            NOTES_GENERATOR =>
            {
                let plan = planned(&plan, NOTES_GENERATOR)?;
                let types = config.notes_generator()?.preset_config.types;
                notes = generate_notes(&plan.version, Utc::now().date_naive(), &plan.commits, &types);
            }
            GITHUB =>
            {
                let plan = planned(&plan, GITHUB)?;
                let context = match &github_context
                {
                    Some(context) => context.clone(),
                    None => github::verify(&repository, env)?,
                };
                let next = next_release_of(plan, &notes);
                url = github::publish(&context, &next, &config.github()?, &asset_root, options.dry_run).await?;
            }
            other => return Err(unknown_plugin(other)),
        }
    }

    let Some(plan) = plan else
    {
        info!("No {} configured, nothing to release", COMMIT_ANALYZER);
        return Ok(None);
    };

    let previous_tag = plan.last_release.as_ref().map(|last| last.tag.clone());
    Ok(Some(ReleaseOutcome { previous_tag, next_release: next_release_of(plan, &notes), url }))
}

fn next_release_of(plan: ReleasePlan, notes: &str) -> NextRelease
{
    NextRelease {
        version: plan.version,
        release_type: plan.release_type,
        git_head: plan.git_head,
        notes: notes.to_string(),
    }
}

#[cfg(test)]
fn release_options(dir: &tempfile::TempDir, dry_run: bool) -> ReleaseOptions
{
    ReleaseOptions { repository: dir.path().to_path_buf(), dry_run }
}

#[tokio::test]
async fn test_dry_run_of_first_release()
{
    use super::retrieval::testing;

    let (dir, repository) = testing::init_repository();
    testing::commit(&repository, "patch: initial import");
    testing::commit(&repository, "minor(loki): basic auth");
    let env = crate::libs::config::env_from(&[("GITHUB_TOKEN", "secret"), ("GITHUB_REPOSITORY", "leigholiver/ecs-events-exporter")]);

    let outcome = run(&ReleaseConfig::project_default(), &release_options(&dir, true), &env)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.previous_tag, None);
    assert_eq!(outcome.next_release.git_tag(), "v1.0.0");
    assert_eq!(outcome.url, None);
    assert!(outcome.next_release.notes.starts_with("## 1.0.0 ("));
    assert!(outcome.next_release.notes.contains("### Other"));
    assert!(outcome.next_release.notes.contains("* **loki:** basic auth"));
}

#[tokio::test]
async fn test_other_branches_do_not_release()
{
    use super::retrieval::testing;

    let (dir, repository) = testing::init_repository();
    let head = testing::commit(&repository, "major: everything");
    let commit = repository.find_commit(head).unwrap();
    repository.branch("feature", &commit, false).unwrap();
    repository.set_head("refs/heads/feature").unwrap();
    let env = crate::libs::config::env_from(&[]);

    let outcome = run(&ReleaseConfig::project_default(), &release_options(&dir, true), &env).await.unwrap();
    assert!(outcome.is_none());
}

#[tokio::test]
async fn test_verify_conditions_run_first()
{
    use super::retrieval::testing;

    let (dir, repository) = testing::init_repository();
    testing::commit(&repository, "major: everything");
    let env = crate::libs::config::env_from(&[("GITHUB_REPOSITORY", "leigholiver/ecs-events-exporter")]);

    let error = run(&ReleaseConfig::project_default(), &release_options(&dir, true), &env).await.unwrap_err();
    assert!(error.to_string().contains("GITHUB_TOKEN"));
}

#[tokio::test]
async fn test_invalid_config_is_rejected()
{
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = ReleaseConfig::project_default();
    config.branches.clear();
    let env = crate::libs::config::env_from(&[]);

    let error = run(&config, &release_options(&dir, true), &env).await.unwrap_err();
    assert!(matches!(error, Error::Validation(_)));
}

#[tokio::test]
async fn test_release_is_published()
{
    use wiremock::{matchers::{method, path}, Mock, MockServer, ResponseTemplate};

    use super::retrieval::testing;

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/repos/leigholiver/ecs-events-exporter/releases"))
        .respond_with(ResponseTemplate::new(201).set_body_json(github::release_response(&server.uri(), "leigholiver", "ecs-events-exporter", "v1.3.0")))
        .expect(1)
        .mount(&server)
        .await;

    let (dir, repository) = testing::init_repository();
    let first = testing::commit(&repository, "patch: initial import");
    testing::tag(&repository, "v1.2.0", first);
    testing::commit(&repository, "minor: role regions");
    let uri = server.uri();
    let env = crate::libs::config::env_from(&[
        ("GITHUB_TOKEN", "secret"),
        ("GITHUB_REPOSITORY", "leigholiver/ecs-events-exporter"),
        ("GITHUB_API_URL", uri.as_str()),
    ]);

    let outcome = run(&ReleaseConfig::project_default(), &release_options(&dir, false), &env)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.previous_tag.as_deref(), Some("v1.2.0"));
    assert_eq!(outcome.next_release.version.version(), "1.3.0");
    assert_eq!(outcome.url.as_deref(), Some("https://github.com/leigholiver/ecs-events-exporter/releases/tag/v1.3.0"));
}
