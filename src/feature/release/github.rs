use std::{path::Path, time::Duration};

use log::{debug, info, warn};
use reqwest::header::{ACCEPT, CONTENT_TYPE, USER_AGENT};

use crate::libs::{
    config::EnvLookup,
    error::{Error, Result},
    release::{render_template, GithubOptions, NextRelease},
};

const DEFAULT_BODY_TEMPLATE: &str = "<%= nextRelease.notes %>";
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Everything needed to talk to the GitHub Releases API for one repository.
#[derive(Clone)]
pub struct GithubContext
{
    token: String,
    pub owner: String,
    pub repo: String,
    api_url: Option<String>,
}

impl std::fmt::Debug for GithubContext
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("GithubContext")
            .field("owner", &self.owner)
            .field("repo", &self.repo)
            .field("api_url", &self.api_url)
            .finish_non_exhaustive()
    }
}

/// `owner` and `repo` from a remote URL, in any of the usual forms:
/// `git@github.com:owner/repo.git`, `ssh://git@github.com/owner/repo.git`
/// or `https://github.com/owner/repo`.
pub fn parse_remote_url(url: &str) -> Option<(String, String)>
{
    let trimmed = url.trim().trim_end_matches('/');
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);

    let mut segments = trimmed.rsplit(|c| c == '/' || c == ':');
    let repo = segments.next()?;
    let owner = segments.next()?;

    // Owners never contain dots, hosts always do.
    if repo.is_empty() || owner.is_empty() || owner.contains('.') || owner.contains('@')
    {
        return None;
    }
    Some((owner.to_string(), repo.to_string()))
}

fn parse_slug(slug: &str) -> Option<(String, String)>
{
    let (owner, repo) = slug.trim().split_once('/')?;
    if owner.is_empty() || repo.is_empty() || repo.contains('/')
    {
        return None;
    }
    Some((owner.to_string(), repo.to_string()))
}

/// Checks that a release could be published: a token is available and the
/// target repository is known.
pub fn verify(repository: &git2::Repository, env: EnvLookup<'_>) -> Result<GithubContext>
{
    let token = env("GITHUB_TOKEN").or_else(|| env("GH_TOKEN")).ok_or_else(|| {
        Error::Release("GITHUB_TOKEN or GH_TOKEN env variable is required to create a release on GitHub".to_string())
    })?;

    let (owner, repo) = match env("GITHUB_REPOSITORY")
    {
        Some(slug) => parse_slug(&slug)
            .ok_or_else(|| Error::Release(format!("GITHUB_REPOSITORY `{}` is not an owner/repo pair", slug)))?,
        None =>
        {
            let remote = repository.find_remote("origin")?;
            let url = remote
                .url()
                .ok_or_else(|| Error::Release("the origin remote URL is not valid UTF-8".to_string()))?;
            debug!("Loading repository from origin: {}", url);
            parse_remote_url(url)
                .ok_or_else(|| Error::Release(format!("cannot find a GitHub repository in the origin URL `{}`", url)))?
        }
    };

    info!("Verified GitHub access for {}/{}", owner, repo);
    Ok(GithubContext { token, owner, repo, api_url: env("GITHUB_API_URL") })
}

impl GithubContext
{
    fn octocrab(&self) -> Result<octocrab::Octocrab>
    {
        let mut builder = octocrab::Octocrab::builder().personal_token(self.token.clone());
        if let Some(api_url) = &self.api_url
        {
            builder = builder.base_uri(api_url.as_str())?;
        }
        Ok(builder.build()?)
    }
}

/// Creates the GitHub release for `next_release` and attaches the configured
/// assets, which are looked up relative to `asset_root`. Returns the release
/// page, or `None` on a dry run.
pub async fn publish(
    context: &GithubContext,
    next_release: &NextRelease,
    options: &GithubOptions,
    asset_root: &Path,
    dry_run: bool,
) -> Result<Option<String>>
{
    let tag = next_release.git_tag();
    let template = options.release_body_template.as_deref().unwrap_or(DEFAULT_BODY_TEMPLATE);
    let body = render_template(template, next_release)?;

    let mut assets = Vec::new();
    for asset in &options.assets
    {
        let path = asset_root.join(&asset.path);
        if !path.is_file()
        {
            warn!("The asset {} cannot be read, and will be ignored", path.display());
            continue;
        }
        let label = match &asset.label
        {
            Some(label) => render_template(label, next_release)?,
            None => asset.path.clone(),
        };
        assets.push((path, label));
    }

    if dry_run
    {
        info!("Skip creating release {} on {}/{} in dry-run mode", tag, context.owner, context.repo);
        for (path, label) in &assets
        {
            info!("Skip uploading {} as `{}` in dry-run mode", path.display(), label);
        }
        return Ok(None);
    }

    info!("Creating release: {}", tag);
    let release = context
        .octocrab()?
        .repos(&context.owner, &context.repo)
        .releases()
        .create(&tag)
        .name(&tag)
        .body(&body)
        .target_commitish(&next_release.git_head)
        .draft(false)
        // Release branches only ever produce full releases.
        .prerelease(false)
        .send()
        .await?;

    let client = upload_client(UPLOAD_TIMEOUT)?;
    for (path, label) in &assets
    {
        upload_asset(&client, &release.upload_url, &context.token, path, label).await?;
        info!("Published file {}", path.display());
    }

    info!("Published GitHub release: {}", release.html_url);
    Ok(Some(release.html_url.to_string()))
}

fn upload_client(timeout: Duration) -> Result<reqwest::Client>
{
    Ok(reqwest::Client::builder().connect_timeout(timeout).timeout(timeout).build()?)
}

/// Uploads one file to a release. `upload_url` is the hypermedia template
/// GitHub returns, e.g. `.../assets{?name,label}`.
async fn upload_asset(client: &reqwest::Client, upload_url: &str, token: &str, path: &Path, label: &str) -> Result<()>
{
    let base = upload_url.split('{').next().unwrap_or(upload_url);
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| Error::Release(format!("asset {} has no usable file name", path.display())))?;
    let url = reqwest::Url::parse_with_params(base, &[("name", name), ("label", label)])
        .map_err(|error| Error::Release(format!("invalid upload URL `{}`: {}", upload_url, error)))?;

    let contents = tokio::fs::read(path).await?;
    let response = client
        .post(url)
        .bearer_auth(token)
        .header(ACCEPT, "application/vnd.github+json")
        .header(CONTENT_TYPE, "application/octet-stream")
        .header(USER_AGENT, env!("CARGO_PKG_NAME"))
        .body(contents)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success()
    {
        let body = response.text().await?;
        return Err(Error::Release(format!("failed to upload {}: {} {}", name, status, body)));
    }
    Ok(())
}

#[cfg(test)]
fn sample_release() -> NextRelease
{
    use crate::libs::version::{ReleaseType, SemanticVersion};

    NextRelease {
        version: SemanticVersion::parse("1.0.0").unwrap(),
        release_type: ReleaseType::Major,
        git_head: "0123456789abcdef0123456789abcdef01234567".to_string(),
        notes: "## 1.0.0 (2026-10-16)\n".to_string(),
    }
}

/// A release as the GitHub API returns it.
#[cfg(test)]
pub(crate) fn release_response(server: &str, owner: &str, repo: &str, tag: &str) -> serde_json::Value
{
    let api = format!("{}/repos/{}/{}", server, owner, repo);
    serde_json::json!({
        "url": format!("{}/releases/1", api),
        "html_url": format!("https://github.com/{}/{}/releases/tag/{}", owner, repo, tag),
        "assets_url": format!("{}/releases/1/assets", api),
        "upload_url": format!("{}/uploads/repos/{}/{}/releases/1/assets{{?name,label}}", server, owner, repo),
        "tarball_url": format!("{}/tarball/{}", api, tag),
        "zipball_url": format!("{}/zipball/{}", api, tag),
        "id": 1,
        "node_id": "MDc6UmVsZWFzZTE=",
        "tag_name": tag,
        "target_commitish": "main",
        "name": tag,
        "body": "notes",
        "draft": false,
        "prerelease": false,
        "created_at": "2026-10-16T09:30:00Z",
        "published_at": "2026-10-16T09:30:00Z",
        "author": {
            "login": "octocat",
            "id": 1,
            "node_id": "MDQ6VXNlcjE=",
            "avatar_url": "https://github.com/images/error/octocat_happy.gif",
            "gravatar_id": "",
            "url": "https://api.github.com/users/octocat",
            "html_url": "https://github.com/octocat",
            "followers_url": "https://api.github.com/users/octocat/followers",
            "following_url": "https://api.github.com/users/octocat/following{/other_user}",
            "gists_url": "https://api.github.com/users/octocat/gists{/gist_id}",
            "starred_url": "https://api.github.com/users/octocat/starred{/owner}{/repo}",
            "subscriptions_url": "https://api.github.com/users/octocat/subscriptions",
            "organizations_url": "https://api.github.com/users/octocat/orgs",
            "repos_url": "https://api.github.com/users/octocat/repos",
            "events_url": "https://api.github.com/users/octocat/events{/privacy}",
            "received_events_url": "https://api.github.com/users/octocat/received_events",
            "type": "User",
            "site_admin": false
        },
        "assets": []
    })
}

#[test]
fn test_parse_remote_url()
{
    let expected = Some(("leigholiver".to_string(), "ecs-events-exporter".to_string()));

    assert_eq!(parse_remote_url("git@github.com:leigholiver/ecs-events-exporter.git"), expected);
    assert_eq!(parse_remote_url("ssh://git@github.com/leigholiver/ecs-events-exporter.git"), expected);
    assert_eq!(parse_remote_url("https://github.com/leigholiver/ecs-events-exporter"), expected);
    assert_eq!(parse_remote_url("https://github.com/leigholiver/ecs-events-exporter.git/"), expected);
    assert_eq!(parse_remote_url("https://github.com/ecs-events-exporter"), None);
    assert_eq!(parse_remote_url(""), None);
}

#[test]
fn test_verify_requires_token()
{
    let (_dir, repository) = crate::feature::retrieval::testing::init_repository();
    let env = crate::libs::config::env_from(&[("GITHUB_REPOSITORY", "leigholiver/ecs-events-exporter")]);

    let error = verify(&repository, &env).unwrap_err();
    assert!(error.to_string().contains("GITHUB_TOKEN"));
}

#[test]
fn test_verify_falls_back_to_origin()
{
    let (_dir, repository) = crate::feature::retrieval::testing::init_repository();
    repository.remote("origin", "git@github.com:leigholiver/ecs-events-exporter.git").unwrap();
    let env = crate::libs::config::env_from(&[("GH_TOKEN", "secret")]);

    let context = verify(&repository, &env).unwrap();
    assert_eq!((context.owner.as_str(), context.repo.as_str()), ("leigholiver", "ecs-events-exporter"));
    assert!(!format!("{:?}", context).contains("secret"));

    let env = crate::libs::config::env_from(&[("GH_TOKEN", "secret"), ("GITHUB_REPOSITORY", "someone/fork")]);
    assert_eq!(verify(&repository, &env).unwrap().owner, "someone");

    let env = crate::libs::config::env_from(&[("GH_TOKEN", "secret"), ("GITHUB_REPOSITORY", "not-a-slug")]);
    assert!(verify(&repository, &env).is_err());
}

#[tokio::test]
async fn test_dry_run_makes_no_requests()
{
    use wiremock::MockServer;

    let server = MockServer::start().await;
    let context = GithubContext {
        token: "secret".to_string(),
        owner: "leigholiver".to_string(),
        repo: "ecs-events-exporter".to_string(),
        api_url: Some(server.uri()),
    };
    let options = crate::libs::release::ReleaseConfig::project_default().github().unwrap();
    let dir = tempfile::TempDir::new().unwrap();

    let url = publish(&context, &sample_release(), &options, dir.path(), true).await.unwrap();

    assert_eq!(url, None);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_publish_creates_release_and_uploads_assets()
{
    use wiremock::{
        matchers::{body_partial_json, header, method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/repos/leigholiver/ecs-events-exporter/releases"))
        .and(body_partial_json(serde_json::json!({
            "tag_name": "v1.0.0",
            "name": "v1.0.0",
            "target_commitish": "0123456789abcdef0123456789abcdef01234567",
            "draft": false,
            "prerelease": false,
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(release_response(&server.uri(), "leigholiver", "ecs-events-exporter", "v1.0.0")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/uploads/repos/leigholiver/ecs-events-exporter/releases/1/assets"))
        .and(query_param("name", "ecs-events-exporter"))
        .and(query_param("label", "ecs-events-exporter-linux-v1.0.0"))
        .and(header("content-type", "application/octet-stream"))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("ecs-events-exporter"), b"\x7fELF").unwrap();

    let context = GithubContext {
        token: "secret".to_string(),
        owner: "leigholiver".to_string(),
        repo: "ecs-events-exporter".to_string(),
        api_url: Some(server.uri()),
    };
    let options = crate::libs::release::ReleaseConfig::project_default().github().unwrap();

    let url = publish(&context, &sample_release(), &options, dir.path(), false).await.unwrap();
    assert_eq!(url.as_deref(), Some("https://github.com/leigholiver/ecs-events-exporter/releases/tag/v1.0.0"));
}

#[tokio::test]
async fn test_missing_asset_is_skipped()
{
    use wiremock::{matchers::method, Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201).set_body_json(release_response(&server.uri(), "o", "r", "v1.0.0")))
        .expect(1)
        .mount(&server)
        .await;

    let context = GithubContext {
        token: "secret".to_string(),
        owner: "o".to_string(),
        repo: "r".to_string(),
        api_url: Some(server.uri()),
    };
    let options = crate::libs::release::ReleaseConfig::project_default().github().unwrap();
    let dir = tempfile::TempDir::new().unwrap();

    assert!(publish(&context, &sample_release(), &options, dir.path(), false).await.unwrap().is_some());
}

#[tokio::test]
async fn test_unanswered_upload_times_out()
{
    use wiremock::{matchers::method, Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201).set_delay(Duration::from_secs(600)))
        .mount(&server)
        .await;

    let dir = tempfile::TempDir::new().unwrap();
    let asset = dir.path().join("ecs-events-exporter");
    std::fs::write(&asset, b"\x7fELF").unwrap();
    let upload_url = format!("{}/uploads/repos/o/r/releases/1/assets{{?name,label}}", server.uri());
    let client = upload_client(Duration::from_millis(100)).unwrap();

    let result = tokio::time::timeout(
        Duration::from_secs(20),
        upload_asset(&client, &upload_url, "secret", &asset, "linux binary"),
    )
    .await;

    assert!(matches!(result.expect("upload should give up on its own"), Err(Error::Http(_))));
}
