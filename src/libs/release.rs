use std::{collections::HashSet, path::Path, sync::OnceLock};

use regex::Regex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::{
    error::{Error, Result},
    version::{ReleaseType, SemanticVersion},
};

pub const COMMIT_ANALYZER: &str = "@semantic-release/commit-analyzer";
pub const NOTES_GENERATOR: &str = "@semantic-release/release-notes-generator";
pub const GITHUB: &str = "@semantic-release/github";

/// Plugins in the only order that makes sense to run them: analysis, notes, publishing.
const PLUGIN_ORDER: [&str; 3] = [COMMIT_ANALYZER, NOTES_GENERATOR, GITHUB];

/// Release configuration, read from `.releaserc.json`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseConfig
{
    pub branches: Vec<String>,
    pub preset: String,
    pub plugins: Vec<PluginEntry>,
    #[serde(default)]
    pub verify_conditions: Vec<String>,
}

/// A plugin is either a bare identifier or an `[identifier, options]` pair.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum PluginEntry
{
    Bare(String),
    Configured(String, serde_json::Value),
}

impl PluginEntry
{
    pub fn id(&self) -> &str
    {
        match self
        {
            PluginEntry::Bare(id) | PluginEntry::Configured(id, _) => id,
        }
    }

    pub fn options(&self) -> Option<&serde_json::Value>
    {
        match self
        {
            PluginEntry::Bare(_) => None,
            PluginEntry::Configured(_, options) => Some(options),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommitAnalyzerOptions
{
    #[serde(default)]
    pub release_rules: Vec<ReleaseRule>,
}

/// Maps commits matching `type` and/or `scope` to a release effect.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReleaseRule
{
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub release: RuleRelease,
}

impl ReleaseRule
{
    /// A rule without conditions matches every commit.
    pub fn matches(&self, kind: &str, scope: Option<&str>) -> bool
    {
        let kind_matches = self.kind.as_deref().map_or(true, |expected| expected == kind);
        let scope_matches = self.scope.as_deref().map_or(true, |expected| Some(expected) == scope);
        kind_matches && scope_matches
    }
}

/// `"patch" | "minor" | "major"` bumps the version; `false` suppresses the release.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(try_from = "RawRelease", into = "RawRelease")]
pub enum RuleRelease
{
    Bump(ReleaseType),
    Suppress,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawRelease
{
    Bump(ReleaseType),
    Flag(bool),
}

impl TryFrom<RawRelease> for RuleRelease
{
    type Error = String;

    fn try_from(raw: RawRelease) -> std::result::Result<Self, Self::Error>
    {
        match raw
        {
            RawRelease::Bump(release_type) => Ok(RuleRelease::Bump(release_type)),
            RawRelease::Flag(false) => Ok(RuleRelease::Suppress),
            RawRelease::Flag(true) => Err("`release: true` is not a release type; use \"patch\", \"minor\", \"major\" or false".to_string()),
        }
    }
}

impl From<RuleRelease> for RawRelease
{
    fn from(release: RuleRelease) -> Self
    {
        match release
        {
            RuleRelease::Bump(release_type) => RawRelease::Bump(release_type),
            RuleRelease::Suppress => RawRelease::Flag(false),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotesGeneratorOptions
{
    #[serde(default)]
    pub preset_config: PresetConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct PresetConfig
{
    #[serde(default)]
    pub types: Vec<TypeSection>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TypeSection
{
    #[serde(rename = "type")]
    pub kind: String,
    pub section: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GithubOptions
{
    #[serde(default)]
    pub assets: Vec<Asset>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_body_template: Option<String>,
}

/// A build artifact attached to the release. `label` is a template.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Asset
{
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Values a template can interpolate as `nextRelease.<field>`.
#[derive(Debug, Clone)]
pub struct NextRelease
{
    pub version: SemanticVersion,
    pub release_type: ReleaseType,
    pub git_head: String,
    pub notes: String,
}

impl NextRelease
{
    pub fn git_tag(&self) -> String
    {
        self.version.git_tag()
    }

    fn field(&self, name: &str) -> Option<String>
    {
        match name
        {
            "version" => Some(self.version.version()),
            "gitTag" | "name" => Some(self.git_tag()),
            "notes" => Some(self.notes.clone()),
            "gitHead" => Some(self.git_head.clone()),
            "type" => Some(self.release_type.to_string()),
            _ => None,
        }
    }
}

fn expression_regex() -> &'static Regex
{
    static EXPRESSION: OnceLock<Regex> = OnceLock::new();
    EXPRESSION.get_or_init(|| Regex::new(r"\$\{([^}]*)\}|<%=?([^%]*)%>").expect("expression regex is valid"))
}

/// Interpolates `${nextRelease.x}` and `<%= nextRelease.x %>` placeholders.
pub fn render_template(template: &str, next_release: &NextRelease) -> Result<String>
{
    let mut output = String::with_capacity(template.len());
    let mut last = 0;

    for captures in expression_regex().captures_iter(template)
    {
        let whole = captures.get(0).ok_or_else(|| Error::Template("empty match".to_string()))?;
        let expression = captures.get(1).or_else(|| captures.get(2)).map_or("", |m| m.as_str()).trim();

        let value = expression
            .strip_prefix("nextRelease.")
            .and_then(|field| next_release.field(field))
            .ok_or_else(|| Error::Template(format!("unsupported expression `{}` in template", expression)))?;

        output.push_str(&template[last..whole.start()]);
        output.push_str(&value);
        last = whole.end();
    }
    output.push_str(&template[last..]);

    Ok(output)
}

impl ReleaseConfig
{
    pub fn load<P: AsRef<Path>>(path: P) -> Result<ReleaseConfig>
    {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|error| Error::Config(format!("failed to read {}: {}", path.display(), error)))?;
        let config: ReleaseConfig = serde_json::from_str(&contents)?;
        Ok(config)
    }

    /// The project's own release setup: conventional commits on `main`,
    /// published to GitHub with the linux binary attached.
    pub fn project_default() -> ReleaseConfig
    {
        let rules = vec![
            ReleaseRule { kind: Some("patch".to_string()), scope: None, release: RuleRelease::Bump(ReleaseType::Patch) },
            ReleaseRule { kind: Some("minor".to_string()), scope: None, release: RuleRelease::Bump(ReleaseType::Minor) },
            ReleaseRule { kind: Some("major".to_string()), scope: None, release: RuleRelease::Bump(ReleaseType::Major) },
            ReleaseRule { kind: None, scope: Some("no-release".to_string()), release: RuleRelease::Suppress },
        ];
        let types = ["patch", "minor", "major"]
            .iter()
            .map(|kind| TypeSection { kind: kind.to_string(), section: "Other".to_string() })
            .collect();
        let github = GithubOptions {
            assets: vec![Asset {
                path: "ecs-events-exporter".to_string(),
                label: Some("ecs-events-exporter-linux-${nextRelease.gitTag}".to_string()),
            }],
            release_body_template: Some(
                "<%= nextRelease.notes %> \n\
                 ### Image \n\
                 - [ghcr.io/leigholiver/ecs-events-exporter:<%= nextRelease.version %>](https://ghcr.io/leigholiver/ecs-events-exporter) \n\
                 - `docker pull ghcr.io/leigholiver/ecs-events-exporter:<%= nextRelease.version %>`"
                    .to_string(),
            ),
        };

        ReleaseConfig {
            branches: vec!["main".to_string()],
            preset: "conventionalcommits".to_string(),
            plugins: vec![
                PluginEntry::Configured(COMMIT_ANALYZER.to_string(), serde_json::json!(CommitAnalyzerOptions { release_rules: rules })),
                PluginEntry::Configured(
                    NOTES_GENERATOR.to_string(),
                    serde_json::json!(NotesGeneratorOptions { preset_config: PresetConfig { types } }),
                ),
                PluginEntry::Configured(GITHUB.to_string(), serde_json::json!(github)),
            ],
            verify_conditions: vec![GITHUB.to_string()],
        }
    }

    pub fn plugin_ids(&self) -> Vec<&str>
    {
        self.plugins.iter().map(PluginEntry::id).collect()
    }

    pub fn plugin(&self, id: &str) -> Option<&PluginEntry>
    {
        self.plugins.iter().find(|plugin| plugin.id() == id)
    }

    /// Decodes the options of `id`. A bare entry yields the default options.
    fn options<T: DeserializeOwned + Default>(&self, id: &str) -> Result<T>
    {
        match self.plugin(id).and_then(PluginEntry::options)
        {
            Some(options) => serde_json::from_value(options.clone())
                .map_err(|error| Error::Config(format!("invalid options for {}: {}", id, error))),
            None => Ok(T::default()),
        }
    }

    pub fn commit_analyzer(&self) -> Result<CommitAnalyzerOptions>
    {
        self.options(COMMIT_ANALYZER)
    }

    pub fn notes_generator(&self) -> Result<NotesGeneratorOptions>
    {
        self.options(NOTES_GENERATOR)
    }

    pub fn github(&self) -> Result<GithubOptions>
    {
        self.options(GITHUB)
    }

    /// Checks the configuration and reports every problem found, not just the first.
    pub fn validate(&self) -> Result<()>
    {
        let mut problems = Vec::<String>::new();

        if self.branches.is_empty()
        {
            problems.push("`branches` must name at least one branch".to_string());
        }
        if self.branches.iter().any(|branch| branch.trim().is_empty())
        {
            problems.push("`branches` contains an empty branch name".to_string());
        }
        if self.preset.trim().is_empty()
        {
            problems.push("`preset` must not be empty".to_string());
        }

        // Plugins: known, unique, in execution order.
        let mut seen = HashSet::new();
        let mut last_position = None;
        for id in self.plugin_ids()
        {
            if !seen.insert(id)
            {
                problems.push(format!("plugin `{}` is listed more than once", id));
                continue;
            }
            match PLUGIN_ORDER.iter().position(|known| *known == id)
            {
                None => problems.push(format!("unknown plugin `{}`", id)),
                Some(position) =>
                {
                    if let Some(last) = last_position.filter(|last| position < *last)
                    {
                        problems.push(format!("plugin `{}` must run before `{}`", id, PLUGIN_ORDER[last]));
                    }
                    last_position = Some(last_position.map_or(position, |last: usize| last.max(position)));
                }
            }
        }

        match self.commit_analyzer()
        {
            Ok(options) if self.plugin(COMMIT_ANALYZER).is_some() =>
            {
                for (index, rule) in options.release_rules.iter().enumerate()
                {
                    if rule.kind.as_deref().is_some_and(|kind| kind.trim().is_empty())
                        || rule.scope.as_deref().is_some_and(|scope| scope.trim().is_empty())
                    {
                        problems.push(format!("release rule #{} has an empty condition", index + 1));
                    }
                }
            }
            Ok(_) => {},
            Err(error) => problems.push(error.to_string()),
        }

        match self.notes_generator()
        {
            Ok(options) =>
            {
                for (index, entry) in options.preset_config.types.iter().enumerate()
                {
                    if entry.kind.trim().is_empty() || entry.section.trim().is_empty()
                    {
                        problems.push(format!("presetConfig type #{} needs a non-empty `type` and `section`", index + 1));
                    }
                }
            }
            Err(error) => problems.push(error.to_string()),
        }

        match self.github()
        {
            Ok(options) => self.validate_github(&options, &mut problems),
            Err(error) => problems.push(error.to_string()),
        }

        // Every verified plugin must be configured. With a publisher configured,
        // only the publisher is verified.
        for id in &self.verify_conditions
        {
            if self.plugin(id).is_none()
            {
                problems.push(format!("verifyConditions names `{}`, which is not in `plugins`", id));
            }
        }
        if self.plugin(GITHUB).is_some() && self.verify_conditions != [GITHUB]
        {
            problems.push(format!("verifyConditions must be exactly [`{}`]", GITHUB));
        }

        if problems.is_empty()
        {
            Ok(())
        }
        else
        {
            Err(Error::Validation(problems))
        }
    }

    fn validate_github(&self, options: &GithubOptions, problems: &mut Vec<String>)
    {
        // Render against a placeholder release so unknown expressions surface now.
        let sample = NextRelease {
            version: SemanticVersion::new(),
            release_type: ReleaseType::Patch,
            git_head: String::new(),
            notes: String::new(),
        };

        let mut paths = HashSet::new();
        for asset in &options.assets
        {
            if asset.path.trim().is_empty()
            {
                problems.push("asset with an empty `path`".to_string());
            }
            else if !paths.insert(asset.path.as_str())
            {
                problems.push(format!("asset `{}` is listed more than once", asset.path));
            }
            if let Some(label) = &asset.label
            {
                if let Err(error) = render_template(label, &sample)
                {
                    problems.push(format!("asset `{}` label: {}", asset.path, error));
                }
            }
        }

        if let Some(template) = &options.release_body_template
        {
            if let Err(error) = render_template(template, &sample)
            {
                problems.push(format!("releaseBodyTemplate: {}", error));
            }
        }
    }
}

#[cfg(test)]
fn sample_release() -> NextRelease
{
    NextRelease {
        version: SemanticVersion::parse("1.3.0").unwrap(),
        release_type: ReleaseType::Minor,
        git_head: "deadbeef".to_string(),
        notes: "## 1.3.0 (2026-10-16)".to_string(),
    }
}

#[test]
fn test_checked_in_config_matches_project_default()
{
    let config: ReleaseConfig = serde_json::from_str(include_str!("../../.releaserc.json")).unwrap();
    assert_eq!(config, ReleaseConfig::project_default());
    config.validate().unwrap();
}

#[test]
fn test_project_default_properties()
{
    let config = ReleaseConfig::project_default();

    assert_eq!(config.branches, vec!["main"]);
    assert_eq!(config.preset, "conventionalcommits");
    assert_eq!(config.plugin_ids(), vec![COMMIT_ANALYZER, NOTES_GENERATOR, GITHUB]);

    let rules = config.commit_analyzer().unwrap().release_rules;
    assert_eq!(rules.len(), 4);
    assert_eq!(rules[3].scope.as_deref(), Some("no-release"));
    assert_eq!(rules[3].release, RuleRelease::Suppress);

    let types = config.notes_generator().unwrap().preset_config.types;
    assert!(types.iter().all(|entry| !entry.kind.is_empty() && !entry.section.is_empty()));

    let github = config.github().unwrap();
    let matching: Vec<&Asset> = github.assets.iter().filter(|asset| asset.path == "ecs-events-exporter").collect();
    assert_eq!(matching.len(), 1);
    assert_eq!(matching[0].label.as_deref(), Some("ecs-events-exporter-linux-${nextRelease.gitTag}"));

    // Once in the display link, once in the pull command.
    let body = github.release_body_template.unwrap();
    assert_eq!(body.matches("ghcr.io/leigholiver/ecs-events-exporter:<%= nextRelease.version %>").count(), 2);

    assert_eq!(config.verify_conditions, vec![GITHUB]);
}

#[test]
fn test_bare_and_configured_plugins()
{
    let config: ReleaseConfig = serde_json::from_str(r#"{
        "branches": ["main"],
        "preset": "conventionalcommits",
        "plugins": [
            "@semantic-release/commit-analyzer",
            ["@semantic-release/github", { "assets": [] }]
        ],
        "verifyConditions": ["@semantic-release/github"]
    }"#).unwrap();

    assert!(matches!(config.plugins[0], PluginEntry::Bare(_)));
    assert!(matches!(config.plugins[1], PluginEntry::Configured(_, _)));
    assert_eq!(config.commit_analyzer().unwrap(), CommitAnalyzerOptions::default());
    config.validate().unwrap();
}

#[test]
fn test_release_values_are_restricted()
{
    let parse = |release: &str| serde_json::from_str::<ReleaseRule>(&format!(r#"{{ "type": "fix", "release": {} }}"#, release));

    assert_eq!(parse(r#""patch""#).unwrap().release, RuleRelease::Bump(ReleaseType::Patch));
    assert_eq!(parse(r#""major""#).unwrap().release, RuleRelease::Bump(ReleaseType::Major));
    assert_eq!(parse("false").unwrap().release, RuleRelease::Suppress);
    assert!(parse("true").is_err());
    assert!(parse(r#""huge""#).is_err());
    assert!(parse("1").is_err());
}

#[test]
fn test_rule_matching()
{
    let by_type = ReleaseRule { kind: Some("minor".to_string()), scope: None, release: RuleRelease::Bump(ReleaseType::Minor) };
    assert!(by_type.matches("minor", None));
    assert!(by_type.matches("minor", Some("loki")));
    assert!(!by_type.matches("patch", None));

    let by_scope = ReleaseRule { kind: None, scope: Some("no-release".to_string()), release: RuleRelease::Suppress };
    assert!(by_scope.matches("major", Some("no-release")));
    assert!(!by_scope.matches("major", None));
}

#[test]
fn test_render_template()
{
    let release = sample_release();

    assert_eq!(
        render_template("ecs-events-exporter-linux-${nextRelease.gitTag}", &release).unwrap(),
        "ecs-events-exporter-linux-v1.3.0"
    );
    assert_eq!(
        render_template("<%= nextRelease.notes %>\n`docker pull img:<%= nextRelease.version %>`", &release).unwrap(),
        "## 1.3.0 (2026-10-16)\n`docker pull img:1.3.0`"
    );
    assert_eq!(render_template("no placeholders", &release).unwrap(), "no placeholders");
    assert!(matches!(render_template("${lastRelease.version}", &release), Err(Error::Template(_))));
    assert!(matches!(render_template("<%= nextRelease.bogus %>", &release), Err(Error::Template(_))));
}

#[test]
fn test_project_body_renders()
{
    let github = ReleaseConfig::project_default().github().unwrap();
    let body = render_template(&github.release_body_template.unwrap(), &sample_release()).unwrap();

    assert!(body.starts_with("## 1.3.0 (2026-10-16)"));
    assert!(body.contains("### Image"));
    assert!(body.contains("- `docker pull ghcr.io/leigholiver/ecs-events-exporter:1.3.0`"));
}

#[test]
fn test_validate_reports_every_problem()
{
    let config: ReleaseConfig = serde_json::from_str(r#"{
        "branches": [],
        "preset": "conventionalcommits",
        "plugins": [
            ["@semantic-release/github", { "assets": [{ "path": "bin", "label": "${lastRelease.gitTag}" }, { "path": "bin" }] }],
            ["@semantic-release/release-notes-generator", { "presetConfig": { "types": [{ "type": "feat", "section": "" }] } }],
            "@semantic-release/npm"
        ],
        "verifyConditions": ["@semantic-release/git"]
    }"#).unwrap();

    let Err(Error::Validation(problems)) = config.validate() else { panic!("expected validation failure") };

    let joined = problems.join("\n");
    assert!(joined.contains("`branches` must name at least one branch"), "{}", joined);
    assert!(joined.contains("must run before"), "{}", joined);
    assert!(joined.contains("unknown plugin `@semantic-release/npm`"), "{}", joined);
    assert!(joined.contains("presetConfig type #1"), "{}", joined);
    assert!(joined.contains("asset `bin` is listed more than once"), "{}", joined);
    assert!(joined.contains("asset `bin` label"), "{}", joined);
    assert!(joined.contains("verifyConditions names `@semantic-release/git`"), "{}", joined);
    assert!(joined.contains("verifyConditions must be exactly [`@semantic-release/github`]"), "{}", joined);
}

#[test]
fn test_verify_conditions_names_only_the_publisher()
{
    let config = |verify: &str| -> ReleaseConfig {
        serde_json::from_str(&format!(r#"{{
            "branches": ["main"],
            "preset": "conventionalcommits",
            "plugins": [
                "@semantic-release/commit-analyzer",
                ["@semantic-release/github", {{ "assets": [] }}]
            ],
            "verifyConditions": {}
        }}"#, verify)).unwrap()
    };

    config(r#"["@semantic-release/github"]"#).validate().unwrap();

    for verify in [r#"["@semantic-release/commit-analyzer", "@semantic-release/github"]"#, "[]", r#"["@semantic-release/github", "@semantic-release/github"]"#]
    {
        let Err(Error::Validation(problems)) = config(verify).validate() else { panic!("{} should be rejected", verify) };
        assert_eq!(problems, vec!["verifyConditions must be exactly [`@semantic-release/github`]".to_string()], "{}", verify);
    }
}
