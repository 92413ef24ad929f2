use std::{cmp::Ordering, fmt::Display};

use super::error::{Error, Result};


/// Size of a semantic version bump. Ordered from the smallest to the largest change.
#[derive(serde::Deserialize, serde::Serialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseType
{
    Patch,
    Minor,
    Major,
}

impl Display for ReleaseType
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        match self
        {
            ReleaseType::Patch => write!(f, "patch"),
            ReleaseType::Minor => write!(f, "minor"),
            ReleaseType::Major => write!(f, "major"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SemanticVersion
{
    pub major: u32,
    pub minor: u32,
    pub patch: u32,

    // Prefix & Suffix
    pub prefix: Option<String>,
    pub suffix: Option<String>,
}

impl SemanticVersion
{
    // Ctor
    pub fn new() -> SemanticVersion
    {
        SemanticVersion { major: 0, minor: 0, patch: 0, prefix: None, suffix: None }
    }

    // Increment
    pub fn increment(&mut self, release_type: ReleaseType) -> Result<()>
    {
        let current = self.to_string();
        let overflow = || Error::Release(format!("cannot apply a {} release to {}: version overflows", release_type, current));
        match release_type
        {
            ReleaseType::Major => { self.major = self.major.checked_add(1).ok_or_else(overflow)?; self.minor = 0; self.patch = 0; },
            ReleaseType::Minor => { self.minor = self.minor.checked_add(1).ok_or_else(overflow)?; self.patch = 0; },
            ReleaseType::Patch => self.patch = self.patch.checked_add(1).ok_or_else(overflow)?,
        }
        // A bumped version is never a pre-release of the old one.
        self.suffix = None;
        Ok(())
    }

    pub fn bumped(&self, release_type: ReleaseType) -> Result<SemanticVersion>
    {
        let mut next = self.clone();
        next.increment(release_type)?;
        Ok(next)
    }

    /// The bare `x.y.z[-suffix]` form, without any prefix.
    pub fn version(&self) -> String
    {
        match &self.suffix
        {
            Some(suffix) => format!("{}.{}.{}-{}", self.major, self.minor, self.patch, suffix),
            None => format!("{}.{}.{}", self.major, self.minor, self.patch),
        }
    }

    /// The tag name used for this version, `v` followed by the bare version.
    pub fn git_tag(&self) -> String
    {
        format!("v{}", self.version())
    }

    // Parse
    //  Accepts `x.y.z`, `vx.y.z`, `prefix-x.y.z` and any of those followed by `-suffix`.
    pub fn parse(version: &str) -> Result<SemanticVersion>
    {
        let invalid = || Error::Release(format!("`{}` is not a semantic version", version));

        let mut parts = version.splitn(3, '-').collect::<Vec<&str>>();
        let prefix = if parts.len() > 1 && !starts_with_digit(parts[0].trim_start_matches('v'))
        {
            Some(parts.remove(0).to_string())
        }
        else
        {
            None
        };

        let numbers: &str = parts.first().copied().ok_or_else(invalid)?;
        let numbers = numbers.strip_prefix('v').unwrap_or(numbers);
        let suffix = parts.get(1..).filter(|rest| !rest.is_empty()).map(|rest| rest.join("-"));

        let version_parts = numbers.split('.').collect::<Vec<&str>>();
        if version_parts.len() != 3
        {
            return Err(invalid());
        }

        let mut fields = [0u32; 3];
        for (field, part) in fields.iter_mut().zip(version_parts.iter())
        {
            *field = part.parse::<u32>().map_err(|_| invalid())?;
        }

        Ok(SemanticVersion { major: fields[0], minor: fields[1], patch: fields[2], prefix, suffix })
    }
}

fn starts_with_digit(text: &str) -> bool
{
    text.chars().next().is_some_and(|c| c.is_ascii_digit())
}

impl Ord for SemanticVersion
{
    fn cmp(&self, other: &Self) -> Ordering
    {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            // A pre-release sorts before its release.
            .then_with(|| match (&self.suffix, &other.suffix)
            {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => a.cmp(b),
            })
            // Keeps the order consistent with `Eq`.
            .then_with(|| self.prefix.cmp(&other.prefix))
    }
}

impl PartialOrd for SemanticVersion
{
    fn partial_cmp(&self, other: &Self) -> Option<Ordering>
    {
        Some(self.cmp(other))
    }
}

impl Display for SemanticVersion
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        // [prefix-]x.x.x[-suffix]
        match &self.prefix
        {
            Some(prefix) => write!(f, "{}-{}", prefix, self.version()),
            None => write!(f, "{}", self.version()),
        }
    }
}

#[test]
fn test_parse()
{
    let version = SemanticVersion::parse("1.2.3").unwrap();
    assert_eq!((version.major, version.minor, version.patch), (1, 2, 3));
    assert_eq!(version.prefix, None);
    assert_eq!(version.suffix, None);

    let version = SemanticVersion::parse("v2.0.10").unwrap();
    assert_eq!((version.major, version.minor, version.patch), (2, 0, 10));
    assert_eq!(version.git_tag(), "v2.0.10");

    let version = SemanticVersion::parse("release-1.4.0-rc.1").unwrap();
    assert_eq!(version.prefix.as_deref(), Some("release"));
    assert_eq!(version.suffix.as_deref(), Some("rc.1"));
    assert_eq!(version.to_string(), "release-1.4.0-rc.1");

    let version = SemanticVersion::parse("1.0.0-beta-2").unwrap();
    assert_eq!(version.prefix, None);
    assert_eq!(version.suffix.as_deref(), Some("beta-2"));
}

#[test]
fn test_parse_rejects_garbage()
{
    assert!(SemanticVersion::parse("latest").is_err());
    assert!(SemanticVersion::parse("1.2").is_err());
    assert!(SemanticVersion::parse("v1.x.3").is_err());
    assert!(SemanticVersion::parse("").is_err());
}

#[test]
fn test_increment_resets_lower_fields()
{
    let version = SemanticVersion::parse("1.4.7-rc.2").unwrap();

    assert_eq!(version.bumped(ReleaseType::Patch).unwrap().version(), "1.4.8");
    assert_eq!(version.bumped(ReleaseType::Minor).unwrap().version(), "1.5.0");
    assert_eq!(version.bumped(ReleaseType::Major).unwrap().version(), "2.0.0");
}

#[test]
fn test_increment_overflow_is_an_error()
{
    let version = SemanticVersion::parse("4294967295.4294967295.4294967295").unwrap();

    for release_type in [ReleaseType::Major, ReleaseType::Minor, ReleaseType::Patch]
    {
        let mut next = version.clone();
        assert!(matches!(next.increment(release_type), Err(Error::Release(_))));
        assert_eq!(next, version);
    }

    let version = SemanticVersion::parse("1.4294967295.0").unwrap();
    assert_eq!(version.bumped(ReleaseType::Major).unwrap().version(), "2.0.0");
}

#[test]
fn test_ordering_agrees_with_equality()
{
    let bare = SemanticVersion::parse("1.2.0").unwrap();
    let prefixed = SemanticVersion::parse("release-1.2.0").unwrap();

    assert_ne!(bare, prefixed);
    assert_ne!(bare.cmp(&prefixed), Ordering::Equal);
    assert_eq!(bare.cmp(&prefixed), prefixed.cmp(&bare).reverse());
    assert_eq!(prefixed.cmp(&prefixed.clone()), Ordering::Equal);

    // The numbers still decide first.
    assert!(SemanticVersion::parse("release-1.1.0").unwrap() < bare);
}

#[test]
fn test_ordering()
{
    let mut versions: Vec<SemanticVersion> = ["1.10.0", "1.2.0", "v1.2.0-rc.1", "0.9.9"]
        .iter()
        .map(|v| SemanticVersion::parse(v).unwrap())
        .collect();
    versions.sort();

    let sorted: Vec<String> = versions.iter().map(|v| v.version()).collect();
    assert_eq!(sorted, vec!["0.9.9", "1.2.0-rc.1", "1.2.0", "1.10.0"]);
    assert!(ReleaseType::Major > ReleaseType::Minor && ReleaseType::Minor > ReleaseType::Patch);
}
