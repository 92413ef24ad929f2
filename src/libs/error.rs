use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error
{
    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("aws error: {0}")]
    Aws(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("error: received response status: {status}\n{body}")]
    Loki
    {
        status: u16,
        body: String,
    },

    #[error("{0}")]
    Emitter(String),

    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("github error: {0}")]
    GitHub(#[from] octocrab::Error),

    #[error("template error: {0}")]
    Template(String),

    #[error("release error: {0}")]
    Release(String),

    #[error("invalid release configuration:\n  - {}", .0.join("\n  - "))]
    Validation(Vec<String>),
}

impl Error
{
    /// Transport failures and server-side statuses are worth another attempt;
    /// anything else will fail the same way again.
    pub fn is_retryable(&self) -> bool
    {
        match self
        {
            Error::Http(_) => true,
            Error::Loki { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl<E> From<aws_sdk_ecs::error::SdkError<E>> for Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(error: aws_sdk_ecs::error::SdkError<E>) -> Self
    {
        Error::Aws(format!("{}", aws_sdk_ecs::error::DisplayErrorContext(&error)))
    }
}

#[test]
fn test_retryable()
{
    assert!(Error::Loki { status: 503, body: String::new() }.is_retryable());
    assert!(Error::Loki { status: 429, body: String::new() }.is_retryable());
    assert!(!Error::Loki { status: 400, body: "bad labels".to_string() }.is_retryable());
    assert!(!Error::Config("nope".to_string()).is_retryable());
}

#[test]
fn test_validation_message_lists_every_problem()
{
    let error = Error::Validation(vec!["first".to_string(), "second".to_string()]);
    assert_eq!(error.to_string(), "invalid release configuration:\n  - first\n  - second");
}
