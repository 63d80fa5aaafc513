use thiserror::Error;

/// Which gateway operation a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind {
    List,
    Content,
    Images,
}

impl std::fmt::Display for FetchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FetchKind::List => "list",
            FetchKind::Content => "content",
            FetchKind::Images => "images",
        };
        f.write_str(name)
    }
}

/// A failed request to the remote API.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Request failed: {status} ({url})")]
    Status { status: u16, url: String },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Invalid request URL: {0}")]
    Url(String),

    #[error("Gateway unavailable: {0}")]
    Unavailable(String),
}

impl FetchError {
    /// HTTP status of the failed response, if the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Status { status, .. } => Some(*status),
            FetchError::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}
