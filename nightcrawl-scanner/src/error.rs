use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Domain blocklisted for this run: {0}")]
    DomainBlocked(String),

    #[error("No usable route for {0}")]
    NoRoute(String),

    #[error("Proxy configuration error: {0}")]
    ProxyConfig(String),

    #[error("Render service failed: {0}")]
    Render(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Task join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    #[error("Other error: {0}")]
    Other(String),
}

impl ScanError {
    /// Connection-level failures (timeout, refused, DNS) that count against a
    /// domain and trigger route rotation.
    pub fn is_transport(&self) -> bool {
        match self {
            ScanError::HttpError(e) => {
                e.is_timeout() || e.is_connect() || (e.is_request() && !e.is_builder())
            }
            ScanError::IoError(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;
