use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Download error: {0}")]
    Download(#[from] segdl_engine::DownloadError),

    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error("Download incomplete: {failed} unit(s) failed, {cancelled} cancelled")]
    Incomplete { failed: usize, cancelled: usize },
}

pub type Result<T> = std::result::Result<T, AppError>;
