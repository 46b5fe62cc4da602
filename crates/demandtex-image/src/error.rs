//! Image source error types.

use thiserror::Error;

/// Image source errors.
#[derive(Error, Debug)]
pub enum ImageSourceError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Decoder error
    #[error("Decode error: {0}")]
    Decode(#[from] image::ImageError),

    /// The image cannot be served
    #[error("Unsupported image: {0}")]
    UnsupportedFormat(String),

    /// Read before a successful open
    #[error("Image source is not open")]
    NotOpen,

    /// Destination buffer or request does not fit the image
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, ImageSourceError>;
