// Error types for tailproxy

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid log level: {0} (expected 0, 1 or 2)")]
    InvalidLogLevel(i64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::InvalidLogLevel(7).to_string(),
            "Invalid log level: 7 (expected 0, 1 or 2)"
        );
        assert_eq!(
            Error::Config("missing socket_path".to_string()).to_string(),
            "Configuration error: missing socket_path"
        );

        let toml_err = toml::from_str::<toml::Value>("= 1").unwrap_err();
        assert!(matches!(Error::from(toml_err), Error::Toml(_)));
    }
}
