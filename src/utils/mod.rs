//! The `utils` module provides the pieces shared by every other module:
//! the error taxonomy and logging setup.

pub mod error;
pub mod logging;

pub use error::{CodecError, Error, Result};

#[cfg(test)]
mod tests {
    use super::logging;
    use tracing::Level;

    #[test]
    fn logging_init_accepts_levels() {
        logging::init("info");
        logging::init("debug");
        logging::init("not-a-level");
    }

    #[test]
    fn parse_level_is_case_insensitive() {
        assert_eq!(logging::parse_level("DEBUG"), Some(Level::DEBUG));
        assert_eq!(logging::parse_level("Warning"), Some(Level::WARN));
        assert_eq!(logging::parse_level("critical"), Some(Level::ERROR));
        assert_eq!(logging::parse_level("verbose"), None);
    }
}
