//! The `utils` module collects the pieces shared by every other module:
//! error types and logging setup.

pub mod error;
pub mod logging;

pub use error::{PubSubError, PubSubResult, StoreError, StoreResult};

#[cfg(test)]
mod tests {
    use super::error::{PubSubError, StoreError};
    use super::logging;

    #[test]
    fn logging_init_accepts_levels() {
        logging::init("info");
        logging::init("debug");
        logging::init("bogus");
    }

    #[test]
    fn io_errors_are_connectivity_failures() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer reset");
        let err: PubSubError = io.into();
        assert!(err.is_connectivity());
    }

    #[test]
    fn other_failures_are_not_connectivity() {
        assert!(!PubSubError::Delivery("500".into()).is_connectivity());
        assert!(!PubSubError::Hook("boom".into()).is_connectivity());
        let confirm = PubSubError::Confirmation(StoreError::Unavailable("db down".into()));
        assert!(!confirm.is_connectivity());
        assert_eq!(
            confirm.to_string(),
            "could not confirm delivery: store unavailable: db down"
        );
    }
}
