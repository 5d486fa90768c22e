//! Startup fitness checks: a minimal seam C7 consumes. The
//! discovery/registration mechanism for real-world checks (disk space,
//! control-plane reachability, GPU availability, ...) is out of scope here;
//! this module only defines the trait and the runner that executes a list of
//! them in order.

use async_trait::async_trait;

/// A single startup precondition. Implementors may do blocking or async
/// work; `check` is always awaited.
#[async_trait]
pub trait FitnessCheck: Send + Sync {
    fn name(&self) -> &str;
    async fn check(&self) -> Result<(), String>;
}

/// Runs every check in registration order; returns the first failure's
/// `(name, reason)` pair, if any.
pub async fn run_all(checks: &[Box<dyn FitnessCheck>]) -> Result<(), (String, String)> {
    for check in checks {
        if let Err(reason) = check.check().await {
            return Err((check.name().to_string(), reason));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysOk;

    #[async_trait]
    impl FitnessCheck for AlwaysOk {
        fn name(&self) -> &str {
            "always-ok"
        }
        async fn check(&self) -> Result<(), String> {
            Ok(())
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl FitnessCheck for AlwaysFails {
        fn name(&self) -> &str {
            "always-fails"
        }
        async fn check(&self) -> Result<(), String> {
            Err("disk full".to_string())
        }
    }

    #[tokio::test]
    async fn all_checks_passing_is_ok() {
        let checks: Vec<Box<dyn FitnessCheck>> = vec![Box::new(AlwaysOk), Box::new(AlwaysOk)];
        assert!(run_all(&checks).await.is_ok());
    }

    #[tokio::test]
    async fn a_failing_check_short_circuits() {
        let checks: Vec<Box<dyn FitnessCheck>> =
            vec![Box::new(AlwaysOk), Box::new(AlwaysFails), Box::new(AlwaysOk)];
        let err = run_all(&checks).await.unwrap_err();
        assert_eq!(err.0, "always-fails");
        assert_eq!(err.1, "disk full");
    }
}
