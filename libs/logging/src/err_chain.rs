use core::fmt;
use std::error::Error;

/// Returns a [`fmt::Display`] adapter that prints the error and all its sources.
pub fn err_with_src<'a>(e: &'a (dyn Error + 'static)) -> ErrChain<'a> {
    ErrChain { head: e }
}

pub struct ErrChain<'a> {
    head: &'a (dyn Error + 'static),
}

impl fmt::Display for ErrChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.head)?;

        let mut current = self.head.source();
        while let Some(cause) = current {
            write!(f, ": {cause}")?;
            current = cause.source();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(thiserror::Error, Debug)]
    #[error("connection refused")]
    struct Inner;

    #[derive(thiserror::Error, Debug)]
    #[error("failed to reach broker")]
    struct Outer(#[source] Inner);

    #[test]
    fn prints_error_with_sources() {
        let error = Outer(Inner);

        assert_eq!(
            err_with_src(&error).to_string(),
            "failed to reach broker: connection refused"
        );
    }
}
