//! Crate-wide error type.
//!
//! Every fallible operation returns `Result<_, AppError>`. The error carries the
//! process exit code the `dmi` binary reports, so library callers and the CLI
//! agree on how a failure is classified:
//!
//! - `2`: invalid input, configuration or I/O
//! - `3`: insufficient data (no voxels, no usable measurements)
//! - `4`: numerical failure (non-finite signal, singular system, empty grid)

pub const EXIT_INVALID_INPUT: u8 = 2;
pub const EXIT_INSUFFICIENT_DATA: u8 = 3;
pub const EXIT_NUMERICAL: u8 = 4;

#[derive(Clone, PartialEq, Eq)]
pub struct AppError {
    exit_code: u8,
    message: String,
}

impl AppError {
    pub fn new(exit_code: u8, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: message.into(),
        }
    }

    /// Invalid input, configuration or I/O.
    pub fn input(message: impl Into<String>) -> Self {
        Self::new(EXIT_INVALID_INPUT, message)
    }

    /// Not enough data to proceed.
    pub fn data(message: impl Into<String>) -> Self {
        Self::new(EXIT_INSUFFICIENT_DATA, message)
    }

    /// Numerical failure inside a model or solver.
    pub fn numeric(message: impl Into<String>) -> Self {
        Self::new(EXIT_NUMERICAL, message)
    }

    pub fn exit_code(&self) -> u8 {
        self.exit_code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::fmt::Debug for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppError")
            .field("exit_code", &self.exit_code)
            .field("message", &self.message)
            .finish()
    }
}

impl std::error::Error for AppError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helpers_assign_exit_codes() {
        assert_eq!(AppError::input("x").exit_code(), EXIT_INVALID_INPUT);
        assert_eq!(AppError::data("x").exit_code(), EXIT_INSUFFICIENT_DATA);
        assert_eq!(AppError::numeric("x").exit_code(), EXIT_NUMERICAL);
        assert_eq!(AppError::numeric("bad fit").to_string(), "bad fit");
    }
}
