/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

use std::fmt;

use streamann::ANNError;

/// Error returned by the command line tools.
///
/// `main` returns it directly, so any failure ends the process with a non-zero status.
pub struct CMDToolError {
    pub details: String,
}

impl fmt::Display for CMDToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.details)
    }
}

impl fmt::Debug for CMDToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.details)
    }
}

impl std::error::Error for CMDToolError {}

impl From<ANNError> for CMDToolError {
    fn from(err: ANNError) -> Self {
        CMDToolError {
            details: format!("{:?}", err),
        }
    }
}

impl From<std::io::Error> for CMDToolError {
    fn from(err: std::io::Error) -> Self {
        CMDToolError {
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CMDToolError {
    fn from(err: serde_json::Error) -> Self {
        CMDToolError {
            details: err.to_string(),
        }
    }
}

impl From<std::num::TryFromIntError> for CMDToolError {
    fn from(err: std::num::TryFromIntError) -> Self {
        CMDToolError {
            details: err.to_string(),
        }
    }
}
