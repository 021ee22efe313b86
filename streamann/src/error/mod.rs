/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

pub(crate) mod ann_error;
pub use ann_error::{ANNError, ANNErrorKind, ANNResult, ErrorContext};
