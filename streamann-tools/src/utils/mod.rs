/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */
pub mod cmd_tool_error;
pub use cmd_tool_error::*;

pub mod dataset;
pub use dataset::*;

pub mod ground_truth;
pub use ground_truth::*;

pub mod search_index_utils;
pub use search_index_utils::*;

pub mod serve_index_utils;
pub use serve_index_utils::*;

pub type CMDResult<T> = Result<T, CMDToolError>;

pub mod tracing;
pub use tracing::{init_subscriber, init_test_subscriber};
