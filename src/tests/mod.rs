//! Cross-module tests.

pub(crate) mod support;
