//! # Markets Module
//!
//! Feed formats understood by the provider. Each submodule owns one
//! upstream vendor's wire format and the numeric conventions that go with it.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Tab or comma delimited sentiment tables.
pub mod psych;
