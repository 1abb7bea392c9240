//! # Sentiment Feed Format
//!
//! - **`feed`**: turns a response body into a header and rows of values.
//! - **`rounding`**: six-decimal half-up rounding used for every published value.

/// Feed body parser.
pub mod feed;
/// Fixed-point rounding helpers.
pub mod rounding;

pub use feed::{parse_feed, FeedError, FeedPreamble, FeedRow, ParsedFeed};
pub use rounding::{mantissa, round_half_up, PRICE_EXPONENT};
