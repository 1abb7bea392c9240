//! # Feed Body Parser
//!
//! A feed is a small delimited table:
//!
//! ```text
//! # MarketPsych Engine Version 2.1 | 2012-05-02 21:19:00 UTC - 2012-05-03 21:19:00 UTC
//! Sector	Buzz	Sentiment
//! 1679	0.00131	-0.2
//! # end
//! ```
//!
//! The `#` preamble is optional and carries the engine version plus the
//! open/close window of the data. The header row is tab delimited when it
//! contains a tab and comma delimited otherwise; its first cell labels the
//! row-key column. A `#` line after the rows ends the table.
//!
//! Bad rows are dropped and counted. A missing or unusable header, or an
//! unreadable preamble, rejects the whole feed.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;

/// Whole-feed failures. Any of these means nothing from the body is published.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FeedError {
    /// No non-blank line in the body.
    #[error("empty feed body")]
    Empty,
    /// The leading `#` line is not a recognisable preamble.
    #[error("malformed preamble {0:?}")]
    MalformedPreamble(String),
    /// The header row is missing or has fewer than two columns.
    #[error("malformed table header {0:?}")]
    MalformedHeader(String),
}

/// Metadata from the feed's first line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedPreamble {
    /// Analytics engine version that produced the table.
    pub engine_version: String,
    /// Start of the window the values cover.
    pub open: DateTime<Utc>,
    /// End of the window the values cover.
    pub close: DateTime<Utc>,
}

/// One data row.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedRow {
    /// Row key, e.g. a sector code or symbol.
    pub key: String,
    /// One value per header column, in header order. NaN marks a blank cell.
    pub values: Vec<f64>,
}

/// A parsed feed body.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFeed {
    /// Preamble, when the body had one.
    pub preamble: Option<FeedPreamble>,
    /// Label of the row-key column.
    pub key_label: String,
    /// Value column names, the row-key label excluded.
    pub columns: Vec<String>,
    /// Rows in body order with unique keys.
    pub rows: Vec<FeedRow>,
    /// Rows dropped for a wrong value count, a bad number or a repeated key.
    pub malformed_rows: usize,
}

impl ParsedFeed {
    /// Looks up a row by key.
    pub fn row(&self, key: &str) -> Option<&FeedRow> {
        self.rows.iter().find(|r| r.key == key)
    }

    /// Close of the data window, from the preamble.
    pub fn close_time(&self) -> Option<DateTime<Utc>> {
        self.preamble.as_ref().map(|p| p.close)
    }

    /// Engine version, from the preamble.
    pub fn engine_version(&self) -> Option<&str> {
        self.preamble.as_ref().map(|p| p.engine_version.as_str())
    }
}

/// # Parse Feed
///
/// Splits `body` into preamble, header and rows. Blank lines are skipped and
/// `\r\n` line endings are accepted.
pub fn parse_feed(body: &str) -> Result<ParsedFeed, FeedError> {
    let mut lines = body
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.trim().is_empty());

    let first = lines.next().ok_or(FeedError::Empty)?;
    let (preamble, header_line) = if first.starts_with('#') {
        let preamble = parse_preamble(first)?;
        let header = lines
            .next()
            .ok_or_else(|| FeedError::MalformedHeader(String::new()))?;
        (Some(preamble), header)
    } else {
        (None, first)
    };

    let delimiter = if header_line.contains('\t') { '\t' } else { ',' };
    let header: Vec<String> = header_line
        .split(delimiter)
        .map(|c| c.trim().to_string())
        .collect();
    if header.len() < 2 || header[1..].iter().any(|c| c.is_empty()) {
        return Err(FeedError::MalformedHeader(header_line.to_string()));
    }
    let key_label = header[0].clone();
    let columns = header[1..].to_vec();

    let mut rows = Vec::new();
    let mut seen = HashSet::new();
    let mut malformed_rows = 0;

    for line in lines {
        if line.starts_with('#') {
            break;
        }
        match parse_row(line, delimiter, columns.len()) {
            Some(row) => {
                if seen.insert(row.key.clone()) {
                    rows.push(row);
                } else {
                    log::warn!("Dropped row with duplicate key {:?}", row.key);
                    malformed_rows += 1;
                }
            }
            None => {
                log::warn!("Dropped malformed row {:?}", line);
                malformed_rows += 1;
            }
        }
    }

    Ok(ParsedFeed {
        preamble,
        key_label,
        columns,
        rows,
        malformed_rows,
    })
}

fn parse_row(line: &str, delimiter: char, width: usize) -> Option<FeedRow> {
    let mut cells = line.split(delimiter).map(str::trim);
    let key = cells.next().filter(|k| !k.is_empty())?;
    let values = cells
        .map(|c| c.parse::<f64>().ok())
        .collect::<Option<Vec<f64>>>()?;
    if values.len() != width {
        return None;
    }
    Some(FeedRow {
        key: key.to_string(),
        values,
    })
}

// # MarketPsych Engine Version x.y | 2012-05-02 21:19:00 UTC - 2012-05-03 21:19:00 UTC
fn parse_preamble(line: &str) -> Result<FeedPreamble, FeedError> {
    let malformed = || FeedError::MalformedPreamble(line.to_string());

    let (_, rest) = line.split_once("Engine Version ").ok_or_else(malformed)?;
    let (version, rest) = rest.split_once(' ').ok_or_else(malformed)?;
    let (_, window) = rest.split_once("| ").ok_or_else(malformed)?;
    let (open, close) = window.split_once(" - ").ok_or_else(malformed)?;

    Ok(FeedPreamble {
        engine_version: version.to_string(),
        open: parse_utc(open).ok_or_else(malformed)?,
        close: parse_utc(close).ok_or_else(malformed)?,
    })
}

fn parse_utc(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim().trim_end_matches("UTC").trim();
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|t| t.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_comma_feed_without_preamble() {
        let feed = parse_feed("RIC,bid,ask\nFX.EUR,1.1000,1.1005\n").unwrap();
        assert!(feed.preamble.is_none());
        assert_eq!(feed.key_label, "RIC");
        assert_eq!(feed.columns, vec!["bid", "ask"]);
        assert_eq!(feed.rows.len(), 1);
        assert_eq!(feed.rows[0].key, "FX.EUR");
        assert_eq!(feed.rows[0].values, vec![1.1, 1.1005]);
        assert_eq!(feed.malformed_rows, 0);
    }

    #[test]
    fn test_tab_feed_with_preamble_and_terminator() {
        let body = "# MarketPsych Engine Version 2.1 | 2012-05-02 21:19:00 UTC - 2012-05-03 21:19:00 UTC\r\n\
                    Sector\tBuzz\tSentiment\r\n\
                    1679\t0.00131\t-0.2\r\n\
                    1680\tNaN\t0.5\r\n\
                    # trailer\r\n\
                    9999\t1\t1\r\n";
        let feed = parse_feed(body).unwrap();
        let preamble = feed.preamble.as_ref().unwrap();
        assert_eq!(preamble.engine_version, "2.1");
        assert_eq!(preamble.open, Utc.with_ymd_and_hms(2012, 5, 2, 21, 19, 0).unwrap());
        assert_eq!(feed.close_time(), Some(Utc.with_ymd_and_hms(2012, 5, 3, 21, 19, 0).unwrap()));
        assert_eq!(feed.columns, vec!["Buzz", "Sentiment"]);
        assert_eq!(feed.rows.len(), 2);
        assert!(feed.row("1680").unwrap().values[0].is_nan());
        assert!(feed.row("9999").is_none());
    }

    #[test]
    fn test_bad_rows_are_dropped_and_counted() {
        let body = "RIC,bid,ask\n\
                    A,1,2\n\
                    B,1\n\
                    C,1,x\n\
                    A,3,4\n\
                    ,5,6\n\
                    D,7,8\n";
        let feed = parse_feed(body).unwrap();
        let keys: Vec<&str> = feed.rows.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["A", "D"]);
        assert_eq!(feed.row("A").unwrap().values, vec![1.0, 2.0]);
        assert_eq!(feed.malformed_rows, 4);
    }

    #[test]
    fn test_whole_feed_rejections() {
        assert_eq!(parse_feed(""), Err(FeedError::Empty));
        assert_eq!(parse_feed("\n \n"), Err(FeedError::Empty));
        assert!(matches!(parse_feed("RIC\nA\n"), Err(FeedError::MalformedHeader(_))));
        assert!(matches!(parse_feed("RIC,,ask\nA,1,2\n"), Err(FeedError::MalformedHeader(_))));
        assert!(matches!(
            parse_feed("# MarketPsych Engine Version 2.1 | yesterday - today\nRIC,a\nA,1\n"),
            Err(FeedError::MalformedPreamble(_))
        ));
        assert!(matches!(
            parse_feed("# MarketPsych Engine Version 2.1 | 2012-05-02 21:19:00 UTC - 2012-05-03 21:19:00 UTC\n"),
            Err(FeedError::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_header_only_feed_has_no_rows() {
        let feed = parse_feed("RIC,bid\n").unwrap();
        assert!(feed.rows.is_empty());
        assert_eq!(feed.malformed_rows, 0);
    }
}
