//! Recipient list import.
//!
//! `.csv` files are scanned cell by cell after sniffing the delimiter; every
//! other extension is read as one candidate address per line. Invalid
//! candidates are dropped and duplicates removed, keeping the first
//! occurrence so the sending order follows the file.

use std::collections::HashSet;
use std::path::Path;

use log::{debug, warn};

use crate::types::*;

/// Delimiters tried, in order, for `.csv` recipient files.
pub const CSV_DELIMITERS: [u8; 3] = [b',', b';', b'\t'];

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Load, validate and deduplicate the addresses in `path`.
pub fn load_recipients(path: impl AsRef<Path>) -> SmtpResult<Vec<EmailAddress>> {
    let path = path.as_ref();
    let text = read_text(path)?;
    let candidates = if is_csv(path) {
        csv_candidates(&text)
    } else {
        line_candidates(&text)
    };
    let recipients = dedupe(candidates);
    debug!(
        "[recipients] loaded {} unique address(es) from {}",
        recipients.len(),
        path.display()
    );
    Ok(recipients)
}

/// Count valid entries in `path` without deduplicating.
///
/// A missing or unreadable file counts as zero.
pub fn count_recipients_in_file(path: impl AsRef<Path>) -> usize {
    let path = path.as_ref();
    if !path.exists() {
        return 0;
    }
    match read_text(path) {
        Ok(text) if is_csv(path) => csv_candidates(&text).len(),
        Ok(text) => line_candidates(&text).len(),
        Err(e) => {
            warn!("[recipients] cannot count {}: {}", path.display(), e);
            0
        }
    }
}

/// Trim, validate and deduplicate an in-memory list of candidates.
pub fn clean_recipient_list<I, S>(candidates: I) -> Vec<EmailAddress>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    dedupe(
        candidates
            .into_iter()
            .filter_map(|c| EmailAddress::parse(c.as_ref().trim()).ok())
            .collect(),
    )
}

/// Read `path` as UTF-8, tolerating a leading byte-order mark.
fn read_text(path: &Path) -> SmtpResult<String> {
    let bytes = std::fs::read(path)
        .map_err(|e| SmtpError::io(format!("Cannot read {}: {}", path.display(), e)))?;
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(&bytes);
    String::from_utf8(bytes.to_vec())
        .map_err(|e| SmtpError::io(format!("{} is not valid UTF-8: {}", path.display(), e)))
}

fn is_csv(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("csv"))
}

fn line_candidates(text: &str) -> Vec<EmailAddress> {
    text.lines()
        .filter_map(|line| EmailAddress::parse(line.trim()).ok())
        .collect()
}

/// Use the first delimiter that parses cleanly and yields at least one
/// valid address.
fn csv_candidates(text: &str) -> Vec<EmailAddress> {
    for delimiter in CSV_DELIMITERS {
        match parse_with_delimiter(text, delimiter) {
            Ok(found) if !found.is_empty() => {
                debug!("[recipients] csv delimiter {:?} matched", delimiter as char);
                return found;
            }
            Ok(_) => {}
            Err(e) => debug!(
                "[recipients] csv delimiter {:?} rejected: {}",
                delimiter as char, e
            ),
        }
    }
    Vec::new()
}

fn parse_with_delimiter(text: &str, delimiter: u8) -> Result<Vec<EmailAddress>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut found = Vec::new();
    for record in reader.records() {
        let record = record?;
        found.extend(
            record
                .iter()
                .filter_map(|cell| EmailAddress::parse(cell.trim()).ok()),
        );
    }
    Ok(found)
}

fn dedupe(addresses: Vec<EmailAddress>) -> Vec<EmailAddress> {
    let mut seen = HashSet::new();
    addresses
        .into_iter()
        .filter(|a| seen.insert(a.clone()))
        .collect()
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(suffix: &str, contents: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        f.write_all(contents).unwrap();
        f.flush().unwrap();
        f
    }

    fn strings(list: &[EmailAddress]) -> Vec<&str> {
        list.iter().map(|a| a.as_str()).collect()
    }

    #[test]
    fn txt_skips_invalid_and_duplicates() {
        let f = write_file(".txt", b"a@x.com\nbad\nb@x.com\na@x.com\n");
        let list = load_recipients(f.path()).unwrap();
        assert_eq!(list.len(), 2);
        let set: HashSet<&str> = strings(&list).into_iter().collect();
        assert_eq!(set, HashSet::from(["a@x.com", "b@x.com"]));
    }

    #[test]
    fn txt_preserves_first_occurrence_order() {
        let f = write_file(".txt", b"c@x.com\na@x.com\nc@x.com\nb@x.com\n");
        let list = load_recipients(f.path()).unwrap();
        assert_eq!(strings(&list), vec!["c@x.com", "a@x.com", "b@x.com"]);
    }

    #[test]
    fn txt_trims_whitespace_and_crlf() {
        let f = write_file(".txt", b"  a@x.com  \r\n\tb@x.com\r\n\r\n");
        let list = load_recipients(f.path()).unwrap();
        assert_eq!(strings(&list), vec!["a@x.com", "b@x.com"]);
    }

    #[test]
    fn csv_semicolon_delimited() {
        let f = write_file(".csv", b"a@x.com;b@x.com");
        let list = load_recipients(f.path()).unwrap();
        assert_eq!(strings(&list), vec!["a@x.com", "b@x.com"]);
    }

    #[test]
    fn csv_comma_delimited() {
        let f = write_file(".csv", b"a@x.com,b@x.com\n");
        let list = load_recipients(f.path()).unwrap();
        assert_eq!(strings(&list), vec!["a@x.com", "b@x.com"]);
    }

    #[test]
    fn csv_tab_delimited() {
        let f = write_file(".csv", b"name\temail\nAnn\ta@x.com\nBob\tb@x.com\n");
        let list = load_recipients(f.path()).unwrap();
        assert_eq!(strings(&list), vec!["a@x.com", "b@x.com"]);
    }

    #[test]
    fn csv_scans_every_cell_and_skips_headers() {
        let f = write_file(
            ".CSV",
            b"name,email,backup\nAnn,a@x.com,ann@home.org\nBob,not-mail,b@x.com\n",
        );
        let list = load_recipients(f.path()).unwrap();
        assert_eq!(
            strings(&list),
            vec!["a@x.com", "ann@home.org", "b@x.com"]
        );
    }

    #[test]
    fn csv_with_bom() {
        let mut bytes = UTF8_BOM.to_vec();
        bytes.extend_from_slice(b"a@x.com,b@x.com\n");
        let f = write_file(".csv", &bytes);
        let list = load_recipients(f.path()).unwrap();
        assert_eq!(strings(&list), vec!["a@x.com", "b@x.com"]);
    }

    #[test]
    fn txt_with_bom() {
        let mut bytes = UTF8_BOM.to_vec();
        bytes.extend_from_slice(b"a@x.com\n");
        let f = write_file(".txt", &bytes);
        assert_eq!(strings(&load_recipients(f.path()).unwrap()), vec!["a@x.com"]);
    }

    #[test]
    fn csv_without_addresses_is_empty() {
        let f = write_file(".csv", b"one,two\nthree;four\n");
        assert!(load_recipients(f.path()).unwrap().is_empty());
    }

    #[test]
    fn missing_file_is_io_failure() {
        let err = load_recipients("/definitely/not/here.txt").unwrap_err();
        assert_eq!(err.kind, SmtpErrorKind::IoFailure);
    }

    #[test]
    fn count_keeps_duplicates() {
        let f = write_file(".txt", b"a@x.com\nbad\nb@x.com\na@x.com\n");
        assert_eq!(count_recipients_in_file(f.path()), 3);
        let f = write_file(".csv", b"a@x.com,a@x.com\n");
        assert_eq!(count_recipients_in_file(f.path()), 2);
        assert_eq!(count_recipients_in_file("/no/such/file.csv"), 0);
    }

    #[test]
    fn clean_list_trims_validates_dedupes() {
        let list = clean_recipient_list([" a@x.com ", "bad", "a@x.com", "b@y.org"]);
        assert_eq!(strings(&list), vec!["a@x.com", "b@y.org"]);
    }
}
