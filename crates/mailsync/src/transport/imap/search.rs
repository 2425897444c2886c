//! Filter translation to IMAP SEARCH syntax
//!
//! Scope filters are written in Gmail query syntax. The subset with a direct
//! IMAP equivalent is translated; remaining bare words become `TEXT` terms.

use chrono::{DateTime, Duration, NaiveDate, Utc};

/// Build a full `UID SEARCH` criteria string
///
/// The watermark becomes `SINCE`, which has day granularity; one day of slack
/// absorbs server timezone differences, and re-delivered messages are
/// deduplicated on commit.
pub fn build_search(filter: &str, watermark: Option<DateTime<Utc>>) -> String {
    let mut criteria = translate_filter(filter);
    if let Some(watermark) = watermark {
        let since = (watermark - Duration::days(1)).date_naive();
        criteria.push(format!("SINCE {}", imap_date(since)));
    }

    if criteria.is_empty() {
        "ALL".to_string()
    } else {
        criteria.join(" ")
    }
}

/// Translate a Gmail-style query into IMAP search keys
pub fn translate_filter(filter: &str) -> Vec<String> {
    tokenize(filter)
        .into_iter()
        .filter_map(|token| translate_token(&token))
        .collect()
}

fn translate_token(token: &str) -> Option<String> {
    if let Some((key, value)) = token.split_once(':')
        && !value.is_empty()
    {
        let key = key.to_ascii_lowercase();
        let translated = match key.as_str() {
            "from" => format!("FROM {}", quote(value)),
            "to" => format!("TO {}", quote(value)),
            "cc" => format!("CC {}", quote(value)),
            "bcc" => format!("BCC {}", quote(value)),
            "subject" => format!("SUBJECT {}", quote(value)),
            "after" => format!("SINCE {}", imap_date(parse_query_date(value)?)),
            "before" => format!("BEFORE {}", imap_date(parse_query_date(value)?)),
            "is" => match value.to_ascii_lowercase().as_str() {
                "unread" => "UNSEEN".to_string(),
                "read" => "SEEN".to_string(),
                "starred" => "FLAGGED".to_string(),
                _ => return None,
            },
            _ => format!("TEXT {}", quote(token)),
        };
        return Some(translated);
    }

    if token.is_empty() {
        None
    } else {
        Some(format!("TEXT {}", quote(token)))
    }
}

/// Split on whitespace, keeping double-quoted phrases together
fn tokenize(filter: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in filter.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Gmail accepts `YYYY/MM/DD` and `YYYY-MM-DD`
fn parse_query_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y/%m/%d")
        .or_else(|_| NaiveDate::parse_from_str(value, "%Y-%m-%d"))
        .ok()
}

/// RFC 3501 date: `1-Feb-2024`
fn imap_date(date: NaiveDate) -> String {
    date.format("%-d-%b-%Y").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_empty_filter_is_all() {
        assert_eq!(build_search("", None), "ALL");
        assert_eq!(build_search("   ", None), "ALL");
    }

    #[test]
    fn test_translate_operators() {
        assert_eq!(
            translate_filter("from:legal@firm.com subject:\"quarterly report\" is:unread"),
            vec![
                "FROM \"legal@firm.com\"",
                "SUBJECT \"quarterly report\"",
                "UNSEEN"
            ]
        );
        assert_eq!(
            translate_filter("after:2024/02/01 before:2024-03-15"),
            vec!["SINCE 1-Feb-2024", "BEFORE 15-Mar-2024"]
        );
    }

    #[test]
    fn test_bare_words_become_text() {
        assert_eq!(translate_filter("invoice"), vec!["TEXT \"invoice\""]);
        assert_eq!(
            translate_filter("has:attachment"),
            vec!["TEXT \"has:attachment\""]
        );
    }

    #[test]
    fn test_unknown_is_value_dropped() {
        assert!(translate_filter("is:important").is_empty());
    }

    #[test]
    fn test_watermark_adds_since_with_slack() {
        let watermark = Utc.with_ymd_and_hms(2024, 3, 10, 8, 30, 0).unwrap();
        assert_eq!(
            build_search("from:a@b.com", Some(watermark)),
            "FROM \"a@b.com\" SINCE 9-Mar-2024"
        );
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote(r#"say "hi""#), r#""say \"hi\"""#);
    }
}
