//! Text helpers shared by both normalizers

use log::debug;
use mailparse::MailAddr;

use crate::models::EmailAddress;

/// Wrap width for markup-to-text conversion
const TEXT_WIDTH: usize = 100;

/// Plain-text projection of an HTML body
pub fn html_to_text(html: &str) -> String {
    match html2text::from_read(html.as_bytes(), TEXT_WIDTH) {
        Ok(text) => text.trim().to_string(),
        Err(e) => {
            debug!("html2text failed, stripping tags instead: {}", e);
            strip_tags(html)
        }
    }
}

/// Crude tag stripper for markup html2text refuses
fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                out.push(' ');
            }
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    decode_html_entities(&out.split_whitespace().collect::<Vec<_>>().join(" "))
}

/// Decode HTML entities in snippet text
pub fn decode_html_entities(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

/// Parse an address header into individual addresses
///
/// Group syntax is flattened. Values mailparse rejects are split on commas.
pub fn parse_address_list(value: &str) -> Vec<EmailAddress> {
    if value.trim().is_empty() {
        return Vec::new();
    }

    match mailparse::addrparse(value) {
        Ok(list) => list
            .iter()
            .flat_map(|addr| match addr {
                MailAddr::Single(info) => vec![to_address(info)],
                MailAddr::Group(group) => group.addrs.iter().map(to_address).collect(),
            })
            .collect(),
        Err(_) => value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(EmailAddress::parse)
            .collect(),
    }
}

fn to_address(info: &mailparse::SingleInfo) -> EmailAddress {
    match info.display_name.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => EmailAddress::with_name(name, info.addr.trim()),
        _ => EmailAddress::new(info.addr.trim()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_html_entities() {
        assert_eq!(decode_html_entities("Tom &amp; Jerry"), "Tom & Jerry");
        assert_eq!(decode_html_entities("&lt;tag&gt;"), "<tag>");
        assert_eq!(decode_html_entities("&quot;quoted&quot;"), "\"quoted\"");
        assert_eq!(decode_html_entities("it&#39;s"), "it's");
        assert_eq!(decode_html_entities("&amp;lt;"), "&lt;");
    }

    #[test]
    fn test_html_to_text() {
        let text = html_to_text("<html><body><p>Hello <b>world</b></p></body></html>");
        assert!(text.contains("Hello"));
        assert!(text.contains("world"));
        assert!(!text.contains("<p>"));
    }

    #[test]
    fn test_strip_tags() {
        assert_eq!(strip_tags("<p>a &amp; b</p><br>c"), "a & b c");
    }

    #[test]
    fn test_parse_address_list() {
        let addrs = parse_address_list(r#""Doe, Jane" <jane@example.com>, bob@example.com"#);
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[0].name.as_deref(), Some("Doe, Jane"));
        assert_eq!(addrs[0].email, "jane@example.com");
        assert_eq!(addrs[1], EmailAddress::new("bob@example.com"));
    }

    #[test]
    fn test_parse_group_and_empty() {
        let addrs = parse_address_list("team: a@example.com, b@example.com;");
        assert_eq!(addrs.len(), 2);
        assert!(parse_address_list("  ").is_empty());
    }
}
