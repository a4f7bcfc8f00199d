/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - AIRTAP Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use url::Url;

/// Extracts the discovery code from `<scheme>://discover?code=<code>`.
/// Anything else yields `None`.
pub fn parse_discover_link(link: &str, scheme: &str) -> Option<String> {
    let url = Url::parse(link.trim()).ok()?;
    if !url.scheme().eq_ignore_ascii_case(scheme) {
        return None;
    }
    if url.host_str() != Some("discover") {
        return None;
    }
    url.query_pairs()
        .find(|(k, _)| k == "code")
        .map(|(_, v)| v.trim().to_string())
        .filter(|code| !code.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_discover_links() {
        assert_eq!(
            parse_discover_link("airtap://discover?code=AB12", "airtap"),
            Some("AB12".to_string())
        );
        assert_eq!(
            parse_discover_link(" airtap://discover?x=1&code=a%20b ", "airtap"),
            Some("a b".to_string())
        );
    }

    #[test]
    fn rejects_everything_else() {
        assert_eq!(parse_discover_link("airtap://discover", "airtap"), None);
        assert_eq!(parse_discover_link("airtap://discover?code=", "airtap"), None);
        assert_eq!(parse_discover_link("airtap://invite?code=AB12", "airtap"), None);
        assert_eq!(parse_discover_link("https://discover?code=AB12", "airtap"), None);
        assert_eq!(parse_discover_link("not a link", "airtap"), None);
    }
}
