//! Traefik router-rule normalisation.
//!
//! Rules arriving from the metadata store and from live service labels can
//! differ in whitespace, quoting style, and keyword case while meaning the
//! same thing. Everything is folded into one canonical textual form before
//! comparison so representation noise never looks like drift. Sub-rule
//! order inside a union is preserved as given.

use std::sync::OnceLock;

use regex::Regex;

/// Prefix of Traefik router label keys.
const ROUTER_LABEL_PREFIX: &str = "traefik.http.routers.";

fn host_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)^host\s*\(\s*["'`]([^"'`]*)["'`]\s*\)$"#).expect("static regex")
    })
}

/// Whether a label key carries a router rule.
pub fn is_rule_key(key: &str) -> bool {
    key.starts_with(ROUTER_LABEL_PREFIX) && key.ends_with(".rule")
}

/// The canonical rule matching a single host.
pub fn rule_for_host(host: &str) -> String {
    format!("Host(`{host}`)")
}

/// The canonical router label key for an application's router.
pub fn rule_key_for(app_name: &str) -> String {
    format!("{ROUTER_LABEL_PREFIX}{app_name}.rule")
}

/// Normalises a rule to canonical form.
///
/// Each `||` branch is trimmed; `Host` predicates are rewritten with the
/// keyword capitalised and the operand backtick-quoted. Branches that are
/// not plain host matches keep their text with runs of whitespace collapsed
/// to single spaces. Branch order is preserved.
pub fn normalize(rule: &str) -> String {
    rule.split("||")
        .map(|part| {
            let part = part.trim();
            match host_re().captures(part) {
                Some(caps) => rule_for_host(&caps[1]),
                None => part.split_whitespace().collect::<Vec<_>>().join(" "),
            }
        })
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" || ")
}

/// Extracts the first host operand from a rule, if any.
pub fn host_of(rule: &str) -> Option<String> {
    rule.split("||")
        .filter_map(|part| host_re().captures(part.trim()))
        .map(|caps| caps[1].to_string())
        .next()
}
