//! Register-recovery rule sets parsed from STACK CFI records.
//!
//! A rule set binds `.cfa`, `.ra`, and named registers to postfix
//! expressions. The expressions are opaque here: the stack walker
//! evaluates them against the callee frame; this module only keys them
//! and overlays later bindings onto earlier ones.

use std::collections::BTreeMap;

/// The register-recovery rules in effect at one instruction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CfiFrameInfo {
    cfa_rule: Option<String>,
    ra_rule: Option<String>,
    register_rules: BTreeMap<String, String>,
}

impl CfiFrameInfo {
    /// Rule computing the canonical frame address.
    pub fn cfa_rule(&self) -> Option<&str> {
        self.cfa_rule.as_deref()
    }

    /// Rule computing the return address.
    pub fn ra_rule(&self) -> Option<&str> {
        self.ra_rule.as_deref()
    }

    /// Rule for a named general-purpose register, keyed exactly as the
    /// symbol file spells it.
    pub fn register_rule(&self, name: &str) -> Option<&str> {
        self.register_rules.get(name).map(String::as_str)
    }

    /// All named-register rules, in name order.
    pub fn register_rules(&self) -> impl Iterator<Item = (&str, &str)> {
        self.register_rules
            .iter()
            .map(|(name, rule)| (name.as_str(), rule.as_str()))
    }

    fn bind(&mut self, name: &str, expression: String) {
        match name {
            ".cfa" => self.cfa_rule = Some(expression),
            ".ra" => self.ra_rule = Some(expression),
            _ => {
                self.register_rules.insert(name.to_string(), expression);
            }
        }
    }

    /// Parses a `NAME: expression NAME: expression …` rule string into
    /// this set, overwriting any binding the string re-specifies.
    ///
    /// Returns false on malformed input: an expression with no name, a
    /// name with no expression, or an empty string. Bindings committed
    /// before the malformation stay in place.
    pub fn parse_rule_set(&mut self, rules: &str) -> bool {
        let mut name: Option<&str> = None;
        let mut expression = String::new();

        for token in rules.split_ascii_whitespace() {
            if let Some(next_name) = token.strip_suffix(':') {
                if next_name.is_empty() {
                    return false;
                }
                if let Some(prev) = name.take() {
                    if expression.is_empty() {
                        return false;
                    }
                    self.bind(prev, std::mem::take(&mut expression));
                }
                name = Some(next_name);
            } else {
                if name.is_none() {
                    return false;
                }
                if !expression.is_empty() {
                    expression.push(' ');
                }
                expression.push_str(token);
            }
        }

        match name {
            Some(last) if !expression.is_empty() => {
                self.bind(last, expression);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cfa_ra_and_registers() {
        let mut rules = CfiFrameInfo::default();
        assert!(rules.parse_rule_set(".cfa: rsp 8 + .ra: .cfa -8 + ^ rbx: .cfa -16 + ^"));
        assert_eq!(rules.cfa_rule(), Some("rsp 8 +"));
        assert_eq!(rules.ra_rule(), Some(".cfa -8 + ^"));
        assert_eq!(rules.register_rule("rbx"), Some(".cfa -16 + ^"));
        assert_eq!(rules.register_rule("rbp"), None);
    }

    #[test]
    fn later_bindings_overlay_earlier_ones() {
        let mut rules = CfiFrameInfo::default();
        assert!(rules.parse_rule_set(".cfa: rsp 8 + rbx: .cfa -16 + ^"));
        assert!(rules.parse_rule_set("rbx: .cfa -24 + ^"));
        assert_eq!(rules.cfa_rule(), Some("rsp 8 +"));
        assert_eq!(rules.register_rule("rbx"), Some(".cfa -24 + ^"));
        assert_eq!(rules.register_rules().count(), 1);
    }

    #[test]
    fn dollar_prefixed_names_are_kept_verbatim() {
        let mut rules = CfiFrameInfo::default();
        assert!(rules.parse_rule_set(".cfa: $esp 4 + $ebp: .cfa 8 - ^"));
        assert_eq!(rules.register_rule("$ebp"), Some(".cfa 8 - ^"));
    }

    #[test]
    fn rejects_malformed_rule_strings() {
        let mut rules = CfiFrameInfo::default();
        // Expression before any name.
        assert!(!rules.parse_rule_set("rsp 8 + .cfa:"));
        // Name with no expression.
        assert!(!CfiFrameInfo::default().parse_rule_set(".cfa: rsp 8 + .ra:"));
        // Back-to-back names.
        assert!(!CfiFrameInfo::default().parse_rule_set(".cfa: .ra: rsp"));
        // Bare colon.
        assert!(!CfiFrameInfo::default().parse_rule_set(": rsp 8 +"));
        // Nothing at all.
        assert!(!CfiFrameInfo::default().parse_rule_set(""));
    }
}
