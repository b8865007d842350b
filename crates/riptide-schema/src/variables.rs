//! Scoped `$name` / `${name}` substitution.
//!
//! Scopes chain outward: a service scope falls back to its app, project and
//! system scopes. `$$` produces a literal `$`. A `$` that is not followed by a
//! name character or `{` is kept as-is.

use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubstitutionError {
    #[error("unresolved variable(s): {}", .0.join(", "))]
    Unresolved(Vec<String>),
    #[error("unterminated '${{' in value")]
    Unterminated,
}

#[derive(Debug, Default)]
pub struct Scope<'p> {
    values: BTreeMap<String, String>,
    parent: Option<&'p Scope<'p>>,
}

impl<'p> Scope<'p> {
    pub fn root() -> Scope<'static> {
        Scope {
            values: BTreeMap::new(),
            parent: None,
        }
    }

    pub fn child(parent: &'p Scope<'p>) -> Self {
        Self {
            values: BTreeMap::new(),
            parent: Some(parent),
        }
    }

    /// Define a value verbatim (built-ins such as `project_name`).
    pub fn define(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    /// Define user-declared variables, substituting each value against what
    /// is already visible. Returns the names that failed together with the
    /// reason; those names stay undefined.
    pub fn declare(
        &mut self,
        declared: &BTreeMap<String, String>,
    ) -> Vec<(String, SubstitutionError)> {
        let mut failures = Vec::new();
        let mut resolved = Vec::with_capacity(declared.len());
        for (name, raw) in declared {
            match self.substitute(raw) {
                Ok(value) => resolved.push((name.clone(), value)),
                Err(e) => failures.push((name.clone(), e)),
            }
        }
        for (name, value) in resolved {
            self.values.insert(name, value);
        }
        failures
    }

    pub fn lookup(&self, name: &str) -> Option<&str> {
        match self.values.get(name) {
            Some(v) => Some(v.as_str()),
            None => self.parent.and_then(|p| p.lookup(name)),
        }
    }

    /// Every visible value, inner scopes shadowing outer ones.
    pub fn flatten(&self) -> BTreeMap<String, String> {
        let mut all = self.parent.map(Scope::flatten).unwrap_or_default();
        all.extend(self.values.iter().map(|(k, v)| (k.clone(), v.clone())));
        all
    }

    pub fn substitute(&self, input: &str) -> Result<String, SubstitutionError> {
        let mut out = String::with_capacity(input.len());
        let mut unresolved = Vec::new();
        let mut chars = input.char_indices().peekable();

        while let Some((_, c)) = chars.next() {
            if c != '$' {
                out.push(c);
                continue;
            }
            match chars.peek().copied() {
                Some((_, '$')) => {
                    chars.next();
                    out.push('$');
                }
                Some((start, '{')) => {
                    chars.next();
                    let rest = &input[start + 1..];
                    let Some(end) = rest.find('}') else {
                        return Err(SubstitutionError::Unterminated);
                    };
                    let name = &rest[..end];
                    for _ in 0..=name.chars().count() {
                        chars.next();
                    }
                    self.push_value(name, &mut out, &mut unresolved);
                }
                Some((start, ch)) if is_name_start(ch) => {
                    let mut end = start;
                    while let Some(&(idx, ch)) = chars.peek() {
                        if is_name_char(ch) {
                            end = idx + ch.len_utf8();
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    self.push_value(&input[start..end], &mut out, &mut unresolved);
                }
                _ => out.push('$'),
            }
        }

        if unresolved.is_empty() {
            Ok(out)
        } else {
            Err(SubstitutionError::Unresolved(unresolved))
        }
    }

    fn push_value(&self, name: &str, out: &mut String, unresolved: &mut Vec<String>) {
        match self.lookup(name) {
            Some(value) => out.push_str(value),
            None => {
                if !unresolved.iter().any(|n| n == name) {
                    unresolved.push(name.to_owned());
                }
            }
        }
    }
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn both_token_forms_resolve() {
        let mut scope = Scope::root();
        scope.define("name", "www");
        assert_eq!(scope.substitute("$name/${name}s").unwrap(), "www/wwws");
    }

    #[test]
    fn nearest_scope_wins() {
        let mut system = Scope::root();
        system.define("level", "system");
        system.define("proxy_url", "riptide.local");
        let mut project = Scope::child(&system);
        project.define("level", "project");
        let service = Scope::child(&project);
        assert_eq!(
            service.substitute("${level}@$proxy_url").unwrap(),
            "project@riptide.local"
        );
    }

    #[test]
    fn unresolved_tokens_are_reported_not_kept() {
        let scope = Scope::root();
        let err = scope.substitute("${FOO}-$BAR-$FOO").unwrap_err();
        assert_eq!(
            err,
            SubstitutionError::Unresolved(vec!["FOO".to_owned(), "BAR".to_owned()])
        );
    }

    #[test]
    fn substitution_errors_are_std_errors() {
        let err: Box<dyn std::error::Error> =
            Box::new(Scope::root().substitute("$A ${B}").unwrap_err());
        assert_eq!(err.to_string(), "unresolved variable(s): A, B");
        assert_eq!(
            SubstitutionError::Unterminated.to_string(),
            "unterminated '${' in value"
        );
    }

    #[test]
    fn dollar_escapes_and_literals() {
        let scope = Scope::root();
        assert_eq!(scope.substitute("cost $$5").unwrap(), "cost $5");
        assert_eq!(scope.substitute("a $ b $").unwrap(), "a $ b $");
        assert_eq!(scope.substitute("$1").unwrap(), "$1");
    }

    #[test]
    fn flatten_lets_inner_scopes_shadow() {
        let mut project = Scope::root();
        project.define("name", "shop");
        project.define("php", "8.2");
        let mut service = Scope::child(&project);
        service.define("name", "www");
        let all = service.flatten();
        assert_eq!(all["name"], "www");
        assert_eq!(all["php"], "8.2");
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn unterminated_brace_is_an_error() {
        let scope = Scope::root();
        assert_eq!(
            scope.substitute("${open").unwrap_err(),
            SubstitutionError::Unterminated
        );
    }

    #[test]
    fn declared_values_see_outer_scopes() {
        let mut project = Scope::root();
        project.define("project_name", "shop");
        let mut service = Scope::child(&project);
        let failures =
            service.declare(&vars(&[("db_name", "${project_name}_db"), ("bad", "$nope")]));
        assert_eq!(service.lookup("db_name"), Some("shop_db"));
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "bad");
        assert!(service.lookup("bad").is_none());
    }

    #[test]
    fn non_ascii_text_passes_through() {
        let mut scope = Scope::root();
        scope.define("x", "ü");
        assert_eq!(scope.substitute("ä$x€").unwrap(), "äü€");
    }
}
