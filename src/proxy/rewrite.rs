use parking_lot::RwLock;
use tracing::warn;

/// The synthesized rule that strips a route's path from the front of the
/// request path.
pub fn prefix_strip_rule(route_path: &str) -> String {
    format!("^{route_path}(.*)$:$1")
}

/// Ordered `pattern:replacement` path rewrites shared by every request on a
/// route. The synthesized prefix-strip rule is appended at most once for
/// the lifetime of the route, however many requests race on it.
#[derive(Debug)]
pub struct RewriteEngine {
    rules: RwLock<Vec<String>>,
}

impl RewriteEngine {
    pub fn new(rules: Vec<String>) -> Self {
        Self {
            rules: RwLock::new(rules),
        }
    }

    /// Append the prefix-strip rule unless it is already present.
    pub fn ensure_prefix_rule(&self, route_path: &str) {
        let rule = prefix_strip_rule(route_path);
        let mut rules = self.rules.write();
        if !rules.contains(&rule) {
            rules.push(rule);
        }
    }

    pub fn rules(&self) -> Vec<String> {
        self.rules.read().clone()
    }

    /// Apply every rule in order: a rule whose pattern matches the current
    /// path substitutes its replacement, and the remaining rules see the
    /// substituted string. Unparseable rules are skipped.
    pub fn apply(rules: &[String], path: &str) -> String {
        let mut current = path.to_string();

        for rule in rules {
            let Some((pattern, replacement)) = split_rule(rule) else {
                warn!(rule = %rule, "rewrite rule has no replacement separator");
                continue;
            };

            let re = match regex::Regex::new(pattern) {
                Ok(re) => re,
                Err(err) => {
                    warn!(rule = %rule, error = %err, "invalid rewrite pattern");
                    continue;
                }
            };

            if re.is_match(&current) {
                current = re.replace_all(&current, replacement).into_owned();
            }
        }

        current
    }
}

/// Split on the last colon so patterns may contain `:` themselves.
fn split_rule(rule: &str) -> Option<(&str, &str)> {
    let idx = rule.rfind(':')?;
    Some((&rule[..idx], &rule[idx + 1..]))
}
