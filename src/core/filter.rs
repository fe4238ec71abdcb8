use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{SyncError, SyncResult};

/// 过滤规则（配置中写作 `{"exclude": "*.tmp"}` 或 `{"include": "logs/*"}`）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterRule {
    Include(String),
    Exclude(String),
}

#[derive(Debug, Clone)]
struct CompiledRule {
    include: bool,
    pattern: String,
    regex: Regex,
}

/// 路径过滤器
///
/// 规则按顺序匹配相对路径，最后一条匹配的规则生效；没有规则匹配时保留。
/// `*` 匹配任意字符（包括 `/`），`?` 匹配单个字符。
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    rules: Vec<CompiledRule>,
}

impl PathFilter {
    pub fn new(rules: &[FilterRule]) -> SyncResult<Self> {
        let rules = rules
            .iter()
            .map(|rule| {
                let (include, pattern) = match rule {
                    FilterRule::Include(p) => (true, p),
                    FilterRule::Exclude(p) => (false, p),
                };
                let regex = Regex::new(&glob_to_regex(pattern))
                    .map_err(|e| SyncError::usage(format!("无效的过滤规则 {}: {}", pattern, e)))?;
                Ok(CompiledRule {
                    include,
                    pattern: pattern.clone(),
                    regex,
                })
            })
            .collect::<SyncResult<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// 路径是否参与同步
    pub fn accepts(&self, location: &str) -> bool {
        let decisive = self
            .rules
            .iter()
            .rev()
            .find(|rule| rule.regex.is_match(location));
        match decisive {
            Some(rule) if !rule.include => {
                debug!("过滤排除: {} (规则 {})", location, rule.pattern);
                false
            }
            _ => true,
        }
    }
}

fn glob_to_regex(pattern: &str) -> String {
    let mut re = String::with_capacity(pattern.len() * 2 + 2);
    re.push('^');
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    re
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_matching_rule_wins() {
        let filter = PathFilter::new(&[
            FilterRule::Exclude("*".to_string()),
            FilterRule::Include("*.txt".to_string()),
        ])
        .unwrap();
        assert!(filter.accepts("a.txt"));
        assert!(filter.accepts("dir/b.txt"));
        assert!(!filter.accepts("c.jpg"));
    }

    #[test]
    fn test_exclude_directory() {
        let filter = PathFilter::new(&[FilterRule::Exclude(".git/*".to_string())]).unwrap();
        assert!(!filter.accepts(".git/config"));
        assert!(!filter.accepts(".git/objects/ab/cd"));
        assert!(filter.accepts("src/.git"));
    }

    #[test]
    fn test_special_characters_are_literal() {
        let filter = PathFilter::new(&[FilterRule::Exclude("a+b(1).txt".to_string())]).unwrap();
        assert!(!filter.accepts("a+b(1).txt"));
        assert!(filter.accepts("aab(1).txt"));

        let filter = PathFilter::new(&[FilterRule::Exclude("file?.log".to_string())]).unwrap();
        assert!(!filter.accepts("file1.log"));
        assert!(filter.accepts("file10.log"));
    }

    #[test]
    fn test_empty_filter_accepts_everything() {
        let filter = PathFilter::default();
        assert!(filter.is_empty());
        assert!(filter.accepts("anything"));
    }

    #[test]
    fn test_rule_serde() {
        let rules: Vec<FilterRule> =
            serde_json::from_str(r#"[{"exclude":"*.tmp"},{"include":"keep.tmp"}]"#).unwrap();
        assert_eq!(
            rules,
            vec![
                FilterRule::Exclude("*.tmp".to_string()),
                FilterRule::Include("keep.tmp".to_string())
            ]
        );
    }
}
