use log::debug;
use std::collections::HashSet;

/// 域名规则集合
///
/// 支持三种写法：
/// * `example.com` - 仅匹配该域名
/// * `*.example.com` - 仅匹配子域名
/// * `+.example.com` - 匹配该域名及其所有子域名
#[derive(Debug, Clone, Default)]
pub struct DomainMatcher {
    exact: HashSet<String>,
    /// 子域名后缀（不含前导点）
    subdomain_suffixes: HashSet<String>,
}

impl DomainMatcher {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut matcher = Self::default();
        for pattern in patterns {
            matcher.insert(pattern.as_ref());
        }
        matcher
    }

    /// 添加一条规则，空规则被忽略
    pub fn insert(&mut self, pattern: &str) {
        let pattern = normalize(pattern);

        if let Some(suffix) = pattern.strip_prefix("*.") {
            if !suffix.is_empty() {
                self.subdomain_suffixes.insert(suffix.to_string());
                debug!("添加子域名规则: *.{}", suffix);
            }
        } else if let Some(suffix) = pattern.strip_prefix("+.") {
            if !suffix.is_empty() {
                self.exact.insert(suffix.to_string());
                self.subdomain_suffixes.insert(suffix.to_string());
                debug!("添加域名及子域名规则: +.{}", suffix);
            }
        } else if !pattern.is_empty() {
            debug!("添加精确域名规则: {}", pattern);
            self.exact.insert(pattern);
        }
    }

    /// 检查域名是否命中（大小写不敏感，忽略末尾的点）
    pub fn matches(&self, domain: &str) -> bool {
        let domain = normalize(domain);
        if domain.is_empty() {
            return false;
        }

        if self.exact.contains(&domain) {
            return true;
        }

        // 逐级剥掉最左侧标签，检查剩余部分是否为子域名后缀
        let mut rest = domain.as_str();
        while let Some(pos) = rest.find('.') {
            rest = &rest[pos + 1..];
            if self.subdomain_suffixes.contains(rest) {
                return true;
            }
        }

        false
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.subdomain_suffixes.len()
    }
}

fn normalize(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_lowercase()
}
