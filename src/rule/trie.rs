//! 域名前缀树
//!
//! 以标签逆序建树（`www.example.com` 存为 `com -> example -> www`）。
//! 插入时支持两种通配：
//! - `+.example.com` 匹配 `example.com` 本身及其任意层级子域名
//! - `*.example.com` 只匹配恰好一级子域名

use std::collections::HashMap;

const DOT_WILDCARD: &str = "+";
const WILDCARD: &str = "*";

#[derive(Debug)]
struct Node<T> {
    children: HashMap<String, Node<T>>,
    data: Option<T>,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self {
            children: HashMap::new(),
            data: None,
        }
    }
}

#[derive(Debug)]
pub struct DomainTrie<T> {
    root: Node<T>,
    len: usize,
}

impl<T> Default for DomainTrie<T> {
    fn default() -> Self {
        Self {
            root: Node::default(),
            len: 0,
        }
    }
}

fn labels(domain: &str) -> Option<Vec<String>> {
    let domain = domain.trim().trim_end_matches('.');
    if domain.is_empty() {
        return None;
    }
    let labels: Vec<String> = domain.split('.').rev().map(|l| l.to_ascii_lowercase()).collect();
    if labels.iter().any(|l| l.is_empty()) {
        return None;
    }
    Some(labels)
}

impl<T> DomainTrie<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入一条模式，同一模式重复插入时保留先插入的数据。模式非法时返回 false
    pub fn insert(&mut self, pattern: &str, data: T) -> bool {
        let Some(labels) = labels(pattern) else {
            return false;
        };
        // 通配符只能出现在最左侧
        if labels[..labels.len() - 1]
            .iter()
            .any(|l| l == DOT_WILDCARD || l == WILDCARD)
        {
            return false;
        }
        let mut node = &mut self.root;
        for label in labels {
            node = node.children.entry(label).or_default();
        }
        if node.data.is_none() {
            node.data = Some(data);
            self.len += 1;
        }
        true
    }

    /// 查找最具体的匹配：精确匹配优先，其次是层级更深的通配
    pub fn search(&self, domain: &str) -> Option<&T> {
        let labels = labels(domain)?;
        let mut node = &self.root;
        let mut best = None;
        for (i, label) in labels.iter().enumerate() {
            if let Some(data) = node.children.get(DOT_WILDCARD).and_then(|n| n.data.as_ref()) {
                best = Some(data);
            }
            if i + 1 == labels.len() {
                if let Some(data) = node.children.get(label).and_then(|n| n.data.as_ref()) {
                    return Some(data);
                }
                if let Some(data) = node.children.get(WILDCARD).and_then(|n| n.data.as_ref()) {
                    return Some(data);
                }
            }
            match node.children.get(label) {
                Some(next) => node = next,
                None => return best,
            }
        }
        node.children
            .get(DOT_WILDCARD)
            .and_then(|n| n.data.as_ref())
            .or(best)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact() {
        let mut t = DomainTrie::new();
        assert!(t.insert("www.example.com", 1));
        assert_eq!(t.search("www.example.com"), Some(&1));
        assert_eq!(t.search("WWW.Example.COM."), Some(&1));
        assert_eq!(t.search("example.com"), None);
        assert_eq!(t.search("a.www.example.com"), None);
    }

    #[test]
    fn test_dot_wildcard() {
        let mut t = DomainTrie::new();
        t.insert("+.example.com", 1);
        assert_eq!(t.search("example.com"), Some(&1));
        assert_eq!(t.search("www.example.com"), Some(&1));
        assert_eq!(t.search("a.b.c.example.com"), Some(&1));
        assert_eq!(t.search("badexample.com"), None);
        assert_eq!(t.search("com"), None);
    }

    #[test]
    fn test_wildcard() {
        let mut t = DomainTrie::new();
        t.insert("*.example.com", 1);
        assert_eq!(t.search("www.example.com"), Some(&1));
        assert_eq!(t.search("example.com"), None);
        assert_eq!(t.search("a.b.example.com"), None);
    }

    #[test]
    fn test_most_specific_wins() {
        let mut t = DomainTrie::new();
        t.insert("+.example.com", 1);
        t.insert("+.api.example.com", 2);
        t.insert("login.api.example.com", 3);
        assert_eq!(t.search("www.example.com"), Some(&1));
        assert_eq!(t.search("v1.api.example.com"), Some(&2));
        assert_eq!(t.search("login.api.example.com"), Some(&3));
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn test_invalid_patterns() {
        let mut t: DomainTrie<u8> = DomainTrie::new();
        assert!(!t.insert("", 1));
        assert!(!t.insert("a..com", 1));
        assert!(!t.insert("a.*.com", 1));
        assert!(t.is_empty());
    }
}
