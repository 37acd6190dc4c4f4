//! 各类规则的匹配器

use super::geoip::CountryLookup;
use super::trie::DomainTrie;
use super::RuleMode;
use crate::dns::Resolver;
use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

/// 规则类型，声明顺序即匹配顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleType {
    Domain,
    DomainKeyword,
    DomainSuffix,
    GeoIp,
    IpCidr,
    Others,
}

impl RuleType {
    pub const ALL: [RuleType; 6] = [
        RuleType::Domain,
        RuleType::DomainKeyword,
        RuleType::DomainSuffix,
        RuleType::GeoIp,
        RuleType::IpCidr,
        RuleType::Others,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::Domain => "DOMAIN",
            RuleType::DomainKeyword => "DOMAIN-KEYWORD",
            RuleType::DomainSuffix => "DOMAIN-SUFFIX",
            RuleType::GeoIp => "GEOIP",
            RuleType::IpCidr => "IP-CIDR",
            RuleType::Others => "OTHERS",
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleType {
    type Err = super::RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('_', "-").as_str() {
            "DOMAIN" => Ok(RuleType::Domain),
            "DOMAIN-KEYWORD" => Ok(RuleType::DomainKeyword),
            "DOMAIN-SUFFIX" => Ok(RuleType::DomainSuffix),
            "GEOIP" => Ok(RuleType::GeoIp),
            "IP-CIDR" | "IPCIDR" => Ok(RuleType::IpCidr),
            "OTHERS" => Ok(RuleType::Others),
            _ => Err(super::RuleError::InvalidRule(format!("unknown rule type {}", s))),
        }
    }
}

/// 一条规则
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleItem {
    pub mode: RuleMode,
    pub kind: RuleType,
    /// 代理名，`global` / `direct` 为特殊值
    pub proxy: String,
    pub values: Vec<String>,
    /// 目标为域名时先解析再匹配（GEOIP / IP-CIDR）
    pub resolve: bool,
    pub accept: bool,
}

impl RuleItem {
    pub fn new(kind: RuleType, proxy: &str, values: Vec<String>) -> Self {
        Self {
            mode: RuleMode::Match,
            kind,
            proxy: proxy.to_string(),
            values,
            resolve: false,
            accept: true,
        }
    }

    pub fn with_resolve(mut self, resolve: bool) -> Self {
        self.resolve = resolve;
        self
    }

    pub fn with_accept(mut self, accept: bool) -> Self {
        self.accept = accept;
        self
    }
}

/// 匹配时的上下文：目标为域名时按需解析一次
pub struct MatchContext<'a> {
    target: &'a str,
    resolver: Option<&'a Arc<Resolver>>,
    resolved: Option<Option<IpAddr>>,
}

impl<'a> MatchContext<'a> {
    pub fn new(target: &'a str, resolver: Option<&'a Arc<Resolver>>) -> Self {
        Self {
            target,
            resolver,
            resolved: None,
        }
    }

    pub fn target(&self) -> &str {
        self.target
    }

    fn literal_ip(&self) -> Option<IpAddr> {
        self.target
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .ok()
    }

    async fn ip(&mut self, resolve: bool) -> Option<IpAddr> {
        if let Some(ip) = self.literal_ip() {
            return Some(ip);
        }
        if !resolve {
            return None;
        }
        if let Some(ip) = self.resolved {
            return ip;
        }
        let ip = match self.resolver {
            Some(resolver) => resolver.lookup_host(self.target).await,
            None => None,
        };
        self.resolved = Some(ip);
        ip
    }
}

/// 同一类型的规则集合
pub enum Matcher {
    Domain { rules: Vec<RuleItem>, trie: DomainTrie<usize> },
    DomainSuffix { rules: Vec<RuleItem>, trie: DomainTrie<usize> },
    DomainKeyword(Vec<RuleItem>),
    GeoIp { rules: Vec<RuleItem>, db: Option<Arc<dyn CountryLookup>> },
    IpCidr(Vec<(RuleItem, Vec<IpNet>)>),
    Others(Option<RuleItem>),
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Matcher({}, {} rules)", self.kind(), self.len())
    }
}

fn build_trie(rules: &[RuleItem], prefix: &str) -> DomainTrie<usize> {
    let mut trie = DomainTrie::new();
    for (i, rule) in rules.iter().enumerate() {
        for value in &rule.values {
            let pattern = format!("{}{}", prefix, value.trim_start_matches('.'));
            if !trie.insert(&pattern, i) {
                warn!("ignore invalid {} rule value {:?}", rule.kind, value);
            }
        }
    }
    trie
}

impl Matcher {
    pub fn new(kind: RuleType, rules: Vec<RuleItem>, geoip: Option<Arc<dyn CountryLookup>>) -> Result<Self, super::RuleError> {
        Ok(match kind {
            RuleType::Domain => {
                let trie = build_trie(&rules, "");
                Matcher::Domain { rules, trie }
            }
            RuleType::DomainSuffix => {
                let trie = build_trie(&rules, "+.");
                Matcher::DomainSuffix { rules, trie }
            }
            RuleType::DomainKeyword => Matcher::DomainKeyword(
                rules
                    .into_iter()
                    .map(|mut r| {
                        r.values = r.values.iter().map(|v| v.to_ascii_lowercase()).collect();
                        r
                    })
                    .collect(),
            ),
            RuleType::GeoIp => Matcher::GeoIp {
                rules: rules
                    .into_iter()
                    .map(|mut r| {
                        r.values = r.values.iter().map(|v| v.to_ascii_uppercase()).collect();
                        r
                    })
                    .collect(),
                db: geoip,
            },
            RuleType::IpCidr => {
                let mut parsed = Vec::with_capacity(rules.len());
                for rule in rules {
                    let nets = rule
                        .values
                        .iter()
                        .map(|v| parse_cidr(v))
                        .collect::<Result<Vec<_>, _>>()?;
                    parsed.push((rule, nets));
                }
                Matcher::IpCidr(parsed)
            }
            RuleType::Others => Matcher::Others(rules.into_iter().next()),
        })
    }

    pub fn kind(&self) -> RuleType {
        match self {
            Matcher::Domain { .. } => RuleType::Domain,
            Matcher::DomainSuffix { .. } => RuleType::DomainSuffix,
            Matcher::DomainKeyword(_) => RuleType::DomainKeyword,
            Matcher::GeoIp { .. } => RuleType::GeoIp,
            Matcher::IpCidr(_) => RuleType::IpCidr,
            Matcher::Others(_) => RuleType::Others,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Matcher::Domain { rules, .. } | Matcher::DomainSuffix { rules, .. } | Matcher::GeoIp { rules, .. } => {
                rules.len()
            }
            Matcher::DomainKeyword(rules) => rules.len(),
            Matcher::IpCidr(rules) => rules.len(),
            Matcher::Others(rule) => rule.iter().count(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 返回命中的规则
    pub async fn matches(&self, ctx: &mut MatchContext<'_>) -> Option<&RuleItem> {
        match self {
            Matcher::Domain { rules, trie } | Matcher::DomainSuffix { rules, trie } => {
                if ctx.target().is_empty() {
                    return None;
                }
                trie.search(ctx.target()).and_then(|&i| rules.get(i))
            }
            Matcher::DomainKeyword(rules) => {
                let target = ctx.target().to_ascii_lowercase();
                if target.is_empty() {
                    return None;
                }
                rules
                    .iter()
                    .find(|r| r.values.iter().any(|kw| !kw.is_empty() && target.contains(kw.as_str())))
            }
            Matcher::GeoIp { rules, db } => {
                let db = db.as_ref()?;
                for rule in rules {
                    let Some(ip) = ctx.ip(rule.resolve).await else {
                        continue;
                    };
                    let Some(country) = db.country(ip) else {
                        continue;
                    };
                    if rule.values.iter().any(|c| *c == country) {
                        return Some(rule);
                    }
                }
                None
            }
            Matcher::IpCidr(rules) => {
                for (rule, nets) in rules {
                    let Some(ip) = ctx.ip(rule.resolve).await else {
                        continue;
                    };
                    if nets.iter().any(|net| net.contains(&ip)) {
                        return Some(rule);
                    }
                }
                None
            }
            Matcher::Others(rule) => rule.as_ref().filter(|r| !r.proxy.is_empty()),
        }
    }
}

/// 解析 CIDR，允许省略前缀长度表示单个地址
pub fn parse_cidr(value: &str) -> Result<IpNet, super::RuleError> {
    let value = value.trim();
    if let Ok(net) = value.parse::<IpNet>() {
        return Ok(net.trunc());
    }
    let invalid = || super::RuleError::InvalidRule(format!("invalid cidr {}", value));
    let ip = value.parse::<IpAddr>().map_err(|_| invalid())?;
    let prefix = if ip.is_ipv4() { 32 } else { 128 };
    IpNet::new(ip, prefix).map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::Hosts;

    struct StaticGeo;

    impl CountryLookup for StaticGeo {
        fn country(&self, ip: IpAddr) -> Option<String> {
            match ip.to_string().as_str() {
                "1.0.1.1" => Some("CN".into()),
                "8.8.8.8" => Some("US".into()),
                _ => None,
            }
        }
    }

    fn values(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    async fn hit(m: &Matcher, target: &str) -> Option<String> {
        let mut ctx = MatchContext::new(target, None);
        m.matches(&mut ctx).await.map(|r| r.proxy.clone())
    }

    #[test]
    fn test_rule_type_names() {
        for kind in RuleType::ALL {
            assert_eq!(kind.as_str().parse::<RuleType>().unwrap(), kind);
        }
        assert_eq!("domain_suffix".parse::<RuleType>().unwrap(), RuleType::DomainSuffix);
        assert!("URL-REGEX".parse::<RuleType>().is_err());
    }

    #[tokio::test]
    async fn test_domain_and_suffix() {
        let exact = Matcher::new(
            RuleType::Domain,
            vec![RuleItem::new(RuleType::Domain, "A", values(&["www.google.com"]))],
            None,
        )
        .unwrap();
        assert_eq!(hit(&exact, "www.google.com").await.as_deref(), Some("A"));
        assert_eq!(hit(&exact, "mail.google.com").await, None);

        let suffix = Matcher::new(
            RuleType::DomainSuffix,
            vec![
                RuleItem::new(RuleType::DomainSuffix, "A", values(&["foo.test"])),
                RuleItem::new(RuleType::DomainSuffix, "B", values(&[".bar.test"])),
            ],
            None,
        )
        .unwrap();
        assert_eq!(hit(&suffix, "foo.test").await.as_deref(), Some("A"));
        assert_eq!(hit(&suffix, "www.foo.test").await.as_deref(), Some("A"));
        assert_eq!(hit(&suffix, "x.y.bar.test").await.as_deref(), Some("B"));
        assert_eq!(hit(&suffix, "notfoo.test").await, None);
        assert_eq!(hit(&suffix, "").await, None);
    }

    #[tokio::test]
    async fn test_keyword() {
        let m = Matcher::new(
            RuleType::DomainKeyword,
            vec![RuleItem::new(RuleType::DomainKeyword, "K", values(&["Google"]))],
            None,
        )
        .unwrap();
        assert_eq!(hit(&m, "www.google.com.hk").await.as_deref(), Some("K"));
        assert_eq!(hit(&m, "bing.com").await, None);
    }

    #[tokio::test]
    async fn test_geoip() {
        let db: Arc<dyn CountryLookup> = Arc::new(StaticGeo);
        let m = Matcher::new(
            RuleType::GeoIp,
            vec![RuleItem::new(RuleType::GeoIp, "direct", values(&["cn"]))],
            Some(db),
        )
        .unwrap();
        assert_eq!(hit(&m, "1.0.1.1").await.as_deref(), Some("direct"));
        assert_eq!(hit(&m, "8.8.8.8").await, None);
        assert_eq!(hit(&m, "example.cn").await, None);

        let no_db = Matcher::new(RuleType::GeoIp, vec![RuleItem::new(RuleType::GeoIp, "direct", values(&["CN"]))], None).unwrap();
        assert_eq!(hit(&no_db, "1.0.1.1").await, None);
    }

    #[tokio::test]
    async fn test_ip_cidr_with_resolve() {
        let m = Matcher::new(
            RuleType::IpCidr,
            vec![
                RuleItem::new(RuleType::IpCidr, "LAN", values(&["192.168.0.0/16", "10.1.2.3"])).with_resolve(true),
                RuleItem::new(RuleType::IpCidr, "V6", values(&["fd00::/8"])),
            ],
            None,
        )
        .unwrap();
        assert_eq!(hit(&m, "192.168.1.1").await.as_deref(), Some("LAN"));
        assert_eq!(hit(&m, "10.1.2.3").await.as_deref(), Some("LAN"));
        assert_eq!(hit(&m, "[fd00::1]").await.as_deref(), Some("V6"));
        assert_eq!(hit(&m, "nas.lan").await, None);

        let resolver = Arc::new(Resolver::with_clients(Vec::new(), Hosts::parse("192.168.3.3 nas.lan"), None));
        let mut ctx = MatchContext::new("nas.lan", Some(&resolver));
        assert_eq!(m.matches(&mut ctx).await.map(|r| r.proxy.as_str()), Some("LAN"));

        assert!(Matcher::new(
            RuleType::IpCidr,
            vec![RuleItem::new(RuleType::IpCidr, "X", values(&["not-a-cidr"]))],
            None
        )
        .is_err());
    }

    #[tokio::test]
    async fn test_others() {
        let m = Matcher::new(RuleType::Others, vec![RuleItem::new(RuleType::Others, "direct", vec![])], None).unwrap();
        assert_eq!(hit(&m, "anything").await.as_deref(), Some("direct"));
        let empty = Matcher::new(RuleType::Others, vec![RuleItem::new(RuleType::Others, "", vec![])], None).unwrap();
        assert_eq!(hit(&empty, "anything").await, None);
    }
}
