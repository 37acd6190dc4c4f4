//! 分流规则
//!
//! 三种模式：
//! - `GLOBAL`：全部走代理，`global_to` 为空时按注册顺序依次尝试
//! - `DIRECT`：全部直连，`direct_to` 非空时改走该代理
//! - `MATCH`：按 DOMAIN、DOMAIN-KEYWORD、DOMAIN-SUFFIX、GEOIP、IP-CIDR、OTHERS 的顺序
//!   逐类匹配，首个命中的规则决定去向
//!
//! 规则的代理名 `global` / `direct` 分别指向全局与直连策略，空代理名表示丢弃。

pub mod geoip;
pub mod matcher;
pub mod trie;

pub use geoip::{CountryLookup, GeoIpDb};
pub use matcher::{MatchContext, Matcher, RuleItem, RuleType};
pub use trie::DomainTrie;

use crate::dns::Resolver;
use crate::protocol::Address;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// 规则错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("rule matched dropped")]
    RuleMatchDropped,
    #[error("empty global proxy node")]
    EmptyGlobalProxy,
    #[error("invalid rule: {0}")]
    InvalidRule(String),
}

impl From<RuleError> for std::io::Error {
    fn from(err: RuleError) -> Self {
        let kind = match err {
            RuleError::RuleMatchDropped => std::io::ErrorKind::PermissionDenied,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

/// 分流模式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleMode {
    Global,
    Direct,
    #[default]
    Match,
}

impl fmt::Display for RuleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RuleMode::Global => "GLOBAL",
            RuleMode::Direct => "DIRECT",
            RuleMode::Match => "MATCH",
        })
    }
}

impl FromStr for RuleMode {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "global" => Ok(RuleMode::Global),
            "direct" => Ok(RuleMode::Direct),
            "match" | "rule" => Ok(RuleMode::Match),
            _ => Err(RuleError::InvalidRule(format!("unknown rule mode {}", s))),
        }
    }
}

/// 选中的出口
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// 直连
    Direct,
    /// 指定代理
    Proxy(String),
    /// 按注册顺序尝试全部代理，失败时顺延
    Global,
}

impl Selection {
    /// 统计信息中展示的代理名
    pub fn name(&self) -> &str {
        match self {
            Selection::Direct => "direct",
            Selection::Proxy(name) => name,
            Selection::Global => "global",
        }
    }
}

/// 去掉目标中的端口
fn host_of(target: &str) -> String {
    match target.parse::<Address>() {
        Ok(addr) => addr.host(),
        Err(_) => target.to_string(),
    }
}

/// `direct` / `global` 作为目标代理名时等同于未配置
fn normalize_target(name: &str) -> String {
    match name {
        "direct" | "global" => String::new(),
        other => other.to_string(),
    }
}

/// 规则引擎，构造后只读；`global_to` / `direct_to` 可在运行时切换
pub struct Ruler {
    mode: RuleMode,
    matchers: Vec<Matcher>,
    direct_to: RwLock<String>,
    global_to: RwLock<String>,
    resolver: Option<Arc<Resolver>>,
}

impl fmt::Debug for Ruler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ruler")
            .field("mode", &self.mode)
            .field("matchers", &self.matchers)
            .field("direct_to", &*self.direct_to.read())
            .field("global_to", &*self.global_to.read())
            .finish()
    }
}

impl Ruler {
    /// 按规则类型分组构造匹配器
    pub fn new(mode: RuleMode, rules: Vec<RuleItem>, geoip: Option<Arc<dyn CountryLookup>>) -> Result<Self, RuleError> {
        let mut matchers = Vec::new();
        for kind in RuleType::ALL {
            let group: Vec<RuleItem> = rules
                .iter()
                .filter(|r| r.kind == kind)
                .cloned()
                .map(|mut r| {
                    r.mode = RuleMode::Match;
                    r
                })
                .collect();
            if group.is_empty() {
                continue;
            }
            let matcher = Matcher::new(kind, group, geoip.clone())?;
            debug!("register [{}] match-ruler with {} rules", kind, matcher.len());
            matchers.push(matcher);
        }
        Ok(Self {
            mode,
            matchers,
            direct_to: RwLock::new(String::new()),
            global_to: RwLock::new(String::new()),
            resolver: None,
        })
    }

    /// 全部直连、无规则的引擎
    pub fn direct() -> Self {
        Self {
            mode: RuleMode::Direct,
            matchers: Vec::new(),
            direct_to: RwLock::new(String::new()),
            global_to: RwLock::new(String::new()),
            resolver: None,
        }
    }

    pub fn with_targets(self, direct_to: &str, global_to: &str) -> Self {
        *self.direct_to.write() = normalize_target(direct_to);
        *self.global_to.write() = normalize_target(global_to);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn mode(&self) -> RuleMode {
        self.mode
    }

    pub fn global_to(&self) -> String {
        self.global_to.read().clone()
    }

    pub fn direct_to(&self) -> String {
        self.direct_to.read().clone()
    }

    pub fn set_global_to(&self, name: &str) {
        *self.global_to.write() = normalize_target(name);
    }

    pub fn set_direct_to(&self, name: &str) {
        *self.direct_to.write() = normalize_target(name);
    }

    /// 匹配目标（域名或 IP，可带端口），返回命中的规则；未命中任何规则时返回 None
    pub async fn match_target(&self, target: &str) -> Option<RuleItem> {
        if self.mode != RuleMode::Match {
            return Some(RuleItem {
                mode: self.mode,
                kind: RuleType::Others,
                proxy: match self.mode {
                    RuleMode::Global => "global".to_string(),
                    _ => "direct".to_string(),
                },
                values: Vec::new(),
                resolve: false,
                accept: true,
            });
        }
        let host = host_of(target);
        let mut ctx = MatchContext::new(&host, self.resolver.as_ref());
        for matcher in &self.matchers {
            if let Some(rule) = matcher.matches(&mut ctx).await {
                if rule.accept {
                    info!(mode = %rule.mode, kind = %rule.kind, proxy = %rule.proxy, target, "match success");
                } else {
                    warn!(mode = %rule.mode, kind = %rule.kind, target, "request dropped");
                }
                return Some(rule.clone());
            }
        }
        None
    }

    /// 把命中的规则转换为具体出口
    pub fn select(&self, rule: &RuleItem) -> Result<Selection, RuleError> {
        let mode = match rule.mode {
            RuleMode::Match => match rule.proxy.as_str() {
                "global" => RuleMode::Global,
                "direct" => RuleMode::Direct,
                "" => return Err(RuleError::RuleMatchDropped),
                name => return Ok(Selection::Proxy(name.to_string())),
            },
            mode => mode,
        };
        let selection = match mode {
            RuleMode::Global => {
                let to = self.global_to.read();
                if to.is_empty() {
                    Selection::Global
                } else {
                    Selection::Proxy(to.clone())
                }
            }
            _ => {
                let to = self.direct_to.read();
                if to.is_empty() {
                    Selection::Direct
                } else {
                    Selection::Proxy(to.clone())
                }
            }
        };
        Ok(selection)
    }

    /// 匹配并选择出口，规则拒绝或未命中时返回 [`RuleError::RuleMatchDropped`]
    pub async fn route(&self, target: &str) -> Result<(RuleItem, Selection), RuleError> {
        let rule = self.match_target(target).await.ok_or(RuleError::RuleMatchDropped)?;
        if !rule.accept {
            return Err(RuleError::RuleMatchDropped);
        }
        let selection = self.select(&rule)?;
        debug!(target, proxy = selection.name(), "proxy selected");
        Ok((rule, selection))
    }
}
