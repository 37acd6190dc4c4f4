//! 分流规则配置

use crate::rule::{CountryLookup, RuleItem, RuleMode, RuleType, Ruler};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// 规则配置
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    pub mode: RuleMode,
    /// DIRECT 模式下改走的代理
    pub direct_to: String,
    /// GLOBAL 模式下固定使用的代理，为空时依次尝试全部代理
    pub global_to: String,
    #[serde(rename = "match")]
    pub matches: MatchConfig,
}

/// MATCH 模式的规则表
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// 其余目标使用的代理，为空时丢弃
    pub others: String,
    pub domain: Vec<MatchEntry>,
    pub domain_keyword: Vec<MatchEntry>,
    pub domain_suffix: Vec<MatchEntry>,
    pub geoip: Vec<MatchEntry>,
    pub ipcidr: Vec<MatchEntry>,
}

/// 一组同类规则
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchEntry {
    #[serde(default)]
    pub proxy: String,
    /// `accept` 或 `drop`
    #[serde(default = "default_action")]
    pub action: String,
    #[serde(default)]
    pub value: Vec<String>,
    /// 目标为域名时先解析再匹配，只对 geoip / ipcidr 有意义
    #[serde(default)]
    pub resolve: bool,
}

fn default_action() -> String {
    "accept".to_string()
}

impl MatchEntry {
    fn accept(&self) -> Result<bool> {
        match self.action.as_str() {
            "accept" => Ok(true),
            "drop" => Ok(false),
            other => Err(anyhow!("Invalid rule action {:?}", other)),
        }
    }
}

impl RulesConfig {
    pub fn validate(&self) -> Result<()> {
        self.items()?;
        Ok(())
    }

    /// 是否存在 GEOIP 规则
    pub fn needs_geoip(&self) -> bool {
        self.mode == RuleMode::Match && !self.matches.geoip.is_empty()
    }

    /// 展开为规则列表
    pub fn items(&self) -> Result<Vec<RuleItem>> {
        let m = &self.matches;
        let groups = [
            (RuleType::Domain, &m.domain),
            (RuleType::DomainKeyword, &m.domain_keyword),
            (RuleType::DomainSuffix, &m.domain_suffix),
            (RuleType::GeoIp, &m.geoip),
            (RuleType::IpCidr, &m.ipcidr),
        ];
        let mut items = Vec::new();
        for (kind, entries) in groups {
            for entry in entries {
                let item = RuleItem::new(kind, &entry.proxy, entry.value.clone())
                    .with_accept(entry.accept()?)
                    .with_resolve(entry.resolve);
                items.push(item);
            }
        }
        if !m.others.is_empty() {
            items.push(RuleItem::new(RuleType::Others, &m.others, vec![]));
        }
        Ok(items)
    }

    /// 构造规则引擎；GLOBAL 与 DIRECT 模式不需要规则表
    pub fn build_ruler(&self, geoip: Option<Arc<dyn CountryLookup>>) -> Result<Ruler> {
        let items = if self.mode == RuleMode::Match {
            self.items()?
        } else {
            Vec::new()
        };
        let ruler = Ruler::new(self.mode, items, geoip).map_err(|e| anyhow!("Failed to build rules: {}", e))?;
        Ok(ruler.with_targets(&self.direct_to, &self.global_to))
    }
}
