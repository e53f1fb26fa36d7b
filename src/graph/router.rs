//! 工具路由器：把自然语言查询映射到至多一个工具类别
//!
//! 有序规则表（关键词集合 -> 类别），第一条与小写查询按词相交的规则胜出，无匹配返回 None。
//! 纯函数、无状态，任意并发调用安全，任意输入（含空串）都返回结果。

use serde::{Deserialize, Serialize};

/// 工具类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolCategory {
    ManualSearch,
    CatalogSearch,
    Analytics,
    None,
}

impl ToolCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ManualSearch => "manualSearch",
            Self::CatalogSearch => "catalogSearch",
            Self::Analytics => "analytics",
            Self::None => "none",
        }
    }
}

/// 按非字母数字字符切词（小写）
fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// 一条路由规则：任一关键词（可为多词短语）作为连续整词出现在查询中即命中；
/// 短语最后一个词允许复数后缀 `s` / `es`
#[derive(Debug, Clone)]
pub struct RoutingRule {
    pub category: ToolCategory,
    pub keywords: Vec<Vec<String>>,
}

impl RoutingRule {
    pub fn new(category: ToolCategory, keywords: &[&str]) -> Self {
        Self {
            category,
            keywords: keywords.iter().map(|k| words(k)).filter(|k| !k.is_empty()).collect(),
        }
    }

    fn matches(&self, query_words: &[String]) -> bool {
        self.keywords.iter().any(|phrase| {
            query_words
                .windows(phrase.len())
                .any(|window| phrase_matches(phrase, window))
        })
    }
}

fn phrase_matches(phrase: &[String], window: &[String]) -> bool {
    let last = phrase.len() - 1;
    phrase.iter().zip(window).enumerate().all(|(i, (k, w))| {
        if i < last {
            return k == w;
        }
        w == k || w.strip_prefix(k.as_str()).is_some_and(|rest| rest == "s" || rest == "es")
    })
}

const MANUAL_KEYWORDS: &[&str] = &[
    "manual", "pneu", "pressão", "pressao", "calibragem", "calibrar", "óleo", "oleo",
    "revisão", "revisao", "manutenção", "manutencao", "torque", "fusível", "fusivel",
    "bateria", "freio", "painel", "especificação", "especificacao", "capacidade do tanque",
];

const CATALOG_KEYWORDS: &[&str] = &[
    "preço", "preco", "quanto custa", "valor", "estoque", "disponível", "disponivel",
    "comprar", "catálogo", "catalogo", "financiamento", "parcela", "promoção", "promocao",
    "versões", "versoes", "test ride",
];

const ANALYTICS_KEYWORDS: &[&str] = &[
    "analytics", "ga4", "usuários", "usuarios", "acessos", "visitas", "visitantes",
    "tráfego", "trafego", "relatório", "relatorio", "conversões", "conversoes",
    "sessões", "sessoes", "métricas", "metricas", "tempo real",
];

#[derive(Debug, Clone)]
pub struct ToolRouter {
    rules: Vec<RoutingRule>,
}

impl ToolRouter {
    /// 默认规则：manualSearch > catalogSearch > analytics
    pub fn new() -> Self {
        Self::with_rules(vec![
            RoutingRule::new(ToolCategory::ManualSearch, MANUAL_KEYWORDS),
            RoutingRule::new(ToolCategory::CatalogSearch, CATALOG_KEYWORDS),
            RoutingRule::new(ToolCategory::Analytics, ANALYTICS_KEYWORDS),
        ])
    }

    pub fn with_rules(rules: Vec<RoutingRule>) -> Self {
        Self { rules }
    }

    pub fn route(&self, query: &str) -> ToolCategory {
        let query_words = words(query);
        self.rules
            .iter()
            .find(|rule| rule.matches(&query_words))
            .map(|rule| rule.category)
            .unwrap_or(ToolCategory::None)
    }
}

impl Default for ToolRouter {
    fn default() -> Self {
        Self::new()
    }
}
