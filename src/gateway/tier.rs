//! 模型档位选择
//!
//! 根据意图识别结果、消息关键词与会话长度在 low / mid / high 三档之间选择。
//! 手动指定（参数或 `!high` / `!mid` / `!low` 前缀）永远优先。

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::TierSection;

use super::intent::{Complexity, IntentResult, IntentType};

/// 模型档位
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Low,
    #[default]
    Mid,
    High,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Low => "low",
            Tier::Mid => "mid",
            Tier::High => "high",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Tier::Low),
            "mid" => Ok(Tier::Mid),
            "high" => Ok(Tier::High),
            other => Err(format!("unknown tier: {}", other)),
        }
    }
}

/// 供适配层展示用的 (emoji, 名称)
pub fn tier_display(tier: Tier) -> (&'static str, &'static str) {
    match tier {
        Tier::High => ("🔴", "High Tier"),
        Tier::Mid => ("🟡", "Mid Tier"),
        Tier::Low => ("🟢", "Low Tier"),
    }
}

/// 解析消息开头的 `!high` / `!mid` / `!low`，返回 (档位, 去掉前缀后的正文)
pub fn parse_tier_prefix(text: &str) -> (Option<Tier>, &str) {
    let trimmed = text.trim_start();
    let Some(rest) = trimmed.strip_prefix('!') else {
        return (None, text);
    };
    let word_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
    match rest[..word_end].parse::<Tier>() {
        Ok(tier) => (Some(tier), rest[word_end..].trim_start()),
        Err(_) => (None, text),
    }
}

/// 档位关键词表（可在 [tier.keywords] 中覆盖）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierKeywords {
    /// 子串命中一次记 1 个高档指标
    pub high: Vec<String>,
    /// 按整词匹配的寒暄词
    pub low: Vec<String>,
}

impl Default for TierKeywords {
    fn default() -> Self {
        let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            high: owned(&[
                "analyze", "analyse", "deep dive", "comprehensive", "thorough",
                "detailed analysis", "explain the implications", "trade-offs", "tradeoffs",
                "code review", "review this code", "security audit", "architecture review",
                "write a story", "write a poem", "creative writing", "brainstorm ideas",
                "create a plan", "design a system", "architect", "strategy",
                "step by step", "walk me through", "break down",
            ]),
            low: owned(&[
                "hi", "hello", "hey", "thanks", "thank you", "yes", "no", "ok", "okay", "got it",
                "sure", "cool", "nice", "what time", "what's the date", "how are you",
                "goodbye", "bye",
            ]),
        }
    }
}

/// 选档时的上下文
#[derive(Debug, Clone, Default)]
pub struct TierContext {
    pub message: String,
    /// 之前的消息条数
    pub message_count: usize,
    pub manual_tier: Option<Tier>,
}

const LONG_CONVERSATION: usize = 15;
const SHORT_MESSAGE_CHARS: usize = 50;
const SHORT_CONVERSATION: usize = 2;

/// 档位选择器
#[derive(Debug, Clone)]
pub struct TierSelector {
    enabled: bool,
    default_tier: Tier,
    high_threshold: u32,
    keywords: TierKeywords,
}

impl Default for TierSelector {
    fn default() -> Self {
        Self::from_config(&TierSection::default())
    }
}

impl TierSelector {
    pub fn from_config(section: &TierSection) -> Self {
        Self {
            enabled: section.auto_enabled,
            default_tier: section.default_tier,
            high_threshold: section.high_indicator_threshold,
            keywords: section.keywords.clone(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// 选择档位；manual_tier 参数优先于 ctx.manual_tier
    pub fn select(
        &self,
        intent: Option<&IntentResult>,
        ctx: &TierContext,
        manual_tier: Option<Tier>,
    ) -> Tier {
        if let Some(tier) = manual_tier.or(ctx.manual_tier) {
            return tier;
        }
        if !self.enabled {
            return self.default_tier;
        }

        let message = ctx.message.to_lowercase();
        if self.has_low_keyword(&message) && message.split_whitespace().count() <= 5 {
            return Tier::Low;
        }
        if self.high_indicators(intent, &message, ctx) >= self.high_threshold {
            return Tier::High;
        }
        if self.low_sufficient(intent, &message, ctx) {
            return Tier::Low;
        }
        Tier::Mid
    }

    /// 人类可读的选档理由（只用于日志，不影响选择）
    pub fn tier_reason(&self, tier: Tier, intent: Option<&IntentResult>, ctx: &TierContext) -> String {
        if ctx.manual_tier.is_some() {
            return "Manual override via message prefix".to_string();
        }
        match tier {
            Tier::High => {
                let mut reasons = Vec::new();
                if let Some(i) = intent {
                    if i.complexity == Complexity::Complex {
                        reasons.push("complex task".to_string());
                    }
                    if i.intent_type == IntentType::Creative {
                        reasons.push("creative writing".to_string());
                    }
                }
                let message = ctx.message.to_lowercase();
                if let Some(kw) = self.keywords.high.iter().find(|k| message.contains(k.as_str())) {
                    reasons.push(format!("keyword '{}'", kw));
                }
                let joined = if reasons.is_empty() {
                    "complexity indicators".to_string()
                } else {
                    reasons.join(", ")
                };
                format!("High tier selected: {}", joined)
            }
            Tier::Low => {
                if intent.is_some_and(|i| i.complexity == Complexity::Simple) {
                    "Low tier selected: simple interaction".to_string()
                } else {
                    "Low tier selected: basic conversation".to_string()
                }
            }
            Tier::Mid => "Mid tier selected: balanced default".to_string(),
        }
    }

    fn has_low_keyword(&self, message: &str) -> bool {
        let words: HashSet<&str> = message.split_whitespace().collect();
        self.keywords.low.iter().any(|k| words.contains(k.as_str()))
    }

    fn high_indicators(&self, intent: Option<&IntentResult>, message: &str, ctx: &TierContext) -> u32 {
        let mut indicators = 0;

        if let Some(i) = intent {
            if i.complexity == Complexity::Complex {
                indicators += 2;
            }
            if i.intent_type == IntentType::Creative {
                indicators += 2;
            }
            if i.requires_tools && i.entities.len() > 3 {
                indicators += 1;
            }
        }

        indicators += self
            .keywords
            .high
            .iter()
            .filter(|k| message.contains(k.as_str()))
            .count() as u32;

        if ctx.message_count > LONG_CONVERSATION {
            indicators += 1;
        }
        if ctx.message.contains("```") {
            indicators += 1;
        }
        if intent.is_some_and(|i| i.entities.len() > 5) {
            indicators += 1;
        }

        indicators
    }

    fn low_sufficient(&self, intent: Option<&IntentResult>, message: &str, ctx: &TierContext) -> bool {
        if let Some(i) = intent {
            if i.complexity != Complexity::Simple
                || i.requires_tools
                || !matches!(i.intent_type, IntentType::Chat | IntentType::Query)
            {
                return false;
            }
        }

        if message.chars().count() < SHORT_MESSAGE_CHARS
            && !message.contains('?')
            && self.has_low_keyword(message)
        {
            return true;
        }

        ctx.message_count <= SHORT_CONVERSATION
            && intent.is_some_and(|i| i.complexity == Complexity::Simple)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(message: &str) -> TierContext {
        TierContext {
            message: message.to_string(),
            ..Default::default()
        }
    }

    fn intent(intent_type: IntentType, complexity: Complexity) -> IntentResult {
        IntentResult {
            intent_type,
            complexity,
            ..Default::default()
        }
    }

    #[test]
    fn test_manual_override_wins() {
        let s = TierSelector::default();
        let complex = intent(IntentType::Task, Complexity::Complex);
        assert_eq!(s.select(Some(&complex), &ctx("analyze this"), Some(Tier::Low)), Tier::Low);

        let mut c = ctx("hi");
        c.manual_tier = Some(Tier::High);
        assert_eq!(s.select(None, &c, None), Tier::High);
        assert_eq!(
            s.tier_reason(Tier::High, None, &c),
            "Manual override via message prefix"
        );
    }

    #[test]
    fn test_disabled_uses_default() {
        let section = TierSection {
            auto_enabled: false,
            default_tier: Tier::High,
            ..Default::default()
        };
        let s = TierSelector::from_config(&section);
        assert_eq!(s.select(None, &ctx("hello"), None), Tier::High);
    }

    #[test]
    fn test_greeting_is_low() {
        let s = TierSelector::default();
        assert_eq!(s.select(None, &ctx("hey there"), None), Tier::Low);
    }

    #[test]
    fn test_complex_intent_is_high() {
        let s = TierSelector::default();
        let i = intent(IntentType::Task, Complexity::Complex);
        let c = ctx("please look into the failing deployment for me");
        assert_eq!(s.select(Some(&i), &c, None), Tier::High);
        assert!(s.tier_reason(Tier::High, Some(&i), &c).contains("complex task"));
    }

    #[test]
    fn test_keywords_alone_can_reach_high() {
        let s = TierSelector::default();
        let c = ctx("give me a comprehensive deep dive into the module");
        assert_eq!(s.select(None, &c, None), Tier::High);
    }

    #[test]
    fn test_configurable_threshold() {
        let section = TierSection {
            high_indicator_threshold: 5,
            ..Default::default()
        };
        let s = TierSelector::from_config(&section);
        let c = ctx("give me a comprehensive deep dive into the module");
        assert_eq!(s.select(None, &c, None), Tier::Mid);
    }

    #[test]
    fn test_moderate_defaults_to_mid() {
        let s = TierSelector::default();
        let i = intent(IntentType::Query, Complexity::Moderate);
        let c = ctx("what is the capital of australia and why was it chosen?");
        assert_eq!(s.select(Some(&i), &c, None), Tier::Mid);
        assert_eq!(
            s.tier_reason(Tier::Mid, Some(&i), &c),
            "Mid tier selected: balanced default"
        );
    }

    #[test]
    fn test_simple_intent_in_new_conversation_is_low() {
        let s = TierSelector::default();
        let i = intent(IntentType::Query, Complexity::Simple);
        let c = ctx("what is the airspeed of an unladen swallow?");
        assert_eq!(s.select(Some(&i), &c, None), Tier::Low);
        assert_eq!(
            s.tier_reason(Tier::Low, Some(&i), &c),
            "Low tier selected: simple interaction"
        );
    }

    #[test]
    fn test_parse_tier_prefix() {
        assert_eq!(parse_tier_prefix("!high explain monads"), (Some(Tier::High), "explain monads"));
        assert_eq!(parse_tier_prefix("!LOW hi"), (Some(Tier::Low), "hi"));
        assert_eq!(parse_tier_prefix("!mid"), (Some(Tier::Mid), ""));
        assert_eq!(parse_tier_prefix("!help me"), (None, "!help me"));
        assert_eq!(parse_tier_prefix("no prefix"), (None, "no prefix"));
    }

    #[test]
    fn test_tier_display_and_parse() {
        assert_eq!(tier_display(Tier::High), ("🔴", "High Tier"));
        assert_eq!("Mid".parse::<Tier>(), Ok(Tier::Mid));
        assert!("ultra".parse::<Tier>().is_err());
    }
}
