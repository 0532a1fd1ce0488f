//! 群聊准入控制（拒答判定）
//!
//! 决定机器人在多人会话里是否开口：私聊、@提及、回复机器人直接放行；过短消息直接拒绝；
//! 其余按四个信号（直接称呼、提问、相关性、陈述）加权求和，与频道阈值比较。
//! 阈值可在线调整（report_badcase / report_missed），以原子量保存，共享分类器无需加锁。

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::config::RejectionSection;

use super::intent::{Complexity, IntentResult};

/// 阈值可调整范围
pub const THROTTLE_MIN: f32 = 0.1;
pub const THROTTLE_MAX: f32 = 0.6;
/// 每次反馈的调整步长
pub const FEEDBACK_STEP: f32 = 0.02;

/// 拒答原因码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionCode {
    Success,
    /// 不太像是对机器人说的
    LowRelevance,
    /// 群友闲聊
    AmbientChat,
    TooShort,
    NotAQuestion,
    Unrelated,
    // 以下三种由平台适配层使用
    RateLimited,
    QuietHours,
    AnotherUserResponding,
}

impl RejectionCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionCode::Success => "success",
            RejectionCode::LowRelevance => "low_relevance",
            RejectionCode::AmbientChat => "ambient_chat",
            RejectionCode::TooShort => "too_short",
            RejectionCode::NotAQuestion => "not_a_question",
            RejectionCode::Unrelated => "unrelated",
            RejectionCode::RateLimited => "rate_limited",
            RejectionCode::QuietHours => "quiet_hours",
            RejectionCode::AnotherUserResponding => "another_user_responding",
        }
    }
}

/// 判定结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectionResult {
    pub should_respond: bool,
    pub code: RejectionCode,
    pub confidence: f32,
    pub reason: String,
    /// 各信号得分，便于调试与统计
    pub scores: BTreeMap<String, f32>,
}

impl RejectionResult {
    fn accept(reason: &str, signal: &str) -> Self {
        Self {
            should_respond: true,
            code: RejectionCode::Success,
            confidence: 1.0,
            reason: reason.to_string(),
            scores: BTreeMap::from([(signal.to_string(), 1.0)]),
        }
    }
}

impl fmt::Display for RejectionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RejectionResult(respond={}, code={}, conf={:.2})",
            self.should_respond,
            self.code.as_str(),
            self.confidence
        )
    }
}

/// 判定上下文（由平台适配层填充）
#[derive(Debug, Clone, Default)]
pub struct RejectionContext {
    pub is_dm: bool,
    pub is_mentioned: bool,
    /// 回复的是机器人的消息
    pub is_reply: bool,
    /// 频道级阈值覆盖
    pub channel_throttle: Option<f32>,
    /// 覆盖配置中的机器人名
    pub bot_name: Option<String>,
}

/// 加权求和的各项权重
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RejectionWeights {
    pub direct: f32,
    pub question: f32,
    pub relevance: f32,
    /// 作用于 (1 - statement)
    pub statement: f32,
}

impl Default for RejectionWeights {
    fn default() -> Self {
        Self {
            direct: 0.4,
            question: 0.3,
            relevance: 0.2,
            statement: 0.1,
        }
    }
}

/// 正则表（大小写不敏感）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RejectionPatterns {
    pub direct: Vec<String>,
    pub question: Vec<String>,
    pub statement: Vec<String>,
}

impl Default for RejectionPatterns {
    fn default() -> Self {
        let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            direct: owned(&[
                r"^clarissa[,:]?\s",
                r"^clara[,:]?\s",
                r"^hey clarissa",
                r"^@clarissa",
                r"clarissa[,]?\s+(can|could|would|will|do|does|is|are|what|how|why|when|where)\b",
            ]),
            question: owned(&[
                r"\?\s*$",
                r"^(what|how|why|when|where|who|which|can|could|would|should|is|are|do|does|did)\b",
                r"^(tell me|explain|help|show|find|search|look up)\b",
            ]),
            statement: owned(&[
                r"^(i think|i believe|i feel|imo|imho|tbh)\b",
                r"^(yeah|yes|no|nope|okay|ok|sure|right|exactly|agreed)\b",
                r"^(lol|lmao|haha|nice|cool|wow|damn)\b",
            ]),
        }
    }
}

/// 编译正则表；非法表达式记录告警后跳过
fn compile_all(kind: &str, patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| match RegexBuilder::new(p).case_insensitive(true).build() {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!(kind, pattern = %p, error = %e, "skipping invalid rejection pattern");
                None
            }
        })
        .collect()
}

const SHORT_STATEMENT_CHARS: usize = 20;

/// 拒答分类器
pub struct RejectionClassifier {
    /// f32 的位模式
    throttle: AtomicU32,
    min_length: usize,
    bot_name: String,
    weights: RejectionWeights,
    direct: Vec<Regex>,
    question: Vec<Regex>,
    statement: Vec<Regex>,
}

impl Default for RejectionClassifier {
    fn default() -> Self {
        Self::from_config(&RejectionSection::default())
    }
}

impl RejectionClassifier {
    pub fn from_config(section: &RejectionSection) -> Self {
        Self {
            throttle: AtomicU32::new(section.throttle.to_bits()),
            min_length: section.min_length,
            bot_name: section.bot_name.to_lowercase(),
            weights: section.weights,
            direct: compile_all("direct", &section.patterns.direct),
            question: compile_all("question", &section.patterns.question),
            statement: compile_all("statement", &section.patterns.statement),
        }
    }

    pub fn throttle(&self) -> f32 {
        f32::from_bits(self.throttle.load(Ordering::Relaxed))
    }

    /// 直接设置阈值（截断到 [0, 1]）
    pub fn set_throttle(&self, value: f32) {
        self.throttle
            .store(value.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    /// 按 delta 调整阈值，结果截断到 [THROTTLE_MIN, THROTTLE_MAX]
    pub fn adjust_throttle(&self, delta: f32) {
        let _ = self
            .throttle
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                let next = (f32::from_bits(bits) + delta).clamp(THROTTLE_MIN, THROTTLE_MAX);
                Some(next.to_bits())
            });
    }

    /// 回复了不该回复的消息：提高阈值
    pub fn report_badcase(&self) {
        self.adjust_throttle(FEEDBACK_STEP);
    }

    /// 该回复却没回复：降低阈值
    pub fn report_missed(&self) {
        self.adjust_throttle(-FEEDBACK_STEP);
    }

    pub fn classify(
        &self,
        message: &str,
        ctx: &RejectionContext,
        intent: Option<&IntentResult>,
    ) -> RejectionResult {
        if ctx.is_dm {
            return RejectionResult::accept("Direct message", "is_dm");
        }
        if ctx.is_mentioned || ctx.is_reply {
            return RejectionResult::accept("Explicitly mentioned or replied to", "is_mentioned");
        }

        let length = message.trim().chars().count();
        if length < self.min_length {
            return RejectionResult {
                should_respond: false,
                code: RejectionCode::TooShort,
                confidence: 0.9,
                reason: format!("Message too short ({} chars)", length),
                scores: BTreeMap::from([("length".to_string(), 0.0)]),
            };
        }

        let direct = self.score_direct_address(message, ctx);
        let question = self.score_question(message);
        let statement = self.score_statement(message);
        let relevance = score_relevance(intent);

        let mut scores = BTreeMap::from([
            ("direct_address".to_string(), direct),
            ("is_question".to_string(), question),
            ("is_statement".to_string(), statement),
            ("relevance".to_string(), relevance),
        ]);
        if let Some(i) = intent {
            scores.insert(
                "intent_respond".to_string(),
                if i.should_respond { 1.0 } else { 0.0 },
            );
            scores.insert("intent_confidence".to_string(), i.confidence);
        }

        let w = &self.weights;
        let aggregate = w.direct * direct
            + w.question * question
            + w.relevance * relevance
            + w.statement * (1.0 - statement);

        let throttle = ctx.channel_throttle.unwrap_or_else(|| self.throttle());
        let should_respond = aggregate >= throttle;

        let (code, reason) = if should_respond {
            (RejectionCode::Success, "Score above threshold".to_string())
        } else if direct < 0.2 && question < 0.3 {
            (
                RejectionCode::AmbientChat,
                "Ambient conversation not directed at bot".to_string(),
            )
        } else if statement > 0.7 {
            (
                RejectionCode::NotAQuestion,
                "Appears to be a statement, not a question".to_string(),
            )
        } else if relevance < 0.3 {
            (
                RejectionCode::Unrelated,
                "Topic appears unrelated to bot's domain".to_string(),
            )
        } else {
            (
                RejectionCode::LowRelevance,
                format!("Below threshold ({:.2} < {:.2})", aggregate, throttle),
            )
        };

        let result = RejectionResult {
            should_respond,
            code,
            confidence: aggregate,
            reason,
            scores,
        };
        tracing::debug!(%result, throttle, "rejection classified");
        result
    }

    fn score_direct_address(&self, message: &str, ctx: &RejectionContext) -> f32 {
        let lower = message.to_lowercase();
        if self.direct.iter().any(|re| re.is_match(&lower)) {
            return 1.0;
        }
        let bot_name = ctx
            .bot_name
            .as_deref()
            .map(str::to_lowercase)
            .unwrap_or_else(|| self.bot_name.clone());
        if !bot_name.is_empty() && lower.contains(&bot_name) {
            return 0.8;
        }
        if lower.starts_with("you ") || lower.starts_with("your ") {
            return 0.4;
        }
        0.0
    }

    fn score_question(&self, message: &str) -> f32 {
        let mut score = self.question.iter().filter(|re| re.is_match(message)).count() as f32 * 0.4;
        if message.contains('?') {
            score += 0.5;
        }
        score.min(1.0)
    }

    fn score_statement(&self, message: &str) -> f32 {
        let lower = message.to_lowercase();
        if self.statement.iter().any(|re| re.is_match(&lower)) {
            return 0.8;
        }
        if message.chars().count() < SHORT_STATEMENT_CHARS && !message.contains('?') {
            return 0.5;
        }
        0.0
    }
}

fn score_relevance(intent: Option<&IntentResult>) -> f32 {
    match intent {
        Some(i) if i.requires_tools => 0.9,
        Some(i) if i.complexity == Complexity::Complex => 0.7,
        Some(i) if i.complexity == Complexity::Moderate => 0.5,
        _ => 0.4,
    }
}
