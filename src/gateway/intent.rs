//! 意图识别模块
//!
//! 分析用户输入，判断消息类型（chat / task / query / command / creative）、复杂度与是否需要工具。
//! 先走快速规则匹配；仅当规则置信度低于阈值且启用了 LLM 时才调用模型二次判定，失败时静默回退。

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::IntentSection;
use crate::llm::LlmClient;
use crate::memory::Message;

/// 识别出的意图类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentType {
    /// 普通对话
    #[default]
    Chat,
    /// 需要动手做事
    Task,
    /// 提问
    Query,
    /// 直接指令（show / list / delete ...）
    Command,
    /// 创作（故事、诗歌、文章）
    Creative,
}

impl IntentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentType::Chat => "chat",
            IntentType::Task => "task",
            IntentType::Query => "query",
            IntentType::Command => "command",
            IntentType::Creative => "creative",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "chat" => Some(IntentType::Chat),
            "task" => Some(IntentType::Task),
            "query" => Some(IntentType::Query),
            "command" => Some(IntentType::Command),
            "creative" => Some(IntentType::Creative),
            _ => None,
        }
    }
}

/// 复杂度
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    #[default]
    Moderate,
    Complex,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Simple => "simple",
            Complexity::Moderate => "moderate",
            Complexity::Complex => "complex",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "simple" => Some(Complexity::Simple),
            "moderate" => Some(Complexity::Moderate),
            "complex" => Some(Complexity::Complex),
            _ => None,
        }
    }

    /// simple 提升为 moderate，其余不变
    fn at_least_moderate(self) -> Self {
        if self == Complexity::Simple {
            Complexity::Moderate
        } else {
            self
        }
    }
}

/// 意图识别结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentResult {
    pub should_respond: bool,
    pub intent_type: IntentType,
    pub complexity: Complexity,
    pub requires_tools: bool,
    /// 按出现顺序抽取的实体（url:...、code_block、file:.ext、github_repo、issue_ref）
    pub entities: Vec<String>,
    /// 0.0 - 1.0
    pub confidence: f32,
    /// LLM 二次判定的原始输出（调试用）
    pub raw_analysis: String,
}

impl Default for IntentResult {
    fn default() -> Self {
        Self {
            should_respond: true,
            intent_type: IntentType::Chat,
            complexity: Complexity::Moderate,
            requires_tools: false,
            entities: Vec::new(),
            confidence: 0.8,
            raw_analysis: String::new(),
        }
    }
}

impl std::fmt::Display for IntentResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "IntentResult(type={}, complexity={}, tools={}, confidence={:.2})",
            self.intent_type.as_str(),
            self.complexity.as_str(),
            self.requires_tools,
            self.confidence
        )
    }
}

/// 识别时可用的上下文
#[derive(Debug, Clone, Default)]
pub struct IntentContext {
    /// 之前的消息条数
    pub message_count: usize,
    pub is_dm: bool,
    pub has_attachments: bool,
}

/// 关键词表（可在 [intent.tables] 中整体覆盖）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentTables {
    /// 寒暄 / 确认类词（按整词匹配）
    pub simple_keywords: Vec<String>,
    /// 暗示需要工具的词（子串匹配）
    pub tool_keywords: Vec<String>,
    /// 暗示需要深入推理的词（子串匹配）
    pub complex_keywords: Vec<String>,
    /// 首词命中即视为指令
    pub command_starters: Vec<String>,
    pub creative_verbs: Vec<String>,
    pub creative_nouns: Vec<String>,
    /// 识别为文件引用的扩展名
    pub file_extensions: Vec<String>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for IntentTables {
    fn default() -> Self {
        Self {
            simple_keywords: strings(&[
                "hi", "hello", "hey", "thanks", "thank you", "bye", "goodbye", "ok", "okay",
                "yes", "no", "sure", "got it", "understood", "cool", "nice", "great", "awesome",
                "lol", "haha",
            ]),
            tool_keywords: strings(&[
                // 代码执行
                "run", "execute", "calculate", "compute", "script", "code", "python", "install",
                // 文件
                "file", "save", "download", "upload", "read file", "write file", "create file",
                // 搜索
                "search", "google", "look up", "find online", "fetch", "web",
                // 代码托管
                "github", "repo", "repository", "pull request", "pr", "issue", "commit", "branch",
                "workflow", "action", "gist",
                "ado", "azure devops", "work item", "pipeline", "build", "wiki",
                "email", "send email", "check email",
                "git", "clone", "push", "pull", "merge",
            ]),
            complex_keywords: strings(&[
                "analyze", "analyse", "explain why", "compare", "contrast", "evaluate", "assess",
                "review", "critique",
                "plan", "design", "architect", "strategy", "roadmap",
                "code review", "review this code", "review my code", "refactor", "optimize",
                "debug",
                "write a story", "write a poem", "creative writing", "brainstorm",
                "step by step", "think through", "reasoning", "implications", "trade-offs",
                "tradeoffs", "pros and cons",
            ]),
            command_starters: strings(&["show", "list", "get", "set", "add", "remove", "delete"]),
            creative_verbs: strings(&["write", "create", "generate", "compose", "draft"]),
            creative_nouns: strings(&["story", "poem", "essay", "article", "blog"]),
            file_extensions: strings(&[
                "py", "js", "ts", "json", "yaml", "yml", "md", "txt", "html", "css", "sql",
            ]),
        }
    }
}

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"https?://[^\s<>"{}|\\^`\[\]]+"#).expect("static regex"))
}

/// 文件名正则：扩展名表直接编进分支，多段文件名（config.test.json）也能回溯到正确的扩展名
fn build_file_re(extensions: &[String]) -> Option<Regex> {
    let alternation: Vec<String> = extensions
        .iter()
        .filter(|e| !e.is_empty())
        .map(|e| regex::escape(&e.to_lowercase()))
        .collect();
    if alternation.is_empty() {
        return None;
    }
    match Regex::new(&format!(r"\b\w+\.({})\b", alternation.join("|"))) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::warn!(error = %e, "invalid file extension table, file entities disabled");
            None
        }
    }
}

fn github_repo_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"github\.com/[\w-]+/[\w-]+").expect("static regex"))
}

fn issue_ref_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"#\d+").expect("static regex"))
}

fn json_object_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{[^}]+\}").expect("static regex"))
}

/// LLM 二次判定的 JSON 输出
#[derive(Debug, Deserialize)]
struct LlmClassification {
    intent_type: Option<String>,
    complexity: Option<String>,
    requires_tools: Option<bool>,
}

const URL_ENTITY_CHARS: usize = 50;
const MAX_URL_ENTITIES: usize = 3;
const LONG_MESSAGE_CHARS: usize = 500;
const LONG_HISTORY_MESSAGES: usize = 10;
const LLM_CONFIDENCE: f32 = 0.85;

/// 意图识别器
pub struct IntentDetector {
    tables: IntentTables,
    file_re: Option<Regex>,
    llm: Option<Arc<dyn LlmClient>>,
    use_llm: bool,
    llm_threshold: f32,
}

impl IntentDetector {
    /// 仅规则匹配
    pub fn new(tables: IntentTables) -> Self {
        Self {
            file_re: build_file_re(&tables.file_extensions),
            tables,
            llm: None,
            use_llm: false,
            llm_threshold: 0.7,
        }
    }

    pub fn from_config(section: &IntentSection, llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self {
            file_re: build_file_re(&section.tables.file_extensions),
            tables: section.tables.clone(),
            use_llm: section.use_llm && llm.is_some(),
            llm,
            llm_threshold: section.llm_threshold,
        }
    }

    /// 启用 LLM 二次判定（置信度低于 threshold 时调用）
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>, threshold: f32) -> Self {
        self.llm = Some(llm);
        self.use_llm = true;
        self.llm_threshold = threshold;
        self
    }

    pub fn tables(&self) -> &IntentTables {
        &self.tables
    }

    /// 识别用户意图
    pub async fn detect(&self, message: &str, ctx: &IntentContext) -> IntentResult {
        let result = self.detect_heuristic(message, ctx);

        if !self.use_llm || result.confidence >= self.llm_threshold {
            return result;
        }
        match &self.llm {
            Some(llm) => self.llm_refine(llm.as_ref(), message, result).await,
            None => result,
        }
    }

    /// 快速规则匹配（不调用 LLM）
    pub fn detect_heuristic(&self, message: &str, ctx: &IntentContext) -> IntentResult {
        let message_lower = message.trim().to_lowercase();
        let mut result = IntentResult {
            entities: self.extract_entities(message),
            ..IntentResult::default()
        };

        let words: HashSet<&str> = message_lower.split_whitespace().collect();
        let simple_hit = self
            .tables
            .simple_keywords
            .iter()
            .any(|k| words.contains(k.as_str()));
        if simple_hit && words.len() <= 5 {
            result.intent_type = IntentType::Chat;
            result.complexity = Complexity::Simple;
            result.requires_tools = false;
            result.confidence = 0.95;
            return result;
        }

        let tool_matches = count_substrings(&message_lower, &self.tables.tool_keywords);
        if tool_matches > 0 {
            result.requires_tools = true;
            result.intent_type = IntentType::Task;
            result.confidence = (0.6 + tool_matches as f32 * 0.1).min(0.9);
        }

        let complex_matches = count_substrings(&message_lower, &self.tables.complex_keywords);
        if complex_matches > 0 {
            result.complexity = Complexity::Complex;
            result.confidence = (0.6 + complex_matches as f32 * 0.15).min(0.9);
        }

        if message_lower.ends_with('?') && !result.requires_tools {
            result.intent_type = IntentType::Query;
        }

        let first_word = message_lower.split_whitespace().next().unwrap_or("");
        if self.tables.command_starters.iter().any(|w| w == first_word) {
            result.intent_type = IntentType::Command;
        }

        let creative_verb = self
            .tables
            .creative_verbs
            .iter()
            .any(|v| message_lower.contains(v.as_str()));
        let creative_noun = self
            .tables
            .creative_nouns
            .iter()
            .any(|n| message_lower.contains(n.as_str()));
        if creative_verb && creative_noun {
            result.intent_type = IntentType::Creative;
            result.complexity = Complexity::Complex;
        }

        if message_lower.chars().count() > LONG_MESSAGE_CHARS {
            result.complexity = result.complexity.at_least_moderate();
        }

        if result.entities.iter().any(|e| e == "code_block") {
            result.complexity = result.complexity.at_least_moderate();
            result.requires_tools = true;
        }

        if ctx.has_attachments {
            result.requires_tools = true;
            result.complexity = result.complexity.at_least_moderate();
        }

        if ctx.message_count > LONG_HISTORY_MESSAGES {
            result.complexity = result.complexity.at_least_moderate();
        }

        result
    }

    /// 抽取 URL、代码块、文件扩展名、GitHub 仓库与 issue 引用
    pub fn extract_entities(&self, message: &str) -> Vec<String> {
        let mut entities = Vec::new();

        for m in url_re().find_iter(message).take(MAX_URL_ENTITIES) {
            let url: String = m.as_str().chars().take(URL_ENTITY_CHARS).collect();
            entities.push(format!("url:{}", url));
        }

        if message.contains("```") {
            entities.push("code_block".to_string());
        }

        let lower = message.to_lowercase();
        let mut seen = HashSet::new();
        if let Some(re) = &self.file_re {
            for caps in re.captures_iter(&lower) {
                let ext = &caps[1];
                if seen.insert(ext.to_string()) {
                    entities.push(format!("file:.{}", ext));
                }
            }
        }

        if github_repo_re().is_match(message) {
            entities.push("github_repo".to_string());
        }
        if issue_ref_re().is_match(message) {
            entities.push("issue_ref".to_string());
        }

        entities
    }

    /// 使用 LLM 细化分类；任何失败都保留规则结果
    async fn llm_refine(
        &self,
        llm: &dyn LlmClient,
        message: &str,
        mut result: IntentResult,
    ) -> IntentResult {
        let snippet: String = message.chars().take(500).collect();
        let prompt = format!(
            r#"Analyze this user message and classify it. Respond with ONLY a JSON object.

Message: "{snippet}"

Classify as:
- intent_type: "chat" (casual), "task" (do something), "query" (question), "command" (direct order), "creative" (writing/art)
- complexity: "simple" (quick response), "moderate" (some thought), "complex" (deep analysis/multi-step)
- requires_tools: true/false (needs code execution, file ops, web search, GitHub, etc.)

JSON response:"#
        );

        let response = match llm.complete(&[Message::user(prompt)]).await {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(error = %e, "intent llm refinement failed, keeping heuristic result");
                return result;
            }
        };

        let Some(json) = json_object_re().find(&response) else {
            return result;
        };
        let parsed: LlmClassification = match serde_json::from_str(json.as_str()) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(error = %e, "intent llm output is not valid JSON");
                return result;
            }
        };

        if let Some(t) = parsed.intent_type.as_deref().and_then(IntentType::parse) {
            result.intent_type = t;
        }
        if let Some(c) = parsed.complexity.as_deref().and_then(Complexity::parse) {
            result.complexity = c;
        }
        if let Some(tools) = parsed.requires_tools {
            result.requires_tools = tools;
        }
        result.confidence = LLM_CONFIDENCE;
        result.raw_analysis = response;
        result
    }
}

impl Default for IntentDetector {
    fn default() -> Self {
        Self::new(IntentTables::default())
    }
}

fn count_substrings(haystack: &str, needles: &[String]) -> usize {
    needles
        .iter()
        .filter(|k| haystack.contains(k.as_str()))
        .count()
}
