//! 群聊会话上下文
//!
//! 按频道（可选子线程）跟踪参与者、最近消息、话题与实体提及，用于代词消解与 prompt 拼接。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::json;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::SessionSection;

/// 参与者最近多久内发过言算活跃
const ACTIVE_WINDOW_MINUTES: i64 = 30;
/// 话题多久后过期
const TOPIC_STALE_HOURS: i64 = 1;
const MAX_TOPICS: usize = 5;
/// 代词消解只回看最近几条
const RESOLVE_WINDOW: usize = 10;
const MAX_THEY_NAMES: usize = 3;
const PROMPT_PARTICIPANTS: usize = 5;

const PRONOUNS: &[&str] = &[
    "he", "him", "his", "she", "her", "hers", "they", "them", "their", "theirs", "it", "its",
    "this", "that", "these", "those",
];

fn mention_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<@!?(\d+)>").expect("static regex"))
}

fn quoted_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""([^"]+)""#).expect("static regex"))
}

/// 群聊参与者
#[derive(Debug, Clone, Serialize)]
pub struct Participant {
    pub user_id: String,
    pub display_name: String,
    pub last_message_at: DateTime<Utc>,
    pub message_count: u32,
}

impl Participant {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        now - self.last_message_at < Duration::minutes(ACTIVE_WINDOW_MINUTES)
    }
}

/// 会话话题
#[derive(Debug, Clone, Serialize)]
pub struct ConversationTopic {
    pub topic: String,
    pub confidence: f32,
    pub extracted_at: DateTime<Utc>,
    pub mentioned_by: Vec<String>,
}

impl ConversationTopic {
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        now - self.extracted_at > Duration::hours(TOPIC_STALE_HOURS)
    }
}

/// 缓冲区中的一条消息
#[derive(Debug, Clone, Serialize)]
pub struct MessageReference {
    pub message_id: String,
    pub author_id: String,
    pub author_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// 抽取到的实体（@提及、引号内容、首词之后的大写词）
    pub entities: Vec<String>,
}

/// 单个频道 / 子线程的群聊上下文
#[derive(Debug, Clone)]
pub struct GroupSession {
    pub channel_id: String,
    pub thread_id: Option<String>,
    max_messages: usize,
    max_participants: usize,
    participants: HashMap<String, Participant>,
    messages: Vec<MessageReference>,
    topics: Vec<ConversationTopic>,
    /// 小写实体 -> 提及它的消息 id
    entity_mentions: HashMap<String, Vec<String>>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// 会话键：`channel` 或 `channel:thread`
pub fn session_key(channel_id: &str, thread_id: Option<&str>) -> String {
    match thread_id {
        Some(t) => format!("{}:{}", channel_id, t),
        None => channel_id.to_string(),
    }
}

impl GroupSession {
    pub fn new(
        channel_id: impl Into<String>,
        thread_id: Option<String>,
        max_messages: usize,
        max_participants: usize,
    ) -> Self {
        let now = Utc::now();
        Self {
            channel_id: channel_id.into(),
            thread_id,
            max_messages: max_messages.max(1),
            max_participants: max_participants.max(1),
            participants: HashMap::new(),
            messages: Vec::new(),
            topics: Vec::new(),
            entity_mentions: HashMap::new(),
            created_at: now,
            last_activity: now,
        }
    }

    pub fn session_key(&self) -> String {
        session_key(&self.channel_id, self.thread_id.as_deref())
    }

    /// 记录一条消息；timestamp 为 None 时取当前时间
    pub fn add_message(
        &mut self,
        message_id: &str,
        author_id: &str,
        author_name: &str,
        content: &str,
        timestamp: Option<DateTime<Utc>>,
    ) {
        let timestamp = timestamp.unwrap_or_else(Utc::now);
        self.last_activity = timestamp;

        if !self.participants.contains_key(author_id)
            && self.participants.len() >= self.max_participants
        {
            let oldest = self
                .participants
                .values()
                .min_by_key(|p| p.last_message_at)
                .map(|p| p.user_id.clone());
            if let Some(id) = oldest {
                self.participants.remove(&id);
            }
        }
        let participant = self
            .participants
            .entry(author_id.to_string())
            .or_insert_with(|| Participant {
                user_id: author_id.to_string(),
                display_name: author_name.to_string(),
                last_message_at: timestamp,
                message_count: 0,
            });
        participant.display_name = author_name.to_string();
        participant.last_message_at = timestamp;
        participant.message_count += 1;

        let entities = self.extract_entities(content);
        for entity in &entities {
            self.entity_mentions
                .entry(entity.to_lowercase())
                .or_default()
                .push(message_id.to_string());
        }

        self.messages.push(MessageReference {
            message_id: message_id.to_string(),
            author_id: author_id.to_string(),
            author_name: author_name.to_string(),
            content: content.to_string(),
            timestamp,
            entities,
        });
        if self.messages.len() > self.max_messages {
            let evicted = self.messages.remove(0);
            self.forget_mentions(&evicted);
        }
    }

    fn forget_mentions(&mut self, evicted: &MessageReference) {
        for entity in &evicted.entities {
            let key = entity.to_lowercase();
            if let Some(ids) = self.entity_mentions.get_mut(&key) {
                ids.retain(|id| id != &evicted.message_id);
                if ids.is_empty() {
                    self.entity_mentions.remove(&key);
                }
            }
        }
    }

    fn extract_entities(&self, content: &str) -> Vec<String> {
        let mut entities = Vec::new();

        // <@123> / <@!123>，只认已知参与者
        for caps in mention_re().captures_iter(content) {
            if let Some(p) = self.participants.get(&caps[1]) {
                entities.push(p.display_name.clone());
            }
        }

        // 双引号内容
        for caps in quoted_re().captures_iter(content) {
            entities.push(caps[1].to_string());
        }

        // 首词之后的大写纯字母词
        for word in content.split_whitespace().skip(1) {
            let starts_upper = word.chars().next().is_some_and(char::is_uppercase);
            if starts_upper && word.chars().count() > 1 && word.chars().all(char::is_alphabetic) {
                entities.push(word.to_string());
            }
        }

        entities
    }

    /// 缓冲区中提及该实体（大小写不敏感）的消息
    pub fn messages_mentioning(&self, entity: &str) -> Vec<&MessageReference> {
        let Some(ids) = self.entity_mentions.get(&entity.to_lowercase()) else {
            return Vec::new();
        };
        self.messages
            .iter()
            .filter(|m| ids.contains(&m.message_id))
            .collect()
    }

    /// 代词 -> 指代对象
    pub fn resolve_pronouns(&self, text: &str) -> HashMap<String, String> {
        let now = Utc::now();
        let mut resolutions = HashMap::new();
        for raw in text.split_whitespace() {
            let word = raw
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase();
            if !PRONOUNS.contains(&word.as_str()) || resolutions.contains_key(&word) {
                continue;
            }
            if let Some(referent) = self.resolve_pronoun(&word, now) {
                resolutions.insert(word, referent);
            }
        }
        resolutions
    }

    fn recent_entity(&self) -> Option<String> {
        let start = self.messages.len().saturating_sub(RESOLVE_WINDOW);
        self.messages[start..]
            .iter()
            .rev()
            .find_map(|m| m.entities.first().cloned())
    }

    fn resolve_pronoun(&self, pronoun: &str, now: DateTime<Utc>) -> Option<String> {
        let last = self.messages.last()?;
        match pronoun {
            "he" | "him" | "his" => self.recent_entity().or_else(|| {
                if self.participants.len() < 2 {
                    return None;
                }
                self.active_participants_at(now)
                    .into_iter()
                    .find(|p| p.user_id != last.author_id)
                    .map(|p| p.display_name.clone())
            }),
            "she" | "her" | "hers" => self.recent_entity(),
            "it" | "this" | "that" => self
                .current_topic_at(now)
                .map(|t| t.topic.clone())
                .or_else(|| self.recent_entity()),
            "they" | "them" | "their" | "theirs" => {
                let names: Vec<String> = self
                    .active_participants_at(now)
                    .into_iter()
                    .take(MAX_THEY_NAMES)
                    .map(|p| p.display_name.clone())
                    .collect();
                (!names.is_empty()).then(|| names.join(" and "))
            }
            _ => None,
        }
    }

    pub fn set_topic(&mut self, topic: &str, confidence: f32, mentioned_by: &str) {
        self.set_topic_at(topic, confidence, mentioned_by, Utc::now());
    }

    pub fn set_topic_at(
        &mut self,
        topic: &str,
        confidence: f32,
        mentioned_by: &str,
        at: DateTime<Utc>,
    ) {
        self.topics.push(ConversationTopic {
            topic: topic.to_string(),
            confidence,
            extracted_at: at,
            mentioned_by: vec![mentioned_by.to_string()],
        });
        if self.topics.len() > MAX_TOPICS {
            self.topics.remove(0);
        }
    }

    pub fn current_topic(&self) -> Option<&ConversationTopic> {
        self.current_topic_at(Utc::now())
    }

    fn current_topic_at(&self, now: DateTime<Utc>) -> Option<&ConversationTopic> {
        self.topics.iter().rev().find(|t| !t.is_stale_at(now))
    }

    /// 30 分钟内发过言的参与者，最近活跃在前
    pub fn active_participants(&self) -> Vec<&Participant> {
        self.active_participants_at(Utc::now())
    }

    fn active_participants_at(&self, now: DateTime<Utc>) -> Vec<&Participant> {
        let mut active: Vec<&Participant> = self
            .participants
            .values()
            .filter(|p| p.is_active_at(now))
            .collect();
        active.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        active
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn context_summary(&self) -> serde_json::Value {
        let now = Utc::now();
        json!({
            "channel_id": self.channel_id,
            "thread_id": self.thread_id,
            "active_participants": self
                .active_participants_at(now)
                .iter()
                .map(|p| json!({"name": p.display_name, "messages": p.message_count}))
                .collect::<Vec<_>>(),
            "current_topic": self.current_topic_at(now).map(|t| t.topic.clone()),
            "message_count": self.messages.len(),
            "session_duration_minutes": (now - self.created_at).num_minutes(),
        })
    }

    /// 缓冲区中最近 limit 条消息（时间顺序）
    pub fn recent_messages(&self, limit: usize) -> &[MessageReference] {
        let start = self.messages.len().saturating_sub(limit);
        &self.messages[start..]
    }

    /// 最近 limit 条消息的 (作者, 内容)
    pub fn recent_context(&self, limit: usize) -> Vec<(String, String)> {
        let start = self.messages.len().saturating_sub(limit);
        self.messages[start..]
            .iter()
            .map(|m| (m.author_name.clone(), m.content.clone()))
            .collect()
    }

    pub fn format_for_prompt(&self) -> String {
        let now = Utc::now();
        let mut lines = Vec::new();
        let active = self.active_participants_at(now);
        if !active.is_empty() {
            let names: Vec<&str> = active
                .iter()
                .take(PROMPT_PARTICIPANTS)
                .map(|p| p.display_name.as_str())
                .collect();
            lines.push(format!("Active participants: {}", names.join(", ")));
        }
        if let Some(topic) = self.current_topic_at(now) {
            lines.push(format!("Current topic: {}", topic.topic));
        }
        lines.join("\n")
    }
}

/// 群聊会话缓存（按会话键）
///
/// 超时未活跃的会话在访问时被替换；start_sweeper 启动后台定期清理，回收不再有消息的频道。
pub struct GroupSessionCache {
    sessions: RwLock<HashMap<String, GroupSession>>,
    timeout: Duration,
    max_messages: usize,
    max_participants: usize,
    sweeper: Mutex<Option<CancellationToken>>,
}

impl GroupSessionCache {
    pub fn new(section: &SessionSection) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            timeout: Duration::seconds(section.timeout_secs as i64),
            max_messages: section.max_messages,
            max_participants: section.max_participants,
            sweeper: Mutex::new(None),
        }
    }

    /// 每隔 every 清理一次过期会话；重复调用会替换之前的清理任务
    pub fn start_sweeper(self: &Arc<Self>, every: std::time::Duration) {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every.max(std::time::Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                let removed = cache.cleanup_stale().await;
                if removed > 0 {
                    tracing::debug!(removed, "stale group sessions evicted");
                }
            }
            tracing::debug!("group session sweeper stopped");
        });

        let previous = self
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(cancel);
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeper
            .lock()
            .map(|s| s.is_some())
            .unwrap_or(false)
    }

    pub fn stop_sweeper(&self) {
        let token = self.sweeper.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(token) = token {
            token.cancel();
        }
    }

    fn is_stale(&self, session: &GroupSession, now: DateTime<Utc>) -> bool {
        now - session.last_activity > self.timeout
    }

    /// 获取或创建会话，返回会话键
    pub async fn get_or_create(&self, channel_id: &str, thread_id: Option<&str>) -> String {
        let key = session_key(channel_id, thread_id);
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let stale = sessions.get(&key).is_some_and(|s| self.is_stale(s, now));
        if stale {
            tracing::debug!(session = %key, "replacing stale group session");
            sessions.remove(&key);
        }
        sessions.entry(key.clone()).or_insert_with(|| {
            GroupSession::new(
                channel_id,
                thread_id.map(str::to_string),
                self.max_messages,
                self.max_participants,
            )
        });
        key
    }

    /// 在（必要时新建的）会话上执行 f
    pub async fn with_session<F, R>(&self, channel_id: &str, thread_id: Option<&str>, f: F) -> R
    where
        F: FnOnce(&mut GroupSession) -> R,
    {
        let key = self.get_or_create(channel_id, thread_id).await;
        let mut sessions = self.sessions.write().await;
        let session = sessions.entry(key).or_insert_with(|| {
            GroupSession::new(
                channel_id,
                thread_id.map(str::to_string),
                self.max_messages,
                self.max_participants,
            )
        });
        f(session)
    }

    /// 获取会话快照（不创建；过期视为不存在）
    pub async fn get(&self, channel_id: &str, thread_id: Option<&str>) -> Option<GroupSession> {
        let key = session_key(channel_id, thread_id);
        let sessions = self.sessions.read().await;
        sessions
            .get(&key)
            .filter(|s| !self.is_stale(s, Utc::now()))
            .cloned()
    }

    /// 清理过期会话，返回清理数量
    pub async fn cleanup_stale(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| !self.is_stale(s, now));
        before - sessions.len()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

impl Drop for GroupSessionCache {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> GroupSession {
        GroupSession::new("chan", None, 50, 20)
    }

    #[test]
    fn test_entities_extracted() {
        let mut s = session();
        s.add_message("1", "42", "Alice", "hello", None);
        s.add_message("2", "7", "Bob", "ping <@42> about \"Project X\" and Rust today", None);
        let last = &s.messages[1];
        assert_eq!(last.entities[0], "Alice");
        assert!(last.entities.contains(&"Project X".to_string()));
        assert!(last.entities.contains(&"Rust".to_string()));
        assert_eq!(s.messages_mentioning("rust").len(), 1);
    }

    #[test]
    fn test_first_word_not_an_entity() {
        let mut s = session();
        s.add_message("1", "1", "Alice", "Tomorrow we ship", None);
        assert!(s.messages[0].entities.is_empty());
    }

    #[test]
    fn test_ring_buffer_bounded() {
        let mut s = GroupSession::new("chan", None, 3, 20);
        for (i, name) in ["Apollo", "Borealis", "Cygnus", "Draco", "Eridanus"].iter().enumerate() {
            s.add_message(&i.to_string(), "1", "Alice", &format!("talk about {} now", name), None);
        }
        assert_eq!(s.message_count(), 3);
        assert_eq!(s.messages[0].message_id, "2");
        assert!(s.messages_mentioning("apollo").is_empty());
        assert_eq!(s.messages_mentioning("Draco").len(), 1);
    }

    #[test]
    fn test_least_recent_participant_evicted() {
        let mut s = GroupSession::new("chan", None, 50, 2);
        let base = Utc::now() - Duration::minutes(10);
        s.add_message("1", "a", "Alice", "one", Some(base));
        s.add_message("2", "b", "Bob", "two", Some(base + Duration::minutes(1)));
        s.add_message("3", "a", "Alice", "three", Some(base + Duration::minutes(2)));
        s.add_message("4", "c", "Carol", "four", Some(base + Duration::minutes(3)));
        assert_eq!(s.participant_count(), 2);
        assert!(s.participants.contains_key("a"));
        assert!(!s.participants.contains_key("b"));
    }

    #[test]
    fn test_resolve_pronouns() {
        let mut s = session();
        let base = Utc::now() - Duration::minutes(5);
        s.add_message("1", "a", "Alice", "have you met Marcus yet", Some(base));
        s.add_message("2", "b", "Bob", "is he coming to the meeting?", Some(base + Duration::minutes(1)));
        let r = s.resolve_pronouns("Is he coming? Ask them.");
        assert_eq!(r.get("he").map(String::as_str), Some("Marcus"));
        assert_eq!(r.get("them").map(String::as_str), Some("Bob and Alice"));
    }

    #[test]
    fn test_he_falls_back_to_other_participant() {
        let mut s = session();
        let base = Utc::now() - Duration::minutes(5);
        s.add_message("1", "a", "Alice", "morning", Some(base));
        s.add_message("2", "b", "Bob", "anyone around", Some(base + Duration::minutes(1)));
        let r = s.resolve_pronouns("did he leave");
        assert_eq!(r.get("he").map(String::as_str), Some("Alice"));
    }

    #[test]
    fn test_it_prefers_fresh_topic() {
        let mut s = session();
        s.add_message("1", "a", "Alice", "we should talk about Kubernetes", None);
        s.set_topic_at("the migration", 0.9, "a", Utc::now() - Duration::hours(2));
        assert_eq!(
            s.resolve_pronouns("is it done").get("it").map(String::as_str),
            Some("Kubernetes")
        );
        s.set_topic("the release", 0.8, "a");
        assert_eq!(
            s.resolve_pronouns("is it done").get("it").map(String::as_str),
            Some("the release")
        );
        assert_eq!(s.current_topic().map(|t| t.topic.as_str()), Some("the release"));
    }

    #[test]
    fn test_topics_capped() {
        let mut s = session();
        for i in 0..8 {
            s.set_topic(&format!("t{}", i), 0.5, "a");
        }
        assert_eq!(s.topics.len(), MAX_TOPICS);
        assert_eq!(s.topics[0].topic, "t3");
    }

    #[test]
    fn test_prompt_and_summary() {
        let mut s = GroupSession::new("chan", Some("th".to_string()), 50, 20);
        s.add_message("1", "a", "Alice", "hi", None);
        s.set_topic("deploys", 0.7, "a");
        assert_eq!(s.session_key(), "chan:th");
        let prompt = s.format_for_prompt();
        assert!(prompt.contains("Active participants: Alice"));
        assert!(prompt.contains("Current topic: deploys"));
        let summary = s.context_summary();
        assert_eq!(summary["message_count"], 1);
        assert_eq!(s.recent_context(10), vec![("Alice".to_string(), "hi".to_string())]);
    }

    #[tokio::test]
    async fn test_cache_keys_and_staleness() {
        let cache = GroupSessionCache::new(&SessionSection::default());
        assert_eq!(cache.get_or_create("c1", None).await, "c1");
        assert_eq!(cache.get_or_create("c1", Some("t")).await, "c1:t");
        assert_eq!(cache.len().await, 2);

        cache
            .with_session("c1", None, |s| {
                s.add_message("1", "a", "Alice", "old news", Some(Utc::now() - Duration::hours(3)));
            })
            .await;
        assert!(cache.get("c1", None).await.is_none());
        assert_eq!(cache.cleanup_stale().await, 1);

        let count = cache
            .with_session("c1", None, |s| {
                s.add_message("2", "a", "Alice", "fresh", None);
                s.message_count()
            })
            .await;
        assert_eq!(count, 1);
        assert!(cache.get("c1", None).await.is_some());
    }

    #[test]
    fn test_snapshots_serialize_with_timestamps() {
        let mut s = session();
        let at = "2026-01-02T03:04:05Z".parse::<DateTime<Utc>>().unwrap();
        s.add_message("1", "42", "Alice", "we should ship Friday", Some(at));
        s.set_topic("release", 0.9, "Alice");

        let message = serde_json::to_value(&s.recent_messages(1)[0]).unwrap();
        assert_eq!(message["timestamp"], "2026-01-02T03:04:05Z");
        assert_eq!(message["author_name"], "Alice");
        let participants: Vec<&Participant> = s.active_participants();
        let participants = serde_json::to_value(participants).unwrap();
        assert!(participants.is_array());
        let topic = serde_json::to_value(s.current_topic().unwrap()).unwrap();
        assert_eq!(topic["topic"], "release");
        assert!(topic["extracted_at"].is_string());
    }

    #[tokio::test]
    async fn test_sweeper_evicts_idle_channels() {
        let cache = Arc::new(GroupSessionCache::new(&SessionSection::default()));
        let old = Utc::now() - Duration::hours(3);
        for i in 0..50 {
            cache
                .with_session(&format!("g{}", i), None, |s| {
                    s.add_message("1", "a", "Alice", "old news", Some(old));
                })
                .await;
        }
        cache
            .with_session("live", None, |s| s.add_message("1", "a", "Alice", "still here", None))
            .await;
        assert_eq!(cache.len().await, 51);

        cache.start_sweeper(std::time::Duration::from_millis(10));
        assert!(cache.is_sweeping());
        for _ in 0..200 {
            if cache.len().await == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(cache.len().await, 1);
        assert!(cache.get("live", None).await.is_some());

        cache.stop_sweeper();
        assert!(!cache.is_sweeping());
        cache
            .with_session("idle", None, |s| s.add_message("1", "a", "Alice", "bye", Some(old)))
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(cache.len().await, 2);
    }
}
