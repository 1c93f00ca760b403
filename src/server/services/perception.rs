use std::sync::Arc;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::warn;

use crate::server::content::ContentCatalog;
use crate::server::services::gateway::ChatMessage;
use crate::server::services::ollama::OllamaService;

/// How many trailing history entries the complexity prompt sees.
const COMPLEXITY_CONTEXT: usize = 6;
/// Above this many characters a turn is heuristically complex.
const LONG_TURN_CHARS: usize = 100;
/// Above this many history entries a conversation is heuristically complex.
const LONG_HISTORY_LEN: usize = 16;

const AFFIRMATIVE: &str = "是";
const SEPARATOR: char = '|';

/// Outcome of the three per-turn checks. The short-circuit contract:
/// a crisis turn is always privacy-positive and never complexity-checked;
/// a privacy-positive turn skips complexity analysis entirely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerceptionResult {
    pub is_crisis: bool,
    pub is_privacy_issue: bool,
    pub is_complex_issue: bool,
    pub privacy_reason: String,
    pub complexity_reason: String,
}

pub struct PerceptionService {
    classifier: Arc<OllamaService>,
    catalog: Arc<ContentCatalog>,
    phone_pattern: Regex,
    national_id_pattern: Regex,
}

impl PerceptionService {
    pub fn new(classifier: Arc<OllamaService>, catalog: Arc<ContentCatalog>) -> Result<Self> {
        Ok(Self {
            classifier,
            catalog,
            phone_pattern: Regex::new(r"\d{11}").context("phone pattern")?,
            national_id_pattern: Regex::new(r"\d{17}[\dxX]").context("national id pattern")?,
        })
    }

    /// Deterministic keyword scan. No model call, cannot fail; this is the
    /// one check guaranteed to run even with every model down.
    pub fn detect_crisis(&self, user_input: &str) -> bool {
        let input = user_input.to_lowercase();
        self.catalog
            .crisis_keywords
            .iter()
            .any(|keyword| input.contains(keyword.as_str()))
    }

    pub async fn execute(&self, user_input: &str, history: &[ChatMessage]) -> PerceptionResult {
        if self.detect_crisis(user_input) {
            // Crisis turns are forced privacy-positive so they can never
            // route to the remote backend.
            return PerceptionResult {
                is_crisis: true,
                is_privacy_issue: true,
                is_complex_issue: false,
                privacy_reason: "危机情况".to_string(),
                complexity_reason: String::new(),
            };
        }

        let (is_privacy_issue, privacy_reason) = self.detect_privacy(user_input).await;

        let (is_complex_issue, complexity_reason) = if is_privacy_issue {
            (false, "隐私问题无需复杂度分析".to_string())
        } else {
            self.analyze_complexity(user_input, history).await
        };

        PerceptionResult {
            is_crisis: false,
            is_privacy_issue,
            is_complex_issue,
            privacy_reason,
            complexity_reason,
        }
    }

    async fn detect_privacy(&self, user_input: &str) -> (bool, String) {
        let prompt = self
            .catalog
            .privacy_instruction
            .replace("{user_input}", user_input);

        match self.classifier.complete(&prompt, 0.1).await {
            Ok(raw) => parse_verdict(&raw),
            Err(e) => {
                warn!("privacy classifier unavailable, using keyword fallback: {e:#}");
                self.fallback_privacy(user_input)
            }
        }
    }

    fn fallback_privacy(&self, user_input: &str) -> (bool, String) {
        let input = user_input.to_lowercase();
        for keyword in &self.catalog.privacy_keywords {
            if input.contains(keyword.as_str()) {
                return (true, format!("包含隐私关键词: {keyword}"));
            }
        }
        if self.phone_pattern.is_match(user_input) {
            return (true, "包含疑似手机号".to_string());
        }
        if self.national_id_pattern.is_match(user_input) {
            return (true, "包含疑似身份证号".to_string());
        }
        (false, "未检测到隐私信息".to_string())
    }

    async fn analyze_complexity(
        &self,
        user_input: &str,
        history: &[ChatMessage],
    ) -> (bool, String) {
        let recent = &history[history.len().saturating_sub(COMPLEXITY_CONTEXT)..];
        let history_text = recent
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = self
            .catalog
            .complexity_instruction
            .replace("{history}", &history_text)
            .replace("{user_input}", user_input);

        match self.classifier.complete(&prompt, 0.1).await {
            Ok(raw) => parse_verdict(&raw),
            Err(e) => {
                warn!("complexity classifier unavailable, using rule fallback: {e:#}");
                self.fallback_complexity(user_input, history)
            }
        }
    }

    fn fallback_complexity(&self, user_input: &str, history: &[ChatMessage]) -> (bool, String) {
        let input = user_input.to_lowercase();
        for keyword in &self.catalog.complexity_keywords {
            if input.contains(keyword.as_str()) {
                return (true, format!("包含复杂度关键词: {keyword}"));
            }
        }
        if user_input.chars().count() > LONG_TURN_CHARS {
            return (true, "问题描述较长".to_string());
        }
        if history.len() > LONG_HISTORY_LEN {
            return (true, "对话轮次较多".to_string());
        }
        (false, "问题相对简单".to_string())
    }
}

/// Parse a `是/否|理由` classifier answer. With a separator, the verdict is
/// the trimmed first segment compared against the affirmative token. Without
/// one, the verdict is whether the affirmative token occurs in the first five
/// characters, and the first twenty characters stand in for the reason.
fn parse_verdict(raw: &str) -> (bool, String) {
    let raw = raw.trim();
    if let Some((decision, reason)) = raw.split_once(SEPARATOR) {
        (decision.trim() == AFFIRMATIVE, reason.trim().to_string())
    } else {
        let head: String = raw.chars().take(5).collect();
        let reason: String = raw.chars().take(20).collect();
        (head.contains(AFFIRMATIVE), reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> PerceptionService {
        let catalog = Arc::new(ContentCatalog::default());
        let classifier = Arc::new(OllamaService::new("http://127.0.0.1:9", "test-model"));
        PerceptionService::new(classifier, catalog).expect("service")
    }

    #[test]
    fn parses_separated_verdict() {
        assert_eq!(
            parse_verdict("是|涉及恋爱关系隐私"),
            (true, "涉及恋爱关系隐私".to_string())
        );
        assert_eq!(
            parse_verdict(" 否 | 普通情绪表达 "),
            (false, "普通情绪表达".to_string())
        );
    }

    #[test]
    fn parses_unseparated_verdict_from_prefix() {
        let (verdict, reason) = parse_verdict("是的，这涉及用户的家庭隐私，应当保密处理");
        assert!(verdict);
        assert_eq!(reason.chars().count(), 20);

        let (verdict, _) = parse_verdict("否。普通的问候");
        assert!(!verdict);

        // The prefix scan is a plain substring check, so a 是 embedded in
        // another word within the first five characters still counts.
        let (verdict, _) = parse_verdict("否。这只是一句普通的问候");
        assert!(verdict);
    }

    #[test]
    fn detects_crisis_keywords() {
        let service = service();
        assert!(service.detect_crisis("我想自杀"));
        assert!(service.detect_crisis("最近觉得活不下去了"));
        assert!(!service.detect_crisis("我今天很难过"));
    }

    #[test]
    fn privacy_fallback_matches_keywords_and_patterns() {
        let service = service();
        let (hit, reason) = service.fallback_privacy("我男朋友劈腿了");
        assert!(hit);
        assert!(reason.contains("男朋友"));

        let (hit, reason) = service.fallback_privacy("我的号码是13812345678");
        assert!(hit);
        assert_eq!(reason, "包含疑似手机号");

        let (hit, _) = service.fallback_privacy("今天天气不错");
        assert!(!hit);
    }

    #[test]
    fn complexity_fallback_checks_keywords_length_and_history() {
        let service = service();

        let (hit, reason) = service.fallback_complexity("帮我制定一个计划", &[]);
        assert!(hit);
        assert!(reason.contains("计划"));

        let long_turn = "难".repeat(101);
        let (hit, reason) = service.fallback_complexity(&long_turn, &[]);
        assert!(hit);
        assert_eq!(reason, "问题描述较长");

        let history: Vec<ChatMessage> = (0..17)
            .map(|i| ChatMessage::new("user", format!("消息{i}")))
            .collect();
        let (hit, reason) = service.fallback_complexity("嗯", &history);
        assert!(hit);
        assert_eq!(reason, "对话轮次较多");

        let (hit, _) = service.fallback_complexity("嗯", &[]);
        assert!(!hit);
    }
}
