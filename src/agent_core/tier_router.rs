//! Tier routing.
//!
//! Scores a prompt in `[0, 1]` from three weighted signals (expected tool
//! count, prompt complexity, recent trajectory), applies soft boosts, and
//! maps the score onto a model tier. Everything here is a pure function of
//! the prompt and the options passed in.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use super::live_data::prompt_words;
use super::session::TRAJECTORY_CAPACITY;
use super::types::{Tier, TrajectoryEntry};
use crate::config::TierConfig;

// ─── Weights ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyWeights {
    pub tool_count: f64,
    pub prompt_complexity: f64,
    pub trajectory: f64,
}

impl StrategyWeights {
    pub fn sum(&self) -> f64 {
        self.tool_count + self.prompt_complexity + self.trajectory
    }
}

pub const STRATEGY_WEIGHTS: StrategyWeights = StrategyWeights {
    tool_count: 0.40,
    prompt_complexity: 0.35,
    trajectory: 0.25,
};

/// Minimum title-word overlap for a skill to match a prompt.
const SKILL_MATCH_OVERLAP: f64 = 0.5;

const SKILL_BOOST_THREE_TOOLS: f64 = 0.20;
const SKILL_BOOST_FOUR_TOOLS: f64 = 0.25;
const DIRECT_MCP_BOOST: f64 = 0.08;
const SESSION_LOCAL_MCP_BOOST: f64 = 0.15;

/// Trajectory score at which a complex follow-up is held at the power tier.
const FOLLOWUP_FLOOR_TRAJECTORY: f64 = 0.4;
const FOLLOWUP_MAX_WORDS: usize = 12;

/// Per-turn decay applied to older trajectory entries.
const RECENCY_DECAY: f64 = 0.75;

const COMPLEXITY_DIVISOR: f64 = 10.0;
const TRAJECTORY_DIVISOR: f64 = 8.0;

// ─── Keyword Tables ─────────────────────────────────────────────────────────

/// Keyword groups and the tools a match usually costs.
const TOOL_KEYWORDS: &[(&[&str], u32)] = &[
    (&["email", "emails", "inbox", "mail", "gmail"], 1),
    (&["calendar", "meeting", "meetings", "event", "events", "schedule"], 1),
    (&["issue", "issues", "ticket", "tickets", "github", "linear", "jira", "pr", "prs"], 1),
    (&["slack", "message", "messages", "channel", "dm", "dms"], 1),
    (&["search", "find", "lookup"], 1),
    (&["page", "pages", "block", "blocks", "graph", "note", "notes"], 1),
    (&["create", "add", "write", "update", "move", "send", "reply"], 1),
    (&["every", "all", "each", "across"], 2),
    (&["report", "summary", "digest", "briefing", "overview"], 2),
];

const TEMPORAL: &[&str] = &[
    "yesterday", "today", "tomorrow", "last week", "this week", "next week", "last month",
    "this month", "last quarter", "this quarter", "since", "between", "until", "deadline",
];
const DELIBERATION: &[&str] = &[
    "should i", "should we", "trade off", "tradeoff", "pros and cons", "decide", "weigh",
    "recommend", "best option", "worth it",
];
const COMPARISON: &[&str] = &[
    "compare", "comparison", "versus", "vs", "difference between", "better than", "contrast",
];
const CONDITIONAL: &[&str] = &["if", "unless", "otherwise", "in case", "whether"];
const MULTI_STEP: &[&str] = &["then", "after that", "and then", "finally", "first", "next", "afterwards"];
const AMBIGUITY: &[&str] = &["something", "somehow", "stuff", "whatever", "figure out", "not sure"];
const SYNTHESIS: &[&str] = &[
    "summarise", "summarize", "synthesise", "synthesize", "review", "recap", "digest", "overview",
];
const PLANNING: &[&str] = &["plan", "planning", "roadmap", "strategy", "prioritise", "prioritize", "schedule"];
const COMPOSITION: &[&str] = &["write", "draft", "compose", "outline", "report"];
const EXPLICIT_DEPTH: &[&str] = &[
    "in depth", "deep dive", "thorough", "thoroughly", "comprehensive", "detailed", "exhaustive",
];

/// Verbs asking to act on something already gathered.
const WRITE_INTENT: &[&str] = &[
    "apply", "update", "create", "write", "add", "send", "draft", "save", "post", "move", "change",
    "fix", "make", "execute", "publish", "go ahead", "do it",
];

/// Prompts made only of these words are acknowledgements, not follow-ups.
const ACKNOWLEDGEMENTS: &[&str] = &[
    "thanks", "thank", "you", "thx", "ty", "ok", "okay", "cool", "great", "nice", "perfect", "got",
    "it", "awesome", "good", "sounds",
];

const TITLE_STOPWORDS: &[&str] = &["the", "and", "for", "my", "with", "from", "your"];

static PAGE_REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\[([^\]]+)\]\]").expect("valid page ref regex"));
static TAG_OR_MENTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|\s)[#@]([\w-]+)").expect("valid tag regex"));

// ─── Skills ─────────────────────────────────────────────────────────────────

/// A skill the user has written down, with the sources it pulls from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkillEntry {
    pub title: String,
    pub sources: Vec<String>,
}

impl SkillEntry {
    pub fn estimated_tools(&self) -> u32 {
        u32::try_from(self.sources.len()).unwrap_or(u32::MAX).max(1)
    }
}

/// Parse skill blocks: an unindented title line followed by a `Sources:`
/// line, either comma-separated or with the sources as nested bullets.
///
/// ```text
/// - Weekly Review
///   - Sources: [[Calendar]], Gmail, GitHub
///   - Summarise the week.
/// ```
pub fn parse_skill_entries(text: &str) -> Vec<SkillEntry> {
    let mut skills: Vec<SkillEntry> = Vec::new();
    let mut sources_indent: Option<usize> = None;

    for line in text.lines() {
        let indent = line.len() - line.trim_start().len();
        let content = strip_markup(line.trim());
        if content.is_empty() {
            continue;
        }

        if let Some(rest) = sources_label(content) {
            sources_indent = None;
            let Some(skill) = skills.last_mut() else { continue };
            if rest.trim().is_empty() {
                sources_indent = Some(indent);
            } else {
                skill.sources.extend(rest.split(',').filter_map(clean_source));
            }
            continue;
        }

        if let Some(parent) = sources_indent {
            if indent > parent {
                if let (Some(skill), Some(source)) = (skills.last_mut(), clean_source(content)) {
                    skill.sources.push(source);
                }
                continue;
            }
            sources_indent = None;
        }

        if indent == 0 {
            skills.push(SkillEntry {
                title: content.to_string(),
                sources: Vec::new(),
            });
        }
    }

    skills
}

fn strip_markup(line: &str) -> &str {
    line.trim_start_matches(['-', '*', '#', ' '])
        .trim_matches('*')
        .trim()
}

fn sources_label(content: &str) -> Option<&str> {
    let lower = content.to_lowercase();
    ["sources:", "sources::", "tools:"]
        .iter()
        .filter(|label| lower.starts_with(*label))
        .filter_map(|label| content.get(label.len()..))
        .last()
}

fn clean_source(raw: &str) -> Option<String> {
    let s = raw
        .trim()
        .trim_start_matches(['-', '*', ' '])
        .trim_start_matches("[[")
        .trim_end_matches("]]")
        .trim_start_matches('#')
        .trim_end_matches('.')
        .trim();
    (!s.is_empty()).then(|| s.to_string())
}

fn title_words(title: &str) -> Vec<String> {
    prompt_words(title)
        .into_iter()
        .filter(|w| w.chars().count() > 2 && !TITLE_STOPWORDS.contains(&w.as_str()))
        .collect()
}

/// The skill with the highest title-word overlap at or above the threshold.
fn match_skill<'a>(words: &[String], skills: &'a [SkillEntry]) -> Option<&'a SkillEntry> {
    let mut best: Option<(&SkillEntry, f64, usize)> = None;
    for skill in skills {
        let title = title_words(&skill.title);
        if title.is_empty() {
            continue;
        }
        let hits = title.iter().filter(|t| words.contains(t)).count();
        let overlap = hits as f64 / title.len() as f64;
        if overlap < SKILL_MATCH_OVERLAP {
            continue;
        }
        let better = match best {
            None => true,
            Some((_, o, h)) => overlap > o || (overlap == o && hits > h),
        };
        if better {
            best = Some((skill, overlap, hits));
        }
    }
    best.map(|(skill, _, _)| skill)
}

// ─── Sub-scores ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCountScore {
    pub score: f64,
    pub estimated_tools: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_skill: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SubScore {
    pub score: f64,
    pub signals: Vec<String>,
}

/// Expected tool count, from a matching skill or from keyword groups.
pub fn score_tool_count(prompt: &str, skills: &[SkillEntry]) -> ToolCountScore {
    let words = prompt_words(prompt);

    if let Some(skill) = match_skill(&words, skills) {
        let estimated = skill.estimated_tools();
        return ToolCountScore {
            score: tool_count_to_score(estimated),
            estimated_tools: estimated,
            matched_skill: Some(skill.title.clone()),
        };
    }

    let estimated: u32 = TOOL_KEYWORDS
        .iter()
        .filter(|(keywords, _)| words.iter().any(|w| keywords.contains(&w.as_str())))
        .map(|(_, count)| count)
        .sum();
    ToolCountScore {
        score: tool_count_to_score(estimated),
        estimated_tools: estimated,
        matched_skill: None,
    }
}

/// 0 → 0.0, 1–2 → 0.1–0.3, 3–5 → 0.4–0.6, 6+ → 0.7 rising to 1.0.
fn tool_count_to_score(count: u32) -> f64 {
    let n = f64::from(count);
    match count {
        0 => 0.0,
        1..=2 => 0.1 + 0.2 * (n - 1.0),
        3..=5 => 0.3 + 0.1 * (n - 2.0),
        _ => (0.6 + 0.1 * (n - 5.0)).min(1.0),
    }
}

pub fn score_prompt_complexity(prompt: &str) -> SubScore {
    let words = prompt_words(prompt);
    let text = padded(&words);
    let mut raw = 0.0;
    let mut signals = Vec::new();
    let mut add = |hit: bool, weight: f64, name: &str| {
        if hit {
            raw += weight;
            signals.push(name.to_string());
        }
    };

    let word_count = words.len();
    add(word_count > 50, 3.0, "very_long_prompt");
    add((26..=50).contains(&word_count), 2.0, "long_prompt");
    add((13..=25).contains(&word_count), 1.0, "medium_prompt");

    let entities = count_entities(prompt);
    add(entities >= 4, 2.0, "many_entities");
    add((2..4).contains(&entities), 1.0, "multi_entity");

    let comparison = has_phrase(&text, COMPARISON);
    add(has_phrase(&text, TEMPORAL), 1.0, "temporal");
    add(has_phrase(&text, DELIBERATION), 1.5, "deliberation");
    add(comparison, 1.5, "comparison");
    add(has_phrase(&text, CONDITIONAL), 1.0, "conditional");
    add(has_phrase(&text, MULTI_STEP), 1.5, "multi_step");
    add(has_phrase(&text, AMBIGUITY), 0.5, "ambiguity");
    add(has_phrase(&text, SYNTHESIS), 1.0, "synthesis");
    add(has_phrase(&text, PLANNING), 1.0, "planning");
    add(has_phrase(&text, COMPOSITION), 1.0, "composition");
    add(has_phrase(&text, EXPLICIT_DEPTH), 2.0, "explicit_depth");
    add(entities >= 2 && comparison, 1.5, "multi_entity_comparison");

    SubScore {
        score: (raw / COMPLEXITY_DIVISOR).clamp(0.0, 1.0),
        signals,
    }
}

/// Recency-weighted view of the last turns plus follow-up detection.
pub fn score_trajectory(prompt: &str, trajectory: &[TrajectoryEntry]) -> SubScore {
    let recent = &trajectory[trajectory.len().saturating_sub(TRAJECTORY_CAPACITY)..];
    let Some(last) = recent.last() else {
        return SubScore::default();
    };

    let mut weight = 1.0;
    let (mut total_weight, mut tools, mut iterations, mut escalations) = (0.0, 0.0, 0.0, 0.0);
    for entry in recent.iter().rev() {
        total_weight += weight;
        tools += weight * f64::from(entry.tool_count);
        // Iterations without a single successful tool are guard retries.
        let effective = if entry.successful_unique_tool_count > 0 {
            entry.iterations
        } else {
            entry.iterations.min(1)
        };
        iterations += weight * f64::from(effective);
        if entry.escalated || entry.tier != Tier::Mini {
            escalations += weight;
        }
        weight *= RECENCY_DECAY;
    }
    let avg_tools = tools / total_weight;
    let avg_iterations = iterations / total_weight;

    let words = prompt_words(prompt);
    let text = padded(&words);
    let mut raw = 0.0;
    let mut signals = Vec::new();
    let mut add = |hit: bool, weight: f64, name: &str| {
        if hit {
            raw += weight;
            signals.push(name.to_string());
        }
    };

    add(avg_tools >= 6.0, 2.0, "heavy_tool_history");
    add((3.0..6.0).contains(&avg_tools), 1.0, "tool_history");
    add(avg_iterations >= 6.0, 2.0, "long_iterations");
    add((3.0..6.0).contains(&avg_iterations), 1.0, "iterations");
    add(escalations >= 2.0, 2.0, "repeated_escalation");
    add((1.0..2.0).contains(&escalations), 1.0, "escalation");

    let short = !words.is_empty() && words.len() <= FOLLOWUP_MAX_WORDS;
    let acknowledgement = words.iter().all(|w| ACKNOWLEDGEMENTS.contains(&w.as_str()));
    add(
        short && !acknowledgement && is_genuinely_complex(last),
        2.0,
        "complex_followup",
    );
    add(
        last.tool_count >= 3 && has_phrase(&text, WRITE_INTENT),
        1.0,
        "write_after_gather",
    );

    SubScore {
        score: (raw / TRAJECTORY_DIVISOR).clamp(0.0, 1.0),
        signals,
    }
}

fn is_genuinely_complex(turn: &TrajectoryEntry) -> bool {
    (turn.tool_count >= 4 && turn.successful_unique_tool_count >= 2)
        || (turn.iterations >= 3 && turn.tool_count >= 2 && turn.successful_unique_tool_count >= 2)
        || turn.tier != Tier::Mini
}

fn padded(words: &[String]) -> String {
    format!(" {} ", words.join(" "))
}

/// Whole-word phrase match against a padded word string.
fn has_phrase(padded_text: &str, phrases: &[&str]) -> bool {
    phrases.iter().any(|p| padded_text.contains(&format!(" {p} ")))
}

/// Distinct page refs, tags, mentions and mid-sentence capitalised words.
fn count_entities(prompt: &str) -> usize {
    let mut entities: BTreeSet<String> = BTreeSet::new();
    for cap in PAGE_REF_RE.captures_iter(prompt) {
        entities.insert(cap[1].trim().to_lowercase());
    }
    for cap in TAG_OR_MENTION_RE.captures_iter(prompt) {
        entities.insert(cap[1].to_lowercase());
    }

    let without_refs = PAGE_REF_RE.replace_all(prompt, " ");
    let mut sentence_start = true;
    for token in without_refs.split_whitespace() {
        let word = token.trim_matches(|c: char| !c.is_alphanumeric());
        let capitalised = word.chars().next().is_some_and(char::is_uppercase);
        if capitalised && !sentence_start && word != "I" && !token.starts_with(['#', '@']) {
            entities.insert(word.to_lowercase());
        }
        sentence_start = token.ends_with(['.', '!', '?', ':']);
    }
    entities.len()
}

// ─── Routing ────────────────────────────────────────────────────────────────

/// Inputs beyond the prompt itself.
#[derive(Debug, Clone, Default)]
pub struct RoutingOptions {
    pub skills: Vec<SkillEntry>,
    pub session_trajectory: Vec<TrajectoryEntry>,
    pub mentions_direct_mcp_server: bool,
    pub session_used_local_mcp: bool,
    pub ludicrous_enabled: bool,
    pub thresholds: TierConfig,
    pub live_data_read: bool,
}

impl RoutingOptions {
    pub fn from_config(thresholds: &TierConfig) -> Self {
        Self {
            ludicrous_enabled: thresholds.ludicrous_enabled,
            thresholds: *thresholds,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreBreakdown {
    pub tool_count: f64,
    pub prompt_complexity: f64,
    pub trajectory: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingDecision {
    pub score: f64,
    pub tier: Tier,
    pub breakdown: ScoreBreakdown,
    pub signals: Vec<String>,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_skill: Option<String>,
    pub estimated_tools: u32,
}

pub fn compute_routing_score(prompt: &str, options: &RoutingOptions) -> RoutingDecision {
    let thresholds = &options.thresholds;
    let tools = score_tool_count(prompt, &options.skills);
    let complexity = score_prompt_complexity(prompt);
    let trajectory = score_trajectory(prompt, &options.session_trajectory);

    let breakdown = ScoreBreakdown {
        tool_count: tools.score,
        prompt_complexity: complexity.score,
        trajectory: trajectory.score,
    };
    let mut score = STRATEGY_WEIGHTS.tool_count * breakdown.tool_count
        + STRATEGY_WEIGHTS.prompt_complexity * breakdown.prompt_complexity
        + STRATEGY_WEIGHTS.trajectory * breakdown.trajectory;

    let mut signals: Vec<String> = Vec::new();
    signals.extend(complexity.signals);
    signals.extend(trajectory.signals);

    if tools.matched_skill.is_some() {
        signals.push("skill_match".to_string());
        let boost = match tools.estimated_tools {
            n if n >= 4 => SKILL_BOOST_FOUR_TOOLS,
            3 => SKILL_BOOST_THREE_TOOLS,
            _ => 0.0,
        };
        score = (score + boost).min(1.0);
    }
    if options.mentions_direct_mcp_server {
        signals.push("direct_mcp_server".to_string());
        score = (score + DIRECT_MCP_BOOST).min(1.0);
    }
    if options.session_used_local_mcp {
        signals.push("session_local_mcp".to_string());
        score = (score + SESSION_LOCAL_MCP_BOOST).min(1.0);
    }
    if options.live_data_read {
        signals.push("live_data_read".to_string());
    }

    let followup_floor = signals.iter().any(|s| s == "complex_followup")
        && breakdown.trajectory >= FOLLOWUP_FLOOR_TRAJECTORY;
    if followup_floor && score < thresholds.power_threshold {
        score = thresholds.power_threshold;
        signals.push("followup_floor".to_string());
    }
    let score = score.clamp(0.0, 1.0);

    let (tier, reason) = if options.ludicrous_enabled && score >= thresholds.ludicrous_threshold {
        match &tools.matched_skill {
            Some(skill) => {
                signals.push("skill_ceiling".to_string());
                (
                    Tier::Power,
                    format!("score {score:.2} capped at power by skill '{skill}'"),
                )
            }
            None => (Tier::Ludicrous, format!("score {score:.2} reached ludicrous threshold")),
        }
    } else if score >= thresholds.power_threshold {
        let why = match (&tools.matched_skill, followup_floor) {
            (Some(skill), _) => format!("skill '{skill}' needs ~{} tools", tools.estimated_tools),
            (None, true) => "complex follow-up".to_string(),
            (None, false) => "score reached power threshold".to_string(),
        };
        (Tier::Power, format!("score {score:.2}: {why}"))
    } else {
        (Tier::Mini, format!("score {score:.2} below power threshold"))
    };

    tracing::info!(tier = %tier, score, estimated_tools = tools.estimated_tools, "tier selected");

    RoutingDecision {
        score,
        tier,
        breakdown,
        signals,
        reason,
        matched_skill: tools.matched_skill,
        estimated_tools: tools.estimated_tools,
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
