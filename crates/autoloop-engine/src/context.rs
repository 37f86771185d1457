//! Context window management - append-only log, token accounting, hybrid
//! compaction, and repetition detection

use autoloop_core::{Message, Role, ToolCall};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashSet, VecDeque};
use std::hash::{Hash, Hasher};

const CHARS_PER_TOKEN: f32 = 4.0;
const MESSAGE_OVERHEAD_TOKENS: usize = 8;

/// One entry in the log. Original indices survive compaction on retained
/// messages; summary messages get fresh indices.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Entry {
    pub index: u64,
    pub tokens: usize,
    pub message: Message,
}

#[derive(Clone, Debug)]
pub struct ContextConfig {
    /// Token total that triggers compaction.
    pub max_tokens: usize,
    /// Fraction of `max_tokens` targeted after compaction.
    pub target_ratio: f32,
    /// Messages always retained at the tail.
    pub retain_tail: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: 128_000,
            target_ratio: 0.75,
            retain_tail: 10,
        }
    }
}

/// Append-only message log with an approximate token accountant.
///
/// The estimator is chars/4 (ceil) plus a fixed per-message overhead -
/// monotonic in length, which is all compaction needs.
pub struct ContextLog {
    entries: Vec<Entry>,
    next_index: u64,
    token_total: usize,
    config: ContextConfig,
    /// Index watermark at the last compaction; compaction is a no-op until
    /// another append moves past it.
    compacted_at: Option<u64>,
}

impl ContextLog {
    pub fn new(config: ContextConfig) -> Self {
        Self {
            entries: Vec::new(),
            next_index: 0,
            token_total: 0,
            config,
            compacted_at: None,
        }
    }

    pub fn estimate_tokens(text: &str) -> usize {
        (text.len() as f32 / CHARS_PER_TOKEN).ceil() as usize
    }

    pub fn message_tokens(message: &Message) -> usize {
        let mut tokens = Self::estimate_tokens(message.text());
        if let Some(calls) = &message.tool_calls {
            for call in calls {
                tokens += Self::estimate_tokens(&call.name)
                    + Self::estimate_tokens(&call.arguments.to_string());
            }
        }
        tokens + MESSAGE_OVERHEAD_TOKENS
    }

    /// O(1) append; returns the assigned index.
    pub fn append(&mut self, message: Message) -> u64 {
        let index = self.next_index;
        self.next_index += 1;
        let tokens = Self::message_tokens(&message);
        self.token_total += tokens;
        self.entries.push(Entry {
            index,
            tokens,
            message,
        });
        index
    }

    /// Snapshot view of the current sequence.
    pub fn view(&self) -> &[Entry] {
        &self.entries
    }

    pub fn messages(&self) -> Vec<Message> {
        self.entries.iter().map(|e| e.message.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn token_total(&self) -> usize {
        self.token_total
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn needs_compaction(&self) -> bool {
        self.token_total > self.config.max_tokens
    }

    /// Replace loaded state wholesale (session restore).
    pub fn replace(&mut self, entries: Vec<Entry>) {
        self.next_index = entries.iter().map(|e| e.index + 1).max().unwrap_or(0);
        self.token_total = entries.iter().map(|e| e.tokens).sum();
        self.entries = entries;
        self.compacted_at = None;
    }

    /// Hybrid compaction: keep the system prefix and the recent tail, pull
    /// tool-call/tool-result pairs into the retained set, keep the
    /// highest-relevance older groups that still fit, and fold the rest into
    /// a synthesized summary message.
    ///
    /// Idempotent until the next append. Returns true when the log changed.
    pub fn compact(&mut self) -> bool {
        if !self.needs_compaction() {
            return false;
        }
        if self.compacted_at == Some(self.next_index) {
            return false;
        }
        self.compacted_at = Some(self.next_index);

        let system_len = self
            .entries
            .iter()
            .take_while(|e| e.message.role == Role::System)
            .count();

        let mut tail_start = self
            .entries
            .len()
            .saturating_sub(self.config.retain_tail)
            .max(system_len);

        // Never begin the tail on a dangling tool result: back up until the
        // originating assistant tool-call message is inside the tail.
        while tail_start > system_len && self.entries[tail_start].message.role == Role::Tool {
            tail_start -= 1;
        }

        if tail_start <= system_len {
            return false; // nothing to fold away
        }

        // Group the middle into turn units so tool pairs never split.
        let middle: Vec<&Entry> = self.entries[system_len..tail_start].iter().collect();
        let groups = group_turns(&middle);

        // Relevance: keyword overlap of each group against the retained tail.
        let tail_keywords = keyword_set(
            self.entries[tail_start..]
                .iter()
                .map(|e| e.message.text()),
        );

        let mut scored: Vec<(usize, usize)> = groups
            .iter()
            .enumerate()
            .map(|(i, g)| (i, group_overlap(g, &tail_keywords)))
            .collect();
        // Highest overlap first; ties keep the more recent group.
        scored.sort_by(|a, b| b.1.cmp(&a.1).then(b.0.cmp(&a.0)));

        let system_tokens: usize = self.entries[..system_len].iter().map(|e| e.tokens).sum();
        let tail_tokens: usize = self.entries[tail_start..].iter().map(|e| e.tokens).sum();
        let target = (self.config.max_tokens as f32 * self.config.target_ratio) as usize;
        let mut budget = target.saturating_sub(system_tokens + tail_tokens);

        let mut keep_groups: HashSet<usize> = HashSet::new();
        for (group_idx, overlap) in &scored {
            if *overlap == 0 {
                continue;
            }
            let group_tokens: usize = groups[*group_idx].iter().map(|e| e.tokens).sum();
            if group_tokens <= budget {
                budget -= group_tokens;
                keep_groups.insert(*group_idx);
            }
        }

        // Summarize everything not kept.
        let mut dropped: Vec<&Entry> = Vec::new();
        let mut retained_middle: Vec<Entry> = Vec::new();
        for (i, group) in groups.iter().enumerate() {
            if keep_groups.contains(&i) {
                retained_middle.extend(group.iter().map(|e| (*e).clone()));
            } else {
                dropped.extend(group.iter().copied());
            }
        }

        if dropped.is_empty() {
            return false;
        }

        let summary_text = synthesize_summary(&dropped);
        let covers = dropped.len();

        let mut rebuilt: Vec<Entry> = Vec::with_capacity(
            system_len + 1 + retained_middle.len() + self.entries.len() - tail_start,
        );
        rebuilt.extend(self.entries[..system_len].iter().cloned());

        let summary_message = Message::summary(summary_text, covers);
        let summary_index = self.next_index;
        self.next_index += 1;
        let summary_tokens = Self::message_tokens(&summary_message);
        rebuilt.push(Entry {
            index: summary_index,
            tokens: summary_tokens,
            message: summary_message,
        });

        rebuilt.extend(retained_middle);
        rebuilt.extend(self.entries[tail_start..].iter().cloned());

        self.entries = rebuilt;
        self.token_total = self.entries.iter().map(|e| e.tokens).sum();
        self.compacted_at = Some(self.next_index);

        tracing::info!(
            messages = self.entries.len(),
            tokens = self.token_total,
            dropped = covers,
            "compacted context"
        );
        true
    }

    /// Invariant check used by tests: every tool-role message has its
    /// originating assistant tool-call earlier in the sequence.
    pub fn tool_pairs_intact(&self) -> bool {
        let mut known_call_ids: HashSet<&str> = HashSet::new();
        for entry in &self.entries {
            if let Some(calls) = &entry.message.tool_calls {
                for c in calls {
                    known_call_ids.insert(c.id.as_str());
                }
            }
            if entry.message.role == Role::Tool {
                match entry.message.tool_call_id.as_deref() {
                    Some(id) if known_call_ids.contains(id) => {}
                    _ => return false,
                }
            }
        }
        true
    }
}

/// Split a middle slice into turn groups: each user message opens a group;
/// assistant and tool messages stay with the group in flight.
fn group_turns<'a>(entries: &[&'a Entry]) -> Vec<Vec<&'a Entry>> {
    let mut groups: Vec<Vec<&Entry>> = Vec::new();
    for entry in entries {
        let start_new = entry.message.role == Role::User || groups.is_empty();
        if start_new && entry.message.tool_call_id.is_none() {
            groups.push(vec![entry]);
        } else if let Some(last) = groups.last_mut() {
            last.push(entry);
        } else {
            groups.push(vec![entry]);
        }
    }
    groups
}

fn keyword_set<'a>(texts: impl Iterator<Item = &'a str>) -> HashSet<String> {
    const STOP_WORDS: &[&str] = &[
        "the", "a", "an", "is", "in", "on", "to", "for", "of", "and", "or", "with", "this",
        "that", "it", "be", "as", "at", "by",
    ];
    let mut set = HashSet::new();
    for text in texts {
        for word in text.to_lowercase().split(|c: char| !c.is_alphanumeric()) {
            if word.len() > 2 && !STOP_WORDS.contains(&word) {
                set.insert(word.to_string());
            }
        }
    }
    set
}

fn group_overlap(group: &[&Entry], tail_keywords: &HashSet<String>) -> usize {
    let group_keywords = keyword_set(group.iter().map(|e| e.message.text()));
    group_keywords
        .iter()
        .filter(|w| tail_keywords.contains(*w))
        .count()
}

/// Cheap extractive summary of the dropped entries: role-tagged first lines
/// of the most recent few, deterministic for a given input.
fn synthesize_summary(dropped: &[&Entry]) -> String {
    const DETAIL_LINES: usize = 8;
    let mut lines = Vec::new();
    lines.push(format!(
        "Earlier conversation ({} messages) condensed:",
        dropped.len()
    ));
    let detail_start = dropped.len().saturating_sub(DETAIL_LINES);
    if detail_start > 0 {
        lines.push(format!("- ({} older messages elided)", detail_start));
    }
    for entry in &dropped[detail_start..] {
        let role = match entry.message.role {
            Role::System => continue,
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        let text = entry.message.text();
        let first_line = text.lines().next().unwrap_or_default();
        let clipped: String = first_line.chars().take(120).collect();
        if clipped.is_empty() {
            if let Some(calls) = &entry.message.tool_calls {
                let names: Vec<&str> = calls.iter().map(|c| c.name.as_str()).collect();
                lines.push(format!("- {} called tools: {}", role, names.join(", ")));
            }
        } else {
            lines.push(format!("- {}: {}", role, clipped));
        }
    }
    lines.join("\n")
}

/// Repetition detector over recent assistant actions.
///
/// Hashes tool name + canonicalized arguments; when the same action shows up
/// `repeat_threshold` times within the window, the turn engine injects a
/// breaker message and the supervisor counts it as no progress.
pub struct LoopSentinel {
    window: VecDeque<u64>,
    window_size: usize,
    repeat_threshold: usize,
}

impl Default for LoopSentinel {
    fn default() -> Self {
        Self::new(10, 3)
    }
}

impl LoopSentinel {
    pub fn new(window_size: usize, repeat_threshold: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size,
            repeat_threshold,
        }
    }

    /// Record an action; returns true when a repetition loop is detected.
    pub fn note_action(&mut self, call: &ToolCall) -> bool {
        let mut hasher = DefaultHasher::new();
        call.name.hash(&mut hasher);
        call.arguments.to_string().hash(&mut hasher);
        let digest = hasher.finish();

        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(digest);

        self.window.iter().filter(|h| **h == digest).count() >= self.repeat_threshold
    }

    pub fn reset(&mut self) {
        self.window.clear();
    }
}
