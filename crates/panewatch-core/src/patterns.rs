//! Versioned prompt pattern sets.
//!
//! A [`PatternSet`] is compiled from TOML (see `patterns/claude-code.toml`).
//! It classifies pane text into a [`PromptKind`] and evaluates corroboration
//! rules that correct a stale status. Both operations are pure: they take
//! text and return a value, so the reconciler can run them on cached
//! snapshots without touching the multiplexer.

use crate::ansi::strip_ansi;
use crate::error::CoreError;
use crate::types::{Confidence, PromptKind, PromptOption, Question, SessionStatus};
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Compile-time embedded default pattern set.
pub const CLAUDE_CODE_TOML: &str = include_str!("../../../patterns/claude-code.toml");

// ─── TOML definitions ─────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct PatternSetDef {
    pub name: String,
    pub version: u32,
    #[serde(default)]
    pub description: String,
    pub options: OptionsDef,
    #[serde(default)]
    pub prompts: Vec<PromptRuleDef>,
    #[serde(default)]
    pub corroborate: Vec<CorroborationDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OptionsDef {
    pub pattern: String,
    #[serde(default)]
    pub checkbox: Option<String>,
    #[serde(default)]
    pub header: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptRuleKind {
    Permission,
    Question,
    PlanApproval,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptRuleDef {
    pub kind: PromptRuleKind,
    #[serde(default)]
    pub all: Vec<String>,
    #[serde(default)]
    pub any: Vec<String>,
    #[serde(default)]
    pub none: Vec<String>,
    #[serde(default = "default_prompt_tail")]
    pub tail_lines: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorroborationDef {
    pub name: String,
    pub patterns: Vec<String>,
    #[serde(default)]
    pub unless: Vec<String>,
    pub implies: SessionStatus,
    pub applies_to: Vec<SessionStatus>,
    #[serde(default)]
    pub min_quiet_ms: u64,
    #[serde(default)]
    pub confidence: Confidence,
    #[serde(default = "default_corroborate_tail")]
    pub tail_lines: usize,
}

fn default_prompt_tail() -> usize {
    30
}

fn default_corroborate_tail() -> usize {
    8
}

// ─── Compiled set ─────────────────────────────────────────────────

#[derive(Debug)]
struct PromptRule {
    kind: PromptRuleKind,
    all: Vec<Regex>,
    any: Vec<Regex>,
    none: Vec<Regex>,
    tail_lines: usize,
}

#[derive(Debug)]
struct CorroborationRule {
    name: String,
    patterns: Vec<Regex>,
    unless: Vec<Regex>,
    implies: SessionStatus,
    applies_to: Vec<SessionStatus>,
    min_quiet: Duration,
    confidence: Confidence,
    tail_lines: usize,
}

/// Result of a corroboration rule firing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Corroboration {
    pub rule: String,
    pub implies: SessionStatus,
    pub confidence: Confidence,
    /// The line that matched, trimmed.
    pub evidence: String,
}

#[derive(Debug)]
pub struct PatternSet {
    name: String,
    version: u32,
    description: String,
    option_re: Regex,
    checkbox_re: Option<Regex>,
    header_re: Option<Regex>,
    prompts: Vec<PromptRule>,
    corroborate: Vec<CorroborationRule>,
}

fn compile(pattern: &str, context: &str) -> Result<Regex, CoreError> {
    RegexBuilder::new(pattern)
        .multi_line(true)
        .build()
        .map_err(|source| CoreError::InvalidRegex {
            context: context.to_string(),
            source,
        })
}

fn compile_all(patterns: &[String], context: &str) -> Result<Vec<Regex>, CoreError> {
    patterns.iter().map(|p| compile(p, context)).collect()
}

/// Last `n` non-blank lines of `text`, leading whitespace kept.
fn tail_lines(text: &str, n: usize) -> String {
    let mut lines: Vec<&str> = text
        .lines()
        .rev()
        .filter(|l| !l.trim().is_empty())
        .take(n)
        .collect();
    lines.reverse();
    lines.join("\n")
}

impl PatternSet {
    pub fn from_def(def: PatternSetDef) -> Result<Self, CoreError> {
        let option_re = compile(&def.options.pattern, "options.pattern")?;
        let checkbox_re = def
            .options
            .checkbox
            .as_deref()
            .map(|p| compile(p, "options.checkbox"))
            .transpose()?;
        let header_re = def
            .options
            .header
            .as_deref()
            .map(|p| compile(p, "options.header"))
            .transpose()?;

        let prompts = def
            .prompts
            .iter()
            .enumerate()
            .map(|(i, r)| {
                let ctx = format!("prompts[{i}]");
                Ok(PromptRule {
                    kind: r.kind,
                    all: compile_all(&r.all, &ctx)?,
                    any: compile_all(&r.any, &ctx)?,
                    none: compile_all(&r.none, &ctx)?,
                    tail_lines: r.tail_lines.max(1),
                })
            })
            .collect::<Result<Vec<_>, CoreError>>()?;

        let corroborate = def
            .corroborate
            .iter()
            .map(|r| {
                let ctx = format!("corroborate.{}", r.name);
                Ok(CorroborationRule {
                    name: r.name.clone(),
                    patterns: compile_all(&r.patterns, &ctx)?,
                    unless: compile_all(&r.unless, &ctx)?,
                    implies: r.implies,
                    applies_to: r.applies_to.clone(),
                    min_quiet: Duration::from_millis(r.min_quiet_ms),
                    confidence: r.confidence,
                    tail_lines: r.tail_lines.max(1),
                })
            })
            .collect::<Result<Vec<_>, CoreError>>()?;

        Ok(Self {
            name: def.name,
            version: def.version,
            description: def.description,
            option_re,
            checkbox_re,
            header_re,
            prompts,
            corroborate,
        })
    }

    pub fn from_toml(s: &str) -> Result<Self, CoreError> {
        let def: PatternSetDef = toml::from_str(s)?;
        Self::from_def(def)
    }

    /// The embedded Claude Code set.
    pub fn builtin() -> Self {
        Self::from_toml(CLAUDE_CODE_TOML)
            .unwrap_or_else(|e| panic!("failed to load builtin pattern set: {e}"))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Classify pane text. ANSI sequences are stripped first.
    pub fn classify(&self, text: &str) -> PromptKind {
        let stripped = strip_ansi(text);
        for rule in &self.prompts {
            let window = tail_lines(&stripped, rule.tail_lines);
            let hit = rule.all.iter().all(|r| r.is_match(&window))
                && (rule.any.is_empty() || rule.any.iter().any(|r| r.is_match(&window)))
                && !rule.none.iter().any(|r| r.is_match(&window));
            if !hit {
                continue;
            }
            return match rule.kind {
                PromptRuleKind::Permission => PromptKind::Permission {
                    options: self.parse_options(&window).into_iter().map(|(_, o)| o).collect(),
                },
                PromptRuleKind::PlanApproval => PromptKind::PlanApproval {
                    options: self.parse_options(&window).into_iter().map(|(_, o)| o).collect(),
                },
                PromptRuleKind::Question => self.parse_question(&window),
            };
        }
        PromptKind::None
    }

    /// Evaluate corroboration rules in order. `quiet` is the time since the
    /// session last saw any activity. Returns the first rule that fires and
    /// implies a status different from `status`.
    pub fn corroborate(&self, text: &str, status: SessionStatus, quiet: Duration) -> Option<Corroboration> {
        let stripped = strip_ansi(text);
        for rule in &self.corroborate {
            if rule.implies == status || !rule.applies_to.contains(&status) || quiet < rule.min_quiet {
                continue;
            }
            let window = tail_lines(&stripped, rule.tail_lines);
            if rule.unless.iter().any(|r| r.is_match(&window)) {
                continue;
            }
            let Some(m) = rule.patterns.iter().find_map(|r| r.find(&window)) else {
                continue;
            };
            let line_start = window[..m.start()].rfind('\n').map_or(0, |i| i + 1);
            let line_end = window[m.end()..].find('\n').map_or(window.len(), |i| m.end() + i);
            return Some(Corroboration {
                rule: rule.name.clone(),
                implies: rule.implies,
                confidence: rule.confidence,
                evidence: window[line_start..line_end].trim().to_string(),
            });
        }
        None
    }

    /// Numbered options of the last contiguous list starting at `1.`.
    /// Returns (line index in `window`, option).
    fn parse_options(&self, window: &str) -> Vec<(usize, PromptOption)> {
        let mut current: Vec<(usize, PromptOption)> = Vec::new();
        let mut expected = 1u32;
        for (idx, line) in window.lines().enumerate() {
            let Some(caps) = self.option_re.captures(line) else {
                continue;
            };
            let Some(num) = caps.get(1).and_then(|m| m.as_str().parse::<u32>().ok()) else {
                continue;
            };
            let label = caps.get(2).map_or("", |m| m.as_str());
            let label = match &self.checkbox_re {
                Some(re) => re.replace(label, "").trim().to_string(),
                None => label.trim().to_string(),
            };
            if num == 1 {
                current.clear();
                expected = 1;
            }
            if num == expected {
                current.push((idx, PromptOption::new(label)));
                expected += 1;
            }
        }
        current
    }

    fn parse_question(&self, window: &str) -> PromptKind {
        let lines: Vec<&str> = window.lines().collect();
        let options = self.parse_options(window);
        let multi_select = self.checkbox_re.as_ref().is_some_and(|re| {
            options
                .iter()
                .any(|(idx, _)| lines.get(*idx).is_some_and(|l| re.is_match(l)))
        });

        let first_option = options.first().map_or(lines.len(), |(idx, _)| *idx);
        let header = self.header_re.as_ref().and_then(|re| {
            lines[..first_option]
                .iter()
                .find_map(|l| re.captures(l).and_then(|c| c.get(1)).map(|m| m.as_str().to_string()))
        });
        let question = lines[..first_option]
            .iter()
            .rev()
            .map(|l| l.trim_matches(|c: char| c.is_whitespace() || c == '│'))
            .find(|l| l.ends_with('?'))
            .unwrap_or_default()
            .to_string();

        // Indented lines directly under an option describe it.
        let mut described: Vec<PromptOption> = Vec::with_capacity(options.len());
        for (n, (idx, opt)) in options.iter().enumerate() {
            let mut opt = opt.clone();
            let next_option = options.get(n + 1).map_or(lines.len(), |(i, _)| *i);
            if let Some(desc) = lines
                .get(idx + 1..next_option)
                .and_then(|rest| rest.first())
                .filter(|l| l.starts_with("    ") && !l.contains("Enter to select"))
            {
                opt.description = Some(desc.trim().to_string());
            }
            described.push(opt);
        }

        PromptKind::Question {
            questions: vec![Question {
                header,
                question,
                options: described,
                multi_select,
            }],
            multi_select,
        }
    }
}

// ─── Registry ─────────────────────────────────────────────────────

/// Holds the active pattern set. Readers take an `Arc` snapshot, so a swap
/// never disturbs a classification in flight.
#[derive(Debug)]
pub struct PatternRegistry {
    current: RwLock<Arc<PatternSet>>,
}

impl PatternRegistry {
    pub fn new(set: PatternSet) -> Self {
        Self {
            current: RwLock::new(Arc::new(set)),
        }
    }

    pub fn builtin() -> Self {
        Self::new(PatternSet::builtin())
    }

    pub fn current(&self) -> Arc<PatternSet> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Install `set` if it has the same name and a higher version than the
    /// current one. Returns whether it was installed.
    pub fn offer(&self, set: PatternSet) -> bool {
        let mut guard = match self.current.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if set.name == guard.name && set.version > guard.version {
            *guard = Arc::new(set);
            true
        } else {
            false
        }
    }

    /// Offer every `*.toml` set in `dir`. Returns the version now active.
    pub fn load_dir(&self, dir: &Path) -> Result<u32, CoreError> {
        for set in load_sets_from_dir(dir)? {
            self.offer(set);
        }
        Ok(self.current().version())
    }
}

/// Load every `*.toml` pattern set in `dir`, sorted by file name.
pub fn load_sets_from_dir(dir: &Path) -> Result<Vec<PatternSet>, CoreError> {
    let mut paths: Vec<std::path::PathBuf> = std::fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()?;
    paths.sort();
    let mut sets = Vec::new();
    for path in paths {
        if path.extension().and_then(|e| e.to_str()) == Some("toml") {
            let content = std::fs::read_to_string(&path)?;
            sets.push(PatternSet::from_toml(&content)?);
        }
    }
    Ok(sets)
}
