//! Versioned detector rulesets.
//!
//! A rulepack is a YAML bundle of term templates, lemma forms, target
//! aliases, severity floors and zone adjustments. Packs are compiled once
//! into regexes and lookup tables; the detector never touches YAML at scan
//! time. A starter pack ships with the binary so detection works without
//! any external files.

use std::collections::{BTreeMap, HashMap};

use regex::Regex;
use serde::Deserialize;

use crate::error::RulepackError;

/// Ruleset bundled into the binary.
const BUNDLED_PACK: &str = include_str!("packs/default.yaml");

/// Hit category, ordered by how specifically the anger is aimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    BotRage,
    ToolingRage,
    LangRage,
    SelfOwn,
    Generic,
}

impl Category {
    /// Unknown pack categories coerce to `generic` rather than failing the
    /// whole pack load.
    pub fn parse(raw: &str) -> Category {
        match raw {
            "bot_rage" => Category::BotRage,
            "tooling_rage" => Category::ToolingRage,
            "lang_rage" => Category::LangRage,
            "self_own" => Category::SelfOwn,
            _ => Category::Generic,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Category::BotRage => "bot_rage",
            Category::ToolingRage => "tooling_rage",
            Category::LangRage => "lang_rage",
            Category::SelfOwn => "self_own",
            Category::Generic => "generic",
        }
    }

    /// Ranking used to break ties between matches of the same term and span:
    /// `bot_rage > tooling_rage > lang_rage > self_own > generic`.
    pub fn rank(self) -> u8 {
        match self {
            Category::BotRage => 4,
            Category::ToolingRage => 3,
            Category::LangRage => 2,
            Category::SelfOwn => 1,
            Category::Generic => 0,
        }
    }
}

/// What a target alias points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetType {
    Bot,
    Tool,
    Lang,
    Framework,
}

impl TargetType {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetType::Bot => "bot",
            TargetType::Tool => "tool",
            TargetType::Lang => "lang",
            TargetType::Framework => "framework",
        }
    }
}

/// Severity deltas applied inside context zones. Negative values soften.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ZoneAdjust {
    pub code_fence: i32,
    pub inline_code: i32,
    pub quote: i32,
}

impl Default for ZoneAdjust {
    fn default() -> Self {
        Self {
            code_fence: -1,
            inline_code: -1,
            quote: -1,
        }
    }
}

/// A compiled template rule.
#[derive(Debug)]
pub struct TemplateRule {
    pub term: String,
    pub regex: Regex,
    pub category: Category,
    pub severity: i32,
}

/// A compiled lemma rule; matched per token.
#[derive(Debug, Clone)]
pub struct LemmaRule {
    pub term: String,
    pub category: Category,
    pub severity: i32,
}

/// A single alias string pointing at a canonical target.
#[derive(Debug, Clone)]
pub struct TargetAlias {
    pub alias: String,
    pub id: String,
    pub ttype: TargetType,
}

#[derive(Debug, Deserialize)]
struct RawRulepack {
    version: i32,
    #[serde(default)]
    min_severity: i32,
    #[serde(default = "default_context_window")]
    context_window: usize,
    #[serde(default)]
    zones: ZoneAdjust,
    /// Per-category severity floors; rule severities below a floor are lifted.
    #[serde(default)]
    floors: BTreeMap<String, i32>,
    templates: Vec<RawTemplate>,
    #[serde(default)]
    lemmas: Vec<RawLemma>,
    #[serde(default)]
    targets: RawTargets,
}

#[derive(Debug, Deserialize)]
struct RawTemplate {
    term: String,
    #[serde(default)]
    pattern: Option<String>,
    category: String,
    severity: i32,
}

#[derive(Debug, Deserialize)]
struct RawLemma {
    term: String,
    forms: Vec<String>,
    category: String,
    severity: i32,
}

#[derive(Debug, Default, Deserialize)]
struct RawTargets {
    #[serde(default)]
    bots: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    tools: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    langs: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    frameworks: BTreeMap<String, Vec<String>>,
}

fn default_context_window() -> usize {
    64
}

/// A compiled, immutable ruleset.
#[derive(Debug)]
pub struct Rulepack {
    pub version: i32,
    pub min_severity: i32,
    pub context_window: usize,
    pub zone_adjust: ZoneAdjust,
    pub templates: Vec<TemplateRule>,
    /// Inflected form → rule.
    pub lemmas: HashMap<String, LemmaRule>,
    /// Alias strings, longest first so the most specific alias wins a span.
    pub targets: Vec<TargetAlias>,
}

impl Rulepack {
    /// Compiles a pack from its YAML source.
    pub fn from_yaml(source: &str) -> Result<Self, RulepackError> {
        let raw: RawRulepack = serde_yaml::from_str(source)?;
        if raw.version < 1 {
            return Err(RulepackError::Invalid(format!(
                "version must be >= 1, got {}",
                raw.version
            )));
        }
        if raw.templates.is_empty() && raw.lemmas.is_empty() {
            return Err(RulepackError::Invalid(
                "pack has neither templates nor lemmas".to_string(),
            ));
        }

        let floor = |category: Category| {
            raw.floors
                .get(category.as_str())
                .copied()
                .unwrap_or(i32::MIN)
        };

        let mut templates = Vec::with_capacity(raw.templates.len());
        for template in &raw.templates {
            let category = Category::parse(&template.category);
            let pattern = match &template.pattern {
                Some(custom) => custom.clone(),
                None => format!(r"\b{}\b", regex::escape(&template.term)),
            };
            let regex = Regex::new(&pattern).map_err(|e| RulepackError::InvalidPattern {
                pattern: pattern.clone(),
                message: e.to_string(),
            })?;
            templates.push(TemplateRule {
                term: template.term.clone(),
                regex,
                category,
                severity: template.severity.max(floor(category)),
            });
        }

        let mut lemmas = HashMap::new();
        for lemma in &raw.lemmas {
            let category = Category::parse(&lemma.category);
            let rule = LemmaRule {
                term: lemma.term.clone(),
                category,
                severity: lemma.severity.max(floor(category)),
            };
            for form in &lemma.forms {
                lemmas.insert(form.to_lowercase(), rule.clone());
            }
        }

        let mut targets = Vec::new();
        let mut add_targets = |table: &BTreeMap<String, Vec<String>>, ttype: TargetType| {
            for (id, aliases) in table {
                for alias in aliases {
                    targets.push(TargetAlias {
                        alias: alias.to_lowercase(),
                        id: id.clone(),
                        ttype,
                    });
                }
            }
        };
        add_targets(&raw.targets.bots, TargetType::Bot);
        add_targets(&raw.targets.tools, TargetType::Tool);
        add_targets(&raw.targets.langs, TargetType::Lang);
        add_targets(&raw.targets.frameworks, TargetType::Framework);
        targets.sort_by(|a, b| b.alias.len().cmp(&a.alias.len()).then(a.alias.cmp(&b.alias)));

        Ok(Self {
            version: raw.version,
            min_severity: raw.min_severity,
            context_window: raw.context_window,
            zone_adjust: raw.zones,
            templates,
            lemmas,
            targets,
        })
    }

    /// Loads a pack from a file on disk.
    pub fn from_path(path: &std::path::Path) -> Result<Self, RulepackError> {
        Self::from_yaml(&std::fs::read_to_string(path)?)
    }

    /// The ruleset compiled into the binary.
    pub fn bundled() -> Result<Self, RulepackError> {
        Self::from_yaml(BUNDLED_PACK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINI_PACK: &str = r#"
version: 3
min_severity: 0
floors:
  bot_rage: 2
zones:
  code_fence: -1
  inline_code: -1
  quote: -1
templates:
  - term: garbage
    category: generic
    severity: 1
  - term: useless bot
    category: bot_rage
    severity: 1
lemmas:
  - term: ragequit
    forms: [ragequit, ragequits, ragequitting]
    category: self_own
    severity: 2
targets:
  bots:
    dependabot: [dependabot, "dependabot[bot]"]
  tools:
    webpack: [webpack]
"#;

    #[test]
    fn compiles_and_applies_floors() {
        let pack = Rulepack::from_yaml(MINI_PACK).unwrap();
        assert_eq!(pack.version, 3);
        assert_eq!(pack.templates.len(), 2);
        let bot = pack
            .templates
            .iter()
            .find(|t| t.term == "useless bot")
            .unwrap();
        // Floor of 2 lifts the declared severity of 1.
        assert_eq!(bot.severity, 2);
        let generic = pack.templates.iter().find(|t| t.term == "garbage").unwrap();
        assert_eq!(generic.severity, 1);
    }

    #[test]
    fn lemma_forms_share_one_rule() {
        let pack = Rulepack::from_yaml(MINI_PACK).unwrap();
        assert_eq!(pack.lemmas.len(), 3);
        assert_eq!(pack.lemmas["ragequitting"].term, "ragequit");
        assert_eq!(pack.lemmas["ragequit"].severity, 2);
    }

    #[test]
    fn unknown_category_coerces_to_generic() {
        assert_eq!(Category::parse("shouting_at_clouds"), Category::Generic);
        assert_eq!(Category::parse("bot_rage"), Category::BotRage);
    }

    #[test]
    fn category_rank_order() {
        let order = [
            Category::BotRage,
            Category::ToolingRage,
            Category::LangRage,
            Category::SelfOwn,
            Category::Generic,
        ];
        for pair in order.windows(2) {
            assert!(pair[0].rank() > pair[1].rank());
        }
    }

    #[test]
    fn targets_sorted_longest_alias_first() {
        let pack = Rulepack::from_yaml(MINI_PACK).unwrap();
        assert_eq!(pack.targets[0].alias, "dependabot[bot]");
        assert!(pack.targets.iter().any(|t| t.ttype == TargetType::Tool));
    }

    #[test]
    fn rejects_empty_and_bad_packs() {
        assert!(Rulepack::from_yaml("version: 0\ntemplates: []").is_err());
        assert!(Rulepack::from_yaml("version: 1\ntemplates: []").is_err());
        let bad_pattern = r#"
version: 1
templates:
  - term: x
    pattern: "(unclosed"
    category: generic
    severity: 1
"#;
        assert!(matches!(
            Rulepack::from_yaml(bad_pattern),
            Err(RulepackError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn bundled_pack_compiles() {
        let pack = Rulepack::bundled().unwrap();
        assert!(pack.version >= 1);
        assert!(!pack.templates.is_empty());
        assert!(!pack.targets.is_empty());
    }
}
