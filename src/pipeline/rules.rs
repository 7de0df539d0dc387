//! Rule-based categorizer.
//!
//! An ordered list of category rules, evaluated first-match-wins:
//! - sender contains a sender pattern → match
//! - sender domain equals (or is a subdomain of) a listed domain → match
//! - subject or body contains a keyword → match
//!
//! No rule matching means the fallback category. Matching is case-insensitive
//! and purely local, so the same message always lands in the same category.

use std::collections::HashSet;
use std::path::Path;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;
use crate::pipeline::types::{CategorizedMessage, CategoryResult, Importance, Message};

/// Serializable form of one rule, as written in a rules file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDef {
    pub category: String,
    pub importance: u8,
    #[serde(default)]
    pub senders: Vec<String>,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// Serializable fallback category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackDef {
    pub category: String,
    pub importance: u8,
}

/// Whole rules file: ordered rules plus the fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSet {
    pub rules: Vec<RuleDef>,
    pub fallback: FallbackDef,
}

/// A compiled category rule.
#[derive(Debug, Clone)]
pub struct CategoryRule {
    category: String,
    importance: Importance,
    /// Lowercased substrings matched against the sender.
    senders: Vec<String>,
    /// Lowercased domains matched against the sender's domain.
    domains: Vec<String>,
    /// Case-insensitive alternation of escaped keywords.
    keywords: Option<Regex>,
}

impl CategoryRule {
    fn compile(def: &RuleDef) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidRule {
            category: def.category.clone(),
            reason,
        };

        let category = def.category.trim().to_string();
        if category.is_empty() {
            return Err(invalid("category name is empty".into()));
        }
        let importance = Importance::try_from(def.importance).map_err(invalid)?;

        let normalize = |items: &[String]| -> Vec<String> {
            items
                .iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        };
        let senders = normalize(&def.senders);
        let domains: Vec<String> = normalize(&def.domains)
            .into_iter()
            .map(|d| d.trim_start_matches('@').to_string())
            .collect();
        let keywords = normalize(&def.keywords);

        if senders.is_empty() && domains.is_empty() && keywords.is_empty() {
            return Err(invalid("rule has no senders, domains or keywords".into()));
        }

        let keywords = if keywords.is_empty() {
            None
        } else {
            let alternation = keywords
                .iter()
                .map(|k| regex::escape(k))
                .collect::<Vec<_>>()
                .join("|");
            let regex = RegexBuilder::new(&alternation)
                .case_insensitive(true)
                .build()
                .map_err(|e| invalid(format!("keyword pattern: {e}")))?;
            Some(regex)
        };

        Ok(Self {
            category,
            importance,
            senders,
            domains,
            keywords,
        })
    }

    /// Category this rule assigns.
    pub fn category(&self) -> &str {
        &self.category
    }

    /// Importance this rule assigns.
    pub fn importance(&self) -> Importance {
        self.importance
    }

    fn matches(&self, sender: &str, domain: Option<&str>, message: &Message) -> bool {
        if self.senders.iter().any(|p| sender.contains(p.as_str())) {
            return true;
        }

        if let Some(domain) = domain
            && self
                .domains
                .iter()
                .any(|d| domain == d || domain.ends_with(&format!(".{d}")))
        {
            return true;
        }

        match &self.keywords {
            Some(regex) => regex.is_match(&message.subject) || regex.is_match(&message.body),
            None => false,
        }
    }
}

/// Deterministic classifier over an ordered rule list.
#[derive(Debug, Clone)]
pub struct Categorizer {
    rules: Vec<CategoryRule>,
    fallback: CategoryResult,
}

impl Categorizer {
    /// Compile a rule set, rejecting invalid or duplicate categories.
    pub fn from_rule_set(set: &RuleSet) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        let mut rules = Vec::with_capacity(set.rules.len());
        for def in &set.rules {
            let rule = CategoryRule::compile(def)?;
            if !seen.insert(rule.category.to_lowercase()) {
                return Err(ConfigError::InvalidRule {
                    category: rule.category,
                    reason: "duplicate category".into(),
                });
            }
            rules.push(rule);
        }

        let fallback_name = set.fallback.category.trim();
        if fallback_name.is_empty() {
            return Err(ConfigError::InvalidRule {
                category: set.fallback.category.clone(),
                reason: "fallback category name is empty".into(),
            });
        }
        let importance = Importance::try_from(set.fallback.importance).map_err(|reason| {
            ConfigError::InvalidRule {
                category: fallback_name.to_string(),
                reason,
            }
        })?;

        Ok(Self {
            rules,
            fallback: CategoryResult {
                category: fallback_name.to_string(),
                importance,
            },
        })
    }

    /// Load a JSON rules file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let set: RuleSet = serde_json::from_str(&raw)
            .map_err(|e| ConfigError::ParseError(format!("{}: {e}", path.display())))?;
        Self::from_rule_set(&set)
    }

    /// Built-in rule set.
    pub fn default_rules() -> Self {
        Self::from_rule_set(&default_rule_set()).expect("built-in category rules are valid")
    }

    /// Rules in precedence order.
    pub fn rules(&self) -> &[CategoryRule] {
        &self.rules
    }

    /// Category used when nothing matches.
    pub fn fallback(&self) -> &CategoryResult {
        &self.fallback
    }

    /// Classify one message. First matching rule wins.
    pub fn classify(&self, message: &Message) -> CategoryResult {
        let sender = message.sender.to_lowercase();
        let domain = message.sender_domain();

        for rule in &self.rules {
            if rule.matches(&sender, domain.as_deref(), message) {
                debug!(
                    id = %message.id,
                    category = %rule.category,
                    importance = %rule.importance,
                    "Message matched category rule"
                );
                return CategoryResult {
                    category: rule.category.clone(),
                    importance: rule.importance,
                };
            }
        }

        debug!(
            id = %message.id,
            category = %self.fallback.category,
            "No rule matched, using fallback"
        );
        self.fallback.clone()
    }

    /// Classify a batch, preserving fetch order.
    pub fn classify_all(&self, messages: Vec<Message>) -> Vec<CategorizedMessage> {
        messages
            .into_iter()
            .map(|message| {
                let result = self.classify(&message);
                CategorizedMessage { message, result }
            })
            .collect()
    }
}

fn rule(
    category: &str,
    importance: u8,
    senders: &[&str],
    domains: &[&str],
    keywords: &[&str],
) -> RuleDef {
    let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
    RuleDef {
        category: category.into(),
        importance,
        senders: owned(senders),
        domains: owned(domains),
        keywords: owned(keywords),
    }
}

/// The built-in categories, most specific first.
pub fn default_rule_set() -> RuleSet {
    RuleSet {
        rules: vec![
            rule(
                "Banking",
                5,
                &["bank", "alerts@", "paypal", "creditcard"],
                &[],
                &[
                    "transaction alert",
                    "account credited",
                    "account debited",
                    "credited with",
                    "debited with",
                    "account statement",
                    "one-time password",
                    "payment received",
                    "payment failed",
                ],
            ),
            rule(
                "Security",
                5,
                &["security@", "no-reply@accounts."],
                &[],
                &[
                    "security alert",
                    "new sign-in",
                    "password reset",
                    "verification code",
                    "suspicious activity",
                    "two-factor",
                ],
            ),
            rule(
                "Internship",
                4,
                &["unstop", "internshala", "careers@", "recruit"],
                &["linkedin.com", "naukri.com"],
                &[
                    "internship",
                    "job opportunity",
                    "interview",
                    "application received",
                    "shortlisted",
                    "offer letter",
                ],
            ),
            rule(
                "Work",
                4,
                &[],
                &[],
                &[
                    "meeting",
                    "project",
                    "deadline",
                    "review request",
                    "standup",
                    "action required",
                ],
            ),
            rule(
                "Education",
                3,
                &["university", "college", "school", "coursera", "udemy"],
                &["edu", "ac.in"],
                &[
                    "assignment",
                    "lecture",
                    "exam schedule",
                    "semester",
                    "course registration",
                    "grades",
                ],
            ),
            rule(
                "Travel",
                3,
                &["airline", "irctc", "booking", "airbnb"],
                &[],
                &["booking confirmed", "flight", "itinerary", "boarding pass", "pnr status"],
            ),
            rule(
                "Shopping",
                2,
                &["amazon", "flipkart", "orders@"],
                &[],
                &["your order", "has shipped", "out for delivery", "has been delivered", "invoice"],
            ),
            rule(
                "Social",
                2,
                &["facebookmail", "instagram", "twitter"],
                &["facebook.com", "instagram.com", "twitter.com"],
                &["tagged you", "friend request", "new follower", "mentioned you"],
            ),
            rule(
                "Promotions",
                1,
                &["promo", "marketing", "offers@", "newsletter"],
                &[],
                &["% off", "flash sale", "coupon", "discount", "limited time offer", "unsubscribe"],
            ),
        ],
        fallback: FallbackDef {
            category: "Other".into(),
            importance: 2,
        },
    }
}
