//! Deterministic keyword-based enrichment hooks.
//!
//! No network and no model calls: every hook is a pure function of the
//! message, so the same message always yields the same row. Relative dates
//! ("by friday", "tomorrow") are resolved against the message timestamp.

use async_trait::async_trait;
use chrono::{Datelike, Duration, NaiveDate, Weekday};
use regex::{Regex, RegexBuilder};

use crate::error::EnrichmentError;
use crate::pipeline::types::{
    ActionItems, AttachmentSummary, CategoryResult, EnrichmentHooks, EventHint, Message,
    Sentiment,
};

const URGENT_KEYWORDS: &[&str] = &[
    "urgent",
    "asap",
    "immediately",
    "emergency",
    "critical",
    "time-sensitive",
    "deadline",
    "expires",
    "last chance",
    "act now",
    "hurry",
    "important",
];

const NEGATIVE_KEYWORDS: &[&str] = &[
    "problem",
    "issue",
    "error",
    "failed",
    "rejected",
    "denied",
    "declined",
    "cancelled",
    "suspended",
    "overdue",
    "missed",
    "mistake",
];

const POSITIVE_KEYWORDS: &[&str] = &[
    "congratulations",
    "approved",
    "accepted",
    "selected",
    "success",
    "completed",
    "confirmed",
    "thank you",
    "excellent",
    "wonderful",
    "pleased",
];

const ACTION_KEYWORDS: &[&str] = &[
    "please",
    "submit",
    "complete",
    "review",
    "respond",
    "reply",
    "confirm",
    "register",
    "pay ",
    "sign",
    "upload",
    "schedule",
    "attend",
    "action required",
];

const EVENT_KEYWORDS: &[&str] = &[
    "meeting",
    "interview",
    "webinar",
    "appointment",
    "call scheduled",
    "invitation:",
    "zoom.us",
    "teams meeting",
];

const SUMMARY_MAX_CHARS: usize = 200;
const MAX_ACTIONS: usize = 3;
const ACTION_MIN_CHARS: usize = 10;
const ACTION_MAX_CHARS: usize = 200;

/// Keyword and pattern driven [`EnrichmentHooks`].
#[derive(Debug)]
pub struct RuleBasedEnrichment {
    sentence_split: Regex,
    numeric_date: Regex,
    month_day: Regex,
    day_month: Regex,
    relative: Vec<(Regex, Relative)>,
}

#[derive(Debug, Clone, Copy)]
enum Relative {
    Today,
    Tomorrow,
    Weekday(Weekday),
    Week,
    Month,
}

fn ci(pattern: &str) -> Regex {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .expect("built-in pattern compiles")
}

impl RuleBasedEnrichment {
    pub fn new() -> Self {
        const MONTH: &str = concat!(
            r"(jan(?:uary)?|feb(?:ruary)?|mar(?:ch)?|apr(?:il)?|may|june?|july?",
            r"|aug(?:ust)?|sep(?:t(?:ember)?)?|oct(?:ober)?|nov(?:ember)?|dec(?:ember)?)"
        );

        let relative = [
            (r"\b(?:by |before |until )today\b", Relative::Today),
            (r"\b(?:by |before |until )?tomorrow\b", Relative::Tomorrow),
            (r"\b(?:by |before |until )(?:this )?monday\b", Relative::Weekday(Weekday::Mon)),
            (r"\b(?:by |before |until )(?:this )?tuesday\b", Relative::Weekday(Weekday::Tue)),
            (r"\b(?:by |before |until )(?:this )?wednesday\b", Relative::Weekday(Weekday::Wed)),
            (r"\b(?:by |before |until )(?:this )?thursday\b", Relative::Weekday(Weekday::Thu)),
            (r"\b(?:by |before |until )(?:this )?friday\b", Relative::Weekday(Weekday::Fri)),
            (r"\b(?:by |before |until )(?:the )?end of (?:the )?week\b", Relative::Week),
            (r"\b(?:by |before |until )(?:the )?end of (?:the )?month\b", Relative::Month),
        ]
        .into_iter()
        .map(|(p, r)| (ci(p), r))
        .collect();

        Self {
            sentence_split: ci(r"[.!?\n]+"),
            numeric_date: ci(r"\b(\d{4})-(\d{1,2})-(\d{1,2})\b|\b(\d{1,2})/(\d{1,2})/(\d{2,4})\b"),
            month_day: ci(&format!(
                r"\b{MONTH}\.? (\d{{1,2}})(?:st|nd|rd|th)?(?:,? (\d{{4}}))?\b"
            )),
            day_month: ci(&format!(
                r"\b(\d{{1,2}})(?:st|nd|rd|th)? {MONTH}(?:,? (\d{{4}}))?\b"
            )),
            relative,
        }
    }

    /// Subject and body as separate sentences, lowercased.
    fn combined_lower(message: &Message) -> String {
        format!("{}\n{}", message.subject, message.body).to_lowercase()
    }

    /// First absolute date in `text`, falling back to a relative phrase.
    fn find_date(&self, text: &str, reference: NaiveDate) -> Option<NaiveDate> {
        if let Some(date) = self.find_absolute_date(text, reference.year()) {
            return Some(date);
        }
        self.relative
            .iter()
            .find(|(re, _)| re.is_match(text))
            .and_then(|(_, rel)| resolve_relative(*rel, reference))
    }

    fn find_absolute_date(&self, text: &str, default_year: i32) -> Option<NaiveDate> {
        for caps in self.numeric_date.captures_iter(text) {
            let num = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok());
            let date = if let (Some(y), Some(m), Some(d)) = (num(1), num(2), num(3)) {
                NaiveDate::from_ymd_opt(y as i32, m, d)
            } else if let (Some(m), Some(d), Some(y)) = (num(4), num(5), num(6)) {
                // US ordering, two-digit years in this century
                let year = if y < 100 { 2000 + y } else { y };
                NaiveDate::from_ymd_opt(year as i32, m, d)
            } else {
                None
            };
            if date.is_some() {
                return date;
            }
        }

        for caps in self.month_day.captures_iter(text) {
            let month = caps.get(1).and_then(|m| month_number(m.as_str()));
            let day = caps.get(2).and_then(|m| m.as_str().parse().ok());
            let year = caps
                .get(3)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(default_year);
            if let (Some(m), Some(d)) = (month, day)
                && let Some(date) = NaiveDate::from_ymd_opt(year, m, d)
            {
                return Some(date);
            }
        }

        for caps in self.day_month.captures_iter(text) {
            let day = caps.get(1).and_then(|m| m.as_str().parse().ok());
            let month = caps.get(2).and_then(|m| month_number(m.as_str()));
            let year = caps
                .get(3)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(default_year);
            if let (Some(m), Some(d)) = (month, day)
                && let Some(date) = NaiveDate::from_ymd_opt(year, m, d)
            {
                return Some(date);
            }
        }

        None
    }
}

impl Default for RuleBasedEnrichment {
    fn default() -> Self {
        Self::new()
    }
}

fn month_number(name: &str) -> Option<u32> {
    let m = match name.get(..3)?.to_ascii_lowercase().as_str() {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(m)
}

fn resolve_relative(rel: Relative, reference: NaiveDate) -> Option<NaiveDate> {
    match rel {
        Relative::Today => Some(reference),
        Relative::Tomorrow => reference.succ_opt(),
        Relative::Weekday(target) => {
            let current = reference.weekday().num_days_from_monday() as i64;
            let wanted = target.num_days_from_monday() as i64;
            let mut ahead = (wanted - current).rem_euclid(7);
            if ahead == 0 {
                ahead = 7;
            }
            reference.checked_add_signed(Duration::days(ahead))
        }
        Relative::Week => reference.checked_add_signed(Duration::days(7)),
        Relative::Month => {
            let (y, m) = if reference.month() == 12 {
                (reference.year() + 1, 1)
            } else {
                (reference.year(), reference.month() + 1)
            };
            NaiveDate::from_ymd_opt(y, m, 1).and_then(|d| d.pred_opt())
        }
    }
}

fn count_hits(text: &str, keywords: &[&str]) -> usize {
    keywords.iter().filter(|kw| text.contains(*kw)).count()
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[async_trait]
impl EnrichmentHooks for RuleBasedEnrichment {
    async fn summarize(&self, message: &Message) -> Result<String, EnrichmentError> {
        let subject = message.subject.trim();
        let lead = message
            .body
            .split(['\n', '.'])
            .map(str::trim)
            .find(|s| !s.is_empty());

        let summary = match (subject.is_empty(), lead) {
            (false, Some(lead)) => format!("{subject}: {lead}"),
            (false, None) => subject.to_string(),
            (true, Some(lead)) => lead.to_string(),
            (true, None) => String::new(),
        };
        Ok(truncate_chars(&summary, SUMMARY_MAX_CHARS))
    }

    async fn analyze_sentiment(&self, message: &Message) -> Result<Sentiment, EnrichmentError> {
        let text = Self::combined_lower(message);

        let urgent = count_hits(&text, URGENT_KEYWORDS);
        let negative = count_hits(&text, NEGATIVE_KEYWORDS);
        let positive = count_hits(&text, POSITIVE_KEYWORDS);

        let (label, mut urgency) = if urgent >= 2 {
            ("urgent", 0.9_f32)
        } else if negative > positive {
            ("negative", 0.6)
        } else if positive > negative {
            ("positive", 0.3)
        } else {
            ("neutral", 0.5)
        };

        if message.subject.contains('!') || text.contains("!!") {
            urgency += 0.2;
        }
        if text.contains("by tomorrow") || text.contains("by today") {
            urgency += 0.3;
        }

        Ok(Sentiment {
            label: label.into(),
            urgency: (urgency.min(1.0) * 100.0).round() / 100.0,
        })
    }

    async fn extract_action_items(
        &self,
        message: &Message,
    ) -> Result<ActionItems, EnrichmentError> {
        let text = Self::combined_lower(message);

        let items = self
            .sentence_split
            .split(&text)
            .map(str::trim)
            .filter(|s| {
                let len = s.chars().count();
                len > ACTION_MIN_CHARS
                    && len < ACTION_MAX_CHARS
                    && ACTION_KEYWORDS.iter().any(|kw| s.contains(kw))
            })
            .take(MAX_ACTIONS)
            .map(capitalize)
            .collect();

        let due_date = self.find_date(&text, message.timestamp.date_naive());
        Ok(ActionItems { items, due_date })
    }

    async fn describe_attachments(
        &self,
        message: &Message,
    ) -> Result<AttachmentSummary, EnrichmentError> {
        let names = message
            .attachments
            .iter()
            .map(|a| {
                if a.name.is_empty() {
                    format!("(unnamed {})", a.content_type)
                } else {
                    a.name.clone()
                }
            })
            .collect::<Vec<_>>();
        Ok(AttachmentSummary {
            count: names.len(),
            names,
        })
    }

    async fn detect_event(
        &self,
        message: &Message,
        result: &CategoryResult,
    ) -> Result<Option<EventHint>, EnrichmentError> {
        let text = Self::combined_lower(message);
        if !EVENT_KEYWORDS.iter().any(|kw| text.contains(kw)) {
            return Ok(None);
        }

        // Without a date there is nothing to put on a calendar.
        let Some(date) = self.find_date(&text, message.timestamp.date_naive()) else {
            return Ok(None);
        };

        let subject = if message.subject.trim().is_empty() {
            result.category.as_str()
        } else {
            message.subject.trim()
        };
        let title = if text.contains("interview") {
            format!("Interview: {subject}")
        } else if text.contains("meeting") {
            format!("Meeting: {subject}")
        } else {
            subject.to_string()
        };

        Ok(Some(EventHint {
            title: truncate_chars(&title, 100),
            date: Some(date),
        }))
    }
}
