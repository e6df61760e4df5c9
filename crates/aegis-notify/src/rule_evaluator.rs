//! C4: Rule Evaluator.
//!
//! Check order per channel, first failure short-circuits to `Drop`:
//! global toggle, channel toggle, quiet hours (only `Critical` messages
//! bypass; a rule may carry its own narrower quiet-hours/quiet-days scope
//! that further restricts when it fires), then the user's enabled rules
//! whose `category` matches (exact beats the `"all"` wildcard; among equal
//! specificity the most recently updated wins), each checked for level,
//! exchange filter, keyword/exclude filters; a matched `Disabled`-frequency
//! rule drops explicitly. With no rule match, a default fallback delivers
//! `Warning`-or-above immediately.
//!
//! Quiet hours are parsed into minutes-since-midnight and compared with
//! real wrap-around arithmetic, not a string comparison -- a window like
//! `22:00`-`06:00` correctly spans midnight. The comparison happens in the
//! user's own `profile.timezone`, not server UTC, since quiet hours are
//! meaningless against the wrong clock; an unset or unrecognized timezone
//! falls back to UTC.

use aegis_common::model::{
    ChannelKind, Frequency, Level, NotificationMessage, NotificationRule, UserProfile,
};
use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleDecision {
    Deliver {
        channel: ChannelKind,
        frequency: Frequency,
        rule_id: Option<String>,
        max_per_hour: Option<u32>,
        cooldown_secs: u64,
    },
    Drop {
        channel: ChannelKind,
        reason: String,
    },
}

pub struct RuleEvaluator;

impl RuleEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate every channel the user has enabled for this message,
    /// yielding one decision per channel (totality: exactly one outcome per
    /// channel checked).
    pub fn evaluate(
        &self,
        profile: &UserProfile,
        message: &NotificationMessage,
        now: DateTime<Utc>,
    ) -> Vec<RuleDecision> {
        let channels = profile.enabled_channels();

        if !profile.global_enabled {
            return channels
                .into_iter()
                .map(|channel| RuleDecision::Drop {
                    channel,
                    reason: "notifications globally disabled".to_string(),
                })
                .collect();
        }

        channels
            .into_iter()
            .map(|channel| self.evaluate_channel(profile, message, channel, now))
            .collect()
    }

    fn evaluate_channel(
        &self,
        profile: &UserProfile,
        message: &NotificationMessage,
        channel: ChannelKind,
        now: DateTime<Utc>,
    ) -> RuleDecision {
        if !profile.is_channel_enabled(channel) {
            return RuleDecision::Drop {
                channel,
                reason: "channel disabled".to_string(),
            };
        }

        if message.level != Level::Critical && self.in_quiet_hours(profile, now) {
            return RuleDecision::Drop {
                channel,
                reason: "quiet_hours".to_string(),
            };
        }

        match self.best_matching_rule(profile, message, channel, now) {
            Some(rule) => self.apply_rule(rule, message, channel),
            None => {
                if message.level >= Level::Warning {
                    RuleDecision::Deliver {
                        channel,
                        frequency: Frequency::Immediate,
                        rule_id: None,
                        max_per_hour: None,
                        cooldown_secs: 0,
                    }
                } else {
                    RuleDecision::Drop {
                        channel,
                        reason: "no_rule".to_string(),
                    }
                }
            }
        }
    }

    /// Picks the rule this message should be evaluated against: enabled,
    /// scoped to `channel`, category matches (exact or `"all"`), and within
    /// the rule's own quiet-hours/quiet-days scope if it declares one.
    /// Among several matches, exact category beats `"all"`; ties go to the
    /// most recently updated.
    fn best_matching_rule<'a>(
        &self,
        profile: &'a UserProfile,
        message: &NotificationMessage,
        channel: ChannelKind,
        now: DateTime<Utc>,
    ) -> Option<&'a NotificationRule> {
        profile
            .rules
            .iter()
            .filter(|r| r.enabled)
            .filter(|r| r.channel == channel)
            .filter(|r| r.matches_category(&message.category))
            .filter(|r| !self.in_rule_quiet_scope(r, profile, now))
            .max_by(|a, b| {
                let specificity = |r: &NotificationRule| (r.category != "all") as u8;
                specificity(a)
                    .cmp(&specificity(b))
                    .then(a.updated_at.cmp(&b.updated_at))
            })
    }

    fn apply_rule(
        &self,
        rule: &NotificationRule,
        message: &NotificationMessage,
        channel: ChannelKind,
    ) -> RuleDecision {
        if message.level < rule.min_level {
            return RuleDecision::Drop {
                channel,
                reason: format!("below rule {} minimum level", rule.id),
            };
        }

        if !rule.exchange_filters.is_empty() {
            let matches = message
                .exchange_id
                .as_deref()
                .map(|id| rule.exchange_filters.iter().any(|f| f == id))
                .unwrap_or(false);
            if !matches {
                return RuleDecision::Drop {
                    channel,
                    reason: "exchange_filter".to_string(),
                };
            }
        }

        let haystack = format!("{} {}", message.title, message.body).to_lowercase();

        if !rule.keyword_filters.is_empty()
            && !rule
                .keyword_filters
                .iter()
                .any(|kw| haystack.contains(&kw.to_lowercase()))
        {
            return RuleDecision::Drop {
                channel,
                reason: "keyword_filter".to_string(),
            };
        }

        if rule
            .exclude_keywords
            .iter()
            .any(|kw| haystack.contains(&kw.to_lowercase()))
        {
            return RuleDecision::Drop {
                channel,
                reason: "exclude_keyword".to_string(),
            };
        }

        match rule.frequency {
            Frequency::Disabled => RuleDecision::Drop {
                channel,
                reason: "rule_disabled".to_string(),
            },
            frequency => RuleDecision::Deliver {
                channel,
                frequency,
                rule_id: Some(rule.id.clone()),
                max_per_hour: rule.max_per_hour,
                cooldown_secs: rule.cooldown_secs,
            },
        }
    }

    /// A rule's own quiet-hours/quiet-days scope, if it declares one. Unlike
    /// the profile-level window this never bypasses for `Critical` -- a
    /// rule's scope is an availability window for that rule, not a safety
    /// override.
    fn in_rule_quiet_scope(
        &self,
        rule: &NotificationRule,
        profile: &UserProfile,
        now: DateTime<Utc>,
    ) -> bool {
        let local = local_time(profile.timezone.as_deref(), now);
        if !rule.quiet_days.is_empty() {
            let weekday = local.weekday().num_days_from_monday() as u8;
            if rule.quiet_days.contains(&weekday) {
                return true;
            }
        }
        let (Some(start), Some(end)) = (&rule.quiet_hours_start, &rule.quiet_hours_end) else {
            return false;
        };
        in_window(start, end, local)
    }

    fn in_quiet_hours(&self, profile: &UserProfile, now: DateTime<Utc>) -> bool {
        if !profile.quiet_mode_enabled {
            return false;
        }
        let (Some(start), Some(end)) = (&profile.quiet_hours_start, &profile.quiet_hours_end)
        else {
            return false;
        };
        let local = local_time(profile.timezone.as_deref(), now);
        in_window(start, end, local)
    }
}

impl Default for RuleEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts to the named IANA timezone, falling back to UTC when `tz` is
/// absent or unrecognized -- a malformed timezone setting should never
/// make quiet-hours evaluation fail outright.
fn local_time(tz: Option<&str>, now: DateTime<Utc>) -> DateTime<Tz> {
    let zone = tz.and_then(|name| name.parse::<Tz>().ok()).unwrap_or(Tz::UTC);
    zone.from_utc_datetime(&now.naive_utc())
}

/// `[start, end)` wrapping across midnight: if `start < end` it's a same-day
/// window, otherwise it spans midnight and the complement is "outside".
fn in_window(start: &str, end: &str, local: DateTime<Tz>) -> bool {
    let (Some(start_min), Some(end_min)) = (parse_hhmm(start), parse_hhmm(end)) else {
        return false;
    };
    if start_min == end_min {
        return false;
    }
    let cur_min = local.time().hour() as i32 * 60 + local.time().minute() as i32;
    if start_min < end_min {
        cur_min >= start_min && cur_min < end_min
    } else {
        cur_min >= start_min || cur_min < end_min
    }
}

fn parse_hhmm(s: &str) -> Option<i32> {
    let (h, m) = s.split_once(':')?;
    let h: i32 = h.parse().ok()?;
    let m: i32 = m.parse().ok()?;
    if !(0..24).contains(&h) || !(0..60).contains(&m) {
        return None;
    }
    Some(h * 60 + m)
}
