// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Maintenance Rules
//!
//! A rule binds a threshold condition to a set of component-type
//! categories. Rules are never evaluated during ingestion; they are
//! checked on demand against a component's current accumulators, its wear
//! value, its service count, and the current date.
//!
//! A template rule is a reusable definition. Calendar templates store a
//! relative offset in seconds; attaching a template to a real component
//! resolves the offset to an absolute target date at that moment, using
//! 30.42-day months and 365.25-day years.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::database::Database;
use crate::models::Component;

/// Seconds in one day.
pub const SECONDS_PER_DAY: f64 = 24.0 * 60.0 * 60.0;
/// Average month length used for calendar offsets.
pub const DAYS_PER_MONTH: f64 = 30.42;
/// Average year length used for calendar offsets.
pub const DAYS_PER_YEAR: f64 = 365.25;

/// Offset in seconds for a whole number of days.
pub fn seconds_from_days(days: i64) -> i64 {
    (days as f64 * SECONDS_PER_DAY) as i64
}

/// Offset in seconds for a whole number of average months.
pub fn seconds_from_months(months: i64) -> i64 {
    (months as f64 * DAYS_PER_MONTH * SECONDS_PER_DAY) as i64
}

/// Offset in seconds for a whole number of average years.
pub fn seconds_from_years(years: i64) -> i64 {
    (years as f64 * DAYS_PER_YEAR * SECONDS_PER_DAY) as i64
}

/// The kind of threshold a rule checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// Accumulated distance, threshold in km
    Distance,
    /// Accumulated activity time, threshold in hours
    ActivityTime,
    /// Absolute target date (templates carry a relative offset in seconds)
    CalendarDate,
    /// Wear percentage, 100 = new, triggered at or below threshold
    Wear,
    /// Count of qualifying service actions
    UseCount,
}

impl RuleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleKind::Distance => "distance",
            RuleKind::ActivityTime => "activity_time",
            RuleKind::CalendarDate => "calendar_date",
            RuleKind::Wear => "wear",
            RuleKind::UseCount => "use_count",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "distance" => Some(RuleKind::Distance),
            "activity_time" => Some(RuleKind::ActivityTime),
            "calendar_date" => Some(RuleKind::CalendarDate),
            "wear" => Some(RuleKind::Wear),
            "use_count" => Some(RuleKind::UseCount),
            _ => None,
        }
    }

    /// Unit suffix for display.
    pub fn symbol(self) -> &'static str {
        match self {
            RuleKind::Distance => "km",
            RuleKind::ActivityTime => "hrs",
            RuleKind::CalendarDate => "",
            RuleKind::Wear => "%",
            RuleKind::UseCount => "",
        }
    }
}

/// A maintenance rule bound to one or more component-type categories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentRule {
    pub id: Uuid,
    pub name: String,
    pub kind: RuleKind,
    /// Threshold whose unit depends on `kind`; for calendar templates this
    /// is the relative offset in seconds
    pub rule_value: i64,
    /// Absolute target date, set for calendar instances at attachment
    pub rule_date: Option<DateTime<Utc>>,
    /// Reusable definition rather than an attached instance
    pub template: bool,
    pub notification_message: Option<String>,
    /// Component-type categories this rule applies to
    pub component_type_ids: Vec<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ComponentRule {
    pub fn new(name: &str, kind: RuleKind, template: bool) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            kind,
            rule_value: 0,
            rule_date: None,
            template,
            notification_message: None,
            component_type_ids: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the threshold. For calendar rules a template keeps the relative
    /// offset; an instance resolves it to an absolute date immediately.
    pub fn set_threshold(&mut self, value: i64, now: DateTime<Utc>) {
        match self.kind {
            RuleKind::CalendarDate if !self.template => {
                self.rule_date = Some(now + Duration::seconds(value));
            }
            _ => {
                self.rule_value = value;
            }
        }
        self.updated_at = now;
    }

    /// Whether this rule applies to the given component type.
    pub fn applies_to(&self, type_id: i64) -> bool {
        self.component_type_ids.contains(&type_id)
    }

    /// Clone this template into an attached instance, resolving a calendar
    /// offset to an absolute target date at `now`.
    pub fn instantiate(&self, now: DateTime<Utc>) -> ComponentRule {
        let mut instance = self.clone();
        instance.id = Uuid::new_v4();
        instance.template = false;
        instance.created_at = now;
        instance.updated_at = now;
        if self.kind == RuleKind::CalendarDate {
            instance.rule_date = Some(now + Duration::seconds(self.rule_value));
        }
        instance
    }

    /// Evaluate this rule against a component.
    ///
    /// Returns false when the component's type is outside the rule's set.
    /// Wear and use-count read externally supplied state from the context;
    /// the usage accumulators come from the component itself.
    pub fn is_due(&self, component: &Component, ctx: &EvalContext) -> bool {
        if !self.applies_to(component.type_id) {
            return false;
        }
        match self.kind {
            RuleKind::Distance => component.distance_m / 1000.0 >= self.rule_value as f64,
            RuleKind::ActivityTime => component.duration_s >= self.rule_value * 3600,
            RuleKind::CalendarDate => self.rule_date.is_some_and(|date| ctx.now >= date),
            RuleKind::Wear => ctx
                .wear_value
                .or(component.value)
                .is_some_and(|wear| wear <= self.rule_value as f64),
            RuleKind::UseCount => ctx.service_count >= self.rule_value,
        }
    }
}

/// Externally supplied state for rule evaluation.
#[derive(Debug, Clone)]
pub struct EvalContext {
    pub now: DateTime<Utc>,
    /// Latest wear measurement, when one overrides the component's value
    pub wear_value: Option<f64>,
    /// Count of qualifying service actions against the component
    pub service_count: i64,
}

impl EvalContext {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now,
            wear_value: None,
            service_count: 0,
        }
    }
}

/// Every (component, rule) pair currently triggered for a bike.
///
/// Retired components are skipped; each component is evaluated against
/// every attached rule instance with its own service count in context.
pub async fn due_rules(
    db: &Database,
    bike_id: Uuid,
    now: DateTime<Utc>,
) -> crate::errors::Result<Vec<(Component, ComponentRule)>> {
    let instances = db.list_rules(Some(false)).await?;
    let mut due = Vec::new();

    for component in db.components_for_bike(bike_id).await? {
        if component.retired {
            continue;
        }
        let mut ctx = EvalContext::at(now);
        ctx.service_count = db.service_count_for_component(component.id).await?;

        for rule in &instances {
            if rule.is_due(&component, &ctx) {
                due.push((component.clone(), rule.clone()));
            }
        }
    }

    Ok(due)
}

/// The default rule templates installed on first run.
pub fn default_templates() -> Vec<ComponentRule> {
    use crate::taxonomy::type_ids::*;

    let now = Utc::now();
    let template = |name: &str, kind: RuleKind, value: i64, types: &[i64]| {
        let mut rule = ComponentRule::new(name, kind, true);
        rule.set_threshold(value, now);
        rule.component_type_ids = types.to_vec();
        rule
    };

    vec![
        template(
            "Top up sealant",
            RuleKind::CalendarDate,
            seconds_from_months(6),
            &[SEALANT],
        ),
        template("Wax", RuleKind::Distance, 500, &[CHAIN]),
        template("Replace", RuleKind::Wear, 50, &[CHAIN]),
        template("Service shock", RuleKind::ActivityTime, 500, &[SHOCK]),
        template(
            "Bleed brake",
            RuleKind::CalendarDate,
            seconds_from_years(2),
            &[FRONT_BRAKE, REAR_BRAKE],
        ),
        template("Replace", RuleKind::Wear, 25, &[TYRE]),
        template(
            "Check Pressure",
            RuleKind::CalendarDate,
            seconds_from_days(5),
            &[TYRE],
        ),
        template("Replace", RuleKind::UseCount, 5, &[CHAIN_LINK]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Bike, BikeSource};
    use crate::taxonomy::type_ids::*;
    use chrono::TimeZone;

    fn component_of_type(type_id: i64) -> Component {
        let bike = Bike::new("Test bike", BikeSource::Local);
        Component::new(bike.id, type_id)
    }

    #[test]
    fn test_distance_rule_triggers_at_threshold() {
        let mut rule = ComponentRule::new("Wax", RuleKind::Distance, false);
        rule.set_threshold(500, Utc::now());
        rule.component_type_ids = vec![CHAIN];

        let mut chain = component_of_type(CHAIN);
        let ctx = EvalContext::at(Utc::now());

        chain.distance_m = 499_999.0;
        assert!(!rule.is_due(&chain, &ctx));
        chain.distance_m = 500_000.0;
        assert!(rule.is_due(&chain, &ctx));
    }

    #[test]
    fn test_activity_time_rule_compares_in_seconds() {
        let mut rule = ComponentRule::new("Service shock", RuleKind::ActivityTime, false);
        rule.set_threshold(500, Utc::now());
        rule.component_type_ids = vec![SHOCK];

        let mut shock = component_of_type(SHOCK);
        let ctx = EvalContext::at(Utc::now());

        shock.duration_s = 500 * 3600 - 1;
        assert!(!rule.is_due(&shock, &ctx));
        shock.duration_s = 500 * 3600;
        assert!(rule.is_due(&shock, &ctx));
    }

    #[test]
    fn test_calendar_template_resolution_uses_average_month() {
        let attach = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut template = ComponentRule::new("Top up sealant", RuleKind::CalendarDate, true);
        template.set_threshold(seconds_from_months(6), attach);
        template.component_type_ids = vec![SEALANT];

        let instance = template.instantiate(attach);
        let target = instance.rule_date.expect("instance has a target date");

        // 6 * 30.42 = 182.52 days after Jan 1st lands on about Jul 1st,
        // not a calendar-exact six months later
        let days_out = (target - attach).num_days();
        assert_eq!(days_out, 182);

        let sealant = component_of_type(SEALANT);
        assert!(!instance.is_due(&sealant, &EvalContext::at(attach)));
        assert!(instance.is_due(&sealant, &EvalContext::at(target)));
    }

    #[test]
    fn test_calendar_template_keeps_offset_until_attached() {
        let now = Utc::now();
        let mut template = ComponentRule::new("Bleed brake", RuleKind::CalendarDate, true);
        template.set_threshold(seconds_from_years(2), now);

        assert_eq!(template.rule_value, seconds_from_years(2));
        assert!(template.rule_date.is_none());
    }

    #[test]
    fn test_wear_rule_triggers_at_or_below_threshold() {
        let mut rule = ComponentRule::new("Replace", RuleKind::Wear, false);
        rule.set_threshold(50, Utc::now());
        rule.component_type_ids = vec![CHAIN];

        let mut chain = component_of_type(CHAIN);
        let ctx = EvalContext::at(Utc::now());

        chain.value = Some(80.0);
        assert!(!rule.is_due(&chain, &ctx));
        chain.value = Some(50.0);
        assert!(rule.is_due(&chain, &ctx));

        // Context-supplied measurement overrides the stored value
        let mut measured = EvalContext::at(Utc::now());
        measured.wear_value = Some(40.0);
        chain.value = Some(90.0);
        assert!(rule.is_due(&chain, &measured));
    }

    #[test]
    fn test_use_count_rule_reads_context() {
        let mut rule = ComponentRule::new("Replace", RuleKind::UseCount, false);
        rule.set_threshold(5, Utc::now());
        rule.component_type_ids = vec![CHAIN_LINK];

        let link = component_of_type(CHAIN_LINK);
        let mut ctx = EvalContext::at(Utc::now());

        ctx.service_count = 4;
        assert!(!rule.is_due(&link, &ctx));
        ctx.service_count = 5;
        assert!(rule.is_due(&link, &ctx));
    }

    #[test]
    fn test_rule_requires_matching_component_type() {
        let mut rule = ComponentRule::new("Wax", RuleKind::Distance, false);
        rule.set_threshold(1, Utc::now());
        rule.component_type_ids = vec![CHAIN];

        let mut cassette = component_of_type(CASSETTE);
        cassette.distance_m = 1_000_000.0;
        assert!(!rule.is_due(&cassette, &EvalContext::at(Utc::now())));
    }

    #[test]
    fn test_default_templates_cover_expected_kinds() {
        let templates = default_templates();
        assert_eq!(templates.len(), 8);
        assert!(templates.iter().all(|t| t.template));
        assert!(templates
            .iter()
            .any(|t| t.kind == RuleKind::UseCount && t.applies_to(CHAIN_LINK)));
        assert!(templates
            .iter()
            .any(|t| t.kind == RuleKind::CalendarDate && t.rule_date.is_none()));
    }
}
