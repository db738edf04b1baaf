//! Cross-source consistency checks, run after a snapshot's events have been
//! placed in the history.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use hometrack_core::{
    effective_conflicts, ConflictKind, ConflictRecord, ConflictStatus, CurrentState, EventKey,
    EventPayload, HistoryEvent, HistoryLog, PropertyId, ReportedValue,
};

/// The property being checked and the instant new findings are stamped with.
/// Findings depend only on the log, never on which source arrived last.
#[derive(Debug, Clone, Copy)]
pub struct ConflictCheck<'a> {
    pub property_id: &'a PropertyId,
    pub detected_at: DateTime<Utc>,
}

/// New conflict records (originals and auto-resolutions) implied by `history`.
/// Nothing already in `recorded` is returned again.
pub fn detect(
    check: &ConflictCheck<'_>,
    history: &HistoryLog,
    recorded: &[ConflictRecord],
) -> Vec<ConflictRecord> {
    let effective = history.effective_events();
    let mut found = missing_history(check, &effective);
    found.extend(value_mismatches(check, &effective));
    found.extend(auto_resolutions(check, &effective, recorded));

    let mut seen: HashSet<_> = recorded.iter().map(|c| c.id).collect();
    found.retain(|candidate| {
        let reopened = candidate.kind == ConflictKind::MissingHistory
            && !candidate.is_resolution()
            && recorded.iter().any(|c| {
                !c.is_resolution()
                    && c.kind == candidate.kind
                    && c.subject == candidate.subject
                    && c.sources == candidate.sources
            });
        !reopened && seen.insert(candidate.id)
    });
    found
}

fn is_timeline(event: &HistoryEvent) -> bool {
    !matches!(event.payload, EventPayload::DataCorrection(_))
}

fn reported(event: &HistoryEvent) -> ReportedValue {
    ReportedValue {
        source_id: event.source_id.clone(),
        event_id: Some(event.id),
        value: event.payload.comparable_value().unwrap_or(serde_json::Value::Null),
    }
}

/// Gaps of every source on the property, so the outcome does not depend on
/// which source arrived last.
fn missing_history(check: &ConflictCheck<'_>, effective: &[HistoryEvent]) -> Vec<ConflictRecord> {
    let sources: BTreeSet<&str> = effective.iter().map(|e| e.source_id.as_str()).collect();
    sources
        .into_iter()
        .flat_map(|source| missing_for_source(check, source, effective))
        .collect()
}

/// Events other sources recorded inside `source`'s window that `source` does
/// not have. The window runs from the source's earliest timeline event to its
/// latest ingestion.
fn missing_for_source(
    check: &ConflictCheck<'_>,
    source: &str,
    effective: &[HistoryEvent],
) -> Vec<ConflictRecord> {
    let own: Vec<HistoryEvent> = effective
        .iter()
        .filter(|e| e.source_id == source)
        .cloned()
        .collect();
    let Some(window_start) = own.iter().filter(|e| is_timeline(e)).map(|e| e.event_at).min() else {
        return Vec::new();
    };
    let window_end = own.iter().map(|e| e.ingested_at).max().unwrap_or(window_start);
    let own_keys: HashSet<EventKey> = own.iter().filter(|e| is_timeline(e)).map(|e| e.key()).collect();

    let mut reporters: BTreeMap<EventKey, Vec<&HistoryEvent>> = BTreeMap::new();
    for event in effective {
        if event.source_id == source
            || !is_timeline(event)
            || event.event_at < window_start
            || event.event_at > window_end
            || own_keys.contains(&event.key())
            || already_reflected(&own, event)
        {
            continue;
        }
        reporters.entry(event.key()).or_default().push(event);
    }

    reporters
        .into_iter()
        .map(|(key, events)| {
            let mut values: Vec<ReportedValue> = events.into_iter().map(reported).collect();
            values.sort_by(|a, b| a.source_id.cmp(&b.source_id));
            ConflictRecord::open(
                check.property_id,
                ConflictKind::MissingHistory,
                Some(key),
                vec![source.to_string()],
                values,
                check.detected_at,
            )
        })
        .collect()
}

/// A price or status change is not missing when the source's own timeline
/// already shows the resulting value at that instant; it merely observed the
/// change at a different time.
fn already_reflected(own: &[HistoryEvent], event: &HistoryEvent) -> bool {
    let before: Vec<HistoryEvent> = own
        .iter()
        .filter(|e| e.event_at <= event.event_at)
        .cloned()
        .collect();
    let state = CurrentState::fold(&before);
    match &event.payload {
        EventPayload::PriceChange { new_price, .. } => state.price == Some(*new_price),
        EventPayload::StatusChange { to, .. } => state.status == *to,
        _ => false,
    }
}

/// Same event reported with different values by two sources.
fn value_mismatches(check: &ConflictCheck<'_>, effective: &[HistoryEvent]) -> Vec<ConflictRecord> {
    let mut conflicts = Vec::new();
    let timeline: Vec<&HistoryEvent> = effective.iter().filter(|e| is_timeline(e)).collect();
    for (i, left) in timeline.iter().enumerate() {
        let Some(left_value) = left.payload.comparable_value() else {
            continue;
        };
        for right in &timeline[i + 1..] {
            if right.source_id == left.source_id || right.key() != left.key() {
                continue;
            }
            let Some(right_value) = right.payload.comparable_value() else {
                continue;
            };
            if right_value == left_value {
                continue;
            }
            let mut values = vec![reported(left), reported(right)];
            values.sort_by(|a, b| a.source_id.cmp(&b.source_id));
            conflicts.push(ConflictRecord::open(
                check.property_id,
                ConflictKind::ValueMismatch,
                Some(left.key()),
                vec![left.source_id.clone(), right.source_id.clone()],
                values,
                check.detected_at,
            ));
        }
    }
    conflicts
}

/// Open missing-history conflicts whose lagging sources now all report the event.
fn auto_resolutions(
    check: &ConflictCheck<'_>,
    effective: &[HistoryEvent],
    recorded: &[ConflictRecord],
) -> Vec<ConflictRecord> {
    effective_conflicts(recorded)
        .into_iter()
        .filter(|(original, status)| {
            original.kind == ConflictKind::MissingHistory && *status == ConflictStatus::Open
        })
        .filter_map(|(original, _)| {
            let key = original.subject?;
            let caught_up = original
                .sources
                .iter()
                .all(|source| effective.iter().any(|e| e.source_id == *source && e.key() == key));
            caught_up.then(|| {
                original.resolution(
                    ConflictStatus::AutoResolved,
                    Some(format!("{} now reports the event", original.sources.join(", "))),
                    check.detected_at,
                )
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).single().unwrap()
    }

    fn id() -> PropertyId {
        PropertyId::from_canonical("123 main st|apt 4b|seattle|wa|98101")
    }

    fn event(source: &str, d: u32, ingested: u32, payload: EventPayload) -> HistoryEvent {
        HistoryEvent::new(&id(), source, day(d), day(ingested), payload)
    }

    fn check(property_id: &PropertyId, at: u32) -> ConflictCheck<'_> {
        ConflictCheck {
            property_id,
            detected_at: day(at),
        }
    }

    fn listed(source: &str, ingested: u32) -> HistoryEvent {
        event(source, 1, ingested, EventPayload::Listed { price: Some(500_000.0) })
    }

    fn price_cut(source: &str, d: u32, ingested: u32) -> HistoryEvent {
        event(
            source,
            d,
            ingested,
            EventPayload::PriceChange { old_price: Some(500_000.0), new_price: 480_000.0 },
        )
    }

    #[test]
    fn lagging_source_is_named_in_missing_history() {
        let history = HistoryLog::from_events(vec![
            listed("redfin", 25),
            price_cut("redfin", 10, 25),
            listed("zillow", 26),
        ]);
        let property_id = id();
        let found = detect(&check(&property_id, 26), &history, &[]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, ConflictKind::MissingHistory);
        assert_eq!(found[0].sources, vec!["zillow".to_string()]);
        assert_eq!(found[0].subject.unwrap().event_at, day(10));
        assert_eq!(found[0].values[0].source_id, "redfin");
    }

    #[test]
    fn events_outside_the_window_or_retracted_are_not_missing() {
        let cut = price_cut("redfin", 10, 25);
        let retraction = event(
            "redfin",
            12,
            25,
            EventPayload::DataCorrection(hometrack_core::Correction {
                corrects: Some(cut.id),
                revision: hometrack_core::Revision::Retracted,
            }),
        );
        let history = HistoryLog::from_events(vec![
            listed("redfin", 25),
            cut,
            retraction,
            event("zillow", 5, 26, EventPayload::PriceChange { old_price: None, new_price: 500_000.0 }),
            event("redfin", 28, 28, EventPayload::Pending),
        ]);
        let property_id = id();
        // Listed on the 1st predates zillow's window; pending on the 28th came after its ingestion.
        // redfin already shows zillow's asking price on the 5th.
        assert!(detect(&check(&property_id, 26), &history, &[]).is_empty());
    }

    #[test]
    fn observed_price_changes_are_not_reported_as_missing() {
        // zillow only noticed the cut when it crawled on the 26th.
        let history = HistoryLog::from_events(vec![
            listed("redfin", 25),
            price_cut("redfin", 10, 25),
            listed("zillow", 26),
            price_cut("zillow", 26, 26),
        ]);
        let property_id = id();
        let found = detect(&check(&property_id, 27), &history, &[]);
        // redfin is not missing the cut zillow saw on the 26th; zillow still lacks the one on the 10th.
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].sources, vec!["zillow".to_string()]);
        assert_eq!(found[0].subject.unwrap().event_at, day(10));
    }

    #[test]
    fn every_source_is_checked_for_gaps() {
        let history = HistoryLog::from_events(vec![
            listed("redfin", 25),
            price_cut("redfin", 10, 25),
            listed("zillow", 26),
            event("zillow", 20, 26, EventPayload::Pending),
        ]);
        let property_id = id();
        let found = detect(&check(&property_id, 26), &history, &[]);
        let named: Vec<_> = found
            .iter()
            .map(|c| (c.sources[0].as_str(), c.subject.unwrap().event_at))
            .collect();
        // Each source lacks what the other reported inside its window.
        assert_eq!(named, vec![("redfin", day(20)), ("zillow", day(10))]);
    }

    #[test]
    fn different_values_for_the_same_event_are_a_mismatch() {
        let history = HistoryLog::from_events(vec![
            event("redfin", 20, 21, EventPayload::Sold { price: Some(510_000.0) }),
            event("zillow", 20, 22, EventPayload::Sold { price: Some(515_000.0) }),
        ]);
        let property_id = id();
        let found = detect(&check(&property_id, 22), &history, &[]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, ConflictKind::ValueMismatch);
        assert_eq!(found[0].sources, vec!["redfin".to_string(), "zillow".to_string()]);
        let values: Vec<_> = found[0].values.iter().map(|v| v.value.clone()).collect();
        assert_eq!(values, vec![serde_json::json!(510_000.0), serde_json::json!(515_000.0)]);

        // Detecting again yields nothing new.
        assert!(detect(&check(&property_id, 23), &history, &found).is_empty());
    }

    #[test]
    fn missing_history_auto_resolves_once_reported() {
        let property_id = id();
        let before = HistoryLog::from_events(vec![
            listed("redfin", 25),
            price_cut("redfin", 10, 25),
            listed("zillow", 26),
        ]);
        let opened = detect(&check(&property_id, 26), &before, &[]);

        let mut after = before.clone();
        after.insert(price_cut("zillow", 10, 30));
        let found = detect(&check(&property_id, 30), &after, &opened);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].status, ConflictStatus::AutoResolved);
        assert_eq!(found[0].resolves, Some(opened[0].id));
    }

    #[test]
    fn a_known_gap_is_not_reopened() {
        let property_id = id();
        let history = HistoryLog::from_events(vec![
            listed("redfin", 25),
            price_cut("redfin", 10, 25),
            listed("zillow", 26),
        ]);
        let opened = detect(&check(&property_id, 26), &history, &[]);
        let manual = opened[0].resolution(ConflictStatus::ManuallyResolved, None, day(27));
        let recorded = vec![opened[0].clone(), manual];
        assert!(detect(&check(&property_id, 28), &history, &recorded).is_empty());
    }
}
