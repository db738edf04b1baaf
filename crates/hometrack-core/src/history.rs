//! The append-only, ordered event log of one property and the pure fold that
//! derives its current state and history-based attributes.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    Address, DataSource, EventId, EventPayload, HistoryEvent, Property, PropertyFacts,
    PropertyId, PropertyStatus, PropertyType, Revision,
};

/// Storage order: event time, then ingestion time, then source, then id.
pub fn event_order(a: &HistoryEvent, b: &HistoryEvent) -> Ordering {
    a.event_at
        .cmp(&b.event_at)
        .then_with(|| a.ingested_at.cmp(&b.ingested_at))
        .then_with(|| a.source_id.cmp(&b.source_id))
        .then_with(|| a.id.cmp(&b.id))
}

/// Events of one property, kept sorted by [`event_order`]. Insertion is
/// positional; nothing is ever removed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HistoryLog {
    events: Vec<HistoryEvent>,
}

impl HistoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a log from events in any order. Duplicate ids keep the first occurrence.
    pub fn from_events(events: impl IntoIterator<Item = HistoryEvent>) -> Self {
        let mut log = Self::new();
        for event in events {
            log.insert(event);
        }
        log
    }

    /// Inserts `event` at its ordered position and returns that position, or
    /// `None` when an identical event (same id) is already recorded.
    pub fn insert(&mut self, event: HistoryEvent) -> Option<usize> {
        if self.contains(event.id) {
            return None;
        }
        let at = self
            .events
            .partition_point(|existing| event_order(existing, &event) == Ordering::Less);
        self.events.insert(at, event);
        Some(at)
    }

    pub fn contains(&self, id: EventId) -> bool {
        self.events.iter().any(|e| e.id == id)
    }

    pub fn get(&self, id: EventId) -> Option<&HistoryEvent> {
        self.events.iter().find(|e| e.id == id)
    }

    pub fn events(&self) -> &[HistoryEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn for_source<'a>(&'a self, source_id: &'a str) -> impl Iterator<Item = &'a HistoryEvent> {
        self.events.iter().filter(move |e| e.source_id == source_id)
    }

    /// True when a later correction withdrew the event.
    pub fn is_retracted(&self, id: EventId) -> bool {
        self.events.iter().any(|e| {
            matches!(
                &e.payload,
                EventPayload::DataCorrection(c)
                    if c.corrects == Some(id) && c.revision == Revision::Retracted
            )
        })
    }

    /// The timeline with corrections applied: retracted events are dropped,
    /// restated prices replace the original ones, and fact revisions stay in
    /// place so the fold can overlay them. Price and retraction corrections
    /// themselves are not part of the result.
    pub fn effective_events(&self) -> Vec<HistoryEvent> {
        let mut retracted = HashSet::new();
        let mut restated: HashMap<EventId, Option<f64>> = HashMap::new();
        for event in &self.events {
            if let EventPayload::DataCorrection(correction) = &event.payload {
                let Some(target) = correction.corrects else {
                    continue;
                };
                match &correction.revision {
                    Revision::Retracted => {
                        retracted.insert(target);
                    }
                    Revision::Price { price } => {
                        restated.insert(target, *price);
                    }
                    Revision::Facts { .. } => {}
                }
            }
        }

        self.events
            .iter()
            .filter(|e| !retracted.contains(&e.id))
            .filter_map(|e| match &e.payload {
                EventPayload::DataCorrection(c) => match c.revision {
                    Revision::Facts { .. } => Some(e.clone()),
                    _ => None,
                },
                payload => {
                    let mut effective = e.clone();
                    if let Some(price) = restated.get(&e.id) {
                        effective.payload = payload.with_price(*price);
                    }
                    Some(effective)
                }
            })
            .collect()
    }

    /// Current state across sources. Each source's view is its own timeline
    /// folded in event order. Views are then applied in order of the source's
    /// latest ingestion (ties by source id), so the most recently ingested
    /// source that reports a status or price decides it. Fact revisions
    /// overlay in the same ingestion order. The log itself keeps event order.
    pub fn current_state(&self) -> CurrentState {
        let effective = self.effective_events();
        let mut timelines: BTreeMap<&str, Vec<HistoryEvent>> = BTreeMap::new();
        for event in &effective {
            timelines
                .entry(event.source_id.as_str())
                .or_default()
                .push(event.clone());
        }

        let mut views: Vec<(DateTime<Utc>, &str, CurrentState, bool)> = timelines
            .into_iter()
            .filter_map(|(source, events)| {
                let last_ingested = self.for_source(source).map(|e| e.ingested_at).max()?;
                let reports_status = events.iter().any(|e| e.payload.sets_status());
                Some((last_ingested, source, CurrentState::fold(&events), reports_status))
            })
            .collect();
        views.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));

        let mut state = CurrentState::default();
        for (_, _, view, reports_status) in views {
            if reports_status {
                state.status = view.status;
            }
            if view.price.is_some() {
                state.price = view.price;
            }
        }

        let mut revisions: Vec<&HistoryEvent> = effective
            .iter()
            .filter(|e| matches!(&e.payload, EventPayload::DataCorrection(c) if matches!(c.revision, Revision::Facts { .. })))
            .collect();
        revisions.sort_by(|a, b| {
            a.ingested_at
                .cmp(&b.ingested_at)
                .then_with(|| a.source_id.cmp(&b.source_id))
                .then_with(|| event_order(a, b))
        });
        for event in revisions {
            if let EventPayload::DataCorrection(c) = &event.payload {
                if let Revision::Facts { facts } = &c.revision {
                    state.facts = state.facts.overlay(facts);
                }
            }
        }

        state.sources = self.data_sources();
        state.last_updated = self.events.iter().map(|e| e.ingested_at).max();
        state
    }

    /// Current state implied by one source's events alone.
    pub fn source_state(&self, source_id: &str) -> CurrentState {
        let events: Vec<HistoryEvent> = self
            .effective_events()
            .into_iter()
            .filter(|e| e.source_id == source_id)
            .collect();
        let mut state = CurrentState::fold(&events);
        state.last_updated = self.for_source(source_id).map(|e| e.ingested_at).max();
        state
    }

    /// The latest fact set a source reported, and the event that carried it.
    pub fn source_facts(&self, source_id: &str) -> (PropertyFacts, Option<EventId>) {
        let mut facts = PropertyFacts::default();
        let mut last = None;
        for event in self.for_source(source_id) {
            if let EventPayload::DataCorrection(c) = &event.payload {
                if let Revision::Facts { facts: revised } = &c.revision {
                    facts = facts.overlay(revised);
                    last = Some(event.id);
                }
            }
        }
        (facts, last)
    }

    pub fn data_sources(&self) -> Vec<DataSource> {
        let mut by_source: BTreeMap<&str, DataSource> = BTreeMap::new();
        for event in &self.events {
            by_source
                .entry(event.source_id.as_str())
                .and_modify(|s| {
                    s.first_ingested_at = s.first_ingested_at.min(event.ingested_at);
                    s.last_ingested_at = s.last_ingested_at.max(event.ingested_at);
                    s.event_count += 1;
                })
                .or_insert_with(|| DataSource {
                    source_id: event.source_id.clone(),
                    first_ingested_at: event.ingested_at,
                    last_ingested_at: event.ingested_at,
                    event_count: 1,
                });
        }
        by_source.into_values().collect()
    }

    pub fn derived(&self) -> DerivedHistory {
        DerivedHistory::from_events(&self.effective_events())
    }

    /// Replays the whole log into a Property. `None` for an empty log.
    pub fn project(&self, id: &PropertyId, address: &Address) -> Option<Property> {
        let state = self.current_state();
        let last_updated = state.last_updated?;
        Some(Property {
            id: id.clone(),
            address: address.clone(),
            property_type: state.facts.property_type.unwrap_or_default(),
            living_area_sqft: state.facts.living_area_sqft,
            lot_area_sqft: state.facts.lot_area_sqft,
            bedrooms: state.facts.bedrooms,
            bathrooms: state.facts.bathrooms,
            year_built: state.facts.year_built,
            status: state.status,
            price: state.price,
            last_updated,
            sources: state.sources,
        })
    }
}

/// Result of folding an ordered event sequence left to right.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CurrentState {
    pub facts: PropertyFacts,
    pub status: PropertyStatus,
    pub price: Option<f64>,
    pub last_updated: Option<DateTime<Utc>>,
    pub sources: Vec<DataSource>,
}

impl CurrentState {
    /// Folds one timeline left to right in the order given, normally storage
    /// order, so later events win. This is a single source's view; the
    /// cross-source precedence by ingestion time lives in
    /// [`HistoryLog::current_state`].
    pub fn fold(events: &[HistoryEvent]) -> Self {
        let mut state = CurrentState::default();
        for event in events {
            match &event.payload {
                EventPayload::Listed { price } => {
                    state.status = PropertyStatus::Active;
                    state.price = price.or(state.price);
                }
                EventPayload::PriceChange { new_price, .. } => {
                    state.price = Some(*new_price);
                }
                EventPayload::StatusChange { to, .. } => state.status = *to,
                EventPayload::Pending => state.status = PropertyStatus::Pending,
                EventPayload::Sold { price } => {
                    state.status = PropertyStatus::Sold;
                    state.price = price.or(state.price);
                }
                EventPayload::Delisted => state.status = PropertyStatus::OffMarket,
                EventPayload::DataCorrection(c) => {
                    if let Revision::Facts { facts } = &c.revision {
                        state.facts = state.facts.overlay(facts);
                    }
                }
            }
        }
        state
    }

    pub fn property_type(&self) -> PropertyType {
        self.facts.property_type.unwrap_or_default()
    }
}

/// Attributes that need a walk over the history rather than the current state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DerivedHistory {
    pub price_decreased: bool,
    pub listed_at: Vec<DateTime<Utc>>,
    pub pending_at: Vec<DateTime<Utc>>,
    pub sold_at: Vec<DateTime<Utc>>,
    /// Asking price in force just before the latest sale.
    pub list_price_before_sale: Option<f64>,
    pub sold_price: Option<f64>,
}

impl DerivedHistory {
    /// `events` must already be in storage order with corrections applied.
    pub fn from_events(events: &[HistoryEvent]) -> Self {
        let mut derived = DerivedHistory::default();
        let mut asking: Option<(DateTime<Utc>, f64)> = None;

        for event in events {
            match &event.payload {
                EventPayload::Listed { price } => {
                    derived.listed_at.push(event.event_at);
                    if let Some(price) = price {
                        derived.note_asking(&mut asking, event.event_at, *price, None);
                    }
                }
                EventPayload::PriceChange { old_price, new_price } => {
                    derived.note_asking(&mut asking, event.event_at, *new_price, *old_price);
                }
                EventPayload::Pending => derived.pending_at.push(event.event_at),
                EventPayload::StatusChange { to, .. } => match to {
                    PropertyStatus::Pending => derived.pending_at.push(event.event_at),
                    PropertyStatus::Sold => derived.sold_at.push(event.event_at),
                    _ => {}
                },
                EventPayload::Sold { price } => {
                    derived.sold_at.push(event.event_at);
                    if price.is_some() {
                        derived.sold_price = *price;
                        derived.list_price_before_sale = asking
                            .filter(|(at, _)| *at <= event.event_at)
                            .map(|(_, p)| p);
                    }
                }
                EventPayload::Delisted | EventPayload::DataCorrection(_) => {}
            }
        }
        derived.pending_at.dedup();
        derived.sold_at.dedup();
        derived.listed_at.dedup();
        derived
    }

    fn note_asking(
        &mut self,
        asking: &mut Option<(DateTime<Utc>, f64)>,
        at: DateTime<Utc>,
        price: f64,
        stated_old: Option<f64>,
    ) {
        if stated_old.is_some_and(|old| price < old) {
            self.price_decreased = true;
        }
        // Same-instant asking prices are competing reports, not a change.
        if let Some((prev_at, prev)) = asking {
            if *prev_at < at && price < *prev {
                self.price_decreased = true;
            }
        }
        *asking = Some((at, price));
    }

    /// Whether the latest sale closed above the asking price that preceded it.
    pub fn sold_above_list(&self) -> bool {
        matches!(
            (self.sold_price, self.list_price_before_sale),
            (Some(sold), Some(list)) if sold > list
        )
    }

    pub fn listed_within(&self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> bool {
        any_within(&self.listed_at, from, to)
    }

    pub fn pending_within(&self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> bool {
        any_within(&self.pending_at, from, to)
    }

    pub fn sold_within(&self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> bool {
        any_within(&self.sold_at, from, to)
    }
}

fn any_within(times: &[DateTime<Utc>], from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> bool {
    times
        .iter()
        .any(|t| from.map_or(true, |f| *t >= f) && to.map_or(true, |u| *t <= u))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Correction;
    use chrono::TimeZone;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 12, 0, 0).single().unwrap()
    }

    fn pid() -> PropertyId {
        PropertyId::from_canonical("123 main st|apt 4b|seattle|wa|98101")
    }

    fn event(source: &str, at: u32, ingested: u32, payload: EventPayload) -> HistoryEvent {
        HistoryEvent::new(&pid(), source, day(at), day(ingested), payload)
    }

    #[test]
    fn late_events_are_inserted_in_timestamp_order() {
        let mut log = HistoryLog::new();
        log.insert(event("a", 3, 20, EventPayload::Sold { price: Some(1.0) }));
        log.insert(event("a", 1, 21, EventPayload::Listed { price: Some(2.0) }));
        let pos = log.insert(event("a", 2, 22, EventPayload::Pending));
        assert_eq!(pos, Some(1));
        let order: Vec<_> = log.events().iter().map(|e| e.event_at).collect();
        assert_eq!(order, vec![day(1), day(2), day(3)]);
    }

    #[test]
    fn duplicate_event_is_not_inserted_twice() {
        let mut log = HistoryLog::new();
        let e = event("a", 1, 2, EventPayload::Listed { price: Some(2.0) });
        assert!(log.insert(e.clone()).is_some());
        assert!(log.insert(e).is_none());
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn ties_on_event_time_break_by_ingestion_then_source() {
        let log = HistoryLog::from_events(vec![
            event("b", 5, 7, EventPayload::Sold { price: Some(505.0) }),
            event("a", 5, 6, EventPayload::Sold { price: Some(510.0) }),
            event("c", 5, 6, EventPayload::Sold { price: Some(499.0) }),
        ]);
        let sources: Vec<_> = log.events().iter().map(|e| e.source_id.as_str()).collect();
        assert_eq!(sources, vec!["a", "c", "b"]);
        // Most recent ingestion wins for current state.
        assert_eq!(log.current_state().price, Some(505.0));
    }

    #[test]
    fn fold_tracks_status_price_and_facts() {
        let facts = PropertyFacts {
            property_type: Some(PropertyType::Condo),
            bedrooms: Some(2.0),
            bathrooms: Some(1.5),
            ..Default::default()
        };
        let log = HistoryLog::from_events(vec![
            event("a", 1, 1, EventPayload::Listed { price: Some(500_000.0) }),
            event(
                "a",
                1,
                1,
                EventPayload::DataCorrection(Correction {
                    corrects: None,
                    revision: Revision::Facts { facts },
                }),
            ),
            event("a", 10, 10, EventPayload::PriceChange { old_price: Some(500_000.0), new_price: 480_000.0 }),
            event("a", 15, 15, EventPayload::Pending),
        ]);
        let property = log
            .project(&pid(), &crate::resolve(&crate::RawAddress::line("123 Main St, Apt 4B, Seattle, WA 98101")).unwrap().address)
            .unwrap();
        assert_eq!(property.status, PropertyStatus::Pending);
        assert_eq!(property.price, Some(480_000.0));
        assert_eq!(property.property_type, PropertyType::Condo);
        assert_eq!(property.bathrooms, Some(1.5));
        assert_eq!(property.last_updated, day(15));
        assert_eq!(property.sources.len(), 1);
        assert_eq!(property.sources[0].event_count, 4);
    }

    #[test]
    fn corrections_restate_or_retract_without_touching_the_log() {
        let listed = event("a", 1, 1, EventPayload::Listed { price: Some(500_000.0) });
        let cut = event("a", 5, 5, EventPayload::PriceChange { old_price: None, new_price: 450_000.0 });
        let restate = event(
            "a",
            1,
            6,
            EventPayload::DataCorrection(Correction {
                corrects: Some(listed.id),
                revision: Revision::Price { price: Some(520_000.0) },
            }),
        );
        let retract = event(
            "a",
            5,
            7,
            EventPayload::DataCorrection(Correction { corrects: Some(cut.id), revision: Revision::Retracted }),
        );
        let log = HistoryLog::from_events(vec![listed.clone(), cut.clone(), restate, retract]);

        assert_eq!(log.len(), 4);
        assert!(log.is_retracted(cut.id));
        let effective = log.effective_events();
        assert_eq!(effective.len(), 1);
        assert_eq!(effective[0].payload, EventPayload::Listed { price: Some(520_000.0) });
        assert_eq!(log.current_state().price, Some(520_000.0));
    }

    #[test]
    fn derived_history_compares_sale_to_preceding_asking_price() {
        let above = HistoryLog::from_events(vec![
            event("a", 1, 1, EventPayload::Listed { price: Some(500_000.0) }),
            event("a", 20, 20, EventPayload::Sold { price: Some(510_000.0) }),
        ]);
        assert!(above.derived().sold_above_list());
        assert!(!above.derived().price_decreased);

        let below = HistoryLog::from_events(vec![
            event("a", 1, 1, EventPayload::Listed { price: Some(500_000.0) }),
            event("a", 20, 20, EventPayload::Sold { price: Some(480_000.0) }),
        ]);
        assert!(!below.derived().sold_above_list());

        let after_cut = HistoryLog::from_events(vec![
            event("a", 1, 1, EventPayload::Listed { price: Some(500_000.0) }),
            event("a", 10, 10, EventPayload::PriceChange { old_price: Some(500_000.0), new_price: 470_000.0 }),
            event("a", 20, 20, EventPayload::Sold { price: Some(480_000.0) }),
        ]);
        let derived = after_cut.derived();
        assert!(derived.price_decreased);
        assert!(derived.sold_above_list());
        assert!(derived.sold_within(Some(day(19)), Some(day(21))));
        assert!(!derived.listed_within(Some(day(2)), None));
    }

    #[test]
    fn most_recently_ingested_source_decides_current_status() {
        let log = HistoryLog::from_events(vec![
            event("redfin", 1, 25, EventPayload::Listed { price: Some(500_000.0) }),
            event("redfin", 20, 25, EventPayload::Pending),
            event("zillow", 1, 26, EventPayload::Listed { price: Some(495_000.0) }),
        ]);
        // zillow's timeline is older but it was ingested last.
        let state = log.current_state();
        assert_eq!(state.status, PropertyStatus::Active);
        assert_eq!(state.price, Some(495_000.0));

        // Within one source the timeline still follows event time.
        assert_eq!(log.source_state("redfin").status, PropertyStatus::Pending);

        // A source that only revised facts does not override status or price.
        let facts_only = HistoryLog::from_events(vec![
            event("redfin", 20, 25, EventPayload::Sold { price: Some(510_000.0) }),
            event(
                "zillow",
                26,
                26,
                EventPayload::DataCorrection(Correction {
                    corrects: None,
                    revision: Revision::Facts {
                        facts: PropertyFacts {
                            bedrooms: Some(3.0),
                            ..Default::default()
                        },
                    },
                }),
            ),
        ]);
        let state = facts_only.current_state();
        assert_eq!(state.status, PropertyStatus::Sold);
        assert_eq!(state.price, Some(510_000.0));
        assert_eq!(state.facts.bedrooms, Some(3.0));
    }

    #[test]
    fn source_views_only_see_their_own_events() {
        let log = HistoryLog::from_events(vec![
            event("a", 1, 1, EventPayload::Listed { price: Some(1.0) }),
            event("b", 2, 2, EventPayload::Pending),
        ]);
        assert_eq!(log.source_state("a").status, PropertyStatus::Active);
        assert_eq!(log.source_state("b").status, PropertyStatus::Pending);
        assert_eq!(log.current_state().status, PropertyStatus::Pending);
        assert_eq!(log.data_sources().len(), 2);
    }
}
