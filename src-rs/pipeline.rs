//! Per-category retrieval state machine.
//!
//! The pipeline does no I/O itself. `select`, `retry` and `reload` return
//! [`FetchRequest`]s; whoever owns the pipeline runs them (see
//! [`crate::dispatch`]) and feeds results back through
//! [`RetrievalPipeline::complete`]. Every request carries a ticket, and the
//! active view remembers which tickets it is waiting on. After a key change
//! a late result for the old key finds no waiter and leaves the display alone.

use crate::cache::ContentCache;
use crate::content::{parse_sections, parse_single_section, ContentSections, Section};
use crate::error::{ContentError, GenerationError};
use crate::generator::{section_prompt, sections_prompt, TextGenerator, Turn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Shown for every failed section regardless of the underlying cause.
pub const FAILED_MESSAGE: &str = "Failed to load information. Please try again later.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FetchTicket(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchScope {
    All,
    Section(Section),
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub ticket: FetchTicket,
    pub key: String,
    pub scope: FetchScope,
    pub turns: Vec<Turn>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "text", rename_all = "snake_case")]
pub enum SectionState {
    Loading,
    Ready(String),
    Failed(String),
}

impl SectionState {
    pub fn text(&self) -> Option<&str> {
        match self {
            SectionState::Ready(text) => Some(text),
            _ => None,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, SectionState::Loading)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, SectionState::Failed(_))
    }
}

/// The four section states of the active category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectionBoard {
    pub general: SectionState,
    pub symptoms: SectionState,
    pub treatment: SectionState,
    pub prevention: SectionState,
}

impl SectionBoard {
    fn uniform(state: SectionState) -> Self {
        Self {
            general: state.clone(),
            symptoms: state.clone(),
            treatment: state.clone(),
            prevention: state,
        }
    }

    pub fn loading() -> Self {
        Self::uniform(SectionState::Loading)
    }

    pub fn failed(message: &str) -> Self {
        Self::uniform(SectionState::Failed(message.to_string()))
    }

    pub fn ready(record: &ContentSections) -> Self {
        Self {
            general: SectionState::Ready(record.general.clone()),
            symptoms: SectionState::Ready(record.symptoms.clone()),
            treatment: SectionState::Ready(record.treatment.clone()),
            prevention: SectionState::Ready(record.prevention.clone()),
        }
    }

    pub fn get(&self, section: Section) -> &SectionState {
        match section {
            Section::General => &self.general,
            Section::Symptoms => &self.symptoms,
            Section::Treatment => &self.treatment,
            Section::Prevention => &self.prevention,
        }
    }

    fn set(&mut self, section: Section, state: SectionState) {
        let slot = match section {
            Section::General => &mut self.general,
            Section::Symptoms => &mut self.symptoms,
            Section::Treatment => &mut self.treatment,
            Section::Prevention => &mut self.prevention,
        };
        *slot = state;
    }

    /// A full record when every section is ready.
    pub fn record(&self) -> Option<ContentSections> {
        Some(ContentSections {
            general: self.general.text()?.to_string(),
            symptoms: self.symptoms.text()?.to_string(),
            treatment: self.treatment.text()?.to_string(),
            prevention: self.prevention.text()?.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    Dispatched(FetchRequest),
    /// The section (or the whole key) already has a fetch in flight.
    AlreadyPending,
    /// The key is not the one currently displayed.
    NotActive,
}

impl PartialEq for FetchRequest {
    fn eq(&self, other: &Self) -> bool {
        self.ticket == other.ticket
    }
}

impl Eq for FetchRequest {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The result updated the active view.
    Applied {
        key: String,
        scope: FetchScope,
        success: bool,
    },
    /// The view moved on; only the cache may have been updated.
    Stale { key: String, scope: FetchScope },
    /// The ticket was never issued or already completed.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type BoardObserver = Box<dyn FnMut(&str, &SectionBoard)>;

struct ActiveView {
    key: String,
    generation: u64,
    board: SectionBoard,
    awaiting: HashMap<FetchTicket, FetchScope>,
    /// A full fetch is owed once the key's current fetch lands.
    deferred: bool,
}

pub struct RetrievalPipeline {
    cache: Arc<ContentCache>,
    active: Option<ActiveView>,
    /// At most one outstanding fetch per category key.
    in_flight: HashMap<String, (FetchScope, FetchTicket)>,
    tickets: HashMap<FetchTicket, (String, FetchScope)>,
    next_ticket: u64,
    generation: u64,
    observers: Vec<(SubscriptionId, BoardObserver)>,
    next_subscription: u64,
}

impl RetrievalPipeline {
    pub fn new(cache: Arc<ContentCache>) -> Self {
        Self {
            cache,
            active: None,
            in_flight: HashMap::new(),
            tickets: HashMap::new(),
            next_ticket: 0,
            generation: 0,
            observers: Vec::new(),
            next_subscription: 0,
        }
    }

    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    pub fn active_key(&self) -> Option<&str> {
        self.active.as_ref().map(|view| view.key.as_str())
    }

    /// Bumped on every key change.
    pub fn generation(&self) -> u64 {
        self.active.as_ref().map_or(self.generation, |view| view.generation)
    }

    pub fn states(&self) -> Option<&SectionBoard> {
        self.active.as_ref().map(|view| &view.board)
    }

    pub fn has_in_flight(&self, key: &str) -> bool {
        self.in_flight.contains_key(key)
    }

    pub fn subscribe(&mut self, observer: impl FnMut(&str, &SectionBoard) + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.observers.push((id, Box::new(observer)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(sid, _)| *sid != id);
        self.observers.len() != before
    }

    fn notify(&mut self) {
        if let Some(view) = &self.active {
            for (_, observer) in &mut self.observers {
                observer(&view.key, &view.board);
            }
        }
    }

    fn issue(&mut self, key: &str, scope: FetchScope) -> FetchRequest {
        let ticket = FetchTicket(self.next_ticket);
        self.next_ticket += 1;
        self.in_flight.insert(key.to_string(), (scope, ticket));
        self.tickets.insert(ticket, (key.to_string(), scope));
        let turns = match scope {
            FetchScope::All => sections_prompt(key),
            FetchScope::Section(section) => section_prompt(key, section),
        };
        log::debug!("issuing {scope:?} fetch for {key} as {ticket:?}");
        FetchRequest {
            ticket,
            key: key.to_string(),
            scope,
            turns,
        }
    }

    /// Make `key` the displayed category. Returns the remote request to run,
    /// if one is needed.
    ///
    /// A miss while a section retry for `key` is still out defers the full
    /// fetch; [`take_deferred`](Self::take_deferred) hands it out later.
    pub fn select(&mut self, key: &str) -> Option<FetchRequest> {
        if self.active_key() == Some(key) {
            return None;
        }
        self.generation += 1;
        let mut view = ActiveView {
            key: key.to_string(),
            generation: self.generation,
            board: SectionBoard::loading(),
            awaiting: HashMap::new(),
            deferred: false,
        };

        let request = if let Some(record) = self.cache.get(key) {
            log::debug!("content cache hit for {key}");
            view.board = SectionBoard::ready(&record);
            None
        } else {
            match self.in_flight.get(key).copied() {
                Some((FetchScope::All, ticket)) => {
                    log::debug!("joining in-flight fetch {ticket:?} for {key}");
                    view.awaiting.insert(ticket, FetchScope::All);
                    None
                }
                Some((scope, ticket)) => {
                    log::debug!("deferring fetch for {key} behind {scope:?} {ticket:?}");
                    view.deferred = true;
                    None
                }
                None => {
                    let request = self.issue(key, FetchScope::All);
                    view.awaiting.insert(request.ticket, FetchScope::All);
                    Some(request)
                }
            }
        };

        self.active = Some(view);
        self.notify();
        request
    }

    /// Refetch one section of the active category.
    ///
    /// Only one fetch per key runs at a time, so a retry while any other
    /// fetch for `key` is out is refused with `AlreadyPending`.
    pub fn retry(&mut self, key: &str, section: Section) -> RetryOutcome {
        let scope = FetchScope::Section(section);
        let busy = match &self.active {
            Some(view) if view.key == key => {
                view.deferred || view.awaiting.values().any(|s| *s == FetchScope::All || *s == scope)
            }
            _ => return RetryOutcome::NotActive,
        };
        if busy {
            return RetryOutcome::AlreadyPending;
        }

        let (ticket, outcome) = match self.in_flight.get(key).copied() {
            Some((running, ticket)) if running == scope => (ticket, RetryOutcome::AlreadyPending),
            Some((running, ticket)) => {
                log::debug!("{section} retry for {key} refused while {running:?} {ticket:?} runs");
                return RetryOutcome::AlreadyPending;
            }
            None => {
                let request = self.issue(key, scope);
                (request.ticket, RetryOutcome::Dispatched(request))
            }
        };
        if let Some(view) = self.active.as_mut() {
            view.awaiting.insert(ticket, scope);
            view.board.set(section, SectionState::Loading);
        }
        self.notify();
        outcome
    }

    /// Drop the cached record for the active category and fetch it again.
    ///
    /// Joins a full fetch already in flight. When a section retry is still
    /// out the new fetch is deferred until it lands.
    pub fn reload(&mut self) -> Option<FetchRequest> {
        let key = self.active.as_ref()?.key.clone();
        self.cache.invalidate(&key);

        let (ticket, request) = match self.in_flight.get(&key).copied() {
            Some((FetchScope::All, ticket)) => (Some(ticket), None),
            Some(_) => (None, None),
            None => {
                let request = self.issue(&key, FetchScope::All);
                (Some(request.ticket), Some(request))
            }
        };
        if let Some(view) = self.active.as_mut() {
            view.awaiting.clear();
            match ticket {
                Some(ticket) => {
                    view.awaiting.insert(ticket, FetchScope::All);
                    view.deferred = false;
                }
                None => view.deferred = true,
            }
            view.board = SectionBoard::loading();
        }
        self.notify();
        request
    }

    /// The full fetch held back by `select` or `reload`, once nothing else
    /// for the active key is in flight. A cache hit by then fills the board
    /// instead.
    pub fn take_deferred(&mut self) -> Option<FetchRequest> {
        let view = self.active.as_ref()?;
        if !view.deferred || self.in_flight.contains_key(&view.key) {
            return None;
        }
        let key = view.key.clone();
        let cached = self.cache.get(&key);
        let request = match cached {
            Some(_) => None,
            None => Some(self.issue(&key, FetchScope::All)),
        };
        if let Some(view) = self.active.as_mut() {
            view.deferred = false;
            match (&request, cached) {
                (Some(request), _) => {
                    view.awaiting.insert(request.ticket, FetchScope::All);
                }
                (None, Some(record)) => view.board = SectionBoard::ready(&record),
                (None, None) => {}
            }
        }
        self.notify();
        request
    }

    /// Apply the result of a request issued earlier.
    pub fn complete(&mut self, ticket: FetchTicket, result: Result<String, GenerationError>) -> Completion {
        let Some((key, scope)) = self.tickets.remove(&ticket) else {
            log::warn!("completion for unknown ticket {ticket:?}");
            return Completion::Unknown;
        };
        if self.in_flight.get(&key).is_some_and(|(_, running)| *running == ticket) {
            self.in_flight.remove(&key);
        }

        let awaited = match self.active.as_mut() {
            Some(view) if view.key == key => view.awaiting.remove(&ticket).is_some(),
            _ => false,
        };

        let success = match scope {
            FetchScope::All => {
                let parsed = result
                    .map_err(ContentError::from)
                    .and_then(|raw| parse_sections(&raw));
                match &parsed {
                    Ok(record) => {
                        if let Err(err) = self.cache.put(&key, record.clone()) {
                            log::warn!("refusing to cache content for {key}: {err}");
                        }
                    }
                    Err(err) => log::warn!("content fetch for {key} failed: {err}"),
                }
                if !awaited {
                    log::debug!("discarding stale result {ticket:?} for {key}");
                    return Completion::Stale { key, scope };
                }
                let Some(view) = self.active.as_mut() else {
                    return Completion::Stale { key, scope };
                };
                view.board = match &parsed {
                    Ok(record) => SectionBoard::ready(record),
                    Err(_) => SectionBoard::failed(FAILED_MESSAGE),
                };
                parsed.is_ok()
            }
            FetchScope::Section(section) => {
                if !awaited {
                    log::debug!("discarding stale {section} result {ticket:?} for {key}");
                    return Completion::Stale { key, scope };
                }
                let parsed = result
                    .map_err(ContentError::from)
                    .and_then(|raw| parse_single_section(&raw, section));
                let Some(view) = self.active.as_mut() else {
                    return Completion::Stale { key, scope };
                };
                match parsed {
                    Ok(text) => {
                        view.board.set(section, SectionState::Ready(text.clone()));
                        let complete = view.board.record();
                        self.store_section(&key, section, &text, complete);
                        true
                    }
                    Err(err) => {
                        log::warn!("{section} retry for {key} failed: {err}");
                        view.board.set(section, SectionState::Failed(FAILED_MESSAGE.to_string()));
                        false
                    }
                }
            }
        };

        self.notify();
        Completion::Applied { key, scope, success }
    }

    fn store_section(&self, key: &str, section: Section, text: &str, complete: Option<ContentSections>) {
        match self.cache.replace_section(key, section, text) {
            Ok(Some(_)) => {}
            Ok(None) => {
                if let Some(record) = complete {
                    if let Err(err) = self.cache.put(key, record) {
                        log::warn!("refusing to cache content for {key}: {err}");
                    }
                }
            }
            Err(err) => log::warn!("refusing to update cached {section} for {key}: {err}"),
        }
    }

    /// Run one request on the calling thread and apply its result.
    pub fn fetch_blocking(&mut self, generator: &dyn TextGenerator, request: FetchRequest) -> Completion {
        let result = generator.generate(&request.turns);
        self.complete(request.ticket, result)
    }

    /// Select `key` and, on a cache miss, fetch it on the calling thread.
    pub fn retrieve(&mut self, generator: &dyn TextGenerator, key: &str) -> Option<&SectionBoard> {
        if let Some(request) = self.select(key) {
            self.fetch_blocking(generator, request);
        }
        self.states()
    }
}
