//! Script automaton
//!
//! A finite-state machine driven by chunks of process output. Each state
//! owns an ordered list of transitions; the first whose condition matches
//! the input is taken, with the epsilon transition (if any) tried last.
//! Actions run on arrival at a state and optionally on departure, and may
//! be asynchronous.
//!
//! Input that matches nothing is kept and prepended to the next symbol,
//! so prompts split across chunks are still recognised.

pub mod condition;
pub mod remote;
pub mod sugar;

use std::fmt;
use std::future::Future;
use std::mem;
use std::panic::Location;
use std::rc::Rc;
use std::time::Duration;

use futures_util::future::{FutureExt, LocalBoxFuture};
use log::{debug, trace};
use thiserror::Error;
use tokio::time::Instant;

use crate::terminal::stream::OutputStream;
use condition::Condition;

pub type StateId = usize;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AutomatonError {
    #[error("duplicate transition from state {from} on {key:?}")]
    DuplicateTransition { from: StateId, key: String },
    #[error("branch condition {0:?} would consume input")]
    ConsumingCondition(String),
    #[error("Endif without matching If")]
    EndifWithoutIf,
    #[error("Else without matching If")]
    ElseWithoutIf,
    #[error("unknown state {0}")]
    UnknownState(StateId),
    #[error("epsilon transitions loop through state {state}")]
    EpsilonCycle { state: StateId },
    #[error("{0} If block(s) left open")]
    UnclosedIf(usize),
    #[error("script step needs a remote control")]
    NoRemoteControl,
    #[error("automaton has no states")]
    NotStarted,
}

/// One unit of input
#[derive(Debug, Clone, PartialEq)]
pub struct Symbol {
    pub text: String,
    pub stream: Option<OutputStream>,
}

impl From<&str> for Symbol {
    fn from(text: &str) -> Self {
        Self {
            text: text.to_string(),
            stream: None,
        }
    }
}

impl From<String> for Symbol {
    fn from(text: String) -> Self {
        Self { text, stream: None }
    }
}

impl From<OutputStream> for Symbol {
    fn from(stream: OutputStream) -> Self {
        Self {
            text: stream.plain_text().to_string(),
            stream: Some(stream),
        }
    }
}

/// What an action is invoked with
#[derive(Debug, Clone, Default)]
pub struct ActionInput {
    pub symbol: Option<Symbol>,
    /// Symbol text including any accumulated residue
    pub text: Option<String>,
}

type ActionFn = dyn Fn(ActionInput) -> LocalBoxFuture<'static, Option<String>>;

/// State or transition action; the returned value is kept on the state
#[derive(Clone)]
pub struct Action(Rc<ActionFn>);

impl Action {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(ActionInput) -> Fut + 'static,
        Fut: Future<Output = Option<String>> + 'static,
    {
        Action(Rc::new(
            move |input: ActionInput| -> LocalBoxFuture<'static, Option<String>> {
                f(input).boxed_local()
            },
        ))
    }

    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&ActionInput) -> Option<String> + 'static,
    {
        Action::new(move |input| {
            let value = f(&input);
            async move { value }
        })
    }

    pub async fn run(&self, input: ActionInput) -> Option<String> {
        (self.0)(input).await
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Action")
    }
}

/// Duration of a wait step
#[derive(Clone)]
pub enum WaitTime {
    Fixed(Duration),
    /// Evaluated each time the state is entered
    Dynamic(Rc<dyn Fn() -> Duration>),
}

impl WaitTime {
    fn resolve(&self) -> Duration {
        match self {
            WaitTime::Fixed(d) => *d,
            WaitTime::Dynamic(f) => f(),
        }
    }
}

impl From<Duration> for WaitTime {
    fn from(d: Duration) -> Self {
        WaitTime::Fixed(d)
    }
}

#[derive(Clone)]
enum Arrival {
    Action(Action),
    Wait(WaitTime),
}

#[derive(Clone)]
enum Depart {
    Action(Action),
    /// Stash the symbol while a wait is pending
    Buffer,
}

#[derive(Clone)]
struct Transition {
    condition: Condition,
    target: StateId,
    depart: Option<Depart>,
    /// Installed for the duration of a wait
    temporary: bool,
}

/// Public description of a state, passed to listeners
#[derive(Debug, Clone)]
pub struct StateInfo {
    pub index: StateId,
    pub name: String,
    pub description: String,
    /// Builder call that created the state
    pub location: Option<&'static Location<'static>>,
    pub is_start: bool,
    pub is_end: bool,
}

struct State {
    info: StateInfo,
    transitions: Vec<Transition>,
    arrival: Option<Arrival>,
    value: Option<String>,
}

/// What to do when a transition with the same condition already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDuplicate {
    Error,
    Ignore,
    Overwrite,
}

struct PendingWait {
    state: StateId,
    deadline: Instant,
    buffered: Vec<Symbol>,
}

pub type StateListener = Box<dyn FnMut(&StateInfo)>;

pub struct Automaton {
    states: Vec<State>,
    start: Option<StateId>,
    current: Option<StateId>,
    /// Unmatched input carried to the next symbol
    accumulation: String,
    accumulate: bool,
    wait: Option<PendingWait>,
    listeners: Vec<StateListener>,
}

impl Default for Automaton {
    fn default() -> Self {
        Self::new()
    }
}

impl Automaton {
    pub fn new() -> Self {
        Self {
            states: Vec::new(),
            start: None,
            current: None,
            accumulation: String::new(),
            accumulate: true,
            wait: None,
            listeners: Vec::new(),
        }
    }

    pub fn set_accumulate(&mut self, accumulate: bool) {
        self.accumulate = accumulate;
        if !accumulate {
            self.accumulation.clear();
        }
    }

    /// Add a state; the first one becomes the start state
    pub fn add_state(
        &mut self,
        name: &str,
        description: &str,
        location: Option<&'static Location<'static>>,
    ) -> StateId {
        let index = self.states.len();
        let is_start = self.start.is_none();
        self.states.push(State {
            info: StateInfo {
                index,
                name: name.to_string(),
                description: description.to_string(),
                location,
                is_start,
                is_end: false,
            },
            transitions: Vec::new(),
            arrival: None,
            value: None,
        });
        if is_start {
            self.start = Some(index);
            self.current = Some(index);
        }
        index
    }

    fn state_mut(&mut self, id: StateId) -> Result<&mut State, AutomatonError> {
        self.states.get_mut(id).ok_or(AutomatonError::UnknownState(id))
    }

    pub fn set_start(&mut self, id: StateId) -> Result<(), AutomatonError> {
        self.state_mut(id)?;
        if let Some(old) = self.start {
            self.states[old].info.is_start = false;
        }
        self.states[id].info.is_start = true;
        self.start = Some(id);
        Ok(())
    }

    pub fn mark_end(&mut self, id: StateId) -> Result<(), AutomatonError> {
        self.state_mut(id)?.info.is_end = true;
        Ok(())
    }

    pub fn set_arrival_action(&mut self, id: StateId, action: Action) -> Result<(), AutomatonError> {
        self.state_mut(id)?.arrival = Some(Arrival::Action(action));
        Ok(())
    }

    /// Make `id` a wait state: input arriving before the timer runs out
    /// is held back and replayed afterwards
    pub fn set_wait(&mut self, id: StateId, time: WaitTime) -> Result<(), AutomatonError> {
        self.state_mut(id)?.arrival = Some(Arrival::Wait(time));
        Ok(())
    }

    pub fn add_transition(
        &mut self,
        from: StateId,
        condition: Condition,
        to: StateId,
        depart: Option<Action>,
        on_duplicate: OnDuplicate,
    ) -> Result<(), AutomatonError> {
        if to >= self.states.len() {
            return Err(AutomatonError::UnknownState(to));
        }
        let key = condition.key();
        let state = self.state_mut(from)?;
        let transition = Transition {
            condition,
            target: to,
            depart: depart.map(Depart::Action),
            temporary: false,
        };

        match state
            .transitions
            .iter()
            .position(|t| !t.temporary && t.condition.key() == key)
        {
            None => state.transitions.push(transition),
            Some(_) if on_duplicate == OnDuplicate::Ignore => {}
            Some(existing) if on_duplicate == OnDuplicate::Overwrite => {
                state.transitions[existing] = transition;
            }
            Some(_) => return Err(AutomatonError::DuplicateTransition { from, key }),
        }
        Ok(())
    }

    pub fn on_state_entered(&mut self, listener: impl FnMut(&StateInfo) + 'static) {
        self.listeners.push(Box::new(listener));
    }

    pub fn state_info(&self, id: StateId) -> Option<&StateInfo> {
        self.states.get(id).map(|s| &s.info)
    }

    pub fn current_state(&self) -> Option<&StateInfo> {
        self.current.and_then(|id| self.state_info(id))
    }

    /// Value returned by the state's last arrival action
    pub fn value(&self, id: StateId) -> Option<&str> {
        self.states.get(id).and_then(|s| s.value.as_deref())
    }

    pub fn accumulation(&self) -> &str {
        &self.accumulation
    }

    pub fn is_accepting(&self) -> bool {
        self.current_state().is_some_and(|s| s.is_end)
    }

    pub fn is_waiting(&self) -> bool {
        self.wait.is_some()
    }

    pub fn wait_deadline(&self) -> Option<Instant> {
        self.wait.as_ref().map(|w| w.deadline)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Back to the start state with no pending input
    pub fn reset(&mut self) {
        if let Some(wait) = self.wait.take() {
            self.states[wait.state].transitions.retain(|t| !t.temporary);
        }
        self.current = self.start;
        self.accumulation.clear();
    }

    fn find_transition(&self, state: StateId, text: Option<&str>) -> Option<usize> {
        let transitions = &self.states[state].transitions;
        // A pending wait holds the state in place
        let allow_epsilon = !matches!(&self.wait, Some(w) if w.state == state);

        transitions
            .iter()
            .position(|t| !t.condition.is_epsilon() && t.condition.matches(text))
            .or_else(|| {
                allow_epsilon
                    .then(|| transitions.iter().position(|t| t.condition.is_epsilon()))
                    .flatten()
            })
    }

    fn begin_wait(&mut self, state: StateId, duration: Duration) {
        if self.wait.is_some() {
            return;
        }
        debug!("State {} waiting {:?}", state, duration);
        self.states[state].transitions.insert(
            0,
            Transition {
                condition: Condition::Contains(String::new()),
                target: state,
                depart: Some(Depart::Buffer),
                temporary: true,
            },
        );
        self.wait = Some(PendingWait {
            state,
            deadline: Instant::now() + duration,
            buffered: Vec::new(),
        });
    }

    async fn arrive(&mut self, state: StateId, input: ActionInput) {
        match self.states[state].arrival.clone() {
            Some(Arrival::Action(action)) => {
                let value = action.run(input).await;
                self.states[state].value = value;
            }
            Some(Arrival::Wait(time)) => self.begin_wait(state, time.resolve()),
            None => {}
        }
    }

    fn notify(&mut self, state: StateId) {
        let info = self.states[state].info.clone();
        for listener in &mut self.listeners {
            listener(&info);
        }
    }

    /// Feed one symbol (or `None` to follow epsilon transitions only).
    ///
    /// Keeps moving while transitions apply: after a consuming transition
    /// the chain continues without input. Returns whether any transition
    /// was taken.
    pub async fn input(&mut self, symbol: Option<Symbol>) -> Result<bool, AutomatonError> {
        let mut symbol = symbol;
        let mut moved = false;
        // States entered since input was last consumed
        let mut trail: Vec<StateId> = Vec::new();

        loop {
            let current = self.current.ok_or(AutomatonError::NotStarted)?;

            let mut text = symbol.as_ref().map(|s| s.text.clone());
            if self.accumulate && !self.accumulation.is_empty() {
                if let Some(t) = text.as_mut() {
                    t.insert_str(0, &mem::take(&mut self.accumulation));
                }
            }

            let Some(index) = self.find_transition(current, text.as_deref()) else {
                if let Some(text) = text {
                    if self.accumulate {
                        self.accumulation = text;
                    }
                }
                return Ok(moved);
            };
            let transition = self.states[current].transitions[index].clone();

            if let (Some(symbol), Some(text)) = (symbol.as_mut(), text.as_ref()) {
                symbol.text.clone_from(text);
            }
            let input = ActionInput {
                symbol: symbol.clone(),
                text,
            };

            match &transition.depart {
                Some(Depart::Action(action)) => {
                    action.run(input.clone()).await;
                }
                Some(Depart::Buffer) => {
                    if let (Some(wait), Some(symbol)) = (self.wait.as_mut(), symbol.clone()) {
                        trace!("Holding {:?} until wait ends", symbol.text);
                        wait.buffered.push(symbol);
                    }
                }
                None => {}
            }

            let consumes = transition.condition.consumes();
            if consumes {
                trail.clear();
            } else if trail.contains(&transition.target) {
                return Err(AutomatonError::EpsilonCycle {
                    state: transition.target,
                });
            } else {
                trail.push(transition.target);
            }

            trace!("State {} -> {}", current, transition.target);
            self.current = Some(transition.target);
            moved = true;
            self.arrive(transition.target, input).await;
            self.notify(transition.target);

            if consumes {
                symbol = None;
            }
        }
    }

    /// End a pending wait: restore the state's transitions, move on, then
    /// replay the held symbols in arrival order
    pub async fn finish_wait(&mut self) -> Result<bool, AutomatonError> {
        let Some(wait) = self.wait.take() else {
            return Ok(false);
        };
        self.states[wait.state].transitions.retain(|t| !t.temporary);
        debug!(
            "Wait in state {} over, replaying {} symbols",
            wait.state,
            wait.buffered.len()
        );

        let mut moved = self.input(None).await?;
        for symbol in wait.buffered {
            moved |= self.input(Some(symbol)).await?;
        }
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn recorder() -> (Rc<RefCell<Vec<String>>>, impl Fn(&str) -> Action) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let log_for_actions = log.clone();
        let make = move |label: &str| {
            let log = log_for_actions.clone();
            let label = label.to_string();
            Action::sync(move |_| {
                log.borrow_mut().push(label.clone());
                None
            })
        };
        (log, make)
    }

    #[tokio::test]
    async fn test_first_matching_transition_wins() {
        let mut fsm = Automaton::new();
        let s0 = fsm.add_state("s0", "", None);
        let a = fsm.add_state("a", "", None);
        let b = fsm.add_state("b", "", None);
        fsm.add_transition(s0, "x".into(), a, None, OnDuplicate::Error).unwrap();
        fsm.add_transition(s0, "xy".into(), b, None, OnDuplicate::Error).unwrap();
        assert!(fsm.input(Some("xy".into())).await.unwrap());
        assert_eq!(fsm.current_state().unwrap().index, a);
    }

    #[tokio::test]
    async fn test_epsilon_is_last_resort() {
        let mut fsm = Automaton::new();
        let s0 = fsm.add_state("s0", "", None);
        let eps = fsm.add_state("eps", "", None);
        let hit = fsm.add_state("hit", "", None);
        fsm.add_transition(s0, Condition::Always, eps, None, OnDuplicate::Error).unwrap();
        fsm.add_transition(s0, "go".into(), hit, None, OnDuplicate::Error).unwrap();
        fsm.input(Some("go".into())).await.unwrap();
        assert_eq!(fsm.current_state().unwrap().index, hit);
    }

    #[tokio::test]
    async fn test_epsilon_chain_runs_after_consumption() {
        let (log, make) = recorder();
        let mut fsm = Automaton::new();
        let s0 = fsm.add_state("s0", "", None);
        let s1 = fsm.add_state("s1", "", None);
        let s2 = fsm.add_state("s2", "", None);
        fsm.set_arrival_action(s1, make("s1")).unwrap();
        fsm.set_arrival_action(s2, make("s2")).unwrap();
        fsm.add_transition(s0, "ready".into(), s1, None, OnDuplicate::Error).unwrap();
        fsm.add_transition(s1, Condition::Always, s2, None, OnDuplicate::Error).unwrap();
        fsm.input(Some("ready".into())).await.unwrap();
        assert_eq!(*log.borrow(), vec!["s1", "s2"]);
        assert_eq!(fsm.current_state().unwrap().index, s2);
    }

    #[tokio::test]
    async fn test_unmatched_input_accumulates() {
        let mut fsm = Automaton::new();
        let s0 = fsm.add_state("s0", "", None);
        let s1 = fsm.add_state("s1", "", None);
        fsm.add_transition(s0, "user$".into(), s1, None, OnDuplicate::Error).unwrap();
        assert!(!fsm.input(Some("us".into())).await.unwrap());
        assert_eq!(fsm.accumulation(), "us");
        assert!(fsm.input(Some("er$ ".into())).await.unwrap());
        assert_eq!(fsm.current_state().unwrap().index, s1);
        assert_eq!(fsm.accumulation(), "");
    }

    #[tokio::test]
    async fn test_duplicate_policies() {
        let mut fsm = Automaton::new();
        let s0 = fsm.add_state("s0", "", None);
        let a = fsm.add_state("a", "", None);
        let b = fsm.add_state("b", "", None);
        fsm.add_transition(s0, "k".into(), a, None, OnDuplicate::Error).unwrap();
        assert_eq!(
            fsm.add_transition(s0, "k".into(), b, None, OnDuplicate::Error),
            Err(AutomatonError::DuplicateTransition {
                from: s0,
                key: "k".to_string()
            })
        );
        fsm.add_transition(s0, "k".into(), b, None, OnDuplicate::Ignore).unwrap();
        fsm.input(Some("k".into())).await.unwrap();
        assert_eq!(fsm.current_state().unwrap().index, a);

        fsm.reset();
        fsm.add_transition(s0, "k".into(), b, None, OnDuplicate::Overwrite).unwrap();
        fsm.input(Some("k".into())).await.unwrap();
        assert_eq!(fsm.current_state().unwrap().index, b);
    }

    #[tokio::test]
    async fn test_depart_action_runs_before_arrival() {
        let (log, make) = recorder();
        let mut fsm = Automaton::new();
        let s0 = fsm.add_state("s0", "", None);
        let s1 = fsm.add_state("s1", "", None);
        fsm.set_arrival_action(s1, make("arrive")).unwrap();
        fsm.add_transition(s0, "x".into(), s1, Some(make("depart")), OnDuplicate::Error)
            .unwrap();
        fsm.input(Some("x".into())).await.unwrap();
        assert_eq!(*log.borrow(), vec!["depart", "arrive"]);
    }

    #[tokio::test]
    async fn test_epsilon_cycle_is_reported() {
        let mut fsm = Automaton::new();
        let s0 = fsm.add_state("s0", "", None);
        let s1 = fsm.add_state("s1", "", None);
        fsm.add_transition(s0, Condition::Always, s1, None, OnDuplicate::Error).unwrap();
        fsm.add_transition(s1, Condition::Always, s0, None, OnDuplicate::Error).unwrap();
        assert_eq!(
            fsm.input(None).await,
            Err(AutomatonError::EpsilonCycle { state: s1 })
        );
    }

    #[tokio::test]
    async fn test_listeners_see_entered_states() {
        let mut fsm = Automaton::new();
        let s0 = fsm.add_state("s0", "", None);
        let s1 = fsm.add_state("s1", "second", None);
        fsm.add_transition(s0, "x".into(), s1, None, OnDuplicate::Error).unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_in_listener = seen.clone();
        fsm.on_state_entered(move |info| seen_in_listener.borrow_mut().push(info.description.clone()));
        fsm.input(Some("x".into())).await.unwrap();
        assert_eq!(*seen.borrow(), vec!["second"]);
    }

    #[tokio::test]
    async fn test_async_arrival_value() {
        let mut fsm = Automaton::new();
        let s0 = fsm.add_state("s0", "", None);
        let s1 = fsm.add_state("s1", "", None);
        fsm.set_arrival_action(
            s1,
            Action::new(|input: ActionInput| async move {
                tokio::task::yield_now().await;
                input.text.map(|t| t.to_uppercase())
            }),
        )
        .unwrap();
        fsm.add_transition(s0, "abc".into(), s1, None, OnDuplicate::Error).unwrap();
        fsm.input(Some("abc".into())).await.unwrap();
        assert_eq!(fsm.value(s1), Some("ABC"));
    }

    #[tokio::test]
    async fn test_wait_holds_and_replays_input() {
        let (log, make) = recorder();
        let mut fsm = Automaton::new();
        let s0 = fsm.add_state("s0", "", None);
        let wait = fsm.add_state("wait", "", None);
        let after = fsm.add_state("after", "", None);
        let prompt = fsm.add_state("prompt", "", None);
        fsm.set_wait(wait, WaitTime::Fixed(Duration::from_secs(60))).unwrap();
        fsm.set_arrival_action(after, make("after")).unwrap();
        fsm.set_arrival_action(prompt, make("prompt")).unwrap();
        fsm.add_transition(s0, Condition::Always, wait, None, OnDuplicate::Error).unwrap();
        fsm.add_transition(wait, Condition::Always, after, None, OnDuplicate::Error).unwrap();
        fsm.add_transition(after, "$ ".into(), prompt, None, OnDuplicate::Error).unwrap();

        fsm.input(None).await.unwrap();
        assert!(fsm.is_waiting());
        fsm.input(Some("output\n".into())).await.unwrap();
        fsm.input(Some("$ ".into())).await.unwrap();
        assert!(log.borrow().is_empty());
        assert_eq!(fsm.current_state().unwrap().index, wait);

        fsm.finish_wait().await.unwrap();
        assert!(!fsm.is_waiting());
        assert_eq!(*log.borrow(), vec!["after", "prompt"]);
        assert_eq!(fsm.current_state().unwrap().index, prompt);
    }
}
