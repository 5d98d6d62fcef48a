/*
 * Copyright 2021 Oxide Computer Company
 */

use std::collections::VecDeque;
use std::fmt;

use anyhow::Result;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventKind {
    Provisioning,
    AssetDownload,
    PackageInstall,
    PackagePostinstall,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "state", content = "error")]
pub enum State {
    Begin,
    End,
    Fail(String),
}

/**
 * Identifies a phase, and the phase it is nested within (if any).
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Scope {
    pub id: Uuid,
    pub parent: Option<Uuid>,
}

impl Scope {
    pub fn new(parent: Option<&Scope>) -> Scope {
        Scope {
            id: Uuid::new_v4(),
            parent: parent.map(|p| p.id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    pub kind: EventKind,
    pub jail: String,
    pub scope: Scope,
    #[serde(flatten)]
    pub state: State,
}

impl Event {
    pub fn is_fail(&self) -> bool {
        matches!(self.state, State::Fail(_))
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:?} ", self.jail, self.kind)?;
        match &self.state {
            State::Begin => write!(f, "begin"),
            State::End => write!(f, "end"),
            State::Fail(e) => write!(f, "failed: {}", e),
        }
    }
}

/**
 * A phase of work against one jail.  Events produced for the phase share its
 * scope.
 */
#[derive(Debug, Clone)]
pub struct Phase {
    kind: EventKind,
    jail: String,
    scope: Scope,
}

impl Phase {
    pub fn new(kind: EventKind, jail: &str, parent: Option<&Scope>) -> Phase {
        Phase {
            kind,
            jail: jail.to_string(),
            scope: Scope::new(parent),
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    fn event(&self, state: State) -> Event {
        Event {
            kind: self.kind,
            jail: self.jail.clone(),
            scope: self.scope,
            state,
        }
    }

    pub fn begin(&self) -> Event {
        self.event(State::Begin)
    }

    pub fn end(&self) -> Event {
        self.event(State::End)
    }

    pub fn fail<E: fmt::Display>(&self, error: E) -> Event {
        self.event(State::Fail(error.to_string()))
    }
}

type Work<'a> = Box<dyn FnOnce() -> Result<()> + 'a>;

/**
 * Runs a list of phases in order, one per call to next().  Each phase yields
 * its begin event before the work is done, and its end event after.  If the
 * work fails, the fail event is produced followed by the error itself, and no
 * further phases are started.
 */
#[derive(Default)]
pub struct Phases<'a> {
    queue: VecDeque<(Phase, Work<'a>)>,
    running: Option<(Phase, Work<'a>)>,
    failed: Option<anyhow::Error>,
}

impl<'a> Phases<'a> {
    pub fn new() -> Phases<'a> {
        Phases::default()
    }

    pub fn push<F>(&mut self, phase: Phase, work: F) -> &mut Self
        where F: FnOnce() -> Result<()> + 'a
    {
        self.queue.push_back((phase, Box::new(work)));
        self
    }
}

impl Iterator for Phases<'_> {
    type Item = Result<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.failed.take() {
            self.queue.clear();
            return Some(Err(e));
        }

        if let Some((phase, work)) = self.running.take() {
            return Some(Ok(match work() {
                Ok(()) => phase.end(),
                Err(e) => {
                    let ev = phase.fail(format!("{:#}", e));
                    self.failed = Some(e);
                    ev
                }
            }));
        }

        let (phase, work) = self.queue.pop_front()?;
        let ev = phase.begin();
        self.running = Some((phase, work));
        Some(Ok(ev))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use anyhow::bail;
    use std::cell::Cell;

    #[test]
    fn nested_scopes() {
        let outer = Phase::new(EventKind::Provisioning, "web1", None);
        let inner = Phase::new(EventKind::AssetDownload, "web1",
            Some(outer.scope()));

        assert!(outer.scope().parent.is_none());
        assert_eq!(inner.scope().parent, Some(outer.scope().id));
        assert_ne!(inner.scope().id, outer.scope().id);
        assert_eq!(inner.begin().scope, inner.end().scope);
    }

    #[test]
    fn phases_run_in_order() {
        let count = Cell::new(0);
        let mut p = Phases::new();
        p.push(Phase::new(EventKind::PackageInstall, "web1", None), || {
            assert_eq!(count.get(), 0);
            count.set(1);
            Ok(())
        });
        p.push(Phase::new(EventKind::PackagePostinstall, "web1", None), || {
            assert_eq!(count.get(), 1);
            count.set(2);
            Ok(())
        });

        let states = p.map(|e| e.unwrap())
            .map(|e| (e.kind, e.state))
            .collect::<Vec<_>>();
        assert_eq!(states, vec![
            (EventKind::PackageInstall, State::Begin),
            (EventKind::PackageInstall, State::End),
            (EventKind::PackagePostinstall, State::Begin),
            (EventKind::PackagePostinstall, State::End),
        ]);
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn phases_stop_on_failure() {
        let ran = Cell::new(false);
        let mut p = Phases::new();
        p.push(Phase::new(EventKind::PackageInstall, "web1", None), || {
            bail!("no such package");
        });
        p.push(Phase::new(EventKind::PackagePostinstall, "web1", None), || {
            ran.set(true);
            Ok(())
        });

        assert_eq!(p.next().unwrap().unwrap().state, State::Begin);
        let fail = p.next().unwrap().unwrap();
        assert!(fail.is_fail());
        assert_eq!(fail.state, State::Fail("no such package".to_string()));
        assert!(p.next().unwrap().is_err());
        assert!(p.next().is_none());
        assert!(!ran.get());
    }

    #[test]
    fn work_is_lazy() {
        let ran = Cell::new(false);
        let mut p = Phases::new();
        p.push(Phase::new(EventKind::PackageInstall, "web1", None), || {
            ran.set(true);
            Ok(())
        });

        assert_eq!(p.next().unwrap().unwrap().state, State::Begin);
        assert!(!ran.get());
        drop(p);
        assert!(!ran.get());
    }

    #[test]
    fn event_json() {
        let ev = Phase::new(EventKind::AssetDownload, "web1", None)
            .fail("unreachable");
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["kind"], "AssetDownload");
        assert_eq!(v["jail"], "web1");
        assert_eq!(v["state"], "fail");
        assert_eq!(v["error"], "unreachable");
        assert!(v["scope"]["parent"].is_null());
    }
}
