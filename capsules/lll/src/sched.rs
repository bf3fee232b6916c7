// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! Prepare/abort pipeline deciding which role owns the radio.
//!
//! Ticker expiries arrive as prepares. A prepare runs at once when the radio
//! is idle. Otherwise the role currently on air is asked, through
//! [`EventHandler::is_abort`], whether it yields:
//!
//! - `Continue`: the current event finishes untouched and the new prepare
//!   waits in the pipeline,
//! - `Cancel`: the current event is aborted now,
//! - `Resume`: the current event is aborted now and a continuation of it is
//!   queued behind the waiting prepares.
//!
//! When the event on air completes, [`Scheduler::done`] runs the next
//! waiting prepare. Fresh prepares are served before continuations.
//!
//! A waiting prepare is aborted before it reaches the radio when the
//! pipeline is full, when a newer expiry of the same event arrives, or when
//! its role is disabled. The role is told through
//! [`EventHandler::abort`] with the prepare parameters, so it can account
//! the skipped events.
//!
//! ```text
//!   Scheduled --prepare--> Preparing --radio--> RadioActive --> Done
//!       |                                            |
//!       +---------- pipeline abort ------------------+--> Aborted
//! ```

use core::cell::Cell;

use kernel::config::CONFIG;
use kernel::debug;

use crate::params::PIPELINE_DEPTH;

/// One expiry handed to a role's prepare.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PrepareParam {
    pub ticks_at_expire: u32,
    /// Sub-tick part of the expiry in microseconds.
    pub remainder: u32,
    /// Expiries skipped by the ticker before this one.
    pub lazy: u16,
    pub force: bool,
    /// One-shot auxiliary or chain event of the role, rather than its
    /// periodic event.
    pub chain: bool,
}

impl PrepareParam {
    pub fn new(ticks_at_expire: u32, remainder: u32) -> PrepareParam {
        PrepareParam {
            ticks_at_expire,
            remainder,
            lazy: 0,
            force: false,
            chain: false,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AbortDecision {
    Continue,
    Cancel,
    Resume,
}

/// The roles, as seen by the scheduler. Roles are addressed by handle.
pub trait EventHandler {
    /// Whether the event `curr` on air yields to the prepare of `next`.
    fn is_abort(&self, curr: u8, next: u8, param: &PrepareParam) -> AbortDecision;

    /// Abort an event. With `None` the event is on air: stop the radio and
    /// report the event done. With the prepare parameters the event never
    /// reached the radio: account the skipped expiries and report it done.
    fn abort(&self, handle: u8, param: Option<&PrepareParam>);

    /// Start an event on the radio. Returns false if the role reported the
    /// event done without using the radio.
    fn prepare(&self, handle: u8, param: &PrepareParam, resume: bool) -> bool;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Entry {
    handle: u8,
    param: PrepareParam,
    resume: bool,
}

impl Entry {
    fn is_same_event(&self, handle: u8, chain: bool) -> bool {
        self.handle == handle && self.param.chain == chain
    }
}

pub struct Scheduler {
    curr: Cell<Option<Entry>>,
    /// Waiting prepares in arrival order, packed at the front.
    pipeline: [Cell<Option<Entry>>; PIPELINE_DEPTH],
}

impl Scheduler {
    pub const fn new() -> Scheduler {
        const EMPTY: Cell<Option<Entry>> = Cell::new(None);
        Scheduler {
            curr: Cell::new(None),
            pipeline: [EMPTY; PIPELINE_DEPTH],
        }
    }

    /// Handle of the role owning the radio.
    pub fn current(&self) -> Option<u8> {
        self.curr.get().map(|e| e.handle)
    }

    pub fn is_idle(&self) -> bool {
        self.curr.get().is_none() && self.waiting() == 0
    }

    /// Number of prepares waiting in the pipeline.
    pub fn waiting(&self) -> usize {
        self.pipeline.iter().filter(|e| e.get().is_some()).count()
    }

    pub fn prepare(&self, handler: &dyn EventHandler, handle: u8, param: PrepareParam) {
        let entry = Entry {
            handle,
            param,
            resume: false,
        };
        let curr = match self.curr.get() {
            None => {
                self.run(handler, entry);
                return;
            }
            Some(curr) => curr,
        };

        self.supersede(handler, handle, param.chain);

        let decision = handler.is_abort(curr.handle, handle, &param);
        if CONFIG.trace_scheduler {
            debug!("sched: {} on air, {} prepares: {:?}", curr.handle, handle, decision);
        }
        self.enqueue(handler, entry);
        match decision {
            AbortDecision::Continue => {}
            AbortDecision::Cancel | AbortDecision::Resume => {
                if decision == AbortDecision::Resume {
                    self.enqueue(
                        handler,
                        Entry {
                            resume: true,
                            ..curr
                        },
                    );
                }
                handler.abort(curr.handle, None);
                self.done(handler);
            }
        }
    }

    /// The event on air has completed. Runs waiting prepares until one takes
    /// the radio.
    pub fn done(&self, handler: &dyn EventHandler) {
        self.curr.set(None);
        while let Some(entry) = self.dequeue() {
            if self.run(handler, entry) {
                break;
            }
        }
    }

    /// Abort the waiting prepares of `handle`, leaving a live event alone.
    pub fn cancel(&self, handler: &dyn EventHandler, handle: u8) {
        let mut index = 0;
        while let Some(entry) = self.pipeline.get(index).and_then(|e| e.get()) {
            if entry.handle == handle {
                self.remove(index);
                self.abort_waiting(handler, entry);
            } else {
                index += 1;
            }
        }
    }

    /// Abort everything of `handle`: waiting prepares and, if on air, the
    /// live event.
    pub fn disable(&self, handler: &dyn EventHandler, handle: u8) {
        self.cancel(handler, handle);
        if self.current() == Some(handle) {
            handler.abort(handle, None);
            self.done(handler);
        }
    }

    fn run(&self, handler: &dyn EventHandler, entry: Entry) -> bool {
        self.curr.set(Some(entry));
        if handler.prepare(entry.handle, &entry.param, entry.resume) {
            true
        } else {
            self.curr.set(None);
            false
        }
    }

    fn abort_waiting(&self, handler: &dyn EventHandler, entry: Entry) {
        if CONFIG.trace_scheduler {
            debug!("sched: {} aborted in pipeline", entry.handle);
        }
        // A continuation already reported its event done when it was
        // interrupted.
        if !entry.resume {
            handler.abort(entry.handle, Some(&entry.param));
        }
    }

    /// Drop waiting prepares of the same event, which a newer expiry
    /// replaces.
    fn supersede(&self, handler: &dyn EventHandler, handle: u8, chain: bool) {
        let mut index = 0;
        while let Some(entry) = self.pipeline.get(index).and_then(|e| e.get()) {
            if entry.is_same_event(handle, chain) {
                self.remove(index);
                self.abort_waiting(handler, entry);
            } else {
                index += 1;
            }
        }
    }

    fn enqueue(&self, handler: &dyn EventHandler, entry: Entry) {
        match self.pipeline.iter().find(|e| e.get().is_none()) {
            Some(slot) => slot.set(Some(entry)),
            None => self.abort_waiting(handler, entry),
        }
    }

    fn dequeue(&self) -> Option<Entry> {
        let fresh = self
            .pipeline
            .iter()
            .position(|e| e.get().map_or(false, |e| !e.resume));
        let index = match fresh {
            Some(index) => index,
            None => self.pipeline.iter().position(|e| e.get().is_some())?,
        };
        let entry = self.pipeline[index].get();
        self.remove(index);
        entry
    }

    fn remove(&self, index: usize) {
        for i in index..PIPELINE_DEPTH {
            let next = self.pipeline.get(i + 1).and_then(|e| e.get());
            self.pipeline[i].set(next);
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
