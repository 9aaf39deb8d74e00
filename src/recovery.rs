// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Boot-time repair planning.
//!
//! Power can be lost at any instant, so the pair of page headers seen at
//! init describes anything from the canonical running state to a transfer
//! cut off mid-erase. [`plan`] maps every such pair to the repair steps that
//! drive the pages back to a consistent state. It is a pure function of the
//! two statuses; the engines interpret the steps, and a transfer step that
//! fails degrades to a format.

use crate::flash::PageId;
use crate::header::PageStatus;

/// One repair step.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Step {
    /// Erase the page outright.
    Erase(PageId),
    /// Advance the page header to the given state.
    Mark(PageId, PageStatus),
    /// Re-run an interrupted page transfer.
    Transfer { from: PageId, to: PageId },
    /// Give up on the current contents and start fresh.
    Format,
}

/// An ordered list of up to three repair steps.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct Plan {
    steps: [Option<Step>; 3],
}

impl Plan {
    /// The empty plan: the pages are already consistent.
    pub(crate) const NONE: Self = Self { steps: [None; 3] };

    fn of(steps: &[Step]) -> Self {
        let mut plan = Self::NONE;
        for (slot, step) in plan.steps.iter_mut().zip(steps) {
            *slot = Some(*step);
        }
        plan
    }

    pub(crate) fn steps(&self) -> impl Iterator<Item = Step> + '_ {
        self.steps.iter().filter_map(|s| *s)
    }
}

/// Decides the repair steps for the header pair observed at init.
pub(crate) fn plan(p1: PageStatus, p2: PageStatus) -> Plan {
    use PageId::{One, Two};
    use PageStatus::{Active, Erased, Formatted, Full, Receive};

    match (p1, p2) {
        // The canonical running states: one write target, one standby.
        (Active, Formatted) | (Formatted, Active) => Plan::NONE,

        // The standby page lost its marker (or an old-page erase finished
        // but the re-format did not). Re-prepare it.
        (Erased, Active) => Plan::of(&[Step::Erase(One), Step::Mark(One, Formatted)]),
        (Active, Erased) => Plan::of(&[Step::Erase(Two), Step::Mark(Two, Formatted)]),

        // A transfer had copied everything and begun tearing down the old
        // page: the receiving page holds the data, so promote it.
        (Erased, Receive) => Plan::of(&[
            Step::Erase(One),
            Step::Mark(One, Formatted),
            Step::Mark(Two, Active),
        ]),
        (Receive, Erased) => Plan::of(&[
            Step::Erase(Two),
            Step::Mark(Two, Formatted),
            Step::Mark(One, Active),
        ]),

        // A transfer stopped partway with the source intact: scrap the
        // partial copy and run it again.
        (Receive, Active) => Plan::of(&[Step::Erase(One), Step::Transfer { from: Two, to: One }]),
        (Active, Receive) => Plan::of(&[Step::Erase(Two), Step::Transfer { from: One, to: Two }]),

        // Latched headers can pin the source as FULL before its records
        // move; finish the interrupted migration.
        (Full, Formatted) => Plan::of(&[Step::Transfer { from: One, to: Two }]),
        (Formatted, Full) => Plan::of(&[Step::Transfer { from: Two, to: One }]),
        (Full, Receive) => Plan::of(&[Step::Erase(Two), Step::Transfer { from: One, to: Two }]),
        (Receive, Full) => Plan::of(&[Step::Erase(One), Step::Transfer { from: Two, to: One }]),

        // The transfer completed but the source erase never ran.
        (Full, Active) => Plan::of(&[Step::Erase(One), Step::Mark(One, Formatted)]),
        (Active, Full) => Plan::of(&[Step::Erase(Two), Step::Mark(Two, Formatted)]),

        // Everything else — double-active, both blank, stray pairings — is
        // ambiguous or empty, and formatting is the only safe answer.
        _ => Plan::of(&[Step::Format]),
    }
}
