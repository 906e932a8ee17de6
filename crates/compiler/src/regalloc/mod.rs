//! # Linear-Scan Register Allocation
//!
//! Intervals are visited in order of their first position. Fixed intervals
//! are pre-colored and only act as obstacles. Every other interval takes the
//! first register that none of the overlapping, already-placed intervals
//! hold, trying its hint first; lifetime holes are respected, so two values
//! may share a register as long as their ranges interleave.
//!
//! Calls shape the candidate set: an interval alive across a stub call may
//! only use callee-saved registers, and one alive across a call into
//! compiled code is spilled outright. Spilling is whole-interval, one slot
//! per spilled value. Temps never spill; a temp with no free register
//! evicts the virtual values standing in its way.

pub mod liveness;

use marlin_runtime::Reg;

use crate::lir::{IntervalId, LirFunction, Location};
use crate::target::RegisterFile;
use crate::{CompilerError, CompilerResult};

pub use liveness::build_intervals;

struct CallSite {
    position: u32,
    clobbers_all: bool,
}

struct LinearScan<'f> {
    function: &'f mut LirFunction,
    registers: &'static RegisterFile,
    calls: Vec<CallSite>,
    fixed: Vec<IntervalId>,
    /// Placed in a register and not yet expired.
    active: Vec<IntervalId>,
    next_slot: u32,
}

/// Compute intervals for `function` and give each a location.
pub fn allocate(function: &mut LirFunction, registers: &'static RegisterFile) -> CompilerResult<()> {
    build_intervals(function);

    let calls = function
        .call_sites()
        .map(|instr| CallSite {
            position: instr.position,
            clobbers_all: instr.clobbers_all(),
        })
        .collect();
    let fixed = function
        .intervals
        .iter()
        .filter(|i| i.is_fixed() && !i.ranges.is_empty())
        .map(|i| i.id)
        .collect();
    let mut order: Vec<IntervalId> = function
        .intervals
        .iter()
        .filter(|i| !i.is_fixed() && !i.ranges.is_empty())
        .map(|i| i.id)
        .collect();
    order.sort_by_key(|id| (function.interval(*id).start(), *id));

    let mut scan = LinearScan {
        function,
        registers,
        calls,
        fixed,
        active: Vec::new(),
        next_slot: 0,
    };
    for id in order {
        scan.place(id)?;
    }

    let spills = scan.next_slot;
    let function = scan.function;
    function.spill_slots = spills;
    log::debug!(
        "[REGALLOC] {}: {} intervals, {} spill slots",
        function.hir,
        function.intervals.len(),
        spills
    );
    Ok(())
}

impl LinearScan<'_> {
    fn expire(&mut self, position: u32) {
        let function = &*self.function;
        self.active.retain(|id| function.interval(*id).end() > position);
    }

    fn spill(&mut self, id: IntervalId) {
        let slot = self.next_slot;
        self.next_slot += 1;
        self.function.interval_mut(id).location = Some(Location::Stack(slot));
        log::trace!("[REGALLOC] spill {} to slot {}", id, slot);
    }

    fn blocked_by_fixed(&self, id: IntervalId, reg: Reg) -> bool {
        let interval = self.function.interval(id);
        self.fixed.iter().any(|other| {
            let other = self.function.interval(*other);
            other.location == Some(Location::Register(reg)) && other.intersects(interval)
        })
    }

    /// Active intervals holding `reg` that overlap `id`.
    fn conflicts(&self, id: IntervalId, reg: Reg) -> Vec<IntervalId> {
        let interval = self.function.interval(id);
        self.active
            .iter()
            .copied()
            .filter(|other| {
                let other = self.function.interval(*other);
                other.location == Some(Location::Register(reg)) && other.intersects(interval)
            })
            .collect()
    }

    fn place(&mut self, id: IntervalId) -> CompilerResult<()> {
        let start = self.function.interval(id).start();
        self.expire(start);

        let interval = self.function.interval(id);
        let (temp, hint) = (interval.temp, interval.hint);
        let crosses_call = self.calls.iter().any(|c| interval.crosses(c.position));
        let crosses_clobber = self.calls.iter().any(|c| c.clobbers_all && interval.crosses(c.position));

        if crosses_clobber && !temp {
            self.spill(id);
            return Ok(());
        }

        let candidates: &[Reg] = if crosses_call {
            self.registers.callee_saved
        } else {
            self.registers.allocatable
        };
        let preferred = hint.filter(|h| candidates.contains(h));
        let ordered = preferred.into_iter().chain(candidates.iter().copied().filter(|r| Some(*r) != preferred));

        let mut chosen = None;
        for reg in ordered {
            if !self.blocked_by_fixed(id, reg) && self.conflicts(id, reg).is_empty() {
                chosen = Some(reg);
                break;
            }
        }

        if chosen.is_none() && temp {
            chosen = self.evict_for_temp(id, candidates)?;
        }

        match chosen {
            Some(reg) => {
                self.function.interval_mut(id).location = Some(Location::Register(reg));
                self.active.push(id);
            }
            None => self.spill(id),
        }
        Ok(())
    }

    /// Free a register for temp `id` by spilling the virtual values that
    /// hold it.
    fn evict_for_temp(&mut self, id: IntervalId, candidates: &[Reg]) -> CompilerResult<Option<Reg>> {
        for reg in candidates.iter().copied() {
            if self.blocked_by_fixed(id, reg) {
                continue;
            }
            let victims = self.conflicts(id, reg);
            if victims.iter().any(|v| self.function.interval(*v).temp) {
                continue;
            }
            for victim in &victims {
                self.active.retain(|a| a != victim);
                self.spill(*victim);
            }
            return Ok(Some(reg));
        }
        Err(CompilerError::Allocation(format!(
            "no register for temp {} in {}",
            id, self.function.hir
        )))
    }
}
