//! Rewrite-rule framework (C6): op-code–keyed local rewrites, grouped into
//! actions and action groups, applied to fixed point.

pub mod rules;

use std::collections::VecDeque;

use crate::error::{AnalysisError, Result};
use crate::opcode::OpCode;
use crate::operation::OpId;
use crate::valuecell::ValueId;

/// The narrow editing surface a rewrite rule is allowed to mutate through
/// (§4.6, §4.10). The function container (C10) implements this; keeping it
/// as a trait lets rules and the scheduler be unit tested against a
/// lightweight fake, independent of the full IR.
pub trait Editor {
    fn opcode(&self, op: OpId) -> Option<OpCode>;
    fn input(&self, op: OpId, slot: usize) -> Option<ValueId>;
    fn input_count(&self, op: OpId) -> usize;
    fn output(&self, op: OpId) -> Option<ValueId>;
    fn alive_ops(&self) -> Vec<OpId>;

    /// The constant this value carries, if it is a constant cell.
    fn constant_value(&self, value: ValueId) -> Option<u64>;
    fn value_size(&self, value: ValueId) -> Option<u32>;
    fn is_signed(&self, value: ValueId) -> bool;

    fn set_opcode(&mut self, op: OpId, opcode: OpCode);
    fn set_input(&mut self, op: OpId, slot: usize, value: ValueId);
    fn remove_input(&mut self, op: OpId, slot: usize);
    fn set_output(&mut self, op: OpId, value: Option<ValueId>);
    fn new_constant(&mut self, value: u64, size: u32) -> ValueId;
    fn new_unique_out(&mut self, size: u32) -> ValueId;
    /// Inserts a new op immediately after `anchor`, in the same block.
    fn new_op_after(&mut self, anchor: OpId, opcode: OpCode, inputs: Vec<ValueId>, output: Option<ValueId>) -> OpId;
}

/// An op-code filter plus a local transform. Returns whether it changed the
/// op (triggering a re-visit within the current pass, §4.6 scheduling).
pub trait Rule {
    fn name(&self) -> &'static str;
    fn filter(&self) -> &'static [OpCode];
    fn apply(&self, op: OpId, editor: &mut dyn Editor) -> bool;
}

/// An ordered set of rules applied together until a sweep makes no changes.
pub struct Action {
    pub name: &'static str,
    pub rules: Vec<Box<dyn Rule>>,
}

impl Action {
    pub fn new(name: &'static str, rules: Vec<Box<dyn Rule>>) -> Self {
        Self { name, rules }
    }
}

/// A named, ordered collection of actions (e.g. `"default"`, `"jumptable"`)
/// sharing one iteration cap.
pub struct ActionGroup {
    pub name: &'static str,
    pub actions: Vec<Action>,
    pub iteration_cap: u32,
}

impl ActionGroup {
    pub fn new(name: &'static str, actions: Vec<Action>, iteration_cap: u32) -> Self {
        Self { name, actions, iteration_cap }
    }
}

/// Drives an action group's actions in order, each to a fixed point, over
/// the live op worklist.
pub struct RewriteDriver;

impl RewriteDriver {
    /// Runs every action of `group` to fixed point, returning the number of
    /// sweeps performed across all its actions.
    pub fn run_group(group: &ActionGroup, editor: &mut dyn Editor) -> Result<u32> {
        let mut total_sweeps = 0u32;
        for action in &group.actions {
            total_sweeps += Self::run_action(group.name, action, group.iteration_cap, editor)?;
        }
        Ok(total_sweeps)
    }

    fn run_action(group_name: &str, action: &Action, cap: u32, editor: &mut dyn Editor) -> Result<u32> {
        let mut sweeps = 0u32;
        loop {
            sweeps += 1;
            if sweeps > cap {
                return Err(AnalysisError::invariant(format!(
                    "action '{group_name}/{}' exceeded its iteration cap ({cap})",
                    action.name
                )));
            }
            if !Self::run_sweep(action, editor) {
                break;
            }
        }
        Ok(sweeps)
    }

    /// One worklist sweep: every alive op is visited once; whenever a rule
    /// changes an op, later rules re-examine it immediately (its op-code may
    /// have changed) before the sweep moves on. An op that keeps changing
    /// forever is bounded by the outer per-action iteration cap rather than
    /// looping here, so a runaway rule is still fatal rather than hanging.
    fn run_sweep(action: &Action, editor: &mut dyn Editor) -> bool {
        const MAX_RETRIES_PER_OP: u32 = 64;
        let queue: VecDeque<OpId> = editor.alive_ops().into_iter().collect();
        let mut changed = false;
        for op in queue {
            for _ in 0..MAX_RETRIES_PER_OP {
                let Some(opcode) = editor.opcode(op) else { break };
                let mut op_changed = false;
                for rule in &action.rules {
                    if !rule.filter().contains(&opcode) {
                        continue;
                    }
                    if rule.apply(op, editor) {
                        changed = true;
                        op_changed = true;
                        break;
                    }
                }
                if !op_changed {
                    break;
                }
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// A minimal in-memory `Editor` used only to exercise the scheduler
    /// without a real function container.
    #[derive(Default)]
    struct FakeEditor {
        next_op: u32,
        next_value: u32,
        opcodes: HashMap<OpId, OpCode>,
        inputs: HashMap<OpId, Vec<ValueId>>,
        outputs: HashMap<OpId, Option<ValueId>>,
        constants: HashMap<ValueId, u64>,
        sizes: HashMap<ValueId, u32>,
    }

    impl FakeEditor {
        fn new_op(&mut self, opcode: OpCode, inputs: Vec<ValueId>, output: Option<ValueId>) -> OpId {
            let id = OpId(self.next_op);
            self.next_op += 1;
            self.opcodes.insert(id, opcode);
            self.inputs.insert(id, inputs);
            self.outputs.insert(id, output);
            id
        }

        fn new_value(&mut self, size: u32) -> ValueId {
            let id = ValueId(self.next_value);
            self.next_value += 1;
            self.sizes.insert(id, size);
            id
        }
    }

    impl Editor for FakeEditor {
        fn opcode(&self, op: OpId) -> Option<OpCode> {
            self.opcodes.get(&op).copied()
        }
        fn input(&self, op: OpId, slot: usize) -> Option<ValueId> {
            self.inputs.get(&op)?.get(slot).copied()
        }
        fn input_count(&self, op: OpId) -> usize {
            self.inputs.get(&op).map(|v| v.len()).unwrap_or(0)
        }
        fn output(&self, op: OpId) -> Option<ValueId> {
            self.outputs.get(&op).copied().flatten()
        }
        fn alive_ops(&self) -> Vec<OpId> {
            let mut ids: Vec<OpId> = self.opcodes.keys().copied().collect();
            ids.sort_by_key(|id| id.0);
            ids
        }
        fn constant_value(&self, value: ValueId) -> Option<u64> {
            self.constants.get(&value).copied()
        }
        fn value_size(&self, value: ValueId) -> Option<u32> {
            self.sizes.get(&value).copied()
        }
        fn is_signed(&self, _value: ValueId) -> bool {
            false
        }
        fn set_opcode(&mut self, op: OpId, opcode: OpCode) {
            self.opcodes.insert(op, opcode);
        }
        fn set_input(&mut self, op: OpId, slot: usize, value: ValueId) {
            self.inputs.get_mut(&op).unwrap()[slot] = value;
        }
        fn remove_input(&mut self, op: OpId, slot: usize) {
            self.inputs.get_mut(&op).unwrap().remove(slot);
        }
        fn set_output(&mut self, op: OpId, value: Option<ValueId>) {
            self.outputs.insert(op, value);
        }
        fn new_constant(&mut self, value: u64, size: u32) -> ValueId {
            let id = self.new_value(size);
            self.constants.insert(id, value);
            id
        }
        fn new_unique_out(&mut self, size: u32) -> ValueId {
            self.new_value(size)
        }
        fn new_op_after(&mut self, _anchor: OpId, opcode: OpCode, inputs: Vec<ValueId>, output: Option<ValueId>) -> OpId {
            self.new_op(opcode, inputs, output)
        }
    }

    struct CountingRule {
        budget: std::cell::Cell<u32>,
    }

    impl Rule for CountingRule {
        fn name(&self) -> &'static str {
            "counting"
        }
        fn filter(&self) -> &'static [OpCode] {
            &[OpCode::Copy]
        }
        fn apply(&self, _op: OpId, _editor: &mut dyn Editor) -> bool {
            if self.budget.get() == 0 {
                return false;
            }
            self.budget.set(self.budget.get() - 1);
            true
        }
    }

    #[test]
    fn sweep_reaches_fixed_point_when_rule_stops_reporting_changes() {
        let mut editor = FakeEditor::default();
        let v = editor.new_value(4);
        let op = editor.new_op(OpCode::Copy, vec![v], Some(v));
        let rule = CountingRule { budget: std::cell::Cell::new(3) };
        let action = Action::new("settle", vec![Box::new(rule)]);
        let group = ActionGroup::new("default", vec![action], 100);
        let sweeps = RewriteDriver::run_group(&group, &mut editor).unwrap();
        assert!(sweeps >= 2);
        let _ = op;
    }

    #[test]
    fn iteration_cap_is_fatal() {
        let mut editor = FakeEditor::default();
        let v = editor.new_value(4);
        editor.new_op(OpCode::Copy, vec![v], Some(v));
        struct NeverSettles;
        impl Rule for NeverSettles {
            fn name(&self) -> &'static str {
                "never"
            }
            fn filter(&self) -> &'static [OpCode] {
                &[OpCode::Copy]
            }
            fn apply(&self, _op: OpId, _editor: &mut dyn Editor) -> bool {
                true
            }
        }
        let action = Action::new("loop", vec![Box::new(NeverSettles)]);
        let group = ActionGroup::new("default", vec![action], 5);
        let result = RewriteDriver::run_group(&group, &mut editor);
        assert!(result.is_err());
    }
}
