//! Concrete rewrite rules (§4.6 examples).

use super::{Editor, Rule};
use crate::opcode::OpCode;
use crate::operation::OpId;

/// `concat(high, 0) => zext(high) << k`: when PIECE's low input is the
/// constant zero, it is just a zero-extension followed by a left shift of
/// the zero input's bit width.
pub struct ConcatWithZero;

impl Rule for ConcatWithZero {
    fn name(&self) -> &'static str {
        "concat_with_zero"
    }

    fn filter(&self) -> &'static [OpCode] {
        &[OpCode::Piece]
    }

    fn apply(&self, op: OpId, editor: &mut dyn Editor) -> bool {
        let Some(high) = editor.input(op, 0) else { return false };
        let Some(low) = editor.input(op, 1) else { return false };
        if editor.constant_value(low) != Some(0) {
            return false;
        }
        let Some(low_size) = editor.value_size(low) else { return false };
        let Some(out_size) = editor.output(op).and_then(|o| editor.value_size(o)) else { return false };

        let result = editor.output(op);
        let zext_target = editor.new_unique_out(out_size);
        editor.set_output(op, None);
        editor.set_opcode(op, OpCode::IntZExt);
        editor.remove_input(op, 1);
        editor.set_input(op, 0, high);
        editor.set_output(op, Some(zext_target));

        let shift_amount = editor.new_constant(u64::from(low_size) * 8, 4);
        editor.new_op_after(op, OpCode::IntLeft, vec![zext_target, shift_amount], result);
        true
    }
}

/// `uleq(x, c) => ult(x, c+1)` / `sleq(x, c) => slt(x, c+1)`, skipped when
/// `c` already sits at the comparison's own maximum (the `+1` would wrap,
/// per §4.6's "with overflow checking to avoid wrap" and the scenario in
/// §8.2). The sign of the check follows the op-code actually used
/// (`IntSLessEqual` vs `IntLessEqual`), not a separate type query: the two
/// p-code forms already encode which comparison is meant.
pub struct LessEqualNormalization;

impl Rule for LessEqualNormalization {
    fn name(&self) -> &'static str {
        "leq_normalization"
    }

    fn filter(&self) -> &'static [OpCode] {
        &[OpCode::IntLessEqual, OpCode::IntSLessEqual]
    }

    fn apply(&self, op: OpId, editor: &mut dyn Editor) -> bool {
        let Some(x) = editor.input(op, 0) else { return false };
        let Some(c) = editor.input(op, 1) else { return false };
        let Some(c_value) = editor.constant_value(c) else { return false };
        let Some(size) = editor.value_size(c).or_else(|| editor.value_size(x)) else { return false };

        let is_signed_cmp = editor.opcode(op) == Some(OpCode::IntSLessEqual);
        let limit = if is_signed_cmp { signed_max(size) } else { unsigned_max(size) };
        if c_value == limit {
            return false; // would overflow; leave the LEQ form in place.
        }

        let new_opcode = if is_signed_cmp { OpCode::IntSLess } else { OpCode::IntLess };
        let incremented = editor.new_constant(c_value.wrapping_add(1), size);
        editor.set_opcode(op, new_opcode);
        editor.set_input(op, 1, incremented);
        true
    }
}

fn signed_max(size: u32) -> u64 {
    let bits = size.saturating_mul(8).min(64);
    if bits == 0 || bits >= 64 {
        u64::MAX >> 1
    } else {
        (1u64 << (bits - 1)) - 1
    }
}

fn unsigned_max(size: u32) -> u64 {
    let bits = size.saturating_mul(8).min(64);
    if bits == 0 || bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewrite::{Action, ActionGroup, RewriteDriver};
    use crate::valuecell::ValueId;
    use rstest::rstest;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeEditor {
        next_op: u32,
        next_value: u32,
        opcodes: HashMap<OpId, OpCode>,
        inputs: HashMap<OpId, Vec<ValueId>>,
        outputs: HashMap<OpId, Option<ValueId>>,
        constants: HashMap<ValueId, u64>,
        sizes: HashMap<ValueId, u32>,
        signed: std::collections::HashSet<ValueId>,
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

        fn new_const(&mut self, value: u64, size: u32) -> ValueId {
            let id = self.new_value(size);
            self.constants.insert(id, value);
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
        fn is_signed(&self, value: ValueId) -> bool {
            self.signed.contains(&value)
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
            self.new_const(value, size)
        }
        fn new_unique_out(&mut self, size: u32) -> ValueId {
            self.new_value(size)
        }
        fn new_op_after(&mut self, _anchor: OpId, opcode: OpCode, inputs: Vec<ValueId>, output: Option<ValueId>) -> OpId {
            self.new_op(opcode, inputs, output)
        }
    }

    #[test]
    fn concat_with_zero_matches_literal_scenario() {
        let mut editor = FakeEditor::default();
        let t1 = editor.new_value(4); // input, high half
        let t0 = editor.new_const(0, 4); // constant zero, low half
        let r = editor.new_value(8);
        let piece = editor.new_op(OpCode::Piece, vec![t1, t0], Some(r));

        let action = Action::new("concat", vec![Box::new(ConcatWithZero)]);
        let group = ActionGroup::new("default", vec![action], 10);
        RewriteDriver::run_group(&group, &mut editor).unwrap();

        assert_eq!(editor.opcode(piece), Some(OpCode::IntZExt));
        assert_eq!(editor.input(piece, 0), Some(t1));
        assert_eq!(editor.input_count(piece), 1);

        let shift_op = OpId(piece.0 + 1);
        assert_eq!(editor.opcode(shift_op), Some(OpCode::IntLeft));
        assert_eq!(editor.output(shift_op), Some(r));
        let shift_amount = editor.input(shift_op, 1).unwrap();
        assert_eq!(editor.constant_value(shift_amount), Some(32));
    }

    #[test]
    fn leq_normalization_matches_literal_scenario() {
        let mut editor = FakeEditor::default();
        let x = editor.new_value(4);
        let c = editor.new_const(10, 4);
        let b = editor.new_value(1);
        let cmp = editor.new_op(OpCode::IntLessEqual, vec![x, c], Some(b));

        let action = Action::new("leq", vec![Box::new(LessEqualNormalization)]);
        let group = ActionGroup::new("default", vec![action], 10);
        RewriteDriver::run_group(&group, &mut editor).unwrap();

        assert_eq!(editor.opcode(cmp), Some(OpCode::IntLess));
        let new_c = editor.input(cmp, 1).unwrap();
        assert_eq!(editor.constant_value(new_c), Some(11));
    }

    #[rstest]
    #[case::signed_below_max(OpCode::IntSLessEqual, signed_max(4) - 1, OpCode::IntSLess, true)]
    #[case::signed_at_max_skips(OpCode::IntSLessEqual, signed_max(4), OpCode::IntSLessEqual, false)]
    #[case::unsigned_below_max(OpCode::IntLessEqual, unsigned_max(4) - 1, OpCode::IntLess, true)]
    #[case::unsigned_at_max_skips(OpCode::IntLessEqual, unsigned_max(4), OpCode::IntLessEqual, false)]
    fn leq_normalization_respects_each_forms_own_overflow_boundary(
        #[case] opcode: OpCode,
        #[case] bound_value: u64,
        #[case] expected_opcode: OpCode,
        #[case] expects_rewrite: bool,
    ) {
        let mut editor = FakeEditor::default();
        let x = editor.new_value(4);
        let c = editor.new_const(bound_value, 4);
        let b = editor.new_value(1);
        let cmp = editor.new_op(opcode, vec![x, c], Some(b));

        let action = Action::new("leq", vec![Box::new(LessEqualNormalization)]);
        let group = ActionGroup::new("default", vec![action], 10);
        RewriteDriver::run_group(&group, &mut editor).unwrap();

        assert_eq!(editor.opcode(cmp), Some(expected_opcode));
        if expects_rewrite {
            let new_c = editor.input(cmp, 1).unwrap();
            assert_eq!(editor.constant_value(new_c), Some(bound_value + 1));
        } else {
            assert_eq!(editor.input(cmp, 1), Some(c));
        }
    }
}
