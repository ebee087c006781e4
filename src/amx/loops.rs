//! Loop-carried accumulators.
//!
//! A dot whose accumulator is an iteration argument of the directly enclosing
//! `for`, and whose result is yielded back into the same slot, keeps its
//! accumulator across iterations. Such loops are extended with extra carried
//! values, one per accumulator tile, by rebuilding them with
//! [`replace_with_additional_yields`].

use log::trace;

use crate::core::error::{IrError, IrResult};
use crate::ir::{Module, OpId, OpKind, Rewriter, Type, ValueDef, ValueId};

/// `op`'s parent if it is a `for`.
pub fn enclosing_loop(module: &Module, op: OpId) -> Option<OpId> {
    module.parent_op(op).filter(|&p| module.op(p).kind == OpKind::For)
}

/// `(loop, iteration slot)` of a loop body argument, excluding the induction
/// variable.
fn iter_arg_slot(module: &Module, value: ValueId) -> Option<(OpId, usize)> {
    let ValueDef::BlockArg { block, index } = module.value(value).def else {
        return None;
    };
    let loop_op = module.block(block).parent?;
    if module.op(loop_op).kind != OpKind::For || index == 0 {
        return None;
    }
    Some((loop_op, index as usize - 1))
}

/// Whether the accumulator of `dot` is carried by the enclosing loop: it is an
/// iteration argument used only by `dot`, and the dot result is used only by
/// the loop's `yield` in the same slot.
pub fn is_loop_carried_acc(module: &Module, dot: OpId) -> bool {
    let data = module.op(dot);
    let acc = data.operands[2];
    let Some((loop_op, slot)) = iter_arg_slot(module, acc) else {
        return false;
    };
    if enclosing_loop(module, dot) != Some(loop_op) || !module.has_one_use(acc) {
        return false;
    }
    match module.uses(data.results[0]).as_slice() {
        [(user, pos)] => {
            module.op(*user).kind == OpKind::Yield
                && module.parent_op(*user) == Some(loop_op)
                && *pos == slot
        }
        _ => false,
    }
}

/// Loop result tied to an iteration argument.
pub fn tied_loop_result(module: &Module, iter_arg: ValueId) -> Option<ValueId> {
    let (loop_op, slot) = iter_arg_slot(module, iter_arg)?;
    module.op(loop_op).results.get(slot).copied()
}

/// Initial value of an iteration argument.
pub fn tied_init_value(module: &Module, iter_arg: ValueId) -> Option<ValueId> {
    let (loop_op, slot) = iter_arg_slot(module, iter_arg)?;
    module.op(loop_op).operands.get(3 + slot).copied()
}

/// Replace `loop_op` with a loop carrying `new_inits` as additional values,
/// yielding `new_yields` for them on every iteration.
///
/// The body moves to the new loop. When `replace_init_uses_in_loop` is set,
/// uses of the new init values inside the body are redirected to the new
/// block arguments. Users of the old results move to the leading results of
/// the new loop. Returns the new loop and its appended results.
pub fn replace_with_additional_yields(
    rw: &mut Rewriter<'_>,
    loop_op: OpId,
    new_inits: &[ValueId],
    new_yields: &[ValueId],
    replace_init_uses_in_loop: bool,
) -> IrResult<(OpId, Vec<ValueId>)> {
    if new_inits.len() != new_yields.len() {
        return Err(IrError::Malformed(format!(
            "{} init value(s) for {} yielded value(s)",
            new_inits.len(),
            new_yields.len()
        )));
    }

    let old_results = rw.module().op(loop_op).results.clone();
    let (new_loop, new_args) = {
        let module = rw.module_mut();
        let old = module.op(loop_op).clone();
        let parent = old.parent.ok_or_else(|| IrError::Malformed("loop is detached".to_string()))?;
        let pos = module.op_position(loop_op).unwrap_or(0);
        let body = old.regions[0];

        let mut operands = old.operands.clone();
        operands.extend_from_slice(new_inits);
        let types: Vec<Type> = old
            .results
            .iter()
            .chain(new_inits)
            .map(|&v| module.value_type(v).clone())
            .collect();
        let new_loop = module.create_op(OpKind::For, operands, types);
        module.insert_op(new_loop, parent, pos);

        module.op_mut(loop_op).regions.clear();
        module.op_mut(new_loop).regions.push(body);
        module.block_mut(body).parent = Some(new_loop);
        let new_args: Vec<ValueId> = new_inits
            .iter()
            .map(|&init| {
                let ty = module.value_type(init).clone();
                module.add_block_arg(body, ty)
            })
            .collect();

        let terminator = module
            .block(body)
            .ops
            .last()
            .copied()
            .filter(|&t| module.op(t).kind == OpKind::Yield)
            .ok_or_else(|| IrError::Malformed("loop body does not end with 'yield'".to_string()))?;
        module.op_mut(terminator).operands.extend_from_slice(new_yields);
        (new_loop, new_args)
    };

    if replace_init_uses_in_loop {
        for (&init, &arg) in new_inits.iter().zip(&new_args) {
            rw.replace_uses_if(init, arg, |module, user| module.is_proper_ancestor(new_loop, user));
        }
    }

    let new_results = rw.module().op(new_loop).results.clone();
    for (&from, &to) in old_results.iter().zip(&new_results) {
        rw.replace_all_uses_with(from, to);
    }
    rw.erase_op(loop_op)?;
    trace!("extended loop with {} carried value(s)", new_inits.len());

    Ok((new_loop, new_results[old_results.len()..].to_vec()))
}
