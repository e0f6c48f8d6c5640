//! The stack VM that interprets a postfix token stream.
//!
//! Control-flow attributes (`IF`, `CHOOSE`, `SKIP`) encode jumps as byte
//! distances over the encoded token sizes, so skipping converts bytes to
//! token counts with [`count_tokens_to_skip`]; a distance that does not
//! land exactly on a token boundary means the token stream is corrupt.

use smallvec::SmallVec;
use tabula_model::ErrorValue;

use crate::error::EvalError;
use crate::eval::context::OperationEvaluationContext;
use crate::eval::{operators, resolver};
use crate::functions::{self, idx, logical};
use crate::token::{Attr, SkipKind, Token};
use crate::value::Value;

fn malformed(reason: impl Into<String>) -> EvalError {
    EvalError::MalformedFormula(reason.into())
}

fn pop(stack: &mut Vec<Value>) -> Result<Value, EvalError> {
    stack
        .pop()
        .ok_or_else(|| malformed("operand stack underflow"))
}

/// Convert a byte distance into a token count, starting just after
/// `tokens[start]`. The distance must consume following tokens exactly.
fn count_tokens_to_skip(
    tokens: &[Token],
    start: usize,
    dist_in_bytes: usize,
) -> Result<usize, EvalError> {
    let mut remaining = dist_in_bytes as i64;
    let mut index = start;
    while remaining != 0 {
        index += 1;
        let Some(token) = tokens.get(index) else {
            return Err(malformed("skip distance ran past the end of the formula"));
        };
        remaining -= token.size() as i64;
        if remaining < 0 {
            return Err(malformed(
                "skip distance does not land on a token boundary",
            ));
        }
    }
    Ok(index - start)
}

/// Run the VM over `tokens` and produce the formula's value.
///
/// In single-value context the final value is dereferenced at the source
/// cell; otherwise the raw value (possibly an area) is returned.
pub(crate) fn evaluate_tokens(
    ec: &mut OperationEvaluationContext<'_, '_>,
    tokens: &[Token],
) -> Result<Value, EvalError> {
    let in_array_group = ec.array_group.is_some();
    let mut stack: Vec<Value> = Vec::new();
    let mut i = 0usize;

    while i < tokens.len() {
        let token = &tokens[i];
        if ec.evaluator.trace_active() {
            ec.evaluator.trace_line(
                ec.tracker.depth(),
                &format!("ptg[{i}] {token:?}, stack depth {}", stack.len()),
            );
        }
        match token {
            Token::Attr(Attr::Sum) => {
                // Shorthand for the one-argument variadic SUM.
                let arg = pop(&mut stack)?;
                let result = functions::invoke(idx::SUM, &[arg], ec)?;
                stack.push(result);
            }
            Token::Attr(Attr::If { dist }) if !in_array_group => {
                let predicate = pop(&mut stack)?;
                match logical::evaluate_predicate(&predicate, ec)? {
                    Err(e) => {
                        // Push the error, then hop over both branches via
                        // the two successive distance fields.
                        stack.push(Value::Error(e));
                        i += count_tokens_to_skip(tokens, i, usize::from(*dist))?;
                        let Some(Token::Attr(Attr::Skip { dist, .. })) = tokens.get(i) else {
                            return Err(malformed(
                                "optimized IF distance did not land on a skip attribute",
                            ));
                        };
                        i += count_tokens_to_skip(tokens, i, usize::from(*dist) + 1)?;
                    }
                    Ok(true) => {
                        // True-branch tokens follow immediately.
                    }
                    Ok(false) => {
                        i += count_tokens_to_skip(tokens, i, usize::from(*dist))?;
                        // A trailing two-argument IF has no false branch:
                        // the landing skip attribute is followed directly
                        // by the IF call token. The predicate is preserved
                        // and FALSE pushed for the call to consume.
                        if let (Some(Token::Attr(_)), Some(Token::FuncVar { func_ix, .. })) =
                            (tokens.get(i), tokens.get(i + 1))
                        {
                            if *func_ix == idx::IF {
                                stack.push(predicate);
                                stack.push(Value::Bool(false));
                            }
                        }
                    }
                }
            }
            Token::Attr(Attr::Choose {
                jump_table,
                choose_func_offset,
            }) => {
                let selector = pop(&mut stack)?;
                let n_choices = jump_table.len();
                let table_bytes = 2 * (n_choices + 1);
                let dist = match logical::evaluate_selector(&selector, ec)? {
                    Ok(ix) if ix >= 1 && (ix as usize) <= n_choices => {
                        usize::from(jump_table[ix as usize - 1])
                    }
                    Ok(_) => {
                        stack.push(Value::Error(ErrorValue::Value));
                        usize::from(*choose_func_offset) + 4
                    }
                    Err(e) => {
                        stack.push(Value::Error(e));
                        usize::from(*choose_func_offset) + 4
                    }
                };
                // Encoded distances include the jump-table bytes; token
                // counting starts after the whole attribute token.
                let dist = dist.checked_sub(table_bytes).ok_or_else(|| {
                    malformed("CHOOSE jump distance smaller than its jump table")
                })?;
                i += count_tokens_to_skip(tokens, i, dist)?;
            }
            // The array-context gate disables IF-branch skips together
            // with the IF attribute itself; CHOOSE's jump table stays
            // active in every context, so the skips ending its choices
            // must too.
            Token::Attr(Attr::Skip { dist, kind })
                if !in_array_group || *kind == SkipKind::Choice =>
            {
                i += count_tokens_to_skip(tokens, i, usize::from(*dist) + 1)?;
                // A skipped-over missing argument resolves to blank.
                if stack.last() == Some(&Value::MissingArg) {
                    stack.pop();
                    stack.push(Value::Blank);
                }
            }
            // Remaining attributes (and the ones disabled in array
            // context), parentheses and pre-computed region markers are
            // evaluation no-ops.
            Token::Attr(_) | Token::Paren => {}
            Token::MemFunc { .. } | Token::MemArea { .. } | Token::MemErr { .. } => {}
            Token::Union => {
                let second = pop(&mut stack)?;
                let first = pop(&mut stack)?;
                stack.push(Value::RefList(vec![first, second]));
            }
            Token::Exp { .. } => {
                return Err(EvalError::Unsupported("shared-formula host reference"))
            }
            Token::Unknown(_) => return Err(malformed("unknown token class")),
            t if t.is_operation() => {
                let arity = match t {
                    Token::Func { arity, .. } | Token::FuncVar { arity, .. } => {
                        usize::from(*arity)
                    }
                    other => {
                        usize::from(
                            operators::lookup(other)
                                .ok_or_else(|| malformed("operator without implementation"))?
                                .arity,
                        )
                    }
                };
                // Operands pop in reverse order.
                let mut ops: SmallVec<[Value; 8]> = (0..arity)
                    .map(|_| pop(&mut stack))
                    .collect::<Result<_, _>>()?;
                ops.reverse();
                let result = match t {
                    Token::Func { func_ix, .. } | Token::FuncVar { func_ix, .. } => {
                        functions::invoke(*func_ix, &ops, ec)?
                    }
                    other => {
                        let op = operators::lookup(other)
                            .ok_or_else(|| malformed("operator without implementation"))?;
                        (op.eval)(&ops, ec)?
                    }
                };
                stack.push(result);
            }
            leaf => stack.push(leaf_value(leaf, ec)?),
        }
        i += 1;
    }

    let value = pop(&mut stack)
        .map_err(|_| malformed("evaluation stack empty at end of formula"))?;
    if !stack.is_empty() {
        return Err(malformed("evaluation stack not empty at end of formula"));
    }
    if ec.is_single_value() {
        resolver::dereference_result(value, ec)
    } else {
        Ok(value)
    }
}

/// Evaluate a named-range definition. A single leaf token resolves
/// directly (so a name bound to an area stays an area); anything longer
/// runs through the VM.
pub(crate) fn evaluate_name_formula(
    ec: &mut OperationEvaluationContext<'_, '_>,
    tokens: &[Token],
) -> Result<Value, EvalError> {
    if tokens.len() == 1 && !matches!(tokens[0], Token::FuncVar { .. }) {
        return leaf_value(&tokens[0], ec);
    }
    evaluate_tokens(ec, tokens)
}

/// Resolve a non-operation token to the value it pushes.
fn leaf_value(
    token: &Token,
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Value, EvalError> {
    Ok(match token {
        Token::Int(n) => Value::Number(f64::from(*n)),
        Token::Num(n) => Value::Number(*n),
        Token::Str(s) => Value::Text(s.clone()),
        Token::Bool(b) => Value::Bool(*b),
        Token::Err(e) => Value::Error(*e),
        Token::MissingArg => Value::MissingArg,
        Token::Ref(r) => ec.ref_value(r)?,
        Token::Area(a) => ec.area_value(a)?,
        Token::Ref3d { extern_sheet, cell } => ec.ref3d_value(*extern_sheet, cell)?,
        Token::Area3d { extern_sheet, area } => ec.area3d_value(*extern_sheet, area)?,
        Token::DeletedRef | Token::DeletedArea3d { .. } => Value::Error(ErrorValue::Ref),
        Token::Array(literal) => ec.array_literal_value(literal),
        Token::Name { name_ix } => name_value(*name_ix, ec)?,
        Token::NameX { name_ix } => name_x_value(*name_ix, ec)?,
        other => {
            return Err(malformed(format!(
                "token {other:?} is not a value-producing token"
            )))
        }
    })
}

fn name_value(
    name_ix: u32,
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Value, EvalError> {
    let Some(record) = ec.workbook().name_by_index(name_ix) else {
        return Err(malformed(format!("name index {name_ix} out of range")));
    };
    if record.is_function_name {
        return Ok(Value::FunctionName(record.name));
    }
    match record.definition {
        Some(tokens) => evaluate_name_formula(ec, &tokens),
        None => Err(malformed(format!(
            "name {:?} has no formula definition",
            record.name
        ))),
    }
}

/// External names resolve like local names when the workbook defines
/// them; otherwise they stand for an add-in or user function about to be
/// called.
fn name_x_value(
    name_ix: u32,
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Value, EvalError> {
    let Some(name) = ec.workbook().extern_name(name_ix) else {
        return Err(malformed(format!(
            "extern name index {name_ix} out of range"
        )));
    };
    if let Some(local_ix) = ec.lookup_name(&name, -1) {
        return name_value(local_ix, ec);
    }
    Ok(Value::FunctionName(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skip(dist: u16) -> Token {
        Token::Attr(Attr::Skip {
            dist,
            kind: SkipKind::IfBranch,
        })
    }

    #[test]
    fn byte_distances_convert_to_token_counts() {
        let tokens = vec![
            skip(0),           // start
            Token::Int(1),     // 3 bytes
            Token::Num(2.0),   // 9 bytes
            Token::Bool(true), // 2 bytes
        ];
        assert_eq!(count_tokens_to_skip(&tokens, 0, 0).unwrap(), 0);
        assert_eq!(count_tokens_to_skip(&tokens, 0, 3).unwrap(), 1);
        assert_eq!(count_tokens_to_skip(&tokens, 0, 12).unwrap(), 2);
        assert_eq!(count_tokens_to_skip(&tokens, 0, 14).unwrap(), 3);
    }

    #[test]
    fn misaligned_or_overlong_distances_are_malformed() {
        let tokens = vec![skip(0), Token::Int(1)];
        assert!(matches!(
            count_tokens_to_skip(&tokens, 0, 2),
            Err(EvalError::MalformedFormula(_))
        ));
        assert!(matches!(
            count_tokens_to_skip(&tokens, 0, 4),
            Err(EvalError::MalformedFormula(_))
        ));
    }
}
