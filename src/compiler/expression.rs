//! Expression and terminator compilation: operator-precedence root finding
//! over a flat token run, plus the atomic forms (literals, variable reads,
//! index chains, array literals, and calls).

use super::{emit, find_matching_access, CompileError, CompilerState};
use crate::lexer::{escape_nambly, LexKind, Token, OPERATOR_PRECEDENCE};

fn rank(operator: &str) -> usize {
    OPERATOR_PRECEDENCE
        .iter()
        .position(|op| *op == operator)
        .expect("the classifier only emits known operators")
}

/// Compiles a token run into bytecode that leaves exactly one value on the
/// stack (or none, when `discard` holds and the run is a call statement).
///
/// Single left-to-right pass: the loosest-binding depth-0 operator (rightmost
/// among equally loose ones) becomes the root; both sides recurse.
pub(crate) fn compile_expression(
    state: &mut CompilerState,
    tokens: &[Token],
    discard: bool,
    out: &mut String,
) -> Result<(), CompileError> {
    debug_assert!(!tokens.is_empty(), "callers reject empty expressions");
    let mut par_depth: i32 = 0;
    let mut access_depth: i32 = 0;
    let mut root: Option<usize> = None;
    let mut depth0_count = 0usize;
    for (i, token) in tokens.iter().enumerate() {
        let initial_depth = par_depth + access_depth;
        match token.kind {
            LexKind::ParOpen => par_depth += 1,
            LexKind::ParClose => {
                par_depth -= 1;
                if par_depth < 0 {
                    return Err(CompileError::expression("')' before '('", token));
                }
            }
            LexKind::AccessOpen => access_depth += 1,
            LexKind::AccessClose => {
                access_depth -= 1;
                if access_depth < 0 {
                    return Err(CompileError::expression("']' before '['", token));
                }
            }
            _ => {}
        }
        let depth = par_depth + access_depth;
        if depth == 0 && token.kind == LexKind::Operator && i > 0 {
            // A leading operator stays with its terminator (unary form).
            root = match root {
                None => Some(i),
                // Folding on <= groups equal-precedence operators left to
                // right: the rightmost loosest operator wins the root.
                Some(r) if rank(&tokens[r].text) <= rank(&token.text) => Some(i),
                Some(r) => Some(r),
            };
        }
        if initial_depth == 0 || depth == 0 {
            depth0_count += 1;
        }
    }
    let last = tokens.last().expect("tokens is nonempty");
    if par_depth > 0 {
        return Err(CompileError::expression("missing ')'", last));
    }
    if access_depth > 0 {
        return Err(CompileError::expression("missing ']'", last));
    }

    // A run fully enclosed by one paren pair re-evaluates its interior.
    if depth0_count == 2
        && tokens[0].kind == LexKind::ParOpen
        && last.kind == LexKind::ParClose
    {
        let interior = &tokens[1..tokens.len() - 1];
        if interior.is_empty() {
            return Err(CompileError::expression("empty parentheses", &tokens[0]));
        }
        return compile_expression(state, interior, discard, out);
    }

    let Some(root) = root else {
        return compile_terminator(state, tokens, discard, out);
    };
    let operator = &tokens[root];
    if root + 1 == tokens.len() {
        return Err(CompileError::expression(
            format!("expecting an expression after operator '{}'", operator.text),
            operator,
        ));
    }
    compile_expression(state, &tokens[..root], false, out)?;
    compile_expression(state, &tokens[root + 1..], false, out)?;
    let opcode = match operator.text.as_str() {
        "*" => "MULT",
        "^" => "POWR",
        "/" => "FDIV",
        "//" => "IDIV",
        "%" => "MODL",
        "+" => "ADDV",
        "-" => "SUBT",
        "&" => "JOIN",
        "=" => "ISEQ",
        "<>" | "!=" => "ISNE",
        "<" => "ISLT",
        ">" => "ISGT",
        "<=" => "ISLE",
        ">=" => "ISGE",
        "&&" => "LAND",
        "||" => "LGOR",
        "::" => "ISIN",
        other => {
            return Err(CompileError::expression(
                format!("the operator '{other}' cannot be used as an infix operator"),
                operator,
            ));
        }
    };
    emit(out, opcode);
    if discard {
        emit(out, "POPV");
    }
    Ok(())
}

/// What the cursor has already compiled, to validate what may follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Atom {
    None,
    /// Variables, call results, table and array literals: may be indexed.
    Indexable,
    Plain,
}

/// Compiles a terminator: a token run with no top-level operator.
fn compile_terminator(
    state: &mut CompilerState,
    tokens: &[Token],
    discard: bool,
    out: &mut String,
) -> Result<(), CompileError> {
    let mut i = 0;
    let mut add_minus = false;
    let mut add_negation = false;
    let mut atom = Atom::None;
    let mut discarded_by_call = false;
    while i < tokens.len() {
        let token = &tokens[i];
        let next = tokens.get(i + 1);
        match token.kind {
            LexKind::Operator if token.text == "-" => {
                let Some(next) = next else {
                    return Err(CompileError::expression("missing value after '-'", token));
                };
                if matches!(next.kind, LexKind::Integer | LexKind::Float) {
                    if atom != Atom::None {
                        return Err(unexpected(token));
                    }
                    emit(out, format!("PUSH -{}", next.text));
                    atom = Atom::Plain;
                    i += 2;
                    continue;
                }
                add_minus = true;
            }
            LexKind::Operator if token.text == "!" => {
                if next.is_none() {
                    return Err(CompileError::expression("missing value after '!'", token));
                }
                add_negation = true;
            }
            LexKind::Variable => {
                if atom != Atom::None {
                    return Err(unexpected(token));
                }
                state.check_variable(token)?;
                emit(out, format!("VGET \"{}\"", escape_nambly(token.var_name())));
                atom = Atom::Indexable;
            }
            LexKind::StringLit => {
                if atom != Atom::None {
                    return Err(unexpected(token));
                }
                emit(out, format!("PUSH \"{}\"", token.nambly_string()));
                atom = Atom::Plain;
            }
            LexKind::Integer | LexKind::Float => {
                if atom != Atom::None {
                    return Err(unexpected(token));
                }
                emit(out, format!("PUSH {}", token.text));
                atom = Atom::Plain;
            }
            LexKind::TableKw => {
                if atom != Atom::None {
                    return Err(unexpected(token));
                }
                emit(out, "TABL");
                atom = Atom::Indexable;
            }
            LexKind::AccessOpen if atom == Atom::None => {
                // Array literal: nil sentinel, elements, ARRR.
                let close = find_matching_access(tokens, i)
                    .ok_or_else(|| CompileError::expression("missing ']'", token))?;
                let interior = &tokens[i + 1..close];
                emit(out, "PNIL");
                if !interior.is_empty() {
                    for element in split_arguments(interior)? {
                        compile_expression(state, element, false, out)?;
                    }
                }
                emit(out, "ARRR");
                atom = Atom::Indexable;
                i = close + 1;
                expect_chain(tokens, i)?;
                continue;
            }
            LexKind::AccessOpen => {
                if atom != Atom::Indexable {
                    return Err(CompileError::expression(
                        "attempting to index a value that cannot be indexed",
                        token,
                    ));
                }
                let close = find_matching_access(tokens, i)
                    .ok_or_else(|| CompileError::expression("missing ']'", token))?;
                let interior = &tokens[i + 1..close];
                if interior.is_empty() {
                    return Err(CompileError::expression("empty table access", token));
                }
                compile_expression(state, interior, false, out)?;
                emit(out, "PGET");
                i = close + 1;
                expect_chain(tokens, i)?;
                continue;
            }
            LexKind::Word => {
                if atom != Atom::None {
                    return Err(unexpected(token));
                }
                match next {
                    Some(open) if open.kind == LexKind::ParOpen => {}
                    _ => {
                        return Err(CompileError::expression(
                            "expecting an argument list after a function name",
                            token,
                        ));
                    }
                }
                let close = find_matching_paren(tokens, i + 1)
                    .ok_or_else(|| CompileError::expression("missing ')'", token))?;
                let interior = &tokens[i + 2..close];
                let arguments = if interior.is_empty() {
                    Vec::new()
                } else {
                    split_arguments(interior)?
                };
                // Discarding applies only when the call ends the run.
                let call_is_last = close + 1 == tokens.len() && !add_minus && !add_negation;
                let call_discard = discard && call_is_last;
                compile_call(state, token, &arguments, call_discard, out)?;
                discarded_by_call |= call_discard;
                atom = Atom::Indexable;
                i = close + 1;
                expect_chain(tokens, i)?;
                continue;
            }
            LexKind::ParOpen => {
                return Err(CompileError::expression("calling a non-function value", token));
            }
            _ => return Err(unexpected(token)),
        }
        i += 1;
    }
    if add_minus {
        emit(out, "PUSH -1");
        emit(out, "MULT");
    }
    if add_negation {
        emit(out, "LNOT");
    }
    if discard && !discarded_by_call && atom != Atom::None {
        emit(out, "POPV");
    }
    Ok(())
}

fn unexpected(token: &Token) -> CompileError {
    CompileError::expression(format!("unexpected token '{}'", token.text), token)
}

/// After an index segment, array literal, or call, only another `[` may
/// follow within the same terminator.
fn expect_chain(tokens: &[Token], i: usize) -> Result<(), CompileError> {
    match tokens.get(i) {
        None => Ok(()),
        Some(token) if token.kind == LexKind::AccessOpen => Ok(()),
        Some(token) => Err(CompileError::expression(
            format!("unexpected expression element '{}'", token.text),
            token,
        )),
    }
}

/// Index of the `)` matching the `(` at `open`.
fn find_matching_paren(tokens: &[Token], open: usize) -> Option<usize> {
    let mut depth = 0;
    for (i, token) in tokens.iter().enumerate().skip(open) {
        match token.kind {
            LexKind::ParOpen => depth += 1,
            LexKind::ParClose => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Splits a call-argument (or array-element) run on top-level commas. Each
/// piece is a full expression.
fn split_arguments(tokens: &[Token]) -> Result<Vec<&[Token]>, CompileError> {
    let mut arguments = Vec::new();
    let mut depth: i32 = 0;
    let mut start = 0usize;
    for (i, token) in tokens.iter().enumerate() {
        match token.kind {
            LexKind::ParOpen | LexKind::AccessOpen => depth += 1,
            LexKind::ParClose | LexKind::AccessClose => depth -= 1,
            LexKind::Decoration if token.text == "," && depth == 0 => {
                if start == i {
                    return Err(CompileError::expression("empty argument", token));
                }
                arguments.push(&tokens[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if start == tokens.len() {
        let last = tokens.last().expect("split_arguments input is nonempty");
        return Err(CompileError::expression("empty argument", last));
    }
    arguments.push(&tokens[start..]);
    Ok(arguments)
}

/// Built-in operations callable with function syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Builtin {
    Print,
    Printc,
    Accept,
    Is,
    Del,
    IsNil,
    Exit,
    Len,
    Substr,
    Trim,
    Floor,
    Keys,
    Wait,
    Exec,
    OpenRw,
    OpenRa,
    Close,
    ReadFile,
    ReadLine,
    Write,
    Iter,
    Next,
}

impl Builtin {
    pub(crate) fn from_name(name: &str) -> Option<Builtin> {
        Some(match name {
            "print" => Builtin::Print,
            "printc" => Builtin::Printc,
            "accept" => Builtin::Accept,
            "is" => Builtin::Is,
            "del" => Builtin::Del,
            "is_nil" => Builtin::IsNil,
            "exit" => Builtin::Exit,
            "len" => Builtin::Len,
            "substr" => Builtin::Substr,
            "trim" => Builtin::Trim,
            "floor" => Builtin::Floor,
            "keys" => Builtin::Keys,
            "wait" => Builtin::Wait,
            "exec" => Builtin::Exec,
            "open_rw" => Builtin::OpenRw,
            "open_ra" => Builtin::OpenRa,
            "close" => Builtin::Close,
            "read_file" => Builtin::ReadFile,
            "read_line" => Builtin::ReadLine,
            "write" => Builtin::Write,
            "iter" => Builtin::Iter,
            "next" => Builtin::Next,
            _ => return None,
        })
    }
}

fn compile_call(
    state: &mut CompilerState,
    name: &Token,
    arguments: &[&[Token]],
    discard: bool,
    out: &mut String,
) -> Result<(), CompileError> {
    if let Some(builtin) = Builtin::from_name(&name.text) {
        return compile_builtin(state, builtin, name, arguments, discard, out);
    }
    // User function: nil sentinel, arguments, packed table, call.
    let entry = state.reference_function(name);
    emit(out, "PNIL");
    for argument in arguments {
        compile_expression(state, argument, false, out)?;
    }
    emit(out, "ARRR");
    emit(out, format!("CALL {entry}"));
    if discard {
        emit(out, "POPV");
    }
    Ok(())
}

fn check_arity(
    name: &Token,
    arguments: &[&[Token]],
    expected: usize,
) -> Result<(), CompileError> {
    if arguments.len() == expected {
        Ok(())
    } else {
        Err(CompileError::parse(
            format!(
                "wrong number of arguments for function {} (expected {expected})",
                name.text
            ),
            name,
        ))
    }
}

fn compile_builtin(
    state: &mut CompilerState,
    builtin: Builtin,
    name: &Token,
    arguments: &[&[Token]],
    discard: bool,
    out: &mut String,
) -> Result<(), CompileError> {
    match builtin {
        Builtin::Print | Builtin::Printc => {
            compile_display(state, arguments, builtin == Builtin::Print, discard, out)?;
        }
        Builtin::Accept => {
            if !arguments.is_empty() {
                // The prompt is printed without a trailing newline.
                compile_display(state, arguments, false, true, out)?;
            }
            emit(out, "ACCP");
            if discard {
                emit(out, "POPV");
            }
        }
        Builtin::Is => {
            check_arity(name, arguments, 2)?;
            compile_expression(state, arguments[0], false, out)?;
            compile_expression(state, arguments[1], false, out)?;
            emit(out, "PIST");
            if discard {
                emit(out, "POPV");
            }
        }
        Builtin::Del => {
            check_arity(name, arguments, 2)?;
            compile_expression(state, arguments[0], false, out)?;
            compile_expression(state, arguments[1], false, out)?;
            emit(out, "PUST");
            if !discard {
                emit(out, "PNIL");
            }
        }
        Builtin::Exit => {
            check_arity(name, arguments, 1)?;
            compile_expression(state, arguments[0], false, out)?;
            emit(out, "EXIT");
        }
        Builtin::IsNil => compile_unary(state, name, arguments, "NIL?", discard, out)?,
        Builtin::Len => compile_unary(state, name, arguments, "SLEN", discard, out)?,
        Builtin::Trim => compile_unary(state, name, arguments, "TRIM", discard, out)?,
        Builtin::Floor => compile_unary(state, name, arguments, "FLOR", discard, out)?,
        Builtin::Keys => compile_unary(state, name, arguments, "KEYS", discard, out)?,
        Builtin::ReadFile => compile_unary(state, name, arguments, "RFIL", discard, out)?,
        Builtin::ReadLine => compile_unary(state, name, arguments, "RLNE", discard, out)?,
        Builtin::Iter => compile_unary(state, name, arguments, "GITR", discard, out)?,
        Builtin::OpenRw => compile_unary(state, name, arguments, "FORW", discard, out)?,
        Builtin::OpenRa => compile_unary(state, name, arguments, "FORA", discard, out)?,
        Builtin::Substr => {
            check_arity(name, arguments, 3)?;
            for argument in arguments {
                compile_expression(state, argument, false, out)?;
            }
            emit(out, "SSTR");
            if discard {
                emit(out, "POPV");
            }
        }
        Builtin::Close => {
            check_arity(name, arguments, 1)?;
            compile_expression(state, arguments[0], false, out)?;
            emit(out, "FCLS");
            if !discard {
                emit(out, "PNIL");
            }
        }
        Builtin::Wait => {
            check_arity(name, arguments, 1)?;
            compile_expression(state, arguments[0], false, out)?;
            emit(out, "WAIT");
            if !discard {
                emit(out, "PNIL");
            }
        }
        Builtin::Write => {
            check_arity(name, arguments, 2)?;
            // FWRT pops the filename last.
            compile_expression(state, arguments[1], false, out)?;
            compile_expression(state, arguments[0], false, out)?;
            emit(out, "FWRT");
            if !discard {
                emit(out, "PNIL");
            }
        }
        Builtin::Exec => {
            check_arity(name, arguments, 1)?;
            compile_expression(state, arguments[0], false, out)?;
            emit(out, "EXEC");
            // EXEC leaves code, stderr, stdout; package them into a table
            // with the fields `output`, `error`, `code`.
            emit(out, "VSET \"$exec_out\"");
            emit(out, "VSET \"$exec_err\"");
            emit(out, "VSET \"$exec_code\"");
            emit(out, "TABL");
            for (key, var) in [
                ("output", "$exec_out"),
                ("error", "$exec_err"),
                ("code", "$exec_code"),
            ] {
                emit(out, "DUPL");
                emit(out, format!("PUSH \"{key}\""));
                emit(out, format!("VGET \"{var}\""));
                emit(out, "PSET");
            }
            if discard {
                emit(out, "POPV");
            }
        }
        Builtin::Next => {
            check_arity(name, arguments, 1)?;
            let variable = match arguments[0] {
                [token] if token.kind == LexKind::Variable => token,
                _ => {
                    return Err(CompileError::parse(
                        "the argument to next must be a single variable",
                        name,
                    ));
                }
            };
            state.check_variable(variable)?;
            emit(out, format!("NEXT \"{}\"", escape_nambly(variable.var_name())));
            if discard {
                emit(out, "POPV");
            }
        }
    }
    Ok(())
}

fn compile_unary(
    state: &mut CompilerState,
    name: &Token,
    arguments: &[&[Token]],
    opcode: &str,
    discard: bool,
    out: &mut String,
) -> Result<(), CompileError> {
    check_arity(name, arguments, 1)?;
    compile_expression(state, arguments[0], false, out)?;
    emit(out, opcode);
    if discard {
        emit(out, "POPV");
    }
    Ok(())
}

/// `print`/`printc`. When the value is kept, the pieces are joined into the
/// expression result through the `$swap` system variable while printing.
fn compile_display(
    state: &mut CompilerState,
    arguments: &[&[Token]],
    newline: bool,
    discard: bool,
    out: &mut String,
) -> Result<(), CompileError> {
    if discard {
        for argument in arguments {
            compile_expression(state, argument, false, out)?;
            emit(out, "DISP");
        }
    } else {
        emit(out, "PUSH \"\"");
        for argument in arguments {
            compile_expression(state, argument, false, out)?;
            emit(out, "DUPL");
            emit(out, "VSET \"$swap\"");
            emit(out, "DISP");
            emit(out, "VGET \"$swap\"");
            emit(out, "JOIN");
        }
    }
    if newline {
        emit(out, "PUSH \"\\n\"");
        emit(out, "DISP");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::compiler::{compile_source, CompileError};

    fn compile(src: &str) -> String {
        compile_source(src, "test.kat").unwrap()
    }

    fn compile_err(src: &str) -> CompileError {
        compile_source(src, "test.kat").unwrap_err()
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        let code = compile("$x: 2 + 3 * 4;");
        assert_eq!(code, "PUSH 2\nPUSH 3\nPUSH 4\nMULT\nADDV\nVSET \"x\"\n");
    }

    #[test]
    fn parentheses_override_precedence() {
        let code = compile("$x: (2 + 3) * 4;");
        assert_eq!(code, "PUSH 2\nPUSH 3\nADDV\nPUSH 4\nMULT\nVSET \"x\"\n");
    }

    #[test]
    fn equal_precedence_groups_left_to_right() {
        // 10 - 4 - 3 must compile as (10 - 4) - 3.
        let code = compile("$x: 10 - 4 - 3;");
        assert_eq!(code, "PUSH 10\nPUSH 4\nSUBT\nPUSH 3\nSUBT\nVSET \"x\"\n");
    }

    #[test]
    fn comparison_is_looser_than_arithmetic() {
        let code = compile("$x: 1 + 2 = 3;");
        assert_eq!(code, "PUSH 1\nPUSH 2\nADDV\nPUSH 3\nISEQ\nVSET \"x\"\n");
    }

    #[test]
    fn logical_operators_are_loosest() {
        let code = compile("$x: 1 = 1 && 2 = 2;");
        assert!(code.ends_with("ISEQ\nISEQ\nLAND\nVSET \"x\"\n"));
    }

    #[test]
    fn membership_and_concat_map_to_isin_and_join() {
        assert!(compile("$x: \"a\" & \"b\";").contains("JOIN"));
        assert!(compile("$t: table;\n$x: \"k\" :: $t;").contains("ISIN"));
    }

    #[test]
    fn negative_literal_folds_into_the_push() {
        assert_eq!(compile("$x: -5;"), "PUSH -5\nVSET \"x\"\n");
    }

    #[test]
    fn unary_minus_on_a_variable_multiplies_by_minus_one() {
        let code = compile("$a: 1;\n$x: -$a;");
        assert!(code.contains("VGET \"a\"\nPUSH -1\nMULT"));
    }

    #[test]
    fn prefix_negation_emits_lnot() {
        let code = compile("$a: 1;\n$x: !$a;");
        assert!(code.contains("VGET \"a\"\nLNOT"));
    }

    #[test]
    fn bang_used_infix_is_an_error() {
        let err = compile_err("$x: 1 ! 2;");
        assert!(err.to_string().contains("infix"));
    }

    #[test]
    fn operator_with_no_right_side_is_an_error() {
        let err = compile_err("$x: 1 +;");
        assert!(matches!(err, CompileError::Expression { .. }));
    }

    #[test]
    fn unbalanced_parens_are_an_error() {
        assert!(matches!(compile_err("$x: (1 + 2;"), CompileError::Expression { .. }));
        assert!(matches!(compile_err("$x: 1 + 2);"), CompileError::Expression { .. }));
    }

    #[test]
    fn array_literal_uses_the_nil_sentinel() {
        let code = compile("$a: [1, 2, 3];");
        assert_eq!(code, "PNIL\nPUSH 1\nPUSH 2\nPUSH 3\nARRR\nVSET \"a\"\n");
    }

    #[test]
    fn index_chain_compiles_each_segment_to_pget() {
        let code = compile("$t: table;\n$x: $t[\"a\"][1 + 1];");
        assert!(code.contains("VGET \"t\"\nPUSH \"a\"\nPGET\nPUSH 1\nPUSH 1\nADDV\nPGET"));
    }

    #[test]
    fn access_string_sugar_indexes_like_brackets() {
        let code = compile("$t: table;\n$x: $t{key};");
        assert!(code.contains("VGET \"t\"\nPUSH \"key\"\nPGET"));
    }

    #[test]
    fn indexing_a_number_literal_is_an_error() {
        let err = compile_err("$x: 5[1];");
        assert!(err.to_string().contains("indexed"));
    }

    #[test]
    fn user_call_packs_arguments_into_a_table() {
        let code = compile("def f;\nreturn 0;\nok;\n$x: f(1, 2);");
        assert!(code.contains("PNIL\nPUSH 1\nPUSH 2\nARRR\nCALL FN_f_START"));
    }

    #[test]
    fn discarded_call_statement_pops_its_result() {
        let code = compile("def f;\nreturn 0;\nok;\nf(1);");
        assert!(code.contains("CALL FN_f_START\nPOPV"));
    }

    #[test]
    fn print_statement_displays_and_appends_newline() {
        let code = compile("print(\"hi\");");
        assert_eq!(code, "PUSH \"hi\"\nDISP\nPUSH \"\\n\"\nDISP\n");
    }

    #[test]
    fn print_as_expression_joins_through_the_swap_variable() {
        let code = compile("$x: print(\"hi\");");
        assert!(code.contains("DUPL\nVSET \"$swap\"\nDISP\nVGET \"$swap\"\nJOIN"));
    }

    #[test]
    fn accept_emits_the_prompt_then_accp() {
        let code = compile("$x: accept(\"name? \");");
        assert!(code.contains("PUSH \"name? \"\nDISP\nACCP"));
    }

    #[test]
    fn exec_packages_the_result_table() {
        let code = compile("$r: exec(\"true\");");
        for needle in ["EXEC", "PUSH \"output\"", "PUSH \"error\"", "PUSH \"code\""] {
            assert!(code.contains(needle), "missing {needle}");
        }
    }

    #[test]
    fn write_pushes_contents_before_the_filename() {
        let code = compile("$f: \"x\";\nwrite($f, \"data\");");
        assert!(code.contains("PUSH \"data\"\nVGET \"f\"\nFWRT"));
    }

    #[test]
    fn next_requires_a_single_variable_argument() {
        let code = compile("$it: iter(\"ab\");\n$k: next($it);");
        assert!(code.contains("NEXT \"it\""));
        assert!(matches!(
            compile_err("$k: next(1 + 2);"),
            CompileError::Parse { .. }
        ));
    }

    #[test]
    fn builtin_arity_is_checked() {
        let err = compile_err("$x: substr(\"abc\", 1);");
        assert!(err.to_string().contains("expected 3"));
    }

    #[test]
    fn empty_call_argument_is_an_error() {
        assert!(matches!(compile_err("print(1,, 2);"), CompileError::Expression { .. }));
        assert!(matches!(compile_err("print(1, 2,);"), CompileError::Expression { .. }));
    }
}
