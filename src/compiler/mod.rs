//! The Katalyn-to-Nambly compiler: statement dispatch, block-closing
//! protocol, scope tracking, and function resolution. Expression and
//! terminator compilation live in [`expression`].

pub mod expression;

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use crate::lexer::{self, LexError, LexKind, Token};

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("Expression error in '{file}', line {line}: {message}")]
    Expression {
        message: String,
        line: u32,
        file: String,
    },
    #[error("Parse error in '{file}', line {line}: {message}")]
    Parse {
        message: String,
        line: u32,
        file: String,
    },
    #[error("Import error in '{file}', line {line}: cannot read '{path}': {source}")]
    Import {
        path: String,
        file: String,
        line: u32,
        source: io::Error,
    },
    #[error(transparent)]
    Lex(#[from] LexError),
}

impl CompileError {
    pub(crate) fn expression(message: impl Into<String>, at: &Token) -> CompileError {
        CompileError::Expression {
            message: message.into(),
            line: at.line,
            file: at.file.clone(),
        }
    }

    pub(crate) fn parse(message: impl Into<String>, at: &Token) -> CompileError {
        CompileError::Parse {
            message: message.into(),
            line: at.line,
            file: at.file.clone(),
        }
    }
}

/// Statement keywords. Any other leading word is an expression statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Keyword {
    Global,
    Unsafe,
    If,
    Elif,
    Else,
    Unless,
    While,
    Until,
    Break,
    Continue,
    Def,
    Return,
    Ok,
    Import,
}

impl Keyword {
    fn from_word(word: &str) -> Option<Keyword> {
        Some(match word {
            "global" => Keyword::Global,
            "unsafe" => Keyword::Unsafe,
            "if" => Keyword::If,
            "elif" => Keyword::Elif,
            "else" => Keyword::Else,
            "unless" => Keyword::Unless,
            "while" => Keyword::While,
            "until" => Keyword::Until,
            "break" => Keyword::Break,
            "continue" => Keyword::Continue,
            "def" => Keyword::Def,
            "return" => Keyword::Return,
            "ok" => Keyword::Ok,
            "import" => Keyword::Import,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    If,
    Elif,
    Else,
    Unless,
    While,
    Until,
    Def,
}

impl BlockKind {
    fn name(self) -> &'static str {
        match self {
            BlockKind::If => "if",
            BlockKind::Elif => "elif",
            BlockKind::Else => "else",
            BlockKind::Unless => "unless",
            BlockKind::While => "while",
            BlockKind::Until => "until",
            BlockKind::Def => "def",
        }
    }

    fn is_chain_segment(self) -> bool {
        matches!(self, BlockKind::If | BlockKind::Elif)
    }
}

/// One entry per open block. `close_code` is emitted verbatim by the
/// matching `ok`.
struct PendingBlock {
    kind: BlockKind,
    opener: Token,
    close_code: String,
    /// For if/elif segments: this segment's end label and the chain's
    /// shared exit label.
    chain: Option<(String, String)>,
}

struct LoopLabels {
    start: String,
    end: String,
}

struct FunctionInfo {
    defined: bool,
    /// Where the name was first called, for the end-of-compilation check.
    first_call: Option<(String, u32)>,
}

/// All mutable compilation context, created fresh per run.
pub struct CompilerState {
    block_count: usize,
    pending: Vec<PendingBlock>,
    loops: Vec<LoopLabels>,
    /// Declared-variable sets; index 0 is global, last is current.
    scopes: Vec<HashSet<String>>,
    functions: HashMap<String, FunctionInfo>,
    imported: HashSet<PathBuf>,
    /// Set while compiling an `unsafe` statement: unresolved variable
    /// reads pass through instead of failing.
    pub(crate) unchecked: bool,
}

impl CompilerState {
    pub fn new() -> CompilerState {
        CompilerState {
            block_count: 0,
            pending: Vec::new(),
            loops: Vec::new(),
            scopes: vec![HashSet::new()],
            functions: HashMap::new(),
            imported: HashSet::new(),
            unchecked: false,
        }
    }

    fn fresh_block(&mut self) -> usize {
        let n = self.block_count;
        self.block_count += 1;
        n
    }

    pub(crate) fn declare_variable(&mut self, name: &str) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string());
        }
    }

    fn declare_global_variable(&mut self, name: &str) {
        if let Some(scope) = self.scopes.first_mut() {
            scope.insert(name.to_string());
        }
    }

    /// Declaration check for a variable read: current scope, else global.
    pub(crate) fn check_variable(&self, token: &Token) -> Result<(), CompileError> {
        if self.unchecked {
            return Ok(());
        }
        let name = token.var_name();
        let declared = self.scopes.last().is_some_and(|s| s.contains(name))
            || self.scopes.first().is_some_and(|s| s.contains(name));
        if declared {
            Ok(())
        } else {
            Err(CompileError::parse(
                format!("variable '{}' read before assignment", token.text),
                token,
            ))
        }
    }

    /// Records a call to `name`, allocating a forward reference if it has
    /// not been defined yet. Returns the entry label.
    pub(crate) fn reference_function(&mut self, token: &Token) -> String {
        let name = token.text.clone();
        self.functions.entry(name.clone()).or_insert_with(|| FunctionInfo {
            defined: false,
            first_call: Some((token.file.clone(), token.line)),
        });
        function_entry_label(&name)
    }

    /// End-of-compilation obligations: no open blocks, no undefined
    /// forward-referenced functions.
    pub fn finish(&self) -> Result<(), CompileError> {
        if let Some(block) = self.pending.last() {
            return Err(CompileError::parse(
                format!("'{}' block is never closed, missing 'ok'", block.kind.name()),
                &block.opener,
            ));
        }
        for (name, info) in &self.functions {
            if !info.defined {
                let (file, line) = info
                    .first_call
                    .clone()
                    .unwrap_or_else(|| (String::new(), 0));
                return Err(CompileError::Parse {
                    message: format!("undeclared function '{name}'"),
                    line,
                    file,
                });
            }
        }
        Ok(())
    }
}

impl Default for CompilerState {
    fn default() -> Self {
        CompilerState::new()
    }
}

fn function_entry_label(name: &str) -> String {
    format!("FN_{name}_START")
}

fn function_skip_label(name: &str) -> String {
    format!("FN_{name}_SKIP")
}

/// Appends one Nambly line.
pub(crate) fn emit(out: &mut String, line: impl AsRef<str>) {
    out.push('\n');
    out.push_str(line.as_ref());
}

/// Compiles one source string into a Nambly listing. `filename` is used for
/// diagnostics and as the base for `import` path resolution.
pub fn compile_source(source: &str, filename: &str) -> Result<String, CompileError> {
    let mut state = CompilerState::new();
    let mut out = String::new();
    compile_chunk(&mut state, source, filename, &mut out)?;
    state.finish()?;
    Ok(stylize(&out))
}

/// Lexes and compiles a source chunk into `out` with shared state; used for
/// the main file and for every `import`.
fn compile_chunk(
    state: &mut CompilerState,
    source: &str,
    filename: &str,
    out: &mut String,
) -> Result<(), CompileError> {
    let lines = lexer::lex(source, filename)?;
    for line in &lines {
        compile_statement(state, line, out)?;
    }
    Ok(())
}

/// Removes blank lines so the listing stays dense.
fn stylize(code: &str) -> String {
    let mut tidy = String::with_capacity(code.len());
    for line in code.lines() {
        if !line.is_empty() {
            tidy.push_str(line);
            tidy.push('\n');
        }
    }
    tidy
}

fn compile_statement(
    state: &mut CompilerState,
    line: &[Token],
    out: &mut String,
) -> Result<(), CompileError> {
    let first = &line[0];
    let args = &line[1..];
    match first.kind {
        LexKind::Variable => compile_assignment(state, line, false, out),
        LexKind::Word => match Keyword::from_word(&first.text) {
            Some(Keyword::Global) => compile_global(state, first, args, out),
            Some(Keyword::Unsafe) => {
                if args.is_empty() {
                    return Err(CompileError::parse("expected a statement after 'unsafe'", first));
                }
                state.unchecked = true;
                let result = compile_statement(state, args, out);
                state.unchecked = false;
                result
            }
            Some(Keyword::If) => compile_if(state, first, args, out),
            Some(Keyword::Elif) => compile_elif(state, first, args, out),
            Some(Keyword::Else) => compile_else(state, first, args, out),
            Some(Keyword::Unless) => compile_unless(state, first, args, out),
            Some(Keyword::While) => compile_loop(state, first, args, false, out),
            Some(Keyword::Until) => compile_loop(state, first, args, true, out),
            Some(Keyword::Break) => compile_break(state, first, args, false, out),
            Some(Keyword::Continue) => compile_break(state, first, args, true, out),
            Some(Keyword::Def) => compile_def(state, first, args, out),
            Some(Keyword::Return) => compile_return(state, first, args, out),
            Some(Keyword::Ok) => compile_ok(state, first, args, out),
            Some(Keyword::Import) => compile_import(state, first, args, out),
            None => expression::compile_expression(state, line, true, out),
        },
        _ => Err(CompileError::parse(
            format!("a statement cannot start with '{}'", first.text),
            first,
        )),
    }
}

/// `$x: expr;` or `$t[k]...[k]: expr;`. With accesses, every segment but the
/// last navigates with `PGET`; the last one feeds `PSET`.
fn compile_assignment(
    state: &mut CompilerState,
    line: &[Token],
    global: bool,
    out: &mut String,
) -> Result<(), CompileError> {
    let var = &line[0];
    let mut depth: i32 = 0;
    let mut colon: Option<usize> = None;
    for (i, token) in line.iter().enumerate() {
        match token.kind {
            LexKind::AccessOpen | LexKind::ParOpen => depth += 1,
            LexKind::AccessClose | LexKind::ParClose => depth -= 1,
            LexKind::Decoration if token.text == ":" && depth == 0 => {
                colon = Some(i);
                break;
            }
            _ => {}
        }
    }
    let Some(colon) = colon else {
        return Err(CompileError::parse("expected ':' in assignment", var));
    };
    let left = &line[..colon];
    let right = &line[colon + 1..];
    if right.is_empty() {
        return Err(CompileError::parse("empty right side of assignment", var));
    }

    if left.len() == 1 {
        expression::compile_expression(state, right, false, out)?;
        let name = var.var_name();
        if global {
            emit(out, format!("GSET \"{}\"", lexer::escape_nambly(name)));
            state.declare_global_variable(name);
        } else {
            emit(out, format!("VSET \"{}\"", lexer::escape_nambly(name)));
            state.declare_variable(name);
        }
        return Ok(());
    }

    if global {
        return Err(CompileError::parse(
            "'global' assignments cannot have table accesses",
            var,
        ));
    }
    // Writing through an access reads the variable first.
    state.check_variable(var)?;
    emit(out, format!("VGET \"{}\"", lexer::escape_nambly(var.var_name())));
    let segments = split_access_segments(&left[1..], var)?;
    let (last, navigation) = segments.split_last().expect("split_access_segments is nonempty");
    for segment in navigation {
        expression::compile_expression(state, segment, false, out)?;
        emit(out, "PGET");
    }
    expression::compile_expression(state, last, false, out)?;
    expression::compile_expression(state, right, false, out)?;
    emit(out, "PSET");
    Ok(())
}

/// Splits `[a]["b"][c]` into its bracketed interiors.
fn split_access_segments<'a>(
    tokens: &'a [Token],
    at: &Token,
) -> Result<Vec<&'a [Token]>, CompileError> {
    let mut segments = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        if tokens[i].kind != LexKind::AccessOpen {
            return Err(CompileError::parse("malformed table access", &tokens[i]));
        }
        let close = find_matching_access(tokens, i)
            .ok_or_else(|| CompileError::parse("missing ']'", &tokens[i]))?;
        let interior = &tokens[i + 1..close];
        if interior.is_empty() {
            return Err(CompileError::parse("empty table access", &tokens[i]));
        }
        segments.push(interior);
        i = close + 1;
    }
    if segments.is_empty() {
        return Err(CompileError::parse("malformed table access", at));
    }
    Ok(segments)
}

/// Index of the `]` matching the `[` at `open`, counting nesting.
pub(crate) fn find_matching_access(tokens: &[Token], open: usize) -> Option<usize> {
    let mut depth = 0;
    for (i, token) in tokens.iter().enumerate().skip(open) {
        match token.kind {
            LexKind::AccessOpen => depth += 1,
            LexKind::AccessClose => {
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

fn compile_global(
    state: &mut CompilerState,
    keyword: &Token,
    args: &[Token],
    out: &mut String,
) -> Result<(), CompileError> {
    match args.first() {
        Some(token) if token.kind == LexKind::Variable => {
            compile_assignment(state, args, true, out)
        }
        _ => Err(CompileError::parse("expected a variable after 'global'", keyword)),
    }
}

fn require_condition<'a>(
    keyword: &Token,
    args: &'a [Token],
) -> Result<&'a [Token], CompileError> {
    if args.is_empty() {
        Err(CompileError::parse(
            format!("expected a condition after '{}'", keyword.text),
            keyword,
        ))
    } else {
        Ok(args)
    }
}

fn compile_if(
    state: &mut CompilerState,
    keyword: &Token,
    args: &[Token],
    out: &mut String,
) -> Result<(), CompileError> {
    let condition = require_condition(keyword, args)?;
    let n = state.fresh_block();
    let end = format!("IF_{n}_END");
    let exit = format!("IF_{n}_EXIT");
    emit(out, format!("@IF_{n}_START"));
    expression::compile_expression(state, condition, false, out)?;
    emit(out, format!("JPIF {end}"));
    state.pending.push(PendingBlock {
        kind: BlockKind::If,
        opener: keyword.clone(),
        close_code: format!("\n@{end}\n@{exit}"),
        chain: Some((end, exit)),
    });
    Ok(())
}

/// `elif`/`else` replace the open if/elif segment on top of the pending
/// stack, keeping the push-one/pop-one invariant per chain.
fn pop_chain_segment(
    state: &mut CompilerState,
    keyword: &Token,
) -> Result<(String, String), CompileError> {
    match state.pending.last() {
        Some(block) if block.kind.is_chain_segment() => {
            let block = state.pending.pop().expect("pending top was just inspected");
            Ok(block.chain.expect("if/elif segments always carry chain labels"))
        }
        _ => Err(CompileError::parse(
            format!("'{}' without a matching 'if'", keyword.text),
            keyword,
        )),
    }
}

fn compile_elif(
    state: &mut CompilerState,
    keyword: &Token,
    args: &[Token],
    out: &mut String,
) -> Result<(), CompileError> {
    let condition = require_condition(keyword, args)?;
    let (prev_end, exit) = pop_chain_segment(state, keyword)?;
    // The previous segment's body falls through here when taken.
    emit(out, format!("JUMP {exit}"));
    emit(out, format!("@{prev_end}"));
    let n = state.fresh_block();
    let end = format!("IF_{n}_END");
    emit(out, format!("@IF_{n}_START"));
    expression::compile_expression(state, condition, false, out)?;
    emit(out, format!("JPIF {end}"));
    state.pending.push(PendingBlock {
        kind: BlockKind::Elif,
        opener: keyword.clone(),
        close_code: format!("\n@{end}\n@{exit}"),
        chain: Some((end, exit)),
    });
    Ok(())
}

fn compile_else(
    state: &mut CompilerState,
    keyword: &Token,
    args: &[Token],
    out: &mut String,
) -> Result<(), CompileError> {
    if !args.is_empty() {
        return Err(CompileError::parse("unexpected arguments for 'else'", keyword));
    }
    let (prev_end, exit) = pop_chain_segment(state, keyword)?;
    emit(out, format!("JUMP {exit}"));
    emit(out, format!("@{prev_end}"));
    state.pending.push(PendingBlock {
        kind: BlockKind::Else,
        opener: keyword.clone(),
        close_code: format!("\n@{exit}"),
        chain: None,
    });
    Ok(())
}

fn compile_unless(
    state: &mut CompilerState,
    keyword: &Token,
    args: &[Token],
    out: &mut String,
) -> Result<(), CompileError> {
    let condition = require_condition(keyword, args)?;
    let n = state.fresh_block();
    let end = format!("IF_{n}_END");
    emit(out, format!("@IF_{n}_START"));
    expression::compile_expression(state, condition, false, out)?;
    emit(out, "LNOT");
    emit(out, format!("JPIF {end}"));
    state.pending.push(PendingBlock {
        kind: BlockKind::Unless,
        opener: keyword.clone(),
        close_code: format!("\n@{end}"),
        chain: None,
    });
    Ok(())
}

fn compile_loop(
    state: &mut CompilerState,
    keyword: &Token,
    args: &[Token],
    inverted: bool,
    out: &mut String,
) -> Result<(), CompileError> {
    let condition = require_condition(keyword, args)?;
    let n = state.fresh_block();
    let start = format!("LOOP_{n}_START");
    let end = format!("LOOP_{n}_END");
    emit(out, format!("@{start}"));
    expression::compile_expression(state, condition, false, out)?;
    if inverted {
        emit(out, "LNOT");
    }
    emit(out, format!("JPIF {end}"));
    state.pending.push(PendingBlock {
        kind: if inverted { BlockKind::Until } else { BlockKind::While },
        opener: keyword.clone(),
        close_code: format!("\nJUMP {start}\n@{end}"),
        chain: None,
    });
    state.loops.push(LoopLabels { start, end });
    Ok(())
}

/// `break [n]` / `continue [n]`: jump to the end/start label of the n-th
/// enclosing loop.
fn compile_break(
    state: &mut CompilerState,
    keyword: &Token,
    args: &[Token],
    is_continue: bool,
    out: &mut String,
) -> Result<(), CompileError> {
    let depth = match args {
        [] => 1usize,
        [token] if token.kind == LexKind::Integer => {
            token.text.parse().map_err(|_| {
                CompileError::parse(format!("invalid loop depth '{}'", token.text), token)
            })?
        }
        [token, ..] => {
            return Err(CompileError::parse(
                format!("expected an integer loop depth, found '{}'", token.text),
                token,
            ));
        }
    };
    if depth == 0 {
        return Err(CompileError::parse("loop depth must be at least 1", keyword));
    }
    if depth > state.loops.len() {
        return Err(CompileError::parse(
            format!(
                "'{}' outside a loop (depth {depth}, open loops {})",
                keyword.text,
                state.loops.len()
            ),
            keyword,
        ));
    }
    let target = &state.loops[state.loops.len() - depth];
    if is_continue {
        emit(out, format!("JUMP {}", target.start));
    } else {
        emit(out, format!("JUMP {}", target.end));
    }
    Ok(())
}

///// `def name;`: jump over the body, entry label, fresh scope, and the packed
/// argument table bound to `$_`.
fn compile_def(
    state: &mut CompilerState,
    keyword: &Token,
    args: &[Token],
    out: &mut String,
) -> Result<(), CompileError> {
    let name = match args {
        [token] if token.kind == LexKind::Word => token,
        _ => {
            return Err(CompileError::parse("expected a function name after 'def'", keyword));
        }
    };
    if Keyword::from_word(&name.text).is_some()
        || expression::Builtin::from_name(&name.text).is_some()
    {
        return Err(CompileError::parse(
            format!("'{}' is a reserved name", name.text),
            name,
        ));
    }
    let info = state
        .functions
        .entry(name.text.clone())
        .or_insert_with(|| FunctionInfo { defined: false, first_call: None });
    if info.defined {
        return Err(CompileError::parse(
            format!("duplicate definition of function '{}'", name.text),
            name,
        ));
    }
    info.defined = true;
    let entry = function_entry_label(&name.text);
    let skip = function_skip_label(&name.text);
    emit(out, format!("JUMP {skip}"));
    emit(out, format!("@{entry}"));
    emit(out, "ADSC");
    emit(out, "VSET \"_\"");
    let mut scope = HashSet::new();
    scope.insert("_".to_string());
    state.scopes.push(scope);
    state.pending.push(PendingBlock {
        kind: BlockKind::Def,
        opener: keyword.clone(),
        close_code: format!("\nPNIL\nDLSC\nRTRN\n@{skip}"),
        chain: None,
    });
    Ok(())
}

fn compile_return(
    state: &mut CompilerState,
    keyword: &Token,
    args: &[Token],
    out: &mut String,
) -> Result<(), CompileError> {
    let in_function = state.pending.iter().any(|b| b.kind == BlockKind::Def);
    if !in_function {
        return Err(CompileError::parse("'return' outside a function body", keyword));
    }
    if args.is_empty() {
        emit(out, "PNIL");
    } else {
        expression::compile_expression(state, args, false, out)?;
    }
    emit(out, "DLSC");
    emit(out, "RTRN");
    Ok(())
}

fn compile_ok(
    state: &mut CompilerState,
    keyword: &Token,
    args: &[Token],
    out: &mut String,
) -> Result<(), CompileError> {
    if !args.is_empty() {
        return Err(CompileError::parse("unexpected arguments for 'ok'", keyword));
    }
    let Some(block) = state.pending.pop() else {
        return Err(CompileError::parse("'ok' without an open block", keyword));
    };
    match block.kind {
        BlockKind::While | BlockKind::Until => {
            state.loops.pop();
        }
        BlockKind::Def => {
            state.scopes.pop();
        }
        _ => {}
    }
    out.push_str(&block.close_code);
    Ok(())
}

/// `import "path";` inline-compiles another source file with the shared
/// state. A file already imported in this run is skipped.
fn compile_import(
    state: &mut CompilerState,
    keyword: &Token,
    args: &[Token],
    out: &mut String,
) -> Result<(), CompileError> {
    let path_token = match args {
        [token] if token.kind == LexKind::StringLit => token,
        _ => {
            return Err(CompileError::parse("expected a file path after 'import'", keyword));
        }
    };
    let base = Path::new(&keyword.file)
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let path = base.join(&path_token.text);
    let canonical = path.canonicalize().unwrap_or_else(|_| path.clone());
    if !state.imported.insert(canonical) {
        return Ok(());
    }
    let source = std::fs::read_to_string(&path).map_err(|source| CompileError::Import {
        path: path.display().to_string(),
        file: keyword.file.clone(),
        line: keyword.line,
        source,
    })?;
    compile_chunk(state, &source, &path.display().to_string(), out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(src: &str) -> String {
        compile_source(src, "test.kat").unwrap()
    }

    fn compile_err(src: &str) -> CompileError {
        compile_source(src, "test.kat").unwrap_err()
    }

    fn ops(listing: &str) -> Vec<String> {
        listing
            .lines()
            .filter(|l| !l.starts_with('@'))
            .map(|l| l.split_whitespace().next().unwrap_or("").to_string())
            .collect()
    }

    #[test]
    fn simple_assignment_emits_push_and_vset() {
        let code = compile("$x: 5;");
        assert_eq!(code, "PUSH 5\nVSET \"x\"\n");
    }

    #[test]
    fn global_assignment_uses_gset() {
        let code = compile("global $x: 5;");
        assert!(code.contains("GSET \"x\""));
    }

    #[test]
    fn table_access_assignment_sets_through_pset() {
        let code = compile("$t: table;\n$t[\"a\"]: 1;");
        assert_eq!(
            code,
            "TABL\nVSET \"t\"\nVGET \"t\"\nPUSH \"a\"\nPUSH 1\nPSET\n"
        );
    }

    #[test]
    fn chained_accesses_navigate_with_pget() {
        let code = compile("$t: table;\n$t[\"a\"][\"b\"]: 1;");
        assert_eq!(
            ops(&code),
            ["TABL", "VSET", "VGET", "PUSH", "PGET", "PUSH", "PUSH", "PSET"]
        );
    }

    #[test]
    fn reading_an_undeclared_variable_is_a_parse_error() {
        let err = compile_err("$x: $y;");
        let message = err.to_string();
        assert!(message.contains("$y"), "{message}");
        assert!(message.contains("line 1"), "{message}");
    }

    #[test]
    fn unsafe_disables_the_declaration_check() {
        let code = compile("unsafe $x: $y;");
        assert!(code.contains("VGET \"y\""));
        // The flag does not leak into the next statement.
        assert!(matches!(
            compile_err("unsafe $x: $y;\n$a: $b;"),
            CompileError::Parse { .. }
        ));
    }

    #[test]
    fn while_ok_emits_loop_labels_and_backward_jump() {
        let code = compile("$i: 0;\nwhile $i < 3;\n$i: $i + 1;\nok;");
        assert!(code.contains("@LOOP_0_START"));
        assert!(code.contains("JPIF LOOP_0_END"));
        assert!(code.contains("JUMP LOOP_0_START"));
        assert!(code.contains("@LOOP_0_END"));
    }

    #[test]
    fn until_inverts_the_condition() {
        let code = compile("$i: 0;\nuntil $i = 3;\n$i: $i + 1;\nok;");
        assert!(code.contains("ISEQ\nLNOT\nJPIF"));
    }

    #[test]
    fn if_chain_shares_one_exit_label() {
        let code = compile("$x: 1;\nif $x = 1;\nelif $x = 2;\nelse;\nok;");
        let exits: Vec<&str> = code.lines().filter(|l| l.contains("IF_0_EXIT")).collect();
        // Two taken-branch jumps plus one final label definition.
        assert_eq!(exits, ["JUMP IF_0_EXIT", "JUMP IF_0_EXIT", "@IF_0_EXIT"]);
    }

    #[test]
    fn elif_without_if_is_an_error() {
        assert!(matches!(
            compile_err("elif 1;"),
            CompileError::Parse { .. }
        ));
        assert!(matches!(
            compile_err("unless 1;\nelse;\nok;"),
            CompileError::Parse { .. }
        ));
    }

    #[test]
    fn missing_ok_is_reported_at_the_opener() {
        let err = compile_err("$x: 1;\nwhile $x;\n");
        let message = err.to_string();
        assert!(message.contains("while"), "{message}");
        assert!(message.contains("line 2"), "{message}");
    }

    #[test]
    fn stray_ok_is_an_error() {
        assert!(matches!(compile_err("ok;"), CompileError::Parse { .. }));
    }

    #[test]
    fn break_and_continue_check_loop_depth() {
        let code = compile("while 1;\nwhile 1;\nbreak 2;\ncontinue;\nok;\nok;");
        assert!(code.contains("JUMP LOOP_0_END"));
        assert!(code.contains("JUMP LOOP_1_START"));
        assert!(matches!(compile_err("break;"), CompileError::Parse { .. }));
        assert!(matches!(
            compile_err("while 1;\nbreak 2;\nok;"),
            CompileError::Parse { .. }
        ));
    }

    #[test]
    fn def_wraps_the_body_and_binds_packed_arguments() {
        let code = compile("def twice;\nreturn $_[1] * 2;\nok;");
        assert!(code.starts_with("JUMP FN_twice_SKIP\n@FN_twice_START\nADSC\nVSET \"_\"\n"));
        assert!(code.contains("DLSC\nRTRN"));
        assert!(code.ends_with("PNIL\nDLSC\nRTRN\n@FN_twice_SKIP\n"));
    }

    #[test]
    fn function_scope_isolates_declarations() {
        // $local is gone after the function body closes.
        let err = compile_err("def f;\n$local: 1;\nok;\n$x: $local;");
        assert!(err.to_string().contains("$local"));
        // Globals stay visible inside a function body.
        let code = compile("$g: 1;\ndef f;\nreturn $g;\nok;");
        assert!(code.contains("VGET \"g\""));
    }

    #[test]
    fn return_outside_a_function_is_an_error() {
        assert!(matches!(compile_err("return 1;"), CompileError::Parse { .. }));
    }

    #[test]
    fn duplicate_function_definition_is_an_error() {
        let err = compile_err("def f;\nok;\ndef f;\nok;");
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn forward_reference_resolves_but_missing_function_fails() {
        let code = compile("$x: later(1);\ndef later;\nreturn 1;\nok;");
        assert!(code.contains("CALL FN_later_START"));
        let err = compile_err("$x: never(1);");
        assert!(err.to_string().contains("never"));
    }

    #[test]
    fn recompiling_fresh_state_produces_identical_output() {
        let src = "$i: 0;\nwhile $i < 2;\n$i: $i + 1;\nok;";
        assert_eq!(compile(src), compile(src));
    }
}
