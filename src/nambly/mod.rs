//! The Nambly intermediate representation.
//!
//! Nambly is a line-oriented text format: one instruction per line, `@name`
//! label lines, and `;` comment lines. The compiler emits it as text and the
//! VM parses it back into a [`Listing`] before execution, so the format is
//! the only contract between the two halves.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Every instruction the VM understands. The set is closed: an unknown
/// mnemonic is a load error, never a dynamic dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Push,
    Pnil,
    Addv,
    Subt,
    Mult,
    Fdiv,
    Idiv,
    Powr,
    Modl,
    Isgt,
    Islt,
    Isge,
    Isle,
    Iseq,
    Isne,
    Vset,
    Gset,
    Vget,
    Unst,
    Join,
    Sstr,
    Jump,
    Call,
    Rtrn,
    Jpif,
    Tabl,
    Pset,
    Pget,
    Pust,
    Pist,
    Arrr,
    Dupl,
    Nilq,
    Disp,
    Accp,
    Popv,
    Exit,
    Rfil,
    Forw,
    Fora,
    Fcls,
    Rlne,
    Fwrt,
    Lnot,
    Trim,
    Slen,
    Swap,
    Land,
    Lgor,
    Isin,
    Flor,
    Adsc,
    Dlsc,
    Exec,
    Wait,
    Keys,
    Gitr,
    Next,
}

impl Opcode {
    pub fn mnemonic(self) -> &'static str {
        use Opcode::*;
        match self {
            Push => "PUSH",
            Pnil => "PNIL",
            Addv => "ADDV",
            Subt => "SUBT",
            Mult => "MULT",
            Fdiv => "FDIV",
            Idiv => "IDIV",
            Powr => "POWR",
            Modl => "MODL",
            Isgt => "ISGT",
            Islt => "ISLT",
            Isge => "ISGE",
            Isle => "ISLE",
            Iseq => "ISEQ",
            Isne => "ISNE",
            Vset => "VSET",
            Gset => "GSET",
            Vget => "VGET",
            Unst => "UNST",
            Join => "JOIN",
            Sstr => "SSTR",
            Jump => "JUMP",
            Call => "CALL",
            Rtrn => "RTRN",
            Jpif => "JPIF",
            Tabl => "TABL",
            Pset => "PSET",
            Pget => "PGET",
            Pust => "PUST",
            Pist => "PIST",
            Arrr => "ARRR",
            Dupl => "DUPL",
            Nilq => "NIL?",
            Disp => "DISP",
            Accp => "ACCP",
            Popv => "POPV",
            Exit => "EXIT",
            Rfil => "RFIL",
            Forw => "FORW",
            Fora => "FORA",
            Fcls => "FCLS",
            Rlne => "RLNE",
            Fwrt => "FWRT",
            Lnot => "LNOT",
            Trim => "TRIM",
            Slen => "SLEN",
            Swap => "SWAP",
            Land => "LAND",
            Lgor => "LGOR",
            Isin => "ISIN",
            Flor => "FLOR",
            Adsc => "ADSC",
            Dlsc => "DLSC",
            Exec => "EXEC",
            Wait => "WAIT",
            Keys => "KEYS",
            Gitr => "GITR",
            Next => "NEXT",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

impl FromStr for Opcode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        use Opcode::*;
        // Mnemonics are case-insensitive; labels are not.
        Ok(match s.to_ascii_uppercase().as_str() {
            "PUSH" => Push,
            "PNIL" => Pnil,
            "ADDV" => Addv,
            "SUBT" => Subt,
            "MULT" => Mult,
            "FDIV" => Fdiv,
            "IDIV" => Idiv,
            "POWR" => Powr,
            "MODL" => Modl,
            "ISGT" => Isgt,
            "ISLT" => Islt,
            "ISGE" => Isge,
            "ISLE" => Isle,
            "ISEQ" => Iseq,
            "ISNE" => Isne,
            "VSET" => Vset,
            "GSET" => Gset,
            "VGET" => Vget,
            "UNST" => Unst,
            "JOIN" => Join,
            "SSTR" => Sstr,
            "JUMP" => Jump,
            "CALL" => Call,
            "RTRN" => Rtrn,
            "JPIF" => Jpif,
            "TABL" => Tabl,
            "PSET" => Pset,
            "PGET" => Pget,
            "PUST" => Pust,
            "PIST" => Pist,
            "ARRR" => Arrr,
            "DUPL" => Dupl,
            "NIL?" => Nilq,
            "DISP" => Disp,
            "ACCP" => Accp,
            "POPV" => Popv,
            "EXIT" => Exit,
            "RFIL" => Rfil,
            "FORW" => Forw,
            "FORA" => Fora,
            "FCLS" => Fcls,
            "RLNE" => Rlne,
            "FWRT" => Fwrt,
            "LNOT" => Lnot,
            "TRIM" => Trim,
            "SLEN" => Slen,
            "SWAP" => Swap,
            "LAND" => Land,
            "LGOR" => Lgor,
            "ISIN" => Isin,
            "FLOR" => Flor,
            "ADSC" => Adsc,
            "DLSC" => Dlsc,
            "EXEC" => Exec,
            "WAIT" => Wait,
            "KEYS" => Keys,
            "GITR" => Gitr,
            "NEXT" => Next,
            _ => return Err(()),
        })
    }
}

/// An instruction operand as written in the listing.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Int(i64),
    Float(f64),
    Text(String),
    /// A bare word, used for jump and call targets.
    Symbol(String),
}

#[derive(Debug, Clone)]
pub struct Instruction {
    pub op: Opcode,
    pub args: Vec<Operand>,
    /// Source line in the listing, for error reporting.
    pub line: u32,
}

/// A parsed program: the flat instruction stream plus the label table.
#[derive(Debug, Default)]
pub struct Listing {
    pub code: Vec<Instruction>,
    pub labels: HashMap<String, usize>,
}

#[derive(Debug, thiserror::Error)]
pub enum NamblyError {
    #[error("Nambly error on line {line}: unknown instruction '{name}'")]
    UnknownOpcode { name: String, line: u32 },
    #[error("Nambly error on line {line}: unterminated string operand")]
    UnterminatedString { line: u32 },
    #[error("Nambly error on line {line}: duplicate label '@{name}'")]
    DuplicateLabel { name: String, line: u32 },
}

/// Parses a Nambly listing. Labels index the instruction that follows them;
/// a label at the very end points one past the last instruction, which the
/// VM treats as normal termination.
pub fn parse(source: &str) -> Result<Listing, NamblyError> {
    let mut listing = Listing::default();
    for (idx, raw) in source.lines().enumerate() {
        let line_num = idx as u32 + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('@') {
            let name = name.trim();
            if listing.labels.insert(name.to_string(), listing.code.len()).is_some() {
                return Err(NamblyError::DuplicateLabel { name: name.to_string(), line: line_num });
            }
            continue;
        }
        let (mnemonic, rest) = match line.split_once(char::is_whitespace) {
            Some((m, r)) => (m, r),
            None => (line, ""),
        };
        let op = Opcode::from_str(mnemonic).map_err(|()| NamblyError::UnknownOpcode {
            name: mnemonic.to_string(),
            line: line_num,
        })?;
        let args = parse_operands(rest, line_num)?;
        listing.code.push(Instruction { op, args, line: line_num });
    }
    Ok(listing)
}

fn parse_operands(rest: &str, line: u32) -> Result<Vec<Operand>, NamblyError> {
    let chars: Vec<char> = rest.chars().collect();
    let mut args = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i].is_whitespace() {
            i += 1;
            continue;
        }
        if chars[i] == '"' {
            let mut text = String::new();
            i += 1;
            let mut closed = false;
            while i < chars.len() {
                match chars[i] {
                    '\\' if i + 1 < chars.len() => {
                        text.push(match chars[i + 1] {
                            'n' => '\n',
                            't' => '\t',
                            other => other,
                        });
                        i += 2;
                    }
                    '"' => {
                        closed = true;
                        i += 1;
                        break;
                    }
                    c => {
                        text.push(c);
                        i += 1;
                    }
                }
            }
            if !closed {
                return Err(NamblyError::UnterminatedString { line });
            }
            args.push(Operand::Text(text));
        } else {
            let start = i;
            while i < chars.len() && !chars[i].is_whitespace() {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            if let Ok(n) = word.parse::<i64>() {
                args.push(Operand::Int(n));
            } else if let Ok(f) = word.parse::<f64>() {
                args.push(Operand::Float(f));
            } else {
                args.push(Operand::Symbol(word));
            }
        }
    }
    Ok(args)
}
