use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use serde::Deserialize;

use girder_bc::{
    AbsoluteEmitter, BcError, Bytecode, Data, EmitHandler, EmitSite, Object, Resolution,
    SectionOutput, SpecialContents, emit_object, resolve_object,
};
use girder_expr::{
    Expr, ExprOp, ExprTerm, LabelResolver, SectionId, SourceLoc, SymbolBinding, SymbolId,
    SymbolTable,
};
use girder_num::IntNum;

#[derive(Debug, Parser)]
#[command(
    name = "girder",
    version,
    about = "Section layout and symbol resolution engine",
    long_about = None,
    override_usage = "girder [COMMAND] [INPUT]",
    after_help = "Examples:\n  girder path/to/program.ron\n  girder resolve path/to/program.ron -o out\n  girder --help"
)]
struct Cli {
    /// Optional explicit subcommand.
    #[command(subcommand)]
    command: Option<Commands>,

    /// Input program description.
    #[arg(value_name = "INPUT")]
    input: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Resolve a program description and print the section listing.
    Resolve(ResolveArgs),
}

#[derive(Debug, Parser)]
struct ResolveArgs {
    /// Input program description (.ron).
    #[arg(value_name = "INPUT")]
    input: PathBuf,
    /// Output base path; each section is written to BASE.SECTION.bin.
    #[arg(short = 'o', long = "output", value_name = "OUT_BASE")]
    output: Option<PathBuf>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Resolve(args)) => resolve_command(args),
        None => {
            let Some(input) = cli.input else {
                let mut command = Cli::command();
                command.print_help()?;
                println!();
                return Ok(());
            };
            resolve_command(ResolveArgs {
                input,
                output: None,
            })
        }
    }
}

/// A program description: sections of items, expressions as structured
/// trees.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProgramSpec {
    sections: Vec<SectionSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SectionSpec {
    name: String,
    #[serde(default)]
    origin: Option<i64>,
    items: Vec<ItemSpec>,
}

#[derive(Debug, Deserialize)]
enum ItemSpec {
    /// Bind a label at the current position.
    Label(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// A little-endian integer field of `size` bytes.
    Int { expr: ExprSpec, size: u32 },
    /// Uninitialized space: count x itemsize bytes.
    Reserve { count: ExprSpec, itemsize: u64 },
    /// Pad to a byte boundary.
    Align {
        boundary: u64,
        #[serde(default)]
        fill: Option<u8>,
    },
    /// A constant definition, expanded wherever the name is referenced.
    Equ { name: String, expr: ExprSpec },
    /// A short/near branch to a label (2 bytes backward in reach, else 3).
    Branch { target: String },
}

#[derive(Debug, Deserialize)]
enum ExprSpec {
    Int(i64),
    Sym(String),
    Add(Vec<ExprSpec>),
    Sub(Box<ExprSpec>, Box<ExprSpec>),
    Mul(Vec<ExprSpec>),
    Div(Box<ExprSpec>, Box<ExprSpec>),
    Neg(Box<ExprSpec>),
    And(Vec<ExprSpec>),
    Or(Vec<ExprSpec>),
    Xor(Vec<ExprSpec>),
    Shl(Box<ExprSpec>, Box<ExprSpec>),
    Shr(Box<ExprSpec>, Box<ExprSpec>),
}

fn load_program(path: &Path) -> Result<ProgramSpec> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read program '{}'", path.display()))?;
    ron::from_str(&text)
        .with_context(|| format!("failed to parse program '{}'", path.display()))
}

fn resolve_command(args: ResolveArgs) -> Result<()> {
    let spec = load_program(&args.input)?;
    let mut object = build_object(&spec, &args.input)?;

    object.finalize().context("failed to finalize bytecodes")?;
    let positions = resolve_object(&mut object).context("failed to resolve section layout")?;
    let outputs = emit_object(&mut object, &positions, &mut AbsoluteEmitter)
        .context("failed to emit sections")?;

    print_listing(&object, &outputs);

    if let Some(base) = &args.output {
        write_outputs(base, &outputs)?;
    }
    Ok(())
}

fn build_object(spec: &ProgramSpec, input: &Path) -> Result<Object> {
    let file = input.display().to_string();
    let mut object = Object::new();
    for section_spec in &spec.sections {
        let origin = section_spec.origin.map(IntNum::from);
        let id = object.add_section(&section_spec.name, origin);
        for (ordinal, item) in section_spec.items.iter().enumerate() {
            let loc = SourceLoc::new(file.as_str(), (ordinal + 1) as u32);
            add_item(&mut object, id, item, loc).with_context(|| {
                format!("in section '{}', item {}", section_spec.name, ordinal + 1)
            })?;
        }
    }
    Ok(object)
}

fn add_item(object: &mut Object, id: SectionId, item: &ItemSpec, loc: SourceLoc) -> Result<()> {
    match item {
        ItemSpec::Label(name) => {
            object.define_label(id, name, loc)?;
        }
        ItemSpec::Bytes(bytes) => {
            let mut data = Data::new();
            data.push_raw(bytes.clone());
            object.add_bytecode(id, Bytecode::data(data, loc));
        }
        ItemSpec::Int { expr, size } => {
            let expr = build_expr(expr, &mut object.symbols, &loc);
            let mut data = Data::new();
            data.push_expr(expr, *size);
            object.add_bytecode(id, Bytecode::data(data, loc));
        }
        ItemSpec::Reserve { count, itemsize } => {
            let count = build_expr(count, &mut object.symbols, &loc);
            object.add_bytecode(id, Bytecode::reserve(count, *itemsize, loc));
        }
        ItemSpec::Align { boundary, fill } => {
            object.add_bytecode(id, Bytecode::align(*boundary, *fill, loc));
        }
        ItemSpec::Equ { name, expr } => {
            let def = build_expr(expr, &mut object.symbols, &loc);
            let sym = object.symbols.intern(name);
            object.symbols.define_equ(sym, def, loc)?;
        }
        ItemSpec::Branch { target } => {
            let target = object.symbols.intern(target);
            let index = object.section(id).bytecodes().len() as u32;
            object.add_bytecode(
                id,
                Bytecode::special(
                    Box::new(Branch {
                        target,
                        section: id,
                        index,
                        short: false,
                    }),
                    loc,
                ),
            );
        }
    }
    Ok(())
}

fn build_expr(spec: &ExprSpec, symbols: &mut SymbolTable, loc: &SourceLoc) -> Expr {
    let loc = loc.clone();
    match spec {
        ExprSpec::Int(value) => Expr::int(*value, loc),
        ExprSpec::Sym(name) => Expr::sym(symbols.intern(name), loc),
        ExprSpec::Add(terms) => nary(ExprOp::Add, terms, symbols, loc),
        ExprSpec::Mul(terms) => nary(ExprOp::Mul, terms, symbols, loc),
        ExprSpec::And(terms) => nary(ExprOp::BitAnd, terms, symbols, loc),
        ExprSpec::Or(terms) => nary(ExprOp::BitOr, terms, symbols, loc),
        ExprSpec::Xor(terms) => nary(ExprOp::BitXor, terms, symbols, loc),
        ExprSpec::Sub(lhs, rhs) => binary(ExprOp::Sub, lhs, rhs, symbols, loc),
        ExprSpec::Div(lhs, rhs) => binary(ExprOp::Div, lhs, rhs, symbols, loc),
        ExprSpec::Shl(lhs, rhs) => binary(ExprOp::Shl, lhs, rhs, symbols, loc),
        ExprSpec::Shr(lhs, rhs) => binary(ExprOp::Shr, lhs, rhs, symbols, loc),
        ExprSpec::Neg(operand) => {
            let operand = build_expr(operand, symbols, &loc);
            Expr::unary(ExprOp::Neg, operand, loc)
        }
    }
}

fn nary(op: ExprOp, terms: &[ExprSpec], symbols: &mut SymbolTable, loc: SourceLoc) -> Expr {
    let terms: Vec<ExprTerm> = terms
        .iter()
        .map(|term| build_expr(term, symbols, &loc).into_term())
        .collect();
    Expr::new(op, terms, loc)
}

fn binary(
    op: ExprOp,
    lhs: &ExprSpec,
    rhs: &ExprSpec,
    symbols: &mut SymbolTable,
    loc: SourceLoc,
) -> Expr {
    let lhs = build_expr(lhs, symbols, &loc);
    let rhs = build_expr(rhs, symbols, &loc);
    Expr::binary(op, lhs, rhs, loc)
}

/// Demonstration relaxable instruction, implemented here to exercise the
/// extension trait from outside the bytecode crate. Two bytes (opcode,
/// i8 displacement) when the target is a backward label in the same section
/// within reach; three bytes (opcode, i16 displacement) otherwise. Forward
/// targets always take the long form, so probe and commit lengths agree.
#[derive(Debug)]
struct Branch {
    target: SymbolId,
    section: SectionId,
    index: u32,
    short: bool,
}

const OP_BRANCH_SHORT: u8 = 0x10;
const OP_BRANCH_NEAR: u8 = 0x20;

impl Branch {
    fn backward(&self, symtab: &SymbolTable) -> bool {
        match *symtab.binding(self.target) {
            SymbolBinding::Label { section, bc_index } => {
                section == self.section && bc_index <= self.index
            }
            _ => false,
        }
    }
}

impl SpecialContents for Branch {
    fn finalize(&mut self, symtab: &SymbolTable, loc: &SourceLoc) -> Result<(), BcError> {
        if matches!(symtab.binding(self.target), SymbolBinding::Equ(_)) {
            return Err(BcError::NotAbsolute { loc: loc.clone() });
        }
        Ok(())
    }

    fn resolve(
        &mut self,
        save: bool,
        offset: u64,
        symtab: &SymbolTable,
        resolver: &mut dyn LabelResolver,
    ) -> Result<(u64, Resolution), BcError> {
        let mut len = 3;
        if self.backward(symtab)
            && let Some((_, target)) = resolver.label_offset(self.target)?
        {
            let delta = target as i64 - (offset as i64 + 2);
            if (-128..=127).contains(&delta) {
                len = 2;
            }
        }
        if save {
            self.short = len == 2;
        }
        Ok((len, Resolution::Minimum))
    }

    fn emit(
        &mut self,
        buf: &mut Vec<u8>,
        site: &EmitSite,
        symtab: &SymbolTable,
        resolver: &mut dyn LabelResolver,
        _handler: &mut dyn EmitHandler,
    ) -> Result<(), BcError> {
        let Some((_, target)) = resolver.label_offset(self.target)? else {
            return Err(BcError::NotAbsolute {
                loc: symtab.loc(self.target).clone(),
            });
        };
        if self.short {
            let delta = target as i64 - (site.offset as i64 + 2);
            buf.push(OP_BRANCH_SHORT);
            buf.push(delta as i8 as u8);
        } else {
            let delta = target as i64 - (site.offset as i64 + 3);
            buf.push(OP_BRANCH_NEAR);
            buf.extend_from_slice(&(delta as i16).to_le_bytes());
        }
        Ok(())
    }

    fn print(&self, symtab: &SymbolTable) -> String {
        format!("branch {}", symtab.name(self.target))
    }
}

fn print_listing(object: &Object, outputs: &[SectionOutput]) {
    for ((_, section), output) in object.sections().zip(outputs) {
        match &output.origin {
            Some(origin) => println!(
                "section {} @ {origin} ({} bytes)",
                output.name,
                section.len_bytes()
            ),
            None => println!("section {} ({} bytes)", output.name, section.len_bytes()),
        }
        for bc in section.bytecodes() {
            let start = bc.offset() as usize;
            let end = start + bc.len() as usize;
            let bytes = hex_bytes(&output.bytes[start..end]);
            println!(
                "  {offset:04X}  {desc:<24} {bytes}",
                offset = bc.offset(),
                desc = bc.print(&object.symbols),
            );
        }
    }
    if !object.symbols.is_empty() {
        println!("symbols:");
        for (_, name, binding) in object.symbols.iter() {
            match binding {
                SymbolBinding::Label { section, bc_index } => {
                    println!("  {name} = {}+{bc_index}", object.section(*section).name);
                }
                SymbolBinding::Equ(def) => {
                    println!("  {name} = {}", def.display(&object.symbols));
                }
                SymbolBinding::Undefined => println!("  {name} = <undefined>"),
            }
        }
    }
}

fn hex_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (index, byte) in bytes.iter().enumerate() {
        if index > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{byte:02X}"));
    }
    out
}

fn write_outputs(base: &Path, outputs: &[SectionOutput]) -> Result<()> {
    let parent = base.parent().unwrap_or(Path::new("."));
    let stem = base
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("out");
    for output in outputs {
        let path = parent.join(format!("{stem}.{}.bin", output.name));
        std::fs::write(&path, &output.bytes)
            .with_context(|| format!("failed to write '{}'", path.display()))?;
    }
    Ok(())
}
