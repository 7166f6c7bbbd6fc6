// (C) 2020 Brandon Lewis
//
// A stack machine for the Rill intermediate representation.
//
// *Execution Model*
//
// A loaded module is a set of named functions, each a flat instruction
// sequence, plus a set of typed globals. Execution starts by entering
// `main` (the synthetic top-level function) without pushing a return
// frame; a RET with no frame active halts the machine.
//
// *The Stack*
//
// The operand stack holds tagged cells: 32-bit signed integers or
// 32-bit IEEE-754 floats. Every pop states the expected tag; a
// mismatch or an underflow is a fatal runtime error. There is no
// silent coercion anywhere in the machine.
//
// *Structured control flow*
//
// IF/ELSE/ENDIF and LOOP/CBREAK/CONTINUE/ENDLOOP are block markers,
// not jumps. Matching them by scanning at execution time costs O(n)
// per branch, so the loader performs one bracket-matching pass per
// function and records a per-PC jump table; branching is then O(1)
// and unbalanced markers are caught before the program runs.
//
// *Memory*
//
// Linear byte-addressable memory, little-endian for the 4-byte int
// and float accesses, single bytes for PEEKB/POKEB. GROW appends
// zeroed bytes and returns the pre-grow length, which is how freshly
// allocated blocks get their base address.
//
// *Validity*
//
// The set of runtime errors is the Error enum in this file. All are
// non-recoverable. A valid program is one which terminates with
// Error::Halt, which run() reports as success. A configurable
// instruction budget bounds non-terminating programs.

use crate::ir::{IrModule, IrType, Opcode};
use crate::util::fmt_float;
use enumflags2::BitFlags;
use std::collections::HashMap;
use std::io::Write;
use std::rc::Rc;


// The result of any operation.
pub type Result<T> = core::result::Result<T, Error>;


// Runtime type tags, as a bitflag so errors can speak about sets of
// acceptable types.
#[derive(BitFlags, Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum TypeTag {
    Int = 0b01,
    Float = 0b10,
}

pub type TypeSet = BitFlags<TypeTag>;


// A tagged operand-stack cell.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Value {
    Int(i32),
    Float(f32),
}

impl Value {
    pub fn get_type(&self) -> TypeTag {
        match self {
            Value::Int(_) => TypeTag::Int,
            Value::Float(_) => TypeTag::Float,
        }
    }

    pub fn zero(ty: IrType) -> Value {
        match ty {
            IrType::I => Value::Int(0),
            IrType::F => Value::Float(0.0),
        }
    }
}

fn tag_of(ty: IrType) -> TypeTag {
    match ty {
        IrType::I => TypeTag::Int,
        IrType::F => TypeTag::Float,
    }
}


// Like core::convert::Into, except that it returns a Result: the
// conversion is checked at run time against the cell's tag.
pub trait TryInto<T> {
    fn try_into(self) -> Result<T>;
}

// Construct an Error::TypeError from a value.
fn expected(expect: TypeSet, got: &Value) -> Error {
    Error::TypeError { expect, got: got.get_type() }
}

macro_rules! impl_try_into {
    ($variant:ident => $type:ty) => {
        impl TryInto<$type> for Value {
            fn try_into(self) -> Result<$type> {
                match self {
                    Value::$variant(value) => Ok(value),
                    v => Err(expected(BitFlags::from_flag(TypeTag::$variant), &v)),
                }
            }
        }
    };
}

impl_try_into! { Int => i32 }
impl_try_into! { Float => f32 }


#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    Underflow {
        function: String,
        pc: usize,
        instruction: String,
    },
    TypeError {
        expect: TypeSet,
        got: TypeTag,
    },
    UnknownFunction(String),
    UnknownLocal(String),
    UnknownGlobal(String),
    BadAddress(i32),
    DivideByZero,
    Unmatched {
        function: String,
        pc: usize,
    },
    BudgetExceeded(u64),
    Halt,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Underflow { function, pc, instruction } => write!(
                f,
                "stack underflow in '{}' at pc {} ({})",
                function, pc, instruction
            ),
            Error::TypeError { expect, got } => {
                write!(f, "stack type mismatch: expected {:?}, got {:?}", expect, got)
            }
            Error::UnknownFunction(name) => write!(f, "call to undefined function '{}'", name),
            Error::UnknownLocal(name) => write!(f, "undefined local '{}'", name),
            Error::UnknownGlobal(name) => write!(f, "undefined global '{}'", name),
            Error::BadAddress(addr) => write!(f, "memory access out of range at {}", addr),
            Error::DivideByZero => write!(f, "division by zero"),
            Error::Unmatched { function, pc } => {
                write!(f, "unmatched control flow in '{}' at pc {}", function, pc)
            }
            Error::BudgetExceeded(limit) => {
                write!(f, "instruction budget of {} exceeded", limit)
            }
            Error::Halt => write!(f, "halt"),
        }
    }
}


// The type of control flow an instruction can have.
enum ControlFlow {
    Advance,
    Branch(usize),
    Yield(Value),
}


// Sink for the PRINT* opcodes, the machine's only observable output.
pub trait Output {
    fn print_int(&mut self, v: i32);
    fn print_float(&mut self, v: f32);
    fn print_byte(&mut self, b: u8);
}

// The CLI wires the machine straight to stdout: ints and floats one
// per line, bytes as bare characters.
impl Output for std::io::Stdout {
    fn print_int(&mut self, v: i32) {
        let _ = writeln!(self, "{}", v);
    }

    fn print_float(&mut self, v: f32) {
        let _ = writeln!(self, "{}", fmt_float(v));
    }

    fn print_byte(&mut self, b: u8) {
        let _ = write!(self, "{}", b as char);
    }
}


// Boundary for imported functions: declarations without a body whose
// implementation is supplied by the host. The default resolver ignores
// the arguments and produces the declared return type's zero value.
pub trait ImportResolver {
    fn call(&mut self, name: &str, args: &[Value], ret: IrType) -> Value;
}

pub struct ZeroImports;

impl ImportResolver for ZeroImports {
    fn call(&mut self, _name: &str, _args: &[Value], ret: IrType) -> Value {
        Value::zero(ret)
    }
}


// Resolved branch target for one PC.
#[derive(Copy, Clone, Debug, PartialEq)]
enum Jump {
    None,
    // IF with a false condition enters the else block (or leaves the
    // statement when there is none).
    IfFalse(usize),
    // ELSE reached from a completed then-branch skips to ENDIF.
    Endif(usize),
    // CBREAK with a true condition resumes after ENDLOOP.
    Break(usize),
    // ENDLOOP and CONTINUE restart at the LOOP marker.
    Head(usize),
}


struct OpenIf {
    if_pc: usize,
    else_pc: Option<usize>,
}

struct OpenLoop {
    loop_pc: usize,
    breaks: Vec<usize>,
    continues: Vec<usize>,
}

// Bracket-match one function's structured control flow into a per-PC
// jump table. Unbalanced markers surface here, at load time.
fn resolve(name: &str, code: &[Opcode]) -> Result<Vec<Jump>> {
    let unmatched = |pc| Error::Unmatched { function: name.to_string(), pc };
    let mut jumps = vec![Jump::None; code.len()];
    let mut ifs: Vec<OpenIf> = Vec::new();
    let mut loops: Vec<OpenLoop> = Vec::new();

    for (pc, op) in code.iter().enumerate() {
        match op {
            Opcode::If => ifs.push(OpenIf { if_pc: pc, else_pc: None }),
            Opcode::Else => {
                let open = ifs.last_mut().ok_or_else(|| unmatched(pc))?;
                if open.else_pc.is_some() {
                    return Err(unmatched(pc));
                }
                open.else_pc = Some(pc);
            }
            Opcode::EndIf => {
                let open = ifs.pop().ok_or_else(|| unmatched(pc))?;
                match open.else_pc {
                    Some(else_pc) => {
                        jumps[open.if_pc] = Jump::IfFalse(else_pc + 1);
                        jumps[else_pc] = Jump::Endif(pc);
                    }
                    None => jumps[open.if_pc] = Jump::IfFalse(pc),
                }
            }
            Opcode::Loop => {
                loops.push(OpenLoop { loop_pc: pc, breaks: Vec::new(), continues: Vec::new() })
            }
            Opcode::CBreak => {
                loops.last_mut().ok_or_else(|| unmatched(pc))?.breaks.push(pc)
            }
            Opcode::Continue => {
                loops.last_mut().ok_or_else(|| unmatched(pc))?.continues.push(pc)
            }
            Opcode::EndLoop => {
                let open = loops.pop().ok_or_else(|| unmatched(pc))?;
                jumps[pc] = Jump::Head(open.loop_pc);
                for b in open.breaks {
                    jumps[b] = Jump::Break(pc + 1);
                }
                for c in open.continues {
                    jumps[c] = Jump::Head(open.loop_pc);
                }
            }
            _ => {}
        }
    }

    if let Some(open) = ifs.last() {
        return Err(unmatched(open.if_pc));
    }
    if let Some(open) = loops.last() {
        return Err(unmatched(open.loop_pc));
    }
    Ok(jumps)
}


// A function as loaded into the machine: its IR metadata plus the
// resolved jump table.
struct VmFunction {
    name: String,
    params: Vec<(String, IrType)>,
    ret: IrType,
    imported: bool,
    locals: Vec<(String, IrType)>,
    code: Vec<Opcode>,
    jumps: Vec<Jump>,
}

impl VmFunction {
    fn fresh_locals(&self) -> HashMap<String, Value> {
        self.locals
            .iter()
            .map(|(name, ty)| (name.clone(), Value::zero(*ty)))
            .collect()
    }
}


// Record stored across a CALL/RET boundary.
struct Frame {
    return_pc: usize,
    function: Rc<VmFunction>,
    locals: HashMap<String, Value>,
}


pub const DEFAULT_MEMORY: usize = 1 << 20;
pub const DEFAULT_BUDGET: u64 = 10_000_000;

// The entire machine state.
pub struct StackMachine {
    functions: HashMap<String, Rc<VmFunction>>,
    globals: HashMap<String, Value>,
    stack: Vec<Value>,
    memory: Vec<u8>,
    frames: Vec<Frame>,
    locals: HashMap<String, Value>,
    function: Rc<VmFunction>,
    pc: usize,
    budget: u64,
    executed: u64,
    debug: bool,
    imports: Box<dyn ImportResolver>,
}

macro_rules! int_arith {
    ($name:ident, $method:ident) => {
        fn $name(&mut self) -> Result<ControlFlow> {
            let b: i32 = self.pop_into()?;
            let a: i32 = self.pop_into()?;
            Ok(ControlFlow::Yield(Value::Int(a.$method(b))))
        }
    };
}

macro_rules! int_compare {
    ($name:ident, $op:tt) => {
        fn $name(&mut self) -> Result<ControlFlow> {
            let b: i32 = self.pop_into()?;
            let a: i32 = self.pop_into()?;
            Ok(ControlFlow::Yield(Value::Int((a $op b) as i32)))
        }
    };
}

macro_rules! float_arith {
    ($name:ident, $op:tt) => {
        fn $name(&mut self) -> Result<ControlFlow> {
            let b: f32 = self.pop_into()?;
            let a: f32 = self.pop_into()?;
            Ok(ControlFlow::Yield(Value::Float(a $op b)))
        }
    };
}

macro_rules! float_compare {
    ($name:ident, $op:tt) => {
        fn $name(&mut self) -> Result<ControlFlow> {
            let b: f32 = self.pop_into()?;
            let a: f32 = self.pop_into()?;
            Ok(ControlFlow::Yield(Value::Int((a $op b) as i32)))
        }
    };
}

impl StackMachine {
    pub fn new(module: &IrModule) -> Result<StackMachine> {
        Self::with_limits(module, DEFAULT_MEMORY, DEFAULT_BUDGET)
    }

    pub fn with_limits(
        module: &IrModule,
        memory_size: usize,
        budget: u64,
    ) -> Result<StackMachine> {
        let mut functions = HashMap::new();
        for func in &module.functions {
            let jumps = resolve(&func.name, &func.code)?;
            functions.insert(
                func.name.clone(),
                Rc::new(VmFunction {
                    name: func.name.clone(),
                    params: func.params.clone(),
                    ret: func.ret,
                    imported: func.imported,
                    locals: func.locals.clone(),
                    code: func.code.clone(),
                    jumps,
                }),
            );
        }
        let main = functions
            .get("main")
            .cloned()
            .ok_or_else(|| Error::UnknownFunction(String::from("main")))?;
        let globals = module
            .globals
            .iter()
            .map(|g| (g.name.clone(), Value::zero(g.ty)))
            .collect();
        Ok(StackMachine {
            functions,
            globals,
            stack: Vec::new(),
            memory: vec![0; memory_size],
            frames: Vec::new(),
            locals: main.fresh_locals(),
            function: main,
            pc: 0,
            budget,
            executed: 0,
            debug: false,
            imports: Box::new(ZeroImports),
        })
    }

    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    // Install a host-side implementation for imported functions.
    pub fn set_imports(&mut self, imports: Box<dyn ImportResolver>) {
        self.imports = imports;
    }

    // Where execution currently stands, for error reporting.
    pub fn position(&self) -> (String, usize) {
        (self.function.name.clone(), self.pc)
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    // Run the loaded module until the initial frame returns.
    pub fn run(&mut self, out: &mut impl Output) -> Result<()> {
        if let Some(main) = self.functions.get("main") {
            self.function = main.clone();
        }
        self.pc = 0;
        self.executed = 0;
        self.stack.clear();
        self.frames.clear();
        self.locals = self.function.fresh_locals();
        loop {
            match self.step(out) {
                Err(Error::Halt) => return Ok(()),
                Err(e) => return Err(e),
                Ok(()) => {}
            }
        }
    }

    // Execute a single instruction.
    fn step(&mut self, out: &mut impl Output) -> Result<()> {
        if self.executed >= self.budget {
            return Err(Error::BudgetExceeded(self.budget));
        }
        self.executed += 1;

        let op = self.fetch()?;
        trace!("{:03} {:<16} {:?}", self.pc, op.to_string(), self.stack);
        if self.debug {
            eprintln!(
                "[{}] {:03}: {:<16} stack={:?}",
                self.function.name,
                self.pc,
                op.to_string(),
                self.stack
            );
        }

        match self.dispatch(&op, out)? {
            ControlFlow::Advance => self.pc += 1,
            ControlFlow::Branch(target) => self.pc = target,
            ControlFlow::Yield(v) => {
                self.stack.push(v);
                self.pc += 1;
            }
        }
        Ok(())
    }

    fn fetch(&self) -> Result<Opcode> {
        if self.pc < self.function.code.len() {
            Ok(self.function.code[self.pc].clone())
        } else if self.frames.is_empty() {
            Err(Error::Halt)
        } else {
            Err(Error::Unmatched {
                function: self.function.name.clone(),
                pc: self.pc,
            })
        }
    }

    fn instruction(&self) -> String {
        self.function
            .code
            .get(self.pc)
            .map(|op| op.to_string())
            .unwrap_or_default()
    }

    fn pop(&mut self) -> Result<Value> {
        self.stack.pop().ok_or_else(|| Error::Underflow {
            function: self.function.name.clone(),
            pc: self.pc,
            instruction: self.instruction(),
        })
    }

    fn pop_into<T>(&mut self) -> Result<T>
    where
        Value: TryInto<T>,
    {
        self.pop()?.try_into()
    }

    // ------------------------------------------------------------------
    // Arithmetic, comparison, conversion
    // ------------------------------------------------------------------

    int_arith! { add_i, wrapping_add }
    int_arith! { sub_i, wrapping_sub }
    int_arith! { mul_i, wrapping_mul }

    int_compare! { lt_i, < }
    int_compare! { le_i, <= }
    int_compare! { gt_i, > }
    int_compare! { ge_i, >= }
    int_compare! { eq_i, == }
    int_compare! { ne_i, != }

    float_arith! { add_f, + }
    float_arith! { sub_f, - }
    float_arith! { mul_f, * }

    float_compare! { lt_f, < }
    float_compare! { le_f, <= }
    float_compare! { gt_f, > }
    float_compare! { ge_f, >= }
    float_compare! { eq_f, == }
    float_compare! { ne_f, != }

    fn and_i(&mut self) -> Result<ControlFlow> {
        let b: i32 = self.pop_into()?;
        let a: i32 = self.pop_into()?;
        Ok(ControlFlow::Yield(Value::Int(a & b)))
    }

    fn or_i(&mut self) -> Result<ControlFlow> {
        let b: i32 = self.pop_into()?;
        let a: i32 = self.pop_into()?;
        Ok(ControlFlow::Yield(Value::Int(a | b)))
    }

    fn div_i(&mut self) -> Result<ControlFlow> {
        let b: i32 = self.pop_into()?;
        let a: i32 = self.pop_into()?;
        if b == 0 {
            return Err(Error::DivideByZero);
        }
        Ok(ControlFlow::Yield(Value::Int(a.wrapping_div(b))))
    }

    fn div_f(&mut self) -> Result<ControlFlow> {
        let b: f32 = self.pop_into()?;
        let a: f32 = self.pop_into()?;
        if b == 0.0 {
            return Err(Error::DivideByZero);
        }
        Ok(ControlFlow::Yield(Value::Float(a / b)))
    }

    fn itof(&mut self) -> Result<ControlFlow> {
        let v: i32 = self.pop_into()?;
        Ok(ControlFlow::Yield(Value::Float(v as f32)))
    }

    fn ftoi(&mut self) -> Result<ControlFlow> {
        let v: f32 = self.pop_into()?;
        Ok(ControlFlow::Yield(Value::Int(v as i32)))
    }

    // ------------------------------------------------------------------
    // Linear memory
    // ------------------------------------------------------------------

    // Bounds-check a typed access of `width` bytes.
    fn offset(&self, addr: i32, width: usize) -> Result<usize> {
        let start = addr as usize;
        if addr < 0 || start + width > self.memory.len() {
            return Err(Error::BadAddress(addr));
        }
        Ok(start)
    }

    fn peek_i(&mut self) -> Result<ControlFlow> {
        let addr: i32 = self.pop_into()?;
        let at = self.offset(addr, 4)?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.memory[at..at + 4]);
        Ok(ControlFlow::Yield(Value::Int(i32::from_le_bytes(buf))))
    }

    fn poke_i(&mut self) -> Result<ControlFlow> {
        let v: i32 = self.pop_into()?;
        let addr: i32 = self.pop_into()?;
        let at = self.offset(addr, 4)?;
        self.memory[at..at + 4].copy_from_slice(&v.to_le_bytes());
        Ok(ControlFlow::Advance)
    }

    fn peek_f(&mut self) -> Result<ControlFlow> {
        let addr: i32 = self.pop_into()?;
        let at = self.offset(addr, 4)?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.memory[at..at + 4]);
        Ok(ControlFlow::Yield(Value::Float(f32::from_le_bytes(buf))))
    }

    fn poke_f(&mut self) -> Result<ControlFlow> {
        let v: f32 = self.pop_into()?;
        let addr: i32 = self.pop_into()?;
        let at = self.offset(addr, 4)?;
        self.memory[at..at + 4].copy_from_slice(&v.to_le_bytes());
        Ok(ControlFlow::Advance)
    }

    fn peek_b(&mut self) -> Result<ControlFlow> {
        let addr: i32 = self.pop_into()?;
        let at = self.offset(addr, 1)?;
        Ok(ControlFlow::Yield(Value::Int(self.memory[at] as i32)))
    }

    fn poke_b(&mut self) -> Result<ControlFlow> {
        let v: i32 = self.pop_into()?;
        let addr: i32 = self.pop_into()?;
        let at = self.offset(addr, 1)?;
        self.memory[at] = v as u8;
        Ok(ControlFlow::Advance)
    }

    fn grow(&mut self) -> Result<ControlFlow> {
        let count: i32 = self.pop_into()?;
        if count < 0 {
            return Err(Error::BadAddress(count));
        }
        let old = self.memory.len();
        self.memory.resize(old + count as usize, 0);
        Ok(ControlFlow::Yield(Value::Int(old as i32)))
    }

    // ------------------------------------------------------------------
    // Variables, calls, control flow
    // ------------------------------------------------------------------

    fn local_get(&mut self, name: &str) -> Result<ControlFlow> {
        match self.locals.get(name) {
            Some(v) => Ok(ControlFlow::Yield(*v)),
            None => Err(Error::UnknownLocal(name.to_string())),
        }
    }

    fn local_set(&mut self, name: &str) -> Result<ControlFlow> {
        let v = self.pop()?;
        self.locals.insert(name.to_string(), v);
        Ok(ControlFlow::Advance)
    }

    fn global_get(&mut self, name: &str) -> Result<ControlFlow> {
        match self.globals.get(name) {
            Some(v) => Ok(ControlFlow::Yield(*v)),
            None => Err(Error::UnknownGlobal(name.to_string())),
        }
    }

    fn global_set(&mut self, name: &str) -> Result<ControlFlow> {
        let v = self.pop()?;
        match self.globals.get_mut(name) {
            Some(slot) => {
                if slot.get_type() != v.get_type() {
                    return Err(expected(BitFlags::from_flag(slot.get_type()), &v));
                }
                *slot = v;
                Ok(ControlFlow::Advance)
            }
            None => Err(Error::UnknownGlobal(name.to_string())),
        }
    }

    fn call(&mut self, name: &str) -> Result<ControlFlow> {
        let target = self
            .functions
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownFunction(name.to_string()))?;

        let mut args = Vec::with_capacity(target.params.len());
        for _ in 0..target.params.len() {
            args.push(self.pop()?);
        }
        args.reverse();

        // Imported functions go to the host boundary instead of a
        // frame; the result must still honor the declared return type.
        if target.imported {
            let result = self.imports.call(&target.name, &args, target.ret);
            if result.get_type() != tag_of(target.ret) {
                return Err(expected(BitFlags::from_flag(tag_of(target.ret)), &result));
            }
            return Ok(ControlFlow::Yield(result));
        }

        let mut locals = target.fresh_locals();
        for ((pname, pty), value) in target.params.iter().zip(args) {
            if value.get_type() != tag_of(*pty) {
                return Err(expected(BitFlags::from_flag(tag_of(*pty)), &value));
            }
            locals.insert(pname.clone(), value);
        }

        self.frames.push(Frame {
            return_pc: self.pc + 1,
            function: self.function.clone(),
            locals: std::mem::replace(&mut self.locals, locals),
        });
        self.function = target;
        Ok(ControlFlow::Branch(0))
    }

    fn ret(&mut self) -> Result<ControlFlow> {
        match self.frames.pop() {
            None => Err(Error::Halt),
            Some(frame) => {
                self.function = frame.function;
                self.locals = frame.locals;
                Ok(ControlFlow::Branch(frame.return_pc))
            }
        }
    }

    fn jump_target(&self) -> Result<usize> {
        match self.function.jumps[self.pc] {
            Jump::IfFalse(t) | Jump::Endif(t) | Jump::Break(t) | Jump::Head(t) => Ok(t),
            Jump::None => Err(Error::Unmatched {
                function: self.function.name.clone(),
                pc: self.pc,
            }),
        }
    }

    // Dispatch table for the instruction set.
    fn dispatch(&mut self, op: &Opcode, out: &mut impl Output) -> Result<ControlFlow> {
        match op {
            Opcode::ConstI(v) => Ok(ControlFlow::Yield(Value::Int(*v))),
            Opcode::ConstF(v) => Ok(ControlFlow::Yield(Value::Float(*v))),

            Opcode::AddI => self.add_i(),
            Opcode::SubI => self.sub_i(),
            Opcode::MulI => self.mul_i(),
            Opcode::DivI => self.div_i(),
            Opcode::LtI => self.lt_i(),
            Opcode::LeI => self.le_i(),
            Opcode::GtI => self.gt_i(),
            Opcode::GeI => self.ge_i(),
            Opcode::EqI => self.eq_i(),
            Opcode::NeI => self.ne_i(),

            Opcode::AddF => self.add_f(),
            Opcode::SubF => self.sub_f(),
            Opcode::MulF => self.mul_f(),
            Opcode::DivF => self.div_f(),
            Opcode::LtF => self.lt_f(),
            Opcode::LeF => self.le_f(),
            Opcode::GtF => self.gt_f(),
            Opcode::GeF => self.ge_f(),
            Opcode::EqF => self.eq_f(),
            Opcode::NeF => self.ne_f(),

            Opcode::AndI => self.and_i(),
            Opcode::OrI => self.or_i(),

            Opcode::Itof => self.itof(),
            Opcode::Ftoi => self.ftoi(),

            Opcode::PrintI => {
                let v: i32 = self.pop_into()?;
                out.print_int(v);
                Ok(ControlFlow::Advance)
            }
            Opcode::PrintF => {
                let v: f32 = self.pop_into()?;
                out.print_float(v);
                Ok(ControlFlow::Advance)
            }
            Opcode::PrintB => {
                let v: i32 = self.pop_into()?;
                out.print_byte(v as u8);
                Ok(ControlFlow::Advance)
            }

            Opcode::PeekI => self.peek_i(),
            Opcode::PokeI => self.poke_i(),
            Opcode::PeekF => self.peek_f(),
            Opcode::PokeF => self.poke_f(),
            Opcode::PeekB => self.peek_b(),
            Opcode::PokeB => self.poke_b(),
            Opcode::Grow => self.grow(),

            Opcode::LocalGet(name) => self.local_get(name),
            Opcode::LocalSet(name) => self.local_set(name),
            Opcode::GlobalGet(name) => self.global_get(name),
            Opcode::GlobalSet(name) => self.global_set(name),

            Opcode::Call(name) => self.call(name),
            Opcode::Ret => self.ret(),

            Opcode::If => {
                let cond: i32 = self.pop_into()?;
                if cond == 0 {
                    Ok(ControlFlow::Branch(self.jump_target()?))
                } else {
                    Ok(ControlFlow::Advance)
                }
            }
            Opcode::Else => Ok(ControlFlow::Branch(self.jump_target()?)),
            Opcode::EndIf => Ok(ControlFlow::Advance),
            Opcode::Loop => Ok(ControlFlow::Advance),
            Opcode::CBreak => {
                let cond: i32 = self.pop_into()?;
                if cond != 0 {
                    Ok(ControlFlow::Branch(self.jump_target()?))
                } else {
                    Ok(ControlFlow::Advance)
                }
            }
            Opcode::Continue => Ok(ControlFlow::Branch(self.jump_target()?)),
            Opcode::EndLoop => Ok(ControlFlow::Branch(self.jump_target()?)),
        }
    }
}


// These tests are written against the *behavior* of the machine: any
// conforming implementation should pass them.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Type;
    use crate::ir::{lower, IrFunction, IrGlobal, IrModule};
    use crate::lexer::tokenize;
    use crate::parser::parse;
    use crate::typechecker::check_program;

    // Capture sink: one entry per print.
    impl Output for Vec<String> {
        fn print_int(&mut self, v: i32) {
            self.push(v.to_string());
        }

        fn print_float(&mut self, v: f32) {
            self.push(fmt_float(v));
        }

        fn print_byte(&mut self, b: u8) {
            self.push((b as char).to_string());
        }
    }

    fn compile(text: &str) -> IrModule {
        let program = parse(tokenize(text).unwrap()).unwrap();
        check_program(&program).unwrap();
        lower(&program)
    }

    fn run_source(text: &str) -> Vec<String> {
        let mut vm = StackMachine::new(&compile(text)).unwrap();
        let mut out = Vec::new();
        vm.run(&mut out).unwrap();
        out
    }

    fn run_source_err(text: &str) -> Error {
        let mut vm = StackMachine::new(&compile(text)).unwrap();
        let mut out = Vec::new();
        vm.run(&mut out).unwrap_err()
    }

    fn module_with_main(code: Vec<Opcode>) -> IrModule {
        IrModule {
            functions: vec![IrFunction {
                name: String::from("main"),
                params: Vec::new(),
                ret: IrType::I,
                ret_source: Some(Type::Int),
                imported: false,
                locals: Vec::new(),
                locals_source: Vec::new(),
                code,
            }],
            globals: Vec::new(),
        }
    }

    fn run_code(code: Vec<Opcode>) -> (Vec<String>, Result<()>) {
        let module = module_with_main(code);
        let mut vm = StackMachine::new(&module).unwrap();
        let mut out = Vec::new();
        let status = vm.run(&mut out);
        (out, status)
    }

    // ------------------------------------------------------------------
    // End-to-end scenarios
    // ------------------------------------------------------------------

    #[test]
    fn test_arithmetic_program() {
        assert_eq!(run_source("print 2 + 3 * 4 - 5;"), vec!["9"]);
    }

    #[test]
    fn test_while_program() {
        assert_eq!(
            run_source("var x int = 0; while x < 3 { print x; x = x + 1; }"),
            vec!["0", "1", "2"]
        );
    }

    #[test]
    fn test_function_call_program() {
        assert_eq!(
            run_source("func add(a int, b int) int { return a + b; } print add(2, 40);"),
            vec!["42"]
        );
    }

    #[test]
    fn test_if_else_program() {
        assert_eq!(run_source("if true { print 1; } else { print 2; }"), vec!["1"]);
        assert_eq!(run_source("if false { print 1; } else { print 2; }"), vec!["2"]);
    }

    #[test]
    fn test_memory_program() {
        assert_eq!(run_source("var p int = ^ 4; `p = 7; print `p;"), vec!["7"]);
    }

    #[test]
    fn test_break_program() {
        assert_eq!(
            run_source(
                "var i int = 0; \
                 while i < 5 { if i == 3 { break; } print i; i = i + 1; }"
            ),
            vec!["0", "1", "2"]
        );
    }

    #[test]
    fn test_continue_program() {
        assert_eq!(
            run_source(
                "var i int = 0; \
                 while i < 5 { i = i + 1; if i == 2 { continue; } print i; }"
            ),
            vec!["1", "3", "4", "5"]
        );
    }

    #[test]
    fn test_nested_control_flow() {
        assert_eq!(
            run_source(
                "var i int = 0; \
                 while i < 3 { \
                   var j int = 0; \
                   while j < 3 { \
                     if j == 2 { break; } \
                     if i == j { print i * 10 + j; } \
                     j = j + 1; \
                   } \
                   i = i + 1; \
                 }"
            ),
            vec!["0", "11"]
        );
    }

    #[test]
    fn test_recursion() {
        assert_eq!(
            run_source(
                "func fib(n int) int { \
                   if n <= 1 { return n; } \
                   return fib(n - 1) + fib(n - 2); \
                 } \
                 print fib(10);"
            ),
            vec!["55"]
        );
    }

    #[test]
    fn test_user_main_runs() {
        assert_eq!(
            run_source("func main() int { print 41 + 1; return 0; }"),
            vec!["42"]
        );
    }

    #[test]
    fn test_char_and_float_output() {
        assert_eq!(run_source("print 'h'; print 'i';"), vec!["h", "i"]);
        assert_eq!(run_source("print 1.5 + 2.25;"), vec!["3.75"]);
        assert_eq!(run_source("print float(2);"), vec!["2.0"]);
        assert_eq!(run_source("print int(2.75);"), vec!["2"]);
    }

    #[test]
    fn test_globals_zero_initialized() {
        assert_eq!(run_source("var x int; print x;"), vec!["0"]);
        assert_eq!(run_source("var y float; print y;"), vec!["0.0"]);
    }

    #[test]
    fn test_locals_zero_initialized() {
        assert_eq!(
            run_source("func f() int { var x int; return x; } print f();"),
            vec!["0"]
        );
    }

    #[test]
    fn test_imported_function_stub() {
        assert_eq!(
            run_source("import func host_rand() int; print host_rand();"),
            vec!["0"]
        );
        assert_eq!(
            run_source("import func host_temp(zone int) float; print host_temp(3);"),
            vec!["0.0"]
        );
    }

    struct Doubler;

    impl ImportResolver for Doubler {
        fn call(&mut self, _name: &str, args: &[Value], _ret: IrType) -> Value {
            match args {
                [Value::Int(v)] => Value::Int(v * 2),
                _ => Value::Int(0),
            }
        }
    }

    #[test]
    fn test_imported_function_host_resolver() {
        let module = compile("import func double(x int) int; print double(21);");
        let mut vm = StackMachine::new(&module).unwrap();
        vm.set_imports(Box::new(Doubler));
        let mut out = Vec::new();
        vm.run(&mut out).unwrap();
        assert_eq!(out, vec!["42"]);
    }

    // ------------------------------------------------------------------
    // Short-circuit evaluation
    // ------------------------------------------------------------------

    #[test]
    fn test_and_short_circuits() {
        let text = "func t() bool { print 1; return true; } \
                    func f() bool { print 0; return false; }";
        // The right side runs only when the left was true.
        assert_eq!(
            run_source(&format!("{} print f() && t();", text)),
            vec!["0", "0"]
        );
        assert_eq!(
            run_source(&format!("{} print t() && t();", text)),
            vec!["1", "1", "1"]
        );
    }

    #[test]
    fn test_or_short_circuits() {
        let text = "func t() bool { print 1; return true; } \
                    func f() bool { print 0; return false; }";
        assert_eq!(
            run_source(&format!("{} print t() || f();", text)),
            vec!["1", "1"]
        );
        assert_eq!(
            run_source(&format!("{} print f() || t();", text)),
            vec!["0", "1", "1"]
        );
    }

    // ------------------------------------------------------------------
    // Memory
    // ------------------------------------------------------------------

    #[test]
    fn test_int_round_trip() {
        let (out, status) = run_code(vec![
            Opcode::ConstI(8),
            Opcode::ConstI(-123456),
            Opcode::PokeI,
            Opcode::ConstI(8),
            Opcode::PeekI,
            Opcode::PrintI,
            Opcode::ConstI(0),
            Opcode::Ret,
        ]);
        assert_eq!(status, Ok(()));
        assert_eq!(out, vec!["-123456"]);
    }

    #[test]
    fn test_float_round_trip_is_bit_exact() {
        let (out, status) = run_code(vec![
            Opcode::ConstI(16),
            Opcode::ConstF(3.14159),
            Opcode::PokeF,
            Opcode::ConstI(16),
            Opcode::PeekF,
            Opcode::ConstF(3.14159),
            Opcode::EqF,
            Opcode::PrintI,
            Opcode::ConstI(0),
            Opcode::Ret,
        ]);
        assert_eq!(status, Ok(()));
        assert_eq!(out, vec!["1"]);
    }

    #[test]
    fn test_little_endian_layout() {
        let (out, status) = run_code(vec![
            Opcode::ConstI(0),
            Opcode::ConstI(0x0403_0201),
            Opcode::PokeI,
            Opcode::ConstI(0),
            Opcode::PeekB,
            Opcode::PrintI,
            Opcode::ConstI(3),
            Opcode::PeekB,
            Opcode::PrintI,
            Opcode::ConstI(0),
            Opcode::Ret,
        ]);
        assert_eq!(status, Ok(()));
        assert_eq!(out, vec!["1", "4"]);
    }

    #[test]
    fn test_grow_returns_old_size() {
        let module = module_with_main(vec![
            Opcode::ConstI(16),
            Opcode::Grow,
            Opcode::PrintI,
            Opcode::ConstI(8),
            Opcode::Grow,
            Opcode::PrintI,
            Opcode::ConstI(0),
            Opcode::Ret,
        ]);
        let mut vm = StackMachine::with_limits(&module, 64, DEFAULT_BUDGET).unwrap();
        let mut out = Vec::new();
        assert_eq!(vm.run(&mut out), Ok(()));
        assert_eq!(out, vec!["64", "80"]);
    }

    #[test]
    fn test_byte_poke_peek() {
        let (out, status) = run_code(vec![
            Opcode::ConstI(5),
            Opcode::ConstI(200),
            Opcode::PokeB,
            Opcode::ConstI(5),
            Opcode::PeekB,
            Opcode::PrintI,
            Opcode::ConstI(0),
            Opcode::Ret,
        ]);
        assert_eq!(status, Ok(()));
        assert_eq!(out, vec!["200"]);
    }

    #[test]
    fn test_out_of_range_access() {
        let module = module_with_main(vec![
            Opcode::ConstI(62),
            Opcode::PeekI,
            Opcode::ConstI(0),
            Opcode::Ret,
        ]);
        let mut vm = StackMachine::with_limits(&module, 64, DEFAULT_BUDGET).unwrap();
        let mut out = Vec::new();
        assert_eq!(vm.run(&mut out), Err(Error::BadAddress(62)));
    }

    #[test]
    fn test_negative_address() {
        let (_, status) = run_code(vec![Opcode::ConstI(-4), Opcode::PeekI]);
        assert_eq!(status, Err(Error::BadAddress(-4)));
    }

    // ------------------------------------------------------------------
    // Failure modes
    // ------------------------------------------------------------------

    #[test]
    fn test_divide_by_zero() {
        assert_eq!(run_source_err("print 1 / 0;"), Error::DivideByZero);
        assert_eq!(run_source_err("print 1.0 / 0.0;"), Error::DivideByZero);
    }

    #[test]
    fn test_stack_type_mismatch() {
        let (_, status) = run_code(vec![
            Opcode::ConstI(1),
            Opcode::ConstF(2.0),
            Opcode::AddI,
        ]);
        assert_eq!(
            status,
            Err(Error::TypeError {
                expect: BitFlags::from_flag(TypeTag::Int),
                got: TypeTag::Float,
            })
        );
    }

    #[test]
    fn test_stack_underflow_reports_position() {
        let (_, status) = run_code(vec![Opcode::AddI]);
        match status {
            Err(Error::Underflow { function, pc, instruction }) => {
                assert_eq!(function, "main");
                assert_eq!(pc, 0);
                assert_eq!(instruction, "ADDI");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_function() {
        let (_, status) = run_code(vec![Opcode::Call(String::from("nowhere"))]);
        assert_eq!(status, Err(Error::UnknownFunction(String::from("nowhere"))));
    }

    #[test]
    fn test_unknown_local() {
        let (_, status) = run_code(vec![Opcode::LocalGet(String::from("ghost"))]);
        assert_eq!(status, Err(Error::UnknownLocal(String::from("ghost"))));
    }

    #[test]
    fn test_global_set_type_checked() {
        let module = IrModule {
            functions: module_with_main(vec![
                Opcode::ConstF(1.0),
                Opcode::GlobalSet(String::from("x")),
            ])
            .functions,
            globals: vec![IrGlobal {
                name: String::from("x"),
                ty: IrType::I,
                source: Type::Int,
            }],
        };
        let mut vm = StackMachine::new(&module).unwrap();
        let mut out = Vec::new();
        assert_eq!(
            vm.run(&mut out),
            Err(Error::TypeError {
                expect: BitFlags::from_flag(TypeTag::Int),
                got: TypeTag::Float,
            })
        );
    }

    #[test]
    fn test_unbalanced_control_flow_rejected_at_load() {
        let cases = vec![
            vec![Opcode::If, Opcode::Ret],
            vec![Opcode::Else, Opcode::Ret],
            vec![Opcode::EndIf, Opcode::Ret],
            vec![Opcode::EndLoop, Opcode::Ret],
            vec![Opcode::ConstI(1), Opcode::CBreak, Opcode::Ret],
            vec![Opcode::Continue, Opcode::Ret],
            vec![Opcode::Loop, Opcode::Ret],
        ];
        for code in cases {
            let module = module_with_main(code.clone());
            match StackMachine::new(&module) {
                Err(Error::Unmatched { .. }) => {}
                other => {
                    panic!("expected load failure for {:?}, got ok={}", code, other.is_ok())
                }
            }
        }
    }

    #[test]
    fn test_missing_main_rejected() {
        let module = IrModule { functions: Vec::new(), globals: Vec::new() };
        match StackMachine::new(&module) {
            Err(Error::UnknownFunction(name)) => assert_eq!(name, "main"),
            _ => panic!("expected missing main to be rejected"),
        }
    }

    #[test]
    fn test_instruction_budget() {
        let module = compile("while true { }");
        let mut vm = StackMachine::with_limits(&module, 64, 1_000).unwrap();
        let mut out = Vec::new();
        assert_eq!(vm.run(&mut out), Err(Error::BudgetExceeded(1_000)));
    }

    #[test]
    fn test_call_argument_type_checked() {
        let mut module = compile("func f(x int) int { return x; }");
        let main = module
            .functions
            .iter_mut()
            .find(|f| f.name == "main")
            .unwrap();
        main.code = vec![
            Opcode::ConstF(1.5),
            Opcode::Call(String::from("f")),
            Opcode::Ret,
        ];
        let mut vm = StackMachine::new(&module).unwrap();
        let mut out = Vec::new();
        assert_eq!(
            vm.run(&mut out),
            Err(Error::TypeError {
                expect: BitFlags::from_flag(TypeTag::Int),
                got: TypeTag::Float,
            })
        );
    }

    #[test]
    fn test_bitwise_opcodes() {
        let (out, status) = run_code(vec![
            Opcode::ConstI(6),
            Opcode::ConstI(3),
            Opcode::AndI,
            Opcode::PrintI,
            Opcode::ConstI(6),
            Opcode::ConstI(3),
            Opcode::OrI,
            Opcode::PrintI,
            Opcode::ConstI(0),
            Opcode::Ret,
        ]);
        assert_eq!(status, Ok(()));
        assert_eq!(out, vec!["2", "7"]);
    }

    #[test]
    fn test_call_statement_leftover_value_is_harmless() {
        let text = "func shout() int { print 9; return 9; } shout();";
        assert_eq!(run_source(text), vec!["9"]);
    }

    #[test]
    fn test_machine_reports_position() {
        let module = compile("print 1;");
        let vm = StackMachine::new(&module).unwrap();
        assert_eq!(vm.position(), (String::from("main"), 0));
    }
}
