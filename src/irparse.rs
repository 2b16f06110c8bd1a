use std::iter::Peekable;

use indexmap::IndexMap;
use logos::{Logos, SpannedIter};

use crate::{instr::{BlockId, BlockTag, Cmp, Function, Instr, InstrBlock, InstrK, Linkage}, module::{ExternFunction, Functional, Module, ModuleError}, ty::{Ty, Type}};

#[derive(Logos, PartialEq, Debug, Clone, Copy)]
pub enum IrToken {
    #[token("int32")]
    Int32,
    #[token("float32")]
    Float32,
    #[token("uint32")]
    UInt32,
    #[token("int16")]
    Int16,
    #[token("uint16")]
    UInt16,
    #[token("int8")]
    Int8,
    #[token("uint8")]
    UInt8,
    #[token("ptr")]
    Ptr,
    #[token("struct")]
    Struct,
    #[token("func")]
    Func,
    #[regex(r#""([^"])*""#)]
    String,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(",")]
    Comma,
    #[token("->")]
    Arrow,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token(":")]
    Colon,
    #[token("locals")]
    Locals,
    #[token("#")]
    Hash,
    #[regex("[0-9]+")]
    Int,
    #[regex(r"-?[0-9]+\.[0-9]+")]
    Float,
    #[regex("[a-zA-Z_][a-zA-Z0-9._-]*")] // identifiers may contain dots
    Identifier,
    #[token("=")]
    Equals,
    #[regex(r"[ \n\r\t\f]+", logos::skip)]
    #[error]
    Error,
}

pub struct IRParser<'a, 'ctx> {
    module: &'a mut Module<'ctx>,
    source: &'a str,
    lex: Peekable<SpannedIter<'a, IrToken>>
}

impl<'a, 'ctx> IRParser<'a, 'ctx> {
    pub fn new(module: &'a mut Module<'ctx>, source: &'a str) -> Self {
        Self {
            module,
            source,
            lex: IrToken::lexer(source).spanned().peekable()
        }
    }

    fn expect(&mut self, expected: IrToken) -> Result<&'a str, IrParseError> {
        match self.lex.next() {
            None => Err(IrParseError::UnexpectedEof),
            Some((t, span)) => if t == expected {
                Ok(&self.source[span])
            } else {
                Err(IrParseError::UnexpectedToken { expected, got: t })
            }
        }
    }

    /// Expect a specific identifier, e.g. a keyword like `to` or `tag`
    fn expect_ident(&mut self, keyword: &str) -> Result<(), IrParseError> {
        let t = self.expect(IrToken::Identifier)?;
        if t != keyword { return Err(IrParseError::MalformedIdentifier { got: t.to_owned() }) }
        Ok(())
    }

    fn expect_string(&mut self) -> Result<String, IrParseError> {
        Ok(self.expect(IrToken::String)?.strip('"').to_owned())
    }

    fn expect_number<T: std::str::FromStr>(&mut self, token: IrToken) -> Result<T, IrParseError> {
        let s = self.expect(token)?;
        s.parse().map_err(|_| IrParseError::MalformedNumber { got: s.to_owned() })
    }

    fn peek(&mut self, expected: IrToken) -> bool {
        match self.lex.peek() {
            None => false,
            Some((t, _)) => t == &expected
        }
    }

    fn peek_str(&mut self, expected: IrToken) -> Option<&'a str> {
        let source = self.source;
        match self.lex.peek() {
            None => None,
            Some((t, span)) => if t == &expected {
                Some(&source[span.clone()])
            } else {
                None
            }
        }
    }

    fn next(&mut self) -> Option<(IrToken, &'a str)> {
        let source = self.source;
        self.lex.next().map(|(t, span)| (t, &source[span]))
    }

    fn parse_block_id(&mut self) -> Result<BlockId, IrParseError> {
        // the block str is "b{number}"
        let block_str = self.expect(IrToken::Identifier)?;
        match block_str.strip_prefix('b').map(str::parse::<usize>) {
            Some(Ok(block_id)) => Ok(BlockId::from(block_id)),
            _ => Err(IrParseError::MalformedIdentifier { got: block_str.to_owned() })
        }
    }

    fn parse_instr(&mut self) -> Result<Instr<'ctx>, IrParseError> {
        let name = self.expect(IrToken::Identifier)?;
        let kind = match name {
            "ld.int32" | "ld.uint32" | "ld.int16" | "ld.uint16" | "ld.int8" | "ld.uint8" => {
                let ty = match name {
                    "ld.int32" => self.module.int32t(),
                    "ld.uint32" => self.module.uint32t(),
                    "ld.int16" => self.module.int16t(),
                    "ld.uint16" => self.module.uint16t(),
                    "ld.int8" => self.module.int8t(),
                    _ => self.module.uint8t(),
                };
                InstrK::LdInt(self.expect_number(IrToken::Int)?, ty)
            }
            "ld.float" => InstrK::LdFloat(self.expect_number(IrToken::Float)?),
            "ld.bytes" => {
                let s = self.expect(IrToken::String)?;
                let bytes = unescape_bytes(s.strip('"'))?;
                let int8 = self.module.int8t();
                let ty = self.module.intern_type(Type::Array { elem: int8, len: bytes.len() });
                InstrK::LdBytes(bytes, ty)
            }
            "iadd" => InstrK::IAdd,
            "isub" => InstrK::ISub,
            "imul" => InstrK::IMul,
            "idiv" => InstrK::IDiv,
            "fadd" => InstrK::FAdd,
            "fsub" => InstrK::FSub,
            "fmul" => InstrK::FMul,
            "fdiv" => InstrK::FDiv,
            "itof" => InstrK::Itof,
            "ftoi" => {
                self.expect_ident("to")?;
                InstrK::Ftoi { int_ty: self.parse_type()? }
            },
            "icmp.eq" => InstrK::ICmp(Cmp::Eq),
            "icmp.ne" => InstrK::ICmp(Cmp::Ne),
            "icmp.lt" => InstrK::ICmp(Cmp::Lt),
            "icmp.le" => InstrK::ICmp(Cmp::Le),
            "icmp.gt" => InstrK::ICmp(Cmp::Gt),
            "icmp.ge" => InstrK::ICmp(Cmp::Ge),
            "fcmp.eq" => InstrK::FCmp(Cmp::Eq),
            "fcmp.ne" => InstrK::FCmp(Cmp::Ne),
            "fcmp.lt" => InstrK::FCmp(Cmp::Lt),
            "fcmp.le" => InstrK::FCmp(Cmp::Le),
            "fcmp.gt" => InstrK::FCmp(Cmp::Gt),
            "fcmp.ge" => InstrK::FCmp(Cmp::Ge),
            "not" => InstrK::Not,
            "bit_and" => InstrK::BitAnd,
            "bit_or" => InstrK::BitOr,
            "iconv" => {
                self.expect_ident("to")?;
                InstrK::IConv { target: self.parse_type()? }
            },
            "call" => {
                if self.peek(IrToken::Identifier) {
                    self.expect_ident("indirect")?;
                    InstrK::CallIndirect
                } else {
                    InstrK::CallDirect { func_name: self.expect_string()? }
                }
            },
            "ld.loc" => {
                self.expect(IrToken::Hash)?;
                InstrK::LdLocal { idx: self.expect_number(IrToken::Int)? }
            }
            "st.loc" => {
                self.expect(IrToken::Hash)?;
                InstrK::StLocal { idx: self.expect_number(IrToken::Int)? }
            }
            "ld_glob_func" => InstrK::LdGlobalFunc { func_name: self.expect_string()? },
            "bitcast" => {
                self.expect_ident("to")?;
                InstrK::Bitcast { target: self.parse_type()? }
            }
            "if" => {
                self.expect_ident("then")?;
                let then = self.parse_block_id()?;
                if self.peek_str(IrToken::Identifier) == Some("else") {
                    self.next(); // "else"
                    let else_block = self.parse_block_id()?;
                    InstrK::IfElse { then, r#else: Some(else_block) }
                } else {
                    InstrK::IfElse { then, r#else: None }
                }
            }
            "read" => InstrK::Read { ty: self.parse_type()? },
            "write" => InstrK::Write { ty: self.parse_type()? },
            "offset" => InstrK::Offset { ty: self.parse_type()? },
            "get_field_ptr" => {
                let field_idx = self.expect_number(IrToken::Int)?;
                let struct_ty = self.parse_type()?;
                InstrK::GetFieldPtr { struct_ty, field_idx }
            }
            "alloca" => InstrK::Alloca { ty: self.parse_type()? },
            "discard" => InstrK::Discard,
            "return" => InstrK::Return,
            "fail" => InstrK::Fail,
            "loop" => InstrK::Loop(self.parse_block_id()?),
            "break" => InstrK::Break,
            other => return Err(IrParseError::InvalidInstructionName { got: other.to_owned() })
        };
        Ok(Instr::new(kind))
    }

    fn parse_block(&mut self) -> Result<InstrBlock<'ctx>, IrParseError> {
        let id = self.parse_block_id()?;
        self.expect(IrToken::Colon)?;

        let block_ty = self.parse_type()?;
        let returns = match &*block_ty {
            Type::Func { args, ret } if args.is_empty() => ret.clone(),
            _ => return Err(IrParseError::InvalidBlockType)
        };

        // parse the "tag=smth"
        self.expect_ident("tag")?;
        self.expect(IrToken::Equals)?;
        let block_tag = match self.expect(IrToken::Identifier)? {
            "undefined" => BlockTag::Undefined,
            "main" => BlockTag::Main,
            "if_else" => BlockTag::IfElse,
            "loop" => BlockTag::Loop,
            other => return Err(IrParseError::MalformedIdentifier { got: other.to_owned() })
        };

        let mut block = InstrBlock::new(id, returns, block_tag);

        // then parse the instructions
        fn is_block_id(s: &str) -> bool {
            s.starts_with('b')
            && s.chars().nth(1).map(|c| c.is_ascii_digit()).unwrap_or(false)
        }

        // A block doesn't have a formal ending
        // but it's always followed by either a new block or a '}'
        loop {
            if self.peek_str(IrToken::Identifier).map(is_block_id).unwrap_or(false) { break; }
            if self.peek(IrToken::RBrace) { break; }
            if self.lex.peek().is_none() { break; }

            block.body.push(self.parse_instr()?);
        }
        Ok(block)
    }

    /// Parse a function definition. The `func` keyword must come next.
    pub fn parse_function(&mut self) -> Result<Function<'ctx>, IrParseError> {
        self.expect(IrToken::Func)?;
        let linkage = if self.peek_str(IrToken::Identifier) == Some("linkonce_odr") {
            self.next();
            Linkage::LinkOnceOdr
        } else {
            Linkage::External
        };
        let func_name = self.expect_string()?;
        let func_ty = self.parse_type()?;
        let arg_tys = match &*func_ty {
            Type::Func { args, ret: _ } => args.clone(),
            _ => return Err(IrParseError::ExpectedFunctionType)
        };

        self.expect(IrToken::LBrace)?;
        self.expect(IrToken::Locals)?;
        self.expect(IrToken::Colon)?;

        let mut locals = vec![];
        while self.peek(IrToken::Hash) {
            self.next(); // '#'
            let local_id: usize = self.expect_number(IrToken::Int)?;
            if local_id != locals.len() {
                return Err(IrParseError::InvalidLocals { function: func_name });
            }
            locals.push(self.parse_type()?);
        }
        if locals.len() < arg_tys.len() || locals[..arg_tys.len()] != arg_tys[..] {
            return Err(IrParseError::InvalidLocals { function: func_name });
        }

        let mut blocks = IndexMap::new();
        while !self.peek(IrToken::RBrace) { // closing brace of the function
            let block = self.parse_block()?;
            blocks.insert(block.idx, block);
        }
        self.next(); // '}'

        if !blocks.contains_key(&BlockId::entry_block_id()) {
            return Err(IrParseError::MissingEntryBlock { function: func_name });
        }

        let mut function = Function::new(func_name, func_ty, blocks, locals);
        function.set_linkage(linkage);
        Ok(function)
    }

    /// Parse a whole module: an optional `module "name"` header followed by
    /// aliases, external declarations and function definitions.
    pub fn parse_module(&mut self) -> Result<(), IrParseError> {
        if self.peek_str(IrToken::Identifier) == Some("module") {
            self.next();
            let name = self.expect_string()?;
            self.module.set_name(name);
        }

        loop {
            let token = match self.lex.peek() {
                None => break,
                Some((t, _)) => *t
            };
            let keyword = self.peek_str(IrToken::Identifier);
            match token {
                IrToken::Func => {
                    let function = self.parse_function()?;
                    self.module.add_function(Functional::Local(function))?;
                }
                IrToken::Identifier if keyword == Some("extern") => {
                    self.next();
                    self.expect(IrToken::Func)?;
                    let name = self.expect_string()?;
                    let ty = self.parse_type()?;
                    if !ty.is_func() { return Err(IrParseError::ExpectedFunctionType) }
                    self.module.add_extern_function(ExternFunction::new(name, ty))?;
                }
                IrToken::Identifier if keyword == Some("alias") => {
                    self.next();
                    let name = self.expect_string()?;
                    self.expect(IrToken::Equals)?;
                    let aliasee = self.expect_string()?;
                    self.expect_ident("as")?;
                    let ty = self.parse_type()?;
                    if !ty.is_func() { return Err(IrParseError::ExpectedFunctionType) }
                    self.module.add_alias(name, aliasee, ty)?;
                }
                _ => return Err(IrParseError::GeneralUnexpectedToken)
            }
        }
        Ok(())
    }

    fn parse_type_list(&mut self, end: IrToken) -> Result<Vec<Ty<'ctx>>, IrParseError> {
        let mut tys = vec![];
        while !self.peek(end) {
            tys.push(self.parse_type()?);
            if self.peek(IrToken::Comma) { self.next(); }
        }
        self.expect(end)?;
        Ok(tys)
    }

    fn parse_type(&mut self) -> Result<Ty<'ctx>, IrParseError> {
        let token = match self.lex.peek() {
            None => return Err(IrParseError::UnexpectedEof),
            Some((t, _)) => *t
        };
        match token {
            IrToken::Int32 => { self.next(); Ok(self.module.int32t()) }
            IrToken::UInt32 => { self.next(); Ok(self.module.uint32t()) }
            IrToken::Int16 => { self.next(); Ok(self.module.int16t()) }
            IrToken::UInt16 => { self.next(); Ok(self.module.uint16t()) }
            IrToken::Int8 => { self.next(); Ok(self.module.int8t()) }
            IrToken::UInt8 => { self.next(); Ok(self.module.uint8t()) }
            IrToken::Float32 => { self.next(); Ok(self.module.float32t()) }
            IrToken::Ptr => { self.next(); Ok(self.module.ptr_t()) }
            IrToken::LParen => {
                // a function type
                self.next(); // '('
                let args = self.parse_type_list(IrToken::RParen)?;
                self.expect(IrToken::Arrow)?;
                // if rets=[], then there will be '()'
                // but if it's a single return value, there's no parentheses!
                let rets = if self.peek(IrToken::LParen) {
                    self.next(); // '('
                    self.parse_type_list(IrToken::RParen)?
                } else {
                    vec![self.parse_type()?]
                };
                Ok(self.module.intern_type(Type::Func { args, ret: rets }))
            }
            IrToken::Struct => {
                self.next(); // 'struct'
                self.expect(IrToken::LBrace)?;
                let fields = self.parse_type_list(IrToken::RBrace)?;
                Ok(self.module.intern_type(Type::Struct { fields }))
            }
            IrToken::LBracket => {
                // an array type, e.g. [4 x int8]
                self.next(); // '['
                let len = self.expect_number(IrToken::Int)?;
                self.expect_ident("x")?;
                let elem = self.parse_type()?;
                self.expect(IrToken::RBracket)?;
                Ok(self.module.intern_type(Type::Array { elem, len }))
            }
            _ => Err(IrParseError::GeneralUnexpectedToken)
        }
    }
}

/// Parse a module from its textual representation.
///
/// `default_name` is used when the source has no `module` header.
pub fn parse_module<'ctx>(default_name: &str, source: &str) -> Result<Module<'ctx>, IrParseError> {
    let mut module = Module::new(default_name);
    IRParser::new(&mut module, source).parse_module()?;
    Ok(module)
}

/// Turn the contents of a printed byte string back into bytes.
/// `\XX` is a hex escape, everything else is taken literally.
fn unescape_bytes(s: &str) -> Result<Vec<u8>, IrParseError> {
    let raw = s.as_bytes();
    let mut bytes = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'\\' {
            let escape = s.get(i + 1..i + 3).ok_or_else(|| IrParseError::MalformedEscape { got: s[i..].to_owned() })?;
            let byte = u8::from_str_radix(escape, 16).map_err(|_| IrParseError::MalformedEscape { got: escape.to_owned() })?;
            bytes.push(byte);
            i += 3;
        } else {
            bytes.push(raw[i]);
            i += 1;
        }
    }
    Ok(bytes)
}

// A helper method on &str
// used to strip the start and end double quotes off a parsed string
// "\"name\"".strip('"') == "name"
trait StrHelper {
    fn strip(&self, c: char) -> &str;
}
impl<T: AsRef<str>> StrHelper for T {
    fn strip(&self, c: char) -> &str {
        let s = self.as_ref();
        let s = s.strip_prefix(c).unwrap_or(s);
        s.strip_suffix(c).unwrap_or(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IrParseError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("expected {expected:?}, got {got:?}")]
    UnexpectedToken { expected: IrToken, got: IrToken },
    #[error("unexpected token")]
    GeneralUnexpectedToken,
    #[error("malformed identifier `{got}`")]
    MalformedIdentifier { got: String },
    #[error("malformed number `{got}`")]
    MalformedNumber { got: String },
    #[error("malformed escape sequence `{got}`")]
    MalformedEscape { got: String },
    #[error("unknown instruction `{got}`")]
    InvalidInstructionName { got: String },
    #[error("a block type must be a function type without arguments")]
    InvalidBlockType,
    #[error("expected a function type")]
    ExpectedFunctionType,
    #[error("locals of `{function}` must be numbered from zero and start with the arguments")]
    InvalidLocals { function: String },
    #[error("function `{function}` has no entry block")]
    MissingEntryBlock { function: String },
    #[error(transparent)]
    Module(#[from] ModuleError),
}

#[cfg(test)]
mod tests {
    use crate::{instr::{CallTarget, InstrK, Linkage}, irprint::IRPrint, module::Module};

    use super::{parse_module, IrParseError};

    const SOURCE: &str = r#"
module "prog.c"

alias "__instrument_before_call" = "my_before" as (ptr) -> ()

extern func "my_before" (ptr) -> ()

func linkonce_odr "helper" (int32) -> int32 {
locals:
  #0 int32
  #1 ptr
b0: () -> int32 tag=main
  alloca [3 x int8]
  st.loc #1
  ld.loc #1
  ld.bytes "hi\00"
  write [3 x int8]
  ld.loc #0
  if then b1 else b2
  return
b1: () -> int32 tag=if_else
  ld.int32 1
b2: () -> int32 tag=if_else
  ld.int32 2
  ld_glob_func "helper"
  call indirect
}
"#;

    #[test]
    fn parse_module_test() {
        let m = parse_module("default", SOURCE).unwrap();
        assert_eq!(m.name(), "prog.c");
        assert_eq!(m.get_alias("__instrument_before_call").unwrap().aliasee(), "my_before");
        assert!(m.get_function("my_before").unwrap().is_extern());

        let helper = m.get_function("helper").unwrap().unwrap_local();
        assert_eq!(helper.linkage(), Linkage::LinkOnceOdr);
        assert_eq!(helper.all_local_count(), 2);
        assert_eq!(helper.blocks_iter().count(), 3);

        let bytes = helper.entry_block().body.iter().find_map(|i| match &i.kind {
            InstrK::LdBytes(bytes, _) => Some(bytes.clone()),
            _ => None
        });
        assert_eq!(bytes, Some(b"hi\0".to_vec()));

        let calls: Vec<_> = helper.instrs_iter().filter_map(|i| i.as_call()).collect();
        assert_eq!(calls, vec![CallTarget::Indirect]);
    }

    #[test]
    fn printed_module_parses_back_the_same() {
        let m = parse_module("default", SOURCE).unwrap();
        let mut printed = String::new();
        m.ir_print(&mut printed).unwrap();

        let reparsed = parse_module("default", &printed).unwrap();
        let mut reprinted = String::new();
        reparsed.ir_print(&mut reprinted).unwrap();

        assert_eq!(printed, reprinted);
    }

    #[test]
    fn missing_header_keeps_default_name() {
        let m = parse_module("given/path.ir", "extern func \"f\" () -> ()").unwrap();
        assert_eq!(m.name(), "given/path.ir");
    }

    #[test]
    fn names_are_printed_verbatim() {
        let mut printed = String::new();
        Module::new("[dir]/a b.ir").ir_print(&mut printed).unwrap();
        assert_eq!(printed.lines().next(), Some("module \"[dir]/a b.ir\""));
        assert_eq!(parse_module("default", &printed).unwrap().name(), "[dir]/a b.ir");

        let mut printed = String::new();
        Module::new("a\"b.ir").ir_print(&mut printed).unwrap();
        assert!(!matches!(parse_module("default", &printed), Ok(m) if m.name() == "a\"b.ir"));
    }

    #[test]
    fn unknown_instruction_is_rejected() {
        let src = "func \"f\" () -> () {\nlocals:\nb0: () -> () tag=main\n  jump b1\n}";
        assert!(matches!(
            parse_module("m", src),
            Err(IrParseError::InvalidInstructionName { got }) if got == "jump"
        ));
    }
}
