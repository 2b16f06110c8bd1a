use crate::{instr::{BlockId, BlockTag, Cmp, Function, Instr, InstrBlock, InstrK, Linkage}, module::{Functional, Module}, ty::{Ty, Type}};

/// Writes the text form read back by `irparse`.
///
/// Module, function and alias names are written between quotes as they are.
/// Names containing `"` can't be parsed back.
pub trait IRPrint {
    fn ir_print(&self, w: &mut dyn std::fmt::Write) -> std::fmt::Result;
}

fn print_ty_list(w: &mut dyn std::fmt::Write, tys: &[Ty<'_>]) -> std::fmt::Result {
    for (i, ty) in tys.iter().enumerate() {
        if i != 0 {
            write!(w, ", ")?;
        }
        ty.ir_print(w)?;
    }
    Ok(())
}

/// Print a signature as `(args) -> rets`
fn print_signature(w: &mut dyn std::fmt::Write, args: &[Ty<'_>], rets: &[Ty<'_>]) -> std::fmt::Result {
    write!(w, "(")?;
    print_ty_list(w, args)?;
    write!(w, ") -> ")?;

    if rets.len() == 1 {
        rets[0].ir_print(w) // no parantheses if there's only one return value
    } else {
        write!(w, "(")?;
        print_ty_list(w, rets)?;
        write!(w, ")")
    }
}

/// Write a byte string in quotes. Printable ASCII is written as is,
/// everything else (and `"` and `\`) as a `\XX` hex escape.
pub(crate) fn print_bytes(w: &mut dyn std::fmt::Write, bytes: &[u8]) -> std::fmt::Result {
    write!(w, "\"")?;
    for &b in bytes {
        if (0x20..0x7f).contains(&b) && b != b'"' && b != b'\\' {
            write!(w, "{}", b as char)?;
        } else {
            write!(w, "\\{:02X}", b)?;
        }
    }
    write!(w, "\"")
}

impl<'ctx> IRPrint for Type<'ctx> {
    fn ir_print(&self, w: &mut dyn std::fmt::Write) -> std::fmt::Result {
        match self {
            Type::Int8 => write!(w, "int8"),
            Type::UInt8 => write!(w, "uint8"),
            Type::Int16 => write!(w, "int16"),
            Type::UInt16 => write!(w, "uint16"),
            Type::Int32 => write!(w, "int32"),
            Type::UInt32 => write!(w, "uint32"),
            Type::Float32 => write!(w, "float32"),
            Type::Ptr => write!(w, "ptr"),
            Type::Func { args, ret } => print_signature(w, args, ret),
            Type::Struct { fields } => {
                write!(w, "struct{{")?;
                print_ty_list(w, fields)?;
                write!(w, "}}")
            }
            Type::Array { elem, len } => {
                write!(w, "[{} x ", len)?;
                elem.ir_print(w)?;
                write!(w, "]")
            }
        }
    }
}

impl<'ctx> IRPrint for Ty<'ctx> {
    #[inline]
    fn ir_print(&self, w: &mut dyn std::fmt::Write) -> std::fmt::Result { self.as_ref().ir_print(w) }
}

impl IRPrint for Cmp {
    fn ir_print(&self, w: &mut dyn std::fmt::Write) -> std::fmt::Result {
        match self {
            Cmp::Eq => write!(w, "eq"),
            Cmp::Ne => write!(w, "ne"),
            Cmp::Lt => write!(w, "lt"),
            Cmp::Le => write!(w, "le"),
            Cmp::Gt => write!(w, "gt"),
            Cmp::Ge => write!(w, "ge"),
        }
    }
}

impl<'ctx> IRPrint for Instr<'ctx> {
    fn ir_print(&self, w: &mut dyn std::fmt::Write) -> std::fmt::Result {
        match &self.kind {
            InstrK::LdInt(n, ty) => {
                write!(w, "ld.")?;
                ty.ir_print(w)?;
                write!(w, " {}", n)
            }
            InstrK::LdFloat(f) => write!(w, "ld.float {:?}", f),
            InstrK::LdBytes(bytes, _) => {
                write!(w, "ld.bytes ")?;
                print_bytes(w, bytes)
            }
            InstrK::IAdd => write!(w, "iadd"),
            InstrK::ISub => write!(w, "isub"),
            InstrK::IMul => write!(w, "imul"),
            InstrK::IDiv => write!(w, "idiv"),
            InstrK::FAdd => write!(w, "fadd"),
            InstrK::FSub => write!(w, "fsub"),
            InstrK::FMul => write!(w, "fmul"),
            InstrK::FDiv => write!(w, "fdiv"),
            InstrK::Itof => write!(w, "itof"),
            InstrK::Ftoi { int_ty } => {
                write!(w, "ftoi to ")?;
                int_ty.ir_print(w)
            }
            InstrK::ICmp(cmp) => {
                write!(w, "icmp.")?;
                cmp.ir_print(w)
            }
            InstrK::FCmp(cmp) => {
                write!(w, "fcmp.")?;
                cmp.ir_print(w)
            }
            InstrK::Not => write!(w, "not"),
            InstrK::BitAnd => write!(w, "bit_and"),
            InstrK::BitOr => write!(w, "bit_or"),
            InstrK::IConv { target } => {
                write!(w, "iconv to ")?;
                target.ir_print(w)
            }
            InstrK::CallDirect { func_name } => write!(w, "call \"{}\"", func_name),
            InstrK::LdLocal { idx } => write!(w, "ld.loc #{}", idx),
            InstrK::StLocal { idx } => write!(w, "st.loc #{}", idx),
            InstrK::LdGlobalFunc { func_name } => write!(w, "ld_glob_func \"{}\"", func_name),
            InstrK::CallIndirect => write!(w, "call indirect"),
            InstrK::Bitcast { target } => {
                write!(w, "bitcast to ")?;
                target.ir_print(w)
            }
            InstrK::IfElse { then, r#else } => {
                write!(w, "if then b{}", then.id())?;
                if let Some(else_block) = r#else {
                    write!(w, " else b{}", else_block.id())?
                }
                Ok(())
            }
            InstrK::Read { ty } => {
                write!(w, "read ")?;
                ty.ir_print(w)
            }
            InstrK::Write { ty } => {
                write!(w, "write ")?;
                ty.ir_print(w)
            }
            InstrK::Offset { ty } => {
                write!(w, "offset ")?;
                ty.ir_print(w)
            }
            InstrK::GetFieldPtr { struct_ty, field_idx } => {
                write!(w, "get_field_ptr {} ", field_idx)?;
                struct_ty.ir_print(w)
            }
            InstrK::Alloca { ty } => {
                write!(w, "alloca ")?;
                ty.ir_print(w)
            }
            InstrK::Discard => write!(w, "discard"),
            InstrK::Return => write!(w, "return"),
            InstrK::Fail => write!(w, "fail"),
            InstrK::Loop(body) => write!(w, "loop b{}", body.id()),
            InstrK::Break => write!(w, "break"),
        }?;

        writeln!(w)
    }
}

impl IRPrint for BlockId {
    fn ir_print(&self, w: &mut dyn std::fmt::Write) -> std::fmt::Result {
        write!(w, "b{}", self.id())
    }
}

impl IRPrint for BlockTag {
    fn ir_print(&self, w: &mut dyn std::fmt::Write) -> std::fmt::Result {
        match self {
            BlockTag::Undefined => write!(w, "undefined"),
            BlockTag::Main => write!(w, "main"),
            BlockTag::IfElse => write!(w, "if_else"),
            BlockTag::Loop => write!(w, "loop"),
        }
    }
}

impl<'ctx> IRPrint for InstrBlock<'ctx> {
    fn ir_print(&self, w: &mut dyn std::fmt::Write) -> std::fmt::Result {
        self.idx.ir_print(w)?;
        write!(w, ": ")?;
        print_signature(w, &[], self.returns())?;
        write!(w, " tag=")?;
        self.tag.ir_print(w)?;
        writeln!(w)?;

        for instr in &self.body {
            write!(w, "  ")?; // indentation
            instr.ir_print(w)?;
        }

        Ok(())
    }
}

impl<'ctx> IRPrint for Function<'ctx> {
    fn ir_print(&self, w: &mut dyn std::fmt::Write) -> std::fmt::Result {
        write!(w, "func ")?;
        if self.linkage() == Linkage::LinkOnceOdr {
            write!(w, "linkonce_odr ")?;
        }
        write!(w, "\"{}\" ", self.name())?;
        self.ty().ir_print(w)?;
        writeln!(w, " {{")?;

        writeln!(w, "locals:")?;
        for (loc_i, loc_ty) in self.all_locals_ty().iter().enumerate() {
            write!(w, "  #{} ", loc_i)?;
            loc_ty.ir_print(w)?;
            writeln!(w)?;
        }

        // blocks are kept in definition order
        for block in self.blocks_iter() {
            block.ir_print(w)?;
        }

        writeln!(w, "}}")
    }
}

impl<'ctx> IRPrint for Functional<'ctx> {
    fn ir_print(&self, w: &mut dyn std::fmt::Write) -> std::fmt::Result {
        match self {
            Functional::Local(f) => f.ir_print(w),
            Functional::Extern(f) => {
                write!(w, "extern func \"{}\" ", f.name())?;
                f.ty().ir_print(w)?;
                writeln!(w)
            }
        }
    }
}

impl<'ctx> IRPrint for Module<'ctx> {
    fn ir_print(&self, w: &mut dyn std::fmt::Write) -> std::fmt::Result {
        writeln!(w, "module \"{}\"", self.name())?;

        for (name, alias) in self.aliases_iter() {
            writeln!(w)?;
            write!(w, "alias \"{}\" = \"{}\" as ", name, alias.aliasee())?;
            alias.ty().ir_print(w)?;
            writeln!(w)?;
        }

        for f in self.functions_iter() {
            writeln!(w)?;
            f.ir_print(w)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{builder::{FunctionBuilder, InstrBuilder}, module::Module, ty::Type};

    use super::{print_bytes, IRPrint};

    #[test]
    fn bytes_are_escaped() {
        let mut out = String::new();
        print_bytes(&mut out, b"[m]\"g\"\\\0").unwrap();
        assert_eq!(out, r#""[m]\22g\22\5C\00""#);
    }

    #[test]
    fn module_print_test() {
        let mut m = Module::new("main.c");
        let ptr = m.ptr_t();
        let hook_ty = m.intern_type(Type::Func { args: vec![ptr], ret: vec![] });
        m.get_or_insert_function("puts", hook_ty).unwrap();

        let mut builder = FunctionBuilder::new("main".to_string(), [], [m.int32t()]);
        builder.i_ld_int(7, m.int32t());
        builder.i_return();
        builder.finish(&mut m).unwrap();

        let mut out = String::new();
        m.ir_print(&mut out).unwrap();
        assert_eq!(out, "\
module \"main.c\"

extern func \"puts\" (ptr) -> ()

func \"main\" () -> int32 {
locals:
b0: () -> int32 tag=main
  ld.int32 7
  return
}
");
    }
}
