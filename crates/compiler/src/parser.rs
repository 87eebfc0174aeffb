//! Recursive-descent parser.
//!
//! There is no syntax tree. Declarations mutate the symbol tables, and each
//! expression production drives the code generator directly through the
//! value stack, so code is emitted the moment a construct is recognized.
//! The contract with the generator: every expression production leaves
//! exactly one entry on the value stack, every statement leaves it empty.
//!
//! Error recovery is per statement. Syntactic problems are reported and the
//! offending token skipped; semantic problems raised by the generator abort
//! the current statement, the value stack is cleared, and parsing resumes.

use crate::codegen::{BinOp, CodeGen, RegClass, Storage};
use crate::error::CodeGenError;
use crate::lexer::{Keyword, Lexer, Op, Tok};
use crate::section::SectionKind;
use crate::symbols::{Scoped, SymTable};
use crate::types::{
    BT_BYTE, BT_DOUBLE, BT_FLOAT, BT_FUNC, BT_INT, BT_LDOUBLE, BT_LLONG, BT_LONG, BT_SHORT,
    BT_VOID, TypeWord, VT_ARRAY, VT_CONSTANT, VT_DEFSIGN, VT_EXTERN, VT_INLINE, VT_STATIC,
    VT_TYPEDEF, VT_UNSIGNED, VT_VOLATILE,
};

/// Parser state: the token stream, the code generator, and the symbol
/// stacks (macro defines, globals, locals; labels live with the generator).
pub struct Parser {
    pub lex: Lexer,
    pub cg: CodeGen,
    /// Macro definitions; the preprocessor is a stub in this revision.
    pub defines: SymTable,
    pub globals: SymTable,
    pub locals: SymTable,
    /// Return type of the function being compiled.
    func_ret: TypeWord,
}

impl Parser {
    pub fn new(lex: Lexer) -> Parser {
        Parser {
            lex,
            cg: CodeGen::new(),
            defines: SymTable::new(),
            globals: SymTable::new(),
            locals: SymTable::new(),
            func_ret: TypeWord::INT,
        }
    }

    pub fn errors(&self) -> u32 {
        self.lex.errors
    }

    pub fn warnings(&self) -> u32 {
        self.lex.warnings
    }

    fn error(&mut self, msg: impl std::fmt::Display) {
        self.lex.error(msg);
    }

    /// `.text` offset of the defined `main` function, if there is one.
    pub fn main_offset(&self) -> Option<i64> {
        let id = self.globals.find_global("main")?;
        let sym = self.globals.get(id);
        (sym.r == 1 && sym.section == Some(SectionKind::Text)).then_some(sym.c)
    }

    /// Parse the whole translation unit.
    pub fn parse(&mut self) {
        while self.lex.tok != Tok::Eof {
            self.external_declaration();
        }
    }

    // ---- declarations ----------------------------------------------------

    fn starts_type(&self) -> bool {
        matches!(
            self.lex.tok,
            Tok::Kw(
                Keyword::Int
                    | Keyword::Char
                    | Keyword::Short
                    | Keyword::Long
                    | Keyword::Void
                    | Keyword::Float
                    | Keyword::Double
                    | Keyword::Signed
                    | Keyword::Unsigned
                    | Keyword::Const
                    | Keyword::Volatile
                    | Keyword::Static
                    | Keyword::Extern
                    | Keyword::Inline
                    | Keyword::Typedef
                    | Keyword::Struct
                    | Keyword::Union
                    | Keyword::Enum
                    | Keyword::Auto
                    | Keyword::Register
            )
        )
    }

    /// Accumulate type specifiers. Returns `None` when no type keyword was
    /// seen at all.
    fn parse_type(&mut self) -> Option<TypeWord> {
        let mut base: Option<u64> = None;
        let mut longs = 0u32;
        let mut flags = 0u64;
        let mut seen = false;

        loop {
            let Tok::Kw(kw) = self.lex.tok else { break };
            match kw {
                Keyword::Int => {
                    self.lex.next();
                    base.get_or_insert(BT_INT);
                }
                Keyword::Char => {
                    self.lex.next();
                    base = Some(BT_BYTE);
                }
                Keyword::Short => {
                    self.lex.next();
                    base = Some(BT_SHORT);
                }
                Keyword::Long => {
                    self.lex.next();
                    longs += 1;
                }
                Keyword::Void => {
                    self.lex.next();
                    base = Some(BT_VOID);
                }
                Keyword::Float => {
                    self.lex.next();
                    base = Some(BT_FLOAT);
                }
                Keyword::Double => {
                    self.lex.next();
                    base = Some(BT_DOUBLE);
                }
                Keyword::Signed => {
                    self.lex.next();
                    flags |= VT_DEFSIGN;
                }
                Keyword::Unsigned => {
                    self.lex.next();
                    flags |= VT_UNSIGNED | VT_DEFSIGN;
                }
                Keyword::Const => {
                    self.lex.next();
                    flags |= VT_CONSTANT;
                }
                Keyword::Volatile => {
                    self.lex.next();
                    flags |= VT_VOLATILE;
                }
                Keyword::Extern => {
                    self.lex.next();
                    flags |= VT_EXTERN;
                }
                Keyword::Static => {
                    self.lex.next();
                    flags |= VT_STATIC;
                }
                Keyword::Inline => {
                    self.lex.next();
                    flags |= VT_INLINE;
                }
                Keyword::Typedef => {
                    self.lex.next();
                    self.error("typedef is not supported in this revision");
                    flags |= VT_TYPEDEF;
                }
                Keyword::Auto | Keyword::Register => {
                    self.lex.next();
                }
                Keyword::Struct | Keyword::Union | Keyword::Enum => {
                    self.lex.next();
                    self.error(format_args!(
                        "'{}' types are not supported in this revision",
                        match kw {
                            Keyword::Struct => "struct",
                            Keyword::Union => "union",
                            _ => "enum",
                        }
                    ));
                    if matches!(self.lex.tok, Tok::Ident(_)) {
                        self.lex.next();
                    }
                    if self.lex.is(Op::LBrace) {
                        self.skip_braces();
                    }
                    base = Some(BT_INT);
                }
                _ => break,
            }
            seen = true;
        }

        if !seen {
            return None;
        }
        let base = match longs {
            0 => base.unwrap_or(BT_INT),
            1 => match base {
                Some(BT_DOUBLE) => BT_LDOUBLE,
                _ => BT_LONG,
            },
            _ => BT_LLONG,
        };
        Some(TypeWord(base | flags))
    }

    /// Skip a balanced `{ ... }` group; used by the struct/union/enum stub.
    fn skip_braces(&mut self) {
        let mut depth = 0u32;
        loop {
            match self.lex.tok {
                Tok::Op(Op::LBrace) => {
                    depth += 1;
                    self.lex.next();
                }
                Tok::Op(Op::RBrace) => {
                    self.lex.next();
                    depth -= 1;
                    if depth == 0 {
                        return;
                    }
                }
                Tok::Eof => return,
                _ => self.lex.next(),
            }
        }
    }

    /// Pointer stars and the declared name, which an abstract declarator
    /// (parameter or cast) may omit.
    fn declarator(&mut self, base: TypeWord) -> (TypeWord, Option<String>) {
        let mut ty = base;
        while self.lex.consume(Op::Star) {
            ty = ty.pointer_to();
            while matches!(self.lex.tok, Tok::Kw(Keyword::Const | Keyword::Volatile)) {
                self.lex.next();
            }
        }
        let name = if matches!(self.lex.tok, Tok::Ident(_)) {
            let Tok::Ident(name) = std::mem::replace(&mut self.lex.tok, Tok::Eof) else {
                unreachable!()
            };
            self.lex.next();
            Some(name)
        } else {
            None
        };
        (ty, name)
    }

    fn external_declaration(&mut self) {
        let Some(base) = self.parse_type() else {
            let found = self.lex.tok.clone();
            self.error(format_args!("declaration expected, found {}", found));
            if self.lex.tok != Tok::Eof {
                self.lex.next();
            }
            return;
        };
        if self.lex.consume(Op::Semi) {
            return;
        }
        loop {
            let (ty, name) = self.declarator(base);
            let Some(name) = name else {
                self.error("identifier expected in declaration");
                return;
            };
            if self.lex.is(Op::LParen) {
                let params = self.parse_params();
                if self.lex.is(Op::LBrace) {
                    self.function_definition(ty, &name, &params);
                    return;
                }
                if self.globals.find_global(&name).is_none() {
                    let id = self.globals.push(&name, TypeWord(BT_FUNC), 0, 0);
                    self.globals.get_mut(id).section = Some(SectionKind::Text);
                }
            } else {
                self.global_variable(ty, &name);
            }
            if !self.lex.consume(Op::Comma) {
                self.lex.expect(Op::Semi);
                return;
            }
        }
    }

    /// Parse `( [type declarator [, ...]] )`; array parameters decay to
    /// pointers. Names may be omitted in prototypes.
    fn parse_params(&mut self) -> Vec<(TypeWord, Option<String>)> {
        self.lex.next(); // past '('
        let mut params = Vec::new();
        if self.lex.consume(Op::RParen) {
            return params;
        }
        loop {
            if self.lex.consume(Op::Ellipsis) {
                self.error("variadic functions are not supported in this revision");
                break;
            }
            let Some(base) = self.parse_type() else {
                let found = self.lex.tok.clone();
                self.error(format_args!("parameter type expected, found {}", found));
                if self.lex.tok != Tok::Eof {
                    self.lex.next();
                }
                break;
            };
            let (ty, name) = self.declarator(base);
            params.push((ty.without(VT_ARRAY), name));
            if !self.lex.consume(Op::Comma) {
                break;
            }
        }
        self.lex.expect(Op::RParen);
        // `(void)` declares no parameters
        if params.len() == 1 && params[0].0 == TypeWord::VOID && params[0].1.is_none() {
            params.clear();
        }
        params
    }

    /// Install the function symbol at the current text offset, emit the
    /// prologue, compile the body, and close with the epilogue. Parameters
    /// live in the caller's frame starting at +16, past the saved return
    /// address and rbp.
    fn function_definition(&mut self, ret: TypeWord, name: &str, params: &[(TypeWord, Option<String>)]) {
        let offset = self.cg.text.len() as i64;
        let id = match self.globals.find_global(name) {
            Some(id) => {
                if self.globals.get(id).r == 1 {
                    self.error(format_args!("redefinition of '{}'", name));
                }
                id
            }
            None => self.globals.push(name, TypeWord(BT_FUNC), 0, 0),
        };
        let sym = self.globals.get_mut(id);
        sym.r = 1;
        sym.c = offset;
        sym.section = Some(SectionKind::Text);

        tracing::debug!(function = name, offset, "compiling function");
        self.func_ret = ret;
        let marker = self.locals.mark();
        for (i, (ty, pname)) in params.iter().enumerate() {
            if let Some(pname) = pname {
                self.locals.push(pname, *ty, 0, 16 + 8 * i as i64);
            }
        }
        self.cg.gfunc_prolog();
        self.block();
        self.cg.gfunc_epilog();
        self.locals.pop(marker);
    }

    /// A file-scope variable: storage in `.data`, zeroed unless a constant
    /// initializer is given. `extern` declarations get a symbol but no
    /// storage.
    fn global_variable(&mut self, ty: TypeWord, name: &str) {
        let mut ty = ty;
        let mut count: i64 = 1;
        let elem = ty;
        if self.lex.consume(Op::LBracket) {
            count = self.const_array_len();
            self.lex.expect(Op::RBracket);
            ty = elem.pointer_to().with(VT_ARRAY);
        }

        if ty.0 & VT_EXTERN != 0 {
            let id = self.globals.push(name, ty, 0, 0);
            self.globals.get_mut(id).section = Some(SectionKind::Data);
            return;
        }

        let size = elem.size() * count.max(1) as usize;
        let align = elem.size().clamp(1, 8);
        let data = &mut self.cg.data;
        let pad = (align - data.len() % align) % align;
        data.reserve(pad);
        let offset = if self.lex.consume(Op::Assign) {
            if ty.is_array() {
                self.error("array initializers are not supported in this revision");
                self.const_int_initializer();
                self.cg.data.reserve(size) as i64
            } else {
                let value = self.const_int_initializer();
                let bytes = value.to_le_bytes();
                self.cg.data.add(&bytes[..elem.size().min(8)]) as i64
            }
        } else {
            self.cg.data.reserve(size) as i64
        };
        let id = self.globals.push(name, ty, 0, offset);
        self.globals.get_mut(id).section = Some(SectionKind::Data);
    }

    fn const_array_len(&mut self) -> i64 {
        if let Tok::Int(n) = self.lex.tok {
            self.lex.next();
            return n;
        }
        let found = self.lex.tok.clone();
        self.error(format_args!("constant array length expected, found {}", found));
        if self.lex.tok != Tok::Eof {
            self.lex.next();
        }
        1
    }

    /// Global initializers are restricted to integer literals with an
    /// optional sign.
    fn const_int_initializer(&mut self) -> i64 {
        let neg = self.lex.consume(Op::Minus);
        match self.lex.tok {
            Tok::Int(v) => {
                self.lex.next();
                if neg { v.wrapping_neg() } else { v }
            }
            _ => {
                let found = self.lex.tok.clone();
                self.error(format_args!("constant initializer expected, found {}", found));
                if self.lex.tok != Tok::Eof {
                    self.lex.next();
                }
                0
            }
        }
    }

    /// Local declarations allocate frame slots below the frame pointer;
    /// every scalar takes an 8-byte slot, arrays take their rounded size.
    fn local_declaration(&mut self) {
        let Some(base) = self.parse_type() else { return };
        if self.lex.consume(Op::Semi) {
            return;
        }
        loop {
            let (mut ty, name) = self.declarator(base);
            let Some(name) = name else {
                self.error("identifier expected in declaration");
                return;
            };
            let elem = ty;
            let mut size = ty.size() as i64;
            if self.lex.consume(Op::LBracket) {
                let count = self.const_array_len();
                self.lex.expect(Op::RBracket);
                ty = elem.pointer_to().with(VT_ARRAY);
                size = elem.size() as i64 * count.max(1);
            }
            self.cg.loc -= (size + 7) & !7;
            let offset = self.cg.loc;
            self.locals.push(&name, ty, 0, offset);

            if self.lex.consume(Op::Assign) {
                if ty.is_array() {
                    self.error("array initializers are not supported in this revision");
                    if let Err(e) = self.discard_initializer() {
                        let msg = e.to_string();
                        self.error(msg);
                        self.cg.clear_vstack();
                    }
                } else if let Err(e) = self.init_local(ty, offset) {
                    let msg = e.to_string();
                    self.error(msg);
                    self.cg.clear_vstack();
                }
            }
            if !self.lex.consume(Op::Comma) {
                self.lex.expect(Op::Semi);
                return;
            }
        }
    }

    fn init_local(&mut self, ty: TypeWord, offset: i64) -> Result<(), CodeGenError> {
        self.cg.vset(ty, Storage::Local(offset), true)?;
        self.expr_assign()?;
        self.cg.gen_assign()?;
        self.cg.vpop()?;
        Ok(())
    }

    /// Parse and drop an initializer expression, keeping the token stream
    /// in sync after a reported initializer error.
    fn discard_initializer(&mut self) -> Result<(), CodeGenError> {
        self.expr_assign()?;
        self.cg.vpop()?;
        Ok(())
    }

    // ---- statements ------------------------------------------------------

    fn block(&mut self) {
        self.lex.expect(Op::LBrace);
        let marker = self.locals.mark();
        loop {
            if self.lex.consume(Op::RBrace) {
                break;
            }
            if self.lex.tok == Tok::Eof {
                self.error("'}' expected");
                break;
            }
            self.declaration_or_statement();
        }
        self.locals.pop(marker);
    }

    fn declaration_or_statement(&mut self) {
        if self.starts_type() {
            self.local_declaration();
        } else if let Err(e) = self.stmt() {
            let msg = e.to_string();
            self.error(msg);
            self.cg.clear_vstack();
        }
    }

    fn stmt(&mut self) -> Result<(), CodeGenError> {
        if self.lex.consume(Op::Semi) {
            return Ok(());
        }
        if self.lex.is(Op::LBrace) {
            self.block();
            return Ok(());
        }
        if let Tok::Kw(kw) = &self.lex.tok {
            match *kw {
                Keyword::If => return self.stmt_if(),
                Keyword::While => return self.stmt_while(),
                Keyword::For => return self.stmt_for(),
                Keyword::Do => return self.stmt_do(),
                Keyword::Return => return self.stmt_return(),
                Keyword::Break | Keyword::Continue => {
                    // parsed but not wired to the enclosing loop yet
                    self.lex.next();
                    self.lex.expect(Op::Semi);
                    return Ok(());
                }
                _ => {}
            }
        }
        self.expr()?;
        self.cg.vpop()?;
        self.lex.expect(Op::Semi);
        Ok(())
    }

    fn stmt_if(&mut self) -> Result<(), CodeGenError> {
        self.lex.next();
        self.lex.expect(Op::LParen);
        self.expr()?;
        self.lex.expect(Op::RParen);
        let l_else = self.cg.gind();
        self.cg.gtst(true, l_else)?;
        self.stmt()?;
        if matches!(self.lex.tok, Tok::Kw(Keyword::Else)) {
            self.lex.next();
            let l_end = self.cg.gind();
            self.cg.gjmp(l_end);
            self.cg.glabel(l_else);
            self.stmt()?;
            self.cg.glabel(l_end);
        } else {
            self.cg.glabel(l_else);
        }
        Ok(())
    }

    fn stmt_while(&mut self) -> Result<(), CodeGenError> {
        self.lex.next();
        self.lex.expect(Op::LParen);
        let l_top = self.cg.gind();
        self.cg.glabel(l_top);
        self.expr()?;
        self.lex.expect(Op::RParen);
        let l_end = self.cg.gind();
        self.cg.gtst(true, l_end)?;
        self.stmt()?;
        self.cg.gjmp(l_top);
        self.cg.glabel(l_end);
        Ok(())
    }

    /// `for` emits the post expression before the body, with jumps wiring
    /// the pieces into source order, so everything stays single pass.
    fn stmt_for(&mut self) -> Result<(), CodeGenError> {
        self.lex.next();
        self.lex.expect(Op::LParen);
        if !self.lex.is(Op::Semi) {
            self.expr()?;
            self.cg.vpop()?;
        }
        self.lex.expect(Op::Semi);

        let l_cond = self.cg.gind();
        self.cg.glabel(l_cond);
        let l_end = self.cg.gind();
        if !self.lex.is(Op::Semi) {
            self.expr()?;
            self.cg.gtst(true, l_end)?;
        }
        self.lex.expect(Op::Semi);

        let l_body = self.cg.gind();
        let l_post = self.cg.gind();
        self.cg.gjmp(l_body);
        self.cg.glabel(l_post);
        if !self.lex.is(Op::RParen) {
            self.expr()?;
            self.cg.vpop()?;
        }
        self.lex.expect(Op::RParen);
        self.cg.gjmp(l_cond);

        self.cg.glabel(l_body);
        self.stmt()?;
        self.cg.gjmp(l_post);
        self.cg.glabel(l_end);
        Ok(())
    }

    fn stmt_do(&mut self) -> Result<(), CodeGenError> {
        self.lex.next();
        let l_top = self.cg.gind();
        self.cg.glabel(l_top);
        self.stmt()?;
        if matches!(self.lex.tok, Tok::Kw(Keyword::While)) {
            self.lex.next();
        } else {
            let found = self.lex.tok.clone();
            self.error(format_args!("'while' expected, found {}", found));
        }
        self.lex.expect(Op::LParen);
        self.expr()?;
        self.lex.expect(Op::RParen);
        self.lex.expect(Op::Semi);
        self.cg.gtst(false, l_top)
    }

    fn stmt_return(&mut self) -> Result<(), CodeGenError> {
        self.lex.next();
        if !self.lex.is(Op::Semi) {
            if self.func_ret.base() == BT_VOID {
                self.lex.warning("'return' with a value in a void function");
            }
            self.expr()?;
            self.cg.gv(RegClass::Rax)?;
            self.cg.vpop()?;
        }
        self.lex.expect(Op::Semi);
        self.cg.gfunc_epilog();
        Ok(())
    }

    // ---- expressions -----------------------------------------------------

    /// Full expression, including the comma operator.
    fn expr(&mut self) -> Result<(), CodeGenError> {
        self.expr_assign()?;
        while self.lex.consume(Op::Comma) {
            self.cg.vpop()?;
            self.expr_assign()?;
        }
        Ok(())
    }

    fn expr_assign(&mut self) -> Result<(), CodeGenError> {
        self.expr_lor()?;
        let op = match &self.lex.tok {
            Tok::Op(
                op @ (Op::Assign
                | Op::AddAssign
                | Op::SubAssign
                | Op::MulAssign
                | Op::DivAssign
                | Op::ModAssign
                | Op::AndAssign
                | Op::OrAssign
                | Op::XorAssign
                | Op::ShlAssign
                | Op::ShrAssign),
            ) => Some(*op),
            _ => None,
        };
        if op.is_some() {
            // compound assignments are lowered as plain assignment in this
            // revision; the operator part is dropped
            self.lex.next();
            self.expr_assign()?;
            self.cg.gen_assign()?;
        }
        Ok(())
    }

    fn expr_lor(&mut self) -> Result<(), CodeGenError> {
        self.expr_land()?;
        if self.lex.is(Op::OrOr) {
            let mut chain = -1i64;
            while self.lex.consume(Op::OrOr) {
                chain = self.cg.gvtst(false, chain)?;
                self.expr_land()?;
            }
            chain = self.cg.gvtst(false, chain)?;
            self.cg.vset_branch(false, chain)?;
        }
        Ok(())
    }

    fn expr_land(&mut self) -> Result<(), CodeGenError> {
        self.expr_bor()?;
        if self.lex.is(Op::AndAnd) {
            let mut chain = -1i64;
            while self.lex.consume(Op::AndAnd) {
                chain = self.cg.gvtst(true, chain)?;
                self.expr_bor()?;
            }
            chain = self.cg.gvtst(true, chain)?;
            self.cg.vset_branch(true, chain)?;
        }
        Ok(())
    }

    fn expr_bor(&mut self) -> Result<(), CodeGenError> {
        self.expr_bxor()?;
        while self.lex.consume(Op::Pipe) {
            self.expr_bxor()?;
            self.cg.gen_op(BinOp::Or)?;
        }
        Ok(())
    }

    fn expr_bxor(&mut self) -> Result<(), CodeGenError> {
        self.expr_band()?;
        while self.lex.consume(Op::Caret) {
            self.expr_band()?;
            self.cg.gen_op(BinOp::Xor)?;
        }
        Ok(())
    }

    fn expr_band(&mut self) -> Result<(), CodeGenError> {
        self.expr_eq()?;
        while self.lex.consume(Op::Amp) {
            self.expr_eq()?;
            self.cg.gen_op(BinOp::And)?;
        }
        Ok(())
    }

    fn expr_eq(&mut self) -> Result<(), CodeGenError> {
        self.expr_rel()?;
        loop {
            let op = if self.lex.consume(Op::Eq) {
                BinOp::Eq
            } else if self.lex.consume(Op::Ne) {
                BinOp::Ne
            } else {
                break;
            };
            self.expr_rel()?;
            self.cg.gen_op(op)?;
        }
        Ok(())
    }

    fn expr_rel(&mut self) -> Result<(), CodeGenError> {
        self.expr_shift()?;
        loop {
            let op = if self.lex.consume(Op::Lt) {
                BinOp::Lt
            } else if self.lex.consume(Op::Gt) {
                BinOp::Gt
            } else if self.lex.consume(Op::Le) {
                BinOp::Le
            } else if self.lex.consume(Op::Ge) {
                BinOp::Ge
            } else {
                break;
            };
            self.expr_shift()?;
            self.cg.gen_op(op)?;
        }
        Ok(())
    }

    fn expr_shift(&mut self) -> Result<(), CodeGenError> {
        self.expr_add()?;
        loop {
            let op = if self.lex.consume(Op::Shl) {
                BinOp::Shl
            } else if self.lex.consume(Op::Shr) {
                BinOp::Shr
            } else {
                break;
            };
            self.expr_add()?;
            self.cg.gen_op(op)?;
        }
        Ok(())
    }

    fn expr_add(&mut self) -> Result<(), CodeGenError> {
        self.expr_mul()?;
        loop {
            let op = if self.lex.consume(Op::Plus) {
                BinOp::Add
            } else if self.lex.consume(Op::Minus) {
                BinOp::Sub
            } else {
                break;
            };
            self.expr_mul()?;
            self.cg.gen_op(op)?;
        }
        Ok(())
    }

    fn expr_mul(&mut self) -> Result<(), CodeGenError> {
        self.expr_unary()?;
        loop {
            let op = if self.lex.consume(Op::Star) {
                BinOp::Mul
            } else if self.lex.consume(Op::Slash) {
                BinOp::Div
            } else if self.lex.consume(Op::Percent) {
                BinOp::Mod
            } else {
                break;
            };
            self.expr_unary()?;
            self.cg.gen_op(op)?;
        }
        Ok(())
    }

    fn expr_unary(&mut self) -> Result<(), CodeGenError> {
        if self.lex.consume(Op::Minus) {
            self.expr_unary()?;
            return self.cg.gen_neg();
        }
        if self.lex.consume(Op::Plus) {
            return self.expr_unary();
        }
        if self.lex.consume(Op::Not) {
            self.expr_unary()?;
            return self.cg.gen_not();
        }
        if self.lex.consume(Op::Tilde) {
            self.expr_unary()?;
            return self.cg.gen_bnot();
        }
        if self.lex.consume(Op::Star) {
            self.expr_unary()?;
            return self.indir();
        }
        if self.lex.consume(Op::Amp) {
            self.expr_unary()?;
            return self.addr_of();
        }
        if self.lex.consume(Op::Inc) {
            self.expr_unary()?;
            return self.cg.gen_incdec(false, true);
        }
        if self.lex.consume(Op::Dec) {
            self.expr_unary()?;
            return self.cg.gen_incdec(false, false);
        }
        if matches!(self.lex.tok, Tok::Kw(Keyword::Sizeof)) {
            return self.parse_sizeof();
        }
        if self.lex.consume(Op::LParen) {
            if self.starts_type() {
                // cast
                let base = self.parse_type().expect("type specifier present");
                let mut ty = base;
                while self.lex.consume(Op::Star) {
                    ty = ty.pointer_to();
                }
                self.lex.expect(Op::RParen);
                self.expr_unary()?;
                return self.cg.gen_cast(ty);
            }
            self.expr()?;
            self.lex.expect(Op::RParen);
            return self.postfix();
        }
        self.primary()?;
        self.postfix()
    }

    /// `sizeof (type)` or `sizeof expr`. For an expression operand the
    /// operand is parsed normally and discarded, so its side effects may be
    /// emitted as dead code.
    fn parse_sizeof(&mut self) -> Result<(), CodeGenError> {
        self.lex.next();
        let size = if self.lex.consume(Op::LParen) {
            if self.starts_type() {
                let base = self.parse_type().expect("type specifier present");
                let mut ty = base;
                while self.lex.consume(Op::Star) {
                    ty = ty.pointer_to();
                }
                self.lex.expect(Op::RParen);
                ty.size()
            } else {
                self.expr()?;
                self.lex.expect(Op::RParen);
                let size = self.cg.vtop()?.ty.size();
                self.cg.vpop()?;
                size
            }
        } else {
            self.expr_unary()?;
            let size = self.cg.vtop()?.ty.size();
            self.cg.vpop()?;
            size
        };
        self.cg.vset(TypeWord::INT, Storage::Const(size as i64), false)
    }

    /// Turn the pointer on top of the stack into the cell it points at.
    fn indir(&mut self) -> Result<(), CodeGenError> {
        let v = *self.cg.vtop()?;
        if !v.ty.is_pointer() {
            return Err("pointer expected as dereference operand".into());
        }
        if v.lval || matches!(v.storage, Storage::Const(_)) {
            self.cg.gv(RegClass::Int)?;
        }
        let top = self.cg.vtop()?;
        top.ty = v.ty.deref();
        top.lval = true;
        Ok(())
    }

    fn addr_of(&mut self) -> Result<(), CodeGenError> {
        let v = *self.cg.vtop()?;
        if !v.lval {
            return Err("lvalue required as unary '&' operand".into());
        }
        let top = self.cg.vtop()?;
        top.lval = false;
        top.ty = v.ty.pointer_to();
        Ok(())
    }

    fn postfix(&mut self) -> Result<(), CodeGenError> {
        loop {
            if self.lex.consume(Op::LParen) {
                let mut nargs = 0;
                if !self.lex.consume(Op::RParen) {
                    loop {
                        self.expr_assign()?;
                        nargs += 1;
                        if !self.lex.consume(Op::Comma) {
                            break;
                        }
                    }
                    self.lex.expect(Op::RParen);
                }
                self.cg.gfunc_call(nargs)?;
            } else if self.lex.consume(Op::LBracket) {
                self.expr()?;
                self.lex.expect(Op::RBracket);
                self.cg.gen_op(BinOp::Add)?;
                self.indir()?;
            } else if self.lex.consume(Op::Dot) || self.lex.consume(Op::Arrow) {
                if matches!(self.lex.tok, Tok::Ident(_)) {
                    self.lex.next();
                }
                return Err("struct member access is not supported in this revision".into());
            } else if self.lex.consume(Op::Inc) {
                self.cg.gen_incdec(true, true)?;
            } else if self.lex.consume(Op::Dec) {
                self.cg.gen_incdec(true, false)?;
            } else {
                return Ok(());
            }
        }
    }

    fn primary(&mut self) -> Result<(), CodeGenError> {
        let tok = std::mem::replace(&mut self.lex.tok, Tok::Eof);
        match tok {
            Tok::Int(v) => {
                self.lex.next();
                let ty = if i32::try_from(v).is_ok() {
                    TypeWord::INT
                } else {
                    TypeWord(BT_LLONG)
                };
                self.cg.vset(ty, Storage::Const(v), false)
            }
            Tok::Float(_) => {
                self.lex.next();
                self.error("floating-point constants are not supported in this revision");
                self.cg.vset(TypeWord::INT, Storage::Const(0), false)
            }
            Tok::Str(bytes) => {
                self.lex.next();
                self.cg.add_string(&bytes)
            }
            Tok::Ident(name) => {
                self.lex.next();
                self.push_ident(&name)
            }
            other => {
                let msg = format!("expression expected, found {}", other);
                self.lex.tok = other;
                self.error(msg);
                if self.lex.tok != Tok::Eof {
                    self.lex.next();
                }
                self.cg.vset(TypeWord::INT, Storage::Const(0), false)
            }
        }
    }

    /// Push the value of a name, resolved local-then-global; an undeclared
    /// name is implicitly declared as a function returning int.
    fn push_ident(&mut self, name: &str) -> Result<(), CodeGenError> {
        match self.locals.find_scoped(&self.globals, name) {
            Some(Scoped::Local(id)) => {
                let sym = self.locals.get(id);
                let lval = !sym.ty.is_array();
                self.cg.vset(sym.ty, Storage::Local(sym.c), lval)
            }
            Some(Scoped::Global(id)) => {
                let sym = self.globals.get(id);
                if sym.ty.is_func() {
                    let offset = sym.c;
                    self.cg.vset(
                        sym.ty,
                        Storage::Addr { section: SectionKind::Text, offset },
                        false,
                    )
                } else {
                    let (ty, offset, lval) = (sym.ty, sym.c, !sym.ty.is_array());
                    self.cg.vset(ty, Storage::Addr { section: SectionKind::Data, offset }, lval)
                }
            }
            None => {
                self.lex
                    .warning(format_args!("implicit declaration of function '{}'", name));
                let id = self.globals.push(name, TypeWord(BT_FUNC), 0, 0);
                self.globals.get_mut(id).section = Some(SectionKind::Text);
                self.cg.vset(
                    TypeWord(BT_FUNC),
                    Storage::Addr { section: SectionKind::Text, offset: 0 },
                    false,
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(source: &str) -> Parser {
        let lex = Lexer::from_source("<test>", source);
        let mut parser = Parser::new(lex);
        parser.parse();
        parser
    }

    const PROLOGUE: [u8; 24] = [
        0x55, // push rbp
        0x48, 0x89, 0xE5, // mov rbp, rsp
        0x48, 0x83, 0xEC, 0x60, // sub rsp, 0x60
        0x48, 0x89, 0x4D, 0x10, // mov [rbp+0x10], rcx
        0x48, 0x89, 0x55, 0x18, // mov [rbp+0x18], rdx
        0x4C, 0x89, 0x45, 0x20, // mov [rbp+0x20], r8
        0x4C, 0x89, 0x4D, 0x28, // mov [rbp+0x28], r9
    ];
    const EPILOGUE: [u8; 5] = [0x48, 0x89, 0xEC, 0x5D, 0xC3];

    #[test]
    fn test_return_constant() {
        let p = compile("int main() { return 7; }");
        assert_eq!(p.errors(), 0);
        let mut expected = Vec::new();
        expected.extend_from_slice(&PROLOGUE);
        expected.extend_from_slice(&[0x48, 0xC7, 0xC0, 0x07, 0x00, 0x00, 0x00]); // mov rax, 7
        expected.extend_from_slice(&EPILOGUE); // return
        expected.extend_from_slice(&EPILOGUE); // function end
        assert_eq!(p.cg.text.data, expected);
        assert_eq!(p.main_offset(), Some(0));
    }

    #[test]
    fn test_value_stack_empty_after_each_program() {
        let programs = [
            "int main() { return 7; }",
            "int main() { int a = 3, b = 4; return a * b + 2; }",
            "int main() { int i = 0, s = 0; while (i < 5) { s = s + i; i = i + 1; } return s; }",
            "int add2(int a, int b) { return a + b; } int main() { return add2(10, 20); }",
            "int main() { int x = 5; if (x > 3) return 1; else return 0; }",
            "int main() { 1 + 2; 3; ; return 0; }",
        ];
        for program in programs {
            let p = compile(program);
            assert_eq!(p.errors(), 0, "program failed: {}", program);
            assert_eq!(p.cg.vstack_len(), 0, "stack not empty: {}", program);
        }
    }

    #[test]
    fn test_local_store_addresses_frame_slot() {
        let p = compile("int main() { int a = 3; return a; }");
        assert_eq!(p.errors(), 0);
        let code = &p.cg.text.data;
        // mov dword [rbp-8], eax
        assert!(code.windows(3).any(|w| w == [0x89, 0x45, 0xF8]));
        // movsxd rax, dword [rbp-8]
        assert!(code.windows(4).any(|w| w == [0x48, 0x63, 0x45, 0xF8]));
    }

    #[test]
    fn test_second_local_at_next_slot() {
        let p = compile("int main() { int a = 3, b = 4; return b; }");
        assert_eq!(p.errors(), 0);
        let code = &p.cg.text.data;
        assert!(code.windows(3).any(|w| w == [0x89, 0x45, 0xF0]));
    }

    #[test]
    fn test_char_local_uses_byte_accesses() {
        let p = compile("int main() { char c = 7; return c; }");
        assert_eq!(p.errors(), 0);
        let code = &p.cg.text.data;
        // mov byte [rbp-8], al
        assert!(code.windows(3).any(|w| w == [0x88, 0x45, 0xF8]));
        // movsx rax, byte [rbp-8]
        assert!(code.windows(5).any(|w| w == [0x48, 0x0F, 0xBE, 0x45, 0xF8]));
    }

    #[test]
    fn test_call_shadow_space_discipline() {
        let p = compile("int add2(int a, int b) { return a + b; } int main() { return add2(10, 20); }");
        assert_eq!(p.errors(), 0);
        let code = &p.cg.text.data;
        let sub = code
            .windows(4)
            .position(|w| w == [0x48, 0x83, 0xEC, 0x20])
            .expect("sub rsp, 32");
        assert_eq!(code[sub + 4], 0xE8);
        let rel = i32::from_le_bytes(code[sub + 5..sub + 9].try_into().unwrap());
        // the call resolves to add2 at offset 0
        assert_eq!((sub as i64 + 9) + rel as i64, 0);
        assert_eq!(&code[sub + 9..sub + 13], &[0x48, 0x83, 0xC4, 0x20]);
    }

    #[test]
    fn test_six_argument_call_restores_extra_stack() {
        let p = compile(
            "int f(int a, int b, int c, int d, int e, int g) { return a + b + c + d + e + g; }\n\
             int main() { return f(10, 20, 30, 40, 50, 60); }",
        );
        assert_eq!(p.errors(), 0);
        let code = &p.cg.text.data;
        // add rsp, 32 + 8*2
        assert!(code.windows(4).any(|w| w == [0x48, 0x83, 0xC4, 0x30]));
    }

    #[test]
    fn test_param_offsets_start_at_16() {
        let p = compile("int add2(int a, int b) { return a + b; }");
        assert_eq!(p.errors(), 0);
        let code = &p.cg.text.data;
        // b (the right operand, loaded first) from [rbp+0x18], a from [rbp+0x10]
        assert!(code.windows(4).any(|w| w == [0x48, 0x63, 0x45, 0x18]));
        assert!(code.windows(4).any(|w| w == [0x48, 0x63, 0x4D, 0x10]));
    }

    #[test]
    fn test_while_loop_branches_resolve() {
        let p = compile(
            "int main() { int i = 0, s = 0; while (i < 5) { s = s + i; i = i + 1; } return s; }",
        );
        assert_eq!(p.errors(), 0);
        let code = &p.cg.text.data;
        // one backward unconditional jump closes the loop
        let has_backward = code.iter().enumerate().any(|(i, &b)| {
            b == 0xE9
                && i + 5 <= code.len()
                && i32::from_le_bytes(code[i + 1..i + 5].try_into().unwrap()) < 0
        });
        assert!(has_backward);
    }

    #[test]
    fn test_if_else_both_arms_return() {
        let p = compile("int main() { int x = 5; if (x > 3) return 1; else return 0; }");
        assert_eq!(p.errors(), 0);
        // jne/jle with a forward displacement appears before the first return
        let code = &p.cg.text.data;
        assert!(code.windows(2).any(|w| w[0] == 0x0F && (0x80..0x90).contains(&w[1])));
    }

    #[test]
    fn test_for_and_do_while() {
        let p = compile(
            "int main() { int s = 0, i; for (i = 0; i < 3; i = i + 1) s = s + i;\n\
             do { s = s + 1; } while (s < 10); return s; }",
        );
        assert_eq!(p.errors(), 0);
        assert_eq!(p.cg.vstack_len(), 0);
    }

    #[test]
    fn test_break_continue_accepted() {
        let p = compile("int main() { while (1) { break; continue; } return 0; }");
        assert_eq!(p.errors(), 0);
    }

    #[test]
    fn test_logical_operators() {
        let p = compile("int main() { int a = 1, b = 0; return a && b || !a; }");
        assert_eq!(p.errors(), 0);
        assert_eq!(p.cg.vstack_len(), 0);
    }

    #[test]
    fn test_pointers_and_address_of() {
        let p = compile("int main() { int a; int *p; p = &a; *p = 3; return *p; }");
        assert_eq!(p.errors(), 0);
        let code = &p.cg.text.data;
        // lea rax, [rbp-8]
        assert!(code.windows(4).any(|w| w == [0x48, 0x8D, 0x45, 0xF8]));
    }

    #[test]
    fn test_array_indexing_scales() {
        let p = compile("int main() { int a[4]; a[2] = 9; return a[2]; }");
        assert_eq!(p.errors(), 0);
        let code = &p.cg.text.data;
        // the index is scaled by sizeof(int): imul r, r, 4
        assert!(code.windows(2).any(|w| w == [0x48, 0x6B]));
    }

    #[test]
    fn test_string_literal_in_rdata() {
        let p = compile("int main() { char *s; s = \"hi\"; return 0; }");
        assert_eq!(p.errors(), 0);
        let rdata = p.cg.rdata.as_ref().expect("rdata created");
        assert_eq!(rdata.data, b"hi\0");
        assert_eq!(p.cg.addr_patches.len(), 1);
        assert_eq!(p.cg.addr_patches[0].section, SectionKind::Rdata);
    }

    #[test]
    fn test_global_variable_storage_and_load() {
        let p = compile("int g = 5; int main() { return g; }");
        assert_eq!(p.errors(), 0);
        assert_eq!(&p.cg.data.data, &[5, 0, 0, 0]);
        // loading g goes through an absolute address patch
        assert_eq!(p.cg.addr_patches.len(), 1);
        assert_eq!(p.cg.addr_patches[0].section, SectionKind::Data);
    }

    #[test]
    fn test_global_array_reserved_zeroed() {
        let p = compile("int tab[3]; int main() { return tab[0]; }");
        assert_eq!(p.errors(), 0);
        assert_eq!(p.cg.data.data, vec![0; 12]);
    }

    #[test]
    fn test_sizeof_forms() {
        let p = compile("int main() { return sizeof(int) + sizeof(char) + sizeof(int *); }");
        assert_eq!(p.errors(), 0);
        let p = compile("int main() { int a; return sizeof a; }");
        assert_eq!(p.errors(), 0);
    }

    #[test]
    fn test_cast_updates_type() {
        let p = compile("int main() { char c = 7; return (int)c + (char)300; }");
        assert_eq!(p.errors(), 0);
    }

    #[test]
    fn test_increment_decrement() {
        let p = compile("int main() { int i = 0; i++; ++i; i--; --i; return i++; }");
        assert_eq!(p.errors(), 0);
        assert_eq!(p.cg.vstack_len(), 0);
    }

    #[test]
    fn test_compound_assignment_parses_as_plain() {
        let p = compile("int main() { int a = 1; a += 2; a <<= 1; return a; }");
        assert_eq!(p.errors(), 0);
    }

    #[test]
    fn test_implicit_function_declaration() {
        let p = compile("int main() { return probe(); }");
        assert_eq!(p.errors(), 0);
        assert!(p.warnings() >= 1);
        let id = p.globals.find("probe").expect("implicitly declared");
        assert!(p.globals.get(id).ty.is_func());
    }

    #[test]
    fn test_forward_call_uses_stale_offset() {
        // calls before the definition resolve against c at emission time
        let p = compile("int main() { return f(); } int f() { return 3; }");
        assert_eq!(p.errors(), 0);
        let code = &p.cg.text.data;
        let call = code.iter().position(|&b| b == 0xE8).unwrap();
        let rel = i32::from_le_bytes(code[call + 1..call + 5].try_into().unwrap());
        // target computed from offset 0, not the later definition
        assert_eq!((call as i64 + 5) + rel as i64, 0);
    }

    #[test]
    fn test_struct_stub_reports_error() {
        let p = compile("struct point { int x; int y; }; int main() { return 0; }");
        assert!(p.errors() >= 1);
    }

    #[test]
    fn test_float_literal_reports_error() {
        let p = compile("int main() { return 1.5; }");
        assert!(p.errors() >= 1);
    }

    #[test]
    fn test_missing_semicolon_recovers() {
        let p = compile("int main() { int a = 1 return a; }");
        assert!(p.errors() >= 1);
        // parsing continued to the end without looping forever
        assert_eq!(p.cg.vstack_len(), 0);
    }

    #[test]
    fn test_redefinition_reported() {
        let p = compile("int f() { return 1; } int f() { return 2; }");
        assert!(p.errors() >= 1);
    }

    #[test]
    fn test_prototype_then_definition() {
        let p = compile("int add2(int, int); int add2(int a, int b) { return a + b; }");
        assert_eq!(p.errors(), 0);
        let id = p.globals.find("add2").unwrap();
        assert_eq!(p.globals.get(id).r, 1);
    }

    #[test]
    fn test_comma_and_conditional_free_subset() {
        let p = compile("int main() { int a; a = (1, 2); return a; }");
        assert_eq!(p.errors(), 0);
    }

    #[test]
    fn test_void_return_with_value_warns() {
        let p = compile("void f() { return 1; } int main() { return 0; }");
        assert_eq!(p.errors(), 0);
        assert!(p.warnings() >= 1);
    }
}
