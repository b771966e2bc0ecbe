//! Class-feature desugaring.
//!
//! `class`, `field`, `method`, `ADJUST`, and `:isa` reduce to plain package +
//! subroutine form at parse time: the class becomes a package, fields become
//! hash entries on a blessed `$self`, a `new` is synthesized that reads named
//! parameters, initialises fields in declaration order, calls `SUPER::new`
//! when a parent is declared, and runs ADJUST blocks; `:reader` fields grow
//! accessor subs; methods shift `$self` implicitly and see bare field
//! variables as `$self->{field}` accesses.
//!
//! The synthesized constructor's lexical scope is open while field defaults
//! and ADJUST blocks parse (they run inside `new`), and is suspended around
//! method bodies so methods resolve against the file scope.

use std::rc::Rc;

use crate::{
    ast::{
        Block, Builtin, DeclSlot, Expr, ExprKind, MethodName, Sigil, Stmt, StmtKind, SubDef,
    },
    error::ParseResult,
    lexer::{Expect, TokenKind},
    resource::ResourceTracker,
    value::RcStr,
};

use super::Parser;

#[derive(Debug, Clone)]
pub(crate) struct FieldDef {
    pub name: String,
    pub sigil: Sigil,
    pub param: bool,
    pub reader: bool,
    pub default: Option<Expr>,
}

#[derive(Debug)]
pub(crate) struct ClassState {
    pub fields: Vec<FieldDef>,
    pub in_method: bool,
    adjusts: Vec<Stmt>,
    has_parent: bool,
    slot_class: u16,
    slot_args: u16,
    slot_self: u16,
}

pub(crate) fn parse_class<T: ResourceTracker>(
    parser: &mut Parser<'_, T>,
    line: u32,
) -> ParseResult<Option<Stmt>> {
    let name_tok = parser.next(Expect::Term)?;
    if name_tok.kind != TokenKind::Ident {
        return Err(parser.error_at(&name_tok, "syntax error: class requires a name"));
    }
    let class_name: RcStr = Rc::from(name_tok.text.as_str());
    parser.interp.ensure_package(&class_name);

    // `:isa(Parent)`.
    let mut has_parent = false;
    while parser.eat_op(":")? {
        let attr = parser.next(Expect::Term)?;
        if attr.is_ident("isa") {
            parser.expect_op("(")?;
            let parent = parser.next(Expect::Term)?;
            if parent.kind != TokenKind::Ident {
                return Err(parser.error_at(&parent, "syntax error in :isa attribute"));
            }
            parser.expect_op(")")?;
            parser
                .interp
                .push_isa(&class_name, &parent.text)
                .map_err(|e| parser.error_at(&parent, e))?;
            has_parent = true;
        }
    }

    let old_package = Rc::clone(&parser.package);
    parser.package = Rc::clone(&class_name);

    // Open the scope of the constructor-to-be; defaults and ADJUST blocks
    // parse (and will run) inside it.
    parser.scopes.enter_sub(false);
    parser.sub_depth += 1;
    let slot_class = parser.scopes.declare_my("class", Sigil::Scalar);
    let slot_args = parser.scopes.declare_my("args", Sigil::Hash);
    let slot_self = parser.scopes.declare_my("self", Sigil::Scalar);
    parser.class_state = Some(ClassState {
        fields: Vec::new(),
        in_method: false,
        adjusts: Vec::new(),
        has_parent,
        slot_class,
        slot_args,
        slot_self,
    });

    let block_form = {
        let tok = parser.next(Expect::Term)?;
        if tok.is_op("{") {
            true
        } else if tok.is_op(";") {
            false
        } else {
            return Err(parser.error_at(&tok, "syntax error after class name"));
        }
    };

    // Class bodies hold members plus ordinary statements; ordinary
    // statements run inside the constructor, before field initialisation.
    let mut body_stmts: Vec<Stmt> = Vec::new();
    let mut decls: Vec<Stmt> = Vec::new();
    loop {
        let tok = parser.peek(Expect::Term)?;
        if tok.kind == TokenKind::Eof {
            if block_form {
                return Err(parser.error_at(&tok, "Missing right curly or square bracket"));
            }
            break;
        }
        if block_form && tok.is_op("}") {
            parser.next(Expect::Term)?;
            break;
        }
        if !block_form && tok.is_ident("class") {
            break;
        }
        if let Some(stmt) = parser.parse_statement()? {
            match stmt.kind {
                StmtKind::SubDecl(_) => decls.push(stmt),
                StmtKind::Empty => {}
                _ => body_stmts.push(stmt),
            }
        }
    }

    // Assemble `new`.
    let state = parser.class_state.take().unwrap_or_else(|| unreachable!());
    let new_sub = build_constructor(parser, &state, &class_name, body_stmts, line);
    decls.insert(0, Stmt { kind: StmtKind::SubDecl(new_sub), line });

    // Reader accessors.
    for field in state.fields.iter().filter(|f| f.reader) {
        let reader = build_reader(parser, field, &class_name, line);
        decls.push(Stmt { kind: StmtKind::SubDecl(reader), line });
    }

    parser.package = old_package;
    Ok(Some(Stmt { kind: StmtKind::BareBlock { label: None, body: Block { stmts: decls } }, line }))
}

fn build_constructor<T: ResourceTracker>(
    parser: &mut Parser<'_, T>,
    state: &ClassState,
    class_name: &RcStr,
    body_stmts: Vec<Stmt>,
    line: u32,
) -> Rc<SubDef> {
    let lex = |slot: u16, sigil: Sigil| Expr { kind: ExprKind::Lexical { slot, sigil }, line };
    let mut stmts = Vec::new();

    // my ($class, %args) = @_;
    let decl = Expr {
        kind: ExprKind::Decl {
            slots: vec![
                DeclSlot { slot: state.slot_class, sigil: Sigil::Scalar, persist: None },
                DeclSlot { slot: state.slot_args, sigil: Sigil::Hash, persist: None },
            ],
            declared_ref: false, paren: false,
        },
        line,
    };
    stmts.push(Stmt {
        kind: StmtKind::Expr(Expr {
            kind: ExprKind::Assign {
                target: Box::new(decl),
                value: Box::new(Expr { kind: ExprKind::ArgsArray, line }),
            },
            line,
        }),
        line,
    });

    // my $self = bless {}, $class;   — or $class->SUPER::new(%args).
    let self_value = if state.has_parent {
        Expr {
            kind: ExprKind::MethodCall {
                invocant: Box::new(lex(state.slot_class, Sigil::Scalar)),
                method: MethodName::Super(Rc::from("new")),
                args: vec![lex(state.slot_args, Sigil::Hash)],
            },
            line,
        }
    } else {
        Expr {
            kind: ExprKind::FuncCall {
                func: Builtin::Bless,
                args: vec![
                    Expr { kind: ExprKind::AnonHash(Vec::new()), line },
                    lex(state.slot_class, Sigil::Scalar),
                ],
            },
            line,
        }
    };
    let self_decl = Expr {
        kind: ExprKind::Decl {
            slots: vec![DeclSlot { slot: state.slot_self, sigil: Sigil::Scalar, persist: None }],
            declared_ref: false, paren: false,
        },
        line,
    };
    stmts.push(Stmt {
        kind: StmtKind::Expr(Expr {
            kind: ExprKind::Assign { target: Box::new(self_decl), value: Box::new(self_value) },
            line,
        }),
        line,
    });

    stmts.extend(body_stmts);

    // Field initialisation, declaration order.
    for field in &state.fields {
        let self_elem = Expr {
            kind: ExprKind::HashElem {
                hash: Box::new(Expr {
                    kind: ExprKind::Deref {
                        sigil: Sigil::Hash,
                        expr: Box::new(lex(state.slot_self, Sigil::Scalar)),
                    },
                    line,
                }),
                key: Box::new(Expr { kind: ExprKind::StrLit(Rc::from(field.name.as_str())), line }),
            },
            line,
        };
        let default = field.default.clone().map(|d| shape_default(d, field.sigil, line));
        let value = if field.param {
            let args_elem = Expr {
                kind: ExprKind::HashElem {
                    hash: Box::new(lex(state.slot_args, Sigil::Hash)),
                    key: Box::new(Expr { kind: ExprKind::StrLit(Rc::from(field.name.as_str())), line }),
                },
                line,
            };
            let fallback = default.unwrap_or(empty_default(field.sigil, line));
            Expr {
                kind: ExprKind::Ternary {
                    cond: Box::new(Expr {
                        kind: ExprKind::FuncCall { func: Builtin::Exists, args: vec![args_elem.clone()] },
                        line,
                    }),
                    then: Box::new(args_elem),
                    else_: Box::new(fallback),
                },
                line,
            }
        } else {
            default.unwrap_or(empty_default(field.sigil, line))
        };
        stmts.push(Stmt {
            kind: StmtKind::Expr(Expr {
                kind: ExprKind::Assign { target: Box::new(self_elem), value: Box::new(value) },
                line,
            }),
            line,
        });
    }

    // ADJUST blocks, declaration order.
    stmts.extend(state.adjusts.iter().cloned());

    stmts.push(Stmt { kind: StmtKind::Return(Some(lex(state.slot_self, Sigil::Scalar))), line });

    parser.sub_depth -= 1;
    let (pad, captures) = parser.scopes.leave_sub();
    Rc::new(SubDef {
        name: Some(Rc::from("new")),
        package: Rc::clone(class_name),
        body: Block { stmts },
        pad,
        captures,
        prototype: None,
        inherits_pad: false,
        parent_cap_len: 0,
        line,
    })
}

/// Array and hash fields store references; their defaults are list-shaped.
fn shape_default(default: Expr, sigil: Sigil, line: u32) -> Expr {
    match sigil {
        Sigil::Array => Expr { kind: ExprKind::AnonArray(super::expr::flatten_list(default)), line },
        Sigil::Hash => Expr { kind: ExprKind::AnonHash(super::expr::flatten_list(default)), line },
        _ => default,
    }
}

fn empty_default(sigil: Sigil, line: u32) -> Expr {
    match sigil {
        Sigil::Array => Expr { kind: ExprKind::AnonArray(Vec::new()), line },
        Sigil::Hash => Expr { kind: ExprKind::AnonHash(Vec::new()), line },
        _ => Expr { kind: ExprKind::FuncCall { func: Builtin::Undef, args: Vec::new() }, line },
    }
}

fn build_reader<T: ResourceTracker>(
    parser: &mut Parser<'_, T>,
    field: &FieldDef,
    class_name: &RcStr,
    line: u32,
) -> Rc<SubDef> {
    // sub NAME { my $self = shift; $self->{NAME} } — with array/hash fields
    // dereferenced to their contents.
    parser.scopes.enter_sub(false);
    let slot_self = parser.scopes.declare_my("self", Sigil::Scalar);
    let self_var = Expr { kind: ExprKind::Lexical { slot: slot_self, sigil: Sigil::Scalar }, line };
    let bind_self = Stmt {
        kind: StmtKind::Expr(Expr {
            kind: ExprKind::Assign {
                target: Box::new(Expr {
                    kind: ExprKind::Decl {
                        slots: vec![DeclSlot { slot: slot_self, sigil: Sigil::Scalar, persist: None }],
                        declared_ref: false, paren: false,
                    },
                    line,
                }),
                value: Box::new(Expr {
                    kind: ExprKind::FuncCall {
                        func: Builtin::Shift,
                        args: vec![Expr { kind: ExprKind::ArgsArray, line }],
                    },
                    line,
                }),
            },
            line,
        }),
        line,
    };
    let elem = Expr {
        kind: ExprKind::HashElem {
            hash: Box::new(Expr { kind: ExprKind::Deref { sigil: Sigil::Hash, expr: Box::new(self_var) }, line }),
            key: Box::new(Expr { kind: ExprKind::StrLit(Rc::from(field.name.as_str())), line }),
        },
        line,
    };
    let result = match field.sigil {
        Sigil::Array => Expr { kind: ExprKind::Deref { sigil: Sigil::Array, expr: Box::new(elem) }, line },
        Sigil::Hash => Expr { kind: ExprKind::Deref { sigil: Sigil::Hash, expr: Box::new(elem) }, line },
        _ => elem,
    };
    let body = Block { stmts: vec![bind_self, Stmt { kind: StmtKind::Return(Some(result)), line }] };
    let (pad, captures) = parser.scopes.leave_sub();
    Rc::new(SubDef {
        name: Some(Rc::from(field.name.as_str())),
        package: Rc::clone(class_name),
        body,
        pad,
        captures,
        prototype: None,
        inherits_pad: false,
        parent_cap_len: 0,
        line,
    })
}

pub(crate) fn parse_class_member<T: ResourceTracker>(
    parser: &mut Parser<'_, T>,
    keyword: &str,
    line: u32,
) -> ParseResult<Option<Stmt>> {
    match keyword {
        "field" => parse_field(parser, line),
        "method" => parse_method(parser, line),
        _ => parse_adjust(parser, line),
    }
}

fn parse_field<T: ResourceTracker>(parser: &mut Parser<'_, T>, line: u32) -> ParseResult<Option<Stmt>> {
    let var = parser.next(Expect::Term)?;
    if var.kind != TokenKind::Var {
        return Err(parser.error_at(&var, "syntax error in field declaration"));
    }
    let sigil = var.text.chars().next().and_then(Sigil::from_char).unwrap_or(Sigil::Scalar);
    let name = var.text[1..].to_string();

    let mut param = false;
    let mut reader = false;
    while parser.eat_op(":")? {
        let attr = parser.next(Expect::Term)?;
        match attr.text.as_str() {
            "param" => param = true,
            "reader" => reader = true,
            other => {
                return Err(parser.error_at(&attr, format!("Unrecognized field attribute :{other}")));
            }
        }
    }

    // Defaults parse inside the open constructor scope; earlier fields are
    // visible to them through the field-access rewrite.
    let default = if parser.eat_op("=")? {
        if let Some(state) = parser.class_state.as_mut() {
            state.in_method = true;
        }
        let e = parser.parse_expr()?;
        if let Some(state) = parser.class_state.as_mut() {
            state.in_method = false;
        }
        Some(e)
    } else {
        None
    };
    let semi = parser.next(Expect::Operator)?;
    if !semi.is_op(";") {
        return Err(parser.error_at(&semi, "syntax error in field declaration"));
    }

    if let Some(state) = parser.class_state.as_mut() {
        state.fields.push(FieldDef { name, sigil, param, reader, default });
    }
    Ok(Some(Stmt { kind: StmtKind::Empty, line }))
}

fn parse_method<T: ResourceTracker>(parser: &mut Parser<'_, T>, line: u32) -> ParseResult<Option<Stmt>> {
    let name_tok = parser.next(Expect::Term)?;
    if name_tok.kind != TokenKind::Ident {
        return Err(parser.error_at(&name_tok, "syntax error: method requires a name"));
    }
    let name: RcStr = Rc::from(name_tok.text.as_str());

    // Methods are siblings of the constructor, not children.
    let suspended = parser.scopes.suspend_sub();
    parser.scopes.enter_sub(false);
    parser.sub_depth += 1;
    let slot_self = parser.scopes.declare_my("self", Sigil::Scalar);

    let was_in_method = parser.class_state.as_ref().is_some_and(|s| s.in_method);
    if let Some(state) = parser.class_state.as_mut() {
        state.in_method = true;
    }

    // Optional signature (methods always use signature syntax).
    let mut prelude: Vec<Stmt> = vec![Stmt {
        kind: StmtKind::Expr(Expr {
            kind: ExprKind::Assign {
                target: Box::new(Expr {
                    kind: ExprKind::Decl {
                        slots: vec![DeclSlot { slot: slot_self, sigil: Sigil::Scalar, persist: None }],
                        declared_ref: false, paren: false,
                    },
                    line,
                }),
                value: Box::new(Expr {
                    kind: ExprKind::FuncCall {
                        func: Builtin::Shift,
                        args: vec![Expr { kind: ExprKind::ArgsArray, line }],
                    },
                    line,
                }),
            },
            line,
        }),
        line,
    }];
    let tok = parser.peek(Expect::Term)?;
    if tok.is_op("(") {
        let saved_sig = parser.feats.signatures;
        parser.feats.signatures = true;
        let sig = parser.parse_signature()?;
        parser.feats.signatures = saved_sig;
        prelude.extend(sig);
    }

    let mut body = parser.parse_block()?;
    prelude.extend(body.stmts);
    body.stmts = prelude;

    if let Some(state) = parser.class_state.as_mut() {
        state.in_method = was_in_method;
    }
    parser.sub_depth -= 1;
    let (pad, captures) = parser.scopes.leave_sub();
    parser.scopes.resume_sub(suspended);

    let package = Rc::clone(&parser.package);
    parser.declared_subs.insert(format!("{package}::{name}"));
    let sub = Rc::new(SubDef {
        name: Some(name),
        package,
        body,
        pad,
        captures,
        prototype: None,
        inherits_pad: false,
        parent_cap_len: 0,
        line,
    });
    Ok(Some(Stmt { kind: StmtKind::SubDecl(sub), line }))
}

fn parse_adjust<T: ResourceTracker>(parser: &mut Parser<'_, T>, line: u32) -> ParseResult<Option<Stmt>> {
    if let Some(state) = parser.class_state.as_mut() {
        state.in_method = true;
    }
    let block = parser.parse_block()?;
    if let Some(state) = parser.class_state.as_mut() {
        state.in_method = false;
        state.adjusts.push(Stmt { kind: StmtKind::BareBlock { label: None, body: block }, line });
    }
    Ok(Some(Stmt { kind: StmtKind::Empty, line }))
}
