//! The compile layer: turns a submitted [`IrModule`] into a linked,
//! executable [`LinkedArtifact`].
//!
//! External references are resolved through an [`ImportResolver`] before
//! linking and the addresses handed straight to the `JITBuilder`, so the
//! generated code calls directly into older modules or host functions.
//! Compilation is all-or-nothing: any failure drops the half-built
//! `JITModule` and nothing becomes resolvable.

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{types, AbiParam, InstBuilder, Signature, UserFuncName};
use cranelift_codegen::{self as codegen};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{default_libcall_names, DataDescription, FuncId, Linkage, Module};
use log::debug;
use rustc_hash::{FxHashMap, FxHashSet};

use super::object::{LinkedArtifact, SymbolDef};
use crate::error::CompileError;
use crate::ir::{BinOp, Cmp, Expr, FuncDef, IrModule};
use crate::mangle::Mangler;
use crate::target::TargetDescriptor;

// Alias to distinguish Cranelift's SSA value from anything caller-facing.
type CraneliftValue = codegen::ir::Value;

/// Answers "what address satisfies this external reference" while a new
/// module links. The engine supplies a view over its loaded modules and the
/// host process's symbol table.
pub(crate) trait ImportResolver {
    fn resolve(&self, mangled: &str) -> Option<*const u8>;
}

pub(crate) struct CompileLayer {
    isa: codegen::isa::OwnedTargetIsa,
}

impl CompileLayer {
    pub(crate) fn new(target: &TargetDescriptor) -> Self {
        Self { isa: target.isa() }
    }

    /// Compile and link `module`, consuming it. Every definition goes into a
    /// fresh `JITModule` so the artifact owns exactly its own pages.
    pub(crate) fn compile(
        &self,
        module: IrModule,
        mangler: &Mangler,
        resolver: &dyn ImportResolver,
    ) -> Result<LinkedArtifact, CompileError> {
        let IrModule {
            name,
            functions,
            data,
        } = module;

        debug!(
            "compiling module '{}' ({} function(s), {} data object(s))",
            name,
            functions.len(),
            data.len()
        );

        // Reject in-module duplicates before any codegen happens.
        let mut seen = FxHashSet::default();
        for defined in functions
            .iter()
            .map(|f| f.name.as_str())
            .chain(data.iter().map(|d| d.name.as_str()))
        {
            if !seen.insert(defined) {
                return Err(CompileError::DuplicateSymbol {
                    module: name,
                    name: defined.to_owned(),
                });
            }
        }

        let arities: FxHashMap<&str, usize> = functions
            .iter()
            .map(|f| (f.name.as_str(), f.params))
            .collect();

        // Walk every body once, checking call arity and collecting the
        // external references with their call-site arity.
        let mut imports: FxHashMap<String, usize> = FxHashMap::default();
        for func in &functions {
            collect_imports(&name, &func.body, &arities, &mut imports)?;
        }

        // Resolve every import up front; an unresolvable reference fails the
        // whole submission.
        let mut builder = JITBuilder::with_isa(self.isa.clone(), default_libcall_names());
        let mut resolved = Vec::with_capacity(imports.len());
        for (logical, arity) in imports {
            let mangled = mangler.mangle(&logical);
            let address =
                resolver
                    .resolve(&mangled)
                    .ok_or_else(|| CompileError::UnresolvedSymbol {
                        module: name.clone(),
                        name: logical.clone(),
                    })?;
            builder.symbol(&mangled, address);
            resolved.push((logical, mangled, arity));
        }

        let mut jit = JITModule::new(builder);

        // Declare everything first so bodies can reference any sibling
        // regardless of definition order.
        let mut func_ids: FxHashMap<String, FuncId> = FxHashMap::default();
        for (logical, mangled, arity) in resolved {
            let sig = make_signature(&jit, arity);
            let id = jit.declare_function(&mangled, Linkage::Import, &sig)?;
            func_ids.insert(logical, id);
        }
        for func in &functions {
            let sig = make_signature(&jit, func.params);
            let linkage = if func.exported {
                Linkage::Export
            } else {
                Linkage::Local
            };
            let id = jit.declare_function(&mangler.mangle(&func.name), linkage, &sig)?;
            func_ids.insert(func.name.clone(), id);
        }

        let mut data_ids = Vec::with_capacity(data.len());
        for def in &data {
            let linkage = if def.exported {
                Linkage::Export
            } else {
                Linkage::Local
            };
            let id = jit.declare_data(&mangler.mangle(&def.name), linkage, false, false)?;
            let mut desc = DataDescription::new();
            desc.define(def.bytes.clone().into_boxed_slice());
            jit.define_data(id, &desc)?;
            data_ids.push(id);
        }

        // Define phase.
        let mut ctx = jit.make_context();
        let mut func_ctx = FunctionBuilderContext::new();
        for func in &functions {
            let id = func_ids[func.name.as_str()];
            ctx.func.signature = make_signature(&jit, func.params);
            ctx.func.name = UserFuncName::user(0, id.as_u32());

            {
                let mut builder = FunctionBuilder::new(&mut ctx.func, &mut func_ctx);
                let entry = builder.create_block();
                builder.append_block_params_for_function_params(entry);
                builder.switch_to_block(entry);
                builder.seal_block(entry);
                let params = builder.block_params(entry).to_vec();

                let mut translator = ExprTranslator {
                    module: &name,
                    func,
                    params,
                    jit: &mut jit,
                    func_ids: &func_ids,
                    func_refs: FxHashMap::default(),
                    builder: &mut builder,
                };
                let result = translator.translate(&func.body)?;

                builder.ins().return_(&[result]);
                builder.finalize();
            }

            jit.define_function(id, &mut ctx)?;
            jit.clear_context(&mut ctx);
        }

        jit.finalize_definitions()?;

        // Materialize the artifact's symbol table from the finalized code.
        let mut symbols: FxHashMap<String, SymbolDef> = FxHashMap::default();
        for func in &functions {
            let address = jit.get_finalized_function(func_ids[func.name.as_str()]);
            symbols.insert(
                mangler.mangle(&func.name),
                SymbolDef {
                    address,
                    exported: func.exported,
                },
            );
        }
        for (def, id) in data.iter().zip(data_ids) {
            let (address, _len) = jit.get_finalized_data(id);
            symbols.insert(
                mangler.mangle(&def.name),
                SymbolDef {
                    address,
                    exported: def.exported,
                },
            );
        }

        debug!("linked module '{}' ({} symbol(s))", name, symbols.len());
        Ok(LinkedArtifact::new(name, symbols, jit))
    }
}

fn make_signature(jit: &JITModule, params: usize) -> Signature {
    let mut sig = jit.make_signature();
    for _ in 0..params {
        sig.params.push(AbiParam::new(types::I64));
    }
    sig.returns.push(AbiParam::new(types::I64));
    sig
}

/// Check call arity against sibling definitions and record external
/// references. Call sites of one import must agree on arity, since the
/// import is declared once.
fn collect_imports(
    module: &str,
    expr: &Expr,
    arities: &FxHashMap<&str, usize>,
    imports: &mut FxHashMap<String, usize>,
) -> Result<(), CompileError> {
    match expr {
        Expr::Const(_) | Expr::Arg(_) => Ok(()),
        Expr::Binary { lhs, rhs, .. } | Expr::Compare { lhs, rhs, .. } => {
            collect_imports(module, lhs, arities, imports)?;
            collect_imports(module, rhs, arities, imports)
        }
        Expr::If { cond, then, orelse } => {
            collect_imports(module, cond, arities, imports)?;
            collect_imports(module, then, arities, imports)?;
            collect_imports(module, orelse, arities, imports)
        }
        Expr::Call { callee, args } => {
            for arg in args {
                collect_imports(module, arg, arities, imports)?;
            }
            let expected = match arities.get(callee.as_str()) {
                Some(&arity) => arity,
                None => *imports.entry(callee.clone()).or_insert(args.len()),
            };
            if args.len() != expected {
                return Err(CompileError::ArityMismatch {
                    module: module.to_owned(),
                    callee: callee.clone(),
                    expected,
                    got: args.len(),
                });
            }
            Ok(())
        }
    }
}

struct ExprTranslator<'a, 'b> {
    module: &'a str,
    func: &'a FuncDef,
    params: Vec<CraneliftValue>,
    jit: &'a mut JITModule,
    func_ids: &'a FxHashMap<String, FuncId>,
    func_refs: FxHashMap<FuncId, codegen::ir::FuncRef>,
    builder: &'a mut FunctionBuilder<'b>,
}

impl ExprTranslator<'_, '_> {
    fn translate(&mut self, expr: &Expr) -> Result<CraneliftValue, CompileError> {
        match expr {
            Expr::Const(value) => Ok(self.builder.ins().iconst(types::I64, *value)),
            Expr::Arg(index) => {
                self.params
                    .get(*index)
                    .copied()
                    .ok_or_else(|| CompileError::ArgOutOfRange {
                        function: self.func.name.clone(),
                        index: *index,
                        arity: self.func.params,
                    })
            }
            Expr::Binary { op, lhs, rhs } => {
                let lhs = self.translate(lhs)?;
                let rhs = self.translate(rhs)?;
                Ok(match op {
                    BinOp::Add => self.builder.ins().iadd(lhs, rhs),
                    BinOp::Sub => self.builder.ins().isub(lhs, rhs),
                    BinOp::Mul => self.builder.ins().imul(lhs, rhs),
                    BinOp::Div => self.builder.ins().sdiv(lhs, rhs),
                })
            }
            Expr::Compare { cmp, lhs, rhs } => {
                let lhs = self.translate(lhs)?;
                let rhs = self.translate(rhs)?;
                let flag = self.builder.ins().icmp(condcode(*cmp), lhs, rhs);
                Ok(self.builder.ins().uextend(types::I64, flag))
            }
            Expr::If { cond, then, orelse } => {
                let cond = self.translate(cond)?;
                let then_block = self.builder.create_block();
                let else_block = self.builder.create_block();
                let merge_block = self.builder.create_block();
                self.builder.append_block_param(merge_block, types::I64);

                self.builder
                    .ins()
                    .brif(cond, then_block, &[], else_block, &[]);

                self.builder.switch_to_block(then_block);
                self.builder.seal_block(then_block);
                let then_value = self.translate(then)?;
                self.builder.ins().jump(merge_block, &[then_value]);

                self.builder.switch_to_block(else_block);
                self.builder.seal_block(else_block);
                let else_value = self.translate(orelse)?;
                self.builder.ins().jump(merge_block, &[else_value]);

                self.builder.switch_to_block(merge_block);
                self.builder.seal_block(merge_block);
                Ok(self.builder.block_params(merge_block)[0])
            }
            Expr::Call { callee, args } => {
                // Every callee was either declared as a sibling or collected
                // and resolved as an import before codegen started.
                let func_id = self.func_ids.get(callee.as_str()).copied().ok_or_else(|| {
                    CompileError::UnresolvedSymbol {
                        module: self.module.to_owned(),
                        name: callee.clone(),
                    }
                })?;
                let func_ref = match self.func_refs.get(&func_id) {
                    Some(&func_ref) => func_ref,
                    None => {
                        let func_ref = self.jit.declare_func_in_func(func_id, self.builder.func);
                        self.func_refs.insert(func_id, func_ref);
                        func_ref
                    }
                };

                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.translate(arg)?);
                }
                let call = self.builder.ins().call(func_ref, &values);
                Ok(self.builder.inst_results(call)[0])
            }
        }
    }
}

fn condcode(cmp: Cmp) -> IntCC {
    match cmp {
        Cmp::Eq => IntCC::Equal,
        Cmp::Ne => IntCC::NotEqual,
        Cmp::Lt => IntCC::SignedLessThan,
        Cmp::Le => IntCC::SignedLessThanOrEqual,
        Cmp::Gt => IntCC::SignedGreaterThan,
        Cmp::Ge => IntCC::SignedGreaterThanOrEqual,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{DataDef, FuncDef, IrModule};
    use crate::target::OptLevel;

    struct NoImports;

    impl ImportResolver for NoImports {
        fn resolve(&self, _mangled: &str) -> Option<*const u8> {
            None
        }
    }

    fn layer() -> (CompileLayer, Mangler) {
        let target = TargetDescriptor::host(OptLevel::None).unwrap();
        let mangler = Mangler::new(target.triple());
        (CompileLayer::new(&target), mangler)
    }

    #[test]
    fn duplicate_definitions_are_rejected() {
        let (layer, mangler) = layer();
        let module = IrModule::new("dup")
            .with_function(FuncDef::exported("same", 0, Expr::Const(1)))
            .with_function(FuncDef::exported("same", 0, Expr::Const(2)));

        let err = layer.compile(module, &mangler, &NoImports).unwrap_err();
        assert!(matches!(err, CompileError::DuplicateSymbol { name, .. } if name == "same"));
    }

    #[test]
    fn function_and_data_names_share_one_namespace() {
        let (layer, mangler) = layer();
        let module = IrModule::new("dup")
            .with_function(FuncDef::exported("same", 0, Expr::Const(1)))
            .with_data(DataDef::exported("same", vec![0]));

        let err = layer.compile(module, &mangler, &NoImports).unwrap_err();
        assert!(matches!(err, CompileError::DuplicateSymbol { .. }));
    }

    #[test]
    fn unresolved_reference_is_rejected() {
        let (layer, mangler) = layer();
        let module = IrModule::new("orphan").with_function(FuncDef::exported(
            "caller",
            0,
            Expr::call("missing", vec![]),
        ));

        let err = layer.compile(module, &mangler, &NoImports).unwrap_err();
        assert!(matches!(err, CompileError::UnresolvedSymbol { name, .. } if name == "missing"));
    }

    #[test]
    fn internal_call_arity_is_checked() {
        let (layer, mangler) = layer();
        let module = IrModule::new("arity")
            .with_function(FuncDef::exported("one", 1, Expr::Arg(0)))
            .with_function(FuncDef::exported(
                "caller",
                0,
                Expr::call("one", vec![Expr::Const(1), Expr::Const(2)]),
            ));

        let err = layer.compile(module, &mangler, &NoImports).unwrap_err();
        assert!(matches!(
            err,
            CompileError::ArityMismatch {
                expected: 1,
                got: 2,
                ..
            }
        ));
    }

    #[test]
    fn import_call_sites_must_agree_on_arity() {
        let (layer, mangler) = layer();
        let disagreeing = Expr::binary(
            crate::ir::BinOp::Add,
            Expr::call("ext", vec![Expr::Const(1)]),
            Expr::call("ext", vec![Expr::Const(1), Expr::Const(2)]),
        );
        let module =
            IrModule::new("imports").with_function(FuncDef::exported("caller", 0, disagreeing));

        let err = layer.compile(module, &mangler, &NoImports).unwrap_err();
        assert!(matches!(err, CompileError::ArityMismatch { callee, .. } if callee == "ext"));
    }

    #[test]
    fn arg_index_out_of_range_is_rejected() {
        let (layer, mangler) = layer();
        let module =
            IrModule::new("args").with_function(FuncDef::exported("nullary", 0, Expr::Arg(0)));

        let err = layer.compile(module, &mangler, &NoImports).unwrap_err();
        assert!(matches!(
            err,
            CompileError::ArgOutOfRange {
                index: 0,
                arity: 0,
                ..
            }
        ));
    }

    #[test]
    fn artifact_exposes_symbols_under_mangled_names() {
        let (layer, mangler) = layer();
        let module = IrModule::new("visibility")
            .with_function(FuncDef::exported("shown", 0, Expr::Const(1)))
            .with_function(FuncDef::local("hidden", 0, Expr::Const(2)));

        let artifact = layer.compile(module, &mangler, &NoImports).unwrap();

        let shown = artifact.lookup(&mangler.mangle("shown"), false).unwrap();
        assert!(shown.exported);
        assert!(!shown.address.is_null());

        // Local definitions stay invisible to an exported-only search but are
        // found when the search includes them.
        assert!(artifact.lookup(&mangler.mangle("hidden"), false).is_none());
        let hidden = artifact.lookup(&mangler.mangle("hidden"), true).unwrap();
        assert!(!hidden.exported);
    }
}
