//! DSL module: builder API for declaring a script's exported symbols.

#![forbid(unsafe_code)]

use crate::registry::{
    Attribute, ClassDecl, FunctionDecl, Param, Symbol, SymbolKind,
};
use std::collections::HashSet;

/// Builds one function or method declaration.
#[derive(Debug, Clone)]
pub struct FunctionBuilder {
    decl: FunctionDecl,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            decl: FunctionDecl {
                name: name.into(),
                params: Vec::new(),
                ret: None,
                is_async: false,
            },
        }
    }

    /// Add a typed parameter.
    pub fn param(mut self, name: impl Into<String>, ty: impl Into<String>) -> Self {
        self.decl.params.push(Param {
            name: name.into(),
            ty: Some(ty.into()),
        });
        self
    }

    /// Add a parameter whose type the backend does not report.
    pub fn untyped_param(mut self, name: impl Into<String>) -> Self {
        self.decl.params.push(Param {
            name: name.into(),
            ty: None,
        });
        self
    }

    pub fn returns(mut self, ty: impl Into<String>) -> Self {
        self.decl.ret = Some(ty.into());
        self
    }

    pub fn asynchronous(mut self) -> Self {
        self.decl.is_async = true;
        self
    }

    pub fn build(self) -> FunctionDecl {
        self.decl
    }
}

/// Builds one class declaration.
#[derive(Debug, Clone)]
pub struct ClassBuilder {
    decl: ClassDecl,
}

impl ClassBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            decl: ClassDecl {
                name: name.into(),
                constructors: Vec::new(),
                attributes: Vec::new(),
                methods: Vec::new(),
                static_methods: Vec::new(),
            },
        }
    }

    /// Add a constructor; parameters are taken from `signature`, its name is ignored.
    pub fn constructor(mut self, signature: FunctionBuilder) -> Self {
        self.decl.constructors.push(signature.decl.params);
        self
    }

    pub fn attribute(mut self, name: impl Into<String>, ty: Option<&str>) -> Self {
        self.decl.attributes.push(Attribute {
            name: name.into(),
            ty: ty.map(str::to_string),
            is_static: false,
        });
        self
    }

    pub fn static_attribute(mut self, name: impl Into<String>, ty: Option<&str>) -> Self {
        self.decl.attributes.push(Attribute {
            name: name.into(),
            ty: ty.map(str::to_string),
            is_static: true,
        });
        self
    }

    pub fn method(mut self, method: FunctionBuilder) -> Self {
        self.decl.methods.push(method.build());
        self
    }

    pub fn static_method(mut self, method: FunctionBuilder) -> Self {
        self.decl.static_methods.push(method.build());
        self
    }

    pub fn build(self) -> ClassDecl {
        self.decl
    }
}

/// Collects a script's symbols in declaration order.
#[derive(Debug, Default)]
pub struct ScriptBuilder {
    symbols: Vec<Symbol>,
}

impl ScriptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn function(&mut self, function: FunctionBuilder) -> &mut Self {
        self.symbols.push(Symbol::Function(function.build()));
        self
    }

    pub fn class(&mut self, class: ClassBuilder) -> &mut Self {
        self.symbols.push(Symbol::Class(class.build()));
        self
    }

    /// Finish, rejecting two symbols of the same kind and name.
    pub fn build(self) -> Result<Vec<Symbol>, DslError> {
        let mut seen = HashSet::new();
        for symbol in &self.symbols {
            if !seen.insert((symbol.kind(), symbol.name())) {
                return Err(DslError::DuplicateSymbol {
                    kind: symbol.kind(),
                    name: symbol.name().to_string(),
                });
            }
        }
        Ok(self.symbols)
    }
}

/// DSL-specific errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DslError {
    #[error("{kind} `{name}` declared twice")]
    DuplicateSymbol { kind: SymbolKind, name: String },
}
