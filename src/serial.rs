//! Snapshot serializer: canonical JSON encoding of a registry view.
//!
//! The document is one object keyed by backend tag. Each value lists the
//! backend's script handles in load order:
//!
//! ```text
//! { "<tag>": [ { "name": "<script>",
//!                "scope": { "name": "global namespace",
//!                           "funcs": [ ... ], "classes": [ ... ] } } ] }
//! ```
//!
//! Every sequence follows the view's order and never passes through a hashed
//! container, so a fixed view always encodes to the same bytes.

#![forbid(unsafe_code)]

use crate::registry::{
    Attribute, ClassDecl, FunctionDecl, Param, RegistryView, ScriptHandle,
};
use serde::ser::{Serialize, SerializeMap, SerializeStruct, Serializer};
use std::sync::Arc;

/// Scope name reported for every handle.
pub const GLOBAL_SCOPE: &str = "global namespace";

/// Compact encoding used by inspect.
pub fn serialize(view: &RegistryView) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&SnapshotDoc(view))
}

/// Indented encoding for humans. Same content as [`serialize`].
pub fn serialize_pretty(view: &RegistryView) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec_pretty(&SnapshotDoc(view))
}

struct SnapshotDoc<'a>(&'a RegistryView);

impl Serialize for SnapshotDoc<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for backend in self.0.backends() {
            map.serialize_entry(backend.tag().as_str(), &HandleList(backend.handles()))?;
        }
        map.end()
    }
}

struct HandleList<'a>(&'a [Arc<ScriptHandle>]);

impl Serialize for HandleList<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.iter().map(|h| HandleDoc(h.as_ref())))
    }
}

struct HandleDoc<'a>(&'a ScriptHandle);

impl Serialize for HandleDoc<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Handle", 2)?;
        s.serialize_field("name", self.0.name())?;
        s.serialize_field("scope", &ScopeDoc(self.0))?;
        s.end()
    }
}

struct ScopeDoc<'a>(&'a ScriptHandle);

impl Serialize for ScopeDoc<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Scope", 3)?;
        s.serialize_field("name", GLOBAL_SCOPE)?;
        s.serialize_field("funcs", &Seq(|| self.0.functions().map(FunctionDoc)))?;
        s.serialize_field("classes", &Seq(|| self.0.classes().map(ClassDoc)))?;
        s.end()
    }
}

/// Serializes whatever the closure yields as a JSON array.
struct Seq<F>(F);

impl<F, I> Serialize for Seq<F>
where
    F: Fn() -> I,
    I: Iterator,
    I::Item: Serialize,
{
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq((self.0)())
    }
}

struct FunctionDoc<'a>(&'a FunctionDecl);

impl Serialize for FunctionDoc<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Function", 3)?;
        s.serialize_field("name", &self.0.name)?;
        s.serialize_field(
            "signature",
            &SignatureDoc {
                params: &self.0.params,
                ret: Some(self.0.ret.as_deref()),
            },
        )?;
        s.serialize_field("async", &self.0.is_async)?;
        s.end()
    }
}

/// `ret` is `None` for constructors, which have no return slot.
struct SignatureDoc<'a> {
    params: &'a [Param],
    ret: Option<Option<&'a str>>,
}

impl Serialize for SignatureDoc<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let fields = if self.ret.is_some() { 2 } else { 1 };
        let mut s = serializer.serialize_struct("Signature", fields)?;
        if let Some(ret) = self.ret {
            s.serialize_field("ret", &ReturnDoc(ret))?;
        }
        s.serialize_field("args", &Seq(|| self.params.iter().map(ParamDoc)))?;
        s.end()
    }
}

struct ReturnDoc<'a>(Option<&'a str>);

impl Serialize for ReturnDoc<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Return", 1)?;
        s.serialize_field("type", &TypeDoc(self.0))?;
        s.end()
    }
}

struct TypeDoc<'a>(Option<&'a str>);

impl Serialize for TypeDoc<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Type", 1)?;
        s.serialize_field("name", self.0.unwrap_or(""))?;
        s.end()
    }
}

struct ParamDoc<'a>(&'a Param);

impl Serialize for ParamDoc<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Param", 2)?;
        s.serialize_field("name", &self.0.name)?;
        s.serialize_field("type", &TypeDoc(self.0.ty.as_deref()))?;
        s.end()
    }
}

struct AttributeDoc<'a>(&'a Attribute);

impl Serialize for AttributeDoc<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Attribute", 3)?;
        s.serialize_field("name", &self.0.name)?;
        s.serialize_field("type", &TypeDoc(self.0.ty.as_deref()))?;
        s.serialize_field("static", &self.0.is_static)?;
        s.end()
    }
}

struct ClassDoc<'a>(&'a ClassDecl);

impl Serialize for ClassDoc<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let class = self.0;
        let mut s = serializer.serialize_struct("Class", 5)?;
        s.serialize_field("name", &class.name)?;
        s.serialize_field(
            "constructors",
            &Seq(|| {
                class.constructors.iter().map(|params| SignatureDoc {
                    params: params.as_slice(),
                    ret: None,
                })
            }),
        )?;
        s.serialize_field("attributes", &Seq(|| class.attributes.iter().map(AttributeDoc)))?;
        s.serialize_field("methods", &Seq(|| class.methods.iter().map(FunctionDoc)))?;
        s.serialize_field(
            "static_methods",
            &Seq(|| class.static_methods.iter().map(FunctionDoc)),
        )?;
        s.end()
    }
}
