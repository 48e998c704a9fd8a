//! # Type Forest
//!
//! Every type has a `basetype`: the root of its alias chain. Roots are the
//! built-in `int`, `ptr` and `opaque` types plus structural function types.
//! Aliases (`bool`, the sized integers, user aliases) point at a parent and
//! share the parent's basetype.
//!
//! The middle end only reads this table. It is filled in by the name/type
//! annotation stage before any function is compiled.

use crate::compiler::ir::Location;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Index of a type in the [`TypeTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeId(u32);

impl TypeId {
    /// Raw table index
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Byte width and signedness of a sized integer alias (emission only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IntSize {
    /// Width in bytes
    pub bytes: u8,
    /// Whether loads sign-extend
    pub signed: bool,
}

/// Shape of a type definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeKind {
    /// Machine integer
    Int,
    /// Untyped pointer
    Ptr,
    /// Value the program may hold but never compute with
    Opaque,
    /// Function reference with its signature
    Function {
        /// Parameter types in declaration order
        parameters: Vec<TypeId>,
        /// Return types in declaration order
        returns: Vec<TypeId>,
    },
    /// Named alias of another type
    Alias {
        /// Integer width for sized aliases
        size: Option<IntSize>,
    },
}

/// A single entry of the type forest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeDef {
    /// Printable name
    pub name: String,
    /// Shape
    pub kind: TypeKind,
    /// Alias parent (`None` for roots)
    pub parent: Option<TypeId>,
    /// Root of the alias chain (itself for roots)
    pub basetype: TypeId,
}

/// Type forest shared by every function of a module
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeTable {
    types: Vec<TypeDef>,
    by_name: HashMap<String, TypeId>,
}

impl TypeTable {
    /// `int`
    pub const INT: TypeId = TypeId(0);
    /// `ptr`
    pub const PTR: TypeId = TypeId(1);
    /// `opaque`
    pub const OPAQUE: TypeId = TypeId(2);
    /// `bool` (alias of `int`)
    pub const BOOL: TypeId = TypeId(3);

    /// Create a table holding the built-in types
    pub fn new() -> Self {
        let mut table = Self {
            types: Vec::new(),
            by_name: HashMap::new(),
        };

        table.insert_root("int", TypeKind::Int);
        table.insert_root("ptr", TypeKind::Ptr);
        table.insert_root("opaque", TypeKind::Opaque);
        table.insert_alias("bool", Self::INT, None);

        for (name, bytes, signed) in [
            ("u8", 1, false),
            ("u16", 2, false),
            ("u32", 4, false),
            ("u64", 8, false),
            ("i8", 1, true),
            ("i16", 2, true),
            ("i32", 4, true),
            ("i64", 8, true),
        ] {
            table.insert_alias(name, Self::INT, Some(IntSize { bytes, signed }));
        }

        table
    }

    fn next_id(&self) -> TypeId {
        TypeId(self.types.len() as u32)
    }

    fn insert_root(&mut self, name: &str, kind: TypeKind) -> TypeId {
        let id = self.next_id();
        self.types.push(TypeDef {
            name: name.to_string(),
            kind,
            parent: None,
            basetype: id,
        });
        self.by_name.insert(name.to_string(), id);
        id
    }

    fn insert_alias(&mut self, name: &str, parent: TypeId, size: Option<IntSize>) -> TypeId {
        let id = self.next_id();
        let basetype = self.basetype(parent);
        self.types.push(TypeDef {
            name: name.to_string(),
            kind: TypeKind::Alias { size },
            parent: Some(parent),
            basetype,
        });
        self.by_name.insert(name.to_string(), id);
        id
    }

    /// Define a named alias of `parent`
    ///
    /// Sized aliases inherit their parent's width unless `size` overrides it.
    pub fn define_alias(
        &mut self,
        name: &str,
        parent: TypeId,
        size: Option<IntSize>,
        location: Location,
    ) -> Result<TypeId> {
        if self.by_name.contains_key(name) {
            return Err(Error::RedefinedName {
                name: name.to_string(),
                location,
                stack: String::new(),
            });
        }
        let size = size.or_else(|| self.int_size(parent));
        Ok(self.insert_alias(name, parent, size))
    }

    /// Intern a structural function type
    pub fn function_type(&mut self, parameters: Vec<TypeId>, returns: Vec<TypeId>) -> TypeId {
        let name = format!(
            "fn({}) -> ({})",
            self.join_names(&parameters),
            self.join_names(&returns)
        );
        let kind = TypeKind::Function {
            parameters,
            returns,
        };
        if let Some(pos) = self.types.iter().position(|def| def.kind == kind) {
            return TypeId(pos as u32);
        }

        let id = self.next_id();
        self.types.push(TypeDef {
            name,
            kind,
            parent: None,
            basetype: id,
        });
        id
    }

    fn join_names(&self, ids: &[TypeId]) -> String {
        ids.iter()
            .map(|id| self.name(*id))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Look up a type by name
    pub fn lookup(&self, name: &str) -> Option<TypeId> {
        self.by_name.get(name).copied()
    }

    /// Definition of a type
    pub fn get(&self, id: TypeId) -> &TypeDef {
        &self.types[id.index()]
    }

    /// Printable name of a type
    pub fn name(&self, id: TypeId) -> &str {
        &self.get(id).name
    }

    /// Root of the alias chain
    pub fn basetype(&self, id: TypeId) -> TypeId {
        self.get(id).basetype
    }

    /// Alias parent
    pub fn parent(&self, id: TypeId) -> Option<TypeId> {
        self.get(id).parent
    }

    /// Only `int`- and `ptr`-based types take part in arithmetic
    pub fn is_computable(&self, id: TypeId) -> bool {
        matches!(self.basetype(id), Self::INT | Self::PTR)
    }

    /// True when the basetype is `int`
    pub fn is_int(&self, id: TypeId) -> bool {
        self.basetype(id) == Self::INT
    }

    /// True when the basetype is `ptr`
    pub fn is_ptr(&self, id: TypeId) -> bool {
        self.basetype(id) == Self::PTR
    }

    /// Width of a sized alias, searched up the alias chain
    pub fn int_size(&self, id: TypeId) -> Option<IntSize> {
        let mut current = Some(id);
        while let Some(ty) = current {
            if let TypeKind::Alias { size: Some(size) } = self.get(ty).kind {
                return Some(size);
            }
            current = self.parent(ty);
        }
        None
    }

    /// Parameters and returns of a function-based type
    pub fn signature(&self, id: TypeId) -> Option<(&[TypeId], &[TypeId])> {
        match &self.get(self.basetype(id)).kind {
            TypeKind::Function {
                parameters,
                returns,
            } => Some((parameters, returns)),
            _ => None,
        }
    }

    /// Deepest type found on both alias chains, `None` if the basetypes differ
    pub fn lowest_common_ancestor(&self, a: TypeId, b: TypeId) -> Option<TypeId> {
        if a == b {
            return Some(a);
        }
        if self.basetype(a) != self.basetype(b) {
            return None;
        }

        let mut ancestors = Vec::new();
        let mut current = Some(a);
        while let Some(ty) = current {
            ancestors.push(ty);
            current = self.parent(ty);
        }

        let mut current = Some(b);
        while let Some(ty) = current {
            if ancestors.contains(&ty) {
                return Some(ty);
            }
            current = self.parent(ty);
        }
        None
    }

    /// Whether `id` names a type of this table
    pub fn contains(&self, id: TypeId) -> bool {
        id.index() < self.types.len()
    }

    /// Check a table read from outside the crate
    ///
    /// Every reference must point at an earlier entry, which keeps alias
    /// chains acyclic, and stored basetypes must agree with the chains.
    pub fn validate(&self) -> Result<()> {
        let builtins = [
            (Self::INT, TypeKind::Int),
            (Self::PTR, TypeKind::Ptr),
            (Self::OPAQUE, TypeKind::Opaque),
        ];
        for (id, kind) in builtins {
            if self.types.get(id.index()).map(|def| &def.kind) != Some(&kind) {
                return Err(malformed(id.index(), "is not the expected built-in"));
            }
        }
        if self.types.get(Self::BOOL.index()).and_then(|def| def.parent) != Some(Self::INT) {
            return Err(malformed(Self::BOOL.index(), "is not the expected built-in"));
        }

        for (index, def) in self.types.iter().enumerate() {
            let earlier = |ty: TypeId| ty.index() < index;
            let references: Vec<TypeId> = match &def.kind {
                TypeKind::Function {
                    parameters,
                    returns,
                } => parameters.iter().chain(returns).copied().collect(),
                _ => Vec::new(),
            };
            if !references.into_iter().chain(def.parent).all(earlier) {
                return Err(malformed(index, "refers to a later or missing type"));
            }

            let basetype = match (def.parent, &def.kind) {
                (Some(parent), TypeKind::Alias { .. }) => self.types[parent.index()].basetype,
                (None, TypeKind::Alias { .. }) => {
                    return Err(malformed(index, "is an alias without a parent"))
                }
                (Some(_), _) => return Err(malformed(index, "is a root with a parent")),
                (None, _) => TypeId(index as u32),
            };
            if def.basetype != basetype {
                return Err(malformed(index, "has the wrong basetype"));
            }
        }

        match self.by_name.iter().find(|(_, id)| !self.contains(**id)) {
            Some((name, id)) => Err(Error::Serialization {
                message: format!("type name '{}' maps to missing type {}", name, id.index()),
            }),
            None => Ok(()),
        }
    }

    /// Number of types in the table
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Always false: the built-ins are present from construction
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

fn malformed(index: usize, problem: &str) -> Error {
    Error::Serialization {
        message: format!("type {} {}", index, problem),
    }
}

impl Default for TypeTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Display helper pairing a type id with its table
pub struct TypeName<'a>(pub &'a TypeTable, pub TypeId);

impl fmt::Display for TypeName<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.name(self.1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_basetypes() {
        let types = TypeTable::new();
        assert_eq!(types.basetype(TypeTable::BOOL), TypeTable::INT);
        assert_eq!(types.basetype(TypeTable::PTR), TypeTable::PTR);
        assert!(types.is_computable(TypeTable::BOOL));
        assert!(!types.is_computable(TypeTable::OPAQUE));

        let u16 = types.lookup("u16").unwrap();
        assert_eq!(
            types.int_size(u16),
            Some(IntSize {
                bytes: 2,
                signed: false
            })
        );
    }

    #[test]
    fn test_lowest_common_ancestor() {
        let mut types = TypeTable::new();
        let here = Location::default();
        let count = types
            .define_alias("count", TypeTable::INT, None, here)
            .unwrap();
        let small = types.define_alias("small", count, None, here).unwrap();
        let index = types.define_alias("index", count, None, here).unwrap();

        assert_eq!(types.lowest_common_ancestor(small, index), Some(count));
        assert_eq!(types.lowest_common_ancestor(small, count), Some(count));
        assert_eq!(
            types.lowest_common_ancestor(TypeTable::BOOL, small),
            Some(TypeTable::INT)
        );
        assert_eq!(
            types.lowest_common_ancestor(TypeTable::BOOL, TypeTable::PTR),
            None
        );
    }

    #[test]
    fn test_validate_rejects_broken_chains() {
        let mut types = TypeTable::new();
        let here = Location::default();
        let count = types
            .define_alias("count", TypeTable::INT, None, here)
            .unwrap();
        types.function_type(vec![count], vec![TypeTable::PTR]);
        assert!(types.validate().is_ok());

        let mut forward = types.clone();
        forward.types[count.index()].parent = Some(TypeId(40));
        assert!(matches!(
            forward.validate(),
            Err(Error::Serialization { .. })
        ));

        let mut rooted = types.clone();
        rooted.types[count.index()].basetype = TypeTable::PTR;
        assert!(rooted.validate().is_err());

        let mut missing = types;
        missing.types.truncate(2);
        assert!(missing.validate().is_err());
    }

    #[test]
    fn test_alias_redefinition() {
        let mut types = TypeTable::new();
        let err = types
            .define_alias("bool", TypeTable::INT, None, Location::new(2, 4))
            .unwrap_err();
        assert!(matches!(err, Error::RedefinedName { .. }));
    }

    #[test]
    fn test_function_types_are_interned() {
        let mut types = TypeTable::new();
        let a = types.function_type(vec![TypeTable::INT], vec![TypeTable::PTR]);
        let b = types.function_type(vec![TypeTable::INT], vec![TypeTable::PTR]);
        assert_eq!(a, b);
        assert_eq!(types.basetype(a), a);
        assert!(!types.is_computable(a));
        assert_eq!(types.name(a), "fn(int) -> (ptr)");

        let (parameters, returns) = types.signature(a).unwrap();
        assert_eq!(parameters, &[TypeTable::INT]);
        assert_eq!(returns, &[TypeTable::PTR]);
    }
}
