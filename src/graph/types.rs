use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;

use crate::error::Result;

/// Index of a registered location type.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct LocationTypeId(pub(crate) u32);

/// Interned attribute name.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct AttrId(pub(crate) u32);

/// Identity of a location instance.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct LocationId(pub(crate) u64);

/// One location-and-attribute pair, the graph's dependency-tracking unit.
pub type NodeId = (LocationId, AttrId);

/// A dynamic value flowing through the computed graph.
///
/// `Cycle` is the sentinel installed into every member of an unresolvable
/// dependency cycle; `Error` holds a failed property computation.
#[derive(Clone, PartialEq, Debug)]
pub enum GraphValue {
    Nothing,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    List(Arc<Vec<GraphValue>>),
    Location(LocationId),
    Error(Arc<str>),
    Cycle(Arc<Vec<NodeId>>),
}

impl GraphValue {
    pub fn str(text: &str) -> Self {
        GraphValue::Str(Arc::from(text))
    }

    pub fn list(values: Vec<GraphValue>) -> Self {
        GraphValue::List(Arc::new(values))
    }

    pub fn is_cycle(&self) -> bool {
        matches!(self, GraphValue::Cycle(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, GraphValue::Error(_))
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            GraphValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Canonical bytes for key hashing. Floats hash by bit pattern.
    pub(crate) fn write_key_bytes(&self, out: &mut Vec<u8>) {
        match self {
            GraphValue::Nothing => out.push(0),
            GraphValue::Bool(b) => {
                out.push(1);
                out.push(u8::from(*b));
            }
            GraphValue::Int(i) => {
                out.push(2);
                out.extend_from_slice(&i.to_le_bytes());
            }
            GraphValue::Float(f) => {
                out.push(3);
                out.extend_from_slice(&f.to_bits().to_le_bytes());
            }
            GraphValue::Str(s) => {
                out.push(4);
                out.extend_from_slice(&(s.len() as u64).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            GraphValue::List(values) => {
                out.push(5);
                out.extend_from_slice(&(values.len() as u64).to_le_bytes());
                for value in values.iter() {
                    value.write_key_bytes(out);
                }
            }
            GraphValue::Location(id) => {
                out.push(6);
                out.extend_from_slice(&id.0.to_le_bytes());
            }
            GraphValue::Error(e) => {
                out.push(7);
                out.extend_from_slice(e.as_bytes());
            }
            GraphValue::Cycle(_) => out.push(8),
        }
    }
}

/// Body of a cached property or an uncached function: a pure function of
/// the graph, reading other attributes through it.
pub type PropertyFn =
    Rc<dyn Fn(&mut crate::graph::ComputedGraph, LocationId) -> Result<GraphValue>>;

/// Hook run after a mutable changes: `(graph, location, old, new)`.
pub type OnUpdateFn =
    Rc<dyn Fn(&mut crate::graph::ComputedGraph, LocationId, &GraphValue, &GraphValue)>;

#[derive(Clone)]
pub(crate) enum AttrKind {
    Key,
    Mutable {
        default: Option<GraphValue>,
        on_update: Option<OnUpdateFn>,
    },
    Property {
        body: PropertyFn,
        lazy: bool,
    },
    /// Recomputed on every read; reads inside still register to the caller.
    Function {
        body: PropertyFn,
    },
    ClassAttribute(GraphValue),
}

/// A class of locations: its keys, mutables, properties, and attributes.
pub struct LocationType {
    pub(crate) name: String,
    pub(crate) attrs: BTreeMap<AttrId, AttrKind>,
    pub(crate) key_order: Vec<AttrId>,
    pub(crate) defers_to: Option<AttrId>,
}

/// Builder for [`LocationType`]; attribute names are interned at
/// registration time.
pub struct LocationTypeBuilder {
    pub(crate) name: String,
    pub(crate) keys: Vec<String>,
    pub(crate) mutables: Vec<(String, Option<GraphValue>, Option<OnUpdateFn>)>,
    pub(crate) properties: Vec<(String, PropertyFn, bool)>,
    pub(crate) functions: Vec<(String, PropertyFn)>,
    pub(crate) class_attributes: Vec<(String, GraphValue)>,
    pub(crate) defers_to: Option<String>,
}

impl LocationTypeBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        LocationTypeBuilder {
            name: name.into(),
            keys: Vec::new(),
            mutables: Vec::new(),
            properties: Vec::new(),
            functions: Vec::new(),
            class_attributes: Vec::new(),
            defers_to: None,
        }
    }

    /// An immutable key attribute; keys identify the instance.
    pub fn key(mut self, name: impl Into<String>) -> Self {
        self.keys.push(name.into());
        self
    }

    pub fn mutable(mut self, name: impl Into<String>, default: GraphValue) -> Self {
        self.mutables.push((name.into(), Some(default), None));
        self
    }

    pub fn mutable_with_hook(
        mut self,
        name: impl Into<String>,
        default: GraphValue,
        on_update: OnUpdateFn,
    ) -> Self {
        self.mutables
            .push((name.into(), Some(default), Some(on_update)));
        self
    }

    /// A cached property recomputed when its dependencies change.
    pub fn property(
        mut self,
        name: impl Into<String>,
        body: impl Fn(&mut crate::graph::ComputedGraph, LocationId) -> Result<GraphValue> + 'static,
    ) -> Self {
        self.properties.push((name.into(), Rc::new(body), false));
        self
    }

    /// A property whose recomputation is deferred until requested.
    pub fn lazy_property(
        mut self,
        name: impl Into<String>,
        body: impl Fn(&mut crate::graph::ComputedGraph, LocationId) -> Result<GraphValue> + 'static,
    ) -> Self {
        self.properties.push((name.into(), Rc::new(body), true));
        self
    }

    /// An uncached function attribute.
    pub fn function(
        mut self,
        name: impl Into<String>,
        body: impl Fn(&mut crate::graph::ComputedGraph, LocationId) -> Result<GraphValue> + 'static,
    ) -> Self {
        self.functions.push((name.into(), Rc::new(body)));
        self
    }

    pub fn class_attribute(mut self, name: impl Into<String>, value: GraphValue) -> Self {
        self.class_attributes.push((name.into(), value));
        self
    }

    /// Unknown attributes delegate to the location named by this property.
    pub fn defers_to(mut self, property: impl Into<String>) -> Self {
        self.defers_to = Some(property.into());
        self
    }
}
