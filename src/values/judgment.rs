use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// The type of a value as stored in packed form.
///
/// Strides are the packed byte widths. `String` packs as an 8-byte pool
/// handle and is the one non-POD type: copying or destroying a stored string
/// must touch its pool's refcounts. `Blob` packs its content inline and so
/// has no fixed stride.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum ValueType {
    Nothing,
    Bool,
    Int64,
    Float64,
    String,
    Blob,
    Tuple(Vec<ValueType>),
}

impl ValueType {
    /// Packed width in bytes, or `None` for variable-width types.
    pub fn stride(&self) -> Option<usize> {
        match self {
            ValueType::Nothing => Some(0),
            ValueType::Bool => Some(1),
            ValueType::Int64 | ValueType::Float64 => Some(8),
            ValueType::String => Some(8),
            ValueType::Blob => None,
            ValueType::Tuple(members) => {
                let mut total = 0;
                for member in members {
                    total += member.stride()?;
                }
                Some(total)
            }
        }
    }

    /// True when stored values can be moved with a plain byte copy.
    pub fn is_pod(&self) -> bool {
        match self {
            ValueType::String => false,
            ValueType::Tuple(members) => members.iter().all(ValueType::is_pod),
            _ => true,
        }
    }
}

/// A concrete constant, independent of any memory pool. Floats are held as
/// bit patterns so constants order and hash totally.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Constant {
    Nothing,
    Bool(bool),
    Int64(i64),
    Float64Bits(u64),
    String(Arc<str>),
    Blob(Arc<[u8]>),
    Tuple(Vec<Constant>),
}

impl Constant {
    pub fn float64(value: f64) -> Self {
        Constant::Float64Bits(value.to_bits())
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            Constant::Nothing => ValueType::Nothing,
            Constant::Bool(_) => ValueType::Bool,
            Constant::Int64(_) => ValueType::Int64,
            Constant::Float64Bits(_) => ValueType::Float64,
            Constant::String(_) => ValueType::String,
            Constant::Blob(_) => ValueType::Blob,
            Constant::Tuple(members) => {
                ValueType::Tuple(members.iter().map(Constant::value_type).collect())
            }
        }
    }
}

/// A judgment describes a set of values: everything, all values of one type,
/// or exactly one constant. Judgments order totally so they can key tables
/// and sets.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Judgment {
    Unknown,
    OfType(ValueType),
    OfConstant(Constant),
}

impl Judgment {
    pub fn value_type(&self) -> Option<ValueType> {
        match self {
            Judgment::Unknown => None,
            Judgment::OfType(value_type) => Some(value_type.clone()),
            Judgment::OfConstant(constant) => Some(constant.value_type()),
        }
    }

    pub fn constant(&self) -> Option<&Constant> {
        match self {
            Judgment::OfConstant(constant) => Some(constant),
            _ => None,
        }
    }

    /// Packed stride of values covered by this judgment. Constant judgments
    /// store nothing per value: the judgment itself carries the value.
    pub fn stride(&self) -> Option<usize> {
        match self {
            Judgment::Unknown => None,
            Judgment::OfType(value_type) => value_type.stride(),
            Judgment::OfConstant(_) => Some(0),
        }
    }

    /// Whether stored values under this judgment need pool bookkeeping when
    /// copied or destroyed.
    pub fn is_pod_storage(&self) -> bool {
        match self {
            Judgment::Unknown => false,
            Judgment::OfType(value_type) => value_type.is_pod(),
            Judgment::OfConstant(_) => true,
        }
    }

    /// The judgment a vector element held under this judgment would carry.
    pub fn vector_element_jov(&self) -> Option<Judgment> {
        match self {
            Judgment::Unknown => None,
            other => Some(other.clone()),
        }
    }

    pub fn is_valid_vector_element_jov(&self) -> bool {
        !matches!(self, Judgment::Unknown)
    }

    pub fn covers(&self, other: &Judgment) -> bool {
        match (self, other) {
            (Judgment::Unknown, _) => true,
            (a, b) if a == b => true,
            (Judgment::OfType(t), Judgment::OfConstant(c)) => *t == c.value_type(),
            _ => false,
        }
    }
}

impl fmt::Display for Judgment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Judgment::Unknown => write!(f, "*"),
            Judgment::OfType(value_type) => write!(f, "{value_type:?}"),
            Judgment::OfConstant(constant) => write!(f, "={constant:?}"),
        }
    }
}

/// A judgment on a result: the union of the judgments a computation (or a
/// stored vector) may produce.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct Jor(BTreeSet<Judgment>);

impl Jor {
    pub fn empty() -> Self {
        Jor::default()
    }

    pub fn single(judgment: Judgment) -> Self {
        let mut set = BTreeSet::new();
        set.insert(judgment);
        Jor(set)
    }

    pub fn insert(&mut self, judgment: Judgment) {
        self.0.insert(judgment);
    }

    pub fn union(&self, other: &Jor) -> Jor {
        Jor(self.0.union(&other.0).cloned().collect())
    }

    pub fn contains(&self, judgment: &Judgment) -> bool {
        self.0.contains(judgment)
    }

    /// True when some member of the union covers `judgment`.
    pub fn covers(&self, judgment: &Judgment) -> bool {
        self.0.iter().any(|member| member.covers(judgment))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Judgment> {
        self.0.iter()
    }

    /// True when every judgment in the union has the same fixed stride
    /// layout, i.e. the set is representable without an offset table.
    pub fn has_uniform_stride(&self) -> bool {
        self.0.iter().all(|judgment| judgment.stride().is_some())
    }

    /// The widest fixed stride in the union, when all members are fixed.
    pub fn max_stride(&self) -> Option<usize> {
        let mut widest = 0;
        for judgment in &self.0 {
            widest = widest.max(judgment.stride()?);
        }
        Some(widest)
    }
}

impl FromIterator<Judgment> for Jor {
    fn from_iter<I: IntoIterator<Item = Judgment>>(iter: I) -> Self {
        Jor(iter.into_iter().collect())
    }
}
