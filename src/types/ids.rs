use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use xxhash_rust::xxh64::xxh64;

const GUID_LEN: usize = 20;

/// A 160-bit content hash with dense equality and a total order.
///
/// Identities across the cluster (machines, clients, pages, computation
/// definitions) are all guids; two guids are equal exactly when their inputs
/// were.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Guid([u8; GUID_LEN]);

impl Guid {
    pub const LEN: usize = GUID_LEN;

    /// Hashes arbitrary bytes into a guid using seeded xxh64 lanes.
    pub fn of_bytes(data: &[u8]) -> Self {
        let mut out = [0u8; Self::LEN];
        for lane in 0..3 {
            let word = xxh64(data, lane as u64).to_le_bytes();
            let start = lane * 8;
            let stop = (start + 8).min(Self::LEN);
            out[start..stop].copy_from_slice(&word[..stop - start]);
        }
        Guid(out)
    }

    /// Deterministic guid for a single integer. Test and bootstrap helper.
    pub fn of_u64(value: u64) -> Self {
        Self::of_bytes(&value.to_le_bytes())
    }

    /// Deterministic guid for a pair of integers.
    pub fn of_u64_pair(a: u64, b: u64) -> Self {
        let mut buf = [0u8; 16];
        buf[..8].copy_from_slice(&a.to_le_bytes());
        buf[8..].copy_from_slice(&b.to_le_bytes());
        Self::of_bytes(&buf)
    }

    /// A fresh random guid.
    pub fn random() -> Self {
        let mut bytes = [0u8; Self::LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Guid(bytes)
    }

    /// Combines two guids into a new one.
    pub fn combined_with(&self, other: &Guid) -> Self {
        let mut buf = [0u8; Self::LEN * 2];
        buf[..Self::LEN].copy_from_slice(&self.0);
        buf[Self::LEN..].copy_from_slice(&other.0);
        Self::of_bytes(&buf)
    }

    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({})", hex::encode(&self.0[..6]))
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

macro_rules! guid_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize,
        )]
        pub struct $name(pub Guid);

        impl $name {
            pub fn for_testing(value: u64) -> Self {
                $name(Guid::of_u64(value))
            }

            pub fn random() -> Self {
                $name(Guid::random())
            }

            pub fn guid(&self) -> Guid {
                self.0
            }
        }
    };
}

guid_newtype!(
    /// Identity of a worker machine in the cluster.
    MachineId
);
guid_newtype!(
    /// Identity of an external client submitting root computations.
    ClientId
);
guid_newtype!(
    /// Identity of an outstanding external I/O task.
    ExternalIoTaskId
);

/// Position of a split computation below its root: the path of subdivision
/// indices taken from the root. Depth is the path length.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct SplitTreeAddress {
    pub path: SmallVec<[u32; 8]>,
}

impl SplitTreeAddress {
    pub fn root_child(index: u32) -> Self {
        SplitTreeAddress {
            path: SmallVec::from_slice(&[index]),
        }
    }

    pub fn child(&self, index: u32) -> Self {
        let mut path = self.path.clone();
        path.push(index);
        SplitTreeAddress { path }
    }

    pub fn depth(&self) -> u64 {
        self.path.len() as u64
    }
}

/// Identity of a root computation: the hash of its definition plus a salt
/// distinguishing resubmissions of the same definition.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct RootComputationId {
    pub definition: Guid,
    pub salt: u64,
}

/// A computation the scheduler tracks: either a client-visible root or a
/// scheduler-internal split of one.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum ComputationId {
    Root(RootComputationId),
    Split(RootComputationId, SplitTreeAddress),
}

impl ComputationId {
    pub fn root(definition: Guid, salt: u64) -> Self {
        ComputationId::Root(RootComputationId { definition, salt })
    }

    /// Deterministic root id for tests.
    pub fn for_testing(value: u64) -> Self {
        Self::root(Guid::of_u64(value), 0)
    }

    pub fn is_root(&self) -> bool {
        matches!(self, ComputationId::Root(_))
    }

    pub fn is_split(&self) -> bool {
        matches!(self, ComputationId::Split(..))
    }

    /// The root this computation belongs to. Identity for roots.
    pub fn root_computation(&self) -> ComputationId {
        match self {
            ComputationId::Root(root) => ComputationId::Root(*root),
            ComputationId::Split(root, _) => ComputationId::Root(*root),
        }
    }

    /// A split child of this computation's root.
    pub fn split_child(&self, index: u32) -> ComputationId {
        match self {
            ComputationId::Root(root) => {
                ComputationId::Split(*root, SplitTreeAddress::root_child(index))
            }
            ComputationId::Split(root, address) => {
                ComputationId::Split(*root, address.child(index))
            }
        }
    }

    /// Number of scheduler-introduced subdivisions between the root and this
    /// computation. Zero for roots.
    pub fn tree_depth(&self) -> u64 {
        match self {
            ComputationId::Root(_) => 0,
            ComputationId::Split(_, address) => address.depth(),
        }
    }
}
