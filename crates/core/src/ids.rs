use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl $name {
            /// Position of this id in a fixed-size slot array.
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl From<u32> for $name {
            fn from(raw: u32) -> Self {
                Self(raw)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}[{}]", $label, self.0)
            }
        }
    };
}

id_type!(
    /// A loaded compute graph. Bounded by `max_model_count`.
    ModelId,
    "model"
);
id_type!(
    /// An ordered sequence of task steps belonging to one model.
    StreamId,
    "stream"
);
id_type!(TaskId, "task");
id_type!(
    /// A shared lookup table guarded by the table lock registry.
    TableId,
    "table"
);
impl TableId {
    /// Sentinel a descriptor carries when no table was configured.
    pub const INVALID: TableId = TableId(u32::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

id_type!(QueueId, "queue");
id_type!(NotifyId, "notify");

/// Opaque accelerator-memory buffer handle handed out by the driver.
///
/// The value is never interpreted, only tracked. `0` is the null handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BufferHandle(pub u64);

impl BufferHandle {
    pub const NULL: BufferHandle = BufferHandle(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "buf[{:#x}]", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_display_with_label() {
        assert_eq!(ModelId(3).to_string(), "model[3]");
        assert_eq!(StreamId(12).to_string(), "stream[12]");
        assert_eq!(BufferHandle(255).to_string(), "buf[0xff]");
    }

    #[test]
    fn null_handle() {
        assert!(BufferHandle::NULL.is_null());
        assert!(!BufferHandle(7).is_null());
    }

    #[test]
    fn id_index_matches_raw_value() {
        assert_eq!(QueueId::from(42).index(), 42);
    }
}
