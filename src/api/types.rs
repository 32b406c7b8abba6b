//! Opaque identifier types.

use std::fmt;

macro_rules! key_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(String);

        impl $name {
            /// Create a new key from anything string-like.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// The key as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

key_type!(
    /// Unique identifier of a graph node.
    NodeKey
);

key_type!(
    /// Identifier of an ordered capture sequence.
    SequenceKey
);

key_type!(
    /// Identifier of a geographic tile bucket.
    ///
    /// Tile identifiers are minted by the tile collaborator; the graph
    /// treats them as opaque and only uses them for membership
    /// bookkeeping.
    TileId
);
