// SPDX-License-Identifier: MPL-2.0

use core::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Errno, Error};

macro_rules! define_uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generates a fresh random id.
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            /// The all-zero id, used to mean "unassigned".
            pub const fn nil() -> Self {
                Self(Uuid::nil())
            }

            /// Returns `true` if this is the all-zero id.
            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::nil()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.hyphenated())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Error> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|_| Error::with_msg(Errno::InvalidArgs, "malformed uuid"))
            }
        }
    };
}

define_uuid_id!(
    /// Unique identifier of a cluster node.
    NodeId
);
define_uuid_id!(
    /// Unique identifier of an XSAN disk.
    DiskId
);
define_uuid_id!(
    /// Unique identifier of a disk group.
    GroupId
);
define_uuid_id!(
    /// Unique identifier of a logical volume.
    VolumeId
);
