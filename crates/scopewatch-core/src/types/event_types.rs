//! File event types: flag bitsets, raw events and coalesced batches

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Deref};
use std::path::PathBuf;

/// Declares a `u32` bitset newtype with named constants.
///
/// `contains` treats the argument as a nonzero subset: `NONE` is never contained.
macro_rules! flag_set {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $( $(#[$fmeta:meta])* const $flag:ident = $value:expr; )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u32);

        impl $name {
            $( $(#[$fmeta])* pub const $flag: Self = Self($value); )*

            const NAMED: &'static [(&'static str, u32)] = &[$( (stringify!($flag), $value) ),*];

            pub const fn from_bits(bits: u32) -> Self {
                Self(bits)
            }

            pub const fn bits(self) -> u32 {
                self.0
            }

            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }

            /// True when every bit of `other` is set and `other` is not empty
            pub const fn contains(self, other: Self) -> bool {
                other.0 != 0 && self.0 & other.0 == other.0
            }

            pub const fn intersects(self, other: Self) -> bool {
                self.0 & other.0 != 0
            }

            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }

            /// Names of the set flags, in declaration order
            pub fn names(self) -> Vec<&'static str> {
                Self::NAMED
                    .iter()
                    .filter(|(_, bits)| *bits != 0 && self.0 & bits == *bits)
                    .map(|(name, _)| *name)
                    .collect()
            }
        }

        impl BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }

        impl BitAnd for $name {
            type Output = Self;

            fn bitand(self, rhs: Self) -> Self {
                Self(self.0 & rhs.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}[{}]", stringify!($name), self.names().join(", "))
            }
        }
    };
}

flag_set! {
    /// Per-event flags reported by the change-notification service
    pub struct EventFlags {
        /// Something changed in the directory at the event path
        const NONE = 0x0000_0000;
        /// Path detail is unreliable; the subtree must be re-enumerated
        const MUST_SCAN_SUB_DIRS = 0x0000_0001;
        /// Events were dropped in the client; companion of `MUST_SCAN_SUB_DIRS`
        const USER_DROPPED = 0x0000_0002;
        /// Events were dropped in the kernel; companion of `MUST_SCAN_SUB_DIRS`
        const KERNEL_DROPPED = 0x0000_0004;
        /// The event id counter wrapped; stored resume ids are invalid
        const EVENT_IDS_WRAPPED = 0x0000_0008;
        /// Sentinel marking the end of historical events; ignore its path
        const HISTORY_DONE = 0x0000_0010;
        /// A watched root itself moved or was removed; the event id is zero
        const ROOT_CHANGED = 0x0000_0020;
        const MOUNT = 0x0000_0040;
        const UNMOUNT = 0x0000_0080;
        const ITEM_CREATED = 0x0000_0100;
        const ITEM_REMOVED = 0x0000_0200;
        const ITEM_INODE_META_MOD = 0x0000_0400;
        const ITEM_RENAMED = 0x0000_0800;
        const ITEM_MODIFIED = 0x0000_1000;
        const ITEM_FINDER_INFO_MOD = 0x0000_2000;
        const ITEM_CHANGE_OWNER = 0x0000_4000;
        const ITEM_XATTR_MOD = 0x0000_8000;
        const ITEM_IS_FILE = 0x0001_0000;
        const ITEM_IS_DIR = 0x0002_0000;
        const ITEM_IS_SYMLINK = 0x0004_0000;
        const OWN_EVENT = 0x0008_0000;
        const ITEM_IS_HARDLINK = 0x0010_0000;
        const ITEM_IS_LAST_HARDLINK = 0x0020_0000;
        const ITEM_CLONED = 0x0040_0000;
    }
}

impl EventFlags {
    /// The consumer must recursively re-enumerate the event's subtree
    pub fn requires_rescan(self) -> bool {
        self.contains(Self::MUST_SCAN_SUB_DIRS)
    }

    pub fn ids_wrapped(self) -> bool {
        self.contains(Self::EVENT_IDS_WRAPPED)
    }

    pub fn root_changed(self) -> bool {
        self.contains(Self::ROOT_CHANGED)
    }
}

flag_set! {
    /// Flags applied when the event stream is created
    pub struct CreateFlags {
        const NONE = 0x0000_0000;
        /// Deliver the first event after a quiet period immediately
        const NO_DEFER = 0x0000_0002;
        /// Report changes along the path to each watched root
        const WATCH_ROOT = 0x0000_0004;
        const IGNORE_SELF = 0x0000_0008;
        /// Report individual files instead of directories
        const FILE_EVENTS = 0x0000_0010;
        const MARK_SELF = 0x0000_0020;
        const USE_EXTENDED_DATA = 0x0000_0040;
    }
}

/// A single change reported by the native service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub path: PathBuf,
    pub flags: EventFlags,
    pub id: u64,
}

impl RawEvent {
    pub fn new(path: impl Into<PathBuf>, flags: EventFlags, id: u64) -> Self {
        Self {
            path: path.into(),
            flags,
            id,
        }
    }
}

/// Events delivered together by one native callback, in delivery order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CoalescedBatch(Vec<RawEvent>);

impl CoalescedBatch {
    pub fn events(&self) -> &[RawEvent] {
        &self.0
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.0.iter().map(|e| e.path.clone()).collect()
    }

    pub fn into_events(self) -> Vec<RawEvent> {
        self.0
    }

    /// Union of every event's flags
    pub fn combined_flags(&self) -> EventFlags {
        self.0
            .iter()
            .fold(EventFlags::NONE, |acc, event| acc | event.flags)
    }
}

impl From<Vec<RawEvent>> for CoalescedBatch {
    fn from(events: Vec<RawEvent>) -> Self {
        Self(events)
    }
}

impl Deref for CoalescedBatch {
    type Target = [RawEvent];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
