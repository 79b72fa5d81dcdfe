//! Device, buffer and request identifiers

use core::fmt;

/// Block device number: major in the high byte, minor in the low byte.
///
/// The major number selects the driver; the minor number selects a unit or
/// partition inside it. `DeviceId::NONE` (0) marks a buffer with no identity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct DeviceId(u16);

impl DeviceId {
    /// No device (unbound buffer)
    pub const NONE: DeviceId = DeviceId(0);

    /// Build a device number from major and minor parts
    #[inline]
    pub const fn new(major: u8, minor: u8) -> Self {
        DeviceId(((major as u16) << 8) | minor as u16)
    }

    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn major(self) -> u8 {
        (self.0 >> 8) as u8
    }

    #[inline]
    pub const fn minor(self) -> u8 {
        self.0 as u8
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl From<u16> for DeviceId {
    #[inline]
    fn from(raw: u16) -> Self {
        DeviceId(raw)
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "DeviceId(NONE)")
        } else {
            write!(f, "DeviceId({}:{})", self.major(), self.minor())
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

/// Index-based identifiers into fixed tables.
///
/// `u32::MAX` is the "no entry" sentinel, which lets the intrusive lists
/// store links as plain integers.
macro_rules! slot_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(u32);

        impl $name {
            /// Sentinel value meaning "no slot"
            pub const NONE: $name = $name(u32::MAX);

            #[inline]
            pub const fn new(index: u32) -> Self {
                $name(index)
            }

            #[inline]
            pub const fn as_u32(self) -> u32 {
                self.0
            }

            /// Get as usize for indexing
            #[inline]
            pub const fn index(self) -> usize {
                self.0 as usize
            }

            #[inline]
            pub const fn is_none(self) -> bool {
                self.0 == u32::MAX
            }

            #[inline]
            pub const fn is_some(self) -> bool {
                self.0 != u32::MAX
            }

            /// Convert to Option
            #[inline]
            pub const fn to_option(self) -> Option<$name> {
                if self.is_none() {
                    None
                } else {
                    Some(self)
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                $name::NONE
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_none() {
                    write!(f, concat!(stringify!($name), "(NONE)"))
                } else {
                    write!(f, concat!(stringify!($name), "({})"), self.0)
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_none() {
                    write!(f, "none")
                } else {
                    write!(f, "{}", self.0)
                }
            }
        }
    };
}

slot_id! {
    /// Index of a buffer descriptor in the cache's pool
    BufferId
}

slot_id! {
    /// Index of a slot in the request table
    RequestId
}
