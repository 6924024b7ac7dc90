// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

// Defines a transparent newtype over an integer with named constants, so that
// values outside the known set survive decoding and can be logged.
macro_rules! wire_enum {
    (
        $(#[$a:meta])*
        pub struct $name:ident($ty:ty) {
            $(
                $(#[$va:meta])*
                $variant:ident = $value:expr,
            )*
        }
    ) => {
        $(#[$a])*
        #[repr(transparent)]
        #[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub $ty);

        impl $name {
            $(
                $(#[$va])*
                pub const $variant: Self = Self($value);
            )*
        }

        impl From<$ty> for $name {
            fn from(value: $ty) -> Self {
                Self(value)
            }
        }

        impl From<$name> for $ty {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match *self {
                    $(Self::$variant => f.write_str(stringify!($variant)),)*
                    Self(v) => write!(f, "{}({:#x})", stringify!($name), v),
                }
            }
        }
    };
}
