//! Shared flag-set macro, used instead of pulling in the `bitflags` crate
//! for the handful of named bit sets this crate needs (value cells,
//! operations, basic blocks, function flags): each expands to a single
//! tuple-struct newtype over an integer with named bit constants and
//! `contains`/`insert`/`remove` helpers.

#[macro_export]
macro_rules! bitflags_like {
    (
        $(#[$meta:meta])*
        pub struct $name:ident : $ty:ty {
            $(const $flag:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
        pub struct $name($ty);
        impl $name {
            $(pub const $flag: $name = $name($value);)*
            pub const fn empty() -> Self { Self(0) }
            pub const fn contains(&self, other: Self) -> bool { self.0 & other.0 == other.0 }
            pub fn insert(&mut self, other: Self) { self.0 |= other.0; }
            pub fn remove(&mut self, other: Self) { self.0 &= !other.0; }
            pub const fn bits(&self) -> $ty { self.0 }
        }
        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self { Self(self.0 | rhs.0) }
        }
    };
}
