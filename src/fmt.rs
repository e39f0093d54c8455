//! This file ensures that defmt is optional, providing stubs if it's not available
#![allow(unused_macros)]

#[cfg(feature = "defmt")]
pub use defmt::{bitflags, debug, error, info, warn};

#[cfg(not(feature = "defmt"))]
pub use bitflags::bitflags;

#[cfg(not(feature = "defmt"))]
macro_rules! info {
    ($($item:expr),* $(,)?) => {{
        $( let _ = &$item; )*
    }};
}

#[cfg(not(feature = "defmt"))]
pub(crate) use info;

#[cfg(not(feature = "defmt"))]
macro_rules! debug {
    ($($item:expr),* $(,)?) => {{
        $( let _ = &$item; )*
    }};
}

#[cfg(not(feature = "defmt"))]
pub(crate) use debug;

#[cfg(not(feature = "defmt"))]
macro_rules! warn_ {
    ($($item:expr),* $(,)?) => {{
        $( let _ = &$item; )*
    }};
}

#[cfg(not(feature = "defmt"))]
pub(crate) use warn_ as warn;

#[cfg(not(feature = "defmt"))]
macro_rules! error {
    ($($item:expr),* $(,)?) => {{
        $( let _ = &$item; )*
    }};
}

#[cfg(not(feature = "defmt"))]
pub(crate) use error;
