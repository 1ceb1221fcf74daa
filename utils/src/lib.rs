#[cfg(feature = "id")]
pub mod id_macro;

pub mod process;

#[cfg(feature = "codec")]
pub mod macros;

#[cfg(feature = "logger")]
pub mod logger;
