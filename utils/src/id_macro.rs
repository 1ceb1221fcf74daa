pub extern crate derive_more;
pub extern crate flaken;

/// Declares a `u64` newtype id backed by a process-wide snowflake generator.
///
/// Ids minted by one process are strictly increasing, so ordering by id is
/// ordering by creation.
#[macro_export]
macro_rules! id_new_type {
    ($type_name:ident) => {
        #[derive(
            Debug,
            ::serde::Serialize,
            ::serde::Deserialize,
            PartialEq,
            PartialOrd,
            Ord,
            Eq,
            Hash,
            Clone,
            Copy,
            $crate::id_macro::derive_more::From,
            $crate::id_macro::derive_more::Display,
            $crate::id_macro::derive_more::FromStr,
        )]
        pub struct $type_name(u64);

        impl $type_name {
            pub fn next_id() -> Self {
                use std::sync::{Mutex, OnceLock};
                use $crate::id_macro::flaken::Flaken;

                static GENERATOR: OnceLock<Mutex<Flaken>> = OnceLock::new();
                let generator = GENERATOR.get_or_init(|| {
                    let node = $crate::process::snowflake_node();
                    Mutex::new(Flaken::default().node(node))
                });
                let mut lock = generator.lock().unwrap_or_else(|e| e.into_inner());
                Self(lock.next())
            }

            pub fn as_u64(&self) -> u64 {
                self.0
            }
        }
    };
}
