//! Helpers shared by the build phases: content and key hashing, plus the fake
//! build step used by scheduler tests.

pub mod hash;

#[cfg(test)]
pub mod testutil;
