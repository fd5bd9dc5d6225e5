//! Forge adapters: one implementation per `ForgeKind`, sharing the
//! `cinch_core::forge::Forge` contract (`spec.md` §9 Design Notes).

mod github;

pub use github::GithubForge;
