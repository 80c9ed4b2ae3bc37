//! CLI subcommands.

#[expect(
    unreachable_pub,
    reason = "binary crate: pub inside a private module is fine"
)]
pub mod validate;
#[expect(
    unreachable_pub,
    reason = "binary crate: pub inside a private module is fine"
)]
pub mod verify;
