use redis::Script;
use std::sync::LazyLock;

pub const TRANSACT_SCRIPT_BODY: &str = include_str!("../../lua/transact.lua");

pub static TRANSACT_SCRIPT: LazyLock<Script> = LazyLock::new(|| Script::new(TRANSACT_SCRIPT_BODY));
