use std::sync::OnceLock;

pub fn get_self_pid() -> u32 {
    static PID: OnceLock<u32> = OnceLock::new();
    *PID.get_or_init(std::process::id)
}

/// Snowflake node bits derived from the pid, so two masters on one host
/// still mint disjoint ids.
pub fn snowflake_node() -> u64 {
    u64::from(get_self_pid()) & 0x3ff
}
