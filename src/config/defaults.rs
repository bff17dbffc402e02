// Serde default helpers for the top-level settings.

pub fn default_port() -> u16 {
    8080
}

/// Accept backlog for the listener socket.
pub fn default_backlog() -> u32 {
    1024
}

pub fn default_cache_port() -> u16 {
    6379
}

/// Default probe interval in seconds.
pub fn default_inner_interval() -> u64 {
    30
}

/// Default per-probe timeout in seconds.
pub fn default_inner_timeout() -> u64 {
    5
}
